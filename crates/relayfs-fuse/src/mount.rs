//! Mount options and mountpoint checks.

use std::path::Path;
use thiserror::Error;

/// Options passed to the kernel at mount time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountOptions {
    /// Allow other users to access.
    pub allow_other: bool,
    /// Allow root to access.
    pub allow_root: bool,
    /// Let the kernel enforce permission bits.
    pub default_permissions: bool,
    /// Unmount when the process exits.
    pub auto_unmount: bool,
    /// Read-only mount.
    pub ro: bool,
    pub noexec: bool,
    pub nosuid: bool,
    pub nodev: bool,
    pub noatime: bool,
}

impl Default for MountOptions {
    fn default() -> Self {
        MountOptions {
            allow_other: false,
            allow_root: false,
            default_permissions: false,
            auto_unmount: false,
            ro: false,
            noexec: false,
            nosuid: true,
            nodev: true,
            noatime: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum MountError {
    /// Path does not exist.
    #[error("Path not found: {0}")]
    PathNotFound(String),

    /// Path is not a directory.
    #[error("Not a directory: {0}")]
    NotADirectory(String),

    /// Unknown or conflicting option.
    #[error("Invalid option: {0}")]
    InvalidOption(String),
}

pub fn validate_mountpoint(path: &Path) -> Result<(), MountError> {
    if !path.exists() {
        return Err(MountError::PathNotFound(path.display().to_string()));
    }

    if !path.is_dir() {
        return Err(MountError::NotADirectory(path.display().to_string()));
    }

    Ok(())
}

/// Parse mount options from a comma-separated string such as
/// `allow_other,ro,noatime`.
pub fn parse_mount_options(opts_str: &str) -> Result<MountOptions, MountError> {
    let mut options = MountOptions::default();

    for opt in opts_str.split(',') {
        match opt.trim() {
            "allow_other" => options.allow_other = true,
            "allow_root" => options.allow_root = true,
            "default_permissions" => options.default_permissions = true,
            "auto_unmount" => options.auto_unmount = true,
            "ro" => options.ro = true,
            "rw" => options.ro = false,
            "noexec" => options.noexec = true,
            "exec" => options.noexec = false,
            "nosuid" => options.nosuid = true,
            "suid" => options.nosuid = false,
            "nodev" => options.nodev = true,
            "dev" => options.nodev = false,
            "noatime" => options.noatime = true,
            "atime" => options.noatime = false,
            "" => {}
            other => return Err(MountError::InvalidOption(other.to_string())),
        }
    }

    if options.allow_other && options.allow_root {
        return Err(MountError::InvalidOption(
            "allow_other and allow_root are mutually exclusive".into(),
        ));
    }

    Ok(options)
}

/// Convert to the fuser option list, naming the filesystem `fsname`.
pub fn options_to_fuser(opts: &MountOptions, fsname: &str) -> Vec<fuser::MountOption> {
    use fuser::MountOption;

    let mut out = vec![
        MountOption::FSName(fsname.to_string()),
        MountOption::Subtype("relayfs".to_string()),
    ];

    if opts.allow_other {
        out.push(MountOption::AllowOther);
    }
    if opts.allow_root {
        out.push(MountOption::AllowRoot);
    }
    if opts.default_permissions {
        out.push(MountOption::DefaultPermissions);
    }
    if opts.auto_unmount {
        out.push(MountOption::AutoUnmount);
    }
    out.push(if opts.ro { MountOption::RO } else { MountOption::RW });
    if opts.noexec {
        out.push(MountOption::NoExec);
    }
    if opts.nosuid {
        out.push(MountOption::NoSuid);
    }
    if opts.nodev {
        out.push(MountOption::NoDev);
    }
    if opts.noatime {
        out.push(MountOption::NoAtime);
    }

    out
}
