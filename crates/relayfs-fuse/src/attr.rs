//! Canonical file attribute record.
//!
//! Every attribute-bearing reply crosses the bridge as a [`CanonicalAttr`]
//! and is converted to the kernel shape only when the reply is delivered.
//! Timestamps are whole seconds; sub-second precision is dropped on the way
//! in and zero on the way out.

use crate::error::{BridgeError, Result};
use crate::wire::WireAttr;
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const S_IFMT: u32 = 0o170000;
pub const S_IFSOCK: u32 = 0o140000;
pub const S_IFLNK: u32 = 0o120000;
pub const S_IFREG: u32 = 0o100000;
pub const S_IFBLK: u32 = 0o060000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFCHR: u32 = 0o020000;
pub const S_IFIFO: u32 = 0o010000;

/// Number of positional fields in an attribute array.
pub const ATTR_FIELD_COUNT: usize = 13;

/// Platform-neutral stat record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CanonicalAttr {
    pub mode: u32,
    pub ino: u64,
    pub dev: u64,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u32,
    pub size: u64,
    pub blksize: u32,
    pub blocks: u64,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
    /// Birth time, only meaningful on macOS.
    #[serde(default)]
    pub crtime: i64,
    /// chflags(2) flags, only meaningful on macOS.
    #[serde(default)]
    pub flags: u32,
}

impl CanonicalAttr {
    /// The file type encoded in the `S_IFMT` bits of `mode`, if valid.
    pub fn file_type(&self) -> Option<fuser::FileType> {
        file_type_from_mode(self.mode)
    }

    /// The `d_type` value used in directory entries.
    pub fn dirent_type(&self) -> u32 {
        (self.mode & S_IFMT) >> 12
    }

    /// Captures the attributes of a real file.
    #[cfg(unix)]
    pub fn from_metadata(md: &std::fs::Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;

        CanonicalAttr {
            mode: md.mode(),
            ino: md.ino(),
            dev: md.dev(),
            nlink: saturate_u32(md.nlink()),
            uid: md.uid(),
            gid: md.gid(),
            rdev: saturate_u32(md.rdev()),
            size: md.size(),
            blksize: saturate_u32(md.blksize()),
            blocks: md.blocks(),
            atime: md.atime(),
            mtime: md.mtime(),
            ctime: md.ctime(),
            crtime: md.created().map(system_time_to_secs).unwrap_or(0),
            flags: 0,
        }
    }
}

fn saturate_u32(v: u64) -> u32 {
    u32::try_from(v).unwrap_or(u32::MAX)
}

pub fn file_type_from_mode(mode: u32) -> Option<fuser::FileType> {
    use fuser::FileType;
    match mode & S_IFMT {
        S_IFREG => Some(FileType::RegularFile),
        S_IFDIR => Some(FileType::Directory),
        S_IFLNK => Some(FileType::Symlink),
        S_IFBLK => Some(FileType::BlockDevice),
        S_IFCHR => Some(FileType::CharDevice),
        S_IFIFO => Some(FileType::NamedPipe),
        S_IFSOCK => Some(FileType::Socket),
        _ => None,
    }
}

pub fn mode_type_bits(kind: fuser::FileType) -> u32 {
    use fuser::FileType;
    match kind {
        FileType::RegularFile => S_IFREG,
        FileType::Directory => S_IFDIR,
        FileType::Symlink => S_IFLNK,
        FileType::BlockDevice => S_IFBLK,
        FileType::CharDevice => S_IFCHR,
        FileType::NamedPipe => S_IFIFO,
        FileType::Socket => S_IFSOCK,
    }
}

/// Converts whole seconds since the epoch, negative included.
pub fn secs_to_system_time(secs: i64) -> Result<SystemTime> {
    let offset = Duration::from_secs(secs.unsigned_abs());
    let t = if secs >= 0 {
        UNIX_EPOCH.checked_add(offset)
    } else {
        UNIX_EPOCH.checked_sub(offset)
    };
    t.ok_or(BridgeError::AttrOutOfRange { field: "timestamp" })
}

/// Floors `t` to whole seconds since the epoch.
pub fn system_time_to_secs(t: SystemTime) -> i64 {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => i64::try_from(d.as_secs()).unwrap_or(i64::MAX),
        Err(e) => {
            let before = e.duration();
            let mut secs = i64::try_from(before.as_secs()).unwrap_or(i64::MAX);
            if before.subsec_nanos() > 0 {
                secs = secs.saturating_add(1);
            }
            -secs
        }
    }
}

/// A platform attribute shape that can be produced from and folded back
/// into a [`CanonicalAttr`].
pub trait PlatformAttr: Sized {
    fn from_canonical(attr: &CanonicalAttr) -> Result<Self>;
    fn to_canonical(&self) -> CanonicalAttr;
}

impl PlatformAttr for fuser::FileAttr {
    fn from_canonical(attr: &CanonicalAttr) -> Result<Self> {
        let kind = attr
            .file_type()
            .ok_or(BridgeError::AttrOutOfRange { field: "mode" })?;
        Ok(fuser::FileAttr {
            ino: attr.ino,
            size: attr.size,
            blocks: attr.blocks,
            atime: secs_to_system_time(attr.atime)?,
            mtime: secs_to_system_time(attr.mtime)?,
            ctime: secs_to_system_time(attr.ctime)?,
            crtime: secs_to_system_time(attr.crtime)?,
            kind,
            perm: (attr.mode & 0o7777) as u16,
            nlink: attr.nlink,
            uid: attr.uid,
            gid: attr.gid,
            rdev: attr.rdev,
            blksize: attr.blksize,
            flags: attr.flags,
        })
    }

    fn to_canonical(&self) -> CanonicalAttr {
        CanonicalAttr {
            mode: mode_type_bits(self.kind) | u32::from(self.perm),
            ino: self.ino,
            dev: 0,
            nlink: self.nlink,
            uid: self.uid,
            gid: self.gid,
            rdev: self.rdev,
            size: self.size,
            blksize: self.blksize,
            blocks: self.blocks,
            atime: system_time_to_secs(self.atime),
            mtime: system_time_to_secs(self.mtime),
            ctime: system_time_to_secs(self.ctime),
            crtime: system_time_to_secs(self.crtime),
            flags: self.flags,
        }
    }
}

impl PlatformAttr for WireAttr {
    fn from_canonical(attr: &CanonicalAttr) -> Result<Self> {
        if attr.file_type().is_none() {
            return Err(BridgeError::AttrOutOfRange { field: "mode" });
        }
        Ok(WireAttr {
            ino: attr.ino,
            size: attr.size,
            blocks: attr.blocks,
            atime: attr.atime,
            mtime: attr.mtime,
            ctime: attr.ctime,
            crtime: attr.crtime,
            mode: attr.mode,
            nlink: attr.nlink,
            uid: attr.uid,
            gid: attr.gid,
            rdev: attr.rdev,
            flags: attr.flags,
            blksize: attr.blksize,
            ..WireAttr::default()
        })
    }

    fn to_canonical(&self) -> CanonicalAttr {
        CanonicalAttr {
            mode: self.mode,
            ino: self.ino,
            dev: 0,
            nlink: self.nlink,
            uid: self.uid,
            gid: self.gid,
            rdev: self.rdev,
            size: self.size,
            blksize: self.blksize,
            blocks: self.blocks,
            atime: self.atime,
            mtime: self.mtime,
            ctime: self.ctime,
            crtime: self.crtime,
            flags: self.flags,
        }
    }
}

fn field<T: TryFrom<i64>>(v: i64, name: &'static str) -> Result<T> {
    T::try_from(v).map_err(|_| BridgeError::AttrOutOfRange { field: name })
}

/// Positional attribute array: mode, ino, dev, nlink, uid, gid, rdev, size,
/// blksize, blocks, atime, mtime, ctime, then optionally crtime and flags.
impl TryFrom<&[i64]> for CanonicalAttr {
    type Error = BridgeError;

    fn try_from(v: &[i64]) -> Result<Self> {
        if v.len() < ATTR_FIELD_COUNT {
            return Err(BridgeError::malformed(
                "attr",
                format!("expected {} fields, got {}", ATTR_FIELD_COUNT, v.len()),
            ));
        }
        Ok(CanonicalAttr {
            mode: field(v[0], "mode")?,
            ino: field(v[1], "ino")?,
            dev: field(v[2], "dev")?,
            nlink: field(v[3], "nlink")?,
            uid: field(v[4], "uid")?,
            gid: field(v[5], "gid")?,
            rdev: field(v[6], "rdev")?,
            size: field(v[7], "size")?,
            blksize: field(v[8], "blksize")?,
            blocks: field(v[9], "blocks")?,
            atime: v[10],
            mtime: v[11],
            ctime: v[12],
            crtime: v.get(13).copied().unwrap_or(0),
            flags: match v.get(14) {
                Some(&f) => field(f, "flags")?,
                None => 0,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> CanonicalAttr {
        CanonicalAttr {
            mode: S_IFREG | 0o644,
            ino: 5,
            dev: 0,
            nlink: 1,
            uid: 1000,
            gid: 1000,
            rdev: 0,
            size: 2048,
            blksize: 4096,
            blocks: 4,
            atime: 1_700_000_000,
            mtime: 1_700_000_001,
            ctime: 1_700_000_002,
            crtime: 0,
            flags: 0,
        }
    }

    #[test]
    fn test_fuser_attr_from_canonical_sets_kind_and_perm() {
        let attr = fuser::FileAttr::from_canonical(&sample()).unwrap();
        assert_eq!(attr.kind, fuser::FileType::RegularFile);
        assert_eq!(attr.perm, 0o644);
        assert_eq!(attr.size, 2048);
        assert_eq!(attr.ino, 5);
    }

    #[test]
    fn test_fuser_attr_round_trip() {
        let canonical = sample();
        let attr = fuser::FileAttr::from_canonical(&canonical).unwrap();
        assert_eq!(attr.to_canonical(), canonical);
    }

    #[test]
    fn test_setuid_bits_survive_round_trip() {
        let canonical = CanonicalAttr {
            mode: S_IFDIR | 0o1777,
            ..sample()
        };
        let attr = fuser::FileAttr::from_canonical(&canonical).unwrap();
        assert_eq!(attr.perm, 0o1777);
        assert_eq!(attr.to_canonical().mode, S_IFDIR | 0o1777);
    }

    #[test]
    fn test_negative_timestamp_round_trip() {
        let canonical = CanonicalAttr {
            atime: -1,
            mtime: -86_400,
            ctime: 0,
            ..sample()
        };
        let attr = fuser::FileAttr::from_canonical(&canonical).unwrap();
        assert_eq!(attr.to_canonical(), canonical);
    }

    #[test]
    fn test_missing_type_bits_are_rejected() {
        let canonical = CanonicalAttr {
            mode: 0o644,
            ..sample()
        };
        let err = fuser::FileAttr::from_canonical(&canonical).unwrap_err();
        assert!(matches!(err, BridgeError::AttrOutOfRange { field: "mode" }));
        assert!(WireAttr::from_canonical(&canonical).is_err());
    }

    #[test]
    fn test_system_time_floors_to_seconds() {
        let t = UNIX_EPOCH + Duration::from_millis(1_500);
        assert_eq!(system_time_to_secs(t), 1);
        let t = UNIX_EPOCH - Duration::from_millis(1_500);
        assert_eq!(system_time_to_secs(t), -2);
    }

    #[test]
    fn test_dirent_type_from_mode() {
        let dir = CanonicalAttr {
            mode: S_IFDIR | 0o755,
            ..sample()
        };
        assert_eq!(dir.dirent_type(), 4);
        assert_eq!(sample().dirent_type(), 8);
    }

    #[test]
    fn test_wire_attr_round_trip_keeps_all_but_dev() {
        let canonical = CanonicalAttr {
            dev: 77,
            crtime: 12,
            flags: 3,
            ..sample()
        };
        let wire = WireAttr::from_canonical(&canonical).unwrap();
        let back = wire.to_canonical();
        assert_eq!(back.dev, 0);
        assert_eq!(CanonicalAttr { dev: 77, ..back }, canonical);
    }

    #[test]
    fn test_attr_from_field_array() {
        let fields: Vec<i64> = vec![
            0o100644, 5, 0, 1, 1000, 1000, 0, 2048, 4096, 4, 10, 20, 30,
        ];
        let attr = CanonicalAttr::try_from(fields.as_slice()).unwrap();
        assert_eq!(attr.mode, 0o100644);
        assert_eq!(attr.size, 2048);
        assert_eq!(attr.ctime, 30);
        assert_eq!(attr.crtime, 0);
    }

    #[test]
    fn test_attr_from_short_field_array_is_malformed() {
        let fields: Vec<i64> = vec![0o100644, 5, 0];
        let err = CanonicalAttr::try_from(fields.as_slice()).unwrap_err();
        assert!(matches!(err, BridgeError::MalformedReply { .. }));
    }

    #[test]
    fn test_attr_from_field_array_rejects_negative_size() {
        let fields: Vec<i64> = vec![0o100644, 5, 0, 1, 0, 0, 0, -1, 4096, 0, 0, 0, 0];
        let err = CanonicalAttr::try_from(fields.as_slice()).unwrap_err();
        assert!(matches!(err, BridgeError::AttrOutOfRange { field: "size" }));
    }

    #[test]
    fn test_from_metadata_reads_real_file() {
        let md = std::fs::metadata(std::env::temp_dir()).unwrap();
        let attr = CanonicalAttr::from_metadata(&md);
        assert_eq!(attr.file_type(), Some(fuser::FileType::Directory));
        assert!(attr.nlink >= 1);
    }

    #[test]
    fn test_serde_defaults_for_darwin_fields() {
        let json = r#"{"mode":33188,"ino":1,"dev":0,"nlink":1,"uid":0,"gid":0,
            "rdev":0,"size":0,"blksize":4096,"blocks":0,"atime":0,"mtime":0,"ctime":0}"#;
        let attr: CanonicalAttr = serde_json::from_str(json).unwrap();
        assert_eq!(attr.crtime, 0);
        assert_eq!(attr.flags, 0);
        assert_eq!(attr.mode, S_IFREG | 0o644);
    }
}
