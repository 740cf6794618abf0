//! Operation parameter records.
//!
//! Each kernel callback is captured as one [`OpParams`] variant that owns
//! all of its data, so the record stays valid after the callback returns and
//! can cross into the handler context or a serialization boundary.

use crate::attr::CanonicalAttr;
use crate::registry::RequestId;
use serde::{Deserialize, Serialize};
use std::ffi::OsStr;
use std::fmt;

/// Longest file name the kernel sends.
pub const NAME_MAX: usize = 255;
/// Longest symlink target.
pub const PATH_MAX: usize = 4096;
/// Largest extended attribute value.
pub const XATTR_SIZE_MAX: usize = 65536;
/// Largest ioctl input buffer.
pub const IOCTL_MAX: usize = 16384;
/// Largest write or retrieve payload.
pub const PAYLOAD_MAX: usize = 16 * 1024 * 1024;

/// Byte field holding at most `N` bytes.
///
/// Bytes are arbitrary (names may contain any byte but `/` and NUL, values
/// may contain anything). Copying from a longer source keeps the first `N`
/// bytes and sets [`Bounded::is_truncated`].
#[derive(Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "BoundedRepr", into = "BoundedRepr")]
pub struct Bounded<const N: usize> {
    bytes: Vec<u8>,
    truncated: bool,
}

/// Serialized form of [`Bounded`].
#[doc(hidden)]
#[derive(Serialize, Deserialize)]
pub struct BoundedRepr {
    #[serde(with = "serde_bytes")]
    bytes: Vec<u8>,
    #[serde(default)]
    truncated: bool,
}

impl<const N: usize> Bounded<N> {
    pub fn copy_from(src: &[u8]) -> Self {
        let take = src.len().min(N);
        Bounded {
            bytes: src[..take].to_vec(),
            truncated: src.len() > N,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_os_str(&self) -> &OsStr {
        use std::os::unix::ffi::OsStrExt;
        OsStr::from_bytes(&self.bytes)
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }
}

impl<const N: usize> TryFrom<BoundedRepr> for Bounded<N> {
    type Error = String;

    fn try_from(repr: BoundedRepr) -> std::result::Result<Self, Self::Error> {
        if repr.bytes.len() > N {
            return Err(format!(
                "field holds {} bytes, limit is {}",
                repr.bytes.len(),
                N
            ));
        }
        Ok(Bounded {
            bytes: repr.bytes,
            truncated: repr.truncated,
        })
    }
}

impl<const N: usize> From<Bounded<N>> for BoundedRepr {
    fn from(b: Bounded<N>) -> Self {
        BoundedRepr {
            bytes: b.bytes,
            truncated: b.truncated,
        }
    }
}

impl<const N: usize> fmt::Debug for Bounded<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.bytes.len() <= NAME_MAX {
            write!(f, "{:?}", String::from_utf8_lossy(&self.bytes))?;
        } else {
            write!(f, "<{} bytes>", self.bytes.len())?;
        }
        if self.truncated {
            f.write_str(" (truncated)")?;
        }
        Ok(())
    }
}

pub type Name = Bounded<NAME_MAX>;
pub type PathBytes = Bounded<PATH_MAX>;
pub type XattrValue = Bounded<XATTR_SIZE_MAX>;
pub type IoctlData = Bounded<IOCTL_MAX>;
pub type Payload = Bounded<PAYLOAD_MAX>;

/// Kind tag of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    Init,
    Destroy,
    Lookup,
    Forget,
    ForgetMulti,
    Getattr,
    Setattr,
    Readlink,
    Mknod,
    Mkdir,
    Unlink,
    Rmdir,
    Symlink,
    Rename,
    Link,
    Open,
    Read,
    Write,
    WriteBuf,
    Flush,
    Release,
    Fsync,
    Opendir,
    Readdir,
    Readdirplus,
    Releasedir,
    Fsyncdir,
    Statfs,
    Setxattr,
    Getxattr,
    Listxattr,
    Removexattr,
    Access,
    Create,
    Getlk,
    Setlk,
    Flock,
    Bmap,
    Ioctl,
    Poll,
    Fallocate,
    CopyFileRange,
    Lseek,
    Tmpfile,
    RetrieveReply,
}

impl OpKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OpKind::Init => "init",
            OpKind::Destroy => "destroy",
            OpKind::Lookup => "lookup",
            OpKind::Forget => "forget",
            OpKind::ForgetMulti => "forget_multi",
            OpKind::Getattr => "getattr",
            OpKind::Setattr => "setattr",
            OpKind::Readlink => "readlink",
            OpKind::Mknod => "mknod",
            OpKind::Mkdir => "mkdir",
            OpKind::Unlink => "unlink",
            OpKind::Rmdir => "rmdir",
            OpKind::Symlink => "symlink",
            OpKind::Rename => "rename",
            OpKind::Link => "link",
            OpKind::Open => "open",
            OpKind::Read => "read",
            OpKind::Write => "write",
            OpKind::WriteBuf => "write_buf",
            OpKind::Flush => "flush",
            OpKind::Release => "release",
            OpKind::Fsync => "fsync",
            OpKind::Opendir => "opendir",
            OpKind::Readdir => "readdir",
            OpKind::Readdirplus => "readdirplus",
            OpKind::Releasedir => "releasedir",
            OpKind::Fsyncdir => "fsyncdir",
            OpKind::Statfs => "statfs",
            OpKind::Setxattr => "setxattr",
            OpKind::Getxattr => "getxattr",
            OpKind::Listxattr => "listxattr",
            OpKind::Removexattr => "removexattr",
            OpKind::Access => "access",
            OpKind::Create => "create",
            OpKind::Getlk => "getlk",
            OpKind::Setlk => "setlk",
            OpKind::Flock => "flock",
            OpKind::Bmap => "bmap",
            OpKind::Ioctl => "ioctl",
            OpKind::Poll => "poll",
            OpKind::Fallocate => "fallocate",
            OpKind::CopyFileRange => "copy_file_range",
            OpKind::Lseek => "lseek",
            OpKind::Tmpfile => "tmpfile",
            OpKind::RetrieveReply => "retrieve_reply",
        }
    }

    /// Init and destroy: delivered synchronously and acknowledged, never
    /// registered.
    pub fn is_lifecycle(self) -> bool {
        matches!(self, OpKind::Init | OpKind::Destroy)
    }

    /// Kernel messages that expect no reply at all.
    pub fn is_notice(self) -> bool {
        matches!(
            self,
            OpKind::Forget | OpKind::ForgetMulti | OpKind::RetrieveReply
        )
    }

    /// Whether the operation carries a kernel handle that must be completed.
    pub fn needs_handle(self) -> bool {
        !self.is_lifecycle() && !self.is_notice()
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of the process behind a kernel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Caller {
    pub unique: u64,
    pub uid: u32,
    pub gid: u32,
    pub pid: u32,
}

/// Which fields of a setattr request are meaningful. Bit values follow the
/// kernel's `FATTR_*` constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SetattrMask(pub u32);

impl SetattrMask {
    pub const MODE: u32 = 1 << 0;
    pub const UID: u32 = 1 << 1;
    pub const GID: u32 = 1 << 2;
    pub const SIZE: u32 = 1 << 3;
    pub const ATIME: u32 = 1 << 4;
    pub const MTIME: u32 = 1 << 5;
    pub const FH: u32 = 1 << 6;
    pub const ATIME_NOW: u32 = 1 << 7;
    pub const MTIME_NOW: u32 = 1 << 8;
    pub const CTIME: u32 = 1 << 10;

    pub fn contains(self, bits: u32) -> bool {
        self.0 & bits == bits
    }

    pub fn insert(&mut self, bits: u32) {
        self.0 |= bits;
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

/// One entry of a batched forget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForgetOne {
    pub ino: u64,
    pub nlookup: u64,
}

/// POSIX record lock description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LockRange {
    pub start: u64,
    pub end: u64,
    pub typ: i32,
    pub pid: u32,
}

/// Request-side limits that a reply must respect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReplyBudget {
    /// Byte budget: read size, xattr size, readdir buffer size, ioctl out
    /// size or write length. Zero where the kind has none.
    pub max_bytes: u32,
    /// Starting directory offset for readdir-class kinds.
    pub offset: i64,
}

/// Parameters of one kernel operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum OpParams {
    Init,
    Destroy,
    Lookup {
        parent: u64,
        name: Name,
    },
    Forget {
        ino: u64,
        nlookup: u64,
    },
    ForgetMulti {
        items: Vec<ForgetOne>,
    },
    Getattr {
        ino: u64,
        fh: Option<u64>,
    },
    Setattr {
        ino: u64,
        to_set: SetattrMask,
        attr: CanonicalAttr,
        fh: Option<u64>,
    },
    Readlink {
        ino: u64,
    },
    Mknod {
        parent: u64,
        name: Name,
        mode: u32,
        umask: u32,
        rdev: u32,
    },
    Mkdir {
        parent: u64,
        name: Name,
        mode: u32,
        umask: u32,
    },
    Unlink {
        parent: u64,
        name: Name,
    },
    Rmdir {
        parent: u64,
        name: Name,
    },
    Symlink {
        parent: u64,
        name: Name,
        target: PathBytes,
    },
    Rename {
        parent: u64,
        name: Name,
        newparent: u64,
        newname: Name,
        flags: u32,
    },
    Link {
        ino: u64,
        newparent: u64,
        newname: Name,
    },
    Open {
        ino: u64,
        flags: i32,
    },
    Read {
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        flags: i32,
        lock_owner: Option<u64>,
    },
    Write {
        ino: u64,
        fh: u64,
        offset: i64,
        data: Payload,
        write_flags: u32,
        flags: i32,
        lock_owner: Option<u64>,
    },
    WriteBuf {
        ino: u64,
        fh: u64,
        offset: i64,
        data: Payload,
        flags: i32,
    },
    Flush {
        ino: u64,
        fh: u64,
        lock_owner: u64,
    },
    Release {
        ino: u64,
        fh: u64,
        flags: i32,
        lock_owner: Option<u64>,
        flush: bool,
    },
    Fsync {
        ino: u64,
        fh: u64,
        datasync: bool,
    },
    Opendir {
        ino: u64,
        flags: i32,
    },
    Readdir {
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
    },
    Readdirplus {
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
    },
    Releasedir {
        ino: u64,
        fh: u64,
        flags: i32,
    },
    Fsyncdir {
        ino: u64,
        fh: u64,
        datasync: bool,
    },
    Statfs {
        ino: u64,
    },
    Setxattr {
        ino: u64,
        name: Name,
        value: XattrValue,
        flags: i32,
        position: u32,
    },
    Getxattr {
        ino: u64,
        name: Name,
        size: u32,
    },
    Listxattr {
        ino: u64,
        size: u32,
    },
    Removexattr {
        ino: u64,
        name: Name,
    },
    Access {
        ino: u64,
        mask: i32,
    },
    Create {
        parent: u64,
        name: Name,
        mode: u32,
        umask: u32,
        flags: i32,
    },
    Getlk {
        ino: u64,
        fh: u64,
        lock_owner: u64,
        lock: LockRange,
    },
    Setlk {
        ino: u64,
        fh: u64,
        lock_owner: u64,
        lock: LockRange,
        sleep: bool,
    },
    Flock {
        ino: u64,
        fh: u64,
        lock_owner: u64,
        op: i32,
    },
    Bmap {
        ino: u64,
        blocksize: u32,
        idx: u64,
    },
    Ioctl {
        ino: u64,
        fh: u64,
        flags: u32,
        cmd: u32,
        in_data: IoctlData,
        out_size: u32,
    },
    Poll {
        ino: u64,
        fh: u64,
        kh: u64,
        events: u32,
        flags: u32,
    },
    Fallocate {
        ino: u64,
        fh: u64,
        offset: i64,
        length: i64,
        mode: i32,
    },
    CopyFileRange {
        ino_in: u64,
        fh_in: u64,
        offset_in: i64,
        ino_out: u64,
        fh_out: u64,
        offset_out: i64,
        len: u64,
        flags: u32,
    },
    Lseek {
        ino: u64,
        fh: u64,
        offset: i64,
        whence: i32,
    },
    Tmpfile {
        parent: u64,
        mode: u32,
        umask: u32,
        flags: i32,
    },
    RetrieveReply {
        ino: u64,
        cookie: u64,
        offset: u64,
        data: Payload,
    },
}

impl OpParams {
    pub fn kind(&self) -> OpKind {
        match self {
            OpParams::Init => OpKind::Init,
            OpParams::Destroy => OpKind::Destroy,
            OpParams::Lookup { .. } => OpKind::Lookup,
            OpParams::Forget { .. } => OpKind::Forget,
            OpParams::ForgetMulti { .. } => OpKind::ForgetMulti,
            OpParams::Getattr { .. } => OpKind::Getattr,
            OpParams::Setattr { .. } => OpKind::Setattr,
            OpParams::Readlink { .. } => OpKind::Readlink,
            OpParams::Mknod { .. } => OpKind::Mknod,
            OpParams::Mkdir { .. } => OpKind::Mkdir,
            OpParams::Unlink { .. } => OpKind::Unlink,
            OpParams::Rmdir { .. } => OpKind::Rmdir,
            OpParams::Symlink { .. } => OpKind::Symlink,
            OpParams::Rename { .. } => OpKind::Rename,
            OpParams::Link { .. } => OpKind::Link,
            OpParams::Open { .. } => OpKind::Open,
            OpParams::Read { .. } => OpKind::Read,
            OpParams::Write { .. } => OpKind::Write,
            OpParams::WriteBuf { .. } => OpKind::WriteBuf,
            OpParams::Flush { .. } => OpKind::Flush,
            OpParams::Release { .. } => OpKind::Release,
            OpParams::Fsync { .. } => OpKind::Fsync,
            OpParams::Opendir { .. } => OpKind::Opendir,
            OpParams::Readdir { .. } => OpKind::Readdir,
            OpParams::Readdirplus { .. } => OpKind::Readdirplus,
            OpParams::Releasedir { .. } => OpKind::Releasedir,
            OpParams::Fsyncdir { .. } => OpKind::Fsyncdir,
            OpParams::Statfs { .. } => OpKind::Statfs,
            OpParams::Setxattr { .. } => OpKind::Setxattr,
            OpParams::Getxattr { .. } => OpKind::Getxattr,
            OpParams::Listxattr { .. } => OpKind::Listxattr,
            OpParams::Removexattr { .. } => OpKind::Removexattr,
            OpParams::Access { .. } => OpKind::Access,
            OpParams::Create { .. } => OpKind::Create,
            OpParams::Getlk { .. } => OpKind::Getlk,
            OpParams::Setlk { .. } => OpKind::Setlk,
            OpParams::Flock { .. } => OpKind::Flock,
            OpParams::Bmap { .. } => OpKind::Bmap,
            OpParams::Ioctl { .. } => OpKind::Ioctl,
            OpParams::Poll { .. } => OpKind::Poll,
            OpParams::Fallocate { .. } => OpKind::Fallocate,
            OpParams::CopyFileRange { .. } => OpKind::CopyFileRange,
            OpParams::Lseek { .. } => OpKind::Lseek,
            OpParams::Tmpfile { .. } => OpKind::Tmpfile,
            OpParams::RetrieveReply { .. } => OpKind::RetrieveReply,
        }
    }

    pub fn budget(&self) -> ReplyBudget {
        match *self {
            OpParams::Read { size, .. }
            | OpParams::Getxattr { size, .. }
            | OpParams::Listxattr { size, .. } => ReplyBudget {
                max_bytes: size,
                offset: 0,
            },
            OpParams::Readdir { size, offset, .. } | OpParams::Readdirplus { size, offset, .. } => {
                ReplyBudget {
                    max_bytes: size,
                    offset,
                }
            }
            OpParams::Ioctl { out_size, .. } => ReplyBudget {
                max_bytes: out_size,
                offset: 0,
            },
            OpParams::Write { ref data, .. } | OpParams::WriteBuf { ref data, .. } => {
                ReplyBudget {
                    max_bytes: u32::try_from(data.len()).unwrap_or(u32::MAX),
                    offset: 0,
                }
            }
            OpParams::CopyFileRange { len, .. } => ReplyBudget {
                max_bytes: u32::try_from(len).unwrap_or(u32::MAX),
                offset: 0,
            },
            _ => ReplyBudget::default(),
        }
    }

    /// Whether any bounded byte field was cut short when it was captured.
    pub fn has_truncated_field(&self) -> bool {
        match self {
            OpParams::Lookup { name, .. }
            | OpParams::Mknod { name, .. }
            | OpParams::Mkdir { name, .. }
            | OpParams::Unlink { name, .. }
            | OpParams::Rmdir { name, .. }
            | OpParams::Create { name, .. }
            | OpParams::Getxattr { name, .. }
            | OpParams::Removexattr { name, .. } => name.is_truncated(),
            OpParams::Symlink { name, target, .. } => {
                name.is_truncated() || target.is_truncated()
            }
            OpParams::Rename { name, newname, .. } => {
                name.is_truncated() || newname.is_truncated()
            }
            OpParams::Link { newname, .. } => newname.is_truncated(),
            OpParams::Setxattr { name, value, .. } => {
                name.is_truncated() || value.is_truncated()
            }
            OpParams::Write { data, .. }
            | OpParams::WriteBuf { data, .. }
            | OpParams::RetrieveReply { data, .. } => data.is_truncated(),
            OpParams::Ioctl { in_data, .. } => in_data.is_truncated(),
            _ => false,
        }
    }
}

/// A registered operation on its way to the handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpRequest {
    pub id: RequestId,
    pub caller: Caller,
    pub params: OpParams,
}

/// An unregistered kernel message: lifecycle or forget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpNotice {
    pub caller: Caller,
    pub params: OpParams,
}
