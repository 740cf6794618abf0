//! Handler replies and kernel completions.
//!
//! A [`Reply`] is what the handler hands back for a correlation id. It does
//! not name its operation; the resolver decodes it against the kind stored
//! with the pending entry and produces a [`Completion`], which is the single
//! call made on the kernel handle.

use crate::attr::CanonicalAttr;
use crate::codec::error_errno;
use crate::dirbuf::DirBuffer;
use crate::op::LockRange;
use serde::{Deserialize, Serialize};
use std::io;
use std::time::Duration;

/// One directory entry produced by the handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntryReply {
    #[serde(with = "serde_bytes")]
    pub name: Vec<u8>,
    /// Required for readdirplus, optional for readdir.
    #[serde(default)]
    pub attr: Option<CanonicalAttr>,
}

impl DirEntryReply {
    pub fn new(name: impl AsRef<[u8]>, attr: Option<CanonicalAttr>) -> Self {
        DirEntryReply {
            name: name.as_ref().to_vec(),
            attr,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StatfsRecord {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
    pub namelen: u32,
    pub frsize: u32,
}

/// Handler-side result for one operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reply {
    /// Failure with an errno; sign is ignored, zero means EIO.
    Error(i32),
    /// Bare status for operations that return nothing. Zero is success.
    Status(i32),
    Attr(CanonicalAttr),
    /// Positional attribute array, see [`CanonicalAttr`]'s `TryFrom<&[i64]>`.
    AttrFields(Vec<i64>),
    Entry {
        attr: CanonicalAttr,
        #[serde(default)]
        generation: u64,
    },
    Created {
        attr: CanonicalAttr,
        #[serde(default)]
        generation: u64,
        fh: u64,
        #[serde(default)]
        flags: u32,
    },
    Opened {
        fh: u64,
        #[serde(default)]
        flags: u32,
    },
    Entries(Vec<DirEntryReply>),
    Data(#[serde(with = "serde_bytes")] Vec<u8>),
    Size(u32),
    Count(u64),
    Statfs(StatfsRecord),
    Lock(LockRange),
    Block(u64),
    Ioctl {
        result: i32,
        #[serde(with = "serde_bytes", default)]
        data: Vec<u8>,
    },
    Poll(u32),
    Offset(i64),
}

impl Reply {
    pub fn ok() -> Self {
        Reply::Status(0)
    }

    pub fn error(errno: i32) -> Self {
        Reply::Error(errno)
    }

    pub fn variant_name(&self) -> &'static str {
        match self {
            Reply::Error(_) => "error",
            Reply::Status(_) => "status",
            Reply::Attr(_) => "attr",
            Reply::AttrFields(_) => "attr_fields",
            Reply::Entry { .. } => "entry",
            Reply::Created { .. } => "created",
            Reply::Opened { .. } => "opened",
            Reply::Entries(_) => "entries",
            Reply::Data(_) => "data",
            Reply::Size(_) => "size",
            Reply::Count(_) => "count",
            Reply::Statfs(_) => "statfs",
            Reply::Lock(_) => "lock",
            Reply::Block(_) => "block",
            Reply::Ioctl { .. } => "ioctl",
            Reply::Poll(_) => "poll",
            Reply::Offset(_) => "offset",
        }
    }
}

/// Errno for a failed I/O call. The OS error code is kept when there is
/// one; otherwise the error kind picks the errno, and EIO covers the rest.
impl From<io::Error> for Reply {
    fn from(e: io::Error) -> Self {
        let errno = match e.raw_os_error() {
            Some(code) => error_errno(code),
            None => match e.kind() {
                io::ErrorKind::NotFound => libc::ENOENT,
                io::ErrorKind::PermissionDenied => libc::EACCES,
                io::ErrorKind::Unsupported => libc::ENOSYS,
                _ => libc::EIO,
            },
        };
        Reply::Error(errno)
    }
}

/// The one call to make on a kernel handle.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    /// Bare status: zero completes successfully, anything else is an errno.
    Errno(i32),
    Entry {
        ttl: Duration,
        attr: fuser::FileAttr,
        generation: u64,
    },
    Attr {
        ttl: Duration,
        attr: fuser::FileAttr,
    },
    Created {
        ttl: Duration,
        attr: fuser::FileAttr,
        generation: u64,
        fh: u64,
        flags: u32,
    },
    Opened {
        fh: u64,
        flags: u32,
    },
    Directory(DirBuffer),
    Data(Vec<u8>),
    XattrSize(u32),
    Written(u32),
    Statfs(StatfsRecord),
    Lock(LockRange),
    Bmap(u64),
    Ioctl {
        result: i32,
        data: Vec<u8>,
    },
    Poll(u32),
    Lseek(i64),
}

impl Completion {
    pub fn ok() -> Self {
        Completion::Errno(0)
    }

    /// The errno this completion reports, if it is a failure.
    pub fn errno(&self) -> Option<i32> {
        match *self {
            Completion::Errno(e) if e != 0 => Some(e),
            _ => None,
        }
    }

    pub fn is_error(&self) -> bool {
        self.errno().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_keeps_os_errno() {
        let reply = Reply::from(io::Error::from_raw_os_error(libc::ENODATA));
        assert_eq!(reply, Reply::Error(libc::ENODATA));
    }

    #[test]
    fn test_io_error_zero_os_errno_is_eio() {
        let reply = Reply::from(io::Error::from_raw_os_error(0));
        assert_eq!(reply, Reply::Error(libc::EIO));
    }

    #[test]
    fn test_io_error_kind_mapping() {
        let cases = [
            (io::ErrorKind::NotFound, libc::ENOENT),
            (io::ErrorKind::PermissionDenied, libc::EACCES),
            (io::ErrorKind::Unsupported, libc::ENOSYS),
            (io::ErrorKind::TimedOut, libc::EIO),
            (io::ErrorKind::Other, libc::EIO),
        ];
        for (kind, errno) in cases {
            let reply = Reply::from(io::Error::new(kind, "handler failure"));
            assert_eq!(reply, Reply::Error(errno), "{:?}", kind);
        }
    }

    #[test]
    fn test_reply_json_shapes() {
        let json = serde_json::to_string(&Reply::Error(-2)).unwrap();
        assert_eq!(json, r#"{"error":-2}"#);
        let json = serde_json::to_string(&Reply::Opened { fh: 3, flags: 0 }).unwrap();
        assert_eq!(json, r#"{"opened":{"fh":3,"flags":0}}"#);
    }

    #[test]
    fn test_reply_parses_with_defaults() {
        let reply: Reply = serde_json::from_str(r#"{"opened":{"fh":9}}"#).unwrap();
        assert_eq!(reply, Reply::Opened { fh: 9, flags: 0 });
        let reply: Reply = serde_json::from_str(r#"{"ioctl":{"result":0}}"#).unwrap();
        assert_eq!(
            reply,
            Reply::Ioctl {
                result: 0,
                data: Vec::new()
            }
        );
    }

    #[test]
    fn test_entries_parse_without_attr() {
        let reply: Reply =
            serde_json::from_str(r#"{"entries":[{"name":[97]},{"name":[98,98]}]}"#).unwrap();
        match reply {
            Reply::Entries(list) => {
                assert_eq!(list.len(), 2);
                assert_eq!(list[1].name, b"bb");
                assert!(list[0].attr.is_none());
            }
            other => panic!("unexpected reply {:?}", other),
        }
    }

    #[test]
    fn test_completion_errno() {
        assert_eq!(Completion::ok().errno(), None);
        assert_eq!(Completion::Errno(libc::ENOENT).errno(), Some(libc::ENOENT));
        assert!(!Completion::Written(4).is_error());
    }

    #[test]
    fn test_variant_names() {
        assert_eq!(Reply::ok().variant_name(), "status");
        assert_eq!(Reply::Data(vec![1]).variant_name(), "data");
    }
}
