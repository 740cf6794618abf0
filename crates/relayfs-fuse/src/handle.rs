//! Kernel request handles.
//!
//! A handle is completed by value, so it cannot be completed twice. Dropping
//! a fuser reply without completing it makes fuser answer EIO on its own.

use crate::attr::PlatformAttr;
use crate::dirbuf::DirBuffer;
use crate::reply::Completion;
use fuser::{
    ReplyAttr, ReplyBmap, ReplyCreate, ReplyData, ReplyDirectory, ReplyDirectoryPlus, ReplyEmpty,
    ReplyEntry, ReplyIoctl, ReplyLock, ReplyLseek, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr,
};
use tracing::warn;

/// The kernel side of one pending operation.
pub trait KernelHandle: Send + Sync + 'static {
    /// Delivers the final result. Consumes the handle.
    fn complete(self: Box<Self>, completion: Completion);
}

/// A handle completed by calling a closure, for driving the bridge without
/// a kernel.
pub struct FnHandle<F>(F);

impl<F> FnHandle<F>
where
    F: FnOnce(Completion) + Send + Sync + 'static,
{
    pub fn boxed(f: F) -> Box<dyn KernelHandle> {
        Box::new(FnHandle(f))
    }
}

impl<F> KernelHandle for FnHandle<F>
where
    F: FnOnce(Completion) + Send + Sync + 'static,
{
    fn complete(self: Box<Self>, completion: Completion) {
        (self.0)(completion)
    }
}

macro_rules! fuser_handle {
    ($($variant:ident($ty:ty)),* $(,)?) => {
        /// Any fuser reply object.
        pub enum FuserHandle {
            $($variant($ty),)*
        }

        /// Which fuser reply object a handle wraps.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum ReplyKind {
            $($variant,)*
        }

        impl ReplyKind {
            pub const ALL: &'static [ReplyKind] = &[$(ReplyKind::$variant,)*];

            pub fn name(self) -> &'static str {
                match self {
                    $(ReplyKind::$variant => stringify!($variant),)*
                }
            }
        }

        $(impl From<$ty> for FuserHandle {
            fn from(reply: $ty) -> Self {
                FuserHandle::$variant(reply)
            }
        })*

        impl FuserHandle {
            pub fn kind(&self) -> ReplyKind {
                match self {
                    $(FuserHandle::$variant(_) => ReplyKind::$variant,)*
                }
            }

            /// Completes with an errno, whatever the reply type.
            pub fn fail(self, errno: i32) {
                match self {
                    $(FuserHandle::$variant(reply) => reply.error(errno),)*
                }
            }
        }
    };
}

fuser_handle!(
    Entry(ReplyEntry),
    Attr(ReplyAttr),
    Data(ReplyData),
    Empty(ReplyEmpty),
    Open(ReplyOpen),
    Write(ReplyWrite),
    Create(ReplyCreate),
    Directory(ReplyDirectory),
    DirectoryPlus(ReplyDirectoryPlus),
    Statfs(ReplyStatfs),
    Xattr(ReplyXattr),
    Lock(ReplyLock),
    Bmap(ReplyBmap),
    Ioctl(ReplyIoctl),
    Lseek(ReplyLseek),
);

impl std::fmt::Debug for FuserHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FuserHandle::{}", self.kind().name())
    }
}

/// Whether a reply object of `kind` can deliver `completion`.
///
/// Any nonzero errno fits every kind. A zero status only fits `Empty`.
/// `Poll` fits nothing, since fuser has no poll reply.
pub fn accepts(kind: ReplyKind, completion: &Completion) -> bool {
    use ReplyKind as K;
    match completion {
        Completion::Errno(0) => kind == K::Empty,
        Completion::Errno(_) => true,
        Completion::Entry { .. } => kind == K::Entry,
        Completion::Attr { .. } => kind == K::Attr,
        Completion::Created { .. } => kind == K::Create,
        Completion::Opened { .. } => kind == K::Open,
        Completion::Directory(_) => matches!(kind, K::Directory | K::DirectoryPlus),
        Completion::Data(_) => matches!(kind, K::Data | K::Xattr),
        Completion::XattrSize(_) => kind == K::Xattr,
        Completion::Written(_) => kind == K::Write,
        Completion::Statfs(_) => kind == K::Statfs,
        Completion::Lock(_) => kind == K::Lock,
        Completion::Bmap(_) => kind == K::Bmap,
        Completion::Ioctl { .. } => kind == K::Ioctl,
        Completion::Lseek(_) => kind == K::Lseek,
        Completion::Poll(_) => false,
    }
}

impl KernelHandle for FuserHandle {
    fn complete(self: Box<Self>, completion: Completion) {
        let handle = *self;
        if let Some(e) = completion.errno() {
            return handle.fail(e);
        }
        if !accepts(handle.kind(), &completion) {
            warn!(
                "completion {} does not fit reply {}, answering EIO",
                completion_name(&completion),
                handle.kind().name()
            );
            return handle.fail(libc::EIO);
        }
        match (handle, completion) {
            (FuserHandle::Empty(reply), Completion::Errno(_)) => reply.ok(),
            (FuserHandle::Entry(reply), Completion::Entry { ttl, attr, generation }) => {
                reply.entry(&ttl, &attr, generation)
            }
            (FuserHandle::Attr(reply), Completion::Attr { ttl, attr }) => reply.attr(&ttl, &attr),
            (
                FuserHandle::Create(reply),
                Completion::Created {
                    ttl,
                    attr,
                    generation,
                    fh,
                    flags,
                },
            ) => reply.created(&ttl, &attr, generation, fh, flags),
            (FuserHandle::Open(reply), Completion::Opened { fh, flags }) => reply.opened(fh, flags),
            (FuserHandle::Data(reply), Completion::Data(data)) => reply.data(&data),
            (FuserHandle::Xattr(reply), Completion::Data(data)) => reply.data(&data),
            (FuserHandle::Xattr(reply), Completion::XattrSize(n)) => reply.size(n),
            (FuserHandle::Write(reply), Completion::Written(n)) => reply.written(n),
            (FuserHandle::Directory(reply), Completion::Directory(buf)) => {
                replay_directory(reply, &buf)
            }
            (FuserHandle::DirectoryPlus(reply), Completion::Directory(buf)) => {
                replay_directory_plus(reply, &buf)
            }
            (FuserHandle::Statfs(reply), Completion::Statfs(st)) => reply.statfs(
                st.blocks, st.bfree, st.bavail, st.files, st.ffree, st.bsize, st.namelen,
                st.frsize,
            ),
            (FuserHandle::Lock(reply), Completion::Lock(lock)) => {
                reply.locked(lock.start, lock.end, lock.typ, lock.pid)
            }
            (FuserHandle::Bmap(reply), Completion::Bmap(block)) => reply.bmap(block),
            (FuserHandle::Ioctl(reply), Completion::Ioctl { result, data }) => {
                reply.ioctl(result, &data)
            }
            (FuserHandle::Lseek(reply), Completion::Lseek(off)) => reply.offset(off),
            // Unreachable while `accepts` agrees with the arms above.
            (handle, _) => handle.fail(libc::EIO),
        }
    }
}

fn completion_name(c: &Completion) -> &'static str {
    match c {
        Completion::Errno(_) => "errno",
        Completion::Entry { .. } => "entry",
        Completion::Attr { .. } => "attr",
        Completion::Created { .. } => "created",
        Completion::Opened { .. } => "opened",
        Completion::Directory(_) => "directory",
        Completion::Data(_) => "data",
        Completion::XattrSize(_) => "xattr_size",
        Completion::Written(_) => "written",
        Completion::Statfs(_) => "statfs",
        Completion::Lock(_) => "lock",
        Completion::Bmap(_) => "bmap",
        Completion::Ioctl { .. } => "ioctl",
        Completion::Poll(_) => "poll",
        Completion::Lseek(_) => "lseek",
    }
}

fn replay_directory(mut reply: ReplyDirectory, buf: &DirBuffer) {
    use std::os::unix::ffi::OsStrExt;
    for entry in buf.entries() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("corrupt directory buffer: {}", e);
                return reply.error(libc::EIO);
            }
        };
        let name = std::ffi::OsStr::from_bytes(entry.name);
        if reply.add(entry.ino, entry.offset, entry.file_type(), name) {
            break;
        }
    }
    reply.ok();
}

fn replay_directory_plus(mut reply: ReplyDirectoryPlus, buf: &DirBuffer) {
    use std::os::unix::ffi::OsStrExt;
    let ttl = buf.entry_ttl();
    for entry in buf.entries() {
        let converted = entry.and_then(|entry| {
            let wire = entry.attr.unwrap_or_default();
            let attr = fuser::FileAttr::from_canonical(&wire.to_canonical())?;
            Ok((entry, attr))
        });
        let (entry, attr) = match converted {
            Ok(pair) => pair,
            Err(e) => {
                warn!("corrupt directory buffer: {}", e);
                return reply.error(libc::EIO);
            }
        };
        let name = std::ffi::OsStr::from_bytes(entry.name);
        if reply.add(entry.ino, entry.offset, name, &ttl, &attr, entry.generation) {
            break;
        }
    }
    reply.ok();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_fn_handle_delivers_completion_once() {
        let (tx, rx) = mpsc::channel();
        let handle = FnHandle::boxed(move |c| tx.send(c).unwrap());
        handle.complete(Completion::Written(3));
        assert_eq!(rx.recv().unwrap(), Completion::Written(3));
        assert!(rx.recv().is_err());
    }

    #[test]
    fn test_completion_names_cover_errno() {
        assert_eq!(completion_name(&Completion::ok()), "errno");
        assert_eq!(completion_name(&Completion::Lseek(0)), "lseek");
    }

    fn attr() -> fuser::FileAttr {
        fuser::FileAttr::from_canonical(&crate::attr::CanonicalAttr {
            mode: crate::attr::S_IFREG | 0o644,
            ..Default::default()
        })
        .unwrap()
    }

    /// One completion of each shape, with the reply kinds that take it.
    fn pairings() -> Vec<(Completion, Vec<ReplyKind>)> {
        use ReplyKind as K;
        let ttl = std::time::Duration::from_secs(1);
        let dir = DirBuffer::new(
            crate::dirbuf::DirentLayout::Plain,
            4096,
            std::time::Duration::ZERO,
        );
        vec![
            (Completion::ok(), vec![K::Empty]),
            (
                Completion::Entry {
                    ttl,
                    attr: attr(),
                    generation: 0,
                },
                vec![K::Entry],
            ),
            (Completion::Attr { ttl, attr: attr() }, vec![K::Attr]),
            (
                Completion::Created {
                    ttl,
                    attr: attr(),
                    generation: 0,
                    fh: 1,
                    flags: 0,
                },
                vec![K::Create],
            ),
            (Completion::Opened { fh: 1, flags: 0 }, vec![K::Open]),
            (Completion::Directory(dir), vec![K::Directory, K::DirectoryPlus]),
            (Completion::Data(vec![1, 2]), vec![K::Data, K::Xattr]),
            (Completion::XattrSize(8), vec![K::Xattr]),
            (Completion::Written(3), vec![K::Write]),
            (Completion::Statfs(Default::default()), vec![K::Statfs]),
            (Completion::Lock(Default::default()), vec![K::Lock]),
            (Completion::Bmap(9), vec![K::Bmap]),
            (
                Completion::Ioctl {
                    result: 0,
                    data: Vec::new(),
                },
                vec![K::Ioctl],
            ),
            (Completion::Lseek(4), vec![K::Lseek]),
            (Completion::Poll(1), vec![]),
        ]
    }

    #[test]
    fn test_accepts_matching_pairs_only() {
        for (completion, fits) in pairings() {
            for &kind in ReplyKind::ALL {
                assert_eq!(
                    accepts(kind, &completion),
                    fits.contains(&kind),
                    "{} with {}",
                    completion_name(&completion),
                    kind.name()
                );
            }
        }
    }

    #[test]
    fn test_accepts_any_errno() {
        for &kind in ReplyKind::ALL {
            assert!(accepts(kind, &Completion::Errno(libc::ENOENT)));
        }
    }

    #[test]
    fn test_zero_status_needs_empty_reply() {
        assert!(accepts(ReplyKind::Empty, &Completion::ok()));
        assert!(!accepts(ReplyKind::Data, &Completion::ok()));
        assert!(!accepts(ReplyKind::Entry, &Completion::ok()));
        assert!(!accepts(ReplyKind::Directory, &Completion::ok()));
    }

    #[test]
    fn test_poll_fits_no_reply() {
        assert!(ReplyKind::ALL
            .iter()
            .all(|&kind| !accepts(kind, &Completion::Poll(0))));
    }

    #[test]
    fn test_reply_kind_names() {
        assert_eq!(ReplyKind::ALL.len(), 15);
        assert_eq!(ReplyKind::DirectoryPlus.name(), "DirectoryPlus");
        assert_eq!(ReplyKind::Lseek.name(), "Lseek");
    }
}
