//! Operation parameter codec.
//!
//! Encoding turns kernel callback arguments into owned [`OpParams`]
//! records. Decoding turns a handler [`Reply`] into the [`Completion`] that
//! matches the operation kind recorded at submission time.

use crate::attr::{system_time_to_secs, CanonicalAttr, PlatformAttr};
use crate::dirbuf::{DirBuffer, DirentLayout};
use crate::error::{BridgeError, Result};
use crate::op::{Caller, Name, OpKind, OpParams, PathBytes, ReplyBudget, SetattrMask};
use crate::reply::{Completion, DirEntryReply, Reply};
use crate::wire::AttrLayout;
use fuser::TimeOrNow;
use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::time::{Duration, SystemTime};

pub fn caller(req: &fuser::Request<'_>) -> Caller {
    Caller {
        unique: req.unique(),
        uid: req.uid(),
        gid: req.gid(),
        pid: req.pid(),
    }
}

pub fn name(s: &OsStr) -> Name {
    Name::copy_from(s.as_bytes())
}

pub fn target(p: &Path) -> PathBytes {
    PathBytes::copy_from(p.as_os_str().as_bytes())
}

fn time_or_now(t: TimeOrNow, mask: &mut SetattrMask, set: u32, now: u32) -> i64 {
    match t {
        TimeOrNow::SpecificTime(t) => {
            mask.insert(set);
            system_time_to_secs(t)
        }
        TimeOrNow::Now => {
            mask.insert(set | now);
            0
        }
    }
}

/// Arguments of a setattr callback, in kernel order.
#[derive(Debug, Clone, Copy, Default)]
pub struct SetattrArgs {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub atime: Option<TimeOrNow>,
    pub mtime: Option<TimeOrNow>,
    pub ctime: Option<SystemTime>,
    pub fh: Option<u64>,
}

/// Folds the optional setattr arguments into a mask plus a canonical
/// record. Fields not named by the mask are zero.
pub fn setattr(ino: u64, args: SetattrArgs) -> OpParams {
    let mut to_set = SetattrMask::default();
    let mut attr = CanonicalAttr {
        ino,
        ..CanonicalAttr::default()
    };
    if let Some(mode) = args.mode {
        to_set.insert(SetattrMask::MODE);
        attr.mode = mode;
    }
    if let Some(uid) = args.uid {
        to_set.insert(SetattrMask::UID);
        attr.uid = uid;
    }
    if let Some(gid) = args.gid {
        to_set.insert(SetattrMask::GID);
        attr.gid = gid;
    }
    if let Some(size) = args.size {
        to_set.insert(SetattrMask::SIZE);
        attr.size = size;
    }
    if let Some(t) = args.atime {
        attr.atime = time_or_now(t, &mut to_set, SetattrMask::ATIME, SetattrMask::ATIME_NOW);
    }
    if let Some(t) = args.mtime {
        attr.mtime = time_or_now(t, &mut to_set, SetattrMask::MTIME, SetattrMask::MTIME_NOW);
    }
    if let Some(t) = args.ctime {
        to_set.insert(SetattrMask::CTIME);
        attr.ctime = system_time_to_secs(t);
    }
    if args.fh.is_some() {
        to_set.insert(SetattrMask::FH);
    }
    OpParams::Setattr {
        ino,
        to_set,
        attr,
        fh: args.fh,
    }
}

/// Errno carried by an error reply. The sign is ignored and zero, which
/// would otherwise read as success, becomes EIO.
pub fn error_errno(e: i32) -> i32 {
    match e.checked_abs() {
        Some(0) | None => libc::EIO,
        Some(v) => v,
    }
}

/// Decodes handler replies into kernel completions.
#[derive(Debug, Clone, Copy)]
pub struct ReplyCodec {
    entry_ttl: Duration,
    attr_ttl: Duration,
    attr_layout: AttrLayout,
}

impl Default for ReplyCodec {
    fn default() -> Self {
        ReplyCodec::new(Duration::from_secs(1), Duration::from_secs(1))
    }
}

impl ReplyCodec {
    pub fn new(entry_ttl: Duration, attr_ttl: Duration) -> Self {
        ReplyCodec {
            entry_ttl,
            attr_ttl,
            attr_layout: AttrLayout::native(),
        }
    }

    pub fn with_attr_layout(mut self, layout: AttrLayout) -> Self {
        self.attr_layout = layout;
        self
    }

    pub fn decode(&self, kind: OpKind, budget: &ReplyBudget, reply: Reply) -> Result<Completion> {
        match reply {
            Reply::Error(e) => return Ok(Completion::Errno(error_errno(e))),
            Reply::Status(v) if v != 0 => return Ok(Completion::Errno(error_errno(v))),
            _ => {}
        }

        let name = kind.as_str();
        match kind {
            OpKind::Lookup | OpKind::Mknod | OpKind::Mkdir | OpKind::Symlink | OpKind::Link => {
                let (attr, generation) = self.entry_attr(name, reply)?;
                Ok(Completion::Entry {
                    ttl: self.entry_ttl,
                    attr,
                    generation,
                })
            }
            OpKind::Getattr | OpKind::Setattr => {
                let (attr, _) = self.entry_attr(name, reply)?;
                Ok(Completion::Attr {
                    ttl: self.attr_ttl,
                    attr,
                })
            }
            OpKind::Create | OpKind::Tmpfile => match reply {
                Reply::Created {
                    attr,
                    generation,
                    fh,
                    flags,
                } => Ok(Completion::Created {
                    ttl: self.entry_ttl,
                    attr: fuser::FileAttr::from_canonical(&attr)?,
                    generation,
                    fh,
                    flags,
                }),
                other => Err(mismatch(name, &other)),
            },
            OpKind::Open | OpKind::Opendir => match reply {
                Reply::Opened { fh, flags } => Ok(Completion::Opened { fh, flags }),
                other => Err(mismatch(name, &other)),
            },
            OpKind::Readdir => self.directory(DirentLayout::Plain, budget, reply),
            OpKind::Readdirplus => self.directory(DirentLayout::Plus, budget, reply),
            OpKind::Read => match reply {
                Reply::Data(mut data) => {
                    data.truncate(budget.max_bytes as usize);
                    Ok(Completion::Data(data))
                }
                other => Err(mismatch(name, &other)),
            },
            OpKind::Readlink => match reply {
                Reply::Data(data) => Ok(Completion::Data(data)),
                other => Err(mismatch(name, &other)),
            },
            OpKind::Getxattr | OpKind::Listxattr => xattr(name, budget, reply),
            OpKind::Write | OpKind::WriteBuf | OpKind::CopyFileRange => match reply {
                Reply::Count(n) => {
                    let written = u32::try_from(n)
                        .map_err(|_| BridgeError::malformed(name, format!("count {}", n)))?;
                    if written > budget.max_bytes {
                        return Err(BridgeError::malformed(
                            name,
                            format!("count {} exceeds request of {}", written, budget.max_bytes),
                        ));
                    }
                    Ok(Completion::Written(written))
                }
                other => Err(mismatch(name, &other)),
            },
            OpKind::Statfs => match reply {
                Reply::Statfs(st) => Ok(Completion::Statfs(st)),
                other => Err(mismatch(name, &other)),
            },
            OpKind::Getlk => match reply {
                Reply::Lock(lock) => Ok(Completion::Lock(lock)),
                other => Err(mismatch(name, &other)),
            },
            OpKind::Bmap => match reply {
                Reply::Block(idx) => Ok(Completion::Bmap(idx)),
                other => Err(mismatch(name, &other)),
            },
            OpKind::Ioctl => match reply {
                Reply::Ioctl { result, mut data } => {
                    data.truncate(budget.max_bytes as usize);
                    Ok(Completion::Ioctl { result, data })
                }
                other => Err(mismatch(name, &other)),
            },
            OpKind::Poll => match reply {
                Reply::Poll(revents) => Ok(Completion::Poll(revents)),
                other => Err(mismatch(name, &other)),
            },
            OpKind::Lseek => match reply {
                Reply::Offset(off) => Ok(Completion::Lseek(off)),
                other => Err(mismatch(name, &other)),
            },
            _ => match reply {
                Reply::Status(0) => Ok(Completion::ok()),
                other => Err(mismatch(name, &other)),
            },
        }
    }

    fn entry_attr(&self, name: &'static str, reply: Reply) -> Result<(fuser::FileAttr, u64)> {
        let (canonical, generation) = match reply {
            Reply::Attr(attr) => (attr, 0),
            Reply::AttrFields(fields) => (CanonicalAttr::try_from(fields.as_slice())?, 0),
            Reply::Entry { attr, generation } => (attr, generation),
            other => return Err(mismatch(name, &other)),
        };
        Ok((fuser::FileAttr::from_canonical(&canonical)?, generation))
    }

    fn directory(
        &self,
        layout: DirentLayout,
        budget: &ReplyBudget,
        reply: Reply,
    ) -> Result<Completion> {
        let entries: Vec<DirEntryReply> = match reply {
            Reply::Entries(entries) => entries,
            other => {
                let name = match layout {
                    DirentLayout::Plain => "readdir",
                    DirentLayout::Plus => "readdirplus",
                };
                return Err(mismatch(name, &other));
            }
        };
        let mut buf = DirBuffer::with_attr_layout(
            layout,
            self.attr_layout,
            budget.max_bytes as usize,
            self.entry_ttl,
        )
        .start_at(budget.offset);
        for entry in &entries {
            if !buf.append(&entry.name, entry.attr.as_ref())? {
                break;
            }
        }
        Ok(Completion::Directory(buf))
    }
}

fn xattr(name: &'static str, budget: &ReplyBudget, reply: Reply) -> Result<Completion> {
    let size_query = budget.max_bytes == 0;
    match reply {
        Reply::Size(n) if size_query => Ok(Completion::XattrSize(n)),
        Reply::Size(n) if n > budget.max_bytes => Ok(Completion::Errno(libc::ERANGE)),
        Reply::Data(data) => {
            let len = u32::try_from(data.len())
                .map_err(|_| BridgeError::malformed(name, "value too large"))?;
            if size_query {
                Ok(Completion::XattrSize(len))
            } else if len > budget.max_bytes {
                Ok(Completion::Errno(libc::ERANGE))
            } else {
                Ok(Completion::Data(data))
            }
        }
        other => Err(mismatch(name, &other)),
    }
}

fn mismatch(kind: &'static str, reply: &Reply) -> BridgeError {
    BridgeError::malformed(kind, format!("unexpected {} reply", reply.variant_name()))
}
