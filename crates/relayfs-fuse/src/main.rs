//! relayfs mount daemon
//!
//! Mounts a read-only filesystem holding one file, `hello.txt`, served
//! through the bridge by an in-process handler.

use async_trait::async_trait;
use relayfs_fuse::attr::{S_IFDIR, S_IFREG};
use relayfs_fuse::{
    serve, BridgeConfig, BridgeSession, Caller, CanonicalAttr, DirEntryReply, OpHandler,
    OpParams, Reply,
};
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const ROOT_INO: u64 = 1;
const HELLO_INO: u64 = 2;
const HELLO_NAME: &[u8] = b"hello.txt";
const HELLO_TEXT: &[u8] = b"Hello from relayfs!\n";

struct HelloHandler {
    uid: u32,
    gid: u32,
    started: i64,
}

impl HelloHandler {
    fn attr(&self, ino: u64) -> Option<CanonicalAttr> {
        let (mode, nlink, size) = match ino {
            ROOT_INO => (S_IFDIR | 0o555, 2, 0),
            HELLO_INO => (S_IFREG | 0o444, 1, HELLO_TEXT.len() as u64),
            _ => return None,
        };
        Some(CanonicalAttr {
            mode,
            ino,
            nlink,
            uid: self.uid,
            gid: self.gid,
            size,
            blksize: 512,
            blocks: size.div_ceil(512),
            atime: self.started,
            mtime: self.started,
            ctime: self.started,
            ..CanonicalAttr::default()
        })
    }

    /// Entries after the first `offset`, which the kernel has already seen.
    fn listing(&self, offset: i64) -> Vec<DirEntryReply> {
        let names: [(&[u8], u64); 3] = [
            (b".", ROOT_INO),
            (b"..", ROOT_INO),
            (HELLO_NAME, HELLO_INO),
        ];
        names
            .iter()
            .skip(usize::try_from(offset).unwrap_or(0))
            .map(|&(name, ino)| DirEntryReply::new(name, self.attr(ino)))
            .collect()
    }
}

#[async_trait]
impl OpHandler for HelloHandler {
    async fn handle(&self, _caller: Caller, params: OpParams) -> io::Result<Reply> {
        let reply = match params {
            OpParams::Lookup { parent, name } => {
                if parent == ROOT_INO && name.as_bytes() == HELLO_NAME {
                    self.attr(HELLO_INO)
                        .map(|attr| Reply::Entry { attr, generation: 0 })
                        .unwrap_or(Reply::Error(libc::ENOENT))
                } else {
                    Reply::Error(libc::ENOENT)
                }
            }
            OpParams::Getattr { ino, .. } => self
                .attr(ino)
                .map(Reply::Attr)
                .unwrap_or(Reply::Error(libc::ENOENT)),
            OpParams::Open { ino, flags } => {
                if ino != HELLO_INO {
                    Reply::Error(libc::EISDIR)
                } else if flags & libc::O_ACCMODE != libc::O_RDONLY {
                    Reply::Error(libc::EROFS)
                } else {
                    Reply::Opened { fh: 0, flags: 0 }
                }
            }
            OpParams::Read {
                ino: HELLO_INO,
                offset,
                size,
                ..
            } => {
                let start = usize::try_from(offset)
                    .unwrap_or(0)
                    .min(HELLO_TEXT.len());
                let end = start.saturating_add(size as usize).min(HELLO_TEXT.len());
                Reply::Data(HELLO_TEXT[start..end].to_vec())
            }
            OpParams::Opendir { ino: ROOT_INO, .. } => Reply::Opened { fh: 0, flags: 0 },
            OpParams::Readdir {
                ino: ROOT_INO,
                offset,
                ..
            }
            | OpParams::Readdirplus {
                ino: ROOT_INO,
                offset,
                ..
            } => Reply::Entries(self.listing(offset)),
            OpParams::Release { .. }
            | OpParams::Releasedir { .. }
            | OpParams::Flush { .. }
            | OpParams::Access { .. } => Reply::ok(),
            OpParams::Statfs { .. } => Reply::Statfs(Default::default()),
            _ => Reply::Error(libc::ENOSYS),
        };
        Ok(reply)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let mountpoint = match std::env::args().nth(1) {
        Some(path) => PathBuf::from(path),
        None => {
            eprintln!("Usage: relayfs <mountpoint>");
            std::process::exit(1);
        }
    };

    let mut config = BridgeConfig::from_env()?;
    config.mount.ro = true;
    tracing::info!("relayfs starting, mount point: {}", mountpoint.display());

    let (session, inbox) = BridgeSession::new(config)?;
    let owner = std::fs::metadata(&mountpoint)?;
    let handler = Arc::new(HelloHandler {
        uid: owner.uid(),
        gid: owner.gid(),
        started: SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0),
    });
    let server = tokio::spawn(serve(inbox, session.resolver().clone(), handler));

    let mounted = tokio::task::spawn_blocking(move || session.mount(&mountpoint)).await??;
    tracing::info!("mounted at {}", mounted.mountpoint().display());

    tokio::signal::ctrl_c().await?;
    tracing::info!("interrupted, unmounting");
    tokio::task::spawn_blocking(move || mounted.unmount()).await?;
    server.await?;

    Ok(())
}
