//! FUSE session management.
//!
//! A [`BridgeSession`] owns the pieces shared by the kernel side and the
//! handler side. Mounting it yields a [`MountedSession`]; dropping that
//! unmounts.

use crate::codec::ReplyCodec;
use crate::config::BridgeConfig;
use crate::dispatch::{handoff_channel, Dispatcher};
use crate::error::{BridgeError, Result};
use crate::filesystem::BridgeFilesystem;
use crate::handler::HandlerInbox;
use crate::mount::{options_to_fuser, validate_mountpoint};
use crate::registry::PendingRegistry;
use crate::resolve::Resolver;
use crate::stats::BridgeStats;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{info, warn};

const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(10);

pub struct BridgeSession {
    config: BridgeConfig,
    dispatcher: Dispatcher,
    resolver: Resolver,
    stats: Arc<BridgeStats>,
}

impl BridgeSession {
    /// Builds a session and the inbox its handler drains.
    pub fn new(config: BridgeConfig) -> Result<(Self, HandlerInbox)> {
        config.validate()?;

        let registry = Arc::new(PendingRegistry::new());
        let stats = Arc::new(BridgeStats::new());
        let (tx, rx) = handoff_channel(config.channel_capacity);
        let dispatcher = Dispatcher::new(registry.clone(), tx, stats.clone(), config.trace_ops);
        let codec = ReplyCodec::new(config.entry_ttl, config.attr_ttl);
        let resolver = Resolver::new(registry, codec, stats.clone(), config.trace_ops);

        let session = BridgeSession {
            config,
            dispatcher,
            resolver,
            stats,
        };
        Ok((session, HandlerInbox::new(rx)))
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    pub fn stats(&self) -> &Arc<BridgeStats> {
        &self.stats
    }

    /// The kernel-facing filesystem, without mounting it.
    pub fn filesystem(&self) -> BridgeFilesystem {
        BridgeFilesystem::new(self.dispatcher.clone(), self.config.readdir_buffer_size)
    }

    /// Mounts at `mountpoint` and starts serving kernel requests on a
    /// background thread.
    ///
    /// Init is delivered to the handler during mount, so the handler must
    /// already be draining its inbox.
    pub fn mount(&self, mountpoint: &Path) -> Result<MountedSession> {
        let mount_failed = |reason: String| BridgeError::MountFailed {
            mountpoint: mountpoint.display().to_string(),
            reason,
        };
        validate_mountpoint(mountpoint).map_err(|e| mount_failed(e.to_string()))?;

        let options = options_to_fuser(&self.config.mount, &self.config.fsname);
        info!("mounting {} at {}", self.config.fsname, mountpoint.display());
        let background = fuser::spawn_mount2(self.filesystem(), mountpoint, &options)
            .map_err(|e| mount_failed(e.to_string()))?;

        let sweeper = self
            .config
            .request_timeout
            .map(|timeout| Sweeper::spawn(self.resolver.clone(), timeout));

        Ok(MountedSession {
            mountpoint: mountpoint.to_path_buf(),
            background: Some(background),
            sweeper,
        })
    }
}

/// A live mount. Dropping it unmounts.
pub struct MountedSession {
    mountpoint: PathBuf,
    background: Option<fuser::BackgroundSession>,
    sweeper: Option<Sweeper>,
}

impl MountedSession {
    pub fn mountpoint(&self) -> &Path {
        &self.mountpoint
    }

    /// Unmounts and waits for the kernel loop to finish. Destroy reaches the
    /// handler before this returns, so call it from a thread that may block.
    pub fn unmount(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.stop();
        }
        if let Some(background) = self.background.take() {
            info!("unmounting {}", self.mountpoint.display());
            background.join();
        }
    }
}

impl Drop for MountedSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Periodically expires requests the handler never resolved.
pub(crate) struct Sweeper {
    stop_tx: mpsc::Sender<()>,
    thread: JoinHandle<()>,
}

impl Sweeper {
    pub(crate) fn spawn(resolver: Resolver, timeout: Duration) -> Self {
        let interval = (timeout / 4).max(MIN_SWEEP_INTERVAL);
        let (stop_tx, stop_rx) = mpsc::channel();
        let thread = std::thread::spawn(move || loop {
            match stop_rx.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => {
                    let expired = resolver.expire(timeout);
                    if expired > 0 {
                        warn!("expired {} requests after {:?}", expired, timeout);
                    }
                }
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        });
        Sweeper { stop_tx, thread }
    }

    pub(crate) fn stop(self) {
        let _ = self.stop_tx.send(());
        if self.thread.join().is_err() {
            warn!("request sweeper panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::HandlerMessage;
    use crate::handle::FnHandle;
    use crate::op::{Caller, OpParams};
    use crate::reply::Completion;

    fn getattr() -> OpParams {
        OpParams::Getattr { ino: 1, fh: None }
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let config = BridgeConfig {
            channel_capacity: 0,
            ..BridgeConfig::default()
        };
        assert!(matches!(
            BridgeSession::new(config),
            Err(BridgeError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn test_session_wires_dispatcher_to_inbox() {
        let (session, mut inbox) = BridgeSession::new(BridgeConfig::default()).unwrap();
        let (tx, rx) = mpsc::channel();
        let id = session
            .dispatcher()
            .submit(
                Caller::default(),
                getattr(),
                FnHandle::boxed(move |c| tx.send(c).unwrap()),
            )
            .unwrap();

        match inbox.try_recv() {
            Some(HandlerMessage::Request(req)) => assert_eq!(req.id, id),
            other => panic!("unexpected message {:?}", other),
        }
        assert_eq!(session.resolver().pending(), 1);
        session.resolver().resolve(id, crate::reply::Reply::Error(libc::ENOENT));
        assert_eq!(rx.recv().unwrap(), Completion::Errno(libc::ENOENT));
        assert_eq!(session.stats().snapshot().in_flight(), 0);
    }

    #[test]
    fn test_filesystem_uses_configured_readdir_size() {
        let config = BridgeConfig {
            readdir_buffer_size: 8192,
            ..BridgeConfig::default()
        };
        let (session, _inbox) = BridgeSession::new(config).unwrap();
        let _fs = session.filesystem();
        assert_eq!(session.config().readdir_buffer_size, 8192);
    }

    #[test]
    fn test_mount_nonexistent_path_fails() {
        let (session, _inbox) = BridgeSession::new(BridgeConfig::default()).unwrap();
        let result = session.mount(Path::new("/nonexistent_path_12345"));
        assert!(matches!(result, Err(BridgeError::MountFailed { .. })));
    }

    #[test]
    fn test_sweeper_expires_stale_requests() {
        let (session, _inbox) = BridgeSession::new(BridgeConfig::default()).unwrap();
        let (tx, rx) = mpsc::channel();
        session
            .dispatcher()
            .submit(
                Caller::default(),
                getattr(),
                FnHandle::boxed(move |c| tx.send(c).unwrap()),
            )
            .unwrap();

        let sweeper = Sweeper::spawn(session.resolver().clone(), Duration::from_millis(20));
        let completion = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        sweeper.stop();

        assert_eq!(completion, Completion::Errno(libc::ETIMEDOUT));
        assert_eq!(session.stats().snapshot().expired, 1);
    }
}
