//! Handler-side resolution of pending operations.

use crate::codec::ReplyCodec;
use crate::registry::{PendingEntry, PendingRegistry, RequestId};
use crate::reply::{Completion, Reply};
use crate::stats::BridgeStats;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// What a resolve call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The handle was completed with a success result.
    Completed,
    /// The handle was completed with this errno.
    Failed(i32),
    /// No pending entry had this id; nothing was done.
    Unknown,
}

#[derive(Clone)]
pub struct Resolver {
    registry: Arc<PendingRegistry>,
    codec: ReplyCodec,
    stats: Arc<BridgeStats>,
    trace_ops: bool,
}

impl Resolver {
    pub fn new(
        registry: Arc<PendingRegistry>,
        codec: ReplyCodec,
        stats: Arc<BridgeStats>,
        trace_ops: bool,
    ) -> Self {
        Resolver {
            registry,
            codec,
            stats,
            trace_ops,
        }
    }

    pub fn pending(&self) -> usize {
        self.registry.len()
    }

    /// Completes the operation `id` with `reply`.
    ///
    /// Unknown or already resolved ids are ignored. A reply that does not fit
    /// the operation completes it with EIO.
    pub fn resolve(&self, id: RequestId, reply: Reply) -> Resolution {
        let Some(entry) = self.take(id) else {
            return Resolution::Unknown;
        };
        let completion = match self.codec.decode(entry.kind, &entry.budget, reply) {
            Ok(completion) => completion,
            Err(e) => {
                self.stats.record_malformed();
                warn!("request {}: {}", id, e);
                Completion::Errno(e.to_errno())
            }
        };
        self.finish(entry, completion)
    }

    /// Like [`Resolver::resolve`] with a JSON-encoded reply. Unparseable
    /// text still resolves the id, with EIO.
    pub fn resolve_json(&self, id: RequestId, text: &str) -> Resolution {
        match serde_json::from_str::<Reply>(text) {
            Ok(reply) => self.resolve(id, reply),
            Err(e) => {
                let Some(entry) = self.take(id) else {
                    return Resolution::Unknown;
                };
                self.stats.record_malformed();
                warn!("request {}: unparseable {} reply: {}", id, entry.kind, e);
                self.finish(entry, Completion::Errno(libc::EIO))
            }
        }
    }

    /// Completes every operation pending for at least `max_age` with
    /// ETIMEDOUT and returns how many were expired.
    pub fn expire(&self, max_age: Duration) -> usize {
        let mut expired = 0;
        for id in self.registry.stale_ids(max_age, Instant::now()) {
            // Lost races with a concurrent resolve are skipped.
            if let Some(entry) = self.registry.remove(id) {
                warn!(
                    "request {} ({}) pending for {:?}, expiring",
                    id,
                    entry.kind,
                    entry.age(Instant::now())
                );
                self.stats.record_expired();
                self.finish(entry, Completion::Errno(libc::ETIMEDOUT));
                expired += 1;
            }
        }
        expired
    }

    fn take(&self, id: RequestId) -> Option<PendingEntry> {
        let entry = self.registry.remove(id);
        if entry.is_none() {
            self.stats.record_unknown_resolve();
            warn!("resolve for unknown request {}", id);
        }
        entry
    }

    fn finish(&self, entry: PendingEntry, completion: Completion) -> Resolution {
        let resolution = match completion.errno() {
            Some(errno) => Resolution::Failed(errno),
            None => Resolution::Completed,
        };
        if self.trace_ops {
            debug!(
                id = entry.id.0,
                elapsed_us = entry.age(Instant::now()).as_micros() as u64,
                "resolve {} -> {:?}",
                entry.kind,
                resolution
            );
        }
        self.stats.record_completed(resolution != Resolution::Completed);
        entry.handle.complete(completion);
        resolution
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attr::{CanonicalAttr, S_IFREG};
    use crate::handle::{FnHandle, KernelHandle};
    use crate::op::{OpKind, ReplyBudget};
    use std::sync::mpsc;

    fn setup() -> (Arc<PendingRegistry>, Resolver) {
        let registry = Arc::new(PendingRegistry::new());
        let resolver = Resolver::new(
            registry.clone(),
            ReplyCodec::default(),
            Arc::new(BridgeStats::new()),
            true,
        );
        (registry, resolver)
    }

    fn recorder() -> (Box<dyn KernelHandle>, mpsc::Receiver<Completion>) {
        let (tx, rx) = mpsc::channel();
        (FnHandle::boxed(move |c| tx.send(c).unwrap()), rx)
    }

    fn pending(
        registry: &PendingRegistry,
        kind: OpKind,
        max_bytes: u32,
    ) -> (RequestId, mpsc::Receiver<Completion>) {
        let (handle, rx) = recorder();
        let budget = ReplyBudget {
            max_bytes,
            offset: 0,
        };
        (registry.insert(handle, kind, budget), rx)
    }

    #[test]
    fn test_resolve_read_with_data() {
        let (registry, resolver) = setup();
        let (id, done) = pending(&registry, OpKind::Read, 10);
        assert_eq!(resolver.resolve(id, Reply::Data(vec![1; 8])), Resolution::Completed);
        assert_eq!(done.recv().unwrap(), Completion::Data(vec![1; 8]));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_resolve_error_reply() {
        let (registry, resolver) = setup();
        let (id, done) = pending(&registry, OpKind::Getattr, 0);
        assert_eq!(resolver.resolve(id, Reply::Error(-2)), Resolution::Failed(2));
        assert_eq!(done.recv().unwrap(), Completion::Errno(2));
    }

    #[test]
    fn test_double_resolve_is_noop() {
        let (registry, resolver) = setup();
        let (id, done) = pending(&registry, OpKind::Unlink, 0);
        assert_eq!(resolver.resolve(id, Reply::ok()), Resolution::Completed);
        assert_eq!(resolver.resolve(id, Reply::ok()), Resolution::Unknown);
        assert_eq!(done.recv().unwrap(), Completion::ok());
        assert!(done.recv().is_err());
        assert_eq!(resolver.stats.snapshot().unknown_resolves, 1);
    }

    #[test]
    fn test_malformed_reply_fails_closed() {
        let (registry, resolver) = setup();
        let (id, done) = pending(&registry, OpKind::Lookup, 0);
        let resolution = resolver.resolve(id, Reply::AttrFields(vec![0o100644, 2]));
        assert_eq!(resolution, Resolution::Failed(libc::EIO));
        assert_eq!(done.recv().unwrap(), Completion::Errno(libc::EIO));
        assert_eq!(resolver.stats.snapshot().malformed_replies, 1);
    }

    #[test]
    fn test_resolve_json_reply() {
        let (registry, resolver) = setup();
        let (id, done) = pending(&registry, OpKind::Getattr, 0);
        let attr = CanonicalAttr {
            mode: S_IFREG | 0o600,
            ino: 4,
            ..CanonicalAttr::default()
        };
        let text = serde_json::to_string(&Reply::Attr(attr)).unwrap();
        assert_eq!(resolver.resolve_json(id, &text), Resolution::Completed);
        assert!(matches!(done.recv().unwrap(), Completion::Attr { .. }));
    }

    #[test]
    fn test_resolve_json_garbage_is_eio() {
        let (registry, resolver) = setup();
        let (id, done) = pending(&registry, OpKind::Open, 0);
        assert_eq!(
            resolver.resolve_json(id, "{not json"),
            Resolution::Failed(libc::EIO)
        );
        assert_eq!(done.recv().unwrap(), Completion::Errno(libc::EIO));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_expire_times_out_old_entries() {
        let (registry, resolver) = setup();
        let (id, done) = pending(&registry, OpKind::Read, 10);
        assert_eq!(resolver.expire(Duration::from_secs(3600)), 0);
        assert_eq!(resolver.expire(Duration::ZERO), 1);
        assert_eq!(done.recv().unwrap(), Completion::Errno(libc::ETIMEDOUT));
        assert_eq!(resolver.resolve(id, Reply::Data(vec![])), Resolution::Unknown);
    }
}
