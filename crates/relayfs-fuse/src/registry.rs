//! Pending request registry.
//!
//! Maps correlation ids to the kernel handles waiting on them. Inserts come
//! from the kernel thread, removals from whichever thread resolves the id.

use crate::handle::KernelHandle;
use crate::op::{OpKind, ReplyBudget};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Correlation id of one pending operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub struct PendingEntry {
    pub id: RequestId,
    pub kind: OpKind,
    pub budget: ReplyBudget,
    pub enqueued_at: Instant,
    pub handle: Box<dyn KernelHandle>,
}

impl PendingEntry {
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.enqueued_at)
    }
}

impl fmt::Debug for PendingEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingEntry")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("budget", &self.budget)
            .field("enqueued_at", &self.enqueued_at)
            .finish_non_exhaustive()
    }
}

pub struct PendingRegistry {
    next_id: AtomicU64,
    entries: DashMap<RequestId, PendingEntry>,
}

impl Default for PendingRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingRegistry {
    pub fn new() -> Self {
        PendingRegistry {
            next_id: AtomicU64::new(1),
            entries: DashMap::new(),
        }
    }

    /// Registers a handle and returns its fresh id. Ids start at 1 and are
    /// never reused within one registry.
    pub fn insert(
        &self,
        handle: Box<dyn KernelHandle>,
        kind: OpKind,
        budget: ReplyBudget,
    ) -> RequestId {
        let id = RequestId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let entry = PendingEntry {
            id,
            kind,
            budget,
            enqueued_at: Instant::now(),
            handle,
        };
        self.entries.insert(id, entry);
        id
    }

    /// Detaches the entry for `id`. Of any number of concurrent calls for
    /// the same id, exactly one gets `Some`.
    pub fn remove(&self, id: RequestId) -> Option<PendingEntry> {
        self.entries.remove(&id).map(|(_, entry)| entry)
    }

    pub fn contains(&self, id: RequestId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Ids of entries that have been pending for at least `max_age`.
    pub fn stale_ids(&self, max_age: Duration, now: Instant) -> Vec<RequestId> {
        let mut ids: Vec<RequestId> = self
            .entries
            .iter()
            .filter(|e| e.age(now) >= max_age)
            .map(|e| *e.key())
            .collect();
        ids.sort_unstable();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reply::Completion;

    struct NullHandle;

    impl KernelHandle for NullHandle {
        fn complete(self: Box<Self>, _completion: Completion) {}
    }

    fn insert(reg: &PendingRegistry, kind: OpKind) -> RequestId {
        reg.insert(Box::new(NullHandle), kind, ReplyBudget::default())
    }

    #[test]
    fn test_ids_start_at_one_and_increase() {
        let reg = PendingRegistry::new();
        assert_eq!(insert(&reg, OpKind::Read), RequestId(1));
        assert_eq!(insert(&reg, OpKind::Read), RequestId(2));
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn test_remove_returns_entry_once() {
        let reg = PendingRegistry::new();
        let id = insert(&reg, OpKind::Getattr);
        let entry = reg.remove(id).unwrap();
        assert_eq!(entry.kind, OpKind::Getattr);
        assert!(reg.remove(id).is_none());
        assert!(reg.is_empty());
    }

    #[test]
    fn test_remove_unknown_id() {
        let reg = PendingRegistry::new();
        assert!(reg.remove(RequestId(99)).is_none());
    }

    #[test]
    fn test_ids_not_reused_after_remove() {
        let reg = PendingRegistry::new();
        let a = insert(&reg, OpKind::Open);
        reg.remove(a);
        let b = insert(&reg, OpKind::Open);
        assert_ne!(a, b);
    }

    #[test]
    fn test_contains_tracks_pending_ids() {
        let reg = PendingRegistry::new();
        let id = insert(&reg, OpKind::Mkdir);
        assert!(reg.contains(id));
        assert!(!reg.contains(RequestId(0)));
        assert_eq!(reg.remove(id).map(|e| e.kind), Some(OpKind::Mkdir));
        assert!(!reg.contains(id));
    }

    #[test]
    fn test_stale_ids_by_age() {
        let reg = PendingRegistry::new();
        let a = insert(&reg, OpKind::Read);
        let b = insert(&reg, OpKind::Write);
        let later = Instant::now() + Duration::from_secs(10);
        assert_eq!(reg.stale_ids(Duration::from_secs(5), later), vec![a, b]);
        assert!(reg
            .stale_ids(Duration::from_secs(5), Instant::now())
            .is_empty());
    }

    #[test]
    fn test_concurrent_removes_single_winner() {
        use std::sync::Arc;
        use std::thread;

        let reg = Arc::new(PendingRegistry::new());
        let ids: Vec<RequestId> = (0..200).map(|_| insert(&reg, OpKind::Read)).collect();
        let ids = Arc::new(ids);

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let reg = reg.clone();
                let ids = ids.clone();
                thread::spawn(move || ids.iter().filter(|id| reg.remove(**id).is_some()).count())
            })
            .collect();
        let won: usize = workers.into_iter().map(|w| w.join().unwrap()).sum();
        assert_eq!(won, 200);
        assert!(reg.is_empty());
    }
}
