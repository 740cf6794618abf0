//! Bridge counters.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters shared by the dispatcher and the resolver.
#[derive(Debug, Default)]
pub struct BridgeStats {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    handoff_failures: AtomicU64,
    unknown_resolves: AtomicU64,
    malformed_replies: AtomicU64,
    expired: AtomicU64,
    notices: AtomicU64,
    dropped_notices: AtomicU64,
}

/// Point-in-time copy of [`BridgeStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Operations registered and handed to the handler.
    pub submitted: u64,
    /// Operations completed with a success result.
    pub completed: u64,
    /// Operations completed with an errno by the resolver.
    pub failed: u64,
    /// Operations completed with EIO because the handoff was rejected.
    /// Not counted in `submitted` or `failed`.
    pub handoff_failures: u64,
    pub unknown_resolves: u64,
    pub malformed_replies: u64,
    pub expired: u64,
    pub notices: u64,
    pub dropped_notices: u64,
}

impl StatsSnapshot {
    /// Operations handed off but not yet completed.
    pub fn in_flight(&self) -> u64 {
        self.submitted
            .saturating_sub(self.completed.saturating_add(self.failed))
    }
}

impl BridgeStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completed(&self, is_error: bool) {
        if is_error {
            self.failed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.completed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_handoff_failure(&self) {
        self.handoff_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unknown_resolve(&self) {
        self.unknown_resolves.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_malformed(&self) {
        self.malformed_replies.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_expired(&self) {
        self.expired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_notice(&self) {
        self.notices.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped_notice(&self) {
        self.dropped_notices.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            handoff_failures: self.handoff_failures.load(Ordering::Relaxed),
            unknown_resolves: self.unknown_resolves.load(Ordering::Relaxed),
            malformed_replies: self.malformed_replies.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            notices: self.notices.load(Ordering::Relaxed),
            dropped_notices: self.dropped_notices.load(Ordering::Relaxed),
        }
    }
}
