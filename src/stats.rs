//! Statistics tracking for the relay.

use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counters reported by the periodic stats line.
pub struct RelayStats {
    pub sessions: AtomicU64,
    pub rejected: AtomicU64,
    pub dns_queries: AtomicU64,
    /// Guest to target payload bytes.
    pub bytes_up: AtomicU64,
    /// Target to guest payload bytes.
    pub bytes_down: AtomicU64,
}

impl RelayStats {
    pub fn new() -> Self {
        Self {
            sessions: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            dns_queries: AtomicU64::new(0),
            bytes_up: AtomicU64::new(0),
            bytes_down: AtomicU64::new(0),
        }
    }

    pub fn record_session(&self) {
        self.sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dns(&self) {
        self.dns_queries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_up(&self, bytes: usize) {
        self.bytes_up.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_down(&self, bytes: usize) {
        self.bytes_down.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn snapshot_and_reset(&self) -> StatsSnapshot {
        StatsSnapshot {
            sessions: self.sessions.swap(0, Ordering::Relaxed),
            rejected: self.rejected.swap(0, Ordering::Relaxed),
            dns_queries: self.dns_queries.swap(0, Ordering::Relaxed),
            bytes_up: self.bytes_up.swap(0, Ordering::Relaxed),
            bytes_down: self.bytes_down.swap(0, Ordering::Relaxed),
        }
    }
}

impl Default for RelayStats {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub sessions: u64,
    pub rejected: u64,
    pub dns_queries: u64,
    pub bytes_up: u64,
    pub bytes_down: u64,
}
