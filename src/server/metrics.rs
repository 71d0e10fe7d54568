//! Data-plane counters.
//!
//! The core only increments; exposition (the metrics HTTP endpoint) is
//! an external collaborator that reads a [`MetricsSnapshot`].

use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counters shared across the server's tasks.
#[derive(Debug, Default)]
pub struct Metrics {
    pub connections_total: AtomicU64,
    pub active_sessions: AtomicU64,
    pub packets_forwarded: AtomicU64,
    pub bytes_forwarded: AtomicU64,
    pub packets_dropped_unknown_dest: AtomicU64,
    pub packets_dropped_backpressure: AtomicU64,
    pub packets_dropped_bad_source: AtomicU64,
    pub requests_rejected: AtomicU64,
    pub pool_exhausted: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_connection(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.active_sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_disconnection(&self) {
        self.active_sessions.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_forwarded(&self, bytes: usize) {
        self.packets_forwarded.fetch_add(1, Ordering::Relaxed);
        self.bytes_forwarded.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            active_sessions: self.active_sessions.load(Ordering::Relaxed),
            packets_forwarded: self.packets_forwarded.load(Ordering::Relaxed),
            bytes_forwarded: self.bytes_forwarded.load(Ordering::Relaxed),
            packets_dropped_unknown_dest: self
                .packets_dropped_unknown_dest
                .load(Ordering::Relaxed),
            packets_dropped_backpressure: self
                .packets_dropped_backpressure
                .load(Ordering::Relaxed),
            packets_dropped_bad_source: self.packets_dropped_bad_source.load(Ordering::Relaxed),
            requests_rejected: self.requests_rejected.load(Ordering::Relaxed),
            pool_exhausted: self.pool_exhausted.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub active_sessions: u64,
    pub packets_forwarded: u64,
    pub bytes_forwarded: u64,
    pub packets_dropped_unknown_dest: u64,
    pub packets_dropped_backpressure: u64,
    pub packets_dropped_bad_source: u64,
    pub requests_rejected: u64,
    pub pool_exhausted: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let metrics = Metrics::new();
        metrics.record_connection();
        metrics.record_connection();
        metrics.record_disconnection();
        metrics.record_forwarded(100);
        metrics.record_forwarded(28);

        let snap = metrics.snapshot();
        assert_eq!(snap.connections_total, 2);
        assert_eq!(snap.active_sessions, 1);
        assert_eq!(snap.packets_forwarded, 2);
        assert_eq!(snap.bytes_forwarded, 128);
    }
}
