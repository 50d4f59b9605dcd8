//! Per-queue counters exposed on the health endpoint.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Counters for one queue. Survive reconnects.
#[derive(Debug, Default)]
pub struct QueueStats {
    queue: String,
    received: AtomicU64,
    acked: AtomicU64,
    requeued: AtomicU64,
    dead_lettered: AtomicU64,
    in_flight: AtomicU64,
}

/// Point-in-time copy of [`QueueStats`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStatsSnapshot {
    pub queue: String,
    pub received: u64,
    pub acked: u64,
    pub requeued: u64,
    pub dead_lettered: u64,
    pub in_flight: u64,
}

impl QueueStats {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            ..Default::default()
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub(crate) fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_acked(&self) {
        self.acked.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_requeued(&self) {
        self.requeued.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dead_lettered(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_settled(&self) {
        // Saturating: a settle without a matching receive must not wrap.
        let _ = self
            .in_flight
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn snapshot(&self) -> QueueStatsSnapshot {
        QueueStatsSnapshot {
            queue: self.queue.clone(),
            received: self.received.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_counts() {
        let stats = QueueStats::new("email_queue");
        stats.record_received();
        stats.record_received();
        stats.record_acked();
        stats.record_settled();
        stats.record_requeued();
        stats.record_settled();
        stats.record_settled();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.queue, "email_queue");
        assert_eq!(snapshot.received, 2);
        assert_eq!(snapshot.acked, 1);
        assert_eq!(snapshot.requeued, 1);
        assert_eq!(snapshot.dead_lettered, 0);
        assert_eq!(snapshot.in_flight, 0);
    }
}
