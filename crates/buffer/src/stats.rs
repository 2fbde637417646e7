//! Atomic statistics block of an output buffer.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use serde::Serialize;

/// Live counters of one output buffer. Updated lock-free by the buffer
/// workers; read by the status surface.
#[derive(Debug, Default)]
pub struct BufferStats {
    enqueued: AtomicU64,
    delivered: AtomicU64,
    retried: AtomicU64,
    failed: AtomicU64,
    dlq: AtomicU64,
    spilled: AtomicU64,
    current_queued: AtomicI64,
    current_retrying: AtomicI64,
}

/// A point-in-time copy of the counters, as served by the status surface.
///
/// At quiescence, `enqueued = delivered + dlq + failed + current_queued +
/// current_retrying` (spilled records are parked on disk and re-enter the
/// counters when their file is re-ingested).
#[derive(Debug, Clone, Default, Serialize)]
pub struct BufferStatsSnapshot {
    /// Records accepted by `enqueue`.
    pub enqueued: u64,
    /// Records successfully written to the sink.
    pub delivered: u64,
    /// Failed deliveries that were scheduled for a retry.
    pub retried: u64,
    /// Records lost to non-retryable errors (DLQ or spill write failures).
    pub failed: u64,
    /// Records surrendered to the dead-letter queue.
    pub dlq: u64,
    /// Records spilled to disk because the live queue was full.
    pub spilled: u64,
    /// Records currently in the live queue.
    pub current_queued: i64,
    /// Records currently awaiting a retry.
    pub current_retrying: i64,
}

impl BufferStats {
    /// A record entered the live queue.
    pub(crate) fn on_enqueued(&self) {
        let _ = self.enqueued.fetch_add(1, Ordering::Relaxed);
        let _ = self.current_queued.fetch_add(1, Ordering::Relaxed);
    }

    /// A record left the live queue after a successful delivery.
    pub(crate) fn on_delivered(&self) {
        let _ = self.delivered.fetch_add(1, Ordering::Relaxed);
        let _ = self.current_queued.fetch_sub(1, Ordering::Relaxed);
    }

    /// A record left the live queue and entered the retry queue.
    pub(crate) fn on_retry_scheduled(&self) {
        let _ = self.retried.fetch_add(1, Ordering::Relaxed);
        let _ = self.current_queued.fetch_sub(1, Ordering::Relaxed);
        let _ = self.current_retrying.fetch_add(1, Ordering::Relaxed);
    }

    /// A retried record was delivered.
    pub(crate) fn on_retry_delivered(&self) {
        let _ = self.delivered.fetch_add(1, Ordering::Relaxed);
        let _ = self.current_retrying.fetch_sub(1, Ordering::Relaxed);
    }

    /// A record left the retry queue for the DLQ (or was dropped).
    pub(crate) fn on_retry_finished(&self) {
        let _ = self.current_retrying.fetch_sub(1, Ordering::Relaxed);
    }

    /// A record was appended to the DLQ file.
    pub(crate) fn on_dlq(&self) {
        let _ = self.dlq.fetch_add(1, Ordering::Relaxed);
    }

    /// A record was lost to a non-retryable write error.
    pub(crate) fn on_failed(&self) {
        let _ = self.failed.fetch_add(1, Ordering::Relaxed);
    }

    /// A record left the live queue for a spill file.
    pub(crate) fn on_spilled(&self) {
        let _ = self.spilled.fetch_add(1, Ordering::Relaxed);
        let _ = self.current_queued.fetch_sub(1, Ordering::Relaxed);
    }

    /// A spooled record re-entered the retry queue at startup.
    pub(crate) fn on_reingested(&self) {
        let _ = self.current_retrying.fetch_add(1, Ordering::Relaxed);
    }

    /// A still-queued record was moved to the retry queue at shutdown.
    pub(crate) fn on_queue_to_retry(&self) {
        let _ = self.current_queued.fetch_sub(1, Ordering::Relaxed);
        let _ = self.current_retrying.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a point-in-time copy of the counters.
    pub fn snapshot(&self) -> BufferStatsSnapshot {
        BufferStatsSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dlq: self.dlq.load(Ordering::Relaxed),
            spilled: self.spilled.load(Ordering::Relaxed),
            current_queued: self.current_queued.load(Ordering::Relaxed),
            current_retrying: self.current_retrying.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod test {
    use super::BufferStats;

    #[test]
    fn lifecycle_counters() {
        let stats = BufferStats::default();

        stats.on_enqueued();
        stats.on_enqueued();
        stats.on_delivered();
        stats.on_retry_scheduled();
        stats.on_retry_delivered();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.enqueued, 2);
        assert_eq!(snapshot.delivered, 2);
        assert_eq!(snapshot.retried, 1);
        assert_eq!(snapshot.current_queued, 0);
        assert_eq!(snapshot.current_retrying, 0);
    }
}
