use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time copy of a sink's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkStats {
    pub events_pushed: u64,
    pub batches_sent: u64,
    pub batches_dropped: u64,
}

impl SinkStats {
    /// Counter increase since an `earlier` snapshot of the same sink.
    pub fn delta_since(&self, earlier: &SinkStats) -> SinkStats {
        SinkStats {
            events_pushed: self.events_pushed.saturating_sub(earlier.events_pushed),
            batches_sent: self.batches_sent.saturating_sub(earlier.batches_sent),
            batches_dropped: self.batches_dropped.saturating_sub(earlier.batches_dropped),
        }
    }
}

/// Lock-free per-sink counters, shared by the ingestion path and the
/// delivery worker.
///
/// Counters are monotonic; `snapshot()` reads without resetting.
#[derive(Debug, Default)]
pub struct StatsCounters {
    events_pushed: AtomicU64,
    batches_sent: AtomicU64,
    batches_dropped: AtomicU64,
}

impl StatsCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr_events_pushed(&self) {
        self.events_pushed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_batch_sent(&self) {
        self.batches_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_batch_dropped(&self) {
        self.batches_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SinkStats {
        SinkStats {
            events_pushed: self.events_pushed.load(Ordering::Relaxed),
            batches_sent: self.batches_sent.load(Ordering::Relaxed),
            batches_dropped: self.batches_dropped.load(Ordering::Relaxed),
        }
    }
}
