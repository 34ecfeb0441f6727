use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::event::AccountingEvent;

/// Minimum time between two overflow warnings for the same consumer.
const OVERFLOW_LOG_INTERVAL: Duration = Duration::from_secs(1);

/// Outcome of handing one event to a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Event was queued on the consumer's channel.
    Sent,
    /// Channel was full; the event was dropped for this consumer only.
    Full,
    /// Consumer was closed or its reader went away.
    Closed,
}

/// A named subscription to the probe's event stream.
///
/// The registrant owns the receiving half of the channel; the probe holds the
/// consumer while it is registered. The consumer owns the only sender, so
/// closing it is observed by the reader as end-of-stream.
pub struct Consumer {
    name: String,
    sender: Mutex<Option<mpsc::Sender<AccountingEvent>>>,
    closed: AtomicBool,
    dropped: AtomicU64,
    last_overflow_log: Mutex<Option<Instant>>,
}

impl Consumer {
    /// Creates a consumer with a fresh bounded channel of `capacity` events.
    ///
    /// The consumer holds the only sender, so the receiver ends as soon as
    /// the consumer is closed.
    pub fn with_capacity(
        name: impl Into<String>,
        capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<AccountingEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let consumer = Arc::new(Self {
            name: name.into(),
            sender: Mutex::new(Some(tx)),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
            last_overflow_log: Mutex::new(None),
        });
        (consumer, rx)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of events dropped because the consumer could not keep up.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Queues a copy of `event` without waiting.
    pub(crate) fn deliver(&self, event: AccountingEvent) -> Delivery {
        let guard = self.sender.lock();
        let Some(sender) = guard.as_ref() else {
            return Delivery::Closed;
        };

        match sender.try_send(event) {
            Ok(()) => Delivery::Sent,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                Delivery::Full
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                Delivery::Closed
            }
        }
    }

    /// Returns true at most once per [`OVERFLOW_LOG_INTERVAL`].
    pub(crate) fn should_log_overflow(&self, now: Instant) -> bool {
        let mut last = self.last_overflow_log.lock();
        match *last {
            Some(prev) if now.saturating_duration_since(prev) < OVERFLOW_LOG_INTERVAL => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }

    /// Closes the consumer's channel. Safe to call more than once and after
    /// the reader has gone away.
    pub fn close(&self) {
        let sender = self.sender.lock().take();
        self.closed.store(true, Ordering::Release);
        drop(sender);
    }
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("name", &self.name)
            .field("closed", &self.is_closed())
            .field("dropped", &self.dropped())
            .finish()
    }
}
