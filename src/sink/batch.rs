//! Batching runtime shared by every sink that talks to a backend.
//!
//! Pushed events are encoded into points and appended to an open batch. The
//! batch is closed when the flush timer fires or, if configured, when it
//! reaches the size watermark. Closed batches go through a bounded hand-off
//! queue to a single delivery worker, so they reach the backend in the order
//! they were closed. A failed write drops the batch; nothing is retried.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::stats::{SinkStats, StatsCounters};
use crate::config::SinkConfig;
use crate::probe::AccountingEvent;

/// BatchWriter encodes events for one backend and writes closed batches.
pub trait BatchWriter: Send + Sync + 'static {
    /// Encoded form of one event.
    type Point: Send + 'static;

    /// Encodes an event. Called outside the batch lock.
    fn encode(&self, event: &AccountingEvent) -> Self::Point;

    /// Writes one batch to the backend.
    fn write(&self, batch: Vec<Self::Point>) -> impl Future<Output = Result<()>> + Send;
}

/// Flush and hand-off settings of a [`Batcher`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchOptions {
    pub flush_interval: Duration,
    /// Points that close a batch early, 0 to only flush on the timer.
    pub batch_size: usize,
    /// Closed batches that may wait for the delivery worker.
    pub queue_size: usize,
}

impl From<&SinkConfig> for BatchOptions {
    fn from(cfg: &SinkConfig) -> Self {
        Self {
            flush_interval: cfg.flush_interval,
            batch_size: cfg.batch_size,
            queue_size: cfg.queue_size,
        }
    }
}

struct Shared<P> {
    name: String,
    batch: Mutex<Vec<P>>,
    handoff: mpsc::Sender<Vec<P>>,
    batch_size: usize,
    stats: Arc<StatsCounters>,
}

impl<P> Shared<P> {
    /// Closes a non-empty open batch and queues it for delivery. Called with
    /// the batch lock held so batches are queued in the order they close.
    fn close_locked(&self, batch: &mut Vec<P>) {
        if batch.is_empty() {
            return;
        }

        let closed = std::mem::replace(batch, Vec::with_capacity(self.batch_size));

        match self.handoff.try_send(closed) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(dropped)) => {
                self.stats.incr_batch_dropped();
                warn!(
                    sink = %self.name,
                    points = dropped.len(),
                    "delivery queue full, batch dropped",
                );
            }
            Err(mpsc::error::TrySendError::Closed(dropped)) => {
                self.stats.incr_batch_dropped();
                debug!(
                    sink = %self.name,
                    points = dropped.len(),
                    "delivery worker stopped, batch dropped",
                );
            }
        }
    }

    fn take_open(&self) -> Vec<P> {
        std::mem::take(&mut *self.batch.lock())
    }
}

/// Batcher accumulates encoded points and delivers them through `W`.
pub struct Batcher<W: BatchWriter> {
    shared: Arc<Shared<W::Point>>,
    writer: Arc<W>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    ctx: CancellationToken,
}

impl<W: BatchWriter> Batcher<W> {
    /// Spawns the tick and delivery workers. Cancelling `ctx` flushes the
    /// open batch, drains the queue and stops both workers.
    pub fn start(
        name: impl Into<String>,
        writer: W,
        opts: BatchOptions,
        stats: Arc<StatsCounters>,
        ctx: CancellationToken,
    ) -> Self {
        let (handoff, queue) = mpsc::channel(opts.queue_size.max(1));

        let shared = Arc::new(Shared {
            name: name.into(),
            batch: Mutex::new(Vec::with_capacity(opts.batch_size)),
            handoff,
            batch_size: opts.batch_size,
            stats,
        });
        let writer = Arc::new(writer);

        let tick = tokio::spawn(tick_worker(
            Arc::clone(&shared),
            opts.flush_interval,
            ctx.clone(),
        ));
        let send = tokio::spawn(send_worker(
            Arc::clone(&shared),
            Arc::clone(&writer),
            queue,
            ctx.clone(),
        ));

        Self {
            shared,
            writer,
            workers: Mutex::new(vec![tick, send]),
            ctx,
        }
    }

    /// Adds an event to the open batch. Never blocks on the backend.
    ///
    /// Once the context is cancelled no worker will flush again, so the
    /// event is counted as a dropped batch instead.
    pub fn push(&self, event: &AccountingEvent) {
        self.shared.stats.incr_events_pushed();

        if self.ctx.is_cancelled() {
            self.shared.stats.incr_batch_dropped();
            return;
        }

        let point = self.writer.encode(event);

        let mut batch = self.shared.batch.lock();
        batch.push(point);
        if self.shared.batch_size > 0 && batch.len() >= self.shared.batch_size {
            self.shared.close_locked(&mut batch);
        }
    }

    pub fn stats(&self) -> SinkStats {
        self.shared.stats.snapshot()
    }

    /// Waits for both workers to exit after the context was cancelled.
    pub async fn wait_for_shutdown(&self) {
        let workers = std::mem::take(&mut *self.workers.lock());

        for worker in workers {
            if let Err(e) = worker.await {
                error!(sink = %self.shared.name, error = %e, "batch worker failed");
            }
        }
    }
}

async fn tick_worker<P: Send + 'static>(
    shared: Arc<Shared<P>>,
    flush_interval: Duration,
    ctx: CancellationToken,
) {
    let start = tokio::time::Instant::now() + flush_interval;
    let mut ticker = tokio::time::interval_at(start, flush_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;

            _ = ctx.cancelled() => return,
            _ = ticker.tick() => {
                let mut batch = shared.batch.lock();
                shared.close_locked(&mut batch);
            }
        }
    }
}

async fn send_worker<W: BatchWriter>(
    shared: Arc<Shared<W::Point>>,
    writer: Arc<W>,
    mut queue: mpsc::Receiver<Vec<W::Point>>,
    ctx: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;

            _ = ctx.cancelled() => break,

            batch = queue.recv() => match batch {
                Some(batch) => deliver(&shared, writer.as_ref(), batch).await,
                None => return,
            },
        }
    }

    // Final flush: queued batches first, then whatever is still open.
    queue.close();
    while let Ok(batch) = queue.try_recv() {
        deliver(&shared, writer.as_ref(), batch).await;
    }

    let open = shared.take_open();
    if !open.is_empty() {
        deliver(&shared, writer.as_ref(), open).await;
    }

    debug!(sink = %shared.name, "delivery worker stopped");
}

async fn deliver<W: BatchWriter>(shared: &Shared<W::Point>, writer: &W, batch: Vec<W::Point>) {
    let points = batch.len();

    match writer.write(batch).await {
        Ok(()) => {
            shared.stats.incr_batch_sent();
            debug!(sink = %shared.name, points, "batch written");
        }
        Err(e) => {
            shared.stats.incr_batch_dropped();
            error!(
                sink = %shared.name,
                points,
                error = %format!("{e:#}"),
                "error writing batch, batch dropped",
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::SystemTime;

    use anyhow::bail;
    use tokio::sync::Semaphore;

    use super::*;
    use crate::probe::{Counters, EventKind, FlowTuple};

    const FLUSH: Duration = Duration::from_secs(1);

    #[derive(Clone, Default)]
    struct MockWriter {
        writes: Arc<Mutex<Vec<Vec<u64>>>>,
        fail_next: Arc<AtomicBool>,
        gate: Option<Arc<Semaphore>>,
        started: Option<mpsc::UnboundedSender<()>>,
    }

    impl MockWriter {
        fn writes(&self) -> Vec<Vec<u64>> {
            self.writes.lock().clone()
        }
    }

    impl BatchWriter for MockWriter {
        type Point = u64;

        fn encode(&self, event: &AccountingEvent) -> u64 {
            event.counters.packets_orig
        }

        async fn write(&self, batch: Vec<u64>) -> Result<()> {
            if let Some(started) = &self.started {
                let _ = started.send(());
            }
            if let Some(gate) = &self.gate {
                if let Ok(permit) = gate.acquire().await {
                    permit.forget();
                }
            }

            self.writes.lock().push(batch);

            if self.fail_next.swap(false, Ordering::SeqCst) {
                bail!("backend unavailable");
            }
            Ok(())
        }
    }

    fn event(n: u64) -> AccountingEvent {
        AccountingEvent {
            kind: EventKind::Update,
            tuple: FlowTuple {
                proto: 17,
                src_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
                dst_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
                src_port: 40000,
                dst_port: 1342,
            },
            counters: Counters {
                packets_orig: n,
                ..Default::default()
            },
            netns: 1,
            connmark: 0,
            timestamp: SystemTime::UNIX_EPOCH,
        }
    }

    fn opts(batch_size: usize, queue_size: usize) -> BatchOptions {
        BatchOptions {
            flush_interval: FLUSH,
            batch_size,
            queue_size,
        }
    }

    fn start(writer: MockWriter, opts: BatchOptions) -> (Batcher<MockWriter>, CancellationToken) {
        let ctx = CancellationToken::new();
        let batcher = Batcher::start(
            "test",
            writer,
            opts,
            Arc::new(StatsCounters::new()),
            ctx.clone(),
        );
        (batcher, ctx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_sink_never_writes() {
        let writer = MockWriter::default();
        let (batcher, ctx) = start(writer.clone(), opts(0, 4));

        tokio::time::sleep(FLUSH * 5).await;

        assert!(writer.writes().is_empty());
        let stats = batcher.stats();
        assert_eq!(stats.batches_sent, 0);
        assert_eq!(stats.batches_dropped, 0);

        ctx.cancel();
        batcher.wait_for_shutdown().await;
        assert!(writer.writes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_flushes_open_batch() {
        let writer = MockWriter::default();
        let (batcher, ctx) = start(writer.clone(), opts(0, 4));

        for n in 1..=3 {
            batcher.push(&event(n));
        }
        assert!(writer.writes().is_empty());

        tokio::time::sleep(FLUSH + Duration::from_millis(100)).await;

        assert_eq!(writer.writes(), vec![vec![1, 2, 3]]);
        let stats = batcher.stats();
        assert_eq!(stats.events_pushed, 3);
        assert_eq!(stats.batches_sent, 1);

        // Nothing pushed since: the next tick writes nothing.
        tokio::time::sleep(FLUSH).await;
        assert_eq!(writer.writes().len(), 1);
        assert_eq!(batcher.stats().batches_sent, 1);

        ctx.cancel();
        batcher.wait_for_shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_write_drops_batch_once() {
        let writer = MockWriter::default();
        writer.fail_next.store(true, Ordering::SeqCst);
        let (batcher, ctx) = start(writer.clone(), opts(0, 4));

        batcher.push(&event(1));
        tokio::time::sleep(FLUSH + Duration::from_millis(100)).await;

        let stats = batcher.stats();
        assert_eq!(stats.batches_dropped, 1);
        assert_eq!(stats.batches_sent, 0);

        // Not retried on the next tick.
        tokio::time::sleep(FLUSH * 2).await;
        assert_eq!(writer.writes().len(), 1);
        assert_eq!(batcher.stats().batches_dropped, 1);

        // The sink keeps accepting and delivering afterwards.
        batcher.push(&event(2));
        tokio::time::sleep(FLUSH).await;
        assert_eq!(writer.writes(), vec![vec![1], vec![2]]);
        assert_eq!(batcher.stats().batches_sent, 1);

        ctx.cancel();
        batcher.wait_for_shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_size_watermark_flushes_early() {
        let writer = MockWriter::default();
        let (batcher, ctx) = start(writer.clone(), opts(2, 4));

        batcher.push(&event(1));
        batcher.push(&event(2));
        batcher.push(&event(3));

        // Well before the first tick.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(writer.writes(), vec![vec![1, 2]]);

        tokio::time::sleep(FLUSH).await;
        assert_eq!(writer.writes(), vec![vec![1, 2], vec![3]]);

        ctx.cancel();
        batcher.wait_for_shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_queue_drops_batch() {
        let gate = Arc::new(Semaphore::new(0));
        let (started_tx, mut started) = mpsc::unbounded_channel();
        let writer = MockWriter {
            gate: Some(Arc::clone(&gate)),
            started: Some(started_tx),
            ..Default::default()
        };
        let (batcher, ctx) = start(writer.clone(), opts(1, 1));

        // First batch is picked up and blocks in the backend.
        batcher.push(&event(1));
        started.recv().await.expect("write started");

        // Second waits in the queue, third finds it full.
        batcher.push(&event(2));
        batcher.push(&event(3));
        assert_eq!(batcher.stats().batches_dropped, 1);

        gate.add_permits(2);
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(writer.writes(), vec![vec![1], vec![2]]);
        let stats = batcher.stats();
        assert_eq!(stats.events_pushed, 3);
        assert_eq!(stats.batches_sent, 2);
        assert_eq!(stats.batches_dropped, 1);

        ctx.cancel();
        batcher.wait_for_shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_flushes_open_batch() {
        let writer = MockWriter::default();
        let (batcher, ctx) = start(writer.clone(), opts(0, 4));

        batcher.push(&event(7));
        batcher.push(&event(8));

        ctx.cancel();
        batcher.wait_for_shutdown().await;

        assert_eq!(writer.writes(), vec![vec![7, 8]]);
        assert_eq!(batcher.stats().batches_sent, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_on_tick_deadline_writes_once() {
        let writer = MockWriter::default();
        let (batcher, ctx) = start(writer.clone(), opts(0, 4));

        batcher.push(&event(4));
        batcher.push(&event(5));

        // The tick and the cancellation become ready together.
        tokio::time::sleep(FLUSH).await;
        ctx.cancel();
        batcher.wait_for_shutdown().await;

        assert_eq!(writer.writes(), vec![vec![4, 5]]);
        let stats = batcher.stats();
        assert_eq!(stats.batches_sent, 1);
        assert_eq!(stats.batches_dropped, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_after_cancel_is_dropped() {
        let writer = MockWriter::default();
        let (batcher, ctx) = start(writer.clone(), opts(0, 4));

        batcher.push(&event(1));
        ctx.cancel();
        batcher.wait_for_shutdown().await;

        batcher.push(&event(2));
        batcher.push(&event(3));

        assert_eq!(writer.writes(), vec![vec![1]]);
        assert!(batcher.shared.batch.lock().is_empty());
        let stats = batcher.stats();
        assert_eq!(stats.events_pushed, 3);
        assert_eq!(stats.batches_sent, 1);
        assert_eq!(stats.batches_dropped, 2);
    }
}
