pub mod consumer;
pub mod event;
pub mod parse;
pub mod sampling;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ProbeConfig;
use crate::source::{EventSource, SourceChannels};

pub use consumer::{Consumer, Delivery};
pub use event::{AccountingEvent, Counters, Direction, EventKind, FlowTuple};
pub use sampling::SamplingPolicy;

/// Capacity of the fatal error broadcast channel.
const ERROR_CHANNEL_CAPACITY: usize = 16;

/// Errors returned by probe lifecycle and registry operations, and published
/// on the fatal error channel.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProbeError {
    #[error("probe is already running")]
    AlreadyRunning,

    #[error("attaching event source: {0}")]
    Attach(String),

    #[error("consumer '{0}' is already registered")]
    DuplicateConsumer(String),

    #[error("consumer '{0}' is not registered")]
    ConsumerNotFound(String),

    #[error("event source failed: {0}")]
    Producer(String),
}

/// Lifecycle state of a [`Probe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeState {
    Stopped,
    Running,
    Stopping,
}

type Registry = Arc<RwLock<HashMap<String, Arc<Consumer>>>>;

/// Probe owns an event source and copies every event it produces to each
/// registered consumer.
///
/// Consumers may be registered and removed at any time, including while the
/// fan-out loop is delivering. A consumer only sees events produced after it
/// was registered.
pub struct Probe<S> {
    cfg: ProbeConfig,
    state: Mutex<ProbeState>,
    source: tokio::sync::Mutex<S>,
    consumers: Registry,
    errors: broadcast::Sender<ProbeError>,
    events_received: Arc<AtomicU64>,
    run: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl<S: EventSource> Probe<S> {
    /// Creates a stopped probe around `source`.
    pub fn new(cfg: ProbeConfig, source: S) -> Self {
        let (errors, _) = broadcast::channel(ERROR_CHANNEL_CAPACITY);

        Self {
            cfg,
            state: Mutex::new(ProbeState::Stopped),
            source: tokio::sync::Mutex::new(source),
            consumers: Arc::new(RwLock::new(HashMap::new())),
            errors,
            events_received: Arc::new(AtomicU64::new(0)),
            run: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ProbeConfig {
        &self.cfg
    }

    pub fn state(&self) -> ProbeState {
        *self.state.lock()
    }

    /// Total events read from the source since the probe was created.
    pub fn events_received(&self) -> u64 {
        self.events_received.load(Ordering::Relaxed)
    }

    /// Attaches the event source and starts the fan-out loop.
    ///
    /// On failure the probe stays stopped.
    pub async fn start(&self) -> Result<(), ProbeError> {
        // The source lock serializes start and stop.
        let mut source = self.source.lock().await;

        if *self.state.lock() != ProbeState::Stopped {
            return Err(ProbeError::AlreadyRunning);
        }

        let ctx = CancellationToken::new();
        let policy = SamplingPolicy::new(self.cfg.cooldown);

        let channels = source
            .attach(policy, ctx.child_token())
            .await
            .map_err(|e| ProbeError::Attach(format!("{e:#}")))?;

        let handle = tokio::spawn(fan_out(
            channels,
            Arc::clone(&self.consumers),
            self.errors.clone(),
            Arc::clone(&self.events_received),
            ctx.clone(),
        ));

        *self.run.lock() = Some((ctx, handle));
        *self.state.lock() = ProbeState::Running;

        info!(
            source = source.name(),
            cooldown = ?self.cfg.cooldown,
            consumers = self.consumers.read().len(),
            "probe started",
        );

        Ok(())
    }

    /// Stops the fan-out loop, detaches the source and closes every
    /// registered consumer. Calling it on a stopped probe does nothing.
    pub async fn stop(&self) {
        let mut source = self.source.lock().await;

        {
            let mut state = self.state.lock();
            if *state != ProbeState::Running {
                return;
            }
            *state = ProbeState::Stopping;
        }

        let run = self.run.lock().take();
        if let Some((ctx, handle)) = run {
            ctx.cancel();
            if let Err(e) = handle.await {
                error!(error = %e, "fan-out task failed");
            }
        }

        if let Err(e) = source.detach().await {
            warn!(source = source.name(), error = %format!("{e:#}"), "detaching event source");
        }

        let closed: Vec<Arc<Consumer>> = self.consumers.write().drain().map(|(_, c)| c).collect();
        for consumer in &closed {
            consumer.close();
        }

        *self.state.lock() = ProbeState::Stopped;

        info!(closed_consumers = closed.len(), "probe stopped");
    }

    /// Adds a consumer. It receives every event produced from now on.
    pub fn register_consumer(&self, consumer: Arc<Consumer>) -> Result<(), ProbeError> {
        let mut consumers = self.consumers.write();

        if consumers.contains_key(consumer.name()) {
            return Err(ProbeError::DuplicateConsumer(consumer.name().to_string()));
        }

        debug!(consumer = consumer.name(), "consumer registered");
        consumers.insert(consumer.name().to_string(), consumer);

        Ok(())
    }

    /// Removes and closes a consumer. After this returns the consumer
    /// receives no further events.
    pub fn remove_consumer(&self, consumer: &Consumer) -> Result<(), ProbeError> {
        let removed = self.consumers.write().remove(consumer.name());

        match removed {
            Some(c) => {
                c.close();
                debug!(consumer = c.name(), "consumer removed");
                Ok(())
            }
            None => Err(ProbeError::ConsumerNotFound(consumer.name().to_string())),
        }
    }

    /// Snapshot of the currently registered consumers.
    pub fn consumers(&self) -> Vec<Arc<Consumer>> {
        self.consumers.read().values().cloned().collect()
    }

    /// Subscribes to fatal errors of the underlying event source.
    ///
    /// The probe does not recover from these; the caller decides whether to
    /// stop.
    pub fn err_chan(&self) -> broadcast::Receiver<ProbeError> {
        self.errors.subscribe()
    }
}

async fn fan_out(
    mut channels: SourceChannels,
    consumers: Registry,
    errors: broadcast::Sender<ProbeError>,
    events_received: Arc<AtomicU64>,
    ctx: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;

            _ = ctx.cancelled() => return,

            event = channels.events.recv() => {
                let Some(event) = event else {
                    if !ctx.is_cancelled() {
                        publish(&errors, ProbeError::Producer("event stream closed".to_string()));
                    }
                    return;
                };

                events_received.fetch_add(1, Ordering::Relaxed);
                dispatch(&consumers, event);
            }

            Some(err) = channels.errors.recv() => {
                publish(&errors, ProbeError::Producer(format!("{err:#}")));
            }
        }
    }
}

/// Hands a copy of `event` to every registered consumer without waiting.
fn dispatch(consumers: &Registry, event: AccountingEvent) {
    // The registry lock is never held across a send.
    let targets: Vec<Arc<Consumer>> = consumers.read().values().cloned().collect();

    for consumer in &targets {
        match consumer.deliver(event.clone()) {
            Delivery::Sent => {}
            Delivery::Full => {
                if consumer.should_log_overflow(Instant::now()) {
                    warn!(
                        consumer = consumer.name(),
                        dropped = consumer.dropped(),
                        "consumer channel full, dropping events",
                    );
                }
            }
            Delivery::Closed => {
                if consumer.should_log_overflow(Instant::now()) {
                    debug!(consumer = consumer.name(), "consumer reader gone, dropping events");
                }
            }
        }
    }
}

fn publish(errors: &broadcast::Sender<ProbeError>, err: ProbeError) {
    error!(error = %err, "fatal probe error");
    // No subscribers is fine; the error is logged either way.
    let _ = errors.send(err);
}
