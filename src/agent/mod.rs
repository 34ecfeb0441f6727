use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::export::health::HealthMetrics;
use crate::probe::{Consumer, Probe};
use crate::sink::pump::spawn_pump;
use crate::sink::{AnySink, Sink, SinkStats};
use crate::source::AnySource;

/// Agent wires the pipeline together: event source, probe, one consumer and
/// pump per sink, the sinks themselves and the health server.
pub struct Agent {
    cfg: Config,
    health: Arc<HealthMetrics>,
    probe: Arc<Probe<AnySource>>,
    sinks: Vec<Arc<AnySink>>,
    consumers: Vec<Arc<Consumer>>,
    pumps: Vec<JoinHandle<()>>,
    reporter: Option<JoinHandle<StatsReporter>>,
    /// Stops the agent's background tasks.
    cancel: CancellationToken,
    /// Flushes and stops the sinks. Cancelled only after the pumps drain.
    sink_cancel: CancellationToken,
    /// Cancelled when the probe reports a fatal error.
    fatal: CancellationToken,
}

impl Agent {
    /// Creates a new Agent, initializing health metrics.
    pub fn new(cfg: Config) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);
        let probe = Arc::new(Probe::new(
            cfg.probe.clone(),
            AnySource::from_config(&cfg.source),
        ));

        Ok(Self {
            cfg,
            health,
            probe,
            sinks: Vec::new(),
            consumers: Vec::new(),
            pumps: Vec::new(),
            reporter: None,
            cancel: CancellationToken::new(),
            sink_cancel: CancellationToken::new(),
            fatal: CancellationToken::new(),
        })
    }

    pub fn probe(&self) -> &Arc<Probe<AnySource>> {
        &self.probe
    }

    pub fn sinks(&self) -> &[Arc<AnySink>] {
        &self.sinks
    }

    /// Token cancelled once the probe has reported a fatal error.
    pub fn fatal_token(&self) -> CancellationToken {
        self.fatal.clone()
    }

    /// Start all components and begin accounting.
    pub async fn start(&mut self) -> Result<()> {
        // 1. Health server first so probes respond during startup.
        self.health
            .start()
            .await
            .context("starting health metrics server")?;

        // 2. Sinks, each behind its own consumer and pump.
        for sink_cfg in &self.cfg.sinks {
            let mut sink = AnySink::new(sink_cfg.sink_type);
            sink.init(sink_cfg.clone(), self.sink_cancel.child_token())
                .await
                .with_context(|| format!("initializing sink '{}'", sink_cfg.name))?;
            let sink = Arc::new(sink);

            let (consumer, rx) =
                Consumer::with_capacity(sink_cfg.name.clone(), self.cfg.probe.consumer_buffer);
            self.probe
                .register_consumer(Arc::clone(&consumer))
                .context("registering consumer")?;

            self.pumps.push(spawn_pump(Arc::clone(&sink), rx));
            self.consumers.push(consumer);
            self.sinks.push(sink);
        }
        self.health
            .consumers_registered
            .set(self.consumers.len() as f64);

        // 3. Subscribe before starting so no fatal error is missed.
        let errors = self.probe.err_chan();
        self.probe.start().await.context("starting probe")?;
        self.health.probe_running.set(1.0);

        self.spawn_fatal_watcher(errors);
        self.spawn_stats_reporter();

        info!(
            sinks = self.sinks.len(),
            source = ?self.cfg.source.kind,
            "agent fully started",
        );

        Ok(())
    }

    /// Gracefully stop all components.
    ///
    /// The probe stops first, which closes every consumer; the pumps then
    /// drain what is buffered before the sinks get their final flush.
    pub async fn stop(&mut self) -> Result<()> {
        // Signal all background tasks to stop.
        self.cancel.cancel();

        self.probe.stop().await;
        self.health.probe_running.set(0.0);
        self.health.consumers_registered.set(0.0);

        // A probe that never started still holds the registrations, and the
        // pumps only exit once their consumer is closed.
        for consumer in &self.consumers {
            let _ = self.probe.remove_consumer(consumer);
            consumer.close();
        }

        for pump in self.pumps.drain(..) {
            if let Err(e) = pump.await {
                error!(error = %e, "sink pump failed");
            }
        }

        self.sink_cancel.cancel();
        for sink in &self.sinks {
            sink.wait_for_shutdown().await;
        }

        // Final report covers what was flushed during shutdown.
        if let Some(reporter) = self.reporter.take() {
            match reporter.await {
                Ok(mut reporter) => reporter.report(&self.probe, &self.sinks, &self.consumers),
                Err(e) => error!(error = %e, "stats reporter failed"),
            }
        }

        // Stop health metrics server.
        self.health.stop().await?;

        info!("agent stopped");

        Ok(())
    }

    /// Spawn a watcher that turns the first fatal probe error into a
    /// shutdown request.
    fn spawn_fatal_watcher(&self, mut errors: broadcast::Receiver<crate::probe::ProbeError>) {
        let cancel = self.cancel.clone();
        let fatal = self.fatal.clone();
        let health = Arc::clone(&self.health);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    result = errors.recv() => match result {
                        Ok(err) => {
                            health.fatal_errors.inc();
                            error!(error = %err, "fatal probe error, shutting down");
                            fatal.cancel();
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            health.fatal_errors.inc_by(n as f64);
                            warn!(missed = n, "fatal error watcher lagged");
                            fatal.cancel();
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    },
                }
            }
        });
    }

    /// Spawn background stats reporter.
    fn spawn_stats_reporter(&mut self) {
        let cancel = self.cancel.clone();
        let probe = Arc::clone(&self.probe);
        let sinks = self.sinks.clone();
        let consumers = self.consumers.clone();
        let mut reporter = StatsReporter::new(Arc::clone(&self.health));
        let interval = self.cfg.stats_interval;

        self.reporter = Some(tokio::spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return reporter,
                    _ = ticker.tick() => reporter.report(&probe, &sinks, &consumers),
                }
            }
        }));
    }
}

/// Logs pipeline counters and mirrors them into Prometheus.
///
/// The probe, consumers and sinks keep monotonic counters; the reporter
/// remembers the last values it saw and advances the Prometheus counters by
/// the difference.
struct StatsReporter {
    health: Arc<HealthMetrics>,
    events_received: u64,
    consumer_drops: HashMap<String, u64>,
    sink_stats: HashMap<String, SinkStats>,
}

impl StatsReporter {
    fn new(health: Arc<HealthMetrics>) -> Self {
        Self {
            health,
            events_received: 0,
            consumer_drops: HashMap::new(),
            sink_stats: HashMap::new(),
        }
    }

    fn report(
        &mut self,
        probe: &Probe<AnySource>,
        sinks: &[Arc<AnySink>],
        consumers: &[Arc<Consumer>],
    ) {
        let received = probe.events_received();
        let delta = received.saturating_sub(self.events_received);
        self.events_received = received;
        self.health.events_received.inc_by(delta as f64);

        info!(received, delta, "event stats");

        for consumer in consumers {
            let dropped = consumer.dropped();
            let last = self
                .consumer_drops
                .insert(consumer.name().to_string(), dropped)
                .unwrap_or(0);
            let delta = dropped.saturating_sub(last);

            if delta > 0 {
                self.health
                    .consumer_events_dropped
                    .with_label_values(&[consumer.name()])
                    .inc_by(delta as f64);
                warn!(consumer = consumer.name(), dropped, delta, "consumer dropped events");
            }
        }

        for sink in sinks {
            let stats = sink.stats();
            let last = self
                .sink_stats
                .insert(sink.name().to_string(), stats)
                .unwrap_or_default();
            let delta = stats.delta_since(&last);

            let labels = [sink.name()];
            self.health
                .sink_events_pushed
                .with_label_values(&labels)
                .inc_by(delta.events_pushed as f64);
            self.health
                .sink_batches_sent
                .with_label_values(&labels)
                .inc_by(delta.batches_sent as f64);
            self.health
                .sink_batches_dropped
                .with_label_values(&labels)
                .inc_by(delta.batches_dropped as f64);

            info!(
                sink = sink.name(),
                sink_type = %sink.sink_type(),
                events_pushed = stats.events_pushed,
                batches_sent = stats.batches_sent,
                batches_dropped = stats.batches_dropped,
                "sink stats",
            );
            debug!(
                sink = sink.name(),
                events_pushed = delta.events_pushed,
                batches_sent = delta.batches_sent,
                batches_dropped = delta.batches_dropped,
                "  since last report",
            );
        }
    }
}
