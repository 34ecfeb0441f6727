pub mod batch;
pub mod dummy;
pub mod elastic;
mod http;
pub mod influx;
pub mod pump;
pub mod stats;
pub mod stdio;

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use anyhow::{bail, Result};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::SinkConfig;
use crate::probe::{AccountingEvent, EventKind};

use self::batch::{BatchOptions, BatchWriter, Batcher};
use self::dummy::DummySink;
use self::elastic::ElasticWriter;
use self::influx::{InfluxHttpWriter, InfluxUdpWriter};
use self::stats::StatsCounters;
use self::stdio::StdioWriter;

pub use self::stats::SinkStats;

/// Kind of backend a sink writes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkType {
    #[serde(rename = "stdio")]
    StdIo,
    InfluxUdp,
    InfluxHttp,
    Elastic,
    /// Discards everything; for exercising the pipeline without a backend.
    Dummy,
}

impl SinkType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::StdIo => "stdio",
            Self::InfluxUdp => "influx_udp",
            Self::InfluxHttp => "influx_http",
            Self::Elastic => "elastic",
            Self::Dummy => "dummy",
        }
    }

    /// Whether sinks of this type receive Updates unless configured otherwise.
    /// Document stores only keep flow totals.
    pub const fn default_want_update(self) -> bool {
        !matches!(self, Self::Elastic)
    }

    pub const fn default_want_destroy(self) -> bool {
        true
    }

    /// Whether the type talks to a network backend.
    pub const fn needs_address(self) -> bool {
        matches!(self, Self::InfluxUdp | Self::InfluxHttp | Self::Elastic)
    }
}

impl fmt::Display for SinkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sink consumes accounting events and forwards them to a backend.
pub trait Sink: Send + Sync {
    /// One-time setup. Fails if the backend cannot be reached or the sink
    /// was already initialized. Cancelling `ctx` flushes and stops the sink.
    fn init(
        &mut self,
        cfg: SinkConfig,
        ctx: CancellationToken,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Ingests one event. Never blocks on the backend and never fails.
    fn push(&self, event: &AccountingEvent);

    /// Returns the sink's name for logging.
    fn name(&self) -> &str;

    fn is_init(&self) -> bool;

    fn want_update(&self) -> bool;

    fn want_destroy(&self) -> bool;

    fn stats(&self) -> SinkStats;

    /// Whether events of `kind` should be pushed to this sink.
    fn wants(&self, kind: EventKind) -> bool {
        match kind {
            EventKind::Update => self.want_update(),
            EventKind::Destroy => self.want_destroy(),
        }
    }
}

/// Backend is a [`BatchWriter`] that can be built from a sink configuration.
pub trait Backend: BatchWriter + Sized {
    fn connect(cfg: &SinkConfig) -> impl Future<Output = Result<Self>> + Send;
}

/// Sink that runs its backend behind the batching runtime.
pub struct BatchingSink<W: Backend> {
    cfg: Option<SinkConfig>,
    batcher: Option<Batcher<W>>,
    stats: Arc<StatsCounters>,
    default_type: SinkType,
}

impl<W: Backend> BatchingSink<W> {
    pub fn new(sink_type: SinkType) -> Self {
        Self {
            cfg: None,
            batcher: None,
            stats: Arc::new(StatsCounters::new()),
            default_type: sink_type,
        }
    }

    /// Starts the batching runtime around an already built writer.
    pub fn init_with(&mut self, cfg: SinkConfig, writer: W, ctx: CancellationToken) -> Result<()> {
        if self.batcher.is_some() {
            bail!("sink '{}' is already initialized", cfg.name);
        }

        let batcher = Batcher::start(
            cfg.name.clone(),
            writer,
            BatchOptions::from(&cfg),
            Arc::clone(&self.stats),
            ctx,
        );

        info!(
            sink = %cfg.name,
            sink_type = %cfg.sink_type,
            flush_interval = ?cfg.flush_interval,
            batch_size = cfg.batch_size,
            queue_size = cfg.queue_size,
            want_update = cfg.want_update(),
            want_destroy = cfg.want_destroy(),
            "sink initialized",
        );

        self.batcher = Some(batcher);
        self.cfg = Some(cfg);

        Ok(())
    }

    /// Waits for the batching workers to finish their final flush.
    pub async fn wait_for_shutdown(&self) {
        if let Some(batcher) = &self.batcher {
            batcher.wait_for_shutdown().await;
        }
    }
}

impl<W: Backend> Sink for BatchingSink<W> {
    async fn init(&mut self, cfg: SinkConfig, ctx: CancellationToken) -> Result<()> {
        if self.batcher.is_some() {
            bail!("sink '{}' is already initialized", cfg.name);
        }

        let writer = W::connect(&cfg).await?;
        self.init_with(cfg, writer, ctx)
    }

    fn push(&self, event: &AccountingEvent) {
        match &self.batcher {
            Some(batcher) => batcher.push(event),
            None => {
                self.stats.incr_events_pushed();
                self.stats.incr_batch_dropped();
            }
        }
    }

    fn name(&self) -> &str {
        self.cfg.as_ref().map_or("", |c| c.name.as_str())
    }

    fn is_init(&self) -> bool {
        self.batcher.is_some()
    }

    fn want_update(&self) -> bool {
        self.cfg
            .as_ref()
            .map_or(self.default_type.default_want_update(), SinkConfig::want_update)
    }

    fn want_destroy(&self) -> bool {
        self.cfg
            .as_ref()
            .map_or(self.default_type.default_want_destroy(), SinkConfig::want_destroy)
    }

    fn stats(&self) -> SinkStats {
        self.stats.snapshot()
    }
}

/// AnySink dispatches to one of the supported sink implementations.
///
/// Uses enum dispatch rather than trait objects, so `init` stays a plain
/// async call.
pub enum AnySink {
    StdIo(BatchingSink<StdioWriter>),
    InfluxUdp(BatchingSink<InfluxUdpWriter>),
    InfluxHttp(BatchingSink<InfluxHttpWriter>),
    Elastic(BatchingSink<ElasticWriter>),
    Dummy(DummySink),
}

impl AnySink {
    /// Creates an uninitialized sink of the given type.
    pub fn new(sink_type: SinkType) -> Self {
        match sink_type {
            SinkType::StdIo => Self::StdIo(BatchingSink::new(sink_type)),
            SinkType::InfluxUdp => Self::InfluxUdp(BatchingSink::new(sink_type)),
            SinkType::InfluxHttp => Self::InfluxHttp(BatchingSink::new(sink_type)),
            SinkType::Elastic => Self::Elastic(BatchingSink::new(sink_type)),
            SinkType::Dummy => Self::Dummy(DummySink::new()),
        }
    }

    pub fn sink_type(&self) -> SinkType {
        match self {
            Self::StdIo(_) => SinkType::StdIo,
            Self::InfluxUdp(_) => SinkType::InfluxUdp,
            Self::InfluxHttp(_) => SinkType::InfluxHttp,
            Self::Elastic(_) => SinkType::Elastic,
            Self::Dummy(_) => SinkType::Dummy,
        }
    }

    /// Waits for a cancelled sink to finish delivering what it holds.
    pub async fn wait_for_shutdown(&self) {
        match self {
            Self::StdIo(s) => s.wait_for_shutdown().await,
            Self::InfluxUdp(s) => s.wait_for_shutdown().await,
            Self::InfluxHttp(s) => s.wait_for_shutdown().await,
            Self::Elastic(s) => s.wait_for_shutdown().await,
            Self::Dummy(_) => {}
        }
    }
}

impl Sink for AnySink {
    async fn init(&mut self, cfg: SinkConfig, ctx: CancellationToken) -> Result<()> {
        if cfg.sink_type != self.sink_type() {
            bail!(
                "sink '{}' is configured as {} but was created as {}",
                cfg.name,
                cfg.sink_type,
                self.sink_type()
            );
        }

        match self {
            Self::StdIo(s) => s.init(cfg, ctx).await,
            Self::InfluxUdp(s) => s.init(cfg, ctx).await,
            Self::InfluxHttp(s) => s.init(cfg, ctx).await,
            Self::Elastic(s) => s.init(cfg, ctx).await,
            Self::Dummy(s) => s.init(cfg, ctx).await,
        }
    }

    fn push(&self, event: &AccountingEvent) {
        match self {
            Self::StdIo(s) => s.push(event),
            Self::InfluxUdp(s) => s.push(event),
            Self::InfluxHttp(s) => s.push(event),
            Self::Elastic(s) => s.push(event),
            Self::Dummy(s) => s.push(event),
        }
    }

    fn name(&self) -> &str {
        match self {
            Self::StdIo(s) => s.name(),
            Self::InfluxUdp(s) => s.name(),
            Self::InfluxHttp(s) => s.name(),
            Self::Elastic(s) => s.name(),
            Self::Dummy(s) => s.name(),
        }
    }

    fn is_init(&self) -> bool {
        match self {
            Self::StdIo(s) => s.is_init(),
            Self::InfluxUdp(s) => s.is_init(),
            Self::InfluxHttp(s) => s.is_init(),
            Self::Elastic(s) => s.is_init(),
            Self::Dummy(s) => s.is_init(),
        }
    }

    fn want_update(&self) -> bool {
        match self {
            Self::StdIo(s) => s.want_update(),
            Self::InfluxUdp(s) => s.want_update(),
            Self::InfluxHttp(s) => s.want_update(),
            Self::Elastic(s) => s.want_update(),
            Self::Dummy(s) => s.want_update(),
        }
    }

    fn want_destroy(&self) -> bool {
        match self {
            Self::StdIo(s) => s.want_destroy(),
            Self::InfluxUdp(s) => s.want_destroy(),
            Self::InfluxHttp(s) => s.want_destroy(),
            Self::Elastic(s) => s.want_destroy(),
            Self::Dummy(s) => s.want_destroy(),
        }
    }

    fn stats(&self) -> SinkStats {
        match self {
            Self::StdIo(s) => s.stats(),
            Self::InfluxUdp(s) => s.stats(),
            Self::InfluxHttp(s) => s.stats(),
            Self::Elastic(s) => s.stats(),
            Self::Dummy(s) => s.stats(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sink_type_names() {
        assert_eq!(SinkType::StdIo.to_string(), "stdio");
        assert_eq!(SinkType::InfluxHttp.to_string(), "influx_http");

        let parsed: SinkType = serde_yaml::from_str("stdio").expect("parse");
        assert_eq!(parsed, SinkType::StdIo);
        let parsed: SinkType = serde_yaml::from_str("influx_udp").expect("parse");
        assert_eq!(parsed, SinkType::InfluxUdp);
    }

    #[test]
    fn test_default_interest_before_init() {
        let es = AnySink::new(SinkType::Elastic);
        assert!(!es.is_init());
        assert!(!es.want_update());
        assert!(es.want_destroy());
        assert!(!es.wants(EventKind::Update));

        let dummy = AnySink::new(SinkType::Dummy);
        assert!(dummy.wants(EventKind::Update));
        assert!(dummy.wants(EventKind::Destroy));
    }

    #[tokio::test]
    async fn test_init_rejects_mismatched_type() {
        let mut sink = AnySink::new(SinkType::Dummy);
        let cfg = SinkConfig::new("x", SinkType::StdIo);
        let err = sink
            .init(cfg, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("configured as stdio"));
        assert!(!sink.is_init());
    }

    #[tokio::test(start_paused = true)]
    async fn test_batching_sink_push_before_init_is_dropped() {
        let sink: BatchingSink<StdioWriter> = BatchingSink::new(SinkType::StdIo);
        let ev = crate::probe::AccountingEvent {
            kind: EventKind::Destroy,
            tuple: crate::probe::FlowTuple {
                proto: 6,
                src_addr: std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST),
                dst_addr: std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST),
                src_port: 1,
                dst_port: 2,
            },
            counters: Default::default(),
            netns: 0,
            connmark: 0,
            timestamp: std::time::SystemTime::UNIX_EPOCH,
        };

        sink.push(&ev);

        let stats = sink.stats();
        assert_eq!(stats.events_pushed, 1);
        assert_eq!(stats.batches_dropped, 1);
        assert_eq!(stats.batches_sent, 0);
    }
}
