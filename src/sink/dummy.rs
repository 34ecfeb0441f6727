use std::sync::Arc;

use anyhow::{bail, Result};
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::stats::{SinkStats, StatsCounters};
use super::{Sink, SinkType};
use crate::config::SinkConfig;
use crate::probe::AccountingEvent;

/// DummySink accepts every event and discards it, counting each one as
/// pushed and as a dropped batch. It measures what the pipeline can carry
/// without a backend in the way.
pub struct DummySink {
    cfg: Option<SinkConfig>,
    stats: Arc<StatsCounters>,
}

impl DummySink {
    pub fn new() -> Self {
        Self {
            cfg: None,
            stats: Arc::new(StatsCounters::new()),
        }
    }
}

impl Default for DummySink {
    fn default() -> Self {
        Self::new()
    }
}

impl Sink for DummySink {
    async fn init(&mut self, cfg: SinkConfig, _ctx: CancellationToken) -> Result<()> {
        if self.cfg.is_some() {
            bail!("sink '{}' is already initialized", cfg.name);
        }

        info!(sink = %cfg.name, sink_type = %SinkType::Dummy, "sink initialized");
        self.cfg = Some(cfg);

        Ok(())
    }

    fn push(&self, _event: &AccountingEvent) {
        self.stats.incr_events_pushed();
        self.stats.incr_batch_dropped();
    }

    fn name(&self) -> &str {
        self.cfg.as_ref().map_or("", |c| c.name.as_str())
    }

    fn is_init(&self) -> bool {
        self.cfg.is_some()
    }

    // Overrides are ignored: the dummy sink always wants everything.
    fn want_update(&self) -> bool {
        true
    }

    fn want_destroy(&self) -> bool {
        true
    }

    fn stats(&self) -> SinkStats {
        self.stats.snapshot()
    }
}
