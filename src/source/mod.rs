//! Producers of accounting events.
//!
//! An [`EventSource`] plays the role of the kernel-side instrumentation: once
//! attached it delivers decoded events on one channel and fatal errors on
//! another, and it applies the sampling policy handed to it by the probe.

pub mod flow;
pub mod replay;
pub mod synthetic;

use std::future::Future;

use anyhow::{bail, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::{SourceConfig, SourceKind};
use crate::probe::{AccountingEvent, SamplingPolicy};

pub use flow::{FlowTable, Packet};
pub use replay::ReplaySource;
pub use synthetic::SyntheticSource;

/// Channels handed to the probe when a source is attached.
pub struct SourceChannels {
    /// Decoded accounting events.
    pub events: mpsc::Receiver<AccountingEvent>,
    /// Fatal producer errors.
    pub errors: mpsc::Receiver<anyhow::Error>,
}

/// EventSource is the boundary between the probe and whatever produces raw
/// accounting events.
pub trait EventSource: Send + 'static {
    /// Returns the source's name for logging.
    fn name(&self) -> &str;

    /// Starts producing events. Production stops when `ctx` is cancelled.
    fn attach(
        &mut self,
        policy: SamplingPolicy,
        ctx: CancellationToken,
    ) -> impl Future<Output = Result<SourceChannels>> + Send;

    /// Releases everything acquired by `attach`.
    fn detach(&mut self) -> impl Future<Output = Result<()>> + Send;
}

/// Source backed by caller-held channel senders.
///
/// Useful for embedding the probe behind an existing producer. The channels
/// can be attached once; a second attach fails.
pub struct ChannelSource {
    pending: Option<SourceChannels>,
}

impl ChannelSource {
    /// Creates the source along with the senders that feed it.
    pub fn new(
        capacity: usize,
    ) -> (
        Self,
        mpsc::Sender<AccountingEvent>,
        mpsc::Sender<anyhow::Error>,
    ) {
        let (event_tx, event_rx) = mpsc::channel(capacity.max(1));
        let (error_tx, error_rx) = mpsc::channel(1);

        let source = Self {
            pending: Some(SourceChannels {
                events: event_rx,
                errors: error_rx,
            }),
        };

        (source, event_tx, error_tx)
    }
}

impl EventSource for ChannelSource {
    fn name(&self) -> &str {
        "channel"
    }

    async fn attach(
        &mut self,
        _policy: SamplingPolicy,
        _ctx: CancellationToken,
    ) -> Result<SourceChannels> {
        match self.pending.take() {
            Some(channels) => Ok(channels),
            None => bail!("channel source was already attached"),
        }
    }

    async fn detach(&mut self) -> Result<()> {
        Ok(())
    }
}

/// AnySource dispatches to the configured source implementation.
pub enum AnySource {
    Synthetic(SyntheticSource),
    Replay(ReplaySource),
}

impl AnySource {
    /// Builds the source described by `cfg`.
    pub fn from_config(cfg: &SourceConfig) -> Self {
        match cfg.kind {
            SourceKind::Synthetic => Self::Synthetic(SyntheticSource::new(cfg.synthetic())),
            SourceKind::Replay => Self::Replay(ReplaySource::new(cfg.path.clone())),
        }
    }
}

impl EventSource for AnySource {
    fn name(&self) -> &str {
        match self {
            Self::Synthetic(s) => s.name(),
            Self::Replay(s) => s.name(),
        }
    }

    async fn attach(
        &mut self,
        policy: SamplingPolicy,
        ctx: CancellationToken,
    ) -> Result<SourceChannels> {
        match self {
            Self::Synthetic(s) => s.attach(policy, ctx).await,
            Self::Replay(s) => s.attach(policy, ctx).await,
        }
    }

    async fn detach(&mut self) -> Result<()> {
        match self {
            Self::Synthetic(s) => s.detach().await,
            Self::Replay(s) => s.detach().await,
        }
    }
}
