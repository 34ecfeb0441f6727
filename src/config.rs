use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::sink::SinkType;

/// Smallest UDP payload a line protocol datagram may be limited to.
pub const MIN_UDP_PAYLOAD_SIZE: usize = 64;

/// Top-level configuration for the conntracct collector.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    /// The command line flag takes precedence.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Probe configuration.
    #[serde(default)]
    pub probe: ProbeConfig,

    /// Event source configuration.
    #[serde(default)]
    pub source: SourceConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,

    /// How often sink and consumer statistics are logged and exported.
    /// Default: 60s.
    #[serde(default = "default_stats_interval", with = "humantime_serde")]
    pub stats_interval: Duration,

    /// Output sinks. Each gets its own consumer on the probe.
    #[serde(default)]
    pub sinks: Vec<SinkConfig>,
}

/// Probe configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ProbeConfig {
    /// Minimum time between two steady-state Updates for one flow.
    /// Default: 2s.
    #[serde(default = "default_cooldown", with = "humantime_serde")]
    pub cooldown: Duration,

    /// Capacity of each consumer's event channel. Default: 2048.
    #[serde(default = "default_consumer_buffer")]
    pub consumer_buffer: usize,
}

/// Which producer feeds the probe.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Generated loopback flows.
    #[default]
    Synthetic,
    /// Raw accounting records read from a file.
    Replay,
}

/// Event source configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    #[serde(default)]
    pub kind: SourceKind,

    /// Synthetic: number of concurrent flows. Default: 64.
    #[serde(default = "default_flows")]
    pub flows: usize,

    /// Synthetic: time between two packets of a flow. Default: 10ms.
    #[serde(default = "default_packet_interval", with = "humantime_serde")]
    pub packet_interval: Duration,

    /// Synthetic: packets after which a flow is torn down, 0 for never.
    /// Default: 200.
    #[serde(default = "default_flow_packets")]
    pub flow_packets: u64,

    /// Replay: file of raw accounting records.
    #[serde(default)]
    pub path: PathBuf,
}

/// Settings of the synthetic flow generator.
#[derive(Debug, Clone)]
pub struct SyntheticConfig {
    pub flows: usize,
    pub packet_interval: Duration,
    pub flow_packets: u64,
}

/// Request body compression for HTTP sinks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    None,
    Gzip,
}

impl Compression {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Gzip => "gzip",
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Overrides which event kinds a sink receives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct EventInterest {
    #[serde(default)]
    pub update: Option<bool>,
    #[serde(default)]
    pub destroy: Option<bool>,
}

/// Configuration of one sink, captured when the sink is initialized.
#[derive(Debug, Clone, Deserialize)]
pub struct SinkConfig {
    /// Unique sink name, also used as the consumer name.
    pub name: String,

    #[serde(rename = "type")]
    pub sink_type: SinkType,

    /// Backend address: host:port for UDP, base URL for HTTP sinks,
    /// "stdout" or "stderr" for stdio.
    #[serde(default)]
    pub address: String,

    /// Influx database.
    #[serde(default)]
    pub database: String,

    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub password: String,

    /// Elasticsearch index. Default: "conntracct".
    #[serde(default = "default_index")]
    pub index: String,

    /// Period of the time-based batch flush. Default: 1s.
    #[serde(default = "default_flush_interval", with = "humantime_serde")]
    pub flush_interval: Duration,

    /// Points per batch that trigger an early flush, 0 to disable.
    /// Default: 5000.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Closed batches that may wait for delivery. Default: 16.
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,

    /// Maximum UDP datagram payload. Default: 512.
    #[serde(default = "default_udp_payload_size")]
    pub udp_payload_size: usize,

    #[serde(default)]
    pub compression: Compression,

    /// Backend request timeout. Default: 10s.
    #[serde(default = "default_sink_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Per-kind overrides of the sink type's default event interest.
    #[serde(default)]
    pub events: EventInterest,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_stats_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_cooldown() -> Duration {
    Duration::from_secs(2)
}

fn default_consumer_buffer() -> usize {
    2048
}

fn default_flows() -> usize {
    64
}

fn default_packet_interval() -> Duration {
    Duration::from_millis(10)
}

fn default_flow_packets() -> u64 {
    200
}

fn default_index() -> String {
    "conntracct".to_string()
}

fn default_flush_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_batch_size() -> usize {
    5000
}

fn default_queue_size() -> usize {
    16
}

fn default_udp_payload_size() -> usize {
    512
}

fn default_sink_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            probe: ProbeConfig::default(),
            source: SourceConfig::default(),
            health: HealthConfig::default(),
            stats_interval: default_stats_interval(),
            sinks: Vec::new(),
        }
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            cooldown: default_cooldown(),
            consumer_buffer: default_consumer_buffer(),
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            kind: SourceKind::default(),
            flows: default_flows(),
            packet_interval: default_packet_interval(),
            flow_packets: default_flow_packets(),
            path: PathBuf::new(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

impl SourceConfig {
    /// Settings for the synthetic generator.
    pub fn synthetic(&self) -> SyntheticConfig {
        SyntheticConfig {
            flows: self.flows,
            packet_interval: self.packet_interval,
            flow_packets: self.flow_packets,
        }
    }
}

impl SinkConfig {
    /// A sink of the given type with every other field at its default.
    pub fn new(name: impl Into<String>, sink_type: SinkType) -> Self {
        Self {
            name: name.into(),
            sink_type,
            address: String::new(),
            database: String::new(),
            username: String::new(),
            password: String::new(),
            index: default_index(),
            flush_interval: default_flush_interval(),
            batch_size: default_batch_size(),
            queue_size: default_queue_size(),
            udp_payload_size: default_udp_payload_size(),
            compression: Compression::default(),
            timeout: default_sink_timeout(),
            events: EventInterest::default(),
        }
    }

    /// Whether the sink receives Update events.
    pub fn want_update(&self) -> bool {
        self.events
            .update
            .unwrap_or_else(|| self.sink_type.default_want_update())
    }

    /// Whether the sink receives Destroy events.
    pub fn want_destroy(&self) -> bool {
        self.events
            .destroy
            .unwrap_or_else(|| self.sink_type.default_want_destroy())
    }

    /// Validate one sink's settings.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            bail!("sink name is required");
        }

        if self.sink_type.needs_address() && self.address.is_empty() {
            bail!("sink '{}': address is required for {}", self.name, self.sink_type);
        }

        if self.sink_type == SinkType::InfluxHttp && self.database.is_empty() {
            bail!("sink '{}': database is required for influx_http", self.name);
        }

        if self.flush_interval.is_zero() {
            bail!("sink '{}': flush_interval must be positive", self.name);
        }

        if self.queue_size == 0 {
            bail!("sink '{}': queue_size must be positive", self.name);
        }

        if self.udp_payload_size < MIN_UDP_PAYLOAD_SIZE {
            bail!(
                "sink '{}': udp_payload_size must be at least {MIN_UDP_PAYLOAD_SIZE}",
                self.name
            );
        }

        if self.sink_type == SinkType::Elastic && self.index.is_empty() {
            bail!("sink '{}': index is required for elastic", self.name);
        }

        Ok(())
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.probe.cooldown.is_zero() {
            bail!("probe.cooldown must be positive");
        }

        if self.probe.consumer_buffer == 0 {
            bail!("probe.consumer_buffer must be positive");
        }

        if self.stats_interval.is_zero() {
            bail!("stats_interval must be positive");
        }

        match self.source.kind {
            SourceKind::Synthetic => {
                if self.source.packet_interval.is_zero() {
                    bail!("source.packet_interval must be positive");
                }
            }
            SourceKind::Replay => {
                if self.source.path.as_os_str().is_empty() {
                    bail!("source.path is required for the replay source");
                }
            }
        }

        if self.sinks.is_empty() {
            bail!("at least one sink must be configured");
        }

        let mut names = HashSet::with_capacity(self.sinks.len());
        for sink in &self.sinks {
            sink.validate()?;

            if !names.insert(sink.name.as_str()) {
                bail!("duplicate sink name: {}", sink.name);
            }
        }

        Ok(())
    }
}
