use std::net::{IpAddr, Ipv4Addr};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::flow::{FlowTable, Packet};
use super::{EventSource, SourceChannels};
use crate::config::SyntheticConfig;
use crate::probe::{AccountingEvent, Direction, FlowTuple, SamplingPolicy};

/// Depth of the channel between the generator and the probe.
const EVENT_CHANNEL_CAPACITY: usize = 4096;

/// Namespace inode reported for generated flows (the usual init netns).
pub const SYNTHETIC_NETNS: u64 = 4026531992;

const DST_PORT: u16 = 1342;
const FIRST_SRC_PORT: u16 = 32768;
const LAST_SRC_PORT: u16 = 60999;

const ORIG_PACKET_BYTES: u64 = 31;
const REPLY_PACKET_BYTES: u64 = 64;

/// SyntheticSource generates UDP flows on loopback and runs every packet
/// through a [`FlowTable`], producing the same event stream the kernel hook
/// would for that traffic.
pub struct SyntheticSource {
    cfg: SyntheticConfig,
    task: Option<JoinHandle<()>>,
}

impl SyntheticSource {
    pub fn new(cfg: SyntheticConfig) -> Self {
        Self { cfg, task: None }
    }
}

impl EventSource for SyntheticSource {
    fn name(&self) -> &str {
        "synthetic"
    }

    async fn attach(
        &mut self,
        policy: SamplingPolicy,
        ctx: CancellationToken,
    ) -> Result<SourceChannels> {
        if self.task.is_some() {
            bail!("synthetic source is already attached");
        }
        if self.cfg.packet_interval.is_zero() {
            bail!("synthetic packet_interval must be positive");
        }

        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (error_tx, error_rx) = mpsc::channel(1);

        let cfg = self.cfg.clone();
        self.task = Some(tokio::spawn(async move {
            // Nothing in the generator fails fatally; keep the error channel
            // open for the lifetime of the task.
            let _error_tx = error_tx;
            generate(cfg, policy, event_tx, ctx).await;
        }));

        info!(
            flows = self.cfg.flows,
            packet_interval = ?self.cfg.packet_interval,
            flow_packets = self.cfg.flow_packets,
            "synthetic source attached",
        );

        Ok(SourceChannels {
            events: event_rx,
            errors: error_rx,
        })
    }

    async fn detach(&mut self) -> Result<()> {
        if let Some(task) = self.task.take() {
            task.abort();
            match task.await {
                Ok(()) => {}
                Err(e) if e.is_cancelled() => {}
                Err(e) => return Err(e).context("joining synthetic source task"),
            }
        }

        Ok(())
    }
}

struct SimFlow {
    tuple: FlowTuple,
    sent: u64,
}

/// Hands out loopback source ports from the ephemeral range, wrapping around.
struct PortAllocator {
    next: u16,
}

impl PortAllocator {
    fn new() -> Self {
        Self {
            next: FIRST_SRC_PORT,
        }
    }

    fn next_flow(&mut self) -> SimFlow {
        let port = self.next;
        self.next = if port >= LAST_SRC_PORT {
            FIRST_SRC_PORT
        } else {
            port + 1
        };

        SimFlow {
            tuple: FlowTuple {
                proto: 17,
                src_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
                dst_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
                src_port: port,
                dst_port: DST_PORT,
            },
            sent: 0,
        }
    }
}

async fn generate(
    cfg: SyntheticConfig,
    policy: SamplingPolicy,
    events: mpsc::Sender<AccountingEvent>,
    ctx: CancellationToken,
) {
    let mut table = FlowTable::new(policy);
    let mut ports = PortAllocator::new();
    let mut flows: Vec<SimFlow> = (0..cfg.flows).map(|_| ports.next_flow()).collect();

    let mut ticker = tokio::time::interval(cfg.packet_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ctx.cancelled() => {
                debug!(live_flows = table.len(), "synthetic source stopping");
                return;
            }

            _ = ticker.tick() => {
                let now = Instant::now();

                for flow in &mut flows {
                    // Every fourth packet travels in the reply direction.
                    let direction = if flow.sent % 4 == 3 {
                        Direction::Reply
                    } else {
                        Direction::Orig
                    };
                    let bytes = match direction {
                        Direction::Orig => ORIG_PACKET_BYTES,
                        Direction::Reply => REPLY_PACKET_BYTES,
                    };

                    let packet = Packet {
                        tuple: flow.tuple,
                        netns: SYNTHETIC_NETNS,
                        connmark: 0,
                        direction,
                        bytes,
                    };
                    flow.sent += 1;

                    if let Some(ev) = table.observe(&packet, now) {
                        if !emit(&events, ev, &ctx).await {
                            return;
                        }
                    }

                    if cfg.flow_packets > 0 && flow.sent >= cfg.flow_packets {
                        if let Some(ev) = table.destroy(flow.tuple, SYNTHETIC_NETNS) {
                            if !emit(&events, ev, &ctx).await {
                                return;
                            }
                        }
                        *flow = ports.next_flow();
                    }
                }
            }
        }
    }
}

/// Sends one event, returning false once the source should stop.
async fn emit(
    events: &mpsc::Sender<AccountingEvent>,
    event: AccountingEvent,
    ctx: &CancellationToken,
) -> bool {
    tokio::select! {
        _ = ctx.cancelled() => false,
        sent = events.send(event) => sent.is_ok(),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::probe::EventKind;

    fn cfg(flows: usize, flow_packets: u64) -> SyntheticConfig {
        SyntheticConfig {
            flows,
            packet_interval: Duration::from_millis(1),
            flow_packets,
        }
    }

    #[test]
    fn test_port_allocator_wraps() {
        let mut ports = PortAllocator { next: LAST_SRC_PORT };
        assert_eq!(ports.next_flow().tuple.src_port, LAST_SRC_PORT);
        assert_eq!(ports.next_flow().tuple.src_port, FIRST_SRC_PORT);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flow_lifecycle() {
        let mut source = SyntheticSource::new(cfg(1, 8));
        let ctx = CancellationToken::new();
        let mut ch = source
            .attach(SamplingPolicy::new(Duration::from_secs(1)), ctx.clone())
            .await
            .expect("attach");

        let mut first_flow = Vec::new();
        while let Some(ev) = ch.events.recv().await {
            let done = ev.kind == EventKind::Destroy;
            first_flow.push(ev);
            if done {
                break;
            }
        }

        let totals: Vec<u64> = first_flow
            .iter()
            .map(|e| e.counters.packets_total())
            .collect();
        assert_eq!(totals, vec![1, 2, 4, 8, 8]);
        assert_eq!(first_flow.last().map(|e| e.kind), Some(EventKind::Destroy));

        // The next flow starts on a fresh port.
        let next = ch.events.recv().await.expect("next flow");
        assert_eq!(next.tuple.src_port, FIRST_SRC_PORT + 1);
        assert_eq!(next.counters.packets_total(), 1);

        ctx.cancel();
        source.detach().await.expect("detach");
    }

    #[tokio::test]
    async fn test_attach_twice_fails() {
        let mut source = SyntheticSource::new(cfg(1, 0));
        let ctx = CancellationToken::new();
        let policy = SamplingPolicy::new(Duration::from_secs(1));

        let _ch = source.attach(policy, ctx.clone()).await.expect("attach");
        assert!(source.attach(policy, ctx.clone()).await.is_err());

        ctx.cancel();
        source.detach().await.expect("detach");
    }
}
