use std::collections::HashMap;
use std::time::{Instant, SystemTime};

use crate::probe::{AccountingEvent, Counters, Direction, EventKind, FlowTuple, SamplingPolicy};

/// One observed packet belonging to a flow.
#[derive(Debug, Clone, Copy)]
pub struct Packet {
    pub tuple: FlowTuple,
    pub netns: u64,
    pub connmark: u32,
    pub direction: Direction,
    pub bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct FlowKey {
    tuple: FlowTuple,
    netns: u64,
}

#[derive(Debug)]
struct FlowState {
    counters: Counters,
    connmark: u32,
    last_report: Option<Instant>,
}

/// FlowTable tracks per-flow counters and decides, packet by packet, when a
/// flow is due for an Update.
///
/// This is the userspace rendition of the accounting hook: every packet is
/// accounted, but only those accepted by the [`SamplingPolicy`] produce an
/// event. Tearing a flow down always produces exactly one Destroy.
#[derive(Debug)]
pub struct FlowTable {
    policy: SamplingPolicy,
    flows: HashMap<FlowKey, FlowState>,
}

impl FlowTable {
    pub fn new(policy: SamplingPolicy) -> Self {
        Self {
            policy,
            flows: HashMap::new(),
        }
    }

    /// Number of live flows.
    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    /// Accounts `packet` and returns an Update if the flow is due for one.
    pub fn observe(&mut self, packet: &Packet, now: Instant) -> Option<AccountingEvent> {
        let key = FlowKey {
            tuple: packet.tuple,
            netns: packet.netns,
        };

        let state = self.flows.entry(key).or_insert_with(|| FlowState {
            counters: Counters::default(),
            connmark: packet.connmark,
            last_report: None,
        });

        state.counters.add_packet(packet.direction, packet.bytes);
        state.connmark = packet.connmark;

        let since_last = state
            .last_report
            .map(|at| now.saturating_duration_since(at));

        if !self
            .policy
            .should_emit(state.counters.packets_total(), since_last)
        {
            return None;
        }

        state.last_report = Some(now);

        Some(AccountingEvent {
            kind: EventKind::Update,
            tuple: key.tuple,
            counters: state.counters,
            netns: key.netns,
            connmark: state.connmark,
            timestamp: SystemTime::now(),
        })
    }

    /// Tears the flow down, returning its final Destroy event. Unknown flows
    /// produce nothing.
    pub fn destroy(&mut self, tuple: FlowTuple, netns: u64) -> Option<AccountingEvent> {
        let state = self.flows.remove(&FlowKey { tuple, netns })?;

        Some(AccountingEvent {
            kind: EventKind::Destroy,
            tuple,
            counters: state.counters,
            netns,
            connmark: state.connmark,
            timestamp: SystemTime::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    use super::*;

    const COOLDOWN: Duration = Duration::from_millis(20);

    fn udp_packet(direction: Direction) -> Packet {
        Packet {
            tuple: FlowTuple {
                proto: 17,
                src_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
                dst_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
                src_port: 40000,
                dst_port: 1342,
            },
            netns: 4026531992,
            connmark: 0,
            direction,
            bytes: 31,
        }
    }

    #[test]
    fn test_first_packet_reports() {
        let mut table = FlowTable::new(SamplingPolicy::new(COOLDOWN));
        let ev = table
            .observe(&udp_packet(Direction::Orig), Instant::now())
            .expect("first packet reports");

        assert_eq!(ev.kind, EventKind::Update);
        assert_eq!(ev.tuple.proto, 17);
        assert_eq!(ev.counters.packets_orig, 1);
        assert_eq!(ev.counters.bytes_orig, 31);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_burst_counts_both_directions() {
        let mut table = FlowTable::new(SamplingPolicy::new(COOLDOWN));
        let now = Instant::now();

        let mut reported = Vec::new();
        for i in 0..32u64 {
            let dir = if i % 2 == 0 {
                Direction::Orig
            } else {
                Direction::Reply
            };
            if let Some(ev) = table.observe(&udp_packet(dir), now) {
                reported.push(ev.counters.packets_total());
            }
        }

        assert_eq!(reported, vec![1, 2, 4, 8, 16, 32]);
    }

    #[test]
    fn test_cooldown_after_burst() {
        let mut table = FlowTable::new(SamplingPolicy::new(COOLDOWN));
        let start = Instant::now();
        let pkt = udp_packet(Direction::Orig);

        for _ in 0..32 {
            table.observe(&pkt, start);
        }

        // Inside the cooldown window.
        assert!(table
            .observe(&pkt, start + Duration::from_millis(10))
            .is_none());

        // First packet after the window reports once.
        let ev = table
            .observe(&pkt, start + COOLDOWN)
            .expect("cooldown elapsed");
        assert_eq!(ev.counters.packets_orig, 34);
        assert!(table.observe(&pkt, start + COOLDOWN).is_none());
    }

    #[test]
    fn test_destroy_is_final() {
        let mut table = FlowTable::new(SamplingPolicy::new(COOLDOWN));
        let pkt = udp_packet(Direction::Orig);
        let now = Instant::now();

        let mut last_update = None;
        for _ in 0..5 {
            if let Some(ev) = table.observe(&pkt, now) {
                last_update = Some(ev);
            }
        }

        let destroy = table.destroy(pkt.tuple, pkt.netns).expect("destroy");
        assert_eq!(destroy.kind, EventKind::Destroy);
        assert_eq!(destroy.counters.packets_orig, 5);
        assert!(destroy
            .counters
            .dominates(&last_update.expect("update").counters));

        assert!(table.is_empty());
        assert!(table.destroy(pkt.tuple, pkt.netns).is_none());
    }

    #[test]
    fn test_flows_keyed_by_namespace() {
        let mut table = FlowTable::new(SamplingPolicy::new(COOLDOWN));
        let a = udp_packet(Direction::Orig);
        let b = Packet { netns: 7, ..a };
        let now = Instant::now();

        assert!(table.observe(&a, now).is_some());
        assert!(table.observe(&b, now).is_some());
        assert_eq!(table.len(), 2);
    }
}
