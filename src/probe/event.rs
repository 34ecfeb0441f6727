use std::fmt;
use std::net::IpAddr;
use std::time::SystemTime;

/// EventKind distinguishes periodic flow snapshots from the final one.
/// Values must match the `kind` byte of the kernel accounting record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EventKind {
    /// Periodic snapshot of a live flow.
    Update = 0,
    /// Terminal snapshot, emitted exactly once when the flow is torn down.
    Destroy = 1,
}

impl EventKind {
    /// Returns the canonical metric/log label name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Update => "update",
            Self::Destroy => "destroy",
        }
    }

    /// Convert from a raw u8 value.
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Update),
            1 => Some(Self::Destroy),
            _ => None,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Flow direction as seen by conntrack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Direction {
    /// Packet travelling in the direction of the flow's first packet.
    Orig = 0,
    /// Packet travelling back towards the originator.
    Reply = 1,
}

impl Direction {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Orig => "orig",
            Self::Reply => "reply",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection tuple of a flow, in the originating direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowTuple {
    /// IP protocol number (6 = TCP, 17 = UDP, ...).
    pub proto: u8,
    pub src_addr: IpAddr,
    pub dst_addr: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
}

impl FlowTuple {
    /// Returns a readable protocol label, falling back to the number.
    pub fn proto_name(&self) -> std::borrow::Cow<'static, str> {
        match self.proto {
            1 => "icmp".into(),
            6 => "tcp".into(),
            17 => "udp".into(),
            58 => "icmpv6".into(),
            132 => "sctp".into(),
            other => other.to_string().into(),
        }
    }
}

impl fmt::Display for FlowTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} -> {}",
            self.proto_name(),
            SocketFmt(self.src_addr, self.src_port),
            SocketFmt(self.dst_addr, self.dst_port),
        )
    }
}

struct SocketFmt(IpAddr, u16);

impl fmt::Display for SocketFmt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            IpAddr::V4(a) => write!(f, "{a}:{}", self.1),
            IpAddr::V6(a) => write!(f, "[{a}]:{}", self.1),
        }
    }
}

/// Packet and byte counters for both directions of a flow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    pub packets_orig: u64,
    pub bytes_orig: u64,
    pub packets_ret: u64,
    pub bytes_ret: u64,
}

impl Counters {
    /// Cumulative packet count across both directions.
    pub fn packets_total(&self) -> u64 {
        self.packets_orig.saturating_add(self.packets_ret)
    }

    /// Cumulative byte count across both directions.
    pub fn bytes_total(&self) -> u64 {
        self.bytes_orig.saturating_add(self.bytes_ret)
    }

    /// Accounts one packet of `bytes` in the given direction.
    pub fn add_packet(&mut self, direction: Direction, bytes: u64) {
        match direction {
            Direction::Orig => {
                self.packets_orig = self.packets_orig.saturating_add(1);
                self.bytes_orig = self.bytes_orig.saturating_add(bytes);
            }
            Direction::Reply => {
                self.packets_ret = self.packets_ret.saturating_add(1);
                self.bytes_ret = self.bytes_ret.saturating_add(bytes);
            }
        }
    }

    /// True if every counter is at least the corresponding counter in `other`.
    pub fn dominates(&self, other: &Counters) -> bool {
        self.packets_orig >= other.packets_orig
            && self.bytes_orig >= other.bytes_orig
            && self.packets_ret >= other.packets_ret
            && self.bytes_ret >= other.bytes_ret
    }
}

/// One accounting observation for a flow.
///
/// Produced once by the event source and never mutated afterwards; the probe
/// hands every consumer its own copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountingEvent {
    pub kind: EventKind,
    pub tuple: FlowTuple,
    pub counters: Counters,
    /// Network namespace inode the flow belongs to.
    pub netns: u64,
    /// Connection mark set by other subsystems. Not interpreted.
    pub connmark: u32,
    /// Wall-clock time the event was produced.
    pub timestamp: SystemTime,
}

impl fmt::Display for AccountingEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} netns={} mark={:#x} orig={}p/{}b ret={}p/{}b",
            self.kind,
            self.tuple,
            self.netns,
            self.connmark,
            self.counters.packets_orig,
            self.counters.bytes_orig,
            self.counters.packets_ret,
            self.counters.bytes_ret,
        )
    }
}
