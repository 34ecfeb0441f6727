//! Codec for raw kernel accounting records.
//!
//! Each record is a fixed 96-byte little-endian struct, except ports which
//! are kept in network byte order as the kernel stores them:
//!
//! ```text
//! 0   u64  timestamp (ns since UNIX epoch)
//! 8   u64  netns inode
//! 16  u32  connmark
//! 20  u8   kind (0 = update, 1 = destroy)
//! 21  u8   ip protocol
//! 22  u8   address family (2 = inet, 10 = inet6)
//! 23  u8   padding
//! 24  u16  source port (big endian)
//! 26  u16  destination port (big endian)
//! 28  [4]  padding
//! 32  [16] source address (inet uses the first 4 bytes)
//! 48  [16] destination address
//! 64  u64  packets orig
//! 72  u64  bytes orig
//! 80  u64  packets reply
//! 88  u64  bytes reply
//! ```

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::{Duration, UNIX_EPOCH};

use thiserror::Error;

use super::event::{AccountingEvent, Counters, EventKind, FlowTuple};

/// Size of one raw accounting record in bytes.
pub const RECORD_SIZE: usize = 96;

const AF_INET: u8 = 2;
const AF_INET6: u8 = 10;

/// Errors that can occur while decoding a raw record.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ParseError {
    #[error("record too short: {size} bytes, need {RECORD_SIZE}")]
    Truncated { size: usize },

    #[error("unknown event kind: {raw}")]
    UnknownKind { raw: u8 },

    #[error("unknown address family: {raw}")]
    UnknownFamily { raw: u8 },
}

/// Decode a raw record into an [`AccountingEvent`].
pub fn parse_record(data: &[u8]) -> Result<AccountingEvent, ParseError> {
    if data.len() < RECORD_SIZE {
        return Err(ParseError::Truncated { size: data.len() });
    }
    let rec = &data[..RECORD_SIZE];

    let kind_raw = rec[20];
    let kind = EventKind::from_u8(kind_raw).ok_or(ParseError::UnknownKind { raw: kind_raw })?;

    let family = rec[22];
    let (src_addr, dst_addr) = match family {
        AF_INET => (
            IpAddr::V4(Ipv4Addr::from(read_fixed::<4>(rec, 32))),
            IpAddr::V4(Ipv4Addr::from(read_fixed::<4>(rec, 48))),
        ),
        AF_INET6 => (
            IpAddr::V6(Ipv6Addr::from(read_fixed::<16>(rec, 32))),
            IpAddr::V6(Ipv6Addr::from(read_fixed::<16>(rec, 48))),
        ),
        raw => return Err(ParseError::UnknownFamily { raw }),
    };

    Ok(AccountingEvent {
        kind,
        tuple: FlowTuple {
            proto: rec[21],
            src_addr,
            dst_addr,
            src_port: u16::from_be_bytes(read_fixed::<2>(rec, 24)),
            dst_port: u16::from_be_bytes(read_fixed::<2>(rec, 26)),
        },
        counters: Counters {
            packets_orig: read_u64_le(rec, 64),
            bytes_orig: read_u64_le(rec, 72),
            packets_ret: read_u64_le(rec, 80),
            bytes_ret: read_u64_le(rec, 88),
        },
        netns: read_u64_le(rec, 8),
        connmark: u32::from_le_bytes(read_fixed::<4>(rec, 16)),
        timestamp: UNIX_EPOCH + Duration::from_nanos(read_u64_le(rec, 0)),
    })
}

/// Encode an event into its raw record form.
pub fn encode_record(event: &AccountingEvent) -> [u8; RECORD_SIZE] {
    let mut rec = [0u8; RECORD_SIZE];

    let ts = event
        .timestamp
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
        .unwrap_or(0);

    rec[0..8].copy_from_slice(&ts.to_le_bytes());
    rec[8..16].copy_from_slice(&event.netns.to_le_bytes());
    rec[16..20].copy_from_slice(&event.connmark.to_le_bytes());
    rec[20] = event.kind as u8;
    rec[21] = event.tuple.proto;
    rec[24..26].copy_from_slice(&event.tuple.src_port.to_be_bytes());
    rec[26..28].copy_from_slice(&event.tuple.dst_port.to_be_bytes());

    // A mixed-family tuple cannot exist in conntrack; encode it as inet6
    // with the inet address mapped.
    match (event.tuple.src_addr, event.tuple.dst_addr) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => {
            rec[22] = AF_INET;
            rec[32..36].copy_from_slice(&src.octets());
            rec[48..52].copy_from_slice(&dst.octets());
        }
        (src, dst) => {
            rec[22] = AF_INET6;
            rec[32..48].copy_from_slice(&to_v6(src).octets());
            rec[48..64].copy_from_slice(&to_v6(dst).octets());
        }
    }

    rec[64..72].copy_from_slice(&event.counters.packets_orig.to_le_bytes());
    rec[72..80].copy_from_slice(&event.counters.bytes_orig.to_le_bytes());
    rec[80..88].copy_from_slice(&event.counters.packets_ret.to_le_bytes());
    rec[88..96].copy_from_slice(&event.counters.bytes_ret.to_le_bytes());

    rec
}

fn to_v6(addr: IpAddr) -> Ipv6Addr {
    match addr {
        IpAddr::V4(a) => a.to_ipv6_mapped(),
        IpAddr::V6(a) => a,
    }
}

// Callers have checked `rec.len() == RECORD_SIZE` and all offsets are
// constants inside the record.
fn read_fixed<const N: usize>(rec: &[u8], offset: usize) -> [u8; N] {
    let mut out = [0u8; N];
    if let Some(src) = rec.get(offset..offset + N) {
        out.copy_from_slice(src);
    }
    out
}

fn read_u64_le(rec: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(read_fixed::<8>(rec, offset))
}
