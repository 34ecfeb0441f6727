//! InfluxDB line protocol encoding of accounting events.
//!
//! ```text
//! ct_acct,kind=update,proto=udp,src_addr=127.0.0.1,dst_addr=127.0.0.1,dst_port=1342,netns=4026531992 src_port=51234i,connmark=0i,packets_orig=1i,bytes_orig=31i,packets_ret=0i,bytes_ret=0i,packets_total=1i,bytes_total=31i 1700000000123456789
//! ```

use std::fmt::Write;
use std::time::UNIX_EPOCH;

use crate::probe::AccountingEvent;

/// Measurement name of every point.
pub const MEASUREMENT: &str = "ct_acct";

/// Encodes an event as one line, without the trailing newline.
pub fn encode_line(event: &AccountingEvent) -> String {
    let mut line = String::with_capacity(256);
    let t = &event.tuple;
    let c = &event.counters;

    line.push_str(MEASUREMENT);
    push_tag(&mut line, "kind", event.kind.as_str());
    push_tag(&mut line, "proto", &t.proto_name());
    push_tag(&mut line, "src_addr", &t.src_addr.to_string());
    push_tag(&mut line, "dst_addr", &t.dst_addr.to_string());
    push_tag(&mut line, "dst_port", &t.dst_port.to_string());
    push_tag(&mut line, "netns", &event.netns.to_string());

    // Writing to a String cannot fail.
    let _ = write!(
        line,
        " src_port={}i,connmark={}i,packets_orig={}i,bytes_orig={}i,packets_ret={}i,bytes_ret={}i,packets_total={}i,bytes_total={}i {}",
        t.src_port,
        event.connmark,
        c.packets_orig,
        c.bytes_orig,
        c.packets_ret,
        c.bytes_ret,
        c.packets_total(),
        c.bytes_total(),
        timestamp_ns(event),
    );

    line
}

fn timestamp_ns(event: &AccountingEvent) -> u128 {
    event
        .timestamp
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0)
}

fn push_tag(line: &mut String, key: &str, value: &str) {
    line.push(',');
    line.push_str(key);
    line.push('=');
    escape_tag_value(line, value);
}

/// Escapes commas, equals signs and spaces in a tag value.
fn escape_tag_value(out: &mut String, value: &str) {
    for ch in value.chars() {
        if matches!(ch, ',' | '=' | ' ') {
            out.push('\\');
        }
        out.push(ch);
    }
}
