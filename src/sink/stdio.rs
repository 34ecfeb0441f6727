use std::time::SystemTime;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use super::batch::BatchWriter;
use super::Backend;
use crate::config::SinkConfig;
use crate::probe::AccountingEvent;

/// StdioWriter prints one line of text per event.
pub struct StdioWriter {
    out: Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
}

impl StdioWriter {
    pub fn new(out: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        Self {
            out: Mutex::new(Box::new(out)),
        }
    }
}

impl BatchWriter for StdioWriter {
    type Point = String;

    fn encode(&self, event: &AccountingEvent) -> String {
        format!("{} {event}\n", format_datetime(event.timestamp))
    }

    async fn write(&self, batch: Vec<String>) -> Result<()> {
        let mut out = self.out.lock().await;

        for line in &batch {
            out.write_all(line.as_bytes())
                .await
                .context("writing event line")?;
        }
        out.flush().await.context("flushing output")
    }
}

impl Backend for StdioWriter {
    async fn connect(cfg: &SinkConfig) -> Result<Self> {
        match cfg.address.as_str() {
            "" | "stdout" => Ok(Self::new(tokio::io::stdout())),
            "stderr" => Ok(Self::new(tokio::io::stderr())),
            other => bail!("sink '{}': unsupported stdio address: {other}", cfg.name),
        }
    }
}

/// Formats a SystemTime as "2006-01-02 15:04:05.000" in UTC.
fn format_datetime(t: SystemTime) -> String {
    let dt: DateTime<Utc> = t.into();
    dt.format("%Y-%m-%d %H:%M:%S%.3f").to_string()
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    use super::*;
    use crate::probe::{Counters, EventKind, FlowTuple};
    use crate::sink::SinkType;

    fn event() -> AccountingEvent {
        AccountingEvent {
            kind: EventKind::Destroy,
            tuple: FlowTuple {
                proto: 17,
                src_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
                dst_addr: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
                src_port: 40000,
                dst_port: 1342,
            },
            counters: Counters {
                packets_orig: 2,
                bytes_orig: 62,
                packets_ret: 1,
                bytes_ret: 64,
            },
            netns: 7,
            connmark: 0x10,
            timestamp: SystemTime::UNIX_EPOCH + Duration::from_millis(1_700_000_000_250),
        }
    }

    #[test]
    fn test_format_datetime() {
        let t = SystemTime::UNIX_EPOCH + Duration::from_millis(1_700_000_000_250);
        assert_eq!(format_datetime(t), "2023-11-14 22:13:20.250");
    }

    #[tokio::test]
    async fn test_writes_one_line_per_event() {
        let (client, mut server) = tokio::io::duplex(4096);
        let writer = StdioWriter::new(client);

        let line = writer.encode(&event());
        assert_eq!(
            line,
            "2023-11-14 22:13:20.250 destroy udp 127.0.0.1:40000 -> 10.0.0.1:1342 \
             netns=7 mark=0x10 orig=2p/62b ret=1p/64b\n"
        );

        writer
            .write(vec![line.clone(), line.clone()])
            .await
            .expect("write");
        drop(writer);

        let mut out = String::new();
        tokio::io::AsyncReadExt::read_to_string(&mut server, &mut out)
            .await
            .expect("read");
        assert_eq!(out.lines().count(), 2);
    }

    #[tokio::test]
    async fn test_unsupported_address() {
        let mut cfg = SinkConfig::new("text", SinkType::StdIo);
        cfg.address = "/dev/null".to_string();
        assert!(StdioWriter::connect(&cfg).await.is_err());
    }
}
