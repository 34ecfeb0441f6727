use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use super::Sink;
use crate::probe::AccountingEvent;

/// Spawns a task that drains a consumer channel into a sink, skipping
/// event kinds the sink is not interested in. The task ends when the
/// channel is closed and empty.
pub fn spawn_pump<S>(sink: Arc<S>, mut rx: mpsc::Receiver<AccountingEvent>) -> JoinHandle<()>
where
    S: Sink + 'static,
{
    tokio::spawn(async move {
        let mut forwarded = 0u64;
        let mut skipped = 0u64;

        while let Some(event) = rx.recv().await {
            if sink.wants(event.kind) {
                sink.push(&event);
                forwarded += 1;
            } else {
                skipped += 1;
            }
        }

        debug!(sink = %sink.name(), forwarded, skipped, "consumer channel closed");
    })
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::SystemTime;

    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::config::SinkConfig;
    use crate::probe::{Counters, EventKind, FlowTuple};
    use crate::sink::stdio::StdioWriter;
    use crate::sink::{BatchingSink, SinkType};

    fn event(kind: EventKind) -> AccountingEvent {
        AccountingEvent {
            kind,
            tuple: FlowTuple {
                proto: 17,
                src_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
                dst_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
                src_port: 40000,
                dst_port: 1342,
            },
            counters: Counters::default(),
            netns: 1,
            connmark: 0,
            timestamp: SystemTime::UNIX_EPOCH,
        }
    }

    #[tokio::test]
    async fn test_pump_filters_by_interest() {
        let (client, _server) = tokio::io::duplex(1 << 16);

        let mut cfg = SinkConfig::new("text", SinkType::StdIo);
        cfg.events.update = Some(false);

        let mut sink = BatchingSink::<StdioWriter>::new(SinkType::StdIo);
        sink.init_with(cfg, StdioWriter::new(client), CancellationToken::new())
            .expect("init");
        let sink = Arc::new(sink);

        let (tx, rx) = mpsc::channel(8);
        let pump = spawn_pump(Arc::clone(&sink), rx);

        tx.send(event(EventKind::Update)).await.expect("send");
        tx.send(event(EventKind::Destroy)).await.expect("send");
        tx.send(event(EventKind::Update)).await.expect("send");
        drop(tx);

        pump.await.expect("pump");
        assert_eq!(sink.stats().events_pushed, 1);
    }
}
