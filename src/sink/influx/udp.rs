use anyhow::{bail, Context, Result};
use tokio::net::UdpSocket;
use tracing::debug;

use super::line::encode_line;
use crate::config::SinkConfig;
use crate::probe::AccountingEvent;
use crate::sink::batch::BatchWriter;
use crate::sink::Backend;

/// InfluxUdpWriter sends line protocol batches as UDP datagrams.
pub struct InfluxUdpWriter {
    socket: UdpSocket,
    payload_size: usize,
}

impl InfluxUdpWriter {
    /// Wraps a socket already connected to the Influx UDP listener.
    pub fn new(socket: UdpSocket, payload_size: usize) -> Self {
        Self {
            socket,
            payload_size,
        }
    }
}

impl BatchWriter for InfluxUdpWriter {
    type Point = String;

    fn encode(&self, event: &AccountingEvent) -> String {
        encode_line(event)
    }

    async fn write(&self, batch: Vec<String>) -> Result<()> {
        let datagrams = pack(&batch, self.payload_size);

        for datagram in &datagrams {
            self.socket
                .send(datagram)
                .await
                .context("sending datagram")?;
        }

        debug!(
            points = batch.len(),
            datagrams = datagrams.len(),
            "batch sent over udp"
        );

        Ok(())
    }
}

impl Backend for InfluxUdpWriter {
    async fn connect(cfg: &SinkConfig) -> Result<Self> {
        let addr = tokio::net::lookup_host(cfg.address.as_str())
            .await
            .with_context(|| format!("resolving {}", cfg.address))?
            .next();
        let Some(addr) = addr else {
            bail!("address {} did not resolve", cfg.address);
        };

        let local = if addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(local)
            .await
            .context("binding udp socket")?;
        socket
            .connect(addr)
            .await
            .with_context(|| format!("connecting udp socket to {addr}"))?;

        Ok(Self::new(socket, cfg.udp_payload_size))
    }
}

/// Packs newline-separated lines into datagrams of at most `payload_size`
/// bytes. A line longer than the limit is sent in a datagram of its own.
fn pack(lines: &[String], payload_size: usize) -> Vec<Vec<u8>> {
    let mut datagrams = Vec::new();
    let mut current: Vec<u8> = Vec::with_capacity(payload_size);

    for line in lines {
        let needed = if current.is_empty() {
            line.len()
        } else {
            current.len() + 1 + line.len()
        };

        if needed > payload_size && !current.is_empty() {
            datagrams.push(std::mem::replace(
                &mut current,
                Vec::with_capacity(payload_size),
            ));
        }

        if !current.is_empty() {
            current.push(b'\n');
        }
        current.extend_from_slice(line.as_bytes());
    }

    if !current.is_empty() {
        datagrams.push(current);
    }

    datagrams
}
