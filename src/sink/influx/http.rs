use anyhow::{Context, Result};

use super::line::encode_line;
use crate::config::{Compression, SinkConfig};
use crate::probe::AccountingEvent;
use crate::sink::batch::BatchWriter;
use crate::sink::http::{build_client, endpoint, send, with_auth, with_body};
use crate::sink::Backend;

/// InfluxHttpWriter posts line protocol batches to the `/write` endpoint.
pub struct InfluxHttpWriter {
    client: reqwest::Client,
    url: reqwest::Url,
    username: String,
    password: String,
    compression: Compression,
}

impl InfluxHttpWriter {
    fn body(batch: &[String]) -> Vec<u8> {
        batch.join("\n").into_bytes()
    }
}

impl BatchWriter for InfluxHttpWriter {
    type Point = String;

    fn encode(&self, event: &AccountingEvent) -> String {
        encode_line(event)
    }

    async fn write(&self, batch: Vec<String>) -> Result<()> {
        let request = self.client.post(self.url.clone());
        let request = with_auth(request, &self.username, &self.password);
        let request = with_body(request, Self::body(&batch), self.compression)?;

        send(request).await.context("influx write")?;

        Ok(())
    }
}

impl Backend for InfluxHttpWriter {
    async fn connect(cfg: &SinkConfig) -> Result<Self> {
        let mut url = endpoint(&cfg.address, "write")?;
        url.query_pairs_mut()
            .append_pair("db", &cfg.database)
            .append_pair("precision", "ns");

        Ok(Self {
            client: build_client(cfg.timeout)?,
            url,
            username: cfg.username.clone(),
            password: cfg.password.clone(),
            compression: cfg.compression,
        })
    }
}
