//! Elasticsearch sink. Batches are written through the bulk API, one
//! document per event.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use super::batch::BatchWriter;
use super::http::{build_client, endpoint, send, with_auth, with_body};
use super::Backend;
use crate::config::{Compression, SinkConfig};
use crate::probe::AccountingEvent;

/// Document indexed for each event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ElasticDoc {
    #[serde(rename = "@timestamp")]
    pub timestamp: String,
    pub kind: &'static str,
    pub proto: u8,
    pub proto_name: String,
    pub src_addr: String,
    pub dst_addr: String,
    pub src_port: u16,
    pub dst_port: u16,
    pub netns: u64,
    pub connmark: u32,
    pub packets_orig: u64,
    pub bytes_orig: u64,
    pub packets_ret: u64,
    pub bytes_ret: u64,
    pub packets_total: u64,
    pub bytes_total: u64,
}

impl From<&AccountingEvent> for ElasticDoc {
    fn from(event: &AccountingEvent) -> Self {
        let t = &event.tuple;
        let c = &event.counters;
        let ts: DateTime<Utc> = event.timestamp.into();

        Self {
            timestamp: ts.to_rfc3339_opts(SecondsFormat::Millis, true),
            kind: event.kind.as_str(),
            proto: t.proto,
            proto_name: t.proto_name().into_owned(),
            src_addr: t.src_addr.to_string(),
            dst_addr: t.dst_addr.to_string(),
            src_port: t.src_port,
            dst_port: t.dst_port,
            netns: event.netns,
            connmark: event.connmark,
            packets_orig: c.packets_orig,
            bytes_orig: c.bytes_orig,
            packets_ret: c.packets_ret,
            bytes_ret: c.bytes_ret,
            packets_total: c.packets_total(),
            bytes_total: c.bytes_total(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct BulkResponse {
    #[serde(default)]
    errors: bool,
    #[serde(default)]
    items: Vec<serde_json::Value>,
}

/// ElasticWriter indexes batches of documents with `POST /_bulk`.
pub struct ElasticWriter {
    client: reqwest::Client,
    url: reqwest::Url,
    index: String,
    username: String,
    password: String,
    compression: Compression,
}

impl BatchWriter for ElasticWriter {
    type Point = ElasticDoc;

    fn encode(&self, event: &AccountingEvent) -> ElasticDoc {
        ElasticDoc::from(event)
    }

    async fn write(&self, batch: Vec<ElasticDoc>) -> Result<()> {
        let body = bulk_body(&self.index, &batch)?;

        let request = self
            .client
            .post(self.url.clone())
            .header("Content-Type", "application/x-ndjson");
        let request = with_auth(request, &self.username, &self.password);
        let request = with_body(request, body, self.compression)?;

        let resp = send(request).await.context("elastic bulk")?;
        check_bulk_response(&resp)
    }
}

impl Backend for ElasticWriter {
    async fn connect(cfg: &SinkConfig) -> Result<Self> {
        Ok(Self {
            client: build_client(cfg.timeout)?,
            url: endpoint(&cfg.address, "_bulk")?,
            index: cfg.index.clone(),
            username: cfg.username.clone(),
            password: cfg.password.clone(),
            compression: cfg.compression,
        })
    }
}

/// Builds an NDJSON bulk body: an action line followed by the document,
/// for every document, with a trailing newline.
fn bulk_body(index: &str, docs: &[ElasticDoc]) -> Result<Vec<u8>> {
    let action = serde_json::to_vec(&serde_json::json!({ "index": { "_index": index } }))
        .context("encoding bulk action")?;

    let mut body = Vec::with_capacity(docs.len() * 384);
    for doc in docs {
        body.extend_from_slice(&action);
        body.push(b'\n');
        serde_json::to_writer(&mut body, doc).context("encoding document")?;
        body.push(b'\n');
    }

    Ok(body)
}

/// The bulk API answers 200 even when individual items fail.
fn check_bulk_response(body: &str) -> Result<()> {
    let resp: BulkResponse = serde_json::from_str(body).context("decoding bulk response")?;
    if !resp.errors {
        return Ok(());
    }

    let failed = resp
        .items
        .iter()
        .filter_map(|item| item.get("index").and_then(|i| i.get("error")))
        .collect::<Vec<_>>();

    let reason = failed
        .first()
        .and_then(|e| e.get("reason"))
        .and_then(|r| r.as_str())
        .unwrap_or("unknown error");

    bail!(
        "{} of {} documents rejected: {reason}",
        failed.len(),
        resp.items.len()
    );
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::{Duration, SystemTime};

    use super::*;
    use crate::probe::{Counters, EventKind, FlowTuple};

    fn event() -> AccountingEvent {
        AccountingEvent {
            kind: EventKind::Destroy,
            tuple: FlowTuple {
                proto: 6,
                src_addr: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
                dst_addr: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
                src_port: 40000,
                dst_port: 443,
            },
            counters: Counters {
                packets_orig: 10,
                bytes_orig: 1000,
                packets_ret: 8,
                bytes_ret: 9000,
            },
            netns: 4026531992,
            connmark: 1,
            timestamp: SystemTime::UNIX_EPOCH + Duration::from_millis(1_700_000_000_250),
        }
    }

    #[test]
    fn test_doc_serialization() {
        let doc = ElasticDoc::from(&event());
        let json = serde_json::to_value(&doc).expect("json");

        assert_eq!(json["@timestamp"], "2023-11-14T22:13:20.250Z");
        assert_eq!(json["kind"], "destroy");
        assert_eq!(json["proto_name"], "tcp");
        assert_eq!(json["src_addr"], "10.0.0.2");
        assert_eq!(json["packets_total"], 18);
        assert_eq!(json["bytes_total"], 10000);
    }

    #[test]
    fn test_bulk_body() {
        let docs = vec![ElasticDoc::from(&event()), ElasticDoc::from(&event())];
        let body = String::from_utf8(bulk_body("conntracct", &docs).expect("body")).expect("utf8");

        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], r#"{"index":{"_index":"conntracct"}}"#);
        assert!(lines[1].starts_with(r#"{"@timestamp":"#));
        assert!(body.ends_with('\n'));
    }

    #[test]
    fn test_bulk_response_ok() {
        check_bulk_response(r#"{"took":3,"errors":false,"items":[{"index":{"status":201}}]}"#)
            .expect("no errors");
    }

    #[test]
    fn test_bulk_response_item_error() {
        let body = r#"{"errors":true,"items":[
            {"index":{"status":201}},
            {"index":{"status":400,"error":{"type":"mapper_parsing_exception","reason":"failed to parse field [netns]"}}}
        ]}"#;

        let err = check_bulk_response(body).expect_err("item error");
        let msg = err.to_string();
        assert!(msg.contains("1 of 2 documents rejected"), "got: {msg}");
        assert!(msg.contains("failed to parse field [netns]"), "got: {msg}");
    }

    #[test]
    fn test_bulk_response_garbage() {
        assert!(check_bulk_response("<html>").is_err());
    }
}
