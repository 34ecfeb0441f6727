//! HTTP plumbing shared by the Influx and Elasticsearch sinks.

use std::io::Write;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::config::Compression;

/// Longest response body excerpt included in an error.
const MAX_ERROR_BODY: usize = 256;

/// Builds a client with the sink's request timeout.
pub(crate) fn build_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .context("building HTTP client")
}

/// Parses the sink's base address and appends `path`.
pub(crate) fn endpoint(address: &str, path: &str) -> Result<reqwest::Url> {
    let base = address.trim_end_matches('/');
    let url = format!("{base}/{}", path.trim_start_matches('/'));

    reqwest::Url::parse(&url).with_context(|| format!("invalid sink address: {address}"))
}

/// Adds basic auth when a username is configured.
pub(crate) fn with_auth(
    request: reqwest::RequestBuilder,
    username: &str,
    password: &str,
) -> reqwest::RequestBuilder {
    if username.is_empty() {
        return request;
    }

    let password = (!password.is_empty()).then_some(password);
    request.basic_auth(username, password)
}

/// Attaches `body`, compressed as configured.
pub(crate) fn with_body(
    request: reqwest::RequestBuilder,
    body: Vec<u8>,
    compression: Compression,
) -> Result<reqwest::RequestBuilder> {
    let body = compress(&body, compression).context("compressing request body")?;

    let request = match content_encoding(compression) {
        Some(encoding) => request.header("Content-Encoding", encoding),
        None => request,
    };

    Ok(request.body(body))
}

/// Sends the request and returns the response body, failing on any
/// non-success status.
pub(crate) async fn send(request: reqwest::RequestBuilder) -> Result<String> {
    let resp = request.send().await.context("sending request")?;

    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();

    if !status.is_success() {
        bail!("unexpected status {status}: {}", excerpt(&body));
    }

    Ok(body)
}

fn excerpt(body: &str) -> &str {
    let body = body.trim();
    if body.len() <= MAX_ERROR_BODY {
        return body;
    }

    let mut end = MAX_ERROR_BODY;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    &body[..end]
}

// --- Compression ---

/// Compresses data using the specified algorithm.
pub(crate) fn compress(data: &[u8], compression: Compression) -> Result<Vec<u8>> {
    match compression {
        Compression::None => Ok(data.to_vec()),
        Compression::Gzip => compress_gzip(data),
    }
}

/// Returns the Content-Encoding header value for the algorithm.
fn content_encoding(compression: Compression) -> Option<&'static str> {
    match compression {
        Compression::None => None,
        Compression::Gzip => Some("gzip"),
    }
}

fn compress_gzip(data: &[u8]) -> Result<Vec<u8>> {
    use flate2::write::GzEncoder;

    let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(data).context("gzip write")?;
    encoder.finish().context("gzip finish")
}
