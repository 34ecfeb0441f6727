use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{EventSource, SourceChannels};
use crate::probe::parse::{parse_record, RECORD_SIZE};
use crate::probe::{AccountingEvent, SamplingPolicy};

const EVENT_CHANNEL_CAPACITY: usize = 4096;

/// ReplaySource feeds a file of raw accounting records to the probe.
///
/// Records were sampled when they were captured, so the sampling policy is
/// not applied again. Undecodable records are logged and skipped. Reaching
/// the end of the file ends the input without closing the event stream.
pub struct ReplaySource {
    path: PathBuf,
    task: Option<JoinHandle<()>>,
}

impl ReplaySource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            task: None,
        }
    }
}

impl EventSource for ReplaySource {
    fn name(&self) -> &str {
        "replay"
    }

    async fn attach(
        &mut self,
        _policy: SamplingPolicy,
        ctx: CancellationToken,
    ) -> Result<SourceChannels> {
        if self.task.is_some() {
            bail!("replay source is already attached");
        }

        let file = tokio::fs::File::open(&self.path)
            .await
            .with_context(|| format!("opening replay file {}", self.path.display()))?;

        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (error_tx, error_rx) = mpsc::channel(1);

        let path = self.path.display().to_string();
        self.task = Some(tokio::spawn(async move {
            let reader = BufReader::new(file);
            if let Some(stats) = replay(reader, &path, event_tx, error_tx, ctx.clone()).await {
                info!(
                    path = %path,
                    records = stats.records,
                    skipped = stats.skipped,
                    "replay finished"
                );
                // Keep the event stream open until the probe detaches.
                ctx.cancelled().await;
            }
        }));

        info!(path = %self.path.display(), "replay source attached");

        Ok(SourceChannels {
            events: event_rx,
            errors: error_rx,
        })
    }

    async fn detach(&mut self) -> Result<()> {
        if let Some(task) = self.task.take() {
            task.await.context("joining replay task")?;
        }

        Ok(())
    }
}

/// Records read and skipped by one pass over a replay file.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct ReplayStats {
    records: u64,
    skipped: u64,
}

/// Streams every record in `reader` into `events`. Returns `None` when the
/// context is cancelled or the probe stops listening.
async fn replay<R: AsyncRead + Unpin>(
    mut reader: R,
    path: &str,
    events: mpsc::Sender<AccountingEvent>,
    errors: mpsc::Sender<anyhow::Error>,
    ctx: CancellationToken,
) -> Option<ReplayStats> {
    let mut buf = [0u8; RECORD_SIZE];
    let mut stats = ReplayStats::default();

    loop {
        let read = tokio::select! {
            _ = ctx.cancelled() => return None,
            read = read_record(&mut reader, &mut buf) => read,
        };

        let filled = match read {
            Ok(0) => break,
            Ok(filled) => filled,
            Err(e) => {
                let err = anyhow::Error::new(e).context(format!("reading replay file {path}"));
                let _ = errors.send(err).await;
                break;
            }
        };

        let offset = (stats.records + stats.skipped) * RECORD_SIZE as u64;
        match parse_record(&buf[..filled]) {
            Ok(event) => {
                stats.records += 1;
                tokio::select! {
                    _ = ctx.cancelled() => return None,
                    sent = events.send(event) => {
                        if sent.is_err() {
                            return None;
                        }
                    }
                }
            }
            Err(e) => {
                stats.skipped += 1;
                warn!(path, offset, error = %e, "skipping undecodable record");
            }
        }

        // A short read only happens at end of file.
        if filled < RECORD_SIZE {
            break;
        }
    }

    Some(stats)
}

/// Reads up to one record into `buf`, returning how many bytes were filled.
async fn read_record<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8; RECORD_SIZE],
) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < RECORD_SIZE {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
