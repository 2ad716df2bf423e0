//! Newline-delimited JSON ingest loop.
//!
//! Reads one [`TelemetryRecord`] per line, groups records into batches,
//! runs each batch through the pipeline and writes admitted records back out
//! as JSON lines. A batch is processed when it is full or when its first
//! record has waited for the linger period.

use crate::infrastructure::config::PipelineSettings;
use crate::pipeline::AdmissionPipeline;
use crate::record::TelemetryRecord;
use anyhow::Context;
use serde::Serialize;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Batching parameters of the ingest loop.
#[derive(Debug, Clone, Copy)]
pub struct IngestOptions {
    /// Records per batch.
    pub batch_size: usize,
    /// Maximum wait of a partial batch.
    pub linger: Duration,
}

impl From<&PipelineSettings> for IngestOptions {
    fn from(settings: &PipelineSettings) -> Self {
        Self {
            batch_size: settings.batch_size.max(1),
            linger: settings.batch_linger(),
        }
    }
}

/// What the ingest loop did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestStats {
    /// Lines read from input.
    pub lines_read: u64,
    /// Lines that did not parse as a record.
    pub malformed: u64,
    /// Batches run through the pipeline.
    pub batches: u64,
    /// Records written to output.
    pub admitted: u64,
    /// Records left unexamined by a cancelled batch.
    pub unprocessed: u64,
}

/// Runs the ingest loop until input ends or `cancel` fires.
///
/// Records already buffered when the loop stops are still processed; if
/// `cancel` fired, the pipeline stops that batch at its next check.
///
/// # Errors
///
/// Returns an error if reading input or writing output fails.
pub async fn run_ingest<R, W>(
    pipeline: &AdmissionPipeline,
    reader: R,
    writer: W,
    options: IngestOptions,
    cancel: &CancellationToken,
) -> anyhow::Result<IngestStats>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let batch_size = options.batch_size.max(1);
    let mut lines = reader.lines();
    let mut writer = BufWriter::new(writer);
    let mut batch = Vec::with_capacity(batch_size);
    let mut stats = IngestStats::default();
    let linger = tokio::time::sleep(options.linger);
    tokio::pin!(linger);

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                debug!("ingest cancelled");
                break;
            }
            () = &mut linger, if !batch.is_empty() => {
                drain(pipeline, &mut batch, &mut writer, cancel, &mut stats).await?;
            }
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read input")? else {
                    debug!("input closed");
                    break;
                };
                stats.lines_read += 1;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<TelemetryRecord>(&line) {
                    Ok(mut record) => {
                        record.ensure_key();
                        if batch.is_empty() {
                            linger.as_mut().reset(Instant::now() + options.linger);
                        }
                        batch.push(record);
                    }
                    Err(e) => {
                        stats.malformed += 1;
                        warn!(error = %e, line = stats.lines_read, "skipping malformed record");
                    }
                }
                if batch.len() >= batch_size {
                    drain(pipeline, &mut batch, &mut writer, cancel, &mut stats).await?;
                }
            }
        }
    }

    if !batch.is_empty() {
        drain(pipeline, &mut batch, &mut writer, cancel, &mut stats).await?;
    }
    writer.flush().await.context("Failed to flush output")?;
    Ok(stats)
}

async fn drain<W>(
    pipeline: &AdmissionPipeline,
    batch: &mut Vec<TelemetryRecord>,
    writer: &mut BufWriter<W>,
    cancel: &CancellationToken,
    stats: &mut IngestStats,
) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let outcome = pipeline.process(std::mem::take(batch), cancel);
    stats.batches += 1;
    stats.admitted += outcome.records.len() as u64;
    stats.unprocessed += outcome.unprocessed as u64;
    if outcome.cancelled {
        warn!(unprocessed = outcome.unprocessed, "batch cut short by shutdown");
    }

    for record in &outcome.records {
        let mut line = serde_json::to_vec(record).context("Failed to encode record")?;
        line.push(b'\n');
        writer.write_all(&line).await.context("Failed to write output")?;
    }
    writer.flush().await.context("Failed to flush output")?;
    Ok(())
}
