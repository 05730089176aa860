use super::{DeadLetterWriter, RecordSink};
use crate::error::SinkError;
use crate::metrics::{ErrorKind, MetricsHandle};
use crate::record::Record;
use crate::tailer::sleep_or_cancel;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq)]
pub struct WriterConfig {
    /// Flush once this many records are buffered. `1` writes every record on its own.
    pub batch_size: usize,
    /// Flush a non-empty batch this long after its first record arrived.
    pub flush_interval: Duration,
    pub max_attempts: usize,
    pub retry_base_delay: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            flush_interval: Duration::from_secs(1),
            max_attempts: 3,
            retry_base_delay: Duration::from_millis(200),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterStats {
    pub delivered: u64,
    pub dropped: u64,
    pub batches: u64,
}

/// One writer worker. Several share the record queue and the sink.
pub struct SinkWriter {
    worker: usize,
    sink: Arc<dyn RecordSink>,
    config: WriterConfig,
    metrics: MetricsHandle,
    dead_letter: Option<Arc<DeadLetterWriter>>,
    cancel: CancellationToken,
}

impl SinkWriter {
    pub fn new(
        worker: usize,
        sink: Arc<dyn RecordSink>,
        config: WriterConfig,
        metrics: MetricsHandle,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            worker,
            sink,
            config,
            metrics,
            dead_letter: None,
            cancel,
        }
    }

    pub fn with_dead_letter(mut self, dead_letter: Option<Arc<DeadLetterWriter>>) -> Self {
        self.dead_letter = dead_letter;
        self
    }

    /// Batch records from `record_rx` until it is closed and drained, flushing the final
    /// partial batch before returning.
    pub async fn run(self, record_rx: flume::Receiver<Record>) -> WriterStats {
        let batch_size = self.config.batch_size.max(1);
        let mut stats = WriterStats::default();

        loop {
            let first = match record_rx.recv_async().await {
                Ok(record) => record,
                Err(_) => break,
            };

            let mut batch = Vec::with_capacity(batch_size);
            batch.push(first);
            let deadline = Instant::now() + self.config.flush_interval;
            let mut closed = false;

            while batch.len() < batch_size {
                match timeout_at(deadline, record_rx.recv_async()).await {
                    Ok(Ok(record)) => batch.push(record),
                    Ok(Err(_)) => {
                        closed = true;
                        break;
                    }
                    Err(_) => break,
                }
            }

            let count = batch.len() as u64;
            stats.batches += 1;
            if self.flush(batch).await {
                stats.delivered += count;
            } else {
                stats.dropped += count;
            }

            if closed {
                break;
            }
        }

        info!(
            worker = self.worker,
            delivered = stats.delivered,
            dropped = stats.dropped,
            batches = stats.batches,
            "sink writer finished"
        );
        stats
    }

    /// Write `batch` with bounded exponential backoff. Returns `false` if it was dropped.
    async fn flush(&self, batch: Vec<Record>) -> bool {
        let max_attempts = self.config.max_attempts.max(1);
        let mut backoff = self.config.retry_base_delay.max(Duration::from_millis(1));
        let mut attempt = 0usize;

        let last_error = loop {
            attempt += 1;
            match self.sink.write_batch(&batch).await {
                Ok(()) => {
                    debug!(
                        worker = self.worker,
                        records = batch.len(),
                        attempt,
                        "batch delivered"
                    );
                    return true;
                }
                Err(err) if !err.is_retryable() => break err,
                Err(err) if attempt >= max_attempts => break err,
                Err(err) => {
                    warn!(
                        worker = self.worker,
                        attempt,
                        max_attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %err,
                        "sink write failed; retrying with backoff"
                    );
                    if sleep_or_cancel(backoff, &self.cancel).await {
                        break err;
                    }
                    backoff = std::cmp::min(backoff.saturating_mul(2), MAX_BACKOFF);
                }
            }
        };

        self.drop_batch(&batch, attempt, &last_error).await;
        false
    }

    async fn drop_batch(&self, batch: &[Record], attempts: usize, err: &SinkError) {
        error!(
            worker = self.worker,
            records = batch.len(),
            attempts,
            error = %err,
            "dropping batch after failed delivery"
        );
        self.metrics
            .report_errors(ErrorKind::Sink, batch.len() as u64)
            .await;

        if let Some(dead_letter) = &self.dead_letter {
            if let Err(dl_err) = dead_letter.append(batch, &err.to_string()).await {
                warn!(
                    worker = self.worker,
                    error = %dl_err,
                    path = %dead_letter.path().display(),
                    "failed to dead-letter dropped batch"
                );
            }
        }
    }
}
