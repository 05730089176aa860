//! Stage wiring and ordered shutdown.
//!
//! ```text
//! reader ──raw queue──▶ parser × N ──record queue──▶ writer × M ──▶ sink
//!    └────────────── metric events ──────────────▶ collector
//! ```
//!
//! Both queues are bounded, so a slow sink throttles the parsers and eventually the reader.
//! Shutdown flows downstream: once the reader returns, its sender drops and each stage drains
//! the queue in front of it before its own senders drop.

use crate::config::Config;
use crate::error::TailError;
use crate::metrics::{CollectorState, MetricsCollector, MetricsReader};
use crate::parsers::{run_parser, AccessLogParser};
use crate::record::{RawLine, Record};
use crate::sink::{DeadLetterWriter, RecordSink, SinkWriter, WriterConfig, WriterStats};
use crate::tailer::{run_reader, LineSource};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineOptions {
    pub queue_capacity: usize,
    pub parser_workers: usize,
    pub writer_workers: usize,
    pub writer: WriterConfig,
    pub tick: Duration,
    pub event_capacity: usize,
    /// How long each downstream stage may take to drain after the reader stops.
    pub shutdown_timeout: Duration,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl PipelineOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            queue_capacity: config.pipeline.queue_capacity,
            parser_workers: config.pipeline.parser_workers,
            writer_workers: config.pipeline.writer_workers,
            writer: config.writer_config(),
            tick: config.tick(),
            event_capacity: config.monitor.event_capacity,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

/// Totals gathered while the pipeline shut down.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineReport {
    pub ingested: u64,
    pub produced: u64,
    pub writers: WriterStats,
    pub metrics: CollectorState,
}

/// A running pipeline. Dropping it detaches the tasks; call [`Pipeline::join`] to drain.
pub struct Pipeline {
    reader: JoinHandle<Result<u64, TailError>>,
    parsers: Vec<JoinHandle<u64>>,
    writers: Vec<JoinHandle<WriterStats>>,
    collector: JoinHandle<CollectorState>,
    collector_shutdown: CancellationToken,
    metrics: MetricsReader,
    shutdown_timeout: Duration,
}

impl Pipeline {
    /// Spawn every stage. `cancel` stops the reader and cuts sink retry backoff short; the
    /// rest of the pipeline winds down as its input queues empty.
    pub fn start<S>(
        source: S,
        parser: Arc<AccessLogParser>,
        sink: Arc<dyn RecordSink>,
        dead_letter: Option<Arc<DeadLetterWriter>>,
        options: &PipelineOptions,
        cancel: CancellationToken,
    ) -> Result<Self>
    where
        S: LineSource + 'static,
    {
        let capacity = options.queue_capacity.max(1);
        let (raw_tx, raw_rx) = flume::bounded::<RawLine>(capacity);
        let (record_tx, record_rx) = flume::bounded::<Record>(capacity);

        let (collector, metrics_handle) =
            MetricsCollector::new(options.tick, options.event_capacity)
                .context("failed to register pipeline metrics")?;
        let metrics = collector.reader(Arc::new(raw_rx.clone()), Arc::new(record_rx.clone()));
        let collector_shutdown = CancellationToken::new();
        let collector = tokio::spawn(collector.run(collector_shutdown.clone()));

        let reader = tokio::spawn(run_reader(
            source,
            raw_tx,
            metrics_handle.clone(),
            cancel.clone(),
        ));

        let parsers = (0..options.parser_workers.max(1))
            .map(|worker| {
                tokio::spawn(run_parser(
                    worker,
                    parser.clone(),
                    raw_rx.clone(),
                    record_tx.clone(),
                    metrics_handle.clone(),
                ))
            })
            .collect();

        let writers = (0..options.writer_workers.max(1))
            .map(|worker| {
                let writer = SinkWriter::new(
                    worker,
                    sink.clone(),
                    options.writer.clone(),
                    metrics_handle.clone(),
                    cancel.clone(),
                )
                .with_dead_letter(dead_letter.clone());
                tokio::spawn(writer.run(record_rx.clone()))
            })
            .collect();

        info!(
            queue_capacity = capacity,
            parser_workers = options.parser_workers.max(1),
            writer_workers = options.writer_workers.max(1),
            "pipeline started"
        );

        Ok(Self {
            reader,
            parsers,
            writers,
            collector,
            collector_shutdown,
            metrics,
            shutdown_timeout: options.shutdown_timeout,
        })
    }

    pub fn metrics(&self) -> MetricsReader {
        self.metrics.clone()
    }

    /// Wait for the reader to finish, then drain parsers, writers and the collector in order.
    ///
    /// A fatal reader error is returned only after the downstream stages have drained.
    pub async fn join(self) -> Result<PipelineReport> {
        let mut report = PipelineReport::default();

        let reader_error = match self.reader.await {
            Ok(Ok(ingested)) => {
                report.ingested = ingested;
                None
            }
            Ok(Err(err)) => Some(anyhow::Error::new(err)),
            Err(err) => Some(anyhow::Error::new(err).context("reader task failed")),
        };

        for handle in self.parsers {
            if let Some(produced) = join_within("parser", handle, self.shutdown_timeout).await {
                report.produced += produced;
            }
        }
        info!(produced = report.produced, "parsers drained");

        for handle in self.writers {
            if let Some(stats) = join_within("writer", handle, self.shutdown_timeout).await {
                report.writers.delivered += stats.delivered;
                report.writers.dropped += stats.dropped;
                report.writers.batches += stats.batches;
            }
        }
        info!(
            delivered = report.writers.delivered,
            dropped = report.writers.dropped,
            "writers drained"
        );

        self.collector_shutdown.cancel();
        if let Some(state) = join_within("collector", self.collector, self.shutdown_timeout).await {
            report.metrics = state;
        }

        match reader_error {
            Some(err) => Err(err),
            None => Ok(report),
        }
    }
}

async fn join_within<T>(
    stage: &'static str,
    mut handle: JoinHandle<T>,
    limit: Duration,
) -> Option<T> {
    match timeout(limit, &mut handle).await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(err)) => {
            warn!(stage, error = %err, "task exited abnormally during shutdown");
            None
        }
        Err(_) => {
            warn!(stage, "task did not stop within timeout; aborting");
            handle.abort();
            None
        }
    }
}
