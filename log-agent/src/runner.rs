//! Top-level execution: build every component from [`Config`], run until cancelled, drain.

use crate::config::Config;
use crate::parsers::AccessLogParser;
use crate::pipeline::{Pipeline, PipelineOptions, PipelineReport};
use crate::server;
use crate::sink::{DeadLetterWriter, InfluxSink, RecordSink};
use crate::tailer::FileTailer;
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Build the InfluxDB sink described by `config`.
pub fn build_record_sink(config: &Config) -> Result<Arc<dyn RecordSink>> {
    let sink = InfluxSink::new(&config.influx_settings())?;
    info!(
        url = %redacted(sink.write_url()),
        precision = %config.sink.precision,
        "configured influxdb sink"
    );
    Ok(Arc::new(sink))
}

/// Run the agent until `cancel` fires, then drain and return the final totals.
///
/// Everything that can fail at startup (time zone, source file, sink address, dead-letter file,
/// monitor port) is checked before any stage is spawned.
pub async fn run(config: &Config, cancel: CancellationToken) -> Result<PipelineReport> {
    info!("log-agent starting");

    let zone = config.timezone()?;
    let parser = Arc::new(AccessLogParser::new(zone, config.source.timestamp_policy)?);
    let source_path = config.source_path();
    let tailer = FileTailer::open(&source_path, config.poll_interval())
        .await
        .with_context(|| format!("cannot tail {}", source_path.display()))?;
    let sink = build_record_sink(config)?;
    let dead_letter = match config.dead_letter_path() {
        Some(path) => Some(Arc::new(DeadLetterWriter::open(path).await?)),
        None => None,
    };
    let listener = server::bind(config.listen_addr()?).await?;

    let pipeline = Pipeline::start(
        tailer,
        parser,
        sink,
        dead_letter,
        &PipelineOptions::from_config(config),
        cancel,
    )?;

    let server_shutdown = CancellationToken::new();
    let server_handle = tokio::spawn(server::serve(
        listener,
        pipeline.metrics(),
        server_shutdown.clone(),
    ));

    info!(
        path = %source_path.display(),
        zone = %zone,
        "log-agent started; tailing for new lines"
    );

    let result = pipeline.join().await;

    server_shutdown.cancel();
    if let Err(err) = server_handle.await {
        warn!(error = %err, "monitor server exited with error during shutdown");
    }

    let report = result?;
    info!(
        ingested = report.ingested,
        handled = report.metrics.lines_handled,
        delivered = report.writers.delivered,
        dropped = report.writers.dropped,
        errors = report.metrics.total_errors(),
        "log-agent stopped"
    );
    Ok(report)
}

fn redacted(url: &url::Url) -> url::Url {
    let mut url = url.clone();
    if url.password().is_some() {
        let _ = url.set_password(Some("***"));
    }
    url
}
