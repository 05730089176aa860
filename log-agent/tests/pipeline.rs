use log_agent::metrics::CollectorPhase;
use log_agent::parsers::{AccessLogParser, TimestampPolicy};
use log_agent::pipeline::{Pipeline, PipelineOptions};
use log_agent::sink::{MemorySink, WriterConfig};
use log_agent::tailer::MemoryLineSource;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn access_line(n: usize) -> String {
    format!(
        r#"192.168.1.{host} - - [04/Mar/2021:13:49:52 +0000] http "GET /item/{n}?page=2 HTTP/1.1" 200 {n} "-" "bench" "-" 0.004 0.005"#,
        host = n % 250 + 1
    )
}

fn tight_options() -> PipelineOptions {
    PipelineOptions {
        queue_capacity: 1,
        parser_workers: 3,
        writer_workers: 2,
        writer: WriterConfig {
            batch_size: 7,
            flush_interval: Duration::from_millis(5),
            max_attempts: 5,
            retry_base_delay: Duration::from_millis(1),
        },
        tick: Duration::from_secs(5),
        event_capacity: 4096,
        shutdown_timeout: Duration::from_secs(10),
    }
}

fn parser() -> Arc<AccessLogParser> {
    Arc::new(AccessLogParser::new(chrono_tz::UTC, TimestampPolicy::Embedded).unwrap())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_slot_queues_lose_nothing() {
    let lines: Vec<String> = (0..500).map(access_line).collect();
    let sink = MemorySink::new();
    sink.fail_next(3).await;

    let pipeline = Pipeline::start(
        MemoryLineSource::new(lines.iter().map(String::as_str)),
        parser(),
        Arc::new(sink.clone()),
        None,
        &tight_options(),
        CancellationToken::new(),
    )
    .unwrap();
    let report = pipeline.join().await.unwrap();

    assert_eq!(report.ingested, 500);
    assert_eq!(report.produced, 500);
    assert_eq!(report.writers.delivered, 500);
    assert_eq!(report.writers.dropped, 0);

    let delivered: HashSet<u64> = sink
        .records()
        .await
        .into_iter()
        .map(|record| record.bytes_sent)
        .collect();
    assert_eq!(delivered, (0..500).collect::<HashSet<u64>>());
    assert!(sink.batch_sizes().await.iter().all(|size| *size <= 7));
}

#[tokio::test]
async fn malformed_lines_are_counted_not_delivered() {
    let mut lines: Vec<String> = (0..10).map(access_line).collect();
    lines.insert(3, "GET /not-a-log-line".to_string());
    lines.insert(7, access_line(99).replace("0.005", "fast"));
    let sink = MemorySink::new();

    let pipeline = Pipeline::start(
        MemoryLineSource::new(lines.iter().map(String::as_str)),
        parser(),
        Arc::new(sink.clone()),
        None,
        &tight_options(),
        CancellationToken::new(),
    )
    .unwrap();
    let metrics = pipeline.metrics();
    let report = pipeline.join().await.unwrap();

    assert_eq!(report.ingested, 12);
    assert_eq!(report.metrics.parse_errors, 2);
    assert_eq!(report.metrics.lines_handled, 10);
    assert_eq!(report.metrics.phase, CollectorPhase::Stopped);
    assert_eq!(sink.records().await.len(), 10);

    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.lines_handled, 10);
    assert_eq!(snapshot.errors, 2);
    assert_eq!(snapshot.raw_queue_depth, 0);
    assert_eq!(snapshot.record_queue_depth, 0);
}

#[tokio::test]
async fn exhausted_retries_drop_and_count_each_record() {
    let lines: Vec<String> = (0..4).map(access_line).collect();
    let sink = MemorySink::new();
    sink.reject_with(503).await;

    let mut options = tight_options();
    options.writer.batch_size = 2;
    options.writer_workers = 1;
    let pipeline = Pipeline::start(
        MemoryLineSource::new(lines.iter().map(String::as_str)),
        parser(),
        Arc::new(sink.clone()),
        None,
        &options,
        CancellationToken::new(),
    )
    .unwrap();
    let report = pipeline.join().await.unwrap();

    assert_eq!(report.writers.delivered, 0);
    assert_eq!(report.writers.dropped, 4);
    assert_eq!(report.metrics.sink_errors, 4);
    assert_eq!(report.metrics.total_errors(), 4);
}
