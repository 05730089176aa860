use crate::metrics::{ErrorKind, MetricEvent, MetricsHandle};
use crate::record::{RawLine, Record};
use std::sync::Arc;
use tracing::{debug, warn};

pub mod access_log;

pub use access_log::{AccessLogParser, TimestampPolicy};

const PREVIEW_CHARS: usize = 256;

/// Parser worker: drain the raw-line queue until every sender is gone.
///
/// Lines that fail to parse are counted and skipped. Returns the number of records produced.
pub async fn run_parser(
    worker: usize,
    parser: Arc<AccessLogParser>,
    raw_rx: flume::Receiver<RawLine>,
    record_tx: flume::Sender<Record>,
    metrics: MetricsHandle,
) -> u64 {
    let mut produced = 0u64;

    while let Ok(line) = raw_rx.recv_async().await {
        match parser.parse(line.as_bytes()) {
            Ok(record) => {
                if record_tx.send_async(record).await.is_err() {
                    warn!(worker, "record queue closed; stopping parser");
                    break;
                }
                metrics.emit(MetricEvent::LineHandled);
                produced += 1;
            }
            Err(err) => {
                metrics.error(ErrorKind::Parse);
                warn!(
                    worker,
                    error = %err,
                    line = %line_preview(line.as_bytes(), PREVIEW_CHARS),
                    "skipping unparseable line"
                );
            }
        }
    }

    debug!(worker, produced, "parser worker finished");
    produced
}

/// Lossy text preview of a line, truncated to `limit` characters.
pub(crate) fn line_preview(line: &[u8], limit: usize) -> String {
    let text = String::from_utf8_lossy(line);
    let mut preview: String = text.chars().take(limit).collect();
    if text.chars().nth(limit).is_some() {
        preview.push('…');
    }
    preview
}
