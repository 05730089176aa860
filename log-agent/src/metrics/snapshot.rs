use super::collector::CollectorState;
use prometheus::{Encoder, IntGaugeVec, Registry, TextEncoder};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Anything that can report how many items are waiting in it.
pub trait QueueDepth: Send + Sync {
    fn depth(&self) -> usize;
}

impl<T: Send> QueueDepth for flume::Receiver<T> {
    fn depth(&self) -> usize {
        self.len()
    }
}

/// Monitoring payload served at `/monitor`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsSnapshot {
    #[serde(rename = "handleLine")]
    pub lines_handled: u64,
    #[serde(rename = "tps")]
    pub throughput: f64,
    #[serde(rename = "readChannelLen")]
    pub raw_queue_depth: usize,
    #[serde(rename = "writeChannelLen")]
    pub record_queue_depth: usize,
    #[serde(rename = "runTime")]
    pub uptime: String,
    #[serde(rename = "errNum")]
    pub errors: u64,
}

/// Read-only access to collector state. Never mutates counters.
#[derive(Clone)]
pub struct MetricsReader {
    state: watch::Receiver<CollectorState>,
    raw_queue: Arc<dyn QueueDepth>,
    record_queue: Arc<dyn QueueDepth>,
    started_at: Instant,
    registry: Registry,
    queue_depth: IntGaugeVec,
}

impl MetricsReader {
    pub(super) fn new(
        state: watch::Receiver<CollectorState>,
        raw_queue: Arc<dyn QueueDepth>,
        record_queue: Arc<dyn QueueDepth>,
        started_at: Instant,
        registry: Registry,
        queue_depth: IntGaugeVec,
    ) -> Self {
        Self {
            state,
            raw_queue,
            record_queue,
            started_at,
            registry,
            queue_depth,
        }
    }

    /// Latest published collector state.
    pub fn state(&self) -> CollectorState {
        self.state.borrow().clone()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let state = self.state();
        StatsSnapshot {
            lines_handled: state.lines_handled,
            throughput: state.throughput,
            raw_queue_depth: self.raw_queue.depth(),
            record_queue_depth: self.record_queue.depth(),
            uptime: format_uptime(self.started_at.elapsed()),
            errors: state.total_errors(),
        }
    }

    /// Prometheus text exposition. Queue gauges are refreshed at gather time.
    pub fn encode_prometheus(&self) -> prometheus::Result<Vec<u8>> {
        self.queue_depth
            .with_label_values(&["raw"])
            .set(self.raw_queue.depth() as i64);
        self.queue_depth
            .with_label_values(&["record"])
            .set(self.record_queue.depth() as i64);

        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(buffer)
    }
}

fn format_uptime(uptime: Duration) -> String {
    humantime::format_duration(Duration::from_millis(uptime.as_millis() as u64)).to_string()
}
