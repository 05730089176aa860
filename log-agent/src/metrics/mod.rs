//! Pipeline metrics.
//!
//! Producers (reader, parsers, writers) only ever hold a [`MetricsHandle`] and emit
//! [`MetricEvent`]s. The [`MetricsCollector`] task is the single owner of every counter and
//! publishes its state through a watch channel; [`MetricsReader`] combines that state with
//! live queue depths to build a [`StatsSnapshot`].
//!
//! Counters are mirrored into a per-collector Prometheus registry:
//! - Counters: `log_agent_*_total`
//! - Gauges: throughput and queue depths

mod collector;
mod snapshot;

pub use collector::{CollectorPhase, CollectorState, MetricsCollector, ThroughputWindow};
pub use snapshot::{MetricsReader, QueueDepth, StatsSnapshot};

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::debug;

pub const DEFAULT_EVENT_CAPACITY: usize = 200;

/// Failure classes counted by the collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Read,
    Parse,
    Sink,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Read => "read",
            ErrorKind::Parse => "parse",
            ErrorKind::Sink => "sink",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricEvent {
    /// The reader pushed a complete line onto the raw-line queue.
    LineIngested,
    /// A parser turned a line into a record.
    LineHandled,
    /// `count` failures of one kind, e.g. every record of a dropped batch.
    ErrorOccurred { kind: ErrorKind, count: u64 },
}

/// Cheap, cloneable producer side of the metrics event channel.
#[derive(Debug, Clone)]
pub struct MetricsHandle {
    tx: mpsc::Sender<MetricEvent>,
}

impl MetricsHandle {
    pub(crate) fn new(tx: mpsc::Sender<MetricEvent>) -> Self {
        Self { tx }
    }

    /// Fire-and-forget. A full or closed channel drops the event; ingestion never waits on
    /// metrics.
    pub fn emit(&self, event: MetricEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                debug!(?event, "metrics channel full; dropping event");
            }
            Err(TrySendError::Closed(event)) => {
                debug!(?event, "metrics collector stopped; dropping event");
            }
        }
    }

    pub fn error(&self, kind: ErrorKind) {
        self.emit(MetricEvent::ErrorOccurred { kind, count: 1 });
    }

    /// Report `count` failures as one event, waiting for channel space instead of dropping it.
    /// Meant for rare paths such as a dropped sink batch.
    pub async fn report_errors(&self, kind: ErrorKind, count: u64) {
        if count == 0 {
            return;
        }
        let event = MetricEvent::ErrorOccurred { kind, count };
        if self.tx.send(event).await.is_err() {
            debug!(?event, "metrics collector stopped; dropping event");
        }
    }
}
