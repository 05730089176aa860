use super::snapshot::{MetricsReader, QueueDepth};
use super::{ErrorKind, MetricEvent, MetricsHandle};
use prometheus::{Gauge, IntCounterVec, IntGaugeVec, Opts, Registry};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub const DEFAULT_TICK: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CollectorPhase {
    #[default]
    Initializing,
    Running,
    Stopped,
}

/// Counter state owned by the collector task and published after every change.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CollectorState {
    pub phase: CollectorPhase,
    pub lines_ingested: u64,
    pub lines_handled: u64,
    pub read_errors: u64,
    pub parse_errors: u64,
    pub sink_errors: u64,
    /// Lines handled per second over the last tick.
    pub throughput: f64,
}

impl CollectorState {
    pub fn total_errors(&self) -> u64 {
        self.read_errors + self.parse_errors + self.sink_errors
    }
}

/// Two-sample sliding window over a cumulative counter.
#[derive(Debug, Clone)]
pub struct ThroughputWindow {
    samples: VecDeque<u64>,
    interval: Duration,
}

impl ThroughputWindow {
    pub fn new(interval: Duration) -> Self {
        Self {
            samples: VecDeque::with_capacity(2),
            interval,
        }
    }

    pub fn record(&mut self, sample: u64) {
        self.samples.push_back(sample);
        if self.samples.len() > 2 {
            self.samples.pop_front();
        }
    }

    /// `(latest - previous) / interval`, or zero until two samples exist.
    pub fn rate(&self) -> f64 {
        let secs = self.interval.as_secs_f64();
        match (self.samples.front(), self.samples.back()) {
            (Some(previous), Some(latest)) if self.samples.len() == 2 && secs > 0.0 => {
                latest.saturating_sub(*previous) as f64 / secs
            }
            _ => 0.0,
        }
    }
}

/// Prometheus mirror of the collector counters.
#[derive(Clone)]
struct PromMetrics {
    lines: IntCounterVec,
    errors: IntCounterVec,
    throughput: Gauge,
    queue_depth: IntGaugeVec,
}

impl PromMetrics {
    fn register(registry: &Registry) -> prometheus::Result<Self> {
        let lines = IntCounterVec::new(
            Opts::new("log_agent_lines_total", "Lines seen by pipeline stage"),
            &["stage"],
        )?;
        let errors = IntCounterVec::new(
            Opts::new("log_agent_errors_total", "Errors by kind"),
            &["kind"],
        )?;
        let throughput = Gauge::new(
            "log_agent_throughput_lines_per_second",
            "Lines handled per second over the last sampling window",
        )?;
        let queue_depth = IntGaugeVec::new(
            Opts::new("log_agent_queue_depth", "Items waiting in a pipeline queue"),
            &["queue"],
        )?;

        registry.register(Box::new(lines.clone()))?;
        registry.register(Box::new(errors.clone()))?;
        registry.register(Box::new(throughput.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;

        Ok(Self {
            lines,
            errors,
            throughput,
            queue_depth,
        })
    }
}

/// Single-writer owner of all pipeline counters.
pub struct MetricsCollector {
    rx: mpsc::Receiver<MetricEvent>,
    state: CollectorState,
    state_tx: watch::Sender<CollectorState>,
    window: ThroughputWindow,
    tick: Duration,
    registry: Registry,
    prom: PromMetrics,
    started_at: Instant,
}

impl MetricsCollector {
    pub fn new(tick: Duration, event_capacity: usize) -> prometheus::Result<(Self, MetricsHandle)> {
        let (tx, rx) = mpsc::channel(event_capacity.max(1));
        let (state_tx, _) = watch::channel(CollectorState::default());
        let registry = Registry::new();
        let prom = PromMetrics::register(&registry)?;

        let collector = Self {
            rx,
            state: CollectorState::default(),
            state_tx,
            window: ThroughputWindow::new(tick),
            tick,
            registry,
            prom,
            started_at: Instant::now(),
        };
        Ok((collector, MetricsHandle::new(tx)))
    }

    /// Read-only view over this collector plus the two pipeline queues.
    pub fn reader(
        &self,
        raw_queue: Arc<dyn QueueDepth>,
        record_queue: Arc<dyn QueueDepth>,
    ) -> MetricsReader {
        MetricsReader::new(
            self.state_tx.subscribe(),
            raw_queue,
            record_queue,
            self.started_at,
            self.registry.clone(),
            self.prom.queue_depth.clone(),
        )
    }

    /// Consume events until `shutdown` fires or every [`MetricsHandle`] is dropped.
    ///
    /// On shutdown the events already queued are applied before the collector stops.
    pub async fn run(mut self, shutdown: CancellationToken) -> CollectorState {
        self.window.record(self.state.lines_handled);
        self.state.phase = CollectorPhase::Running;
        self.publish();
        info!(tick_secs = self.tick.as_secs_f64(), "metrics collector running");

        let mut ticker = interval_at(tokio::time::Instant::now() + self.tick, self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                maybe_event = self.rx.recv() => match maybe_event {
                    Some(event) => self.apply(event),
                    None => {
                        debug!("all metrics producers dropped");
                        break;
                    }
                },
                _ = ticker.tick() => self.sample(),
                _ = shutdown.cancelled() => {
                    self.rx.close();
                    while let Ok(event) = self.rx.try_recv() {
                        self.apply(event);
                    }
                    break;
                }
            }
        }

        self.state.phase = CollectorPhase::Stopped;
        self.publish();
        info!(
            lines_ingested = self.state.lines_ingested,
            lines_handled = self.state.lines_handled,
            errors = self.state.total_errors(),
            "metrics collector stopped"
        );
        self.state
    }

    fn apply(&mut self, event: MetricEvent) {
        match event {
            MetricEvent::LineIngested => {
                self.state.lines_ingested += 1;
                self.prom.lines.with_label_values(&["ingested"]).inc();
            }
            MetricEvent::LineHandled => {
                self.state.lines_handled += 1;
                self.prom.lines.with_label_values(&["handled"]).inc();
            }
            MetricEvent::ErrorOccurred { kind, count } => {
                match kind {
                    ErrorKind::Read => self.state.read_errors += count,
                    ErrorKind::Parse => self.state.parse_errors += count,
                    ErrorKind::Sink => self.state.sink_errors += count,
                }
                self.prom
                    .errors
                    .with_label_values(&[kind.as_str()])
                    .inc_by(count);
            }
        }
        self.publish();
    }

    fn sample(&mut self) {
        self.window.record(self.state.lines_handled);
        self.state.throughput = self.window.rate();
        self.prom.throughput.set(self.state.throughput);
        debug!(throughput = self.state.throughput, "sampled throughput");
        self.publish();
    }

    fn publish(&self) {
        self.state_tx.send_replace(self.state.clone());
    }
}
