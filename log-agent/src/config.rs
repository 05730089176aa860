use crate::error::DescriptorError;
use crate::parsers::TimestampPolicy;
use crate::sink::{InfluxSettings, Precision, WriterConfig};
use anyhow::{anyhow, Context, Result};
use chrono_tz::Tz;
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_POLL_INTERVAL_MS: u64 = 500;
const DEFAULT_TIMEZONE: &str = "UTC";
const DEFAULT_BATCH_SIZE: usize = 100;
const DEFAULT_FLUSH_INTERVAL_MS: u64 = 1_000;
const DEFAULT_MAX_ATTEMPTS: usize = 3;
const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 200;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_QUEUE_CAPACITY: usize = 200;
const DEFAULT_PARSER_WORKERS: usize = 2;
const DEFAULT_WRITER_WORKERS: usize = 4;
const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:9093";
const DEFAULT_TICK_SECS: u64 = 5;
const DEFAULT_EVENT_CAPACITY: usize = 200;

#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    pub source: SourceConfig,
    pub sink: SinkConfig,
    pub pipeline: PipelineConfig,
    pub monitor: MonitorConfig,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct SourceConfig {
    pub path: String,
    pub poll_interval_ms: u64,
    /// IANA zone records are presented in, e.g. `Asia/Shanghai`.
    pub timezone: String,
    pub timestamp_policy: TimestampPolicy,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct SinkConfig {
    pub address: String,
    pub username: String,
    pub password: String,
    pub database: String,
    pub precision: Precision,
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    pub max_attempts: usize,
    pub retry_base_delay_ms: u64,
    pub request_timeout_ms: u64,
    pub dead_letter_path: Option<String>,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    pub queue_capacity: usize,
    pub parser_workers: usize,
    pub writer_workers: usize,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct MonitorConfig {
    pub listen_addr: String,
    pub tick_secs: u64,
    pub event_capacity: usize,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            path: String::new(),
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            timezone: DEFAULT_TIMEZONE.to_string(),
            timestamp_policy: TimestampPolicy::default(),
        }
    }
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            username: String::new(),
            password: String::new(),
            database: String::new(),
            precision: Precision::default(),
            batch_size: DEFAULT_BATCH_SIZE,
            flush_interval_ms: DEFAULT_FLUSH_INTERVAL_MS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_base_delay_ms: DEFAULT_RETRY_BASE_DELAY_MS,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            dead_letter_path: None,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            parser_workers: DEFAULT_PARSER_WORKERS,
            writer_workers: DEFAULT_WRITER_WORKERS,
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            tick_secs: DEFAULT_TICK_SECS,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

/// Legacy positional sink descriptor: `address@username@password@database@precision`.
///
/// None of the values may contain `@`; use the `[sink]` table when they do.
#[derive(Debug, Clone, PartialEq)]
pub struct SinkDescriptor {
    pub address: String,
    pub username: String,
    pub password: String,
    pub database: String,
    pub precision: Precision,
}

impl FromStr for SinkDescriptor {
    type Err = DescriptorError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = value.trim().split('@').collect();
        let [address, username, password, database, precision] = parts.as_slice() else {
            return Err(DescriptorError::FieldCount(parts.len()));
        };
        if address.is_empty() {
            return Err(DescriptorError::Empty("address"));
        }
        if database.is_empty() {
            return Err(DescriptorError::Empty("database"));
        }
        let precision: Precision = precision
            .parse()
            .map_err(|other: String| DescriptorError::Precision(other))?;

        Ok(Self {
            address: address.to_string(),
            username: username.to_string(),
            password: password.to_string(),
            database: database.to_string(),
            precision,
        })
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    pub fn apply_descriptor(&mut self, descriptor: &SinkDescriptor) {
        self.sink.address = descriptor.address.clone();
        self.sink.username = descriptor.username.clone();
        self.sink.password = descriptor.password.clone();
        self.sink.database = descriptor.database.clone();
        self.sink.precision = descriptor.precision;
    }

    pub fn validate(&self) -> Result<()> {
        if self.source.path.trim().is_empty() {
            anyhow::bail!("source path cannot be empty");
        }
        if self.sink.address.trim().is_empty() {
            anyhow::bail!("sink address cannot be empty");
        }
        if self.sink.database.trim().is_empty() {
            anyhow::bail!("sink database cannot be empty");
        }
        if self.pipeline.queue_capacity == 0 {
            anyhow::bail!("pipeline.queue_capacity must be at least 1");
        }
        if self.pipeline.parser_workers == 0 || self.pipeline.writer_workers == 0 {
            anyhow::bail!("pipeline worker counts must be at least 1");
        }
        if self.sink.batch_size == 0 || self.sink.max_attempts == 0 {
            anyhow::bail!("sink.batch_size and sink.max_attempts must be at least 1");
        }
        if self.monitor.tick_secs == 0 || self.monitor.event_capacity == 0 {
            anyhow::bail!("monitor.tick_secs and monitor.event_capacity must be at least 1");
        }
        self.timezone()?;
        self.listen_addr()?;
        Ok(())
    }

    pub fn source_path(&self) -> PathBuf {
        expand(&self.source.path)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.source.poll_interval_ms)
    }

    pub fn timezone(&self) -> Result<Tz> {
        self.source
            .timezone
            .parse::<Tz>()
            .map_err(|err| anyhow!("unknown time zone {:?}: {err}", self.source.timezone))
    }

    pub fn influx_settings(&self) -> InfluxSettings {
        InfluxSettings {
            address: self.sink.address.clone(),
            username: self.sink.username.clone(),
            password: self.sink.password.clone(),
            database: self.sink.database.clone(),
            precision: self.sink.precision,
            request_timeout: Duration::from_millis(self.sink.request_timeout_ms),
        }
    }

    pub fn writer_config(&self) -> WriterConfig {
        WriterConfig {
            batch_size: self.sink.batch_size,
            flush_interval: Duration::from_millis(self.sink.flush_interval_ms),
            max_attempts: self.sink.max_attempts,
            retry_base_delay: Duration::from_millis(self.sink.retry_base_delay_ms),
        }
    }

    pub fn dead_letter_path(&self) -> Option<PathBuf> {
        self.sink
            .dead_letter_path
            .as_deref()
            .map(str::trim)
            .filter(|path| !path.is_empty())
            .map(expand)
    }

    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.monitor
            .listen_addr
            .parse()
            .with_context(|| format!("invalid monitor listen address {:?}", self.monitor.listen_addr))
    }

    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.monitor.tick_secs)
    }
}

fn expand(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).as_ref())
}
