//! Delivery of parsed records to the time-series store.

use crate::error::SinkError;
use crate::record::Record;
use async_trait::async_trait;
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;

mod dead_letter;
mod influx;
pub mod line_protocol;
mod memory;
mod writer;

pub use dead_letter::DeadLetterWriter;
pub use influx::{InfluxSettings, InfluxSink};
pub use memory::MemorySink;
pub use writer::{SinkWriter, WriterConfig, WriterStats};

#[async_trait]
pub trait RecordSink: Send + Sync {
    /// Write every record in `records` as one request. An error means none of them are
    /// known to have been stored.
    async fn write_batch(&self, records: &[Record]) -> Result<(), SinkError>;
}

/// Timestamp precision understood by the InfluxDB 1.x write endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum Precision {
    Nanoseconds,
    Microseconds,
    Milliseconds,
    #[default]
    Seconds,
    Minutes,
    Hours,
}

impl Precision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Precision::Nanoseconds => "ns",
            Precision::Microseconds => "u",
            Precision::Milliseconds => "ms",
            Precision::Seconds => "s",
            Precision::Minutes => "m",
            Precision::Hours => "h",
        }
    }
}

impl FromStr for Precision {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "n" | "ns" => Ok(Precision::Nanoseconds),
            "u" | "us" => Ok(Precision::Microseconds),
            "ms" => Ok(Precision::Milliseconds),
            "s" => Ok(Precision::Seconds),
            "m" => Ok(Precision::Minutes),
            "h" => Ok(Precision::Hours),
            other => Err(other.to_string()),
        }
    }
}

impl TryFrom<String> for Precision {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value
            .parse::<Precision>()
            .map_err(|other: String| format!("unknown precision {other:?}"))
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
