use chrono::DateTime;
use chrono_tz::Tz;
use serde::Serialize;

/// One physical line from the source file with its terminator stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLine(Vec<u8>);

impl RawLine {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for RawLine {
    fn from(value: &str) -> Self {
        Self(value.as_bytes().to_vec())
    }
}

/// A parsed access log entry, ready to become a sink point.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub timestamp: DateTime<Tz>,
    pub bytes_sent: u64,
    pub path: String,
    pub method: String,
    pub scheme: String,
    pub status: String,
    /// `None` when the upstream time column holds nginx's `-` marker.
    pub upstream_time: Option<f64>,
    pub request_time: f64,
}
