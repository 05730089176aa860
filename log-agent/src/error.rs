use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while following the source file.
#[derive(Debug, Error)]
pub enum TailError {
    /// The source could not be opened at startup. Nothing can be ingested.
    #[error("failed to open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl TailError {
    /// Startup failures stop the reader for good; read failures are retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TailError::Open { .. })
    }
}

/// A raw line that could not be turned into a [`crate::record::Record`].
///
/// Every variant is recoverable: the line is counted and skipped.
#[derive(Debug, Error, PartialEq)]
pub enum ParseError {
    #[error("line is not valid UTF-8")]
    Encoding,
    #[error("line does not match the access log grammar")]
    NoMatch,
    #[error("invalid timestamp {value:?}: {reason}")]
    Timestamp { value: String, reason: String },
    #[error("request line {value:?} has {tokens} tokens, expected 3")]
    RequestLine { value: String, tokens: usize },
    #[error("invalid request target {value:?}")]
    Target { value: String },
    #[error("field {field} has non-numeric value {value:?}")]
    InvalidNumber { field: &'static str, value: String },
}

/// Failures talking to the time-series sink. Retried, then dropped.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink connection failed: {0}")]
    Connect(String),
    #[error("sink rejected write with status {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("sink write failed: {0}")]
    Write(String),
}

impl SinkError {
    /// Client errors other than timeouts and throttling will fail the same way again.
    pub fn is_retryable(&self) -> bool {
        match self {
            SinkError::Rejected { status, .. } => {
                !(400..500).contains(status) || *status == 408 || *status == 429
            }
            SinkError::Connect(_) | SinkError::Write(_) => true,
        }
    }
}

impl From<reqwest::Error> for SinkError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() {
            SinkError::Connect(err.to_string())
        } else {
            SinkError::Write(err.to_string())
        }
    }
}

/// Problems with the positional `address@username@password@database@precision` descriptor.
#[derive(Debug, Error, PartialEq)]
pub enum DescriptorError {
    #[error("sink descriptor has {0} fields, expected 5 (address@username@password@database@precision)")]
    FieldCount(usize),
    #[error("sink descriptor has an empty {0}")]
    Empty(&'static str),
    #[error("unknown precision {0:?}; expected one of ns, u, ms, s, m, h")]
    Precision(String),
}
