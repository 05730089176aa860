use super::RecordSink;
use crate::error::SinkError;
use crate::record::Record;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;

/// In-memory sink for tests. Clones share the same storage.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    inner: Arc<Mutex<MemorySinkState>>,
}

#[derive(Debug, Default)]
struct MemorySinkState {
    batches: Vec<Vec<Record>>,
    attempts: usize,
    failures_remaining: usize,
    reject_status: Option<u16>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` writes fail with a connection error.
    pub async fn fail_next(&self, count: usize) {
        self.inner.lock().await.failures_remaining = count;
    }

    /// Reject every write with the given HTTP status.
    pub async fn reject_with(&self, status: u16) {
        self.inner.lock().await.reject_status = Some(status);
    }

    pub async fn records(&self) -> Vec<Record> {
        self.inner
            .lock()
            .await
            .batches
            .iter()
            .flatten()
            .cloned()
            .collect()
    }

    pub async fn batch_sizes(&self) -> Vec<usize> {
        self.inner.lock().await.batches.iter().map(Vec::len).collect()
    }

    pub async fn attempts(&self) -> usize {
        self.inner.lock().await.attempts
    }
}

#[async_trait]
impl RecordSink for MemorySink {
    async fn write_batch(&self, records: &[Record]) -> Result<(), SinkError> {
        let mut state = self.inner.lock().await;
        state.attempts += 1;

        if let Some(status) = state.reject_status {
            return Err(SinkError::Rejected {
                status,
                body: "rejected by memory sink".to_string(),
            });
        }
        if state.failures_remaining > 0 {
            state.failures_remaining -= 1;
            return Err(SinkError::Connect("memory sink unavailable".to_string()));
        }

        state.batches.push(records.to_vec());
        Ok(())
    }
}
