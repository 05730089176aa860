use crate::record::Record;
use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

/// Appends records the sink never accepted to a JSON-lines file.
#[derive(Debug)]
pub struct DeadLetterWriter {
    path: PathBuf,
    file: Mutex<File>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DeadLetter<'a> {
    dropped_at: String,
    reason: &'a str,
    record: &'a Record,
}

impl DeadLetterWriter {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create directory {}", parent.display()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("failed to open dead-letter file {}", path.display()))?;

        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&self, records: &[Record], reason: &str) -> Result<()> {
        let dropped_at = Utc::now().to_rfc3339();
        let mut buffer = Vec::with_capacity(records.len() * 256);
        for record in records {
            let entry = DeadLetter {
                dropped_at: dropped_at.clone(),
                reason,
                record,
            };
            serde_json::to_writer(&mut buffer, &entry)
                .context("failed to encode dead-letter entry")?;
            buffer.push(b'\n');
        }

        let mut file = self.file.lock().await;
        file.write_all(&buffer)
            .await
            .with_context(|| format!("failed to write {}", self.path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("failed to flush {}", self.path.display()))?;

        debug!(
            count = records.len(),
            output = %self.path.display(),
            "dead-lettered records"
        );
        Ok(())
    }
}
