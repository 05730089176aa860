//! Polling file tailer.
//!
//! [`FileTailer`] starts at the end of the file and yields only lines appended afterwards. A
//! line is emitted once its `\n` terminator has been read; trailing bytes without a terminator
//! stay buffered until the writer finishes the line.

use crate::error::TailError;
use crate::metrics::{ErrorKind, MetricEvent, MetricsHandle};
use crate::record::RawLine;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::{self, File};
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Returns `true` when cancellation won the race.
pub(crate) async fn sleep_or_cancel(duration: Duration, cancel_token: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel_token.cancelled() => true,
        _ = sleep(duration) => false,
    }
}

/// Producer of complete raw lines.
#[async_trait]
pub trait LineSource: Send {
    /// Wait for the next complete line. `Ok(None)` means the source is finished, either
    /// because `cancel` fired or because a finite source ran dry.
    async fn next_line(&mut self, cancel: &CancellationToken)
        -> Result<Option<RawLine>, TailError>;
}

pub struct FileTailer {
    path: PathBuf,
    reader: BufReader<File>,
    /// Bytes consumed by emitted lines since the last (re)start position.
    offset: u64,
    partial: Vec<u8>,
    poll_interval: Duration,
}

impl FileTailer {
    /// Open `path` and position the cursor at its current end. Historical content is skipped.
    pub async fn open(path: impl AsRef<Path>, poll_interval: Duration) -> Result<Self, TailError> {
        let path = path.as_ref().to_path_buf();
        let open_err = |source| TailError::Open {
            path: path.clone(),
            source,
        };

        let mut file = File::open(&path).await.map_err(open_err)?;
        let offset = file.seek(SeekFrom::End(0)).await.map_err(open_err)?;
        let poll_interval = if poll_interval.is_zero() {
            DEFAULT_POLL_INTERVAL
        } else {
            poll_interval
        };

        info!(path = %path.display(), offset, "starting tailer at end of file");

        Ok(Self {
            path,
            reader: BufReader::new(file),
            offset,
            partial: Vec::new(),
            poll_interval,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn take_line(&mut self) -> RawLine {
        let mut line = std::mem::take(&mut self.partial);
        self.offset += line.len() as u64;
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        RawLine::new(line)
    }

    /// Called at end of input. Returns `true` when the cursor moved and reading should resume.
    ///
    /// A shrunken handle (copy-truncate) restarts from offset 0. A different file at the path
    /// (rename-and-create) is reopened from offset 0; the renamed file is not read again.
    async fn reset_if_moved(&mut self) -> Result<bool, TailError> {
        let read_err = |path: &Path, source: std::io::Error| TailError::Read {
            path: path.to_path_buf(),
            source,
        };
        let open_meta = self
            .reader
            .get_ref()
            .metadata()
            .await
            .map_err(|source| read_err(&self.path, source))?;
        let consumed = self.offset + self.partial.len() as u64;

        if open_meta.len() < consumed {
            warn!(
                path = %self.path.display(),
                previous_offset = consumed,
                current_size = open_meta.len(),
                "file truncated; restarting from the beginning"
            );
            self.reader
                .seek(SeekFrom::Start(0))
                .await
                .map_err(|source| read_err(&self.path, source))?;
            self.offset = 0;
            self.partial.clear();
            return Ok(true);
        }

        let path_meta = match fs::metadata(&self.path).await {
            Ok(meta) => meta,
            Err(err) => {
                debug!(
                    error = %err,
                    path = %self.path.display(),
                    "path unavailable; waiting for it to reappear"
                );
                return Ok(false);
            }
        };
        if same_file(&open_meta, &path_meta) {
            return Ok(false);
        }

        let file = match File::open(&self.path).await {
            Ok(file) => file,
            Err(err) => {
                debug!(error = %err, path = %self.path.display(), "reopen failed; retrying");
                return Ok(false);
            }
        };
        warn!(
            path = %self.path.display(),
            previous_offset = consumed,
            discarded_partial = self.partial.len(),
            "file replaced; reopening from the beginning"
        );
        self.reader = BufReader::new(file);
        self.offset = 0;
        self.partial.clear();
        Ok(true)
    }
}

#[cfg(unix)]
fn same_file(a: &std::fs::Metadata, b: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::MetadataExt;
    a.dev() == b.dev() && a.ino() == b.ino()
}

#[cfg(not(unix))]
fn same_file(_: &std::fs::Metadata, _: &std::fs::Metadata) -> bool {
    true
}

#[async_trait]
impl LineSource for FileTailer {
    async fn next_line(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<Option<RawLine>, TailError> {
        loop {
            if cancel.is_cancelled() {
                return Ok(None);
            }

            self.reader
                .read_until(b'\n', &mut self.partial)
                .await
                .map_err(|source| TailError::Read {
                    path: self.path.clone(),
                    source,
                })?;

            if self.partial.last() == Some(&b'\n') {
                return Ok(Some(self.take_line()));
            }

            if self.reset_if_moved().await? {
                continue;
            }

            if sleep_or_cancel(self.poll_interval, cancel).await {
                return Ok(None);
            }
        }
    }
}

/// Finite in-memory source for tests and replay.
#[derive(Debug, Default)]
pub struct MemoryLineSource {
    lines: VecDeque<RawLine>,
}

impl MemoryLineSource {
    pub fn new<I, L>(lines: I) -> Self
    where
        I: IntoIterator<Item = L>,
        L: Into<RawLine>,
    {
        Self {
            lines: lines.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl LineSource for MemoryLineSource {
    async fn next_line(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<Option<RawLine>, TailError> {
        if cancel.is_cancelled() {
            return Ok(None);
        }
        Ok(self.lines.pop_front())
    }
}

/// Pump lines from `source` into the raw-line queue until the source finishes or `cancel`
/// fires. A full queue suspends the reader; nothing is dropped.
///
/// Only a startup-class [`TailError`] ends the reader with an error. Read failures are counted
/// and retried after the default poll interval.
pub async fn run_reader<S: LineSource>(
    mut source: S,
    raw_tx: flume::Sender<RawLine>,
    metrics: MetricsHandle,
    cancel: CancellationToken,
) -> Result<u64, TailError> {
    let mut ingested = 0u64;

    loop {
        let line = match source.next_line(&cancel).await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => {
                warn!(error = %err, "read failed; retrying");
                metrics.error(ErrorKind::Read);
                if sleep_or_cancel(DEFAULT_POLL_INTERVAL, &cancel).await {
                    break;
                }
                continue;
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("reader cancelled while waiting for queue space");
                break;
            }
            sent = raw_tx.send_async(line) => {
                if sent.is_err() {
                    warn!("raw-line queue closed; stopping reader");
                    break;
                }
            }
        }

        metrics.emit(MetricEvent::LineIngested);
        ingested += 1;
    }

    info!(ingested, "reader stopped");
    Ok(ingested)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricsCollector;
    use std::io::Write;
    use tokio::time::timeout;

    const POLL: Duration = Duration::from_millis(10);

    fn append(path: &Path, bytes: &[u8]) {
        let mut file = std::fs::OpenOptions::new().append(true).open(path).unwrap();
        file.write_all(bytes).unwrap();
        file.flush().unwrap();
    }

    #[tokio::test]
    async fn open_missing_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let err = FileTailer::open(dir.path().join("absent.log"), POLL)
            .await
            .err()
            .expect("open should fail");
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn skips_history_and_emits_appended_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("access.log");
        std::fs::write(&path, b"old line\n").unwrap();

        let mut tailer = FileTailer::open(&path, POLL).await.unwrap();
        append(&path, b"first\nsecond\r\n");

        let cancel = CancellationToken::new();
        let first = tailer.next_line(&cancel).await.unwrap().unwrap();
        let second = tailer.next_line(&cancel).await.unwrap().unwrap();
        assert_eq!(first.as_bytes(), b"first");
        assert_eq!(second.as_bytes(), b"second");
    }

    #[tokio::test]
    async fn unterminated_line_is_held_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("access.log");
        std::fs::write(&path, b"").unwrap();

        let mut tailer = FileTailer::open(&path, POLL).await.unwrap();
        let cancel = CancellationToken::new();
        append(&path, b"half a li");

        let pending = timeout(Duration::from_millis(100), tailer.next_line(&cancel)).await;
        assert!(pending.is_err(), "partial line must not be emitted");

        append(&path, b"ne\n");
        let line = timeout(Duration::from_secs(2), tailer.next_line(&cancel))
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(line.as_bytes(), b"half a line");
    }

    #[tokio::test]
    async fn restarts_after_truncation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("access.log");
        std::fs::write(&path, b"0123456789\n0123456789\n").unwrap();

        let mut tailer = FileTailer::open(&path, POLL).await.unwrap();
        append(&path, b"tail\n");
        let cancel = CancellationToken::new();
        assert_eq!(
            tailer.next_line(&cancel).await.unwrap().unwrap().as_bytes(),
            b"tail"
        );

        std::fs::write(&path, b"fresh\n").unwrap();
        let line = timeout(Duration::from_secs(2), tailer.next_line(&cancel))
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(line.as_bytes(), b"fresh");
    }

    #[tokio::test]
    async fn rotated_file_is_not_replayed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("access.log");
        std::fs::write(
            &path,
            b"HISTORY-1 long long long line\nHISTORY-2 long long line\n",
        )
        .unwrap();

        let mut tailer = FileTailer::open(&path, POLL).await.unwrap();
        std::fs::rename(&path, dir.path().join("access.log.1")).unwrap();
        std::fs::write(&path, b"new\n").unwrap();

        let cancel = CancellationToken::new();
        let line = timeout(Duration::from_secs(2), tailer.next_line(&cancel))
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(line.as_bytes(), b"new");

        append(&path, b"after\n");
        let line = timeout(Duration::from_secs(2), tailer.next_line(&cancel))
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(line.as_bytes(), b"after");
    }

    #[tokio::test]
    async fn cancellation_ends_the_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("access.log");
        std::fs::write(&path, b"").unwrap();

        let mut tailer = FileTailer::open(&path, POLL).await.unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(tailer.next_line(&cancel).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reader_waits_on_full_queue_without_dropping() {
        let (collector, metrics) = MetricsCollector::new(Duration::from_secs(5), 64).unwrap();
        let (raw_tx, raw_rx) = flume::bounded(1);
        let source = MemoryLineSource::new(["a", "b", "c", "d"]);
        let reader = tokio::spawn(run_reader(
            source,
            raw_tx,
            metrics,
            CancellationToken::new(),
        ));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(raw_rx.len(), 1);
        assert!(!reader.is_finished());

        let mut received = Vec::new();
        while let Ok(line) = raw_rx.recv_async().await {
            received.push(line);
        }
        assert_eq!(reader.await.unwrap().unwrap(), 4);
        assert_eq!(
            received,
            vec![
                RawLine::from("a"),
                RawLine::from("b"),
                RawLine::from("c"),
                RawLine::from("d")
            ]
        );

        let state = collector.run(CancellationToken::new()).await;
        assert_eq!(state.lines_ingested, 4);
    }
}
