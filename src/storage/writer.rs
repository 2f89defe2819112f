//! Streaming parquet writer with a bounded, drop-oldest input queue.
//!
//! A [`StorageWriter`] owns exactly one destination file. The file is
//! created with `create_new`, so a path that already exists (bound to a live
//! writer or left behind by a closed one) is never reopened or appended to.
//! Rows are handed over through [`StorageWriter::enqueue`], which never
//! blocks: when the queue is full the oldest queued row is evicted.
//!
//! A dedicated thread drains the queue into a batch and commits the batch as
//! one row group when it reaches `batch_size` rows or when `flush_interval`
//! has passed since the previous commit. The parquet footer is written once,
//! by [`StorageWriter::shutdown`]. A failed commit stops the thread without
//! writing a footer; the error is returned from `shutdown` and the file must
//! be considered invalid.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use arrow::datatypes::SchemaRef;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded};
use parking_lot::Mutex;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::{EnabledStatistics, WriterProperties, WriterVersion};
use tracing::{debug, error, info, warn};

use super::{BookRow, row_schema, rows_to_batch};
use crate::{Result, RollbookError};

/// A drop event is logged for the first eviction and then once per this many.
const DROP_LOG_EVERY: u64 = 10_000;

/// Batching and queueing knobs of a [`StorageWriter`].
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Commit at least this often while rows are buffered.
    pub flush_interval: Duration,
    /// Commit as soon as this many rows are buffered.
    pub batch_size: usize,
    /// Bound of the input queue; the oldest row is evicted beyond it.
    pub queue_capacity: usize,
    /// How long [`StorageWriter::shutdown`] waits for the commit thread.
    pub shutdown_timeout: Duration,
    /// How long the commit thread blocks waiting for a row before
    /// re-checking its flush conditions.
    pub poll_interval: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(5),
            batch_size: 10_000,
            queue_capacity: 500_000,
            shutdown_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// Bounded FIFO that makes room for a new item by evicting the oldest one.
///
/// Producers never block. Survivors keep their relative order.
pub struct DropOldestQueue<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
    dropped: AtomicU64,
}

impl<T> DropOldestQueue<T> {
    /// Creates a queue holding at most `capacity` items.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity.max(1));
        Self {
            tx,
            rx,
            dropped: AtomicU64::new(0),
        }
    }

    /// Appends `item`, evicting the oldest queued item if the queue is full.
    ///
    /// Returns the number of items dropped by this call (0, or 1 in the
    /// common full case; 2 only if another producer refilled the slot).
    pub fn push(&self, item: T) -> u64 {
        match self.tx.try_send(item) {
            Ok(()) => 0,
            Err(TrySendError::Full(item)) => {
                let mut dropped = 0;
                if self.rx.try_recv().is_ok() {
                    dropped += 1;
                }
                if self.tx.try_send(item).is_err() {
                    dropped += 1;
                }
                self.dropped.fetch_add(dropped, Ordering::Relaxed);
                dropped
            }
            // Unreachable while `self.rx` is alive.
            Err(TrySendError::Disconnected(_)) => 0,
        }
    }

    /// Returns a consumer handle.
    pub fn receiver(&self) -> Receiver<T> {
        self.rx.clone()
    }

    /// Returns the number of items waiting.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Returns the total number of items evicted or refused so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Counters shared between a writer handle and its commit thread.
#[derive(Debug, Default)]
struct WriterStats {
    rows_written: AtomicU64,
    commits: AtomicU64,
    failed: AtomicBool,
}

struct Worker {
    handle: JoinHandle<()>,
    done: Receiver<Result<u64>>,
}

/// Single-file streaming parquet writer. See the module docs.
pub struct StorageWriter {
    path: PathBuf,
    queue: DropOldestQueue<BookRow>,
    accepting: AtomicBool,
    stop: Arc<AtomicBool>,
    stats: Arc<WriterStats>,
    worker: Mutex<Option<Worker>>,
}

impl StorageWriter {
    /// Creates `path` and starts the commit thread.
    ///
    /// # Errors
    ///
    /// Returns [`RollbookError::FileAlreadyBound`] if the file already
    /// exists, and an I/O or parquet error if it cannot be created.
    pub fn create(path: impl AsRef<Path>, config: WriterConfig) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::AlreadyExists => RollbookError::FileAlreadyBound(path.clone()),
                _ => RollbookError::Io(e),
            })?;

        Self::with_sink(path, file, config)
    }

    /// Starts a writer that streams into `sink` rather than a file it
    /// creates itself. `path` names the output in logs, errors and
    /// [`file_size`](Self::file_size).
    ///
    /// # Errors
    ///
    /// Returns a parquet error if the header cannot be written, or an I/O
    /// error if the commit thread cannot be spawned.
    pub fn with_sink<W>(path: impl Into<PathBuf>, sink: W, config: WriterConfig) -> Result<Self>
    where
        W: Write + Send + 'static,
    {
        let path = path.into();
        let schema = row_schema();
        let props = WriterProperties::builder()
            .set_compression(Compression::SNAPPY)
            .set_statistics_enabled(EnabledStatistics::Page)
            .set_writer_version(WriterVersion::PARQUET_2_0)
            .build();
        let arrow_writer = ArrowWriter::try_new(sink, schema.clone(), Some(props))?;

        let queue = DropOldestQueue::new(config.queue_capacity);
        let stop = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(WriterStats::default());
        let (done_tx, done_rx) = bounded(1);

        let commit_loop = CommitLoop {
            path: path.clone(),
            schema,
            rx: queue.receiver(),
            stop: stop.clone(),
            stats: stats.clone(),
            config: config.clone(),
        };
        let handle = std::thread::Builder::new()
            .name("rollbook-writer".to_string())
            .spawn(move || {
                let result = commit_loop.run(arrow_writer);
                let _ = done_tx.send(result);
            })?;

        info!(
            path = %path.display(),
            batch_size = config.batch_size,
            flush_interval = ?config.flush_interval,
            queue_capacity = config.queue_capacity,
            "Streaming writer started"
        );

        Ok(Self {
            path,
            queue,
            accepting: AtomicBool::new(true),
            stop,
            stats,
            worker: Mutex::new(Some(Worker {
                handle,
                done: done_rx,
            })),
        })
    }

    /// Queues one row for the file. Never blocks.
    ///
    /// Rows are silently ignored once shutdown has begun or a commit failed.
    pub fn enqueue(&self, row: BookRow) {
        if !self.accepting.load(Ordering::Acquire) || self.stats.failed.load(Ordering::Acquire) {
            return;
        }

        let before = self.queue.dropped();
        if self.queue.push(row) > 0 {
            let total = self.queue.dropped();
            if before == 0 || before / DROP_LOG_EVERY != total / DROP_LOG_EVERY {
                warn!(
                    path = %self.path.display(),
                    dropped = total,
                    queue = self.queue.len(),
                    "Write queue full, dropping oldest rows"
                );
            }
        }
    }

    /// Queues every row of one book state, in order.
    pub fn enqueue_all(&self, rows: impl IntoIterator<Item = BookRow>) {
        for row in rows {
            self.enqueue(row);
        }
    }

    /// Stops accepting rows, commits everything already queued, writes the
    /// footer and closes the file.
    ///
    /// Calling it again after it returned is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`RollbookError::WriterShutdownTimeout`] if the commit thread
    /// does not finish within `timeout`, and [`RollbookError::WriterFailed`]
    /// (or the underlying parquet error) if any commit or the close failed.
    pub fn shutdown(&self, timeout: Duration) -> Result<()> {
        let Some(worker) = self.worker.lock().take() else {
            return Ok(());
        };

        info!(
            path = %self.path.display(),
            remaining = self.queue.len(),
            "Writer shutdown requested"
        );
        self.accepting.store(false, Ordering::Release);
        self.stop.store(true, Ordering::Release);

        match worker.done.recv_timeout(timeout) {
            Ok(result) => {
                let _ = worker.handle.join();
                let total = result?;
                info!(
                    path = %self.path.display(),
                    rows = total,
                    dropped = self.queue.dropped(),
                    "Writer closed cleanly"
                );
                Ok(())
            }
            Err(RecvTimeoutError::Timeout) => {
                error!(
                    path = %self.path.display(),
                    ?timeout,
                    "Writer did not shut down in time, data loss possible"
                );
                Err(RollbookError::WriterShutdownTimeout {
                    path: self.path.clone(),
                    timeout,
                })
            }
            Err(RecvTimeoutError::Disconnected) => {
                self.stats.failed.store(true, Ordering::Release);
                Err(RollbookError::WriterFailed {
                    path: self.path.clone(),
                    reason: "commit thread exited without reporting".to_string(),
                })
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the number of rows waiting in the queue.
    pub fn queue_depth(&self) -> usize {
        self.queue.len()
    }

    /// Returns the number of rows lost to queue overflow.
    pub fn rows_dropped(&self) -> u64 {
        self.queue.dropped()
    }

    /// Returns the number of rows committed to the file so far.
    pub fn rows_written(&self) -> u64 {
        self.stats.rows_written.load(Ordering::Relaxed)
    }

    /// Returns the number of row groups committed so far.
    pub fn commits(&self) -> u64 {
        self.stats.commits.load(Ordering::Relaxed)
    }

    /// Returns `true` once a commit has failed. The file is then invalid.
    pub fn is_failed(&self) -> bool {
        self.stats.failed.load(Ordering::Acquire)
    }

    /// Returns the current on-disk size of the file in bytes.
    pub fn file_size(&self) -> u64 {
        std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
    }

    /// Returns the current on-disk size of the file in MiB.
    pub fn file_size_mb(&self) -> f64 {
        self.file_size() as f64 / (1024.0 * 1024.0)
    }
}

impl Drop for StorageWriter {
    fn drop(&mut self) {
        if self.worker.get_mut().is_some() {
            warn!(
                path = %self.path.display(),
                "Writer dropped without shutdown, closing now"
            );
            let timeout = Duration::from_secs(5);
            if let Err(e) = self.shutdown(timeout) {
                error!(path = %self.path.display(), "Writer close on drop failed: {e}");
            }
        }
    }
}

/// State moved onto the commit thread.
struct CommitLoop {
    path: PathBuf,
    schema: SchemaRef,
    rx: Receiver<BookRow>,
    stop: Arc<AtomicBool>,
    stats: Arc<WriterStats>,
    config: WriterConfig,
}

impl CommitLoop {
    fn run<W: Write + Send>(self, mut writer: ArrowWriter<W>) -> Result<u64> {
        let batch_size = self.config.batch_size.max(1);
        let mut buffer: Vec<BookRow> = Vec::with_capacity(batch_size.min(65_536));
        let mut last_commit = Instant::now();
        let mut total = 0u64;

        loop {
            match self.rx.recv_timeout(self.config.poll_interval) {
                Ok(row) => {
                    buffer.push(row);
                    while buffer.len() < batch_size {
                        match self.rx.try_recv() {
                            Ok(row) => buffer.push(row),
                            Err(_) => break,
                        }
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }

            let due = buffer.len() >= batch_size
                || (!buffer.is_empty() && last_commit.elapsed() >= self.config.flush_interval);
            if due {
                total += self.commit(&mut writer, &buffer)?;
                buffer.clear();
                last_commit = Instant::now();
            }

            if self.stop.load(Ordering::Acquire) && self.rx.is_empty() {
                break;
            }
        }

        if !buffer.is_empty() {
            total += self.commit(&mut writer, &buffer)?;
        }

        writer.close().map_err(|e| self.fail(e.to_string()))?;
        Ok(total)
    }

    /// Writes `rows` as one row group. Any failure is final for the file.
    fn commit<W: Write + Send>(
        &self,
        writer: &mut ArrowWriter<W>,
        rows: &[BookRow],
    ) -> Result<u64> {
        let batch = rows_to_batch(&self.schema, rows).map_err(|e| self.fail(e.to_string()))?;
        writer
            .write(&batch)
            .and_then(|()| writer.flush())
            .map_err(|e| self.fail(e.to_string()))?;

        let written = rows.len() as u64;
        self.stats.rows_written.fetch_add(written, Ordering::Relaxed);
        self.stats.commits.fetch_add(1, Ordering::Relaxed);
        debug!(
            path = %self.path.display(),
            rows = written,
            queue = self.rx.len(),
            "Committed rows"
        );
        Ok(written)
    }

    fn fail(&self, reason: String) -> RollbookError {
        self.stats.failed.store(true, Ordering::Release);
        error!(
            path = %self.path.display(),
            %reason,
            "Write failed, file may be corrupted"
        );
        RollbookError::WriterFailed {
            path: self.path.clone(),
            reason,
        }
    }
}
