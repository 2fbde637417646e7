#![deny(
    trivial_numeric_casts,
    missing_docs,
    unsafe_code,
    unstable_features,
    unused_import_braces,
    unused_qualifications,
    unused_extern_crates,
    unused_results
)]
#![warn(rust_2021_compatibility, unreachable_pub)]

//! Durable, segmented, retention-managed write-ahead log.
//!
//! Every record entering the engine traverses the WAL before any sink sees
//! it, so a crash between ingress and delivery can be recovered from. The
//! log is a directory of line-delimited JSON segment files; exactly one
//! segment is "current" and accepts writes, the others are sealed. A
//! background ticker flushes pending records, another one sweeps segments
//! past the retention horizon.

use std::{
    fs::{File, OpenOptions},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::{Duration, SystemTime},
};

use chrono::{DateTime, Utc};
use record::Record;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncBufReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const SEGMENT_PREFIX: &str = "wal-";
const SEGMENT_SUFFIX: &str = ".log";
const RETENTION_SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

/// List of errors that can occur with the write-ahead log.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The WAL directory could not be created.
    #[error("wal directory not created (dir: {dir}, reason: {error})")]
    CreateDir {
        /// The configured directory.
        dir: String,
        /// The error message.
        error: String,
    },

    /// A segment file could not be opened.
    #[error("wal segment not opened (path: {path}, reason: {error})")]
    OpenSegment {
        /// The segment path.
        path: String,
        /// The error message.
        error: String,
    },

    /// An append or flush to the current segment failed.
    #[error("wal append failed (reason: {error})")]
    Append {
        /// The error message.
        error: String,
    },

    /// A segment rotation failed.
    #[error("wal rotation failed (reason: {error})")]
    Rotate {
        /// The error message.
        error: String,
    },

    /// The WAL was already closed.
    #[error("wal is closed")]
    Closed,
}

/// Configuration of the write-ahead log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalConfig {
    /// Master switch; a disabled WAL persists nothing.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Directory holding the segment files.
    #[serde(default = "default_dir")]
    pub dir: PathBuf,

    /// Size threshold above which the current segment is rotated.
    #[serde(default = "default_max_segment_bytes")]
    pub max_segment_bytes: u64,

    /// Number of pending records that triggers a synchronous flush.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Period of the background flush ticker.
    #[serde(default = "default_flush_interval_seconds")]
    pub flush_interval_seconds: u64,

    /// Age after which a sealed segment is deleted. Zero or negative
    /// disables the retention sweep.
    #[serde(default = "default_retention_hours")]
    pub retention_hours: i64,

    /// Issue a sync to the OS after every flush.
    #[serde(default)]
    pub sync_writes: bool,
}

fn default_enabled() -> bool {
    true
}

fn default_dir() -> PathBuf {
    PathBuf::from("./data/wal")
}

fn default_max_segment_bytes() -> u64 {
    64 * 1024 * 1024
}

fn default_buffer_size() -> usize {
    256
}

fn default_flush_interval_seconds() -> u64 {
    5
}

fn default_retention_hours() -> i64 {
    72
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            dir: default_dir(),
            max_segment_bytes: default_max_segment_bytes(),
            buffer_size: default_buffer_size(),
            flush_interval_seconds: default_flush_interval_seconds(),
            retention_hours: default_retention_hours(),
            sync_writes: false,
        }
    }
}

/// One persisted entry: a sequence number, the persistence instant, and the
/// embedded record. Serialized as one self-delimited JSON object per line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalEntry {
    /// Monotonic sequence number, unique across segments of one directory.
    #[serde(rename = "seq")]
    pub sequence: u64,

    /// Instant of persistence.
    #[serde(rename = "ts")]
    pub timestamp: DateTime<Utc>,

    /// The persisted record.
    #[serde(rename = "log")]
    pub record: Record,
}

/// The current segment and the in-memory flush buffer.
struct Active {
    path: PathBuf,
    writer: BufWriter<File>,
    size: u64,
    pending: Vec<Record>,
}

/// The write-ahead log.
///
/// State machine: `fresh -> open(segment) -> rotating -> open(segment') ...
/// -> closing -> closed`. Closing performs a final flush.
pub struct Wal {
    config: WalConfig,
    active: Mutex<Active>,
    sequence: Mutex<u64>,
    cancel: CancellationToken,
    closed: AtomicBool,
    tasks: tokio::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Wal {
    /// Opens the WAL: scans existing segments to restore the sequence
    /// counter, opens a fresh current segment, and spawns the flush and
    /// retention tickers. Must be called within a tokio runtime.
    pub fn open(config: WalConfig) -> Result<Arc<Self>, Error> {
        std::fs::create_dir_all(&config.dir).map_err(|e| Error::CreateDir {
            dir: config.dir.display().to_string(),
            error: e.to_string(),
        })?;

        let recovered_sequence = max_sequence(&config.dir);
        let mut sequence = recovered_sequence;

        // The segment filename claims a sequence value of its own so that
        // two rotations within the same wall-clock second stay distinct.
        sequence += 1;
        let (path, writer) = open_segment(&config.dir, sequence)?;
        info!(path = %path.display(), sequence, "wal segment opened");

        let wal = Arc::new(Self {
            config,
            active: Mutex::new(Active {
                path,
                writer,
                size: 0,
                pending: Vec::new(),
            }),
            sequence: Mutex::new(sequence),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
            tasks: tokio::sync::Mutex::new(Vec::new()),
        });

        let mut tasks = Vec::new();
        tasks.push(tokio::task::spawn(flush_loop(wal.clone())));
        if wal.config.retention_hours > 0 {
            tasks.push(tokio::task::spawn(retention_loop(wal.clone())));
        }
        *wal.tasks
            .try_lock()
            .expect("wal tasks lock free during open") = tasks;

        Ok(wal)
    }

    /// Appends a record to the in-memory buffer; flushes synchronously when
    /// the buffer is full. A rotation failure is returned to the caller.
    pub fn persist(&self, record: &Record) -> Result<(), Error> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }

        let mut active = self.active.lock().expect("wal active lock poisoned");
        active.pending.push(record.clone());
        if active.pending.len() >= self.config.buffer_size {
            self.flush_locked(&mut active)?;
        }
        Ok(())
    }

    /// Flushes every pending record to the current segment.
    pub fn flush(&self) -> Result<(), Error> {
        let mut active = self.active.lock().expect("wal active lock poisoned");
        self.flush_locked(&mut active)
    }

    /// Returns the last claimed sequence number.
    pub fn current_sequence(&self) -> u64 {
        *self.sequence.lock().expect("wal sequence lock poisoned")
    }

    /// Returns a lazy, finite stream of records recovered from the sealed
    /// segments of the WAL directory.
    ///
    /// Segments are scanned in sorted filename order; malformed lines are
    /// logged and skipped. The stream writes into a bounded channel so the
    /// consumer controls the pace. A fully streamed segment is deleted:
    /// recovered records re-enter the pipeline, so keeping the old copy
    /// would replay them again on the next start. Closing the WAL stops
    /// recovery; segments not yet fully streamed are kept and rescanned on
    /// the next start.
    pub fn recover(self: &Arc<Self>) -> flume::Receiver<Record> {
        let (tx, rx) = flume::bounded(self.config.buffer_size.max(16));
        let wal = self.clone();
        drop(tokio::task::spawn(async move {
            wal.recover_into(tx).await;
        }));
        rx
    }

    /// Closes the WAL: stops the tickers and performs a final flush.
    /// Idempotent.
    pub async fn close(&self) -> Result<(), Error> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.cancel.cancel();
        for task in self.tasks.lock().await.drain(..) {
            if let Err(error) = task.await {
                error!(%error, "wal task join failed");
            }
        }
        self.flush()
    }

    fn flush_locked(&self, active: &mut Active) -> Result<(), Error> {
        if active.pending.is_empty() {
            return Ok(());
        }

        if active.size > self.config.max_segment_bytes {
            self.rotate_locked(active)?;
        }

        for record in std::mem::take(&mut active.pending) {
            let entry = WalEntry {
                sequence: self.next_sequence(),
                timestamp: Utc::now(),
                record,
            };
            let line = serde_json::to_string(&entry).map_err(|e| Error::Append { error: e.to_string() })?;
            active
                .writer
                .write_all(line.as_bytes())
                .and_then(|()| active.writer.write_all(b"\n"))
                .map_err(|e| Error::Append { error: e.to_string() })?;
            active.size += line.len() as u64 + 1;
        }

        active
            .writer
            .flush()
            .map_err(|e| Error::Append { error: e.to_string() })?;
        if self.config.sync_writes {
            active
                .writer
                .get_ref()
                .sync_all()
                .map_err(|e| Error::Append { error: e.to_string() })?;
        }
        Ok(())
    }

    fn rotate_locked(&self, active: &mut Active) -> Result<(), Error> {
        active
            .writer
            .flush()
            .map_err(|e| Error::Rotate { error: e.to_string() })?;

        let sequence = self.next_sequence();
        let (path, writer) = open_segment(&self.config.dir, sequence)
            .map_err(|e| Error::Rotate { error: e.to_string() })?;
        info!(old = %active.path.display(), new = %path.display(), "wal segment rotated");

        active.path = path;
        active.writer = writer;
        active.size = 0;
        Ok(())
    }

    fn next_sequence(&self) -> u64 {
        let mut sequence = self.sequence.lock().expect("wal sequence lock poisoned");
        *sequence += 1;
        *sequence
    }

    fn current_path(&self) -> PathBuf {
        self.active.lock().expect("wal active lock poisoned").path.clone()
    }

    async fn recover_into(&self, tx: flume::Sender<Record>) {
        let current = self.current_path();
        let segments: Vec<PathBuf> = list_segments(&self.config.dir)
            .into_iter()
            .filter(|p| *p != current)
            .collect();

        let mut recovered = 0usize;
        for path in segments {
            let file = match tokio::fs::File::open(&path).await {
                Ok(file) => file,
                Err(error) => {
                    warn!(path = %path.display(), %error, "wal segment not readable, skipped");
                    continue;
                }
            };

            let mut lines = tokio::io::BufReader::new(file).lines();
            loop {
                let line = tokio::select! {
                    _ = self.cancel.cancelled() => {
                        debug!(path = %path.display(), "wal recovery cancelled");
                        return;
                    }
                    line = lines.next_line() => line,
                };
                match line {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<WalEntry>(&line) {
                            Ok(entry) => {
                                recovered += 1;
                                tokio::select! {
                                    _ = self.cancel.cancelled() => return,
                                    sent = tx.send_async(entry.record) => {
                                        if sent.is_err() {
                                            // Consumer is gone, keep the file.
                                            return;
                                        }
                                    }
                                }
                            }
                            Err(error) => {
                                warn!(path = %path.display(), %error, "malformed wal line skipped");
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(error) => {
                        warn!(path = %path.display(), %error, "wal segment read failed");
                        break;
                    }
                }
            }

            if let Err(error) = tokio::fs::remove_file(&path).await {
                error!(path = %path.display(), %error, "recovered wal segment not removed");
            }
        }
        info!(recovered, "wal recovery finished");
    }

    fn sweep_expired(&self) {
        let current = self.current_path();
        let horizon = Duration::from_secs(self.config.retention_hours as u64 * 3600);
        let now = SystemTime::now();

        for path in list_segments(&self.config.dir) {
            if path == current {
                continue;
            }
            let modified = match std::fs::metadata(&path).and_then(|m| m.modified()) {
                Ok(modified) => modified,
                Err(error) => {
                    warn!(path = %path.display(), %error, "wal segment mtime not readable");
                    continue;
                }
            };
            if is_expired(modified, now, horizon) {
                match std::fs::remove_file(&path) {
                    Ok(()) => info!(path = %path.display(), "expired wal segment removed"),
                    Err(error) => error!(path = %path.display(), %error, "expired wal segment not removed"),
                }
            }
        }
    }
}

async fn flush_loop(wal: Arc<Wal>) {
    let period = Duration::from_secs(wal.config.flush_interval_seconds.max(1));
    let mut ticker = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = wal.cancel.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(error) = wal.flush() {
                    error!(%error, "periodic wal flush failed");
                }
            }
        }
    }
}

async fn retention_loop(wal: Arc<Wal>) {
    let mut ticker = tokio::time::interval(RETENTION_SWEEP_INTERVAL);
    loop {
        tokio::select! {
            _ = wal.cancel.cancelled() => break,
            _ = ticker.tick() => wal.sweep_expired(),
        }
    }
}

/// Decides whether a sealed segment is past the retention horizon.
fn is_expired(modified: SystemTime, now: SystemTime, horizon: Duration) -> bool {
    match now.duration_since(modified) {
        Ok(age) => age > horizon,
        // Modified in the future (clock skew): keep the segment.
        Err(_) => false,
    }
}

fn segment_file_name(timestamp: DateTime<Utc>, sequence: u64) -> String {
    format!(
        "{SEGMENT_PREFIX}{}-{sequence}{SEGMENT_SUFFIX}",
        timestamp.format("%Y%m%d-%H%M%S")
    )
}

fn open_segment(dir: &Path, sequence: u64) -> Result<(PathBuf, BufWriter<File>), Error> {
    let path = dir.join(segment_file_name(Utc::now(), sequence));
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|e| Error::OpenSegment {
            path: path.display().to_string(),
            error: e.to_string(),
        })?;
    Ok((path, BufWriter::new(file)))
}

/// Lists the segment files of a WAL directory in sorted filename order.
fn list_segments(dir: &Path) -> Vec<PathBuf> {
    let mut segments: Vec<PathBuf> = match std::fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with(SEGMENT_PREFIX) && n.ends_with(SEGMENT_SUFFIX))
                    .unwrap_or(false)
            })
            .collect(),
        Err(error) => {
            warn!(dir = %dir.display(), %error, "wal directory not listable");
            Vec::new()
        }
    };
    segments.sort();
    segments
}

/// Returns the maximum sequence number found in any segment of the
/// directory, zero when there is none.
fn max_sequence(dir: &Path) -> u64 {
    let mut max = 0;
    for path in list_segments(dir) {
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(error) => {
                warn!(path = %path.display(), %error, "wal segment not readable during scan");
                continue;
            }
        };
        for line in content.lines() {
            if let Ok(entry) = serde_json::from_str::<WalEntry>(line) {
                max = max.max(entry.sequence);
            }
        }
    }
    max
}
