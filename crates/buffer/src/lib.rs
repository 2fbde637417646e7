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

//! Per-sink output buffer.
//!
//! The buffer decouples the engine's delivery call from the sink's actual
//! I/O: it smooths bursts through a bounded live queue, retries transient
//! failures with exponential backoff, spills to disk when the live queue is
//! full, and surrenders permanently to a dead-letter queue once the retry
//! budget is exhausted. Sink errors are absorbed at this boundary; the
//! engine never observes them once buffering is enabled.

use std::{
    fs::{File, OpenOptions},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use chrono::{DateTime, Utc};
use record::Record;
use serde::{Deserialize, Serialize};
use sink::Sink;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub mod stats;

pub use stats::{BufferStats, BufferStatsSnapshot};

/// How long an enqueue waits for live-queue capacity before spilling.
const OFFER_TIMEOUT: Duration = Duration::from_millis(100);

/// Period of the retry-queue evaluation ticker.
const RETRY_TICK: Duration = Duration::from_secs(1);

/// Budget for draining the live queue during shutdown.
const DRAIN_BUDGET: Duration = Duration::from_secs(10);

/// Name of the retry-queue snapshot file inside the spool directory.
const RETRY_QUEUE_FILE: &str = "retry-queue.jsonl";

/// List of errors that can occur with an output buffer.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The spool directory could not be created.
    #[error("buffer spool directory not created (dir: {dir}, reason: {error})")]
    CreateDir {
        /// The spool directory.
        dir: String,
        /// The error message.
        error: String,
    },

    /// A record could not be spilled to disk.
    #[error("buffer spill failed (path: {path}, reason: {error})")]
    Spill {
        /// The spill file path.
        path: String,
        /// The error message.
        error: String,
    },

    /// The underlying sink failed (only surfaced when buffering is
    /// disabled and the sink is called synchronously).
    #[error(transparent)]
    Sink(#[from] sink::Error),
}

/// Configuration of an output buffer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferConfig {
    /// Master switch; a disabled buffer calls the sink synchronously.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Base directory of the spill spool; each output gets a subdirectory.
    #[serde(default = "default_dir")]
    pub dir: PathBuf,

    /// Capacity of the in-memory live queue.
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,

    /// Delivery attempts before a record is surrendered to the DLQ.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base retry interval; doubled per attempt.
    #[serde(default = "default_retry_interval_seconds")]
    pub retry_interval_seconds: u64,

    /// Cap of the computed backoff.
    #[serde(default = "default_max_retry_delay_seconds")]
    pub max_retry_delay_seconds: u64,

    /// Period of the retry-queue persistence ticker.
    #[serde(default = "default_flush_interval_seconds")]
    pub flush_interval_seconds: u64,

    /// Whether exhausted records are appended to the dead-letter queue.
    #[serde(default = "default_dlq_enabled")]
    pub dlq_enabled: bool,

    /// Path of the DLQ file; defaults to `dlq.jsonl` inside the output's
    /// spool directory.
    #[serde(default)]
    pub dlq_path: Option<PathBuf>,
}

fn default_enabled() -> bool {
    true
}

fn default_dir() -> PathBuf {
    PathBuf::from("./data/buffer")
}

fn default_max_queue_size() -> usize {
    1000
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_interval_seconds() -> u64 {
    1
}

fn default_max_retry_delay_seconds() -> u64 {
    60
}

fn default_flush_interval_seconds() -> u64 {
    5
}

fn default_dlq_enabled() -> bool {
    true
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            dir: default_dir(),
            max_queue_size: default_max_queue_size(),
            max_retries: default_max_retries(),
            retry_interval_seconds: default_retry_interval_seconds(),
            max_retry_delay_seconds: default_max_retry_delay_seconds(),
            flush_interval_seconds: default_flush_interval_seconds(),
            dlq_enabled: default_dlq_enabled(),
            dlq_path: None,
        }
    }
}

impl BufferConfig {
    /// Base retry interval as a duration.
    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_seconds.max(1))
    }

    /// Backoff cap as a duration.
    pub fn max_retry_delay(&self) -> Duration {
        Duration::from_secs(self.max_retry_delay_seconds.max(1))
    }

    /// Retry-queue persistence period as a duration.
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_seconds.max(1))
    }
}

/// The queued form of a record inside an output buffer.
///
/// A buffered record lives in exactly one place at a time: the live queue,
/// the retry queue, a spill file, or the DLQ file. The serialized shape is
/// shared by spill files, the retry-queue snapshot, and the DLQ.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferedRecord {
    /// The wrapped record.
    #[serde(rename = "log")]
    pub record: Record,

    /// Delivery attempts so far; incremented before each try.
    pub attempts: u32,

    /// Instant of the most recent delivery attempt.
    pub last_attempt: DateTime<Utc>,

    /// Name of the owning output.
    pub output_name: String,

    /// Instant the record entered the buffer.
    pub enqueued_at: DateTime<Utc>,
}

/// Computes the retry backoff for a record that has been attempted
/// `attempts` times.
///
/// `attempts` below 1 is normalized to 1 and above 10 clamped to 10 before
/// shifting, and the shift itself is bounded so the multiplier cannot
/// overflow a 64-bit duration. The result never exceeds `max_retry_delay`.
pub fn calculate_backoff(attempts: u32, retry_interval: Duration, max_retry_delay: Duration) -> Duration {
    let attempts = attempts.clamp(1, 10);
    let shift = (attempts - 1).min(30);
    retry_interval.saturating_mul(1u32 << shift).min(max_retry_delay)
}

/// A per-sink bounded queue with disk-spill overflow, exponential-backoff
/// retries, and a dead-letter queue.
pub struct OutputBuffer {
    name: String,
    config: BufferConfig,
    sink: Arc<dyn Sink>,
    spool_dir: PathBuf,
    dlq_path: PathBuf,
    queue_tx: flume::Sender<BufferedRecord>,
    queue_rx: flume::Receiver<BufferedRecord>,
    retry: Mutex<Vec<BufferedRecord>>,
    dlq: Mutex<Option<BufWriter<File>>>,
    stats: Arc<BufferStats>,
    cancel: CancellationToken,
    tasks: tokio::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl OutputBuffer {
    /// Creates the buffer for one output, re-ingests any spill files left by
    /// a previous run, and spawns the delivery, retry, and flush workers.
    /// Must be called within a tokio runtime.
    pub fn new(name: impl Into<String>, sink: Arc<dyn Sink>, config: BufferConfig) -> Result<Arc<Self>, Error> {
        let name = name.into();
        let spool_dir = config.dir.join(&name);
        let dlq_path = config
            .dlq_path
            .clone()
            .unwrap_or_else(|| spool_dir.join("dlq.jsonl"));

        if config.enabled {
            std::fs::create_dir_all(&spool_dir).map_err(|e| Error::CreateDir {
                dir: spool_dir.display().to_string(),
                error: e.to_string(),
            })?;
        }

        let (queue_tx, queue_rx) = flume::bounded(config.max_queue_size.max(1));
        let buffer = Arc::new(Self {
            name,
            config,
            sink,
            spool_dir,
            dlq_path,
            queue_tx,
            queue_rx,
            retry: Mutex::new(Vec::new()),
            dlq: Mutex::new(None),
            stats: Arc::new(BufferStats::default()),
            cancel: CancellationToken::new(),
            tasks: tokio::sync::Mutex::new(Vec::new()),
            shut_down: AtomicBool::new(false),
        });

        if buffer.config.enabled {
            buffer.ingest_spool();

            let mut tasks = Vec::new();
            tasks.push(tokio::task::spawn(delivery_loop(buffer.clone())));
            tasks.push(tokio::task::spawn(retry_loop(buffer.clone())));
            tasks.push(tokio::task::spawn(flush_loop(buffer.clone())));
            *buffer
                .tasks
                .try_lock()
                .expect("buffer tasks lock free during construction") = tasks;
        }

        Ok(buffer)
    }

    /// Name of the owning output.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the live statistics block of this buffer.
    pub fn stats(&self) -> Arc<BufferStats> {
        self.stats.clone()
    }

    /// Accepts one record for delivery.
    ///
    /// With buffering enabled the call is bounded: it waits at most 100 ms
    /// for live-queue capacity and then spills the record to disk. With
    /// buffering disabled the sink is called synchronously and its error is
    /// returned.
    pub async fn enqueue(&self, record: Record) -> Result<(), Error> {
        if !self.config.enabled {
            return Ok(self.sink.write(&record).await?);
        }

        self.stats.on_enqueued();

        let now = Utc::now();
        let buffered = BufferedRecord {
            record,
            attempts: 0,
            last_attempt: now,
            output_name: self.name.clone(),
            enqueued_at: now,
        };

        match tokio::time::timeout(OFFER_TIMEOUT, self.queue_tx.send_async(buffered.clone())).await {
            Ok(Ok(())) => Ok(()),
            // Queue full past the offer window, or workers already gone:
            // the record goes to the spill spool instead of blocking the
            // routing task.
            Ok(Err(flume::SendError(rejected))) => self.spill(rejected),
            Err(_elapsed) => self.spill(buffered),
        }
    }

    /// Stops the workers, drains the live queue within a 10 s budget,
    /// persists the retry queue, closes the DLQ file, and closes the sink.
    /// Idempotent.
    pub async fn shutdown(&self) -> Result<(), Error> {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if !self.config.enabled {
            return Ok(self.sink.close().await?);
        }

        self.cancel.cancel();
        for task in self.tasks.lock().await.drain(..) {
            if let Err(error) = task.await {
                error!(output = %self.name, %error, "buffer task join failed");
            }
        }

        // One delivery try per still-queued record; failures land in the
        // retry queue so the final snapshot preserves them.
        let deadline = Instant::now() + DRAIN_BUDGET;
        while let Ok(buffered) = self.queue_rx.try_recv() {
            if Instant::now() >= deadline {
                self.stats.on_queue_to_retry();
                self.retry.lock().expect("retry queue lock poisoned").push(buffered);
                continue;
            }
            self.deliver(buffered).await;
        }

        self.persist_retry_queue();

        if let Some(mut writer) = self.dlq.lock().expect("dlq lock poisoned").take() {
            if let Err(error) = writer.flush() {
                error!(output = %self.name, %error, "dlq flush failed during shutdown");
            }
        }

        if let Err(error) = self.sink.close().await {
            error!(output = %self.name, %error, "sink close failed");
        }
        info!(output = %self.name, "output buffer shut down");
        Ok(())
    }

    /// One delivery attempt for a record taken from the live queue.
    async fn deliver(&self, mut buffered: BufferedRecord) {
        buffered.attempts += 1;
        buffered.last_attempt = Utc::now();
        match self.sink.write(&buffered.record).await {
            Ok(()) => self.stats.on_delivered(),
            Err(error) => {
                warn!(output = %self.name, %error, attempts = buffered.attempts, "delivery failed, scheduling retry");
                self.stats.on_retry_scheduled();
                self.retry.lock().expect("retry queue lock poisoned").push(buffered);
            }
        }
    }

    /// Evaluates the retry queue once: records whose backoff has elapsed get
    /// another attempt; exhausted records go to the DLQ.
    async fn process_retries(&self) {
        let due = {
            let mut retry = self.retry.lock().expect("retry queue lock poisoned");
            std::mem::take(&mut *retry)
        };
        if due.is_empty() {
            return;
        }

        let mut keep = Vec::new();
        for mut buffered in due {
            let backoff = calculate_backoff(
                buffered.attempts,
                self.config.retry_interval(),
                self.config.max_retry_delay(),
            );
            let elapsed = Utc::now()
                .signed_duration_since(buffered.last_attempt)
                .to_std()
                .unwrap_or(Duration::ZERO);
            if elapsed < backoff {
                keep.push(buffered);
                continue;
            }

            buffered.attempts += 1;
            buffered.last_attempt = Utc::now();
            match self.sink.write(&buffered.record).await {
                Ok(()) => self.stats.on_retry_delivered(),
                Err(error) => {
                    if buffered.attempts >= self.config.max_retries && self.config.dlq_enabled {
                        warn!(
                            output = %self.name,
                            attempts = buffered.attempts,
                            %error,
                            "retry budget exhausted"
                        );
                        self.dlq_append(&buffered);
                        self.stats.on_retry_finished();
                    } else {
                        // Without a DLQ an exhausted record is never
                        // dropped; it keeps retrying at the capped backoff.
                        keep.push(buffered);
                    }
                }
            }
        }

        let mut retry = self.retry.lock().expect("retry queue lock poisoned");
        keep.extend(retry.drain(..));
        *retry = keep;
    }

    /// Appends one record to the dead-letter queue file.
    fn dlq_append(&self, buffered: &BufferedRecord) {
        let result = (|| -> std::io::Result<()> {
            let mut dlq = self.dlq.lock().expect("dlq lock poisoned");
            if dlq.is_none() {
                if let Some(parent) = self.dlq_path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let file = OpenOptions::new().create(true).append(true).open(&self.dlq_path)?;
                *dlq = Some(BufWriter::new(file));
            }
            let writer = dlq.as_mut().expect("dlq writer just installed");
            serde_json::to_writer(&mut *writer, buffered)?;
            writer.write_all(b"\n")?;
            writer.flush()
        })();

        match result {
            Ok(()) => {
                self.stats.on_dlq();
                info!(output = %self.name, attempts = buffered.attempts, "record dead-lettered");
            }
            Err(error) => {
                self.stats.on_failed();
                error!(output = %self.name, %error, "dlq append failed, record lost");
            }
        }
    }

    /// Serializes the record to a unique spill file under the per-output
    /// spool directory.
    fn spill(&self, buffered: BufferedRecord) -> Result<(), Error> {
        self.stats.on_spilled();

        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let path = self.spool_dir.join(format!("buffer-{nanos}.jsonl"));

        let result = serde_json::to_string(&buffered)
            .map_err(|e| e.to_string())
            .and_then(|line| std::fs::write(&path, line + "\n").map_err(|e| e.to_string()));

        match result {
            Ok(()) => {
                debug!(output = %self.name, path = %path.display(), "record spilled to disk");
                Ok(())
            }
            Err(error) => {
                self.stats.on_failed();
                Err(Error::Spill {
                    path: path.display().to_string(),
                    error,
                })
            }
        }
    }

    /// Overwrites the retry-queue snapshot file with the current queue.
    fn persist_retry_queue(&self) {
        let snapshot: Vec<BufferedRecord> = self
            .retry
            .lock()
            .expect("retry queue lock poisoned")
            .clone();

        let mut content = String::new();
        for buffered in &snapshot {
            match serde_json::to_string(buffered) {
                Ok(line) => {
                    content.push_str(&line);
                    content.push('\n');
                }
                Err(error) => error!(output = %self.name, %error, "retry snapshot serialization failed"),
            }
        }

        let path = self.spool_dir.join(RETRY_QUEUE_FILE);
        if let Err(error) = std::fs::write(&path, content) {
            error!(output = %self.name, path = %path.display(), %error, "retry snapshot write failed");
        }
    }

    /// Ingests the `*.jsonl` files of the spool directory (spill files and
    /// the retry-queue snapshot of a previous run) into the retry queue and
    /// deletes them. Files resolving outside the spool directory are
    /// skipped.
    fn ingest_spool(&self) {
        let entries = match std::fs::read_dir(&self.spool_dir) {
            Ok(entries) => entries,
            Err(error) => {
                warn!(output = %self.name, %error, "spool directory not listable");
                return;
            }
        };

        let spool_root = match self.spool_dir.canonicalize() {
            Ok(root) => root,
            Err(error) => {
                warn!(output = %self.name, %error, "spool directory not resolvable");
                return;
            }
        };

        let mut ingested = 0usize;
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            if path == self.dlq_path {
                continue;
            }
            if !is_within(&path, &spool_root) {
                warn!(output = %self.name, path = %path.display(), "spool entry outside the spool directory, skipped");
                continue;
            }

            let content = match std::fs::read_to_string(&path) {
                Ok(content) => content,
                Err(error) => {
                    warn!(output = %self.name, path = %path.display(), %error, "spool file not readable, skipped");
                    continue;
                }
            };

            for line in content.lines() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<BufferedRecord>(line) {
                    Ok(mut buffered) => {
                        buffered.attempts = 0;
                        buffered.last_attempt = Utc::now();
                        self.stats.on_reingested();
                        self.retry.lock().expect("retry queue lock poisoned").push(buffered);
                        ingested += 1;
                    }
                    Err(error) => {
                        warn!(output = %self.name, path = %path.display(), %error, "malformed spool line skipped");
                    }
                }
            }

            if let Err(error) = std::fs::remove_file(&path) {
                error!(output = %self.name, path = %path.display(), %error, "ingested spool file not removed");
            }
        }

        if ingested > 0 {
            info!(output = %self.name, ingested, "spool records re-ingested into the retry queue");
        }
    }
}

/// Returns true when `path` resolves inside `root`.
fn is_within(path: &Path, root: &Path) -> bool {
    path.canonicalize().map(|p| p.starts_with(root)).unwrap_or(false)
}

async fn delivery_loop(buffer: Arc<OutputBuffer>) {
    loop {
        tokio::select! {
            _ = buffer.cancel.cancelled() => break,
            received = buffer.queue_rx.recv_async() => match received {
                Ok(buffered) => buffer.deliver(buffered).await,
                Err(_) => break,
            }
        }
    }
}

async fn retry_loop(buffer: Arc<OutputBuffer>) {
    let mut ticker = tokio::time::interval(RETRY_TICK);
    loop {
        tokio::select! {
            _ = buffer.cancel.cancelled() => break,
            _ = ticker.tick() => buffer.process_retries().await,
        }
    }
}

async fn flush_loop(buffer: Arc<OutputBuffer>) {
    let mut ticker = tokio::time::interval(buffer.config.flush_interval());
    loop {
        tokio::select! {
            _ = buffer.cancel.cancelled() => break,
            _ = ticker.tick() => buffer.persist_retry_queue(),
        }
    }
}
