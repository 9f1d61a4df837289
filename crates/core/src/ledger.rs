//! Append-Only Logstore - durable per-node record log
//!
//! Each node owns a line-oriented log split into segments. The active tail
//! lives at the configured path (`log.jsonl`); once it holds
//! `segment_entries` entries it is renamed to the next sealed segment
//! (`log.000001.jsonl`, `log.000002.jsonl`, ...) and a fresh tail starts.
//! Every line is a JSON-encoded [`LogEntry`] carrying:
//! - seq: monotonically increasing sequence index per node, starting at 1
//! - entry_id: stable content identifier used for replication dedup
//! - origin: node that first produced the record
//! - recorded_at: local append time (Unix milliseconds)
//! - record: the wrapped payload
//!
//! # Guarantees
//!
//! - Atomic visibility: a batch is written to a temporary copy of the tail
//!   which is then renamed over it, so readers never see a partial line or
//!   half a batch. Only the tail is rewritten; sealed segments are immutable
//! - Append-only: no in-place updates or deletes are exposed
//! - Idempotent replay: appending a known entry_id is a no-op
//! - Corruption detection: `open` replays every segment then the tail and
//!   checks segment numbering, seq continuity and entry_id uniqueness before
//!   accepting writes

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

use crate::types::{current_timestamp_ms, NodeId};

/// Entries held in the tail before it is sealed into a segment
pub const DEFAULT_SEGMENT_ENTRIES: usize = 4096;

const SEGMENT_DIGITS: usize = 6;

/// One record in a node's log
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogEntry<R> {
    pub seq: u64,
    pub entry_id: String,
    pub origin: NodeId,
    pub recorded_at: u64,
    pub record: R,
}

/// Result of appending a single record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// Stored under the given sequence index
    Appended(u64),
    /// Entry id already present; nothing written
    Duplicate,
}

/// Logstore health status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LogstoreHealth {
    Ok,
    Corrupted {
        /// Last good sequence number
        last_good_seq: Option<u64>,
        /// Line (1-based) where replay failed, within the failing file
        first_bad_line: usize,
        error_type: String,
    },
}

impl LogstoreHealth {
    pub fn is_ok(&self) -> bool {
        matches!(self, LogstoreHealth::Ok)
    }
}

/// Errors that can occur in logstore operations
#[derive(Debug, Error)]
pub enum LogstoreError {
    #[error("Sequence number violation: expected {expected}, got {actual}")]
    SequenceViolation { expected: u64, actual: u64 },

    #[error("Duplicate entry ID in persisted log: {entry_id}")]
    DuplicateEntryId { entry_id: String },

    #[error("Logstore corrupted: {0}")]
    CorruptionDetected(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid entry: {0}")]
    InvalidEntry(String),
}

pub type Result<T> = std::result::Result<T, LogstoreError>;

/// Observability metrics for the logstore
#[derive(Debug, Default, Clone, Serialize)]
pub struct LogstoreMetrics {
    pub entries_appended_total: u64,
    pub duplicates_skipped_total: u64,
    pub atomic_writes_total: u64,
    pub startup_checks_total: u64,
    pub segments_sealed_total: u64,
}

/// A record waiting to be appended
#[derive(Debug, Clone)]
pub struct PendingEntry<R> {
    pub entry_id: String,
    pub origin: NodeId,
    pub record: R,
}

/// Durable append-only log of `R` records for one node.
///
/// A `Logstore` is the single writer for its files. Share its contents by
/// cloning [`Logstore::entries`] into a snapshot, never by sharing the store.
#[derive(Debug)]
pub struct Logstore<R> {
    path: PathBuf,
    node_id: NodeId,
    entries: Vec<LogEntry<R>>,
    index: HashMap<String, u64>,
    /// Sealed segments on disk, numbered 1..=segments
    segments: u64,
    /// Entries currently in the tail file
    tail_len: usize,
    segment_entries: usize,
    health: LogstoreHealth,
    metrics: LogstoreMetrics,
}

impl<R> Logstore<R>
where
    R: Serialize + DeserializeOwned + Clone,
{
    /// Create or open the log at `path`, replaying and checking it.
    pub fn open(path: impl AsRef<Path>, node_id: impl Into<NodeId>) -> Result<Self> {
        let node_id = node_id.into();
        let path = path.as_ref().to_path_buf();

        info!(
            node_id = %node_id,
            path = %path.display(),
            "Opening logstore"
        );

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut store = Self {
            path,
            node_id,
            entries: Vec::new(),
            index: HashMap::new(),
            segments: 0,
            tail_len: 0,
            segment_entries: DEFAULT_SEGMENT_ENTRIES,
            health: LogstoreHealth::Ok,
            metrics: LogstoreMetrics::default(),
        };
        store.startup_continuity_check()?;
        Ok(store)
    }

    /// Seal the tail once it holds `entries` entries. Zero is treated as one.
    pub fn with_segment_entries(mut self, entries: usize) -> Self {
        self.segment_entries = entries.max(1);
        self
    }

    /// Parse a log without taking ownership of it.
    ///
    /// Used by auditors and summaries reading another process's state.
    /// A missing log is empty.
    pub fn read_file(path: impl AsRef<Path>) -> Result<Vec<LogEntry<R>>> {
        let path = path.as_ref();
        match load::<R>(path) {
            Ok(loaded) => Ok(loaded.entries),
            // The writer may have sealed the tail between listing and reading
            Err(_) => load::<R>(path)
                .map(|loaded| loaded.entries)
                .map_err(|failure| failure.error),
        }
    }

    fn startup_continuity_check(&mut self) -> Result<()> {
        self.metrics.startup_checks_total += 1;
        match load::<R>(&self.path) {
            Ok(loaded) => {
                info!(
                    node_id = %self.node_id,
                    entries = loaded.entries.len(),
                    segments = loaded.segments,
                    "Logstore continuity check passed"
                );
                self.entries = loaded.entries;
                self.index = loaded.index;
                self.segments = loaded.segments;
                self.tail_len = loaded.tail_len;
                Ok(())
            }
            Err(failure) => {
                error!(
                    node_id = %self.node_id,
                    file = %failure.file.display(),
                    line = failure.line,
                    error = %failure.error,
                    "Logstore corruption detected"
                );
                self.health = LogstoreHealth::Corrupted {
                    last_good_seq: failure.last_good_seq,
                    first_bad_line: failure.line,
                    error_type: failure.error.to_string(),
                };
                Err(LogstoreError::CorruptionDetected(format!(
                    "{} in {} at line {}",
                    failure.error,
                    failure.file.display(),
                    failure.line
                )))
            }
        }
    }

    /// Append one record. A known `entry_id` is a silent no-op.
    pub fn append(
        &mut self,
        entry_id: impl Into<String>,
        origin: impl Into<NodeId>,
        record: R,
    ) -> Result<AppendOutcome> {
        let outcomes = self.append_batch(vec![PendingEntry {
            entry_id: entry_id.into(),
            origin: origin.into(),
            record,
        }])?;
        Ok(outcomes[0])
    }

    /// Append a batch with a single atomic write.
    ///
    /// Either every new entry in the batch becomes visible or none does.
    /// Duplicates, including repeats inside the batch, are skipped.
    pub fn append_batch(&mut self, batch: Vec<PendingEntry<R>>) -> Result<Vec<AppendOutcome>> {
        if !self.health.is_ok() {
            return Err(LogstoreError::CorruptionDetected(
                "Cannot append to corrupted logstore".to_string(),
            ));
        }

        let mut outcomes = Vec::with_capacity(batch.len());
        let mut staged: Vec<LogEntry<R>> = Vec::new();
        let mut staged_ids: HashMap<String, u64> = HashMap::new();
        let mut next_seq = self.last_seq() + 1;
        let now = current_timestamp_ms();

        for pending in batch {
            if pending.entry_id.is_empty() {
                return Err(LogstoreError::InvalidEntry(
                    "entry_id cannot be empty".to_string(),
                ));
            }
            if self.index.contains_key(&pending.entry_id)
                || staged_ids.contains_key(&pending.entry_id)
            {
                trace!(entry_id = %pending.entry_id, "Skipping known entry");
                self.metrics.duplicates_skipped_total += 1;
                outcomes.push(AppendOutcome::Duplicate);
                continue;
            }
            staged_ids.insert(pending.entry_id.clone(), next_seq);
            staged.push(LogEntry {
                seq: next_seq,
                entry_id: pending.entry_id,
                origin: pending.origin,
                recorded_at: now,
                record: pending.record,
            });
            outcomes.push(AppendOutcome::Appended(next_seq));
            next_seq += 1;
        }

        if staged.is_empty() {
            return Ok(outcomes);
        }

        let mut lines = Vec::new();
        for entry in &staged {
            serde_json::to_writer(&mut lines, entry)?;
            lines.push(b'\n');
        }
        self.write_tail(&lines)?;

        debug!(
            node_id = %self.node_id,
            appended = staged.len(),
            last_seq = next_seq - 1,
            "Entries appended to logstore"
        );

        self.metrics.entries_appended_total += staged.len() as u64;
        self.tail_len += staged.len();
        self.index.extend(staged_ids);
        self.entries.extend(staged);

        if self.tail_len >= self.segment_entries {
            // The batch is already durable in the tail; sealing is retried on the next append
            if let Err(e) = self.seal_tail() {
                warn!(
                    node_id = %self.node_id,
                    error = %e,
                    "Failed to seal log segment"
                );
            }
        }
        Ok(outcomes)
    }

    /// Copy the tail to the temp file, add `lines`, then rename it back.
    fn write_tail(&mut self, lines: &[u8]) -> Result<()> {
        let tmp = self.path.with_extension("jsonl.tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            match fs::File::open(&self.path) {
                Ok(mut tail) => {
                    std::io::copy(&mut tail, &mut file)?;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            file.write_all(lines)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        self.metrics.atomic_writes_total += 1;
        Ok(())
    }

    fn seal_tail(&mut self) -> Result<()> {
        let number = self.segments + 1;
        let target = segment_path(&self.path, number);
        if target.exists() {
            return Err(LogstoreError::CorruptionDetected(format!(
                "segment {} already exists",
                target.display()
            )));
        }
        fs::rename(&self.path, &target)?;
        info!(
            node_id = %self.node_id,
            segment = number,
            entries = self.tail_len,
            "Log segment sealed"
        );
        self.segments = number;
        self.tail_len = 0;
        self.metrics.segments_sealed_total += 1;
        Ok(())
    }

    pub fn entries(&self) -> &[LogEntry<R>] {
        &self.entries
    }

    /// Entries with `seq > after`, at most `limit` of them
    pub fn entries_after(&self, after: u64, limit: usize) -> &[LogEntry<R>] {
        entries_after(&self.entries, after, limit)
    }

    pub fn contains(&self, entry_id: &str) -> bool {
        self.index.contains_key(entry_id)
    }

    pub fn last_seq(&self) -> u64 {
        self.entries.last().map(|e| e.seq).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of sealed segments behind the tail
    pub fn segment_count(&self) -> u64 {
        self.segments
    }

    pub fn health(&self) -> &LogstoreHealth {
        &self.health
    }

    pub fn metrics(&self) -> &LogstoreMetrics {
        &self.metrics
    }
}

/// Slice of `entries` with `seq > after`, at most `limit` long.
///
/// Relies on seqs being contiguous from 1.
pub fn entries_after<R>(entries: &[LogEntry<R>], after: u64, limit: usize) -> &[LogEntry<R>] {
    let start = (after as usize).min(entries.len());
    let end = start.saturating_add(limit).min(entries.len());
    &entries[start..end]
}

/// Path of sealed segment `number` for the tail at `tail`
pub fn segment_path(tail: &Path, number: u64) -> PathBuf {
    let (stem, ext) = stem_and_ext(tail);
    tail.with_file_name(format!(
        "{}.{:0width$}.{}",
        stem,
        number,
        ext,
        width = SEGMENT_DIGITS
    ))
}

fn stem_and_ext(tail: &Path) -> (String, String) {
    let stem = tail
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = tail
        .extension()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "jsonl".to_string());
    (stem, ext)
}

fn segment_number(file_name: &str, stem: &str, ext: &str) -> Option<u64> {
    let digits = file_name
        .strip_prefix(stem)?
        .strip_prefix('.')?
        .strip_suffix(ext)?
        .strip_suffix('.')?;
    if digits.len() < SEGMENT_DIGITS || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Sealed segments next to `tail`, in order. Numbering must run 1..=n.
fn list_segments(tail: &Path) -> Result<Vec<PathBuf>> {
    let dir = match tail.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let read_dir = match fs::read_dir(&dir) {
        Ok(read_dir) => read_dir,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let (stem, ext) = stem_and_ext(tail);

    let mut numbers = Vec::new();
    for dirent in read_dir {
        let name = dirent?.file_name();
        if let Some(number) = segment_number(&name.to_string_lossy(), &stem, &ext) {
            numbers.push(number);
        }
    }
    numbers.sort_unstable();

    for (i, number) in numbers.iter().enumerate() {
        let expected = i as u64 + 1;
        if *number != expected {
            return Err(LogstoreError::CorruptionDetected(format!(
                "missing segment {}",
                segment_path(tail, expected).display()
            )));
        }
    }
    Ok(numbers.into_iter().map(|n| segment_path(tail, n)).collect())
}

struct Loaded<R> {
    entries: Vec<LogEntry<R>>,
    index: HashMap<String, u64>,
    segments: u64,
    tail_len: usize,
}

struct LoadFailure {
    last_good_seq: Option<u64>,
    file: PathBuf,
    line: usize,
    error: LogstoreError,
}

fn load<R: DeserializeOwned>(tail: &Path) -> std::result::Result<Loaded<R>, LoadFailure> {
    let segments = list_segments(tail).map_err(|error| LoadFailure {
        last_good_seq: None,
        file: tail.to_path_buf(),
        line: 0,
        error,
    })?;

    let mut entries: Vec<LogEntry<R>> = Vec::new();
    let mut index = HashMap::new();
    for segment in &segments {
        let raw = fs::read(segment).map_err(|e| LoadFailure {
            last_good_seq: entries.last().map(|e| e.seq),
            file: segment.clone(),
            line: 0,
            error: e.into(),
        })?;
        replay_into(&raw, &mut entries, &mut index).map_err(|(last_good_seq, line, error)| {
            LoadFailure {
                last_good_seq,
                file: segment.clone(),
                line,
                error,
            }
        })?;
    }

    let sealed = entries.len();
    let raw = match fs::read(tail) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(e) => {
            return Err(LoadFailure {
                last_good_seq: entries.last().map(|e| e.seq),
                file: tail.to_path_buf(),
                line: 0,
                error: e.into(),
            })
        }
    };
    replay_into(&raw, &mut entries, &mut index).map_err(|(last_good_seq, line, error)| {
        LoadFailure {
            last_good_seq,
            file: tail.to_path_buf(),
            line,
            error,
        }
    })?;

    Ok(Loaded {
        tail_len: entries.len() - sealed,
        entries,
        index,
        segments: segments.len() as u64,
    })
}

type ReplayFailure = (Option<u64>, usize, LogstoreError);

/// Parse `raw` onto `entries`, continuing the seq run already there.
fn replay_into<R: DeserializeOwned>(
    raw: &[u8],
    entries: &mut Vec<LogEntry<R>>,
    index: &mut HashMap<String, u64>,
) -> std::result::Result<(), ReplayFailure> {
    for (i, line) in raw.split(|b| *b == b'\n').enumerate() {
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        let last_good = entries.last().map(|e| e.seq);
        let entry: LogEntry<R> =
            serde_json::from_slice(line).map_err(|e| (last_good, i + 1, e.into()))?;
        let expected = last_good.unwrap_or(0) + 1;
        if entry.seq != expected {
            return Err((
                last_good,
                i + 1,
                LogstoreError::SequenceViolation {
                    expected,
                    actual: entry.seq,
                },
            ));
        }
        if index.insert(entry.entry_id.clone(), entry.seq).is_some() {
            return Err((
                last_good,
                i + 1,
                LogstoreError::DuplicateEntryId {
                    entry_id: entry.entry_id,
                },
            ));
        }
        entries.push(entry);
    }
    Ok(())
}
