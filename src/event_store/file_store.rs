//! File-based event log implementation.
//!
//! Stores one JSONL file (one envelope per line) per aggregate with support for:
//! - Per-aggregate in-process mutexes plus `fs2` advisory locks across processes
//! - Idempotent appends keyed by event id
//! - All-or-nothing batches across aggregates, rolled back by truncation

use crate::domain::errors::CoreError;
use crate::domain::types::{AggregateId, AggregateRef, AggregateType, EventId, LamportTime};
use crate::envelope::Envelope;
use crate::paths::hex_encode;
use fs2::FileExt;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

/// Prefix of file names derived from a hash of the aggregate id.
const HASHED_PREFIX: &str = "sha256-";

/// Result of appending a single envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended,
    /// The event id was already present; nothing was written.
    Duplicate,
}

/// Result of an atomic multi-aggregate append.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub appended: Vec<EventId>,
    pub duplicates: Vec<EventId>,
}

/// Append-only, per-aggregate event log rooted at a directory.
#[derive(Debug)]
pub struct FileEventLog {
    root: PathBuf,
    locks: Mutex<HashMap<AggregateRef, Arc<Mutex<()>>>>,
}

/// An aggregate file held open and exclusively locked during a write.
struct LockedFile {
    file: File,
    path: PathBuf,
    ids: HashSet<EventId>,
    prior_len: u64,
}

impl FileEventLog {
    /// Opens (creating if needed) the log rooted at `root`.
    pub fn open(root: PathBuf) -> Result<Self, CoreError> {
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// File holding the events of `aggregate`.
    pub fn path_for(&self, aggregate: &AggregateRef) -> PathBuf {
        self.root
            .join(aggregate.aggregate_type.dir_name())
            .join(format!("{}.jsonl", file_stem(aggregate.aggregate_id.as_str())))
    }

    /// Appends one envelope. Durable (synced) before this returns `Appended`.
    pub fn append(&self, envelope: &Envelope) -> Result<AppendOutcome, CoreError> {
        envelope.validate()?;

        let mutex = self.aggregate_mutex(&envelope.aggregate);
        let _guard = lock_ignoring_poison(&mutex);
        let mut locked = LockedFile::acquire(self.path_for(&envelope.aggregate))?;

        if locked.ids.contains(&envelope.event_id) {
            tracing::warn!(
                event_id = %envelope.event_id,
                aggregate = %envelope.aggregate,
                "duplicate event ignored"
            );
            return Ok(AppendOutcome::Duplicate);
        }

        let line = envelope.to_json_line()?;
        if let Err(e) = locked.write_line(&line).and_then(|_| locked.sync()) {
            locked.rollback();
            return Err(e);
        }

        tracing::debug!(
            event_id = %envelope.event_id,
            event_type = %envelope.event_type(),
            aggregate = %envelope.aggregate,
            lamport_clock = %envelope.lamport_clock,
            "appended event"
        );
        Ok(AppendOutcome::Appended)
    }

    /// Appends a batch spanning any number of aggregates, all or nothing.
    ///
    /// Every envelope is validated before anything is written. Locks are taken
    /// in aggregate order; on failure each touched file is truncated back to
    /// its length before the batch.
    pub fn append_batch(&self, envelopes: &[Envelope]) -> Result<BatchOutcome, CoreError> {
        for envelope in envelopes {
            envelope.validate()?;
        }

        let mut grouped: BTreeMap<&AggregateRef, Vec<&Envelope>> = BTreeMap::new();
        for envelope in envelopes {
            grouped.entry(&envelope.aggregate).or_default().push(envelope);
        }

        let mutexes: Vec<Arc<Mutex<()>>> = grouped
            .keys()
            .map(|aggregate| self.aggregate_mutex(aggregate))
            .collect();
        let _guards: Vec<MutexGuard<'_, ()>> =
            mutexes.iter().map(|m| lock_ignoring_poison(m)).collect();

        let mut outcome = BatchOutcome::default();
        let mut touched: Vec<LockedFile> = Vec::with_capacity(grouped.len());

        let result = (|| -> Result<(), CoreError> {
            for (aggregate, batch) in &grouped {
                let mut locked = LockedFile::acquire(self.path_for(aggregate))?;
                for envelope in batch {
                    if !locked.ids.insert(envelope.event_id) {
                        outcome.duplicates.push(envelope.event_id);
                        continue;
                    }
                    locked.write_line(&envelope.to_json_line()?)?;
                    outcome.appended.push(envelope.event_id);
                }
                touched.push(locked);
            }
            for locked in &mut touched {
                locked.sync()?;
            }
            Ok(())
        })();

        if let Err(e) = result {
            tracing::warn!(error = %e, aggregates = touched.len(), "rolling back event batch");
            for locked in &mut touched {
                locked.rollback();
            }
            return Err(e);
        }

        tracing::debug!(
            appended = outcome.appended.len(),
            duplicates = outcome.duplicates.len(),
            aggregates = grouped.len(),
            "appended event batch"
        );
        Ok(outcome)
    }

    /// Events of `aggregate` in the deterministic total order.
    pub fn read(&self, aggregate: &AggregateRef) -> Result<Vec<Envelope>, CoreError> {
        let mut events = self.read_append_order(aggregate)?;
        events.sort_by(|a, b| a.order_key().cmp(&b.order_key()));
        Ok(events)
    }

    /// Events of `aggregate` exactly as they were appended.
    pub fn read_append_order(&self, aggregate: &AggregateRef) -> Result<Vec<Envelope>, CoreError> {
        read_file(&self.path_for(aggregate))
    }

    /// Whether `event_id` is already stored for `aggregate`.
    pub fn contains(&self, aggregate: &AggregateRef, event_id: EventId) -> Result<bool, CoreError> {
        Ok(self
            .read_append_order(aggregate)?
            .iter()
            .any(|e| e.event_id == event_id))
    }

    /// Which of `ids` are stored under any aggregate.
    pub fn find_ids(&self, ids: &HashSet<EventId>) -> Result<HashSet<EventId>, CoreError> {
        let mut found = HashSet::new();
        if ids.is_empty() {
            return Ok(found);
        }
        for aggregate in self.aggregates()? {
            for envelope in self.read_append_order(&aggregate)? {
                if ids.contains(&envelope.event_id) {
                    found.insert(envelope.event_id);
                }
            }
            if found.len() == ids.len() {
                break;
            }
        }
        Ok(found)
    }

    /// Every aggregate with at least one stored event, sorted.
    pub fn aggregates(&self) -> Result<Vec<AggregateRef>, CoreError> {
        let mut found = Vec::new();
        for aggregate_type in [AggregateType::WorkPackage, AggregateType::Feature] {
            let dir = self.root.join(aggregate_type.dir_name());
            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };

            for entry in entries {
                let path = entry?.path();
                if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                    continue;
                }
                let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                    continue;
                };
                if stem.starts_with(HASHED_PREFIX) {
                    // Hashed names cannot be reversed; recover the id from the content.
                    if let Some(first) = read_file(&path)?.into_iter().next() {
                        found.push(first.aggregate);
                    }
                } else if fs::metadata(&path)?.len() > 0 {
                    found.push(AggregateRef {
                        aggregate_type,
                        aggregate_id: AggregateId::from(stem),
                    });
                }
            }
        }
        found.sort();
        found.dedup();
        Ok(found)
    }

    /// Highest Lamport clock value stored anywhere in the log.
    pub fn max_clock(&self) -> Result<LamportTime, CoreError> {
        let mut max = LamportTime::default();
        for aggregate in self.aggregates()? {
            for envelope in self.read_append_order(&aggregate)? {
                max = max.max(envelope.lamport_clock);
            }
        }
        Ok(max)
    }

    /// Monotonic version of an aggregate's log (its byte length).
    pub fn version(&self, aggregate: &AggregateRef) -> Result<u64, CoreError> {
        match fs::metadata(self.path_for(aggregate)) {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn aggregate_mutex(&self, aggregate: &AggregateRef) -> Arc<Mutex<()>> {
        let mut locks = lock_ignoring_poison(&self.locks);
        Arc::clone(locks.entry(aggregate.clone()).or_default())
    }
}

impl LockedFile {
    /// Opens and exclusively locks `path`, repairing a torn final line.
    fn acquire(path: PathBuf) -> Result<Self, CoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .map_err(|e| CoreError::storage(format!("open {}: {}", path.display(), e)))?;
        file.lock_exclusive()
            .map_err(|e| CoreError::storage(format!("lock {}: {}", path.display(), e)))?;

        let mut content = String::new();
        file.seek(SeekFrom::Start(0))?;
        file.read_to_string(&mut content)?;

        let mut prior_len = content.len() as u64;
        if !content.is_empty() && !content.ends_with('\n') {
            let keep = content.rfind('\n').map(|i| i + 1).unwrap_or(0);
            tracing::warn!(
                path = %path.display(),
                dropped_bytes = content.len() - keep,
                "truncating torn final line"
            );
            file.set_len(keep as u64)?;
            content.truncate(keep);
            prior_len = keep as u64;
        }

        let mut ids = HashSet::new();
        for (index, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            ids.insert(parse_event_id(line, &path, index + 1)?);
        }

        Ok(Self {
            file,
            path,
            ids,
            prior_len,
        })
    }

    fn write_line(&mut self, line: &str) -> Result<(), CoreError> {
        writeln!(self.file, "{}", line)
            .map_err(|e| CoreError::storage(format!("write {}: {}", self.path.display(), e)))
    }

    fn sync(&mut self) -> Result<(), CoreError> {
        self.file.flush()?;
        self.file
            .sync_all()
            .map_err(|e| CoreError::storage(format!("sync {}: {}", self.path.display(), e)))
    }

    fn rollback(&mut self) {
        let restored = self
            .file
            .set_len(self.prior_len)
            .and_then(|_| self.file.sync_all());
        if let Err(e) = restored {
            tracing::error!(path = %self.path.display(), error = %e, "failed to roll back append");
        }
    }
}

/// Reads every envelope from `path` under a shared lock.
fn read_file(path: &Path) -> Result<Vec<Envelope>, CoreError> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    file.lock_shared()
        .map_err(|e| CoreError::storage(format!("lock {}: {}", path.display(), e)))?;

    let mut reader = BufReader::new(file);
    let mut envelopes = Vec::new();
    let mut line = String::new();
    let mut line_no = 0usize;

    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            break;
        }
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Envelope>(&line) {
            Ok(envelope) => envelopes.push(envelope),
            // An unterminated last line is a write in progress or a crash remnant.
            Err(_) if !line.ends_with('\n') => {
                tracing::warn!(path = %path.display(), line = line_no, "skipping torn final line");
            }
            Err(e) => {
                return Err(CoreError::storage(format!(
                    "corrupt event at {}:{}: {}",
                    path.display(),
                    line_no,
                    e
                )))
            }
        }
    }

    Ok(envelopes)
}

/// Extracts just the event id of a stored line.
fn parse_event_id(line: &str, path: &Path, line_no: usize) -> Result<EventId, CoreError> {
    #[derive(serde::Deserialize)]
    struct IdOnly {
        event_id: EventId,
    }
    serde_json::from_str::<IdOnly>(line)
        .map(|r| r.event_id)
        .map_err(|e| {
            CoreError::storage(format!(
                "corrupt event at {}:{}: {}",
                path.display(),
                line_no,
                e
            ))
        })
}

/// File stem for an aggregate id; ids that are not filesystem-safe are hashed.
fn file_stem(aggregate_id: &str) -> String {
    let safe = !aggregate_id.is_empty()
        && !aggregate_id.starts_with('.')
        && !aggregate_id.starts_with(HASHED_PREFIX)
        && aggregate_id.len() <= 128
        && aggregate_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if safe {
        aggregate_id.to_string()
    } else {
        format!(
            "{}{}",
            HASHED_PREFIX,
            hex_encode(&Sha256::digest(aggregate_id.as_bytes()))
        )
    }
}

fn lock_ignoring_poison<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
#[path = "tests/file_store_tests.rs"]
mod tests;
