//! Lamport clock and node identity.
//!
//! The clock is an owned counter handed to the envelope factory and the merge
//! engine; there is no process-global clock. Every mutation goes through one
//! mutex so concurrent local emissions are serialized.

use crate::domain::errors::CoreError;
use crate::domain::types::{LamportTime, NodeId, TimestampUtc};
use crate::paths::write_atomic;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// Persisted clock state.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredClock {
    counter: u64,
    updated_at: TimestampUtc,
}

/// Per-node logical clock.
#[derive(Debug)]
pub struct LamportClock {
    counter: Mutex<u64>,
    path: Option<PathBuf>,
}

impl LamportClock {
    /// Creates a clock that is never persisted.
    pub fn in_memory() -> Self {
        Self {
            counter: Mutex::new(0),
            path: None,
        }
    }

    /// Opens a clock persisted at `path`, starting at zero if the file is absent.
    pub fn open(path: PathBuf) -> Result<Self, CoreError> {
        let counter = match std::fs::read_to_string(&path) {
            Ok(content) => {
                let stored: StoredClock = serde_json::from_str(&content).map_err(|e| {
                    CoreError::storage(format!("corrupt clock file {}: {}", path.display(), e))
                })?;
                stored.counter
            }
            Err(e) if e.kind() == ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            counter: Mutex::new(counter),
            path: Some(path),
        })
    }

    /// Advances the clock for a locally emitted event.
    ///
    /// The returned value exceeds every value previously returned or observed.
    pub fn tick(&self) -> Result<LamportTime, CoreError> {
        let mut counter = self.lock();
        let next = counter
            .checked_add(1)
            .ok_or_else(|| CoreError::storage("lamport clock overflow"))?;
        *counter = next;
        self.persist(next)?;
        Ok(LamportTime(next))
    }

    /// Records a clock value seen on a remote event. Does not advance past it.
    pub fn observe(&self, seen: LamportTime) {
        let mut counter = self.lock();
        if seen.0 > *counter {
            *counter = seen.0;
        }
    }

    pub fn current(&self) -> LamportTime {
        LamportTime(*self.lock())
    }

    fn lock(&self) -> MutexGuard<'_, u64> {
        // A plain counter cannot be left half-updated by a panicking holder.
        self.counter.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn persist(&self, counter: u64) -> Result<(), CoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let stored = StoredClock {
            counter,
            updated_at: TimestampUtc::now(),
        };
        let content =
            serde_json::to_vec(&stored).map_err(|e| CoreError::storage(e.to_string()))?;
        write_atomic(path, &content)
    }
}

/// Loads the node identity at `path`, creating it on first run.
///
/// Creation uses exclusive-create so two processes starting at once settle on
/// the same identity.
pub fn load_or_create_node_id(path: &Path) -> Result<NodeId, CoreError> {
    if let Some(existing) = read_node_id(path)? {
        return Ok(existing);
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let node_id = NodeId::generate();
    match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(mut file) => {
            writeln!(file, "{}", node_id)?;
            file.sync_all()?;
            tracing::info!(node_id = %node_id, "created node identity");
            Ok(node_id)
        }
        Err(e) if e.kind() == ErrorKind::AlreadyExists => read_node_id(path)?
            .ok_or_else(|| CoreError::storage("node identity vanished during creation")),
        Err(e) => Err(e.into()),
    }
}

fn read_node_id(path: &Path) -> Result<Option<NodeId>, CoreError> {
    match std::fs::read_to_string(path) {
        Ok(content) if content.trim().is_empty() => Err(CoreError::storage(format!(
            "node identity file {} is empty",
            path.display()
        ))),
        Ok(content) => content.parse().map(Some).map_err(|e: String| {
            CoreError::storage(format!("invalid node identity in {}: {}", path.display(), e))
        }),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}
