//! Durable send queue for events not yet acknowledged by the remote.
//!
//! The queue lives on disk (`queue.jsonl`), one envelope per line in
//! insertion order. Every operation re-reads the file under an exclusive
//! lock, so separate processes (an emitting CLI and a watching sync task)
//! always agree on its content.

use crate::domain::errors::CoreError;
use crate::domain::types::EventId;
use crate::envelope::Envelope;
use crate::paths::write_atomic;
use crate::sync::ProjectIdentity;
use fs2::FileExt;
use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Debug)]
pub struct OfflineQueue {
    path: PathBuf,
    lock_path: PathBuf,
    guard: Mutex<()>,
}

impl OfflineQueue {
    pub fn open(path: PathBuf) -> Result<Self, CoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut lock_name = path.as_os_str().to_owned();
        lock_name.push(".lock");

        let queue = Self {
            path,
            lock_path: PathBuf::from(lock_name),
            guard: Mutex::new(()),
        };
        let pending = queue.len()?;
        if pending > 0 {
            tracing::info!(pending, path = %queue.path.display(), "resuming offline queue");
        }
        Ok(queue)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Enqueues `envelope` unless its id is already queued. Returns whether it was added.
    pub fn push(&self, envelope: &Envelope) -> Result<bool, CoreError> {
        self.with_lock(|| {
            let (mut entries, torn) = read_file(&self.path)?;
            if entries.iter().any(|e| e.event_id == envelope.event_id) {
                return Ok(false);
            }
            if torn {
                // Appending after a torn line would corrupt the new entry.
                entries.push(envelope.clone());
                self.rewrite(&entries)?;
                return Ok(true);
            }

            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?;
            writeln!(file, "{}", envelope.to_json_line()?)?;
            file.sync_all()?;
            Ok(true)
        })
    }

    /// Every queued envelope in insertion order.
    pub fn snapshot(&self) -> Result<Vec<Envelope>, CoreError> {
        self.with_lock(|| read_entries(&self.path))
    }

    pub fn len(&self) -> Result<usize, CoreError> {
        Ok(self.snapshot()?.len())
    }

    pub fn is_empty(&self) -> Result<bool, CoreError> {
        Ok(self.len()? == 0)
    }

    /// Removes `ids` from the queue. Returns how many entries were removed.
    pub fn acknowledge(&self, ids: &[EventId]) -> Result<usize, CoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let ids: HashSet<EventId> = ids.iter().copied().collect();

        self.with_lock(|| {
            let entries = read_entries(&self.path)?;
            let before = entries.len();
            let remaining: Vec<Envelope> = entries
                .into_iter()
                .filter(|e| !ids.contains(&e.event_id))
                .collect();
            let removed = before - remaining.len();
            if removed > 0 {
                self.rewrite(&remaining)?;
            }
            Ok(removed)
        })
    }

    /// Stamps the project identity onto queued envelopes that lack one.
    ///
    /// Only the queued copy changes. The copy in the aggregate log keeps the
    /// enrichment it was committed with, so history read back locally may
    /// lack the identity the remote received.
    pub fn stamp_identity(&self, identity: &ProjectIdentity) -> Result<usize, CoreError> {
        self.with_lock(|| {
            let mut entries = read_entries(&self.path)?;
            let mut stamped = 0;
            for envelope in entries.iter_mut().filter(|e| e.project_uuid.is_none()) {
                envelope.project_uuid = Some(identity.project_uuid);
                if envelope.project_slug.is_none() {
                    envelope.project_slug.clone_from(&identity.project_slug);
                }
                if envelope.team_slug.is_none() {
                    envelope.team_slug.clone_from(&identity.team_slug);
                }
                stamped += 1;
            }
            if stamped > 0 {
                self.rewrite(&entries)?;
                tracing::debug!(stamped, "stamped project identity onto queued events");
            }
            Ok(stamped)
        })
    }

    fn rewrite(&self, entries: &[Envelope]) -> Result<(), CoreError> {
        let mut content = String::new();
        for envelope in entries {
            content.push_str(&envelope.to_json_line()?);
            content.push('\n');
        }
        write_atomic(&self.path, content.as_bytes())
    }

    fn with_lock<T>(&self, f: impl FnOnce() -> Result<T, CoreError>) -> Result<T, CoreError> {
        let _guard = self.guard.lock().unwrap_or_else(|e| e.into_inner());
        // The queue file itself is replaced on rewrite, so lock a sidecar.
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock_path)?;
        lock.lock_exclusive()
            .map_err(|e| CoreError::storage(format!("lock {}: {}", self.lock_path.display(), e)))?;
        let result = f();
        let _ = lock.unlock();
        result
    }
}

fn read_entries(path: &Path) -> Result<Vec<Envelope>, CoreError> {
    read_file(path).map(|(entries, _)| entries)
}

/// Parses the queue file; the flag reports a torn final line.
fn read_file(path: &Path) -> Result<(Vec<Envelope>, bool), CoreError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok((Vec::new(), false)),
        Err(e) => return Err(e.into()),
    };

    let mut seen = HashSet::new();
    let mut entries = Vec::new();
    let terminated = content.is_empty() || content.ends_with('\n');
    let lines: Vec<&str> = content.lines().collect();
    for (index, line) in lines.iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Envelope>(line) {
            Ok(envelope) => {
                if seen.insert(envelope.event_id) {
                    entries.push(envelope);
                }
            }
            Err(_) if index + 1 == lines.len() && !terminated => {
                tracing::warn!(path = %path.display(), "skipping torn final queue entry");
                return Ok((entries, true));
            }
            Err(e) => {
                return Err(CoreError::storage(format!(
                    "corrupt queue entry at {}:{}: {}",
                    path.display(),
                    index + 1,
                    e
                )))
            }
        }
    }
    Ok((entries, false))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::lane::Lane;
    use crate::domain::types::{ProjectId, TeamSlug};
    use crate::test_support::{node, status_envelope};
    use tempfile::tempdir;
    use uuid::Uuid;

    fn identity() -> ProjectIdentity {
        ProjectIdentity {
            project_uuid: ProjectId(Uuid::nil()),
            project_slug: Some("demo".to_string()),
            team_slug: Some(TeamSlug::from("core")),
        }
    }

    #[test]
    fn test_push_keeps_insertion_order_and_dedupes() {
        let dir = tempdir().unwrap();
        let queue = OfflineQueue::open(dir.path().join("queue.jsonl")).unwrap();
        let second = status_envelope("WP01", Lane::Claimed, Lane::Doing, node(1), 9);
        let first = status_envelope("WP01", Lane::Planned, Lane::Claimed, node(1), 10);

        assert!(queue.push(&second).unwrap());
        assert!(queue.push(&first).unwrap());
        assert!(!queue.push(&second).unwrap());

        let ids: Vec<EventId> = queue.snapshot().unwrap().iter().map(|e| e.event_id).collect();
        assert_eq!(ids, vec![second.event_id, first.event_id]);
    }

    #[test]
    fn test_acknowledge_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.jsonl");
        let events: Vec<Envelope> = (1..=3)
            .map(|i| status_envelope("WP01", Lane::Planned, Lane::Claimed, node(1), i))
            .collect();

        let queue = OfflineQueue::open(path.clone()).unwrap();
        for event in &events {
            queue.push(event).unwrap();
        }
        assert_eq!(
            queue
                .acknowledge(&[events[0].event_id, events[2].event_id])
                .unwrap(),
            2
        );
        drop(queue);

        let reopened = OfflineQueue::open(path).unwrap();
        let remaining = reopened.snapshot().unwrap();
        assert_eq!(remaining, vec![events[1].clone()]);
        assert_eq!(reopened.acknowledge(&[events[0].event_id]).unwrap(), 0);
    }

    #[test]
    fn test_stamp_identity_only_fills_missing_fields() {
        let dir = tempdir().unwrap();
        let queue = OfflineQueue::open(dir.path().join("queue.jsonl")).unwrap();
        let bare = status_envelope("WP01", Lane::Planned, Lane::Claimed, node(1), 1);
        let mut owned = status_envelope("WP02", Lane::Planned, Lane::Claimed, node(1), 2);
        let other = ProjectId(Uuid::from_u128(7));
        owned.project_uuid = Some(other);

        queue.push(&bare).unwrap();
        queue.push(&owned).unwrap();
        assert_eq!(queue.stamp_identity(&identity()).unwrap(), 1);

        let stamped = queue.snapshot().unwrap();
        assert_eq!(stamped[0].project_uuid, Some(ProjectId(Uuid::nil())));
        assert_eq!(stamped[0].project_slug.as_deref(), Some("demo"));
        assert_eq!(stamped[0].team_slug, Some(TeamSlug::from("core")));
        assert_eq!(stamped[1].project_uuid, Some(other));
        assert!(stamped[1].project_slug.is_none());
    }

    #[test]
    fn test_torn_final_entry_is_ignored() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.jsonl");
        let queue = OfflineQueue::open(path.clone()).unwrap();
        let event = status_envelope("WP01", Lane::Planned, Lane::Claimed, node(1), 1);
        queue.push(&event).unwrap();

        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"event_id\":").unwrap();
        drop(file);

        assert_eq!(queue.snapshot().unwrap(), vec![event.clone()]);

        let next = status_envelope("WP01", Lane::Claimed, Lane::Doing, node(1), 2);
        assert!(queue.push(&next).unwrap());
        assert_eq!(queue.snapshot().unwrap(), vec![event, next]);
    }
}
