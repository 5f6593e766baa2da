//! Centralized home-based storage paths for wp-sync persistence.
//!
//! Layout under `~/.wp-sync/` (or `$WP_SYNC_HOME`):
//! - `node_id` - per-installation node identity
//! - `config.yaml` - optional user configuration
//! - `state/<wd-hash>/` - per-repository state:
//!   - `clock.json` - persisted Lamport counter
//!   - `events/<aggregate-type>/<aggregate-id>.jsonl` - local event log
//!   - `queue.jsonl` - unacknowledged outgoing events
//!   - `logs/audit.jsonl` - structured audit log

use crate::domain::errors::CoreError;
use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// The name of the wp-sync home directory.
const WP_SYNC_DIR: &str = ".wp-sync";

/// Environment variable overriding the home directory.
pub const HOME_ENV: &str = "WP_SYNC_HOME";

/// Returns the wp-sync home directory, creating it if needed.
///
/// # Errors
///
/// Returns an error if:
/// - Home directory cannot be determined
/// - Directory creation fails
pub fn wp_sync_home_dir() -> Result<PathBuf> {
    let dir = match std::env::var(HOME_ENV) {
        Ok(custom) if !custom.trim().is_empty() => PathBuf::from(custom),
        _ => dirs::home_dir()
            .context("Could not determine home directory for wp-sync state")?
            .join(WP_SYNC_DIR),
    };
    fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create wp-sync directory: {}", dir.display()))?;
    Ok(dir)
}

/// Returns the default user config path: `~/.wp-sync/config.yaml`
pub fn config_path() -> Result<PathBuf> {
    Ok(wp_sync_home_dir()?.join("config.yaml"))
}

/// All files the engine reads and writes for one repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatePaths {
    pub node_id: PathBuf,
    pub clock: PathBuf,
    pub events_dir: PathBuf,
    pub queue: PathBuf,
    pub logs_dir: PathBuf,
}

impl StatePaths {
    /// Places every file under `root`. Used for tests and explicit `--state-dir`.
    pub fn under(root: &Path) -> Self {
        Self {
            node_id: root.join("node_id"),
            clock: root.join("clock.json"),
            events_dir: root.join("events"),
            queue: root.join("queue.jsonl"),
            logs_dir: root.join("logs"),
        }
    }

    /// Per-repository state with an installation-wide node identity.
    pub fn for_working_dir(working_dir: &Path) -> Result<Self> {
        let home = wp_sync_home_dir()?;
        let state = home.join("state").join(working_dir_hash(working_dir));
        fs::create_dir_all(&state)
            .with_context(|| format!("Failed to create state directory: {}", state.display()))?;

        Ok(Self {
            node_id: home.join("node_id"),
            ..Self::under(&state)
        })
    }

    pub fn audit_log(&self) -> PathBuf {
        self.logs_dir.join("audit.jsonl")
    }
}

/// Computes a working directory hash (SHA256 truncated to 12 hex characters).
///
/// Attempts to canonicalize the path first for consistency across symlinks.
/// Falls back to hashing the raw path bytes if canonicalization fails.
pub fn working_dir_hash(path: &Path) -> String {
    let bytes = match fs::canonicalize(path) {
        Ok(canonical) => canonical.to_string_lossy().into_owned().into_bytes(),
        Err(_) => path.to_string_lossy().into_owned().into_bytes(),
    };
    short_hash(&bytes)
}

/// First 6 bytes of the SHA256 of `bytes`, hex encoded.
pub fn short_hash(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    hex_encode(&digest[..6])
}

/// Encodes bytes as lowercase hex string.
pub fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Writes `content` to `path` via temp file + rename.
pub fn write_atomic(path: &Path, content: &[u8]) -> Result<(), CoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);

    let mut file = fs::File::create(&tmp_path)?;
    file.write_all(content)?;
    file.sync_all()?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::tempdir;

    #[test]
    fn test_working_dir_hash_consistency() {
        let dir = tempdir().unwrap();
        let hash1 = working_dir_hash(dir.path());
        let hash2 = working_dir_hash(dir.path());
        assert_eq!(hash1, hash2, "Hash should be consistent across calls");
        assert_eq!(hash1.len(), 12, "Hash should be 12 hex characters");
    }

    #[test]
    fn test_working_dir_hash_different_paths() {
        let dir1 = tempdir().unwrap();
        let dir2 = tempdir().unwrap();
        assert_ne!(working_dir_hash(dir1.path()), working_dir_hash(dir2.path()));
    }

    #[test]
    fn test_hex_encode() {
        assert_eq!(hex_encode(&[0x00, 0xff, 0x10]), "00ff10");
    }

    #[test]
    fn test_state_paths_under_root() {
        let paths = StatePaths::under(Path::new("/tmp/wp"));
        assert_eq!(paths.events_dir, PathBuf::from("/tmp/wp/events"));
        assert_eq!(paths.audit_log(), PathBuf::from("/tmp/wp/logs/audit.jsonl"));
    }

    #[test]
    #[serial]
    fn test_home_override_and_repo_state() {
        let home = tempdir().unwrap();
        let repo = tempdir().unwrap();
        std::env::set_var(HOME_ENV, home.path());

        let paths = StatePaths::for_working_dir(repo.path()).unwrap();
        assert_eq!(paths.node_id, home.path().join("node_id"));
        assert!(paths.clock.starts_with(home.path().join("state")));
        assert!(paths.clock.parent().unwrap().is_dir());

        std::env::remove_var(HOME_ENV);
    }

    #[test]
    fn test_write_atomic_replaces_content() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("file.json");
        write_atomic(&path, b"one").unwrap();
        write_atomic(&path, b"two").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "two");
        assert!(!dir.path().join("nested").join("file.json.tmp").exists());
    }
}
