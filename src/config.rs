//! YAML configuration for the sync engine.
//!
//! Precedence: embedded defaults (`sync.yaml`), then the user file, then
//! environment overrides.

use crate::domain::types::{ProjectId, TeamSlug};
use crate::sync::{ProjectIdentity, RetryPolicy, SyncSettings};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

const DEFAULT_SYNC_YAML: &str = include_str!("../sync.yaml");

pub const REMOTE_ENV: &str = "WP_SYNC_REMOTE";
pub const PROJECT_UUID_ENV: &str = "WP_SYNC_PROJECT_UUID";
pub const TEAM_ENV: &str = "WP_SYNC_TEAM";
pub const REPO_SLUG_ENV: &str = "WP_SYNC_REPO_SLUG";

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncConfig {
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub project: ProjectConfig,
    #[serde(default)]
    pub enrichment: EnrichmentConfig,
    #[serde(default)]
    pub audit: AuditConfig,
}

/// Where and how to reach the remote authority.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RemoteConfig {
    /// `host:port`; `None` keeps every event queued locally.
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Quiet period that ends a cycle's wait for pushed events.
    #[serde(default = "default_inbound_idle_ms")]
    pub inbound_idle_ms: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            address: None,
            connect_timeout_ms: default_connect_timeout_ms(),
            ack_timeout_ms: default_ack_timeout_ms(),
            batch_size: default_batch_size(),
            interval_ms: default_interval_ms(),
            inbound_idle_ms: default_inbound_idle_ms(),
        }
    }
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_ack_timeout_ms() -> u64 {
    10_000
}

fn default_batch_size() -> usize {
    100
}

fn default_interval_ms() -> u64 {
    30_000
}

fn default_inbound_idle_ms() -> u64 {
    250
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    #[serde(default = "default_base_ms")]
    pub base_ms: u64,
    #[serde(default = "default_max_ms")]
    pub max_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_ms: default_base_ms(),
            max_ms: default_max_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

fn default_base_ms() -> u64 {
    500
}

fn default_max_ms() -> u64 {
    30_000
}

fn default_max_attempts() -> u32 {
    5
}

/// Project identity assigned by the remote authority.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProjectConfig {
    #[serde(default)]
    pub uuid: Option<ProjectId>,
    #[serde(default)]
    pub slug: Option<String>,
    #[serde(default)]
    pub team: Option<TeamSlug>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnrichmentConfig {
    #[serde(default = "default_git_cache_ttl_ms")]
    pub git_cache_ttl_ms: u64,
    #[serde(default)]
    pub repo_slug: Option<String>,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            git_cache_ttl_ms: default_git_cache_ttl_ms(),
            repo_slug: None,
        }
    }
}

fn default_git_cache_ttl_ms() -> u64 {
    2_000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuditConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

fn default_true() -> bool {
    true
}

impl SyncConfig {
    /// Parses the embedded `sync.yaml`.
    pub fn default_config() -> Result<Self> {
        serde_yaml::from_str(DEFAULT_SYNC_YAML).context("Failed to parse embedded sync.yaml")
    }

    /// Loads and validates a config file. Environment overrides are not applied.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Self = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file as YAML: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads the effective configuration.
    ///
    /// An explicit `path` must exist. Otherwise the user file is used when
    /// present, falling back to the embedded defaults.
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load(path)?,
            None => {
                let user_path = crate::paths::config_path()?;
                if user_path.exists() {
                    Self::load(&user_path)?
                } else {
                    Self::default_config()?
                }
            }
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Applies `WP_SYNC_*` environment overrides. Empty values clear the field.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(address) = env_override(REMOTE_ENV) {
            self.remote.address = address;
        }
        if let Some(uuid) = env_override(PROJECT_UUID_ENV) {
            self.project.uuid = uuid
                .map(|raw| raw.parse::<ProjectId>())
                .transpose()
                .with_context(|| format!("{} is not a valid UUID", PROJECT_UUID_ENV))?;
        }
        if let Some(team) = env_override(TEAM_ENV) {
            self.project.team = team.map(TeamSlug);
        }
        if let Some(slug) = env_override(REPO_SLUG_ENV) {
            self.enrichment.repo_slug = slug;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.remote.batch_size == 0 {
            anyhow::bail!("remote.batch_size must be at least 1");
        }
        if self.retry.max_attempts == 0 {
            anyhow::bail!("retry.max_attempts must be at least 1");
        }
        if self.retry.base_ms > self.retry.max_ms {
            anyhow::bail!(
                "retry.base_ms ({}) must not exceed retry.max_ms ({})",
                self.retry.base_ms,
                self.retry.max_ms
            );
        }
        if let Some(address) = &self.remote.address {
            if !address.contains(':') {
                anyhow::bail!("remote.address '{}' must be host:port", address);
            }
        }
        Ok(())
    }

    /// The project identity, once the remote has assigned a UUID.
    pub fn identity(&self) -> Option<ProjectIdentity> {
        Some(ProjectIdentity {
            project_uuid: self.project.uuid?,
            project_slug: self.project.slug.clone(),
            team_slug: self.project.team.clone(),
        })
    }

    pub fn sync_settings(&self) -> SyncSettings {
        SyncSettings {
            batch_size: self.remote.batch_size,
            ack_timeout: Duration::from_millis(self.remote.ack_timeout_ms),
            interval: Duration::from_millis(self.remote.interval_ms),
            inbound_idle: Duration::from_millis(self.remote.inbound_idle_ms),
            retry: RetryPolicy {
                base: Duration::from_millis(self.retry.base_ms),
                max_delay: Duration::from_millis(self.retry.max_ms),
                max_attempts: self.retry.max_attempts,
            },
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.remote.connect_timeout_ms)
    }

    pub fn git_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.enrichment.git_cache_ttl_ms)
    }
}

/// `None` when unset; `Some(None)` when set to an empty string.
fn env_override(name: &str) -> Option<Option<String>> {
    let value = std::env::var(name).ok()?;
    let trimmed = value.trim();
    Some((!trimmed.is_empty()).then(|| trimmed.to_string()))
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
