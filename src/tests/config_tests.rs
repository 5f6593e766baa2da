use super::*;
use serial_test::serial;
use tempfile::tempdir;

struct EnvGuard {
    names: Vec<&'static str>,
}

impl EnvGuard {
    fn set(vars: &[(&'static str, &str)]) -> Self {
        for (name, value) in vars {
            std::env::set_var(name, value);
        }
        Self {
            names: vars.iter().map(|(name, _)| *name).collect(),
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for name in &self.names {
            std::env::remove_var(name);
        }
    }
}

#[test]
fn test_embedded_defaults_match_code_defaults() {
    let config = SyncConfig::default_config().unwrap();
    assert_eq!(config, SyncConfig::default());
    config.validate().unwrap();
    assert!(config.identity().is_none());

    let settings = config.sync_settings();
    assert_eq!(settings.retry, RetryPolicy::default());
    assert_eq!(settings.batch_size, 100);
    assert_eq!(settings.inbound_idle, Duration::from_millis(250));
    assert_eq!(config.git_cache_ttl(), Duration::from_secs(2));
}

#[test]
fn test_partial_file_fills_in_defaults() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("config.yaml");
    std::fs::write(
        &path,
        r#"
remote:
  address: "sync.example.com:7400"
project:
  uuid: "6a1f0c3e-2b7d-4f0a-9c61-2f3d9b8e4a10"
  team: core
"#,
    )
    .unwrap();

    let config = SyncConfig::load(&path).unwrap();
    assert_eq!(config.remote.address.as_deref(), Some("sync.example.com:7400"));
    assert_eq!(config.remote.batch_size, 100);
    assert_eq!(config.retry.max_attempts, 5);

    let identity = config.identity().unwrap();
    assert_eq!(
        identity.project_uuid.to_string(),
        "6a1f0c3e-2b7d-4f0a-9c61-2f3d9b8e4a10"
    );
    assert_eq!(identity.team_slug, Some(TeamSlug::from("core")));
    assert!(identity.project_slug.is_none());
}

#[test]
fn test_unknown_keys_are_rejected() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("config.yaml");
    std::fs::write(&path, "remote:\n  adress: \"x:1\"\n").unwrap();
    assert!(SyncConfig::load(&path).is_err());
}

#[test]
fn test_validate_rejects_bad_values() {
    let mut config = SyncConfig::default();
    config.remote.batch_size = 0;
    assert!(config.validate().is_err());

    let mut config = SyncConfig::default();
    config.retry.max_attempts = 0;
    assert!(config.validate().is_err());

    let mut config = SyncConfig::default();
    config.retry.base_ms = 60_000;
    let err = config.validate().unwrap_err().to_string();
    assert!(err.contains("retry.base_ms"));

    let mut config = SyncConfig::default();
    config.remote.address = Some("localhost".to_string());
    assert!(config.validate().is_err());
}

#[test]
#[serial]
fn test_env_overrides_take_precedence() {
    let _env = EnvGuard::set(&[
        (REMOTE_ENV, "127.0.0.1:9000"),
        (PROJECT_UUID_ENV, "00000000-0000-0000-0000-00000000002a"),
        (TEAM_ENV, "platform"),
        (REPO_SLUG_ENV, "acme/override"),
    ]);

    let mut config = SyncConfig::default();
    config.project.team = Some(TeamSlug::from("core"));
    config.apply_env_overrides().unwrap();

    assert_eq!(config.remote.address.as_deref(), Some("127.0.0.1:9000"));
    assert_eq!(config.project.uuid.unwrap().0.as_u128(), 42);
    assert_eq!(config.project.team, Some(TeamSlug::from("platform")));
    assert_eq!(config.enrichment.repo_slug.as_deref(), Some("acme/override"));
}

#[test]
#[serial]
fn test_empty_remote_override_disables_sync() {
    let _env = EnvGuard::set(&[(REMOTE_ENV, "")]);
    let mut config = SyncConfig::default();
    config.remote.address = Some("sync.example.com:7400".to_string());
    config.apply_env_overrides().unwrap();
    assert!(config.remote.address.is_none());
}

#[test]
#[serial]
fn test_invalid_project_uuid_override_fails() {
    let _env = EnvGuard::set(&[(PROJECT_UUID_ENV, "not-a-uuid")]);
    let mut config = SyncConfig::default();
    let err = config.apply_env_overrides().unwrap_err().to_string();
    assert!(err.contains(PROJECT_UUID_ENV));
}

#[test]
#[serial]
fn test_resolve_with_explicit_path() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("custom.yaml");
    std::fs::write(&path, "retry:\n  max_attempts: 2\n").unwrap();
    let _env = EnvGuard::set(&[(TEAM_ENV, "ops")]);

    let config = SyncConfig::resolve(Some(&path)).unwrap();
    assert_eq!(config.retry.max_attempts, 2);
    assert_eq!(config.project.team, Some(TeamSlug::from("ops")));

    assert!(SyncConfig::resolve(Some(&dir.path().join("missing.yaml"))).is_err());
}
