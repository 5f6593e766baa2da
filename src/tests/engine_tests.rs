use super::*;
use crate::domain::lane::Lane;
use crate::domain::types::{ProjectId, TeamSlug};
use crate::test_support::{
    caused_by, created_payload, envelope, feature_payload, node, note_payload, status_envelope,
    status_payload,
};
use tempfile::TempDir;

struct StaticGit;

impl GitContext for StaticGit {
    fn resolve_branch(&self) -> Option<String> {
        Some("main".to_string())
    }

    fn resolve_commit(&self) -> Option<String> {
        Some("8d3c1f0a9b7e6d5c4b3a29180f7e6d5c4b3a2918".to_string())
    }

    fn resolve_repo_slug(&self) -> Option<String> {
        None
    }
}

fn config_with_identity() -> SyncConfig {
    let mut config = SyncConfig::default();
    config.project.uuid = Some(ProjectId(uuid::Uuid::from_u128(7)));
    config.project.team = Some(TeamSlug::from("core"));
    config
}

fn open(dir: &TempDir, config: &SyncConfig) -> StatusEngine {
    StatusEngine::open_with_git(StatePaths::under(dir.path()), config, Arc::new(StaticGit)).unwrap()
}

fn wp01() -> AggregateRef {
    AggregateRef::work_package("WP01")
}

#[test]
fn test_emit_appends_enriches_and_queues() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir, &config_with_identity());

    let outcome = engine
        .emit(created_payload("WP01", "Login form"), wp01(), None)
        .unwrap();
    let envelope = &outcome.envelope;
    assert_eq!(envelope.lamport_clock, LamportTime(1));
    assert_eq!(&envelope.node_id, engine.node_id());
    assert_eq!(envelope.git.git_branch.as_deref(), Some("main"));
    assert!(envelope.git.repo_slug.is_none());
    assert_eq!(envelope.project_uuid, Some(ProjectId(uuid::Uuid::from_u128(7))));
    assert_eq!(envelope.team_slug, Some(TeamSlug::from("core")));
    assert!(outcome.queued);
    assert_eq!(outcome.sync_state, SyncState::Queued);

    assert_eq!(engine.history(&wp01()).unwrap(), vec![envelope.clone()]);
    assert_eq!(engine.pending_events().unwrap(), vec![envelope.clone()]);
    assert_eq!(engine.aggregates().unwrap(), vec![wp01()]);
    assert_eq!(engine.sync_status().unwrap().pending, 1);
}

#[test]
fn test_lifecycle_is_materialized_offline() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir, &SyncConfig::default());

    engine
        .emit(created_payload("WP01", "Login form"), wp01(), None)
        .unwrap();
    let claim = engine
        .emit(status_payload("WP01", Lane::Planned, Lane::Claimed), wp01(), None)
        .unwrap();
    let start = engine
        .emit(
            status_payload("WP01", Lane::Claimed, Lane::Doing),
            wp01(),
            Some(claim.envelope.event_id),
        )
        .unwrap();

    let status = engine.materialized_status(&wp01()).unwrap();
    assert_eq!(status.lane, Lane::Doing);
    assert_eq!(status.title.as_deref(), Some("Login form"));
    assert_eq!(status.last_event_id, Some(start.envelope.event_id));
    assert_eq!(status.transition_count, 2);
    assert!(!status.is_conflicting());
    assert!(status.orphaned_causation.is_empty());

    // Without identity nothing is transmittable, but everything is queued.
    let sync = engine.sync_status().unwrap();
    assert_eq!(sync.state, SyncState::Queued);
    assert_eq!(sync.pending, 3);
}

#[test]
fn test_rejected_emission_leaves_no_trace() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir, &SyncConfig::default());

    let err = engine
        .emit_raw("WPArchived", wp01(), serde_json::json!({"wp_id": "WP01"}), None)
        .unwrap_err();
    assert!(matches!(err, CoreError::SchemaViolation { .. }));

    let err = engine
        .emit(
            status_payload("WP01", Lane::Planned, Lane::Claimed),
            AggregateRef::feature("010-auth"),
            None,
        )
        .unwrap_err();
    assert!(matches!(err, CoreError::SchemaViolation { .. }));

    assert_eq!(engine.clock(), LamportTime(0));
    assert!(engine.aggregates().unwrap().is_empty());
    assert!(engine.pending_events().unwrap().is_empty());
}

#[test]
fn test_emit_raw_accepts_wire_payloads() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir, &SyncConfig::default());

    let outcome = engine
        .emit_raw(
            "WPStatusChanged",
            wp01(),
            serde_json::json!({
                "wp_id": "WP01",
                "previous_status": "planned",
                "new_status": "claimed",
                "changed_by": "cli",
            }),
            None,
        )
        .unwrap();
    assert_eq!(outcome.envelope.event_type(), "WPStatusChanged");
    assert_eq!(engine.materialized_status(&wp01()).unwrap().lane, Lane::Claimed);
}

#[test]
fn test_status_cache_follows_the_log() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir, &SyncConfig::default());
    engine
        .emit(status_payload("WP01", Lane::Planned, Lane::Claimed), wp01(), None)
        .unwrap();

    let first = engine.materialized_status(&wp01()).unwrap();
    let again = engine.materialized_status(&wp01()).unwrap();
    assert_eq!(first, again);

    engine
        .emit(status_payload("WP01", Lane::Claimed, Lane::Doing), wp01(), None)
        .unwrap();
    assert_eq!(engine.materialized_status(&wp01()).unwrap().lane, Lane::Doing);

    // Remote events invalidate too.
    let remote = status_envelope("WP01", Lane::Doing, Lane::ForReview, node(0xf), 50);
    engine.ingest_remote(vec![remote]).unwrap();
    assert_eq!(
        engine.materialized_status(&wp01()).unwrap().lane,
        Lane::ForReview
    );
}

#[test]
fn test_concurrent_claims_merge_to_one_transition() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir, &SyncConfig::default());
    let local = engine
        .emit(status_payload("WP01", Lane::Planned, Lane::Doing), wp01(), None)
        .unwrap()
        .envelope;

    // Same clock value from an offline peer; node id breaks the tie.
    let peer = if local.node_id < node(u64::MAX) {
        node(u64::MAX)
    } else {
        node(0)
    };
    let remote = status_envelope("WP01", Lane::Planned, Lane::Doing, peer, 1);
    let report = engine.ingest_remote(vec![remote.clone()]).unwrap();
    assert_eq!(report.appended, vec![remote.event_id]);

    let status = engine.materialized_status(&wp01()).unwrap();
    assert_eq!(status.lane, Lane::Doing);
    assert_eq!(status.transition_count, 1);
    assert_eq!(status.conflicts.len(), 1);

    let later = if local.order_key() < remote.order_key() {
        remote.event_id
    } else {
        local.event_id
    };
    assert_eq!(status.conflicts[0].event_id, later);
}

#[test]
fn test_ingest_advances_the_local_clock() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir, &SyncConfig::default());
    let remote = status_envelope("WP02", Lane::Planned, Lane::Claimed, node(3), 40);
    engine.ingest_remote(vec![remote.clone()]).unwrap();

    let reply = engine
        .emit(
            status_payload("WP02", Lane::Claimed, Lane::Doing),
            AggregateRef::work_package("WP02"),
            Some(remote.event_id),
        )
        .unwrap();
    assert_eq!(reply.envelope.lamport_clock, LamportTime(41));
}

#[test]
fn test_orphaned_causation_is_reported_until_the_cause_arrives() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir, &SyncConfig::default());
    let cause = status_envelope("WP01", Lane::Planned, Lane::Claimed, node(3), 4);
    let effect = caused_by(
        status_envelope("WP01", Lane::Claimed, Lane::Doing, node(3), 5),
        &cause,
    );

    engine.ingest_remote(vec![effect.clone()]).unwrap();
    let status = engine.materialized_status(&wp01()).unwrap();
    assert_eq!(status.orphaned_causation, vec![effect.event_id]);

    engine.ingest_remote(vec![cause]).unwrap();
    let status = engine.materialized_status(&wp01()).unwrap();
    assert!(status.orphaned_causation.is_empty());
    assert_eq!(status.lane, Lane::Doing);
}

#[test]
fn test_state_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let config = SyncConfig::default();
    let node_id = {
        let engine = open(&dir, &config);
        for (from, to) in [(Lane::Planned, Lane::Claimed), (Lane::Claimed, Lane::Doing)] {
            engine.emit(status_payload("WP01", from, to), wp01(), None).unwrap();
        }
        engine.node_id().clone()
    };

    let engine = open(&dir, &config);
    assert_eq!(engine.node_id(), &node_id);
    assert_eq!(engine.clock(), LamportTime(2));
    let status = engine.sync_status().unwrap();
    assert_eq!(status.state, SyncState::Queued);
    assert_eq!(status.pending, 2);
    assert_eq!(engine.materialized_status(&wp01()).unwrap().lane, Lane::Doing);
}

#[test]
fn test_clock_recovers_from_the_log() {
    let dir = TempDir::new().unwrap();
    let config = SyncConfig::default();
    {
        let engine = open(&dir, &config);
        for _ in 0..3 {
            engine
                .emit(status_payload("WP01", Lane::Planned, Lane::Claimed), wp01(), None)
                .unwrap();
        }
    }
    std::fs::remove_file(StatePaths::under(dir.path()).clock).unwrap();

    let engine = open(&dir, &config);
    let next = engine
        .emit(status_payload("WP01", Lane::Planned, Lane::Claimed), wp01(), None)
        .unwrap();
    assert_eq!(next.envelope.lamport_clock, LamportTime(4));
}

#[test]
fn test_set_project_identity_applies_to_later_emissions() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir, &SyncConfig::default());
    let before = engine
        .emit(status_payload("WP01", Lane::Planned, Lane::Claimed), wp01(), None)
        .unwrap();
    assert!(before.envelope.project_uuid.is_none());

    engine.set_project_identity(ProjectIdentity {
        project_uuid: ProjectId(uuid::Uuid::from_u128(9)),
        project_slug: None,
        team_slug: None,
    });
    let after = engine
        .emit(status_payload("WP01", Lane::Claimed, Lane::Doing), wp01(), None)
        .unwrap();
    assert_eq!(
        after.envelope.project_uuid,
        Some(ProjectId(uuid::Uuid::from_u128(9)))
    );
}

#[test]
fn test_audit_can_be_disabled() {
    let dir = TempDir::new().unwrap();
    let mut config = SyncConfig::default();
    config.audit.enabled = false;
    let engine = open(&dir, &config);
    engine
        .emit(status_payload("WP01", Lane::Planned, Lane::Claimed), wp01(), None)
        .unwrap();
    assert!(!StatePaths::under(dir.path()).audit_log().exists());
}

#[test]
fn test_tcp_client_only_with_a_remote() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir, &SyncConfig::default());
    assert!(engine.tcp_sync_client().is_none());

    let dir = TempDir::new().unwrap();
    let mut config = SyncConfig::default();
    config.remote.address = Some("127.0.0.1:7400".to_string());
    let engine = open(&dir, &config);
    assert!(engine.tcp_sync_client().is_some());
}

#[test]
fn test_cause_under_another_aggregate_is_not_orphaned() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir, &SyncConfig::default());
    let feature = engine
        .emit(feature_payload("010-auth"), AggregateRef::feature("010-auth"), None)
        .unwrap();
    engine
        .emit(
            created_payload("WP01", "Login form"),
            wp01(),
            Some(feature.envelope.event_id),
        )
        .unwrap();

    let status = engine.materialized_status(&wp01()).unwrap();
    assert!(status.orphaned_causation.is_empty());
    assert_eq!(status.title.as_deref(), Some("Login form"));
}

#[test]
fn test_orphan_clears_when_the_cause_arrives_under_another_aggregate() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir, &SyncConfig::default());
    let remote_feature = envelope(feature_payload("010-auth"), node(3), 4);
    let local = engine
        .emit(
            created_payload("WP01", "Login form"),
            wp01(),
            Some(remote_feature.event_id),
        )
        .unwrap();

    let status = engine.materialized_status(&wp01()).unwrap();
    assert_eq!(status.orphaned_causation, vec![local.envelope.event_id]);

    // Only the feature log changes; the work package view must still refresh.
    engine.ingest_remote(vec![remote_feature]).unwrap();
    let status = engine.materialized_status(&wp01()).unwrap();
    assert!(status.orphaned_causation.is_empty());
}

#[test]
fn test_each_conflict_is_audited_once() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir, &SyncConfig::default());
    engine
        .emit(status_payload("WP01", Lane::Planned, Lane::Claimed), wp01(), None)
        .unwrap();
    // Stale: the log already says claimed.
    engine
        .emit(status_payload("WP01", Lane::Planned, Lane::Doing), wp01(), None)
        .unwrap();
    assert_eq!(engine.materialized_status(&wp01()).unwrap().conflicts.len(), 1);

    for note in ["first", "second", "third"] {
        engine.emit(note_payload("WP01", note), wp01(), None).unwrap();
        assert_eq!(engine.materialized_status(&wp01()).unwrap().conflicts.len(), 1);
    }

    let audit = std::fs::read_to_string(StatePaths::under(dir.path()).audit_log()).unwrap();
    let conflicts = audit
        .lines()
        .filter(|line| line.contains("\"conflicting_transition\""))
        .count();
    assert_eq!(conflicts, 1);
}
