use super::*;
use crate::domain::lane::Lane;
use crate::test_support::{created_payload, envelope, node, note_payload, status_envelope};
use tempfile::tempdir;

fn open_log() -> (tempfile::TempDir, FileEventLog) {
    let dir = tempdir().expect("temp dir");
    let log = FileEventLog::open(dir.path().join("events")).unwrap();
    (dir, log)
}

#[test]
fn test_append_and_read_back() {
    let (_dir, log) = open_log();
    let event = status_envelope("WP01", Lane::Planned, Lane::Claimed, node(1), 1);

    assert_eq!(log.append(&event).unwrap(), AppendOutcome::Appended);

    let events = log.read(&AggregateRef::work_package("WP01")).unwrap();
    assert_eq!(events, vec![event]);
    assert!(log
        .path_for(&AggregateRef::work_package("WP01"))
        .ends_with("work_package/WP01.jsonl"));
}

#[test]
fn test_duplicate_append_is_noop() {
    let (_dir, log) = open_log();
    let aggregate = AggregateRef::work_package("WP01");
    let event = status_envelope("WP01", Lane::Planned, Lane::Claimed, node(1), 1);

    log.append(&event).unwrap();
    let version = log.version(&aggregate).unwrap();

    assert_eq!(log.append(&event).unwrap(), AppendOutcome::Duplicate);
    assert_eq!(log.version(&aggregate).unwrap(), version);
    assert_eq!(log.read(&aggregate).unwrap().len(), 1);
}

#[test]
fn test_invalid_envelope_never_reaches_disk() {
    let (_dir, log) = open_log();
    let mut event = status_envelope("WP01", Lane::Planned, Lane::Claimed, node(1), 1);
    event.aggregate = AggregateRef::work_package("WP02");

    let err = log.append(&event).unwrap_err();
    assert!(matches!(err, CoreError::SchemaViolation { .. }));
    assert_eq!(log.version(&AggregateRef::work_package("WP02")).unwrap(), 0);
    assert!(log.aggregates().unwrap().is_empty());
}

#[test]
fn test_read_sorts_by_total_order() {
    let (_dir, log) = open_log();
    let late = status_envelope("WP01", Lane::Claimed, Lane::Doing, node(1), 5);
    let tie_b = envelope(note_payload("WP01", "b"), node(2), 3);
    let tie_a = envelope(note_payload("WP01", "a"), node(1), 3);

    for event in [&late, &tie_b, &tie_a] {
        log.append(event).unwrap();
    }

    let aggregate = AggregateRef::work_package("WP01");
    let ordered: Vec<EventId> = log
        .read(&aggregate)
        .unwrap()
        .iter()
        .map(|e| e.event_id)
        .collect();
    assert_eq!(ordered, vec![tie_a.event_id, tie_b.event_id, late.event_id]);

    let appended: Vec<EventId> = log
        .read_append_order(&aggregate)
        .unwrap()
        .iter()
        .map(|e| e.event_id)
        .collect();
    assert_eq!(appended, vec![late.event_id, tie_b.event_id, tie_a.event_id]);
}

#[test]
fn test_batch_spans_aggregates_and_reports_duplicates() {
    let (_dir, log) = open_log();
    let existing = envelope(created_payload("WP01", "Login"), node(1), 1);
    log.append(&existing).unwrap();

    let fresh_wp1 = status_envelope("WP01", Lane::Planned, Lane::Claimed, node(2), 2);
    let fresh_wp2 = envelope(created_payload("WP02", "Logout"), node(2), 3);
    let outcome = log
        .append_batch(&[existing.clone(), fresh_wp1.clone(), fresh_wp2.clone(), fresh_wp2.clone()])
        .unwrap();

    assert_eq!(outcome.duplicates, vec![existing.event_id, fresh_wp2.event_id]);
    assert_eq!(outcome.appended.len(), 2);
    assert!(outcome.appended.contains(&fresh_wp1.event_id));
    assert!(outcome.appended.contains(&fresh_wp2.event_id));
    assert_eq!(
        log.aggregates().unwrap(),
        vec![
            AggregateRef::work_package("WP01"),
            AggregateRef::work_package("WP02")
        ]
    );
    assert_eq!(log.max_clock().unwrap(), LamportTime(3));
}

#[test]
fn test_batch_with_invalid_member_writes_nothing() {
    let (_dir, log) = open_log();
    let good = status_envelope("WP01", Lane::Planned, Lane::Claimed, node(1), 1);
    let mut bad = status_envelope("WP02", Lane::Planned, Lane::Claimed, node(1), 2);
    bad.aggregate = AggregateRef::feature("WP02");

    assert!(log.append_batch(&[good, bad]).is_err());
    assert!(log.aggregates().unwrap().is_empty());
}

#[test]
fn test_batch_failure_truncates_already_written_files() {
    let (_dir, log) = open_log();
    let before = status_envelope("WP01", Lane::Planned, Lane::Claimed, node(1), 1);
    log.append(&before).unwrap();
    let wp01 = AggregateRef::work_package("WP01");
    let version = log.version(&wp01).unwrap();

    // A directory where WP02's file belongs makes the second aggregate fail.
    let blocked = log.path_for(&AggregateRef::work_package("WP02"));
    fs::create_dir_all(&blocked).unwrap();

    let batch = [
        status_envelope("WP01", Lane::Claimed, Lane::Doing, node(1), 2),
        envelope(created_payload("WP02", "Blocked"), node(1), 3),
    ];
    let err = log.append_batch(&batch).unwrap_err();
    assert!(matches!(err, CoreError::StorageFailure { .. }));

    assert_eq!(log.version(&wp01).unwrap(), version);
    assert_eq!(log.read(&wp01).unwrap(), vec![before]);
}

#[test]
fn test_unsafe_aggregate_ids_use_hashed_file_names() {
    let (_dir, log) = open_log();
    let event = envelope(created_payload("../escape me", "Odd"), node(1), 1);
    log.append(&event).unwrap();

    let path = log.path_for(&event.aggregate);
    let name = path.file_name().unwrap().to_str().unwrap();
    assert!(name.starts_with(HASHED_PREFIX));
    assert!(path.starts_with(log.root()));
    assert_eq!(log.aggregates().unwrap(), vec![event.aggregate.clone()]);
}

#[test]
fn test_torn_final_line_is_skipped_then_repaired() {
    let (_dir, log) = open_log();
    let aggregate = AggregateRef::work_package("WP01");
    let first = status_envelope("WP01", Lane::Planned, Lane::Claimed, node(1), 1);
    log.append(&first).unwrap();

    let path = log.path_for(&aggregate);
    let mut file = OpenOptions::new().append(true).open(&path).unwrap();
    file.write_all(b"{\"event_id\":\"01HV5Z").unwrap();
    drop(file);

    assert_eq!(log.read(&aggregate).unwrap().len(), 1);

    let second = status_envelope("WP01", Lane::Claimed, Lane::Doing, node(1), 2);
    log.append(&second).unwrap();
    assert_eq!(log.read(&aggregate).unwrap(), vec![first, second]);
}

#[test]
fn test_corrupt_middle_line_is_a_storage_error() {
    let (_dir, log) = open_log();
    let aggregate = AggregateRef::work_package("WP01");
    let path = log.path_for(&aggregate);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(&path, "not json\n").unwrap();

    let err = log.read(&aggregate).unwrap_err();
    assert!(err.to_string().contains(":1:"));
}

#[test]
fn test_concurrent_appends_to_one_aggregate() {
    let (_dir, log) = open_log();
    let log = Arc::new(log);

    let handles: Vec<_> = (0..4u64)
        .map(|n| {
            let log = Arc::clone(&log);
            std::thread::spawn(move || {
                for i in 0..10u64 {
                    let event = envelope(note_payload("WP01", "x"), node(n + 1), i + 1);
                    log.append(&event).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let events = log.read(&AggregateRef::work_package("WP01")).unwrap();
    assert_eq!(events.len(), 40);
}
