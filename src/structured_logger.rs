//! Per-node JSONL audit trail of appends, merges, anomalies and sync
//! transitions.
//!
//! Every line carries the emitting node, a ULID run id minted per process and
//! a sequence number that restarts with each run, so entries from several
//! processes sharing one file can still be ordered within their run.

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use ulid::Ulid;

use crate::domain::errors::Anomaly;
use crate::domain::types::{AggregateRef, EventId, NodeId};
use crate::envelope::Envelope;
use crate::merge::MergeReport;
use crate::sync::SyncState;

/// Structured JSONL audit logger.
pub struct StructuredLogger {
    node_id: String,
    run_id: String,
    seq: AtomicU64,
    log_file: Option<Mutex<File>>,
    log_path: PathBuf,
}

/// One line of the audit file.
#[derive(Debug, Serialize, serde::Deserialize)]
pub struct LogEntry {
    /// Monotonic sequence number (unique within a run)
    pub seq: u64,
    /// ISO 8601 timestamp with microseconds
    pub ts: String,
    /// Emitting node
    pub node_id: String,
    /// Run ID (fresh per process)
    pub run_id: String,
    /// Component that emitted the log
    pub component: String,
    /// Structured event data
    pub event: Value,
}

impl StructuredLogger {
    /// Opens `<logs_dir>/audit.jsonl` for appending, creating it if needed.
    pub fn new(node_id: &NodeId, logs_dir: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(logs_dir)?;
        let log_path = logs_dir.join("audit.jsonl");
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;

        Ok(Self {
            node_id: node_id.to_string(),
            run_id: Ulid::new().to_string(),
            seq: AtomicU64::new(0),
            log_file: Some(Mutex::new(file)),
            log_path,
        })
    }

    /// A logger that discards everything (audit disabled in config).
    pub fn disabled(node_id: &NodeId) -> Self {
        Self {
            node_id: node_id.to_string(),
            run_id: Ulid::new().to_string(),
            seq: AtomicU64::new(0),
            log_file: None,
            log_path: PathBuf::new(),
        }
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Logs a structured event.
    ///
    /// Write failures are swallowed: auditing never blocks local work.
    pub fn log(&self, component: &str, event: impl Serialize) {
        let Some(log_file) = &self.log_file else {
            return;
        };

        let entry = LogEntry {
            seq: self.next_seq(),
            ts: Utc::now().format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string(),
            node_id: self.node_id.clone(),
            run_id: self.run_id.clone(),
            component: component.to_string(),
            event: serde_json::to_value(event).unwrap_or(Value::Null),
        };

        if let Ok(mut file) = log_file.lock() {
            if let Ok(line) = serde_json::to_string(&entry) {
                let _ = writeln!(file, "{}", line);
                let _ = file.flush();
            }
        }
    }

    /// Logs a fresh local append.
    pub fn log_appended(&self, envelope: &Envelope) {
        self.log(
            "Log",
            serde_json::json!({
                "type": "Appended",
                "event_id": envelope.event_id,
                "event_type": envelope.event_type(),
                "aggregate": envelope.aggregate.to_string(),
                "lamport_clock": envelope.lamport_clock,
            }),
        );
    }

    /// Logs an audit anomaly (duplicate, conflict, orphan, degraded sync).
    pub fn log_anomaly(&self, aggregate: Option<&AggregateRef>, anomaly: &Anomaly) {
        self.log(
            "Anomaly",
            serde_json::json!({
                "type": "Anomaly",
                "aggregate": aggregate.map(ToString::to_string),
                "anomaly": anomaly,
            }),
        );
    }

    /// Logs the outcome of a merged remote batch.
    pub fn log_merge(&self, report: &MergeReport) {
        self.log(
            "Merge",
            serde_json::json!({
                "type": "Merged",
                "appended": report.appended,
                "duplicates": report.duplicates.len(),
                "aggregates": report
                    .aggregates
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>(),
                "max_clock": report.max_clock,
            }),
        );
        for (aggregate, issues) in &report.issues {
            for anomaly in issues.iter().filter_map(|issue| issue.to_anomaly()) {
                self.log_anomaly(Some(aggregate), &anomaly);
            }
        }
    }

    /// Logs a sync state change.
    pub fn log_sync_transition(&self, from: SyncState, to: SyncState, pending: usize) {
        self.log(
            "Sync",
            serde_json::json!({
                "type": "StateChanged",
                "from": from,
                "to": to,
                "pending": pending,
            }),
        );
    }

    /// Logs events dropped from the queue after a structured remote rejection.
    pub fn log_rejected(&self, event_id: EventId, error: &str) {
        self.log(
            "Sync",
            serde_json::json!({
                "type": "Rejected",
                "event_id": event_id,
                "error": error,
            }),
        );
    }

    pub fn path(&self) -> &PathBuf {
        &self.log_path
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }
}

#[cfg(test)]
#[path = "tests/structured_logger_tests.rs"]
mod tests;
