//! Lifecycle reducer: folds an ordered event sequence into a status view.
//!
//! The fold is pure. It never touches storage, the clock or the logger, so
//! replaying a log from empty always yields the same view as applying it
//! incrementally from any intermediate snapshot.

use crate::domain::errors::Anomaly;
use crate::domain::events::{DependencyResolution, EventPayload, EvidenceKind, WpStatusChanged};
use crate::domain::lane::Lane;
use crate::domain::types::{AggregateRef, EventId, TimestampUtc};
use crate::envelope::Envelope;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

/// A status change that did not match the folded state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub event_id: EventId,
    pub expected_previous: Lane,
    pub actual_current: Lane,
    pub target: Lane,
    pub applied: bool,
    /// Applied only because the event carried `force`.
    #[serde(default)]
    pub forced: bool,
}

impl ConflictRecord {
    pub fn to_anomaly(&self) -> Anomaly {
        Anomaly::ConflictingTransition {
            event_id: self.event_id,
            expected_previous: self.expected_previous,
            actual_current: self.actual_current,
            target: self.target,
            applied: self.applied,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignee {
    pub agent_id: String,
    pub phase: String,
    pub retry_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceRecord {
    pub event_id: EventId,
    pub kind: EvidenceKind,
    pub reference: String,
    pub repo: Option<String>,
}

/// Metadata of a feature aggregate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureInfo {
    pub feature_number: u32,
    pub target_branch: String,
    pub wp_count: u32,
    pub total_wps: Option<u32>,
    pub summary: Option<String>,
}

/// Reducer output for one aggregate. Derived, never authoritative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaterializedStatus {
    pub aggregate: AggregateRef,
    pub lane: Lane,
    pub last_transition_at: Option<TimestampUtc>,
    /// Event that produced the current lane.
    pub last_event_id: Option<EventId>,
    pub transition_count: u32,
    pub event_count: u32,
    pub title: Option<String>,
    pub feature_slug: Option<String>,
    pub dependencies: Vec<String>,
    pub feature: Option<FeatureInfo>,
    pub assignee: Option<Assignee>,
    pub evidence: Vec<EvidenceRecord>,
    pub resolved_dependencies: BTreeMap<String, DependencyResolution>,
    pub history_entries: u32,
    pub conflicts: Vec<ConflictRecord>,
    /// Events skipped because this build cannot interpret them here.
    pub unreduced: u32,
    /// Events whose cause is not in the log. Filled in by the merge pass.
    pub orphaned_causation: Vec<EventId>,
}

impl MaterializedStatus {
    pub fn empty(aggregate: AggregateRef) -> Self {
        Self {
            aggregate,
            lane: Lane::default(),
            last_transition_at: None,
            last_event_id: None,
            transition_count: 0,
            event_count: 0,
            title: None,
            feature_slug: None,
            dependencies: Vec::new(),
            feature: None,
            assignee: None,
            evidence: Vec::new(),
            resolved_dependencies: BTreeMap::new(),
            history_entries: 0,
            conflicts: Vec::new(),
            unreduced: 0,
            orphaned_causation: Vec::new(),
        }
    }

    pub fn is_conflicting(&self) -> bool {
        !self.conflicts.is_empty()
    }

    /// Audit signals carried by this view.
    pub fn anomalies(&self) -> Vec<Anomaly> {
        self.conflicts.iter().map(ConflictRecord::to_anomaly).collect()
    }
}

/// Incremental fold over one aggregate's events.
#[derive(Debug, Clone)]
pub struct Reducer {
    status: MaterializedStatus,
}

impl Reducer {
    pub fn new(aggregate: AggregateRef) -> Self {
        Self {
            status: MaterializedStatus::empty(aggregate),
        }
    }

    /// Continues folding from a previously produced view.
    pub fn resume(status: MaterializedStatus) -> Self {
        Self { status }
    }

    pub fn apply(&mut self, envelope: &Envelope) {
        self.status.event_count += 1;

        let payload = match envelope.known_payload() {
            Some(payload)
                if envelope.aggregate == self.status.aggregate
                    && payload.aggregate_type() == self.status.aggregate.aggregate_type =>
            {
                payload
            }
            _ => {
                self.status.unreduced += 1;
                return;
            }
        };

        match payload {
            EventPayload::WpCreated(created) => {
                self.status.title = Some(created.title.clone());
                self.status.feature_slug = Some(created.feature_slug.clone());
                self.status.dependencies = created.dependencies.clone();
            }
            EventPayload::WpStatusChanged(change) => self.apply_status_change(envelope, change),
            EventPayload::WpAssigned(assigned) => {
                self.status.assignee = Some(Assignee {
                    agent_id: assigned.agent_id.clone(),
                    phase: assigned.phase.clone(),
                    retry_count: assigned.retry_count,
                });
            }
            EventPayload::EvidenceAttached(evidence) => {
                self.status.evidence.push(EvidenceRecord {
                    event_id: envelope.event_id,
                    kind: evidence.kind,
                    reference: evidence.reference.clone(),
                    repo: evidence.repo.clone(),
                });
            }
            EventPayload::HistoryAdded(_) => self.status.history_entries += 1,
            EventPayload::DependencyResolved(resolved) => {
                self.status
                    .resolved_dependencies
                    .insert(resolved.dependency_wp_id.clone(), resolved.resolution);
            }
            EventPayload::FeatureCreated(created) => {
                let feature = self.status.feature.get_or_insert_with(FeatureInfo::default);
                feature.feature_number = created.feature_number;
                feature.target_branch = created.target_branch.clone();
                feature.wp_count = created.wp_count;
                self.status.feature_slug = Some(created.feature_slug.clone());
            }
            EventPayload::FeatureCompleted(completed) => {
                let feature = self.status.feature.get_or_insert_with(FeatureInfo::default);
                feature.total_wps = Some(completed.total_wps);
                feature.summary = completed.summary.clone();

                let current = self.status.lane;
                if current.is_terminal() {
                    self.status.conflicts.push(ConflictRecord {
                        event_id: envelope.event_id,
                        expected_previous: current,
                        actual_current: current,
                        target: Lane::Done,
                        applied: false,
                        forced: false,
                    });
                } else {
                    self.transition(envelope, Lane::Done);
                }
            }
        }
    }

    /// Stale changes are applied when the target is still reachable; either
    /// way they are recorded as conflicts.
    fn apply_status_change(&mut self, envelope: &Envelope, change: &WpStatusChanged) {
        let current = self.status.lane;
        let stale = change.previous_status != current;
        let reachable = current.can_transition_to(change.new_status);
        let applied = reachable || change.force;

        if applied {
            self.transition(envelope, change.new_status);
        }
        if stale || !applied {
            self.status.conflicts.push(ConflictRecord {
                event_id: envelope.event_id,
                expected_previous: change.previous_status,
                actual_current: current,
                target: change.new_status,
                applied,
                forced: applied && !reachable,
            });
        }
    }

    fn transition(&mut self, envelope: &Envelope, target: Lane) {
        self.status.lane = target;
        self.status.transition_count += 1;
        self.status.last_transition_at = Some(envelope.timestamp);
        self.status.last_event_id = Some(envelope.event_id);
    }

    pub fn status(&self) -> &MaterializedStatus {
        &self.status
    }

    pub fn finish(self) -> MaterializedStatus {
        self.status
    }
}

/// Folds `events` (already in merged order) from the empty state.
pub fn reduce(aggregate: &AggregateRef, events: &[Envelope]) -> MaterializedStatus {
    let mut reducer = Reducer::new(aggregate.clone());
    for envelope in events {
        reducer.apply(envelope);
    }
    reducer.finish()
}

/// Materialized views keyed by the log version they were computed from.
#[derive(Debug, Default)]
pub struct StatusCache {
    entries: Mutex<HashMap<AggregateRef, (u64, MaterializedStatus)>>,
}

impl StatusCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached view, if it was computed at exactly `version`.
    ///
    /// Views with orphaned causation are never served: their causes may be
    /// stored later under another aggregate without changing this version.
    pub fn get(&self, aggregate: &AggregateRef, version: u64) -> Option<MaterializedStatus> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .get(aggregate)
            .filter(|(cached, status)| *cached == version && status.orphaned_causation.is_empty())
            .map(|(_, status)| status.clone())
    }

    /// Last view computed for `aggregate`, at whatever version.
    pub fn previous(&self, aggregate: &AggregateRef) -> Option<MaterializedStatus> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.get(aggregate).map(|(_, status)| status.clone())
    }

    pub fn insert(&self, aggregate: AggregateRef, version: u64, status: MaterializedStatus) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(aggregate, (version, status));
    }
}

#[cfg(test)]
#[path = "tests/reducer_tests.rs"]
mod tests;
