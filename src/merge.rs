//! Merge engine: combines local and remote event streams deterministically.
//!
//! Given the same set of events, every node computes the same sequence, no
//! matter in which order or in how many batches the events arrived.

use crate::clock::LamportClock;
use crate::domain::errors::{Anomaly, CoreError};
use crate::domain::types::{AggregateRef, EventId, LamportTime};
use crate::envelope::Envelope;
use crate::event_store::FileEventLog;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

/// A causation reference that does not hold in the merged order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CausationIssue {
    /// The cause is not in the log (orphaned causation).
    Missing {
        event_id: EventId,
        causation_id: EventId,
    },
    /// The cause sorted later and the event was moved after it.
    Reordered {
        event_id: EventId,
        causation_id: EventId,
    },
}

impl CausationIssue {
    pub fn event_id(&self) -> EventId {
        match self {
            Self::Missing { event_id, .. } | Self::Reordered { event_id, .. } => *event_id,
        }
    }

    /// Only missing causes are surfaced as anomalies.
    pub fn to_anomaly(&self) -> Option<Anomaly> {
        match self {
            Self::Missing {
                event_id,
                causation_id,
            } => Some(Anomaly::OrphanedCausation {
                event_id: *event_id,
                causation_id: *causation_id,
            }),
            Self::Reordered { .. } => None,
        }
    }
}

/// Canonical sequence for one aggregate.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergedSequence {
    pub events: Vec<Envelope>,
    /// Ids seen more than once across the inputs.
    pub duplicates: Vec<EventId>,
    pub issues: Vec<CausationIssue>,
}

impl MergedSequence {
    /// Events flagged orphaned-causation.
    pub fn orphaned(&self) -> Vec<EventId> {
        self.issues
            .iter()
            .filter(|issue| matches!(issue, CausationIssue::Missing { .. }))
            .map(CausationIssue::event_id)
            .collect()
    }

    pub fn event_ids(&self) -> Vec<EventId> {
        self.events.iter().map(|e| e.event_id).collect()
    }
}

/// Deduplicates, orders and causation-checks the union of two streams.
pub fn canonical_sequence(local: &[Envelope], incoming: &[Envelope]) -> MergedSequence {
    let mut by_id: HashMap<EventId, (Envelope, String)> = HashMap::new();
    let mut duplicates: Vec<EventId> = Vec::new();

    for envelope in local.iter().chain(incoming) {
        let canonical = canonical_json(envelope);
        match by_id.get_mut(&envelope.event_id) {
            Some(existing) => {
                duplicates.push(envelope.event_id);
                // Competing copies: keep the smaller encoding so the pick is order independent.
                if canonical < existing.1 {
                    *existing = (envelope.clone(), canonical);
                }
            }
            None => {
                by_id.insert(envelope.event_id, (envelope.clone(), canonical));
            }
        }
    }
    duplicates.sort();
    duplicates.dedup();

    let mut sorted: Vec<Envelope> = by_id.into_values().map(|(e, _)| e).collect();
    sorted.sort_by(|a, b| a.order_key().cmp(&b.order_key()));

    let (events, issues) = causation_pass(sorted);
    MergedSequence {
        events,
        duplicates,
        issues,
    }
}

/// Moves every event whose cause sorts later to directly after that cause.
///
/// Missing causes leave the event in place. Events caught in a causation
/// cycle are emitted in total order at the end and reported missing.
fn causation_pass(sorted: Vec<Envelope>) -> (Vec<Envelope>, Vec<CausationIssue>) {
    let present: HashSet<EventId> = sorted.iter().map(|e| e.event_id).collect();
    let mut emitted: HashSet<EventId> = HashSet::with_capacity(sorted.len());
    let mut deferred: HashMap<EventId, Vec<Envelope>> = HashMap::new();
    let mut out: Vec<Envelope> = Vec::with_capacity(sorted.len());
    let mut issues: Vec<CausationIssue> = Vec::new();
    let mut moved: HashSet<EventId> = HashSet::new();

    for envelope in sorted {
        match envelope.causation_id {
            Some(cause) if !present.contains(&cause) => {
                issues.push(CausationIssue::Missing {
                    event_id: envelope.event_id,
                    causation_id: cause,
                });
            }
            Some(cause) if !emitted.contains(&cause) => {
                moved.insert(envelope.event_id);
                deferred.entry(cause).or_default().push(envelope);
                continue;
            }
            _ => {}
        }
        emit_with_dependents(envelope, &mut out, &mut emitted, &mut deferred);
    }

    // Whatever is still deferred waits on a cycle.
    let mut stuck: Vec<Envelope> = deferred.into_values().flatten().collect();
    stuck.sort_by(|a, b| a.order_key().cmp(&b.order_key()));
    let stuck_ids: HashSet<EventId> = stuck.iter().map(|e| e.event_id).collect();
    for envelope in stuck {
        if let Some(cause) = envelope.causation_id {
            issues.push(CausationIssue::Missing {
                event_id: envelope.event_id,
                causation_id: cause,
            });
        }
        out.push(envelope);
    }

    for envelope in &out {
        if moved.contains(&envelope.event_id) && !stuck_ids.contains(&envelope.event_id) {
            if let Some(cause) = envelope.causation_id {
                issues.push(CausationIssue::Reordered {
                    event_id: envelope.event_id,
                    causation_id: cause,
                });
            }
        }
    }

    (out, issues)
}

fn emit_with_dependents(
    envelope: Envelope,
    out: &mut Vec<Envelope>,
    emitted: &mut HashSet<EventId>,
    deferred: &mut HashMap<EventId, Vec<Envelope>>,
) {
    let mut stack = vec![envelope];
    while let Some(next) = stack.pop() {
        let id = next.event_id;
        emitted.insert(id);
        out.push(next);
        if let Some(mut waiting) = deferred.remove(&id) {
            // Dependents follow their cause in total order.
            waiting.reverse();
            stack.extend(waiting);
        }
    }
}

fn canonical_json(envelope: &Envelope) -> String {
    // Serialization of a well-formed envelope cannot fail; fall back to the id.
    serde_json::to_string(envelope).unwrap_or_else(|_| envelope.event_id.to_string())
}

/// Outcome of ingesting a remote batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeReport {
    pub appended: Vec<EventId>,
    pub duplicates: Vec<EventId>,
    pub aggregates: Vec<AggregateRef>,
    pub issues: BTreeMap<AggregateRef, Vec<CausationIssue>>,
    pub max_clock: Option<LamportTime>,
}

impl MergeReport {
    pub fn anomalies(&self) -> Vec<Anomaly> {
        let duplicates = self
            .duplicates
            .iter()
            .map(|id| Anomaly::DuplicateEvent { event_id: *id });
        let orphans = self
            .issues
            .values()
            .flatten()
            .filter_map(CausationIssue::to_anomaly);
        duplicates.chain(orphans).collect()
    }
}

/// Applies remote batches to the local log.
#[derive(Debug, Clone)]
pub struct MergeEngine {
    log: Arc<FileEventLog>,
    clock: Arc<LamportClock>,
}

impl MergeEngine {
    pub fn new(log: Arc<FileEventLog>, clock: Arc<LamportClock>) -> Self {
        Self { log, clock }
    }

    /// Canonical sequence of one aggregate as currently stored.
    pub fn merged(&self, aggregate: &AggregateRef) -> Result<MergedSequence, CoreError> {
        let local = self.log.read_append_order(aggregate)?;
        let mut merged = canonical_sequence(&local, &[]);
        self.settle_foreign_causes(&mut merged, &HashSet::new())?;
        Ok(merged)
    }

    /// Drops `Missing` issues whose cause lives under another aggregate,
    /// either in the log or in `arriving`.
    fn settle_foreign_causes(
        &self,
        merged: &mut MergedSequence,
        arriving: &HashSet<EventId>,
    ) -> Result<(), CoreError> {
        let own: HashSet<EventId> = merged.events.iter().map(|e| e.event_id).collect();
        let unresolved: HashSet<EventId> = merged
            .issues
            .iter()
            .filter_map(|issue| match issue {
                CausationIssue::Missing { causation_id, .. }
                    if !own.contains(causation_id) && !arriving.contains(causation_id) =>
                {
                    Some(*causation_id)
                }
                _ => None,
            })
            .collect();
        let stored = self.log.find_ids(&unresolved)?;

        // Causes inside the aggregate only stay missing when caught in a cycle.
        merged.issues.retain(|issue| match issue {
            CausationIssue::Missing { causation_id, .. } => {
                own.contains(causation_id)
                    || !(arriving.contains(causation_id) || stored.contains(causation_id))
            }
            CausationIssue::Reordered { .. } => true,
        });
        Ok(())
    }

    /// Validates, deduplicates and atomically appends a remote batch.
    ///
    /// A single invalid envelope rejects the whole batch. The clock observes
    /// the highest incoming value only once the batch is durable.
    pub fn ingest(&self, batch: Vec<Envelope>) -> Result<MergeReport, CoreError> {
        for envelope in &batch {
            envelope.validate()?;
        }

        let arriving: HashSet<EventId> = batch.iter().map(|e| e.event_id).collect();
        let mut grouped: BTreeMap<AggregateRef, Vec<Envelope>> = BTreeMap::new();
        let mut max_clock: Option<LamportTime> = None;
        for envelope in batch {
            max_clock = max_clock.max(Some(envelope.lamport_clock));
            grouped
                .entry(envelope.aggregate.clone())
                .or_default()
                .push(envelope);
        }

        let mut report = MergeReport {
            max_clock,
            ..MergeReport::default()
        };
        let mut fresh: Vec<Envelope> = Vec::new();

        for (aggregate, incoming) in grouped {
            let local = self.log.read_append_order(&aggregate)?;
            let local_ids: HashSet<EventId> = local.iter().map(|e| e.event_id).collect();
            let mut merged = canonical_sequence(&local, &incoming);
            self.settle_foreign_causes(&mut merged, &arriving)?;

            report.duplicates.extend(merged.duplicates.iter().copied());
            let incoming_ids: HashSet<EventId> = incoming.iter().map(|e| e.event_id).collect();
            // The stored copy wins for ids already held locally.
            fresh.extend(merged.events.into_iter().filter(|e| {
                incoming_ids.contains(&e.event_id) && !local_ids.contains(&e.event_id)
            }));

            if !merged.issues.is_empty() {
                report.issues.insert(aggregate.clone(), merged.issues);
            }
            report.aggregates.push(aggregate);
        }

        let outcome = self.log.append_batch(&fresh)?;
        report.appended = outcome.appended;
        report.duplicates.extend(outcome.duplicates);
        report.duplicates.sort();
        report.duplicates.dedup();

        if let Some(seen) = report.max_clock {
            self.clock.observe(seen);
        }

        tracing::info!(
            appended = report.appended.len(),
            duplicates = report.duplicates.len(),
            aggregates = report.aggregates.len(),
            "merged remote batch"
        );
        for anomaly in report.anomalies() {
            tracing::warn!(%anomaly, "merge anomaly");
        }

        Ok(report)
    }
}

#[cfg(test)]
#[path = "tests/merge_tests.rs"]
mod tests;
