//! Event envelope: the canonical, versioned record of one state change.
//!
//! Envelopes serialize to a flat, self-describing JSON object. Enrichment
//! fields (git branch, commit, repo slug) are additive: from schema version 2
//! they are always written, `null` marking an unresolved value, and their
//! absence never invalidates an envelope.

use crate::clock::LamportClock;
use crate::domain::errors::CoreError;
use crate::domain::events::{is_known_event_type, EventPayload};
use crate::domain::types::{
    AggregateId, AggregateRef, AggregateType, EventId, LamportTime, NodeId, OrderKey, ProjectId,
    TeamSlug, TimestampUtc,
};
use cqrs_es::DomainEvent;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// Schema version written by this build.
pub const SCHEMA_VERSION: u32 = 2;

/// First schema version that always carries enrichment fields.
const ENRICHMENT_SCHEMA_VERSION: u32 = 2;

/// Event body: a typed payload, or an opaque one written by a newer build.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Known(EventPayload),
    Unrecognized { event_type: String, body: Value },
}

/// Git context attached by enrichment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitMetadata {
    pub git_branch: Option<String>,
    pub head_commit_sha: Option<String>,
    pub repo_slug: Option<String>,
}

/// One immutable event record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WireEnvelope", into = "WireEnvelope")]
pub struct Envelope {
    pub event_id: EventId,
    pub aggregate: AggregateRef,
    pub payload: Payload,
    pub timestamp: TimestampUtc,
    pub node_id: NodeId,
    pub lamport_clock: LamportTime,
    pub causation_id: Option<EventId>,
    pub team_slug: Option<TeamSlug>,
    pub project_uuid: Option<ProjectId>,
    pub project_slug: Option<String>,
    pub git: GitMetadata,
    pub schema_version: u32,
}

impl Envelope {
    pub fn event_type(&self) -> String {
        match &self.payload {
            Payload::Known(payload) => payload.event_type(),
            Payload::Unrecognized { event_type, .. } => event_type.clone(),
        }
    }

    pub fn known_payload(&self) -> Option<&EventPayload> {
        match &self.payload {
            Payload::Known(payload) => Some(payload),
            Payload::Unrecognized { .. } => None,
        }
    }

    /// Key of the deterministic total order used by the log and merge.
    pub fn order_key(&self) -> OrderKey<'_> {
        OrderKey {
            clock: self.lamport_clock,
            node_id: &self.node_id,
            event_id: self.event_id,
        }
    }

    /// Only envelopes carrying a project identity are ever transmitted.
    pub fn is_transmittable(&self) -> bool {
        self.project_uuid.is_some()
    }

    /// Checks the envelope against the schema of its event type.
    ///
    /// Enrichment fields are not inspected.
    pub fn validate(&self) -> Result<(), CoreError> {
        let payload = match &self.payload {
            Payload::Known(payload) => payload,
            Payload::Unrecognized { event_type, .. } => {
                return Err(CoreError::schema(format!(
                    "unknown event type '{}' on {}",
                    event_type, self.event_id
                )))
            }
        };

        if payload.aggregate_type() != self.aggregate.aggregate_type {
            return Err(CoreError::schema(format!(
                "{} events belong to {} aggregates, not {}",
                payload.event_type(),
                payload.aggregate_type().as_str(),
                self.aggregate.aggregate_type.as_str()
            )));
        }

        if payload.subject_id() != self.aggregate.aggregate_id.as_str() {
            return Err(CoreError::schema(format!(
                "payload names '{}' but envelope targets {}",
                payload.subject_id(),
                self.aggregate
            )));
        }

        if self.aggregate.aggregate_id.as_str().trim().is_empty() {
            return Err(CoreError::schema("aggregate_id must not be empty"));
        }

        if self.causation_id == Some(self.event_id) {
            return Err(CoreError::schema(format!(
                "event {} cannot be its own cause",
                self.event_id
            )));
        }

        Ok(())
    }

    /// Serializes to one JSONL line.
    pub fn to_json_line(&self) -> Result<String, CoreError> {
        serde_json::to_string(self).map_err(|e| CoreError::storage(e.to_string()))
    }

    /// Parses an untrusted JSON value (e.g. from the remote) and validates it.
    pub fn from_wire_value(value: Value) -> Result<Self, CoreError> {
        let envelope: Envelope = serde_json::from_value(value)
            .map_err(|e| CoreError::schema(format!("malformed envelope: {}", e)))?;
        envelope.validate()?;
        Ok(envelope)
    }
}

/// Flat JSON shape of an envelope.
#[derive(Serialize, Deserialize)]
struct WireEnvelope {
    event_id: EventId,
    event_type: String,
    aggregate_type: AggregateType,
    aggregate_id: AggregateId,
    payload: Value,
    timestamp: TimestampUtc,
    node_id: NodeId,
    lamport_clock: LamportTime,
    #[serde(default)]
    causation_id: Option<EventId>,
    #[serde(default)]
    team_slug: Option<TeamSlug>,
    #[serde(default)]
    project_uuid: Option<ProjectId>,
    #[serde(default)]
    project_slug: Option<String>,
    // Outer None omits the field, Some(None) writes an explicit null.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    git_branch: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    head_commit_sha: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    repo_slug: Option<Option<String>>,
    #[serde(default = "legacy_schema_version")]
    schema_version: u32,
}

fn legacy_schema_version() -> u32 {
    1
}

impl TryFrom<WireEnvelope> for Envelope {
    type Error = CoreError;

    fn try_from(wire: WireEnvelope) -> Result<Self, Self::Error> {
        let payload = if is_known_event_type(&wire.event_type) {
            Payload::Known(EventPayload::from_parts(&wire.event_type, wire.payload)?)
        } else {
            Payload::Unrecognized {
                event_type: wire.event_type,
                body: wire.payload,
            }
        };

        Ok(Self {
            event_id: wire.event_id,
            aggregate: AggregateRef {
                aggregate_type: wire.aggregate_type,
                aggregate_id: wire.aggregate_id,
            },
            payload,
            timestamp: wire.timestamp,
            node_id: wire.node_id,
            lamport_clock: wire.lamport_clock,
            causation_id: wire.causation_id,
            team_slug: wire.team_slug,
            project_uuid: wire.project_uuid,
            project_slug: wire.project_slug,
            git: GitMetadata {
                git_branch: wire.git_branch.flatten(),
                head_commit_sha: wire.head_commit_sha.flatten(),
                repo_slug: wire.repo_slug.flatten(),
            },
            schema_version: wire.schema_version,
        })
    }
}

impl From<Envelope> for WireEnvelope {
    fn from(envelope: Envelope) -> Self {
        let (event_type, payload) = match envelope.payload {
            Payload::Known(payload) => payload.to_parts(),
            Payload::Unrecognized { event_type, body } => (event_type, body),
        };

        let explicit = envelope.schema_version >= ENRICHMENT_SCHEMA_VERSION;
        let enrichment = |value: Option<String>| {
            if explicit {
                Some(value)
            } else {
                value.map(Some)
            }
        };

        Self {
            event_id: envelope.event_id,
            event_type,
            aggregate_type: envelope.aggregate.aggregate_type,
            aggregate_id: envelope.aggregate.aggregate_id,
            payload,
            timestamp: envelope.timestamp,
            node_id: envelope.node_id,
            lamport_clock: envelope.lamport_clock,
            causation_id: envelope.causation_id,
            team_slug: envelope.team_slug,
            project_uuid: envelope.project_uuid,
            project_slug: envelope.project_slug,
            git_branch: enrichment(envelope.git.git_branch),
            head_commit_sha: enrichment(envelope.git.head_commit_sha),
            repo_slug: enrichment(envelope.git.repo_slug),
            schema_version: envelope.schema_version,
        }
    }
}

/// Builds envelopes for locally produced events.
#[derive(Debug, Clone)]
pub struct EnvelopeFactory {
    node_id: NodeId,
    clock: Arc<LamportClock>,
}

impl EnvelopeFactory {
    pub fn new(node_id: NodeId, clock: Arc<LamportClock>) -> Self {
        Self { node_id, clock }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Creates a fresh envelope, ticking the clock exactly once.
    ///
    /// Project, team and git fields are left to enrichment.
    pub fn build(
        &self,
        payload: EventPayload,
        aggregate: AggregateRef,
        causation_id: Option<EventId>,
    ) -> Result<Envelope, CoreError> {
        let mut envelope = Envelope {
            event_id: EventId::new(),
            aggregate,
            payload: Payload::Known(payload),
            timestamp: TimestampUtc::now(),
            node_id: self.node_id.clone(),
            lamport_clock: LamportTime::default(),
            causation_id,
            team_slug: None,
            project_uuid: None,
            project_slug: None,
            git: GitMetadata::default(),
            schema_version: SCHEMA_VERSION,
        };
        // Validate before ticking so rejected events do not consume clock values.
        envelope.validate()?;
        envelope.lamport_clock = self.clock.tick()?;
        Ok(envelope)
    }

    /// Like [`build`](Self::build), from an event type name and untyped payload.
    pub fn build_raw(
        &self,
        event_type: &str,
        aggregate: AggregateRef,
        payload: Value,
        causation_id: Option<EventId>,
    ) -> Result<Envelope, CoreError> {
        let payload = EventPayload::from_parts(event_type, payload)?;
        self.build(payload, aggregate, causation_id)
    }
}

#[cfg(test)]
#[path = "tests/envelope_tests.rs"]
mod tests;
