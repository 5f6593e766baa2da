//! Envelope builders shared by unit tests.

use crate::domain::events::{
    EventPayload, FeatureCreated, HistoryAdded, WpCreated, WpStatusChanged,
};
use crate::domain::lane::Lane;
use crate::domain::types::{AggregateRef, EventId, LamportTime, NodeId, TimestampUtc};
use crate::envelope::{Envelope, GitMetadata, Payload, SCHEMA_VERSION};

pub fn node(n: u64) -> NodeId {
    format!("{:016x}", n).parse().unwrap()
}

pub fn status_payload(wp: &str, from: Lane, to: Lane) -> EventPayload {
    EventPayload::WpStatusChanged(WpStatusChanged {
        wp_id: wp.to_string(),
        previous_status: from,
        new_status: to,
        changed_by: "tester".to_string(),
        reason: None,
        force: false,
    })
}

pub fn created_payload(wp: &str, title: &str) -> EventPayload {
    EventPayload::WpCreated(WpCreated {
        wp_id: wp.to_string(),
        title: title.to_string(),
        feature_slug: "010-auth".to_string(),
        dependencies: Vec::new(),
    })
}

pub fn feature_payload(slug: &str) -> EventPayload {
    EventPayload::FeatureCreated(FeatureCreated {
        feature_slug: slug.to_string(),
        feature_number: 10,
        target_branch: "main".to_string(),
        wp_count: 1,
    })
}

pub fn note_payload(wp: &str, content: &str) -> EventPayload {
    EventPayload::HistoryAdded(HistoryAdded {
        wp_id: wp.to_string(),
        entry_type: "note".to_string(),
        entry_content: content.to_string(),
        author: "tester".to_string(),
    })
}

/// Envelope for the aggregate named by `payload`, at a fixed node and clock.
pub fn envelope(payload: EventPayload, node_id: NodeId, clock: u64) -> Envelope {
    let aggregate = AggregateRef::new(payload.aggregate_type(), payload.subject_id());
    Envelope {
        event_id: EventId::new(),
        aggregate,
        payload: Payload::Known(payload),
        timestamp: TimestampUtc::now(),
        node_id,
        lamport_clock: LamportTime(clock),
        causation_id: None,
        team_slug: None,
        project_uuid: None,
        project_slug: None,
        git: GitMetadata::default(),
        schema_version: SCHEMA_VERSION,
    }
}

pub fn status_envelope(wp: &str, from: Lane, to: Lane, node_id: NodeId, clock: u64) -> Envelope {
    envelope(status_payload(wp, from, to), node_id, clock)
}

pub fn caused_by(mut envelope: Envelope, cause: &Envelope) -> Envelope {
    envelope.causation_id = Some(cause.event_id);
    envelope
}
