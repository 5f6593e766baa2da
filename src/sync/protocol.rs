//! Wire messages exchanged with the remote authority.
//!
//! Messages are newline-delimited JSON objects tagged by `type`.

use crate::domain::types::{EventId, NodeId, ProjectId, TeamSlug};
use crate::envelope::Envelope;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use ulid::Ulid;

/// Current protocol version.
pub const PROTOCOL_VERSION: u32 = 1;

/// Messages from the sync client to the remote authority.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientToRemote {
    /// Initial handshake.
    Hello {
        node_id: NodeId,
        team_slug: Option<TeamSlug>,
        project_uuid: ProjectId,
        protocol_version: u32,
        /// Machine label shown in remote dashboards.
        #[serde(default)]
        hostname: Option<String>,
    },
    /// A slice of the send queue.
    Batch {
        batch_id: String,
        /// Causes referenced by events in this batch.
        causation_ids: Vec<EventId>,
        events: Vec<Envelope>,
    },
    Heartbeat,
}

impl ClientToRemote {
    /// Builds a batch with a fresh id and the sorted set of referenced causes.
    pub fn batch(events: Vec<Envelope>) -> Self {
        let causation_ids: BTreeSet<EventId> =
            events.iter().filter_map(|e| e.causation_id).collect();
        Self::Batch {
            batch_id: Ulid::new().to_string(),
            causation_ids: causation_ids.into_iter().collect(),
            events,
        }
    }

    pub fn batch_id(&self) -> Option<&str> {
        match self {
            Self::Batch { batch_id, .. } => Some(batch_id),
            _ => None,
        }
    }
}

/// An event the remote refused, with its reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub event_id: EventId,
    pub error: String,
}

/// Messages from the remote authority to the sync client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RemoteToClient {
    /// Handshake response.
    Welcome {
        protocol_version: u32,
        server_version: String,
    },
    /// Outcome of one batch.
    Ack {
        batch_id: String,
        accepted: Vec<EventId>,
        #[serde(default)]
        rejected: Vec<Rejection>,
    },
    /// Events from other nodes. Kept raw so one bad envelope can be reported
    /// without losing the rest of the message.
    Events { events: Vec<Value> },
    /// Structured failure for the whole request.
    Error { code: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::lane::Lane;
    use crate::test_support::{caused_by, node, status_envelope};

    #[test]
    fn test_batch_collects_sorted_unique_causes() {
        let cause = status_envelope("WP01", Lane::Planned, Lane::Claimed, node(1), 1);
        let first = caused_by(
            status_envelope("WP01", Lane::Claimed, Lane::Doing, node(1), 2),
            &cause,
        );
        let second = caused_by(
            status_envelope("WP02", Lane::Planned, Lane::Claimed, node(1), 3),
            &cause,
        );

        let ClientToRemote::Batch {
            batch_id,
            causation_ids,
            events,
        } = ClientToRemote::batch(vec![cause.clone(), first, second])
        else {
            panic!("Expected Batch");
        };
        assert!(batch_id.parse::<Ulid>().is_ok());
        assert_eq!(causation_ids, vec![cause.event_id]);
        assert_eq!(events.len(), 3);
    }

    #[test]
    fn test_messages_are_tagged_by_type() {
        let json = serde_json::to_value(ClientToRemote::Heartbeat).unwrap();
        assert_eq!(json, serde_json::json!({"type": "heartbeat"}));

        let hello = ClientToRemote::Hello {
            node_id: node(3),
            team_slug: None,
            project_uuid: ProjectId(uuid::Uuid::nil()),
            protocol_version: PROTOCOL_VERSION,
            hostname: Some("build-01".to_string()),
        };
        let json = serde_json::to_value(&hello).unwrap();
        assert_eq!(json["type"], "hello");
        assert_eq!(json["node_id"], "0000000000000003");
        assert!(json["team_slug"].is_null());
    }

    #[test]
    fn test_ack_without_rejections_parses() {
        let id = EventId::new();
        let line = format!(
            r#"{{"type":"ack","batch_id":"b1","accepted":["{}"]}}"#,
            id
        );
        let parsed: RemoteToClient = serde_json::from_str(&line).unwrap();
        assert_eq!(
            parsed,
            RemoteToClient::Ack {
                batch_id: "b1".to_string(),
                accepted: vec![id],
                rejected: Vec::new(),
            }
        );
    }

    #[test]
    fn test_batch_events_use_the_envelope_wire_form() {
        let event = status_envelope("WP01", Lane::Planned, Lane::Claimed, node(1), 1);
        let json = serde_json::to_value(ClientToRemote::batch(vec![event.clone()])).unwrap();
        assert_eq!(json["events"][0]["event_type"], "WPStatusChanged");
        assert_eq!(json["events"][0]["lamport_clock"], 1);

        let back = Envelope::from_wire_value(json["events"][0].clone()).unwrap();
        assert_eq!(back, event);
    }
}
