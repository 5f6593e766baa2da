//! Event payloads for work package and feature aggregates.
//!
//! Events represent facts that have happened. The payload is a tagged union
//! keyed by event type; every variant has a fixed schema that is checked when
//! the payload is constructed from untyped JSON.

use crate::domain::errors::CoreError;
use crate::domain::lane::Lane;
use crate::domain::types::AggregateType;
use cqrs_es::DomainEvent;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Names of every event type this build understands.
pub const EVENT_TYPES: [&str; 8] = [
    "WPCreated",
    "WPStatusChanged",
    "WPAssigned",
    "EvidenceAttached",
    "HistoryAdded",
    "DependencyResolved",
    "FeatureCreated",
    "FeatureCompleted",
];

/// Kind of evidence attached to a work package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceKind {
    TestRun,
    Review,
    Commit,
    Artifact,
}

/// How a dependency stopped blocking a work package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyResolution {
    Completed,
    Skipped,
    Merged,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WpCreated {
    pub wp_id: String,
    pub title: String,
    pub feature_slug: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WpStatusChanged {
    pub wp_id: String,
    pub previous_status: Lane,
    pub new_status: Lane,
    pub changed_by: String,
    #[serde(default)]
    pub reason: Option<String>,
    /// Apply even when the target is not reachable from the folded state.
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WpAssigned {
    pub wp_id: String,
    pub agent_id: String,
    pub phase: String,
    #[serde(default)]
    pub retry_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceAttached {
    pub wp_id: String,
    pub kind: EvidenceKind,
    pub reference: String,
    /// Repository the evidence lives in when it is not this one.
    #[serde(default)]
    pub repo: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryAdded {
    pub wp_id: String,
    pub entry_type: String,
    pub entry_content: String,
    pub author: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencyResolved {
    pub wp_id: String,
    pub dependency_wp_id: String,
    pub resolution: DependencyResolution,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureCreated {
    pub feature_slug: String,
    pub feature_number: u32,
    pub target_branch: String,
    pub wp_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureCompleted {
    pub feature_slug: String,
    pub total_wps: u32,
    #[serde(default)]
    pub summary: Option<String>,
}

/// Typed event payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", content = "payload")]
pub enum EventPayload {
    #[serde(rename = "WPCreated")]
    WpCreated(WpCreated),
    #[serde(rename = "WPStatusChanged")]
    WpStatusChanged(WpStatusChanged),
    #[serde(rename = "WPAssigned")]
    WpAssigned(WpAssigned),
    EvidenceAttached(EvidenceAttached),
    HistoryAdded(HistoryAdded),
    DependencyResolved(DependencyResolved),
    FeatureCreated(FeatureCreated),
    FeatureCompleted(FeatureCompleted),
}

impl EventPayload {
    /// Builds a payload from its wire parts, checking the per-type schema.
    pub fn from_parts(event_type: &str, payload: Value) -> Result<Self, CoreError> {
        if !is_known_event_type(event_type) {
            return Err(CoreError::schema(format!(
                "unknown event type '{}'",
                event_type
            )));
        }
        if !payload.is_object() {
            return Err(CoreError::schema(format!(
                "{} payload must be an object",
                event_type
            )));
        }

        let tagged = serde_json::json!({ "event_type": event_type, "payload": payload });
        serde_json::from_value(tagged)
            .map_err(|e| CoreError::schema(format!("invalid {} payload: {}", event_type, e)))
    }

    /// Splits the payload into its event type name and JSON body.
    pub fn to_parts(&self) -> (String, Value) {
        let body = match serde_json::to_value(self) {
            Ok(Value::Object(mut map)) => map.remove("payload").unwrap_or(Value::Null),
            _ => Value::Null,
        };
        (self.event_type(), body)
    }

    /// Aggregate kind this payload belongs to.
    pub fn aggregate_type(&self) -> AggregateType {
        match self {
            Self::FeatureCreated(_) | Self::FeatureCompleted(_) => AggregateType::Feature,
            _ => AggregateType::WorkPackage,
        }
    }

    /// Identifier of the aggregate named inside the payload.
    pub fn subject_id(&self) -> &str {
        match self {
            Self::WpCreated(p) => &p.wp_id,
            Self::WpStatusChanged(p) => &p.wp_id,
            Self::WpAssigned(p) => &p.wp_id,
            Self::EvidenceAttached(p) => &p.wp_id,
            Self::HistoryAdded(p) => &p.wp_id,
            Self::DependencyResolved(p) => &p.wp_id,
            Self::FeatureCreated(p) => &p.feature_slug,
            Self::FeatureCompleted(p) => &p.feature_slug,
        }
    }
}

impl DomainEvent for EventPayload {
    fn event_type(&self) -> String {
        match self {
            Self::WpCreated(_) => "WPCreated".to_string(),
            Self::WpStatusChanged(_) => "WPStatusChanged".to_string(),
            Self::WpAssigned(_) => "WPAssigned".to_string(),
            Self::EvidenceAttached(_) => "EvidenceAttached".to_string(),
            Self::HistoryAdded(_) => "HistoryAdded".to_string(),
            Self::DependencyResolved(_) => "DependencyResolved".to_string(),
            Self::FeatureCreated(_) => "FeatureCreated".to_string(),
            Self::FeatureCompleted(_) => "FeatureCompleted".to_string(),
        }
    }

    fn event_version(&self) -> String {
        "1".to_string()
    }
}

pub fn is_known_event_type(event_type: &str) -> bool {
    EVENT_TYPES.contains(&event_type)
}
