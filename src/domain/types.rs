//! Strongly typed domain primitives for the status engine.
//!
//! These newtypes keep node identities, aggregate references, event ids and
//! clock values from being mixed up as they flow through the log, the merge
//! engine and the wire protocol.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::str::FromStr;
use ulid::Ulid;
use uuid::Uuid;

/// Width of a node identity in hex characters.
pub const NODE_ID_LEN: usize = 16;

/// Stable per-installation identifier (16 lowercase hex characters).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeId(String);

impl NodeId {
    /// Generates a fresh random node identity.
    pub fn generate() -> Self {
        Self(format!("{:016x}", rand::random::<u64>()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for NodeId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let valid = value.len() == NODE_ID_LEN
            && value
                .chars()
                .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c));
        if valid {
            Ok(Self(value))
        } else {
            Err(format!(
                "node id must be {} lowercase hex characters, got '{}'",
                NODE_ID_LEN, value
            ))
        }
    }
}

impl FromStr for NodeId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::try_from(s.trim().to_string())
    }
}

impl From<NodeId> for String {
    fn from(id: NodeId) -> Self {
        id.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lamport clock value. Only meaningful together with the emitting node.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct LamportTime(pub u64);

impl LamportTime {
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for LamportTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Globally unique, time-ordered event identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub Ulid);

impl EventId {
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl FromStr for EventId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(s).map(Self)
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of aggregate an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AggregateType {
    WorkPackage,
    Feature,
}

impl AggregateType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WorkPackage => "WorkPackage",
            Self::Feature => "Feature",
        }
    }

    /// Directory name used by the local log.
    pub fn dir_name(&self) -> &'static str {
        match self {
            Self::WorkPackage => "work_package",
            Self::Feature => "feature",
        }
    }
}

impl FromStr for AggregateType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "WorkPackage" | "work_package" | "wp" => Ok(Self::WorkPackage),
            "Feature" | "feature" => Ok(Self::Feature),
            other => Err(format!("unknown aggregate type '{}'", other)),
        }
    }
}

/// Identifier of an aggregate within its type, e.g. `WP01`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AggregateId(pub String);

impl AggregateId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for AggregateId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for AggregateId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Reference to one aggregate: `(aggregate_type, aggregate_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AggregateRef {
    pub aggregate_type: AggregateType,
    pub aggregate_id: AggregateId,
}

impl AggregateRef {
    pub fn new(aggregate_type: AggregateType, aggregate_id: impl Into<AggregateId>) -> Self {
        Self {
            aggregate_type,
            aggregate_id: aggregate_id.into(),
        }
    }

    pub fn work_package(id: &str) -> Self {
        Self::new(AggregateType::WorkPackage, id)
    }

    pub fn feature(slug: &str) -> Self {
        Self::new(AggregateType::Feature, slug)
    }
}

impl FromStr for AggregateRef {
    type Err = String;

    /// Parses `WorkPackage/WP01`; a bare id is taken as a work package.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((kind, id)) if !id.is_empty() => Ok(Self::new(kind.parse()?, id)),
            Some(_) => Err(format!("missing aggregate id in '{}'", s)),
            None if !s.is_empty() => Ok(Self::work_package(s)),
            None => Err("empty aggregate reference".to_string()),
        }
    }
}

impl std::fmt::Display for AggregateRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}",
            self.aggregate_type.as_str(),
            self.aggregate_id.as_str()
        )
    }
}

/// Project identity assigned by the remote authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectId(pub Uuid);

impl FromStr for ProjectId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

impl std::fmt::Display for ProjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Owning team / collaboration slug.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TeamSlug(pub String);

impl TeamSlug {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TeamSlug {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Wall-clock timestamp. Informational only; never used for ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TimestampUtc(pub DateTime<Utc>);

impl TimestampUtc {
    pub fn now() -> Self {
        Self(Utc::now())
    }
}

impl std::fmt::Display for TimestampUtc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

/// Deterministic total-order key: clock, then node, then event id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderKey<'a> {
    pub clock: LamportTime,
    pub node_id: &'a NodeId,
    pub event_id: EventId,
}

impl Ord for OrderKey<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.clock
            .cmp(&other.clock)
            .then_with(|| self.node_id.cmp(other.node_id))
            .then_with(|| self.event_id.cmp(&other.event_id))
    }
}

impl PartialOrd for OrderKey<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_validation() {
        assert!("0123456789abcdef".parse::<NodeId>().is_ok());
        assert!("0123456789ABCDEF".parse::<NodeId>().is_err());
        assert!("abc".parse::<NodeId>().is_err());
        assert_eq!(NodeId::generate().as_str().len(), NODE_ID_LEN);
    }

    #[test]
    fn test_aggregate_ref_parse_and_display() {
        let wp: AggregateRef = "WorkPackage/WP01".parse().unwrap();
        assert_eq!(wp, AggregateRef::work_package("WP01"));
        assert_eq!(wp.to_string(), "WorkPackage/WP01");

        let bare: AggregateRef = "WP02".parse().unwrap();
        assert_eq!(bare.aggregate_type, AggregateType::WorkPackage);

        let feature: AggregateRef = "feature/010-auth".parse().unwrap();
        assert_eq!(feature, AggregateRef::feature("010-auth"));

        assert!("Epic/E1".parse::<AggregateRef>().is_err());
        assert!("Feature/".parse::<AggregateRef>().is_err());
    }

    #[test]
    fn test_order_key_breaks_ties_by_node() {
        let a: NodeId = "000000000000000a".parse().unwrap();
        let b: NodeId = "000000000000000b".parse().unwrap();
        let id = EventId::new();

        let ka = OrderKey {
            clock: LamportTime(1),
            node_id: &a,
            event_id: id,
        };
        let kb = OrderKey {
            clock: LamportTime(1),
            node_id: &b,
            event_id: id,
        };
        let later = OrderKey {
            clock: LamportTime(2),
            node_id: &a,
            event_id: id,
        };

        assert!(ka < kb);
        assert!(kb < later);
    }

    #[test]
    fn test_event_id_round_trips_as_string() {
        let id = EventId::new();
        let json = serde_json::to_string(&id).unwrap();
        let parsed: EventId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, parsed);
        assert_eq!(id.to_string().parse::<EventId>().unwrap(), id);
    }
}
