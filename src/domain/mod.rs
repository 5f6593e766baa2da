//! Domain model for event-sourced work package status.
//!
//! # Architecture
//!
//! - **Types** (`types.rs`): identifiers, clock values, aggregate references
//! - **Events** (`events.rs`): the closed set of event payloads
//! - **Lanes** (`lane.rs`): lifecycle states and allowed transitions
//! - **Errors** (`errors.rs`): error taxonomy and audit anomalies

pub mod errors;
pub mod events;
pub mod lane;
pub mod types;

pub use errors::{Anomaly, CoreError};
pub use events::{
    DependencyResolution, DependencyResolved, EventPayload, EvidenceAttached, EvidenceKind,
    FeatureCompleted, FeatureCreated, HistoryAdded, WpAssigned, WpCreated, WpStatusChanged,
    EVENT_TYPES,
};
pub use lane::Lane;
pub use types::{
    AggregateId, AggregateRef, AggregateType, EventId, LamportTime, NodeId, OrderKey, ProjectId,
    TeamSlug, TimestampUtc,
};
