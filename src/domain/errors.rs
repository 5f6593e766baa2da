//! Error and anomaly types for the status engine.
//!
//! `CoreError` is returned to callers. `Anomaly` values are observability
//! signals: they are recorded and surfaced on views, never raised.

use crate::domain::lane::Lane;
use crate::domain::types::EventId;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// Errors that can occur while emitting, storing, merging or syncing events.
#[derive(Debug, Clone, PartialEq)]
pub enum CoreError {
    /// Malformed envelope or payload; never appended.
    SchemaViolation { message: String },
    /// Storage/persistence failure.
    StorageFailure { message: String },
    /// Transport to the remote authority failed.
    TransportFailure { message: String },
    /// Remote authority speaks a different protocol version.
    ProtocolMismatch { expected: u32, actual: u32 },
    /// Remote authority returned a structured error.
    RemoteRejected { code: String, message: String },
}

impl CoreError {
    pub fn schema(message: impl Into<String>) -> Self {
        Self::SchemaViolation {
            message: message.into(),
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::StorageFailure {
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::TransportFailure {
            message: message.into(),
        }
    }

    /// True for failures that a later sync attempt may clear.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransportFailure { .. })
    }
}

impl Display for CoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SchemaViolation { message } => write!(f, "schema violation: {}", message),
            Self::StorageFailure { message } => write!(f, "storage failure: {}", message),
            Self::TransportFailure { message } => write!(f, "transport failure: {}", message),
            Self::ProtocolMismatch { expected, actual } => write!(
                f,
                "protocol version mismatch: got {}, expected {}",
                actual, expected
            ),
            Self::RemoteRejected { code, message } => {
                write!(f, "remote rejected request ({}): {}", code, message)
            }
        }
    }
}

impl std::error::Error for CoreError {}

impl From<std::io::Error> for CoreError {
    fn from(e: std::io::Error) -> Self {
        Self::storage(e.to_string())
    }
}

/// Non-fatal conditions surfaced for auditing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Anomaly {
    /// An event id was appended twice; the second append was a no-op.
    DuplicateEvent { event_id: EventId },
    /// A status change did not match the folded state.
    ConflictingTransition {
        event_id: EventId,
        expected_previous: Lane,
        actual_current: Lane,
        target: Lane,
        applied: bool,
    },
    /// An event references a cause that is not in the log.
    OrphanedCausation {
        event_id: EventId,
        causation_id: EventId,
    },
    /// The transport is unavailable; events stay queued.
    SyncDegraded {
        attempts: u32,
        pending: usize,
        last_error: String,
    },
}

impl Display for Anomaly {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DuplicateEvent { event_id } => write!(f, "duplicate event {}", event_id),
            Self::ConflictingTransition {
                event_id,
                expected_previous,
                actual_current,
                target,
                applied,
            } => write!(
                f,
                "conflicting transition {}: {}->{} while at {} ({})",
                event_id,
                expected_previous,
                target,
                actual_current,
                if *applied { "applied" } else { "not applied" }
            ),
            Self::OrphanedCausation {
                event_id,
                causation_id,
            } => write!(
                f,
                "event {} references missing cause {}",
                event_id, causation_id
            ),
            Self::SyncDegraded {
                attempts,
                pending,
                last_error,
            } => write!(
                f,
                "sync degraded after {} attempts ({} pending): {}",
                attempts, pending, last_error
            ),
        }
    }
}
