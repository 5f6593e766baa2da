//! Sync client: ships local events to the remote authority and ingests
//! remote events through the merge engine.
//!
//! # Architecture
//!
//! - **Queue** (`queue.rs`): durable, insertion-ordered send queue
//! - **Protocol** (`protocol.rs`): newline-delimited JSON wire messages
//! - **Transport** (`transport.rs`): `Connector`/`RemoteSession` seams and TCP
//! - **Client** (`client.rs`): retry, batching, acknowledgement handling
//!
//! Sync failures never block local work: `emit` only appends and enqueues.

pub mod client;
pub mod protocol;
pub mod queue;
pub mod transport;

pub use client::{RetryPolicy, SyncClient, SyncOutcome, SyncSettings};
pub use protocol::{ClientToRemote, Rejection, RemoteToClient, PROTOCOL_VERSION};
pub use queue::OfflineQueue;
pub use transport::{Connector, RemoteSession, TcpConnector};

use crate::domain::errors::Anomaly;
use crate::domain::types::{ProjectId, TeamSlug, TimestampUtc};
use serde::{Deserialize, Serialize};
use std::sync::RwLock;
use tokio::sync::{watch, Notify};

/// Connection state of the sync client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    #[default]
    Disconnected,
    /// Events are waiting for a project identity or connectivity.
    Queued,
    Syncing,
    Synced,
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Queued => "queued",
            Self::Syncing => "syncing",
            Self::Synced => "synced",
        };
        f.write_str(name)
    }
}

/// Snapshot published to status subscribers.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncStatus {
    pub state: SyncState,
    pub pending: usize,
    /// Set while retries are exhausted; cleared by the next successful cycle.
    pub degraded: Option<Anomaly>,
    pub last_error: Option<String>,
    pub last_synced_at: Option<TimestampUtc>,
}

/// Identity under which events are transmitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectIdentity {
    pub project_uuid: ProjectId,
    #[serde(default)]
    pub project_slug: Option<String>,
    #[serde(default)]
    pub team_slug: Option<TeamSlug>,
}

/// State shared between the engine (producer) and the sync client (consumer).
pub struct SyncHandle {
    queue: OfflineQueue,
    identity: RwLock<Option<ProjectIdentity>>,
    status: watch::Sender<SyncStatus>,
    wake: Notify,
}

impl SyncHandle {
    pub fn new(queue: OfflineQueue, identity: Option<ProjectIdentity>) -> Self {
        let (status, _) = watch::channel(SyncStatus::default());
        Self {
            queue,
            identity: RwLock::new(identity),
            status,
            wake: Notify::new(),
        }
    }

    pub fn queue(&self) -> &OfflineQueue {
        &self.queue
    }

    pub fn identity(&self) -> Option<ProjectIdentity> {
        self.identity
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Sets the project identity; queued events are stamped on the next flush.
    pub fn set_identity(&self, identity: ProjectIdentity) {
        *self.identity.write().unwrap_or_else(|e| e.into_inner()) = Some(identity);
        self.wake();
    }

    pub fn status(&self) -> SyncStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    /// Wakes the sync task without waiting for it.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    pub(crate) async fn woken(&self) {
        self.wake.notified().await;
    }

    /// Updates the published status and returns the previous state.
    pub(crate) fn publish(&self, update: impl FnOnce(&mut SyncStatus)) -> SyncState {
        let mut previous = SyncState::default();
        self.status.send_modify(|status| {
            previous = status.state;
            update(status);
        });
        previous
    }
}
