//! Facade over the clock, log, reducer, merge engine and sync handle.
//!
//! `emit`/`emit_raw` are the only write entry points. They append locally,
//! enqueue for transmission and return without touching the network.

use crate::clock::{load_or_create_node_id, LamportClock};
use crate::config::SyncConfig;
use crate::domain::errors::{Anomaly, CoreError};
use crate::domain::events::EventPayload;
use crate::domain::types::{AggregateRef, EventId, LamportTime, NodeId};
use crate::enrichment::{CommandGitContext, GitContext, MetadataEnricher};
use crate::envelope::{Envelope, EnvelopeFactory};
use crate::event_store::{AppendOutcome, FileEventLog};
use crate::merge::{MergeEngine, MergeReport};
use crate::paths::StatePaths;
use crate::reducer::{reduce, MaterializedStatus, StatusCache};
use crate::structured_logger::StructuredLogger;
use crate::sync::{
    Connector, OfflineQueue, ProjectIdentity, SyncClient, SyncHandle, SyncSettings, SyncState,
    SyncStatus, TcpConnector,
};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// Result of a local emission.
#[derive(Debug, Clone, PartialEq)]
pub struct EmitOutcome {
    pub envelope: Envelope,
    /// False only if the id was already queued.
    pub queued: bool,
    pub sync_state: SyncState,
}

pub struct StatusEngine {
    paths: StatePaths,
    node_id: NodeId,
    clock: Arc<LamportClock>,
    factory: EnvelopeFactory,
    log: Arc<FileEventLog>,
    merge: MergeEngine,
    cache: StatusCache,
    enricher: MetadataEnricher,
    sync: Arc<SyncHandle>,
    audit: Arc<StructuredLogger>,
    settings: SyncSettings,
    remote_address: Option<String>,
    connect_timeout: Duration,
}

impl StatusEngine {
    /// Opens the engine for `paths`, resolving git context from the current directory.
    pub fn open(paths: StatePaths, config: &SyncConfig) -> Result<Self, CoreError> {
        let working_dir = std::env::current_dir()?;
        Self::open_with_git(paths, config, Arc::new(CommandGitContext::new(working_dir)))
    }

    pub fn open_with_git(
        paths: StatePaths,
        config: &SyncConfig,
        git: Arc<dyn GitContext>,
    ) -> Result<Self, CoreError> {
        let node_id = load_or_create_node_id(&paths.node_id)?;
        let clock = Arc::new(LamportClock::open(paths.clock.clone())?);
        let log = Arc::new(FileEventLog::open(paths.events_dir.clone())?);
        // The clock file can lag the log if a crash hit between the two writes.
        clock.observe(log.max_clock()?);

        let queue = OfflineQueue::open(paths.queue.clone())?;
        let pending = queue.len()?;
        let sync = Arc::new(SyncHandle::new(queue, config.identity()));
        if pending > 0 {
            sync.publish(|status| {
                status.state = SyncState::Queued;
                status.pending = pending;
            });
        }

        let audit = if config.audit.enabled {
            StructuredLogger::new(&node_id, &paths.logs_dir)
                .map_err(|e| CoreError::storage(format!("open audit log: {:#}", e)))?
        } else {
            StructuredLogger::disabled(&node_id)
        };

        tracing::debug!(
            node_id = %node_id,
            clock = %clock.current(),
            pending,
            state = %paths.events_dir.display(),
            "status engine opened"
        );

        Ok(Self {
            factory: EnvelopeFactory::new(node_id.clone(), Arc::clone(&clock)),
            merge: MergeEngine::new(Arc::clone(&log), Arc::clone(&clock)),
            enricher: MetadataEnricher::new(
                git,
                config.git_cache_ttl(),
                config.enrichment.repo_slug.clone(),
            ),
            paths,
            node_id,
            clock,
            log,
            cache: StatusCache::new(),
            sync,
            audit: Arc::new(audit),
            settings: config.sync_settings(),
            remote_address: config.remote.address.clone(),
            connect_timeout: config.connect_timeout(),
        })
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn paths(&self) -> &StatePaths {
        &self.paths
    }

    pub fn clock(&self) -> LamportTime {
        self.clock.current()
    }

    /// Records a typed event for `aggregate`.
    pub fn emit(
        &self,
        payload: EventPayload,
        aggregate: AggregateRef,
        causation_id: Option<EventId>,
    ) -> Result<EmitOutcome, CoreError> {
        let envelope = self.factory.build(payload, aggregate, causation_id)?;
        self.commit(envelope)
    }

    /// Records an event given as type name and JSON payload.
    pub fn emit_raw(
        &self,
        event_type: &str,
        aggregate: AggregateRef,
        payload: Value,
        causation_id: Option<EventId>,
    ) -> Result<EmitOutcome, CoreError> {
        let envelope = self
            .factory
            .build_raw(event_type, aggregate, payload, causation_id)?;
        self.commit(envelope)
    }

    fn commit(&self, mut envelope: Envelope) -> Result<EmitOutcome, CoreError> {
        self.enricher
            .enrich(&mut envelope, self.sync.identity().as_ref());
        envelope.validate()?;

        if self.log.append(&envelope)? == AppendOutcome::Duplicate {
            self.audit.log_anomaly(
                Some(&envelope.aggregate),
                &Anomaly::DuplicateEvent {
                    event_id: envelope.event_id,
                },
            );
        } else {
            self.audit.log_appended(&envelope);
        }
        tracing::debug!(
            event_id = %envelope.event_id,
            event_type = %envelope.event_type(),
            aggregate = %envelope.aggregate,
            clock = %envelope.lamport_clock,
            "appended local event"
        );

        let queued = self.sync.queue().push(&envelope)?;
        let pending = self.sync.queue().len()?;
        let previous = self.sync.publish(|status| {
            status.pending = pending;
            if status.state != SyncState::Syncing {
                status.state = SyncState::Queued;
            }
        });
        let sync_state = self.sync.status().state;
        if previous != sync_state {
            self.audit.log_sync_transition(previous, sync_state, pending);
        }
        self.sync.wake();

        Ok(EmitOutcome {
            envelope,
            queued,
            sync_state,
        })
    }

    /// Current status of `aggregate`, folded from the merged local log.
    ///
    /// Works offline. Views are cached until the aggregate's log changes.
    pub fn materialized_status(
        &self,
        aggregate: &AggregateRef,
    ) -> Result<MaterializedStatus, CoreError> {
        let version = self.log.version(aggregate)?;
        if let Some(status) = self.cache.get(aggregate, version) {
            return Ok(status);
        }

        let merged = self.merge.merged(aggregate)?;
        let mut status = reduce(aggregate, &merged.events);
        status.orphaned_causation = merged.orphaned();

        // Only conflicts that were not in the last computed view reach the audit log.
        let audited: HashSet<EventId> = self
            .cache
            .previous(aggregate)
            .map(|previous| previous.conflicts.iter().map(|c| c.event_id).collect())
            .unwrap_or_default();
        for conflict in status
            .conflicts
            .iter()
            .filter(|c| !audited.contains(&c.event_id))
        {
            let anomaly = conflict.to_anomaly();
            tracing::warn!(aggregate = %aggregate, %anomaly, "conflicting transition");
            self.audit.log_anomaly(Some(aggregate), &anomaly);
        }
        for issue in merged.issues.iter().filter_map(|issue| issue.to_anomaly()) {
            tracing::warn!(aggregate = %aggregate, anomaly = %issue, "orphaned causation");
        }

        self.cache.insert(aggregate.clone(), version, status.clone());
        Ok(status)
    }

    /// Events of `aggregate` in canonical merged order.
    pub fn history(&self, aggregate: &AggregateRef) -> Result<Vec<Envelope>, CoreError> {
        Ok(self.merge.merged(aggregate)?.events)
    }

    pub fn aggregates(&self) -> Result<Vec<AggregateRef>, CoreError> {
        self.log.aggregates()
    }

    /// Merges events received from the remote outside a sync session.
    pub fn ingest_remote(&self, batch: Vec<Envelope>) -> Result<MergeReport, CoreError> {
        let report = self.merge.ingest(batch)?;
        self.audit.log_merge(&report);
        Ok(report)
    }

    /// Sets the project identity; queued events are stamped on the next flush.
    pub fn set_project_identity(&self, identity: ProjectIdentity) {
        tracing::info!(project_uuid = %identity.project_uuid, "project identity set");
        self.sync.set_identity(identity);
    }

    /// A sync client over `connector` sharing this engine's queue and log.
    pub fn sync_client(&self, connector: Arc<dyn Connector>) -> SyncClient {
        SyncClient::new(
            self.node_id.clone(),
            Arc::clone(&self.sync),
            self.merge.clone(),
            connector,
            self.settings,
            Arc::clone(&self.audit),
        )
    }

    /// A TCP sync client for the configured remote, if one is configured.
    pub fn tcp_sync_client(&self) -> Option<SyncClient> {
        let address = self.remote_address.as_ref()?;
        let connector = TcpConnector::new(address.clone(), self.connect_timeout);
        Some(self.sync_client(Arc::new(connector)))
    }

    /// Sync status with the pending count read from the queue.
    pub fn sync_status(&self) -> Result<SyncStatus, CoreError> {
        let mut status = self.sync.status();
        status.pending = self.sync.queue().len()?;
        Ok(status)
    }

    /// Events waiting for acknowledgement, in send order.
    pub fn pending_events(&self) -> Result<Vec<Envelope>, CoreError> {
        self.sync.queue().snapshot()
    }

    /// Receives every published sync status change.
    pub fn watch_sync(&self) -> tokio::sync::watch::Receiver<SyncStatus> {
        self.sync.subscribe()
    }
}

#[cfg(test)]
#[path = "tests/engine_tests.rs"]
mod tests;
