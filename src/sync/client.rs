//! Sync cycles: flush the queue to the remote and ingest what comes back.

use crate::domain::errors::{Anomaly, CoreError};
use crate::domain::types::{EventId, NodeId, TimestampUtc};
use crate::envelope::Envelope;
use crate::merge::MergeEngine;
use crate::structured_logger::StructuredLogger;
use crate::sync::protocol::{ClientToRemote, Rejection, RemoteToClient, PROTOCOL_VERSION};
use crate::sync::transport::{Connector, RemoteSession};
use crate::sync::{ProjectIdentity, SyncHandle, SyncState, SyncStatus};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::{Instant, MissedTickBehavior};

/// Exponential backoff between attempts of one sync cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// Delay after the failed attempt number `attempt` (zero based).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(31));
        self.base.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSettings {
    pub batch_size: usize,
    pub ack_timeout: Duration,
    /// Period of the background cycle when nothing wakes it.
    pub interval: Duration,
    /// How long the remote may stay quiet before a cycle stops listening
    /// for pushed events.
    pub inbound_idle: Duration,
    pub retry: RetryPolicy,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            batch_size: 100,
            ack_timeout: Duration::from_secs(10),
            interval: Duration::from_secs(30),
            inbound_idle: Duration::from_millis(250),
            retry: RetryPolicy::default(),
        }
    }
}

/// Result of one `sync_once` call.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    /// No project identity yet; nothing was sent.
    Queued { pending: usize },
    Synced {
        acknowledged: usize,
        rejected: usize,
        ingested: usize,
        pending: usize,
    },
    /// Retries exhausted; the queue is untouched.
    Degraded(Anomaly),
}

#[derive(Debug, Default)]
struct CycleReport {
    acknowledged: usize,
    rejected: usize,
    ingested: usize,
    /// The remote hung up after the last exchange.
    closed: bool,
}

/// Ships queued events to the remote and merges inbound ones.
pub struct SyncClient {
    node_id: NodeId,
    handle: Arc<SyncHandle>,
    merge: MergeEngine,
    connector: Arc<dyn Connector>,
    settings: SyncSettings,
    session: Mutex<Option<Box<dyn RemoteSession>>>,
    audit: Arc<StructuredLogger>,
}

impl SyncClient {
    pub fn new(
        node_id: NodeId,
        handle: Arc<SyncHandle>,
        merge: MergeEngine,
        connector: Arc<dyn Connector>,
        settings: SyncSettings,
        audit: Arc<StructuredLogger>,
    ) -> Self {
        Self {
            node_id,
            handle,
            merge,
            connector,
            settings,
            session: Mutex::new(None),
            audit,
        }
    }

    pub fn handle(&self) -> &Arc<SyncHandle> {
        &self.handle
    }

    /// Runs one sync cycle with retries.
    ///
    /// Transport failures are retried with backoff and end in `Degraded`.
    /// Protocol mismatches and remote rejections are returned as errors.
    pub async fn sync_once(&self) -> Result<SyncOutcome, CoreError> {
        let Some(identity) = self.handle.identity() else {
            let pending = self.handle.queue().len()?;
            self.transition(|status| {
                status.state = SyncState::Queued;
                status.pending = pending;
            });
            return Ok(SyncOutcome::Queued { pending });
        };

        let retry = self.settings.retry;
        let mut attempt = 0u32;
        loop {
            let error = match self.attempt(&identity).await {
                Ok(report) => {
                    let pending = self.handle.queue().len()?;
                    self.transition(|status| {
                        status.state = if pending > 0 {
                            SyncState::Queued
                        } else {
                            SyncState::Synced
                        };
                        status.pending = pending;
                        status.degraded = None;
                        status.last_error = None;
                        status.last_synced_at = Some(TimestampUtc::now());
                    });
                    tracing::info!(
                        acknowledged = report.acknowledged,
                        rejected = report.rejected,
                        ingested = report.ingested,
                        pending,
                        "sync cycle complete"
                    );
                    return Ok(SyncOutcome::Synced {
                        acknowledged: report.acknowledged,
                        rejected: report.rejected,
                        ingested: report.ingested,
                        pending,
                    });
                }
                Err(e) => e,
            };

            let pending = self.handle.queue().len()?;
            if !error.is_retryable() {
                tracing::warn!(error = %error, "sync cycle aborted");
                self.transition(|status| {
                    status.state = SyncState::Disconnected;
                    status.pending = pending;
                    status.last_error = Some(error.to_string());
                });
                return Err(error);
            }

            attempt += 1;
            if attempt >= retry.max_attempts {
                let anomaly = Anomaly::SyncDegraded {
                    attempts: attempt,
                    pending,
                    last_error: error.to_string(),
                };
                tracing::warn!(%anomaly, "sync degraded");
                self.audit.log_anomaly(None, &anomaly);
                self.transition(|status| {
                    status.state = if pending > 0 {
                        SyncState::Queued
                    } else {
                        SyncState::Disconnected
                    };
                    status.pending = pending;
                    status.degraded = Some(anomaly.clone());
                    status.last_error = Some(error.to_string());
                });
                return Ok(SyncOutcome::Degraded(anomaly));
            }

            let delay = retry.backoff_delay(attempt - 1);
            tracing::debug!(attempt, ?delay, error = %error, "sync attempt failed, backing off");
            self.transition(|status| {
                status.state = SyncState::Disconnected;
                status.pending = pending;
                status.last_error = Some(error.to_string());
            });
            tokio::time::sleep(delay).await;
        }
    }

    /// Runs sync cycles on wake-ups and on the configured interval until
    /// `shutdown` turns true or its sender is dropped.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.settings.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = self.handle.woken() => {}
                _ = interval.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            }

            if let Err(e) = self.sync_once().await {
                tracing::warn!(error = %e, "sync cycle failed");
            }
        }

        *self.session.lock().await = None;
        let pending = self.handle.queue().len().unwrap_or(0);
        self.transition(|status| {
            status.state = SyncState::Disconnected;
            status.pending = pending;
        });
    }

    async fn attempt(&self, identity: &ProjectIdentity) -> Result<CycleReport, CoreError> {
        let mut slot = self.session.lock().await;
        let mut session = match slot.take() {
            Some(session) => session,
            None => {
                let pending = self.handle.queue().len()?;
                self.transition(|status| {
                    status.state = SyncState::Syncing;
                    status.pending = pending;
                });
                self.connector.connect(&self.hello(identity)).await?
            }
        };

        // A failed exchange drops the session; the next attempt reconnects.
        let report = self.exchange(session.as_mut(), identity).await?;
        if report.closed {
            tracing::debug!("remote closed the session after the exchange");
        } else {
            *slot = Some(session);
        }
        Ok(report)
    }

    async fn exchange(
        &self,
        session: &mut dyn RemoteSession,
        identity: &ProjectIdentity,
    ) -> Result<CycleReport, CoreError> {
        let queue = self.handle.queue();
        queue.stamp_identity(identity)?;
        let outgoing: Vec<Envelope> = queue
            .snapshot()?
            .into_iter()
            .filter(Envelope::is_transmittable)
            .collect();

        let mut report = CycleReport::default();
        if outgoing.is_empty() {
            session.send(&ClientToRemote::Heartbeat).await?;
            self.drain_inbound(session, &mut report).await?;
            return Ok(report);
        }

        self.transition(|status| status.state = SyncState::Syncing);
        for chunk in outgoing.chunks(self.settings.batch_size.max(1)) {
            let message = ClientToRemote::batch(chunk.to_vec());
            let batch_id = message.batch_id().unwrap_or_default().to_string();
            session.send(&message).await?;
            tracing::debug!(%batch_id, events = chunk.len(), "sent batch");

            let (accepted, rejected) = self.await_ack(session, &batch_id, &mut report).await?;
            for rejection in &rejected {
                tracing::warn!(
                    event_id = %rejection.event_id,
                    error = %rejection.error,
                    "remote rejected event; dropping from queue"
                );
                self.audit.log_rejected(rejection.event_id, &rejection.error);
            }

            let mut done: Vec<EventId> = accepted;
            done.extend(rejected.iter().map(|r| r.event_id));
            queue.acknowledge(&done)?;
            report.acknowledged += done.len() - rejected.len();
            report.rejected += rejected.len();

            let pending = queue.len()?;
            self.handle.publish(|status| status.pending = pending);
        }
        self.drain_inbound(session, &mut report).await?;
        Ok(report)
    }

    /// Ingests events the remote pushes on its own until it stays quiet for
    /// `inbound_idle`. `recv` is dropped on timeout, so it must be cancel safe.
    async fn drain_inbound(
        &self,
        session: &mut dyn RemoteSession,
        report: &mut CycleReport,
    ) -> Result<(), CoreError> {
        while let Ok(message) =
            tokio::time::timeout(self.settings.inbound_idle, session.recv()).await
        {
            match message? {
                Some(RemoteToClient::Events { events }) => {
                    report.ingested += self.ingest_inbound(events)?;
                }
                Some(RemoteToClient::Error { code, message }) => {
                    return Err(CoreError::RemoteRejected { code, message });
                }
                Some(RemoteToClient::Ack { batch_id, .. }) => {
                    tracing::debug!(%batch_id, "ignoring late ack");
                }
                Some(RemoteToClient::Welcome { .. }) => {
                    tracing::debug!("ignoring repeated welcome");
                }
                None => {
                    report.closed = true;
                    break;
                }
            }
        }
        Ok(())
    }

    /// Waits for the ack of `batch_id`, ingesting inbound events meanwhile.
    async fn await_ack(
        &self,
        session: &mut dyn RemoteSession,
        batch_id: &str,
        report: &mut CycleReport,
    ) -> Result<(Vec<EventId>, Vec<Rejection>), CoreError> {
        let deadline = Instant::now() + self.settings.ack_timeout;
        loop {
            let message = tokio::time::timeout_at(deadline, session.recv())
                .await
                .map_err(|_| {
                    CoreError::transport(format!(
                        "no ack for batch {} within {:?}",
                        batch_id, self.settings.ack_timeout
                    ))
                })??;

            match message {
                Some(RemoteToClient::Ack {
                    batch_id: acked,
                    accepted,
                    rejected,
                }) if acked == batch_id => return Ok((accepted, rejected)),
                Some(RemoteToClient::Ack { batch_id: other, .. }) => {
                    tracing::debug!(batch_id = %other, "ignoring ack for another batch");
                }
                Some(RemoteToClient::Events { events }) => {
                    report.ingested += self.ingest_inbound(events)?;
                }
                Some(RemoteToClient::Error { code, message }) => {
                    return Err(CoreError::RemoteRejected { code, message });
                }
                Some(RemoteToClient::Welcome { .. }) => {
                    tracing::debug!("ignoring repeated welcome");
                }
                None => {
                    return Err(CoreError::transport(
                        "remote closed the session before acknowledging",
                    ))
                }
            }
        }
    }

    /// Merges one inbound `events` message. An invalid member rejects the
    /// whole message, which is logged and skipped.
    fn ingest_inbound(&self, events: Vec<Value>) -> Result<usize, CoreError> {
        let mut batch = Vec::with_capacity(events.len());
        for value in events {
            match Envelope::from_wire_value(value) {
                Ok(envelope) => batch.push(envelope),
                Err(e) => {
                    tracing::warn!(error = %e, "rejecting inbound events message");
                    self.audit.log(
                        "Sync",
                        serde_json::json!({
                            "type": "InboundRejected",
                            "error": e.to_string(),
                        }),
                    );
                    return Ok(0);
                }
            }
        }

        let report = self.merge.ingest(batch)?;
        self.audit.log_merge(&report);
        Ok(report.appended.len())
    }

    fn hello(&self, identity: &ProjectIdentity) -> ClientToRemote {
        ClientToRemote::Hello {
            node_id: self.node_id.clone(),
            team_slug: identity.team_slug.clone(),
            project_uuid: identity.project_uuid,
            protocol_version: PROTOCOL_VERSION,
            hostname: Some(gethostname::gethostname().to_string_lossy().to_string()),
        }
    }

    /// Publishes a status change and records state transitions.
    fn transition(&self, update: impl FnOnce(&mut SyncStatus)) {
        let previous = self.handle.publish(update);
        let current = self.handle.status();
        if previous != current.state {
            tracing::info!(from = %previous, to = %current.state, pending = current.pending, "sync state changed");
            self.audit
                .log_sync_transition(previous, current.state, current.pending);
        }
    }
}

#[cfg(test)]
#[path = "tests/client_tests.rs"]
mod tests;
