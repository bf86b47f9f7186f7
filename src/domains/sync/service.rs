use chrono::Utc;
use log::{debug, error, info, warn};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{oneshot, watch, Notify};
use tokio::time::{self, MissedTickBehavior};

use crate::domains::sync::connectivity::ConnectivityMonitor;
use crate::domains::sync::remote::RemoteSyncClient;
use crate::domains::sync::repository::MutationQueueRepository;
use crate::domains::sync::types::{
    EntityKind, MutationAction, MutationPush, MutationRecord, PushStatus, SyncConfig,
};
use crate::errors::{DomainResult, SyncError};

/// Outcome counters for one drain pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainSummary {
    pub pushed: u32,
    pub synced: u32,
    pub conflicted: u32,
    pub dead_lettered: u32,
    pub retried: u32,
    pub skipped: u32,
    /// Connectivity dropped mid-pass; remaining records were left pending.
    pub aborted: bool,
}

/// Orchestrates the mutation queue against the remote service.
///
/// The engine is Idle except while a single drain pass runs; drains are
/// triggered by the drain timer, by a connectivity transition to online, or
/// by an explicit flush request. The run loop is the only drainer, so at
/// most one drain runs system-wide and re-entrant requests coalesce.
pub struct SyncEngine {
    repo: Arc<dyn MutationQueueRepository>,
    remote: Arc<dyn RemoteSyncClient>,
    connectivity: Arc<ConnectivityMonitor>,
    config: SyncConfig,
    pending_tx: watch::Sender<i64>,
    flush: Arc<Notify>,
}

impl SyncEngine {
    /// Construct the engine, recovering any records a previous process run
    /// left in flight. Refuses to start if the local store is unusable.
    pub async fn new(
        repo: Arc<dyn MutationQueueRepository>,
        remote: Arc<dyn RemoteSyncClient>,
        connectivity: Arc<ConnectivityMonitor>,
        config: SyncConfig,
    ) -> DomainResult<Self> {
        repo.reset_in_flight().await?;
        let initial_count = repo.pending_count().await?;
        let (pending_tx, _) = watch::channel(initial_count);

        Ok(Self {
            repo,
            remote,
            connectivity,
            config,
            pending_tx,
            flush: Arc::new(Notify::new()),
        })
    }

    /// Observable surface for the presentation and domain layers.
    pub fn handle(&self) -> SyncEngineHandle {
        SyncEngineHandle {
            repo: self.repo.clone(),
            connectivity: self.connectivity.clone(),
            pending_tx: self.pending_tx.clone(),
            flush: self.flush.clone(),
        }
    }

    /// Engine loop: drain on the timer, on connectivity recovery, and on
    /// flush requests, until shut down.
    pub async fn run(self: Arc<Self>, mut shutdown: oneshot::Receiver<()>) {
        let mut interval = time::interval(self.config.drain_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut connectivity_rx = self.connectivity.subscribe();

        info!(
            "Sync engine started (drain interval {:?})",
            self.config.drain_interval
        );
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.try_drain("timer").await;
                }
                changed = connectivity_rx.changed() => {
                    match changed {
                        Ok(()) => {
                            if *connectivity_rx.borrow_and_update() {
                                self.try_drain("connectivity recovered").await;
                            }
                        }
                        // Monitor dropped; the timer keeps draining.
                        Err(_) => {}
                    }
                }
                _ = self.flush.notified() => {
                    self.try_drain("flush request").await;
                }
                _ = &mut shutdown => {
                    info!("Sync engine stopping");
                    break;
                }
            }
        }
    }

    async fn try_drain(&self, trigger: &str) {
        if !self.connectivity.current_state() {
            debug!("Skipping drain ({}): offline", trigger);
            return;
        }
        match self.drain_once().await {
            Ok(summary) => {
                if summary.pushed > 0 || summary.skipped > 0 {
                    info!(
                        "Drain ({}): {} pushed, {} synced, {} conflicted, {} dead-lettered, \
                         {} retried, {} skipped{}",
                        trigger,
                        summary.pushed,
                        summary.synced,
                        summary.conflicted,
                        summary.dead_lettered,
                        summary.retried,
                        summary.skipped,
                        if summary.aborted { ", aborted" } else { "" }
                    );
                }
            }
            Err(e) => error!("Drain ({}) failed: {}", trigger, e),
        }
    }

    /// One full pass over the queue snapshot taken at pass start. Items
    /// enqueued during the pass wait for the next trigger, so each drain is
    /// bounded work.
    pub async fn drain_once(&self) -> DomainResult<DrainSummary> {
        let mut summary = DrainSummary::default();

        if !self.connectivity.current_state() {
            summary.aborted = true;
            return Ok(summary);
        }

        let snapshot = self.repo.pending_ordered().await?;

        // Entities with an earlier record skipped or failed this pass: later
        // records for them must wait so per-entity id order is never
        // violated. Other entities keep draining.
        let mut blocked: HashSet<(EntityKind, String)> = HashSet::new();

        for queued in snapshot {
            if !self.connectivity.current_state() {
                summary.aborted = true;
                break;
            }

            let key = (queued.entity_kind, queued.entity_id.clone());
            if blocked.contains(&key) {
                summary.skipped += 1;
                continue;
            }

            if let Some(gate) = queued.next_attempt_at {
                if gate > Utc::now() {
                    blocked.insert(key);
                    summary.skipped += 1;
                    continue;
                }
            }

            // Re-read: an earlier create in this pass may have remapped this
            // record's entity id.
            let record = self.repo.find_by_id(queued.id).await?;

            self.repo.mark_in_flight(record.id).await?;
            summary.pushed += 1;

            let push = MutationPush::from_record(&record);
            match self.remote.push_mutation(&push).await {
                Ok(response) => match response.status {
                    PushStatus::Applied => {
                        self.repo
                            .mark_synced(
                                record.id,
                                response.server_entity_id.as_deref(),
                                response.new_version,
                            )
                            .await?;
                        summary.synced += 1;

                        if record.action == MutationAction::Create {
                            self.remap_after_create(&record, response.server_entity_id.as_deref())
                                .await?;
                        }
                    }
                    PushStatus::Conflict => {
                        let message = match response.server_version {
                            Some(actual) => format!(
                                "version conflict: base version {} is stale, server has {}",
                                record.base_version, actual
                            ),
                            None => "version conflict: base version is stale".to_string(),
                        };
                        warn!(
                            "Mutation {} for {} {} conflicted: {}",
                            record.id,
                            record.entity_kind.as_str(),
                            record.entity_id,
                            message
                        );
                        self.repo.mark_conflicted(record.id, &message).await?;
                        blocked.insert(key);
                        summary.conflicted += 1;
                    }
                    PushStatus::Rejected => {
                        let message = response
                            .message
                            .unwrap_or_else(|| "rejected by remote service".to_string());
                        self.repo.mark_dead_lettered(record.id, &message).await?;
                        blocked.insert(key);
                        summary.dead_lettered += 1;
                    }
                },
                Err(e) => {
                    self.record_push_failure(&record, &e, &mut summary).await?;
                    blocked.insert(key);
                }
            }
        }

        self.publish_pending_count().await?;
        self.repo
            .purge_synced(Utc::now() - self.config.retention)
            .await?;

        Ok(summary)
    }

    /// The server assigned a different id than the local temporary one:
    /// rewrite later-queued records so they are pushed under the server id.
    async fn remap_after_create(
        &self,
        record: &MutationRecord,
        server_entity_id: Option<&str>,
    ) -> DomainResult<()> {
        let Some(server_id) = server_entity_id else {
            return Ok(());
        };
        if server_id == record.entity_id {
            return Ok(());
        }
        self.repo
            .remap_entity_id(record.entity_kind, &record.entity_id, server_id)
            .await?;
        Ok(())
    }

    async fn record_push_failure(
        &self,
        record: &MutationRecord,
        error: &SyncError,
        summary: &mut DrainSummary,
    ) -> DomainResult<()> {
        if !error.is_transient() {
            warn!(
                "Unexpected push error for mutation {}: {}",
                record.id, error
            );
        }

        let attempts = record.attempts + 1;
        if attempts >= self.config.max_attempts {
            warn!(
                "Mutation {} dead-lettered after {} attempts: {}",
                record.id, attempts, error
            );
            self.repo
                .mark_dead_lettered(
                    record.id,
                    &format!("gave up after {} attempts: {}", attempts, error),
                )
                .await?;
            summary.dead_lettered += 1;
        } else {
            let delay = self.config.backoff_delay(attempts);
            self.repo
                .mark_retry(record.id, &error.to_string(), Utc::now() + delay)
                .await?;
            summary.retried += 1;
        }
        Ok(())
    }

    async fn publish_pending_count(&self) -> DomainResult<()> {
        let count = self.repo.pending_count().await?;
        self.pending_tx.send_if_modified(|current| {
            if *current != count {
                *current = count;
                true
            } else {
                false
            }
        });
        Ok(())
    }
}

/// Cheap, cloneable surface handed to the presentation and domain layers.
///
/// The only command it accepts is a flush request; everything else is
/// observation or queue access that never blocks on the network.
#[derive(Clone)]
pub struct SyncEngineHandle {
    repo: Arc<dyn MutationQueueRepository>,
    connectivity: Arc<ConnectivityMonitor>,
    pending_tx: watch::Sender<i64>,
    flush: Arc<Notify>,
}

impl SyncEngineHandle {
    /// Record a domain write in the local queue. Returns as soon as the
    /// record is durable; the push happens on a later drain.
    pub async fn enqueue(
        &self,
        entity_kind: EntityKind,
        entity_id: &str,
        action: MutationAction,
        payload: serde_json::Value,
        base_version: i64,
    ) -> DomainResult<MutationRecord> {
        let record = self
            .repo
            .enqueue(entity_kind, entity_id, action, payload, base_version)
            .await?;

        let count = self.repo.pending_count().await?;
        self.pending_tx.send_if_modified(|current| {
            if *current != count {
                *current = count;
                true
            } else {
                false
            }
        });

        Ok(record)
    }

    /// Best-effort immediate drain. Coalesced if a drain is already running;
    /// a no-op (not an error) while offline.
    pub fn request_flush(&self) {
        self.flush.notify_one();
    }

    pub fn is_online(&self) -> bool {
        self.connectivity.current_state()
    }

    pub fn subscribe_connectivity(&self) -> watch::Receiver<bool> {
        self.connectivity.subscribe()
    }

    pub fn subscribe_pending_count(&self) -> watch::Receiver<i64> {
        self.pending_tx.subscribe()
    }

    pub async fn pending_count(&self) -> DomainResult<i64> {
        self.repo.pending_count().await
    }

    /// Records awaiting operator review.
    pub async fn conflicted(&self) -> DomainResult<Vec<MutationRecord>> {
        self.repo.conflicted().await
    }

    pub async fn dead_lettered(&self) -> DomainResult<Vec<MutationRecord>> {
        self.repo.dead_lettered().await
    }

    /// Apply an external conflict decision: re-enqueue against the current
    /// server version, optionally with a re-derived payload.
    pub async fn resolve_conflict(
        &self,
        id: i64,
        new_base_version: i64,
        new_payload: Option<serde_json::Value>,
    ) -> DomainResult<MutationRecord> {
        let record = self
            .repo
            .resolve_conflict(id, new_base_version, new_payload)
            .await?;
        self.request_flush();
        Ok(record)
    }
}
