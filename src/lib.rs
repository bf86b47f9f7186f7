//! Offline-first mutation queue and synchronization engine for a
//! multi-station clinical records client.
//!
//! Each station records domain writes (patients, lab orders, results) in a
//! durable local queue and keeps working while disconnected. The sync engine
//! drains the queue against the central service whenever the station is
//! reachable, with per-entity ordering, idempotent retries, and explicit
//! surfacing of optimistic-concurrency conflicts.
//!
//! The presentation layer observes two signals (connectivity state, pending
//! count) and issues one command (flush request) through [`SyncEngineHandle`].

use std::sync::Arc;

pub mod database;
pub mod domains;
pub mod errors;

pub use domains::sync::{
    ConnectivityMonitor, EntityKind, MutationAction, MutationRecord, MutationStatus, SyncConfig,
    SyncEngine, SyncEngineHandle,
};

use domains::sync::{ApiRemoteSyncClient, SqliteMutationQueueRepository};
use errors::ServiceResult;

/// A running sync stack: one connectivity monitor and one engine, owned by
/// the caller. Dropping the runtime without calling [`SyncRuntime::shutdown`]
/// detaches the background tasks.
pub struct SyncRuntime {
    handle: SyncEngineHandle,
    monitor_shutdown: tokio::sync::oneshot::Sender<()>,
    engine_shutdown: tokio::sync::oneshot::Sender<()>,
    monitor_task: tokio::task::JoinHandle<()>,
    engine_task: tokio::task::JoinHandle<()>,
}

impl SyncRuntime {
    pub fn handle(&self) -> &SyncEngineHandle {
        &self.handle
    }

    /// Stop the probe and drain loops. In-flight work completes first.
    pub async fn shutdown(self) {
        let _ = self.monitor_shutdown.send(());
        let _ = self.engine_shutdown.send(());
        let _ = self.monitor_task.await;
        let _ = self.engine_task.await;
    }
}

/// Open the local store and start the sync stack against it.
///
/// Fails if the store cannot be opened or migrated; the engine never starts
/// without working persistence. There is deliberately no global instance:
/// callers own the returned runtime and pass its handle to whatever needs it.
pub async fn start(db_url: &str, config: SyncConfig) -> ServiceResult<SyncRuntime> {
    let pool = database::init_db(db_url).await?;

    let repo = Arc::new(SqliteMutationQueueRepository::new(pool));
    let remote = Arc::new(ApiRemoteSyncClient::new(&config));
    let monitor = Arc::new(ConnectivityMonitor::from_config(&config));

    let engine = Arc::new(SyncEngine::new(repo, remote, monitor.clone(), config).await?);
    let handle = engine.handle();

    let (monitor_shutdown, monitor_rx) = tokio::sync::oneshot::channel();
    let (engine_shutdown, engine_rx) = tokio::sync::oneshot::channel();

    let monitor_task = tokio::spawn(monitor.run(monitor_rx));
    let engine_task = tokio::spawn(engine.run(engine_rx));

    Ok(SyncRuntime {
        handle,
        monitor_shutdown,
        engine_shutdown,
        monitor_task,
        engine_task,
    })
}
