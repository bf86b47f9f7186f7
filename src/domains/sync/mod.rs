pub mod connectivity;
pub mod remote;
pub mod repository;
pub mod service;
pub mod types;

pub use connectivity::{ConnectivityMonitor, HttpReachabilityProbe, ReachabilityProbe};
pub use remote::{ApiRemoteSyncClient, RemoteSyncClient};
pub use repository::{MutationQueueRepository, SqliteMutationQueueRepository};
pub use service::{DrainSummary, SyncEngine, SyncEngineHandle};
pub use types::{
    EntityKind, MutationAction, MutationPush, MutationRecord, MutationStatus, PushResponse,
    PushStatus, SyncConfig,
};
