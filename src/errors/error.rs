use thiserror::Error;

/// Database errors
///
/// Local persistence failures are fatal to the caller that triggered them:
/// the engine refuses to start without a working store, and `enqueue`
/// surfaces these synchronously.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Connection pool error: {0}")]
    ConnectionPool(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Record not found: {0} with ID {1}")]
    NotFound(String, String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Database error: {0}")]
    Other(String),
}

/// Manual Clone implementation for DbError
impl Clone for DbError {
    fn clone(&self) -> Self {
        match self {
            DbError::Sqlx(err) => DbError::Other(format!("SQLx error: {}", err)),
            DbError::ConnectionPool(s) => DbError::ConnectionPool(s.clone()),
            DbError::Transaction(s) => DbError::Transaction(s.clone()),
            DbError::NotFound(s1, s2) => DbError::NotFound(s1.clone(), s2.clone()),
            DbError::Migration(s) => DbError::Migration(s.clone()),
            DbError::Other(s) => DbError::Other(s.clone()),
        }
    }
}

/// Domain-level errors
#[derive(Debug, Error, Clone)]
pub enum DomainError {
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Invalid entity kind: {0}")]
    InvalidEntityKind(String),

    #[error("Invalid mutation action: {0}")]
    InvalidAction(String),

    #[error("Invalid mutation status: {0}")]
    InvalidStatus(String),

    #[error("Invalid UUID: {0}")]
    InvalidUuid(String),

    #[error("Invalid timestamp in {field}: {value}")]
    InvalidTimestamp { field: String, value: String },

    #[error("Mutation record not found: {0}")]
    RecordNotFound(i64),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Sync-specific errors
///
/// The drain loop routes these per record: `Network`/`Timeout` are transient
/// and retried with backoff, `VersionConflict` goes to the conflict policy,
/// `Rejected` dead-letters immediately. None of them propagate to the
/// presentation layer.
#[derive(Debug, Error, Clone)]
pub enum SyncError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Sync timeout")]
    Timeout,

    #[error("Version conflict: base version {expected} is stale, server has {actual}")]
    VersionConflict { expected: i64, actual: i64 },

    #[error("Remote rejected mutation: {0}")]
    Rejected(String),

    #[error("Local database error: {0}")]
    LocalDatabase(#[from] DbError),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Sync interrupted")]
    Interrupted,

    #[error("Sync error: {0}")]
    Other(String),
}

impl SyncError {
    /// Whether a failed push may be retried with the same idempotency key.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SyncError::Network(_) | SyncError::Timeout | SyncError::ServerError(_)
        )
    }
}

/// Service-level errors (application specific)
#[derive(Debug, Error, Clone)]
pub enum ServiceError {
    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("External service error: {0}")]
    ExternalService(String),
}

impl From<SyncError> for ServiceError {
    fn from(error: SyncError) -> Self {
        ServiceError::Domain(DomainError::Sync(error))
    }
}

impl From<DbError> for ServiceError {
    fn from(error: DbError) -> Self {
        ServiceError::Domain(DomainError::Database(error))
    }
}
