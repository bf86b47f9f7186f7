use crate::errors::{DomainError, DomainResult};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::str::FromStr;
use uuid::Uuid;

/// The domain kinds whose rows can be mutated offline.
///
/// The engine never interprets domain semantics; the kind only routes the
/// mutation to the right remote collection and scopes ordering/remapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Patient,
    Order,
    Result,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Patient => "patient",
            EntityKind::Order => "order",
            EntityKind::Result => "result",
        }
    }
}

impl FromStr for EntityKind {
    type Err = DomainError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "patient" => Ok(EntityKind::Patient),
            "order" => Ok(EntityKind::Order),
            "result" => Ok(EntityKind::Result),
            _ => Err(DomainError::InvalidEntityKind(s.to_string())),
        }
    }
}

impl From<EntityKind> for String {
    fn from(kind: EntityKind) -> Self {
        kind.as_str().to_string()
    }
}

/// The type of mutation recorded against an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationAction {
    Create,
    Update,
    Delete,
}

impl MutationAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationAction::Create => "create",
            MutationAction::Update => "update",
            MutationAction::Delete => "delete",
        }
    }
}

impl FromStr for MutationAction {
    type Err = DomainError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(MutationAction::Create),
            "update" => Ok(MutationAction::Update),
            "delete" => Ok(MutationAction::Delete),
            _ => Err(DomainError::InvalidAction(s.to_string())),
        }
    }
}

impl From<MutationAction> for String {
    fn from(action: MutationAction) -> Self {
        action.as_str().to_string()
    }
}

/// Lifecycle status of a queued mutation.
///
/// `pending -> in_flight -> {synced | pending (retry) | conflicted |
/// dead_lettered}`. `Synced` and `DeadLettered` are terminal; `Conflicted`
/// leaves the queue only through an explicit external resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationStatus {
    Pending,
    InFlight,
    Synced,
    Conflicted,
    DeadLettered,
}

impl MutationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationStatus::Pending => "pending",
            MutationStatus::InFlight => "in_flight",
            MutationStatus::Synced => "synced",
            MutationStatus::Conflicted => "conflicted",
            MutationStatus::DeadLettered => "dead_lettered",
        }
    }

    /// Terminal states never re-enter the drain loop.
    pub fn is_terminal(&self) -> bool {
        matches!(self, MutationStatus::Synced | MutationStatus::DeadLettered)
    }
}

impl FromStr for MutationStatus {
    type Err = DomainError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(MutationStatus::Pending),
            "in_flight" => Ok(MutationStatus::InFlight),
            "synced" => Ok(MutationStatus::Synced),
            "conflicted" => Ok(MutationStatus::Conflicted),
            "dead_lettered" => Ok(MutationStatus::DeadLettered),
            _ => Err(DomainError::InvalidStatus(s.to_string())),
        }
    }
}

impl From<MutationStatus> for String {
    fn from(status: MutationStatus) -> Self {
        status.as_str().to_string()
    }
}

/// One entry in the local mutation queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutationRecord {
    /// Locally-assigned sequence number; defines FIFO order per entity.
    pub id: i64,

    /// Idempotency key sent with every push attempt. Never reused, even
    /// after dead-lettering.
    pub client_mutation_id: Uuid,

    pub entity_kind: EntityKind,

    /// May be a temporary local id for not-yet-synced creates; remapped to
    /// the server id once the create is confirmed.
    pub entity_id: String,

    pub action: MutationAction,

    /// Whole-payload snapshot of the mutated fields at enqueue time.
    pub payload: serde_json::Value,

    /// Server version the mutation was computed against (0 for creates).
    pub base_version: i64,

    pub status: MutationStatus,
    pub attempts: i64,
    pub last_error: Option<String>,

    /// Backoff gate: the drain loop skips this record until the instant
    /// passes.
    pub next_attempt_at: Option<DateTime<Utc>>,

    pub synced_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct MutationRecordRow {
    pub id: i64,
    pub client_mutation_id: String,
    pub entity_kind: String,
    pub entity_id: String,
    pub action: String,
    pub payload: String,
    pub base_version: i64,
    pub status: String,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub next_attempt_at: Option<String>,
    pub synced_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

fn parse_uuid(uuid_str: &str) -> DomainResult<Uuid> {
    Uuid::parse_str(uuid_str).map_err(|_| DomainError::InvalidUuid(uuid_str.to_string()))
}

fn parse_datetime(dt_str: &str, field_name: &str) -> DomainResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(dt_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| DomainError::InvalidTimestamp {
            field: field_name.to_string(),
            value: dt_str.to_string(),
        })
}

fn parse_optional_datetime(
    dt_str: Option<String>,
    field_name: &str,
) -> DomainResult<Option<DateTime<Utc>>> {
    dt_str.map(|s| parse_datetime(&s, field_name)).transpose()
}

impl TryFrom<MutationRecordRow> for MutationRecord {
    type Error = DomainError;
    fn try_from(row: MutationRecordRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            client_mutation_id: parse_uuid(&row.client_mutation_id)?,
            entity_kind: EntityKind::from_str(&row.entity_kind)?,
            entity_id: row.entity_id,
            action: MutationAction::from_str(&row.action)?,
            payload: serde_json::from_str(&row.payload)
                .map_err(|e| DomainError::Internal(format!("Invalid payload JSON: {}", e)))?,
            base_version: row.base_version,
            status: MutationStatus::from_str(&row.status)?,
            attempts: row.attempts,
            last_error: row.last_error,
            next_attempt_at: parse_optional_datetime(
                row.next_attempt_at,
                "mutation_queue.next_attempt_at",
            )?,
            synced_at: parse_optional_datetime(row.synced_at, "mutation_queue.synced_at")?,
            created_at: parse_datetime(&row.created_at, "mutation_queue.created_at")?,
            updated_at: parse_datetime(&row.updated_at, "mutation_queue.updated_at")?,
        })
    }
}

/// The body pushed to the remote service for one queued mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationPush {
    pub client_mutation_id: Uuid,
    pub entity_kind: EntityKind,
    pub entity_id: String,
    pub action: MutationAction,
    pub payload: serde_json::Value,
    pub base_version: i64,
}

impl MutationPush {
    pub fn from_record(record: &MutationRecord) -> Self {
        Self {
            client_mutation_id: record.client_mutation_id,
            entity_kind: record.entity_kind,
            entity_id: record.entity_id.clone(),
            action: record.action,
            payload: record.payload.clone(),
            base_version: record.base_version,
        }
    }
}

/// Remote verdict for one pushed mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PushStatus {
    /// Applied (or deduplicated as a no-op replay of the same
    /// client_mutation_id).
    Applied,
    /// The base version is stale; another station changed the entity first.
    Conflict,
    /// Permanent rejection, e.g. malformed payload. Never retried.
    Rejected,
}

/// Response from pushing one mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushResponse {
    pub status: PushStatus,
    /// Server-assigned id, present on applied creates.
    pub server_entity_id: Option<String>,
    /// Version after the mutation was applied.
    pub new_version: Option<i64>,
    /// Version the server currently holds, reported on conflicts.
    pub server_version: Option<i64>,
    pub message: Option<String>,
}

impl PushResponse {
    pub fn applied(server_entity_id: Option<String>, new_version: i64) -> Self {
        Self {
            status: PushStatus::Applied,
            server_entity_id,
            new_version: Some(new_version),
            server_version: None,
            message: None,
        }
    }

    pub fn conflict(server_version: i64) -> Self {
        Self {
            status: PushStatus::Conflict,
            server_entity_id: None,
            new_version: None,
            server_version: Some(server_version),
            message: None,
        }
    }

    pub fn rejected(message: &str) -> Self {
        Self {
            status: PushStatus::Rejected,
            server_entity_id: None,
            new_version: None,
            server_version: None,
            message: Some(message.to_string()),
        }
    }
}

/// Engine configuration.
///
/// All intervals are recognized options; the defaults match the deployed
/// station profile.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Base URL of the central service.
    pub api_base_url: String,
    /// How often to probe remote reachability.
    pub probe_interval: std::time::Duration,
    /// Per-probe timeout; anything slower counts as offline.
    pub probe_timeout: std::time::Duration,
    /// How often an idle engine attempts a drain.
    pub drain_interval: std::time::Duration,
    /// Per-push request timeout.
    pub request_timeout: std::time::Duration,
    /// Transient failures beyond this count dead-letter the record.
    pub max_attempts: i64,
    /// Exponential backoff base: delay = base * 2^attempts, capped.
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    /// Synced records older than this are purged from the queue.
    pub retention: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8080".to_string(),
            probe_interval: std::time::Duration::from_secs(10),
            probe_timeout: std::time::Duration::from_secs(4),
            drain_interval: std::time::Duration::from_secs(30),
            request_timeout: std::time::Duration::from_secs(30),
            max_attempts: 8,
            backoff_base: Duration::seconds(2),
            backoff_cap: Duration::seconds(300),
            retention: Duration::days(7),
        }
    }
}

impl SyncConfig {
    /// Backoff delay before the next attempt of a record that has already
    /// failed `attempts` times.
    pub fn backoff_delay(&self, attempts: i64) -> Duration {
        let exp = attempts.clamp(0, 30) as u32;
        let delay = self
            .backoff_base
            .checked_mul(2i32.saturating_pow(exp))
            .unwrap_or(self.backoff_cap);
        std::cmp::min(delay, self.backoff_cap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in [
            MutationStatus::Pending,
            MutationStatus::InFlight,
            MutationStatus::Synced,
            MutationStatus::Conflicted,
            MutationStatus::DeadLettered,
        ] {
            assert_eq!(MutationStatus::from_str(status.as_str()).unwrap(), status);
        }
        assert!(MutationStatus::from_str("shipped").is_err());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(MutationStatus::Synced.is_terminal());
        assert!(MutationStatus::DeadLettered.is_terminal());
        assert!(!MutationStatus::Conflicted.is_terminal());
        assert!(!MutationStatus::Pending.is_terminal());
    }

    #[test]
    fn test_backoff_delay_grows_and_caps() {
        let config = SyncConfig::default();
        assert_eq!(config.backoff_delay(0), Duration::seconds(2));
        assert_eq!(config.backoff_delay(1), Duration::seconds(4));
        assert_eq!(config.backoff_delay(3), Duration::seconds(16));
        assert_eq!(config.backoff_delay(20), Duration::seconds(300));
    }

    #[test]
    fn test_push_body_serializes_camel_case() {
        let push = MutationPush {
            client_mutation_id: Uuid::new_v4(),
            entity_kind: EntityKind::Patient,
            entity_id: "local-1".to_string(),
            action: MutationAction::Create,
            payload: serde_json::json!({"name": "A"}),
            base_version: 0,
        };
        let value = serde_json::to_value(&push).unwrap();
        assert!(value.get("clientMutationId").is_some());
        assert_eq!(value["entityKind"], "patient");
        assert_eq!(value["baseVersion"], 0);
    }
}
