use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::errors::{DbError, DomainError, DomainResult};
use crate::domains::sync::types::{
    EntityKind, MutationAction, MutationRecord, MutationRecordRow, MutationStatus,
};

/// Durable, ordered, append-only log of pending local mutations.
///
/// All status transitions are atomic single-row updates guarded by the
/// current status, so re-applying a transition a record has already taken is
/// a no-op rather than an error. Only the sync engine mutates status.
#[async_trait]
pub trait MutationQueueRepository: Send + Sync {
    /// Record a local mutation as pending. Assigns the sequence id and the
    /// idempotency key; never touches the network. Storage failures are
    /// fatal to the caller.
    async fn enqueue(
        &self,
        entity_kind: EntityKind,
        entity_id: &str,
        action: MutationAction,
        payload: serde_json::Value,
        base_version: i64,
    ) -> DomainResult<MutationRecord>;

    /// All records still eligible for draining (pending or in-flight), in
    /// ascending id order. Conflicted records are excluded until they are
    /// externally resolved; terminal records never reappear.
    async fn pending_ordered(&self) -> DomainResult<Vec<MutationRecord>>;

    /// Fetch one record by queue id.
    async fn find_by_id(&self, id: i64) -> DomainResult<MutationRecord>;

    async fn mark_in_flight(&self, id: i64) -> DomainResult<()>;

    /// Confirmed by the remote service. For creates the server may have
    /// assigned a different entity id; the caller is responsible for
    /// remapping later-queued records via `remap_entity_id`.
    async fn mark_synced(
        &self,
        id: i64,
        new_entity_id: Option<&str>,
        new_version: Option<i64>,
    ) -> DomainResult<()>;

    /// Transient failure: back to pending with the attempt counted and the
    /// backoff gate recorded.
    async fn mark_retry(
        &self,
        id: i64,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> DomainResult<()>;

    async fn mark_conflicted(&self, id: i64, error: &str) -> DomainResult<()>;

    async fn mark_dead_lettered(&self, id: i64, error: &str) -> DomainResult<()>;

    /// Count of records requiring attention or transmission: pending,
    /// in-flight, and conflicted. Dead-lettered and synced records are not
    /// counted.
    async fn pending_count(&self) -> DomainResult<i64>;

    /// Crash recovery: any record left in-flight by a previous process run
    /// goes back to pending. Must run before the first drain.
    async fn reset_in_flight(&self) -> DomainResult<u64>;

    /// Rewrite the entity id on all non-terminal records for an entity whose
    /// temporary local id was replaced by a server-assigned id.
    async fn remap_entity_id(
        &self,
        entity_kind: EntityKind,
        old_id: &str,
        new_id: &str,
    ) -> DomainResult<u64>;

    /// Records awaiting an explicit operator or domain-layer decision.
    async fn conflicted(&self) -> DomainResult<Vec<MutationRecord>>;

    /// Records abandoned after exhausting their retry attempts.
    async fn dead_lettered(&self) -> DomainResult<Vec<MutationRecord>>;

    /// External conflict resolution: re-enqueue a conflicted record as a
    /// fresh pending record with an updated base version (and optionally a
    /// re-derived payload). The superseded record is closed out and no
    /// longer counted as pending.
    async fn resolve_conflict(
        &self,
        id: i64,
        new_base_version: i64,
        new_payload: Option<serde_json::Value>,
    ) -> DomainResult<MutationRecord>;

    /// Drop synced records older than the retention cutoff. Records that
    /// are pending, in-flight, or conflicted are never purged.
    async fn purge_synced(&self, cutoff: DateTime<Utc>) -> DomainResult<u64>;
}

/// SQLite implementation of the MutationQueueRepository
pub struct SqliteMutationQueueRepository {
    pool: SqlitePool,
}

impl SqliteMutationQueueRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Apply a guarded transition; rows_affected == 0 means either the
    /// record does not exist (error) or the guard rejected it (no-op).
    async fn guarded_update(&self, id: i64, sql: &str, binds: Vec<String>) -> DomainResult<()> {
        let mut query = sqlx::query(sql);
        for bind in &binds {
            query = query.bind(bind);
        }
        let result = query
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(DbError::from)?;

        if result.rows_affected() == 0 {
            let exists: Option<(i64,)> =
                sqlx::query_as("SELECT id FROM mutation_queue WHERE id = ?")
                    .bind(id)
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(DbError::from)?;
            if exists.is_none() {
                return Err(DomainError::RecordNotFound(id));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl MutationQueueRepository for SqliteMutationQueueRepository {
    async fn enqueue(
        &self,
        entity_kind: EntityKind,
        entity_id: &str,
        action: MutationAction,
        payload: serde_json::Value,
        base_version: i64,
    ) -> DomainResult<MutationRecord> {
        let client_mutation_id = Uuid::new_v4();
        let now = Utc::now().to_rfc3339();
        let payload_str = payload.to_string();

        let result = sqlx::query(
            "INSERT INTO mutation_queue \
             (client_mutation_id, entity_kind, entity_id, action, payload, base_version, \
              status, attempts, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, 'pending', 0, ?, ?)",
        )
        .bind(client_mutation_id.to_string())
        .bind(entity_kind.as_str())
        .bind(entity_id)
        .bind(action.as_str())
        .bind(&payload_str)
        .bind(base_version)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(DbError::from)?;

        self.find_by_id(result.last_insert_rowid()).await
    }

    async fn pending_ordered(&self) -> DomainResult<Vec<MutationRecord>> {
        let rows: Vec<MutationRecordRow> = sqlx::query_as(
            "SELECT * FROM mutation_queue \
             WHERE status IN ('pending', 'in_flight') \
             ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::from)?;

        rows.into_iter().map(MutationRecord::try_from).collect()
    }

    async fn find_by_id(&self, id: i64) -> DomainResult<MutationRecord> {
        let row: Option<MutationRecordRow> =
            sqlx::query_as("SELECT * FROM mutation_queue WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(DbError::from)?;

        row.ok_or(DomainError::RecordNotFound(id))?.try_into()
    }

    async fn mark_in_flight(&self, id: i64) -> DomainResult<()> {
        self.guarded_update(
            id,
            "UPDATE mutation_queue \
             SET status = 'in_flight', updated_at = ? \
             WHERE status IN ('pending', 'in_flight') AND id = ?",
            vec![Utc::now().to_rfc3339()],
        )
        .await
    }

    async fn mark_synced(
        &self,
        id: i64,
        new_entity_id: Option<&str>,
        new_version: Option<i64>,
    ) -> DomainResult<()> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            "UPDATE mutation_queue \
             SET status = 'synced', \
                 entity_id = COALESCE(?, entity_id), \
                 base_version = COALESCE(?, base_version), \
                 last_error = NULL, \
                 next_attempt_at = NULL, \
                 synced_at = ?, \
                 updated_at = ? \
             WHERE status IN ('in_flight', 'synced') AND id = ?",
        )
        .bind(new_entity_id)
        .bind(new_version)
        .bind(&now)
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(DbError::from)?;

        if result.rows_affected() == 0 {
            self.find_by_id(id).await?;
        }
        Ok(())
    }

    async fn mark_retry(
        &self,
        id: i64,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> DomainResult<()> {
        self.guarded_update(
            id,
            "UPDATE mutation_queue \
             SET status = 'pending', \
                 attempts = attempts + 1, \
                 last_error = ?, \
                 next_attempt_at = ?, \
                 updated_at = ? \
             WHERE status = 'in_flight' AND id = ?",
            vec![
                error.to_string(),
                next_attempt_at.to_rfc3339(),
                Utc::now().to_rfc3339(),
            ],
        )
        .await
    }

    async fn mark_conflicted(&self, id: i64, error: &str) -> DomainResult<()> {
        self.guarded_update(
            id,
            "UPDATE mutation_queue \
             SET status = 'conflicted', last_error = ?, updated_at = ? \
             WHERE status IN ('in_flight', 'conflicted') AND id = ?",
            vec![error.to_string(), Utc::now().to_rfc3339()],
        )
        .await
    }

    async fn mark_dead_lettered(&self, id: i64, error: &str) -> DomainResult<()> {
        self.guarded_update(
            id,
            "UPDATE mutation_queue \
             SET status = 'dead_lettered', last_error = ?, updated_at = ? \
             WHERE status IN ('pending', 'in_flight', 'dead_lettered') AND id = ?",
            vec![error.to_string(), Utc::now().to_rfc3339()],
        )
        .await
    }

    async fn pending_count(&self) -> DomainResult<i64> {
        let count: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM mutation_queue \
             WHERE status IN ('pending', 'in_flight', 'conflicted')",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(DbError::from)?;

        Ok(count.0)
    }

    async fn reset_in_flight(&self) -> DomainResult<u64> {
        let result = sqlx::query(
            "UPDATE mutation_queue \
             SET status = 'pending', updated_at = ? \
             WHERE status = 'in_flight'",
        )
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(DbError::from)?;

        if result.rows_affected() > 0 {
            log::warn!(
                "Recovered {} in-flight mutations from a previous run",
                result.rows_affected()
            );
        }
        Ok(result.rows_affected())
    }

    async fn remap_entity_id(
        &self,
        entity_kind: EntityKind,
        old_id: &str,
        new_id: &str,
    ) -> DomainResult<u64> {
        let result = sqlx::query(
            "UPDATE mutation_queue \
             SET entity_id = ?, updated_at = ? \
             WHERE entity_kind = ? AND entity_id = ? \
               AND status IN ('pending', 'in_flight', 'conflicted')",
        )
        .bind(new_id)
        .bind(Utc::now().to_rfc3339())
        .bind(entity_kind.as_str())
        .bind(old_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::from)?;

        if result.rows_affected() > 0 {
            log::info!(
                "Remapped {} queued {} mutations from {} to {}",
                result.rows_affected(),
                entity_kind.as_str(),
                old_id,
                new_id
            );
        }
        Ok(result.rows_affected())
    }

    async fn conflicted(&self) -> DomainResult<Vec<MutationRecord>> {
        let rows: Vec<MutationRecordRow> = sqlx::query_as(
            "SELECT * FROM mutation_queue WHERE status = 'conflicted' ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::from)?;

        rows.into_iter().map(MutationRecord::try_from).collect()
    }

    async fn dead_lettered(&self) -> DomainResult<Vec<MutationRecord>> {
        let rows: Vec<MutationRecordRow> = sqlx::query_as(
            "SELECT * FROM mutation_queue WHERE status = 'dead_lettered' ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::from)?;

        rows.into_iter().map(MutationRecord::try_from).collect()
    }

    async fn resolve_conflict(
        &self,
        id: i64,
        new_base_version: i64,
        new_payload: Option<serde_json::Value>,
    ) -> DomainResult<MutationRecord> {
        let old = self.find_by_id(id).await?;
        if old.status != MutationStatus::Conflicted {
            return Err(DomainError::Internal(format!(
                "Record {} is {} and cannot be resolved",
                id,
                old.status.as_str()
            )));
        }

        let fresh_id = Uuid::new_v4();
        let now = Utc::now().to_rfc3339();
        let payload = new_payload.unwrap_or_else(|| old.payload.clone()).to_string();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| DbError::Transaction(e.to_string()))?;

        // A fresh record with a fresh idempotency key; the old key is never
        // reused.
        let result = sqlx::query(
            "INSERT INTO mutation_queue \
             (client_mutation_id, entity_kind, entity_id, action, payload, base_version, \
              status, attempts, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, 'pending', 0, ?, ?)",
        )
        .bind(fresh_id.to_string())
        .bind(old.entity_kind.as_str())
        .bind(&old.entity_id)
        .bind(old.action.as_str())
        .bind(&payload)
        .bind(new_base_version)
        .bind(&now)
        .bind(&now)
        .execute(&mut *tx)
        .await
        .map_err(DbError::from)?;

        sqlx::query(
            "UPDATE mutation_queue \
             SET status = 'dead_lettered', last_error = ?, updated_at = ? \
             WHERE id = ? AND status = 'conflicted'",
        )
        .bind(format!("superseded by resolution, see record {}", result.last_insert_rowid()))
        .bind(&now)
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(DbError::from)?;

        let new_row_id = result.last_insert_rowid();
        tx.commit()
            .await
            .map_err(|e| DbError::Transaction(e.to_string()))?;

        self.find_by_id(new_row_id).await
    }

    async fn purge_synced(&self, cutoff: DateTime<Utc>) -> DomainResult<u64> {
        let result = sqlx::query(
            "DELETE FROM mutation_queue WHERE status = 'synced' AND synced_at < ?",
        )
        .bind(cutoff.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(DbError::from)?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::init_db;
    use serde_json::json;

    async fn repo() -> SqliteMutationQueueRepository {
        let pool = init_db("sqlite::memory:").await.unwrap();
        SqliteMutationQueueRepository::new(pool)
    }

    #[tokio::test]
    async fn test_enqueue_assigns_sequence_and_key() {
        let repo = repo().await;
        let a = repo
            .enqueue(EntityKind::Patient, "p-1", MutationAction::Create, json!({"name": "A"}), 0)
            .await
            .unwrap();
        let b = repo
            .enqueue(EntityKind::Patient, "p-1", MutationAction::Update, json!({"name": "B"}), 1)
            .await
            .unwrap();

        assert!(b.id > a.id);
        assert_ne!(a.client_mutation_id, b.client_mutation_id);
        assert_eq!(a.status, MutationStatus::Pending);
        assert_eq!(a.attempts, 0);
        assert_eq!(repo.pending_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_pending_ordered_is_ascending_and_skips_terminal() {
        let repo = repo().await;
        let a = repo
            .enqueue(EntityKind::Order, "o-1", MutationAction::Create, json!({}), 0)
            .await
            .unwrap();
        let b = repo
            .enqueue(EntityKind::Order, "o-2", MutationAction::Create, json!({}), 0)
            .await
            .unwrap();
        let c = repo
            .enqueue(EntityKind::Order, "o-1", MutationAction::Update, json!({}), 1)
            .await
            .unwrap();

        repo.mark_in_flight(a.id).await.unwrap();
        repo.mark_synced(a.id, None, Some(1)).await.unwrap();

        let pending = repo.pending_ordered().await.unwrap();
        let ids: Vec<i64> = pending.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![b.id, c.id]);
    }

    #[tokio::test]
    async fn test_conflicted_excluded_from_pending_ordered_but_counted() {
        let repo = repo().await;
        let a = repo
            .enqueue(EntityKind::Result, "r-1", MutationAction::Update, json!({}), 3)
            .await
            .unwrap();

        repo.mark_in_flight(a.id).await.unwrap();
        repo.mark_conflicted(a.id, "stale base version").await.unwrap();

        assert!(repo.pending_ordered().await.unwrap().is_empty());
        assert_eq!(repo.pending_count().await.unwrap(), 1);
        assert_eq!(repo.conflicted().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_transitions_are_idempotent() {
        let repo = repo().await;
        let a = repo
            .enqueue(EntityKind::Patient, "p-1", MutationAction::Create, json!({}), 0)
            .await
            .unwrap();

        repo.mark_in_flight(a.id).await.unwrap();
        repo.mark_in_flight(a.id).await.unwrap();
        repo.mark_synced(a.id, Some("server-1"), Some(1)).await.unwrap();
        // Re-applying synced is a no-op, as is a late retry against a
        // terminal record.
        repo.mark_synced(a.id, Some("server-1"), Some(1)).await.unwrap();
        repo.mark_retry(a.id, "late timeout", Utc::now()).await.unwrap();

        let record = repo.find_by_id(a.id).await.unwrap();
        assert_eq!(record.status, MutationStatus::Synced);
        assert_eq!(record.entity_id, "server-1");
        assert_eq!(record.attempts, 0);
        assert!(record.last_error.is_none());
    }

    #[tokio::test]
    async fn test_transition_on_missing_record_errors() {
        let repo = repo().await;
        assert!(matches!(
            repo.mark_in_flight(99).await,
            Err(DomainError::RecordNotFound(99))
        ));
    }

    #[tokio::test]
    async fn test_mark_retry_counts_attempts_and_gates() {
        let repo = repo().await;
        let a = repo
            .enqueue(EntityKind::Order, "o-1", MutationAction::Create, json!({}), 0)
            .await
            .unwrap();

        let gate = Utc::now() + chrono::Duration::seconds(60);
        repo.mark_in_flight(a.id).await.unwrap();
        repo.mark_retry(a.id, "connection refused", gate).await.unwrap();

        let record = repo.find_by_id(a.id).await.unwrap();
        assert_eq!(record.status, MutationStatus::Pending);
        assert_eq!(record.attempts, 1);
        assert_eq!(record.last_error.as_deref(), Some("connection refused"));
        assert!(record.next_attempt_at.unwrap() > Utc::now());
    }

    #[tokio::test]
    async fn test_reset_in_flight_recovers_crashed_records() {
        let repo = repo().await;
        let a = repo
            .enqueue(EntityKind::Patient, "p-1", MutationAction::Create, json!({}), 0)
            .await
            .unwrap();
        let b = repo
            .enqueue(EntityKind::Patient, "p-2", MutationAction::Create, json!({}), 0)
            .await
            .unwrap();
        repo.mark_in_flight(a.id).await.unwrap();
        repo.mark_in_flight(b.id).await.unwrap();
        repo.mark_synced(b.id, None, Some(1)).await.unwrap();

        assert_eq!(repo.reset_in_flight().await.unwrap(), 1);
        assert_eq!(
            repo.find_by_id(a.id).await.unwrap().status,
            MutationStatus::Pending
        );
        // Confirmed records are untouched by recovery.
        assert_eq!(
            repo.find_by_id(b.id).await.unwrap().status,
            MutationStatus::Synced
        );
    }

    #[tokio::test]
    async fn test_remap_entity_id_touches_only_live_records() {
        let repo = repo().await;
        let create = repo
            .enqueue(EntityKind::Patient, "local-1", MutationAction::Create, json!({}), 0)
            .await
            .unwrap();
        let update = repo
            .enqueue(EntityKind::Patient, "local-1", MutationAction::Update, json!({}), 0)
            .await
            .unwrap();
        let other = repo
            .enqueue(EntityKind::Order, "local-1", MutationAction::Create, json!({}), 0)
            .await
            .unwrap();

        repo.mark_in_flight(create.id).await.unwrap();
        repo.mark_synced(create.id, Some("server-9"), Some(1)).await.unwrap();

        let touched = repo
            .remap_entity_id(EntityKind::Patient, "local-1", "server-9")
            .await
            .unwrap();
        assert_eq!(touched, 1);
        assert_eq!(repo.find_by_id(update.id).await.unwrap().entity_id, "server-9");
        // Same temporary id under a different kind is a different entity.
        assert_eq!(repo.find_by_id(other.id).await.unwrap().entity_id, "local-1");
    }

    #[tokio::test]
    async fn test_resolve_conflict_re_enqueues_fresh_record() {
        let repo = repo().await;
        let a = repo
            .enqueue(EntityKind::Result, "r-1", MutationAction::Update, json!({"valor": "7"}), 3)
            .await
            .unwrap();
        repo.mark_in_flight(a.id).await.unwrap();
        repo.mark_conflicted(a.id, "expected 3, server has 4").await.unwrap();

        let fresh = repo.resolve_conflict(a.id, 4, None).await.unwrap();
        assert!(fresh.id > a.id);
        assert_ne!(fresh.client_mutation_id, a.client_mutation_id);
        assert_eq!(fresh.base_version, 4);
        assert_eq!(fresh.status, MutationStatus::Pending);
        assert_eq!(fresh.payload, json!({"valor": "7"}));

        let old = repo.find_by_id(a.id).await.unwrap();
        assert_eq!(old.status, MutationStatus::DeadLettered);
        assert_eq!(repo.pending_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_resolve_conflict_rejects_non_conflicted() {
        let repo = repo().await;
        let a = repo
            .enqueue(EntityKind::Result, "r-1", MutationAction::Update, json!({}), 3)
            .await
            .unwrap();
        assert!(repo.resolve_conflict(a.id, 4, None).await.is_err());
    }

    #[tokio::test]
    async fn test_queue_survives_reopening_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let db_url = format!("sqlite://{}?mode=rwc", dir.path().join("station.db").display());

        let record_id = {
            let pool = init_db(&db_url).await.unwrap();
            let repo = SqliteMutationQueueRepository::new(pool.clone());
            let record = repo
                .enqueue(EntityKind::Patient, "p-1", MutationAction::Create, json!({"name": "A"}), 0)
                .await
                .unwrap();
            repo.mark_in_flight(record.id).await.unwrap();
            pool.close().await;
            record.id
        };

        // A new process run sees the record and recovers it to pending.
        let pool = init_db(&db_url).await.unwrap();
        let repo = SqliteMutationQueueRepository::new(pool);
        assert_eq!(repo.reset_in_flight().await.unwrap(), 1);
        let record = repo.find_by_id(record_id).await.unwrap();
        assert_eq!(record.status, MutationStatus::Pending);
        assert_eq!(record.payload, json!({"name": "A"}));
    }

    #[tokio::test]
    async fn test_purge_synced_respects_retention_and_status() {
        let repo = repo().await;
        let synced = repo
            .enqueue(EntityKind::Patient, "p-1", MutationAction::Create, json!({}), 0)
            .await
            .unwrap();
        let pending = repo
            .enqueue(EntityKind::Patient, "p-2", MutationAction::Create, json!({}), 0)
            .await
            .unwrap();
        repo.mark_in_flight(synced.id).await.unwrap();
        repo.mark_synced(synced.id, None, Some(1)).await.unwrap();

        // Cutoff in the past: nothing is old enough yet.
        let purged = repo
            .purge_synced(Utc::now() - chrono::Duration::days(7))
            .await
            .unwrap();
        assert_eq!(purged, 0);

        // Cutoff in the future: the synced record goes, the pending one
        // stays.
        let purged = repo
            .purge_synced(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(purged, 1);
        assert!(repo.find_by_id(pending.id).await.is_ok());
        assert!(matches!(
            repo.find_by_id(synced.id).await,
            Err(DomainError::RecordNotFound(_))
        ));
    }
}
