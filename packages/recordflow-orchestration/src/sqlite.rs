//! SQLite backends for the state ledger and the dedup index.
//!
//! The `stage_states` table keyed by (record_id, stage) is the resumable
//! checkpoint: it survives process restarts and is the sole input to crash
//! recovery. Queries use the runtime API so no database is needed at build
//! time.

use crate::dedup::{DedupEntry, DedupIndex, PublishOutcome};
use crate::error::{PipelineError, Result};
use crate::stage::BackoffPolicy;
use crate::state::{ErrorKind, StageError, StageState, StageStatus, StateStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Executor, Row, SqlitePool};
use std::path::Path;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS stage_states (
    record_id     TEXT NOT NULL,
    stage         TEXT NOT NULL,
    status        TEXT NOT NULL,
    attempt_count INTEGER NOT NULL DEFAULT 0,
    error_kind    TEXT,
    error_message TEXT,
    output_ref    TEXT,
    next_retry_at TEXT,
    updated_at    TEXT NOT NULL,
    PRIMARY KEY (record_id, stage)
);

CREATE TABLE IF NOT EXISTS dedup_entries (
    fingerprint      TEXT PRIMARY KEY,
    output_ref       TEXT NOT NULL,
    source_record_id TEXT NOT NULL,
    created_at       TEXT NOT NULL
);
"#;

/// Open (creating if missing) the pipeline database and bootstrap the schema.
pub async fn open_pipeline_db(path: &Path) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;
    init_schema(&pool).await?;
    Ok(pool)
}

/// In-memory database for tests. Single connection: each SQLite in-memory
/// connection is its own database.
pub async fn open_in_memory_db() -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await?;
    init_schema(&pool).await?;
    Ok(pool)
}

pub async fn init_schema(pool: &SqlitePool) -> Result<()> {
    pool.execute(SCHEMA).await?;
    Ok(())
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(PipelineError::parse)
}

fn state_from_row(row: &SqliteRow) -> Result<StageState> {
    let status: String = row.try_get("status")?;
    let error_kind: Option<String> = row.try_get("error_kind")?;
    let error_message: Option<String> = row.try_get("error_message")?;
    let next_retry_at: Option<String> = row.try_get("next_retry_at")?;
    let updated_at: String = row.try_get("updated_at")?;

    let last_error = match (error_kind, error_message) {
        (Some(kind), Some(message)) => Some(StageError {
            kind: ErrorKind::parse(&kind)?,
            message,
        }),
        _ => None,
    };

    Ok(StageState {
        record_id: row.try_get("record_id")?,
        stage: row.try_get("stage")?,
        status: StageStatus::parse(&status)?,
        attempt_count: row.try_get::<i64, _>("attempt_count")? as u32,
        last_error,
        output_ref: row.try_get("output_ref")?,
        next_retry_at: next_retry_at.as_deref().map(parse_timestamp).transpose()?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

/// Durable state ledger backed by SQLite.
#[derive(Clone)]
pub struct SqliteStateStore {
    pool: SqlitePool,
}

impl SqliteStateStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn get(&self, record_id: &str, stage: &str) -> Result<Option<StageState>> {
        let row = sqlx::query("SELECT * FROM stage_states WHERE record_id = ? AND stage = ?")
            .bind(record_id)
            .bind(stage)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(state_from_row).transpose()
    }

    async fn load_all(&self) -> Result<Vec<StageState>> {
        let rows = sqlx::query("SELECT * FROM stage_states")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(state_from_row).collect()
    }

    async fn create_pending(&self, record_id: &str, stage: &str) -> Result<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO stage_states (record_id, stage, status, attempt_count, updated_at) \
             VALUES (?, ?, 'pending', 0, ?)",
        )
        .bind(record_id)
        .bind(stage)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn try_claim(&self, record_id: &str, stage: &str) -> Result<bool> {
        // Single UPDATE guarded on status: the compare-and-set that prevents
        // double execution under concurrency.
        let result = sqlx::query(
            "UPDATE stage_states \
             SET status = 'running', attempt_count = attempt_count + 1, \
                 next_retry_at = NULL, updated_at = ? \
             WHERE record_id = ? AND stage = ? AND status = 'pending'",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(record_id)
        .bind(stage)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_succeeded(&self, record_id: &str, stage: &str, output_ref: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE stage_states \
             SET status = 'succeeded', output_ref = ?, error_kind = NULL, \
                 error_message = NULL, next_retry_at = NULL, updated_at = ? \
             WHERE record_id = ? AND stage = ? AND status = 'running'",
        )
        .bind(output_ref)
        .bind(Utc::now().to_rfc3339())
        .bind(record_id)
        .bind(stage)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            Ok(())
        } else {
            Err(self
                .transition_error(record_id, stage, StageStatus::Succeeded)
                .await)
        }
    }

    async fn mark_failed(
        &self,
        record_id: &str,
        stage: &str,
        error: &StageError,
        permanent: bool,
        max_attempts: u32,
        backoff: BackoffPolicy,
    ) -> Result<StageStatus> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT attempt_count FROM stage_states \
             WHERE record_id = ? AND stage = ? AND status = 'running'",
        )
        .bind(record_id)
        .bind(stage)
        .fetch_optional(&mut *tx)
        .await?;

        let attempt_count = match row {
            Some(row) => row.try_get::<i64, _>("attempt_count")? as u32,
            None => {
                tx.rollback().await?;
                return Err(self
                    .transition_error(record_id, stage, StageStatus::Failed)
                    .await);
            }
        };

        let exhausted = permanent || attempt_count >= max_attempts;
        let (status, next_retry_at) = if exhausted {
            (StageStatus::Failed, None)
        } else {
            let delay = chrono::Duration::from_std(backoff.delay_for(attempt_count))
                .unwrap_or(chrono::Duration::zero());
            (StageStatus::Pending, Some((Utc::now() + delay).to_rfc3339()))
        };

        sqlx::query(
            "UPDATE stage_states \
             SET status = ?, error_kind = ?, error_message = ?, next_retry_at = ?, updated_at = ? \
             WHERE record_id = ? AND stage = ?",
        )
        .bind(status.as_str())
        .bind(error.kind.as_str())
        .bind(&error.message)
        .bind(next_retry_at)
        .bind(Utc::now().to_rfc3339())
        .bind(record_id)
        .bind(stage)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(status)
    }

    async fn mark_skipped(&self, record_id: &str, stage: &str, error: &StageError) -> Result<()> {
        let result = sqlx::query(
            "INSERT INTO stage_states \
                 (record_id, stage, status, attempt_count, error_kind, error_message, updated_at) \
             VALUES (?, ?, 'skipped', 0, ?, ?, ?) \
             ON CONFLICT (record_id, stage) DO UPDATE SET \
                 status = 'skipped', error_kind = excluded.error_kind, \
                 error_message = excluded.error_message, next_retry_at = NULL, \
                 updated_at = excluded.updated_at \
             WHERE stage_states.status = 'pending'",
        )
        .bind(record_id)
        .bind(stage)
        .bind(error.kind.as_str())
        .bind(&error.message)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 1 {
            return Ok(());
        }

        // Zero rows means the guarded upsert hit a non-pending row: a repeat
        // skip is fine, anything else is a transition violation.
        match self.get(record_id, stage).await? {
            Some(state) if state.status == StageStatus::Skipped => Ok(()),
            _ => Err(self
                .transition_error(record_id, stage, StageStatus::Skipped)
                .await),
        }
    }

    async fn reset_running_to_pending(&self) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE stage_states SET status = 'pending', updated_at = ? WHERE status = 'running'",
        )
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

impl SqliteStateStore {
    async fn transition_error(
        &self,
        record_id: &str,
        stage: &str,
        to: StageStatus,
    ) -> PipelineError {
        let from = match self.get(record_id, stage).await {
            Ok(Some(state)) => state.status.as_str().to_string(),
            Ok(None) => "absent".to_string(),
            Err(e) => return e,
        };
        PipelineError::InvalidTransition {
            record_id: record_id.to_string(),
            stage: stage.to_string(),
            from,
            to: to.as_str().to_string(),
        }
    }
}

/// Durable dedup index backed by the same database.
#[derive(Clone)]
pub struct SqliteDedupIndex {
    pool: SqlitePool,
}

impl SqliteDedupIndex {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DedupIndex for SqliteDedupIndex {
    async fn lookup(&self, fingerprint: &str) -> Result<Option<DedupEntry>> {
        let row = sqlx::query(
            "SELECT fingerprint, output_ref, source_record_id \
             FROM dedup_entries WHERE fingerprint = ?",
        )
        .bind(fingerprint)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| DedupEntry {
            fingerprint: row.get("fingerprint"),
            output_ref: row.get("output_ref"),
            source_record_id: row.get("source_record_id"),
        }))
    }

    async fn publish(&self, entry: DedupEntry) -> Result<PublishOutcome> {
        // INSERT OR IGNORE resolves concurrent publishes: the first committed
        // write is canonical, later ones adopt it.
        let result = sqlx::query(
            "INSERT OR IGNORE INTO dedup_entries \
                 (fingerprint, output_ref, source_record_id, created_at) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(&entry.fingerprint)
        .bind(&entry.output_ref)
        .bind(&entry.source_record_id)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(PublishOutcome::Published);
        }

        match self.lookup(&entry.fingerprint).await? {
            Some(canonical) => Ok(PublishOutcome::AlreadyPublished(canonical)),
            None => Err(PipelineError::parse(format!(
                "dedup entry vanished for fingerprint {}",
                entry.fingerprint
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn store() -> SqliteStateStore {
        SqliteStateStore::new(open_in_memory_db().await.unwrap())
    }

    #[tokio::test]
    async fn test_claim_cas_semantics() {
        let store = store().await;
        store.create_pending("d-1", "scrape").await.unwrap();

        assert!(store.try_claim("d-1", "scrape").await.unwrap());
        assert!(!store.try_claim("d-1", "scrape").await.unwrap());

        let state = store.get("d-1", "scrape").await.unwrap().unwrap();
        assert_eq!(state.status, StageStatus::Running);
        assert_eq!(state.attempt_count, 1);
    }

    #[tokio::test]
    async fn test_succeeded_roundtrip() {
        let store = store().await;
        store.create_pending("d-1", "scrape").await.unwrap();
        store.try_claim("d-1", "scrape").await.unwrap();
        store
            .mark_succeeded("d-1", "scrape", "artifacts/d-1/scrape.json")
            .await
            .unwrap();

        let state = store.get("d-1", "scrape").await.unwrap().unwrap();
        assert_eq!(state.status, StageStatus::Succeeded);
        assert_eq!(
            state.output_ref.as_deref(),
            Some("artifacts/d-1/scrape.json")
        );
        assert!(state.last_error.is_none());
    }

    #[tokio::test]
    async fn test_failed_retry_then_exhaustion() {
        let store = store().await;
        let backoff = BackoffPolicy::new(Duration::from_millis(10));
        store.create_pending("d-1", "places").await.unwrap();

        store.try_claim("d-1", "places").await.unwrap();
        let status = store
            .mark_failed(
                "d-1",
                "places",
                &StageError::transient("http 503"),
                false,
                2,
                backoff,
            )
            .await
            .unwrap();
        assert_eq!(status, StageStatus::Pending);

        let state = store.get("d-1", "places").await.unwrap().unwrap();
        assert!(state.next_retry_at.is_some());

        store.try_claim("d-1", "places").await.unwrap();
        let status = store
            .mark_failed(
                "d-1",
                "places",
                &StageError::transient("http 503"),
                false,
                2,
                backoff,
            )
            .await
            .unwrap();
        assert_eq!(status, StageStatus::Failed);

        let state = store.get("d-1", "places").await.unwrap().unwrap();
        assert_eq!(state.attempt_count, 2);
        assert_eq!(state.last_error.unwrap().message, "http 503");
    }

    #[tokio::test]
    async fn test_crash_recovery_reset() {
        let store = store().await;
        store.create_pending("d-1", "scrape").await.unwrap();
        store.create_pending("d-2", "scrape").await.unwrap();
        store.try_claim("d-1", "scrape").await.unwrap();
        store.try_claim("d-2", "scrape").await.unwrap();
        store
            .mark_succeeded("d-2", "scrape", "artifact")
            .await
            .unwrap();

        let reset = store.reset_running_to_pending().await.unwrap();
        assert_eq!(reset, 1);

        // Completed work is never touched by recovery.
        let done = store.get("d-2", "scrape").await.unwrap().unwrap();
        assert_eq!(done.status, StageStatus::Succeeded);

        let recovered = store.get("d-1", "scrape").await.unwrap().unwrap();
        assert_eq!(recovered.status, StageStatus::Pending);
        assert_eq!(recovered.attempt_count, 1);
    }

    #[tokio::test]
    async fn test_mark_skipped_never_downgrades_terminal() {
        let store = store().await;
        store.create_pending("d-1", "final").await.unwrap();
        store.try_claim("d-1", "final").await.unwrap();
        store.mark_succeeded("d-1", "final", "ref").await.unwrap();

        let result = store
            .mark_skipped("d-1", "final", &StageError::dependency("places"))
            .await;
        assert!(matches!(
            result,
            Err(PipelineError::InvalidTransition { .. })
        ));

        let state = store.get("d-1", "final").await.unwrap().unwrap();
        assert_eq!(state.status, StageStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_dedup_publish_first_wins() {
        let pool = open_in_memory_db().await.unwrap();
        let index = SqliteDedupIndex::new(pool);

        let first = index
            .publish(DedupEntry::new("example.com", "artifact-1", "d-1"))
            .await
            .unwrap();
        assert_eq!(first, PublishOutcome::Published);

        let second = index
            .publish(DedupEntry::new("example.com", "artifact-2", "d-2"))
            .await
            .unwrap();
        match second {
            PublishOutcome::AlreadyPublished(canonical) => {
                assert_eq!(canonical.output_ref, "artifact-1")
            }
            other => panic!("Expected AlreadyPublished, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_load_all_roundtrips_fields() {
        let store = store().await;
        store.create_pending("d-1", "scrape").await.unwrap();
        store.try_claim("d-1", "scrape").await.unwrap();
        store
            .mark_failed(
                "d-1",
                "scrape",
                &StageError::transient("timeout"),
                false,
                3,
                BackoffPolicy::new(Duration::from_secs(1)),
            )
            .await
            .unwrap();

        let all = store.load_all().await.unwrap();
        assert_eq!(all.len(), 1);
        let state = &all[0];
        assert_eq!(state.record_id, "d-1");
        assert_eq!(state.stage, "scrape");
        assert_eq!(state.status, StageStatus::Pending);
        assert_eq!(state.last_error.as_ref().unwrap().kind, ErrorKind::Transient);
        assert!(state.next_retry_at.is_some());
    }
}
