//! Sink stage: upsert the enriched profile into the output table.
//!
//! Side-effecting, so it must stay safe under redelivery: the write is
//! keyed by record id and a retried attempt overwrites its own previous
//! row instead of duplicating it.

use crate::artifact::ArtifactStore;
use crate::finalize::EnrichedProfile;
use async_trait::async_trait;
use chrono::Utc;
use recordflow_orchestration::{ExecutorError, StageExecutor, StageInput, StageOutput};
use sqlx::SqlitePool;
use tracing::debug;

const SINK_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS enriched_records (
    record_id   TEXT PRIMARY KEY,
    name        TEXT NOT NULL,
    website     TEXT NOT NULL,
    profile     TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);
"#;

pub async fn init_sink_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(SINK_SCHEMA).execute(pool).await?;
    Ok(())
}

pub struct SinkStage {
    pool: SqlitePool,
    artifacts: ArtifactStore,
}

impl SinkStage {
    pub fn new(pool: SqlitePool, artifacts: ArtifactStore) -> Self {
        Self { pool, artifacts }
    }
}

#[async_trait]
impl StageExecutor for SinkStage {
    async fn execute(&self, input: StageInput) -> Result<StageOutput, ExecutorError> {
        let profile: EnrichedProfile =
            self.artifacts.read(input.upstream_ref("finalize")?).await?;
        let body = serde_json::to_string(&profile).map_err(ExecutorError::permanent)?;

        sqlx::query(
            r#"
            INSERT INTO enriched_records (record_id, name, website, profile, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(record_id) DO UPDATE SET
                name = excluded.name,
                website = excluded.website,
                profile = excluded.profile,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&input.record.record_id)
        .bind(&profile.name)
        .bind(&profile.website)
        .bind(&body)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(ExecutorError::transient)?;

        debug!(record_id = %input.record.record_id, "profile persisted");
        Ok(StageOutput::new(format!(
            "enriched_records/{}",
            input.record.record_id
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use recordflow_orchestration::{open_in_memory_db, Record};
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    async fn setup() -> (SqlitePool, ArtifactStore, TempDir) {
        let pool = open_in_memory_db().await.unwrap();
        init_sink_schema(&pool).await.unwrap();
        let dir = TempDir::new().unwrap();
        let artifacts = ArtifactStore::new(dir.path());
        (pool, artifacts, dir)
    }

    fn input(record_id: &str, finalize_ref: &str) -> StageInput {
        let mut upstream = HashMap::new();
        upstream.insert("finalize".to_string(), finalize_ref.to_string());
        StageInput {
            record: Arc::new(Record::new(record_id)),
            upstream,
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let (pool, artifacts, _dir) = setup().await;

        let finalize_ref = artifacts
            .write(
                "finalize",
                "d-1",
                &json!({
                    "name": "Sunny Days",
                    "website": "https://sunnydays.example",
                    "summary": "A daycare."
                }),
            )
            .await
            .unwrap();

        let stage = SinkStage::new(pool.clone(), artifacts);
        stage.execute(input("d-1", &finalize_ref)).await.unwrap();
        // Redelivery of the same unit must not duplicate the row.
        stage.execute(input("d-1", &finalize_ref)).await.unwrap();

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM enriched_records")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 1);

        let (name,): (String,) =
            sqlx::query_as("SELECT name FROM enriched_records WHERE record_id = ?1")
                .bind("d-1")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(name, "Sunny Days");
    }

    #[tokio::test]
    async fn test_missing_finalize_artifact_is_permanent() {
        let (pool, artifacts, _dir) = setup().await;
        let stage = SinkStage::new(pool, artifacts);

        let err = stage
            .execute(input("d-1", "finalize/absent.json"))
            .await
            .unwrap_err();
        assert!(err.is_permanent());
    }
}
