//! Execution of one (record, stage) unit.
//!
//! A worker owns the whole attempt: dedup lookup, claim, upstream output
//! resolution, rate-limited executor invocation under the stage deadline,
//! outcome classification and the ledger write. Failures here are contained;
//! only store/configuration errors propagate to the run controller.

use crate::cost::CostTracker;
use crate::dedup::{DedupEntry, DedupIndex, PublishOutcome};
use crate::error::{PipelineError, Result};
use crate::executor::{ExecutorError, StageExecutor, StageInput};
use crate::limiter::RateLimiterSet;
use crate::record::Record;
use crate::scheduler::UnitKey;
use crate::stage::StageRegistry;
use crate::state::{StageError, StageStatus, StateStore};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Shared handles for unit execution.
pub(crate) struct WorkerContext {
    pub registry: Arc<StageRegistry>,
    pub store: Arc<dyn StateStore>,
    pub dedup: Arc<dyn DedupIndex>,
    pub limiters: Arc<RateLimiterSet>,
    pub executors: HashMap<String, Arc<dyn StageExecutor>>,
    pub costs: Arc<CostTracker>,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UnitDisposition {
    Succeeded,
    /// Transient failure with attempt budget remaining.
    Retrying,
    Failed,
    /// Another worker already claimed the unit.
    LostClaim,
}

pub(crate) async fn execute_unit(
    ctx: Arc<WorkerContext>,
    record: Arc<Record>,
    unit: UnitKey,
) -> Result<UnitDisposition> {
    let definition = ctx
        .registry
        .get(&unit.stage)
        .ok_or_else(|| PipelineError::UnknownStage(unit.stage.clone()))?;
    let executor = ctx
        .executors
        .get(&unit.stage)
        .ok_or_else(|| PipelineError::MissingExecutor(unit.stage.clone()))?
        .clone();

    let fingerprint = definition
        .dedup_key
        .as_ref()
        .and_then(|extract| extract(&record));

    // Records sharing an already-published fingerprint adopt the canonical
    // artifact without any external execution.
    if let Some(fp) = &fingerprint {
        if let Some(canonical) = ctx.dedup.lookup(fp).await? {
            if !ctx.store.try_claim(&unit.record_id, &unit.stage).await? {
                return Ok(UnitDisposition::LostClaim);
            }
            debug!(
                record_id = %unit.record_id,
                stage = %unit.stage,
                fingerprint = %fp,
                source = %canonical.source_record_id,
                "dedup hit, adopting canonical output"
            );
            ctx.store
                .mark_succeeded(&unit.record_id, &unit.stage, &canonical.output_ref)
                .await?;
            return Ok(UnitDisposition::Succeeded);
        }
    }

    if !ctx.store.try_claim(&unit.record_id, &unit.stage).await? {
        return Ok(UnitDisposition::LostClaim);
    }

    // Resolve upstream outputs before invocation; the scheduler guaranteed
    // the dependencies succeeded, so a hole here is a permanent failure.
    let mut upstream = HashMap::new();
    for dep in &definition.depends_on {
        match ctx.store.get(&unit.record_id, dep).await? {
            Some(state) if state.output_ref.is_some() => {
                upstream.insert(dep.clone(), state.output_ref.unwrap_or_default());
            }
            _ => {
                warn!(
                    record_id = %unit.record_id,
                    stage = %unit.stage,
                    dependency = %dep,
                    "upstream output missing for claimed unit"
                );
                let error =
                    StageError::permanent(format!("upstream output missing: {dep}"));
                ctx.store
                    .mark_failed(
                        &unit.record_id,
                        &unit.stage,
                        &error,
                        true,
                        definition.max_attempts,
                        definition.backoff,
                    )
                    .await?;
                return Ok(UnitDisposition::Failed);
            }
        }
    }

    let input = StageInput {
        record: record.clone(),
        upstream,
        cancel: ctx.cancel.child_token(),
    };

    // The permit is held only for the executor call and released
    // unconditionally, success or failure.
    let outcome = {
        let _permit = ctx
            .limiters
            .acquire(definition.rate_limit_key.as_deref())
            .await?;
        match tokio::time::timeout(definition.timeout, executor.execute(input)).await {
            Ok(result) => result,
            Err(_) => Err(ExecutorError::transient(format!(
                "stage deadline exceeded after {:?}",
                definition.timeout
            ))),
        }
    };

    match outcome {
        Ok(output) => {
            let mut output_ref = output.output_ref;

            // Executors may report a more precise fingerprint than the one
            // derived from the raw record (e.g. a verified website URL).
            if let Some(fp) = output.fingerprint.clone().or(fingerprint) {
                let publish = ctx
                    .dedup
                    .publish(DedupEntry::new(fp, &output_ref, &unit.record_id))
                    .await?;
                if let PublishOutcome::AlreadyPublished(canonical) = publish {
                    // Lost the publish race: adopt the canonical artifact.
                    debug!(
                        record_id = %unit.record_id,
                        stage = %unit.stage,
                        "publish race lost, adopting canonical output"
                    );
                    output_ref = canonical.output_ref;
                }
            }

            if let Some(usage) = output.usage {
                ctx.costs.add(&unit.stage, usage);
            }

            ctx.store
                .mark_succeeded(&unit.record_id, &unit.stage, &output_ref)
                .await?;
            info!(record_id = %unit.record_id, stage = %unit.stage, "stage succeeded");
            Ok(UnitDisposition::Succeeded)
        }
        Err(error) => {
            let permanent = error.is_permanent();
            let stage_error = match &error {
                ExecutorError::Transient(msg) => StageError::transient(msg.clone()),
                ExecutorError::Permanent(msg) => StageError::permanent(msg.clone()),
            };

            let status = ctx
                .store
                .mark_failed(
                    &unit.record_id,
                    &unit.stage,
                    &stage_error,
                    permanent,
                    definition.max_attempts,
                    definition.backoff,
                )
                .await?;

            match status {
                StageStatus::Pending => {
                    warn!(
                        record_id = %unit.record_id,
                        stage = %unit.stage,
                        error = %error,
                        "stage attempt failed, will retry"
                    );
                    Ok(UnitDisposition::Retrying)
                }
                _ => {
                    warn!(
                        record_id = %unit.record_id,
                        stage = %unit.stage,
                        error = %error,
                        "stage failed permanently"
                    );
                    Ok(UnitDisposition::Failed)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dedup::MemoryDedupIndex;
    use crate::executor::StageOutput;
    use crate::stage::StageDefinition;
    use crate::state::MemoryStateStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct FixedExecutor {
        invocations: Arc<AtomicUsize>,
        fingerprint: Option<String>,
    }

    #[async_trait]
    impl StageExecutor for FixedExecutor {
        async fn execute(&self, input: StageInput) -> std::result::Result<StageOutput, ExecutorError> {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            let mut output = StageOutput::new(format!("artifact:{}", input.record.record_id));
            if let Some(fp) = &self.fingerprint {
                output = output.with_fingerprint(fp.clone());
            }
            Ok(output)
        }
    }

    struct SlowExecutor;

    #[async_trait]
    impl StageExecutor for SlowExecutor {
        async fn execute(&self, _input: StageInput) -> std::result::Result<StageOutput, ExecutorError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(StageOutput::new("never"))
        }
    }

    fn context(
        definition: StageDefinition,
        executor: Arc<dyn StageExecutor>,
    ) -> (Arc<WorkerContext>, Arc<MemoryStateStore>) {
        let store = Arc::new(MemoryStateStore::new());
        let mut registry = StageRegistry::new();
        let name = definition.name.clone();
        registry.register(definition).unwrap();

        let mut executors = HashMap::new();
        executors.insert(name, executor);

        let ctx = Arc::new(WorkerContext {
            registry: Arc::new(registry),
            store: store.clone(),
            dedup: Arc::new(MemoryDedupIndex::new()),
            limiters: Arc::new(RateLimiterSet::new()),
            executors,
            costs: Arc::new(CostTracker::default()),
            cancel: CancellationToken::new(),
        });
        (ctx, store)
    }

    #[tokio::test]
    async fn test_unit_success_writes_ledger() {
        let invocations = Arc::new(AtomicUsize::new(0));
        let (ctx, store) = context(
            StageDefinition::new("scrape", vec![]),
            Arc::new(FixedExecutor {
                invocations: invocations.clone(),
                fingerprint: None,
            }),
        );

        store.create_pending("d-1", "scrape").await.unwrap();
        let disposition = execute_unit(
            ctx,
            Arc::new(Record::new("d-1")),
            UnitKey::new("d-1", "scrape"),
        )
        .await
        .unwrap();

        assert_eq!(disposition, UnitDisposition::Succeeded);
        assert_eq!(invocations.load(Ordering::SeqCst), 1);
        let state = store.get("d-1", "scrape").await.unwrap().unwrap();
        assert_eq!(state.status, StageStatus::Succeeded);
        assert_eq!(state.output_ref.as_deref(), Some("artifact:d-1"));
    }

    #[tokio::test]
    async fn test_unclaimed_unit_is_discarded() {
        let invocations = Arc::new(AtomicUsize::new(0));
        let (ctx, store) = context(
            StageDefinition::new("scrape", vec![]),
            Arc::new(FixedExecutor {
                invocations: invocations.clone(),
                fingerprint: None,
            }),
        );

        store.create_pending("d-1", "scrape").await.unwrap();
        store.try_claim("d-1", "scrape").await.unwrap();

        let disposition = execute_unit(
            ctx,
            Arc::new(Record::new("d-1")),
            UnitKey::new("d-1", "scrape"),
        )
        .await
        .unwrap();

        assert_eq!(disposition, UnitDisposition::LostClaim);
        assert_eq!(invocations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_dedup_hit_skips_execution() {
        let invocations = Arc::new(AtomicUsize::new(0));
        let (ctx, store) = context(
            StageDefinition::new("scrape", vec![])
                .with_dedup_key(|_| Some("example.com".to_string())),
            Arc::new(FixedExecutor {
                invocations: invocations.clone(),
                fingerprint: Some("example.com".to_string()),
            }),
        );

        ctx.dedup
            .publish(DedupEntry::new("example.com", "canonical-artifact", "d-0"))
            .await
            .unwrap();

        store.create_pending("d-1", "scrape").await.unwrap();
        let disposition = execute_unit(
            ctx,
            Arc::new(Record::new("d-1")),
            UnitKey::new("d-1", "scrape"),
        )
        .await
        .unwrap();

        assert_eq!(disposition, UnitDisposition::Succeeded);
        assert_eq!(invocations.load(Ordering::SeqCst), 0);
        let state = store.get("d-1", "scrape").await.unwrap().unwrap();
        assert_eq!(state.output_ref.as_deref(), Some("canonical-artifact"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_counts_as_transient() {
        let (ctx, store) = context(
            StageDefinition::new("scrape", vec![])
                .with_timeout(Duration::from_millis(50))
                .with_max_attempts(3),
            Arc::new(SlowExecutor),
        );

        store.create_pending("d-1", "scrape").await.unwrap();
        let disposition = execute_unit(
            ctx,
            Arc::new(Record::new("d-1")),
            UnitKey::new("d-1", "scrape"),
        )
        .await
        .unwrap();

        assert_eq!(disposition, UnitDisposition::Retrying);
        let state = store.get("d-1", "scrape").await.unwrap().unwrap();
        assert_eq!(state.status, StageStatus::Pending);
        assert_eq!(state.last_error.unwrap().kind, crate::state::ErrorKind::Transient);
    }
}
