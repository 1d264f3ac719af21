//! The run controller: owns the schedule/dispatch/await loop.
//!
//! Level-triggered: after every batch of completions it reloads the ledger,
//! recomputes the ready set and dispatches up to the worker-pool capacity.
//! Crash recovery, the resume guard and the final report all live here.

use crate::cost::{CostTracker, Pricing};
use crate::dedup::DedupIndex;
use crate::error::{PipelineError, Result};
use crate::executor::{StageExecutor, TokenUsage};
use crate::limiter::RateLimiterSet;
use crate::record::Record;
use crate::scheduler::{Scheduler, UnitKey};
use crate::stage::StageRegistry;
use crate::state::{StageError, StageStatus, StateStore};
use crate::worker::{execute_unit, UnitDisposition, WorkerContext};
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Maximum concurrently executing units.
    pub worker_count: usize,
    /// Continue from the existing ledger. When false the ledger must be
    /// empty; the controller never deletes prior state.
    pub resume: bool,
    /// How often to log a progress line while units are in flight.
    pub progress_interval: Duration,
    pub pricing: Pricing,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            worker_count: num_cpus::get(),
            resume: false,
            progress_interval: Duration::from_secs(5),
            pricing: Pricing::default(),
        }
    }
}

/// Terminal-state counts for one stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageCounts {
    pub succeeded: u64,
    pub failed: u64,
    pub skipped: u64,
    pub pending: u64,
    pub running: u64,
}

/// Summary of a completed (or cancelled) run.
#[derive(Debug)]
pub struct RunReport {
    pub run_id: Uuid,
    pub records_total: usize,
    pub per_stage: BTreeMap<String, StageCounts>,
    pub usage: BTreeMap<String, TokenUsage>,
    pub cost_usd: f64,
    pub duration: Duration,
    pub cancelled: bool,
}

impl RunReport {
    pub fn total_failed(&self) -> u64 {
        self.per_stage.values().map(|c| c.failed).sum()
    }

    pub fn total_succeeded(&self) -> u64 {
        self.per_stage.values().map(|c| c.succeeded).sum()
    }
}

pub struct RunController {
    registry: Arc<StageRegistry>,
    store: Arc<dyn StateStore>,
    dedup: Arc<dyn DedupIndex>,
    limiters: Arc<RateLimiterSet>,
    executors: HashMap<String, Arc<dyn StageExecutor>>,
}

impl RunController {
    pub fn new(
        registry: Arc<StageRegistry>,
        store: Arc<dyn StateStore>,
        dedup: Arc<dyn DedupIndex>,
        limiters: Arc<RateLimiterSet>,
        executors: HashMap<String, Arc<dyn StageExecutor>>,
    ) -> Self {
        Self {
            registry,
            store,
            dedup,
            limiters,
            executors,
        }
    }

    /// Validate wiring that cannot fail later: the stage graph, one executor
    /// per stage, and a configured limiter for every declared key.
    fn validate(&self) -> Result<()> {
        self.registry.validate()?;
        for stage in self.registry.stages() {
            if !self.executors.contains_key(&stage.name) {
                return Err(PipelineError::MissingExecutor(stage.name.clone()));
            }
            if let Some(key) = &stage.rate_limit_key {
                if !self.limiters.contains(key) {
                    return Err(PipelineError::UnknownLimiter {
                        stage: stage.name.clone(),
                        key: key.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    pub async fn run(
        &self,
        records: Vec<Record>,
        options: RunOptions,
        cancel: CancellationToken,
    ) -> Result<RunReport> {
        self.validate()?;
        let run_id = Uuid::new_v4();
        let started = Instant::now();
        info!(
            %run_id,
            records = records.len(),
            stages = self.registry.len(),
            workers = options.worker_count,
            resume = options.resume,
            "starting run"
        );

        if !options.resume && !self.store.load_all().await?.is_empty() {
            return Err(PipelineError::config(
                "ledger already contains state; pass --resume to continue or use a fresh database",
            ));
        }

        let reset = self.store.reset_running_to_pending().await?;
        if reset > 0 {
            info!(units = reset, "recovered units left running by a previous process");
        }

        let records: Vec<Arc<Record>> = records.into_iter().map(Arc::new).collect();
        let by_id: HashMap<String, Arc<Record>> = records
            .iter()
            .map(|r| (r.record_id.clone(), r.clone()))
            .collect();

        let scheduler = Scheduler::new(self.registry.clone())?;
        let costs = Arc::new(CostTracker::new(options.pricing));
        let ctx = Arc::new(WorkerContext {
            registry: self.registry.clone(),
            store: self.store.clone(),
            dedup: self.dedup.clone(),
            limiters: self.limiters.clone(),
            executors: self.executors.clone(),
            costs: costs.clone(),
            cancel: cancel.clone(),
        });

        let worker_count = options.worker_count.max(1);
        let mut inflight: HashSet<UnitKey> = HashSet::new();
        // Fingerprints being computed right now. Gating dispatch on them
        // serializes same-fingerprint units, so the loser observes the
        // winner's published entry instead of racing it.
        let mut inflight_fingerprints: HashSet<(String, String)> = HashSet::new();
        let mut tasks: JoinSet<(UnitKey, Result<UnitDisposition>)> = JoinSet::new();
        let mut cancelled = false;
        let mut last_progress = Instant::now();

        loop {
            if !cancelled {
                let states = self.load_state_map().await?;
                let pass = scheduler.compute_ready_set(&records, &states, &inflight, Utc::now());

                for (unit, blocked_on) in &pass.skip {
                    self.store
                        .mark_skipped(
                            &unit.record_id,
                            &unit.stage,
                            &StageError::dependency(blocked_on),
                        )
                        .await?;
                }

                for unit in pass.ready {
                    if inflight.len() >= worker_count {
                        break;
                    }
                    let Some(record) = by_id.get(&unit.record_id) else {
                        continue;
                    };

                    let fingerprint = self
                        .registry
                        .get(&unit.stage)
                        .and_then(|d| d.dedup_key.as_ref())
                        .and_then(|extract| extract(record))
                        .map(|fp| (unit.stage.clone(), fp));
                    if let Some(fp) = &fingerprint {
                        if inflight_fingerprints.contains(fp) {
                            continue;
                        }
                    }

                    self.store
                        .create_pending(&unit.record_id, &unit.stage)
                        .await?;

                    if let Some(fp) = fingerprint {
                        inflight_fingerprints.insert(fp);
                    }
                    inflight.insert(unit.clone());

                    let ctx = ctx.clone();
                    let record = record.clone();
                    tasks.spawn(async move {
                        let disposition = execute_unit(ctx, record, unit.clone()).await;
                        (unit, disposition)
                    });
                }

                if tasks.is_empty() {
                    match pass.next_retry_at {
                        Some(retry_at) => {
                            let wait = (retry_at - Utc::now())
                                .to_std()
                                .unwrap_or(Duration::ZERO)
                                + Duration::from_millis(10);
                            tokio::select! {
                                _ = cancel.cancelled() => cancelled = true,
                                _ = tokio::time::sleep(wait) => {}
                            }
                            continue;
                        }
                        None => break,
                    }
                }
            } else if tasks.is_empty() {
                break;
            }

            // Await one completion (or cancellation) before rescheduling.
            // Biased so a fired token stops dispatch before more joins are
            // processed.
            tokio::select! {
                biased;
                _ = cancel.cancelled(), if !cancelled => {
                    info!("cancellation requested, draining in-flight units");
                    cancelled = true;
                }
                joined = tasks.join_next() => {
                    let Some(joined) = joined else { continue };
                    let (unit, disposition) = joined?;
                    inflight.remove(&unit);
                    if let Some(fp) = self.unit_fingerprint(&by_id, &unit) {
                        inflight_fingerprints.remove(&(unit.stage.clone(), fp));
                    }
                    disposition?;
                }
                // Keep progress lines coming while long units are in flight.
                _ = tokio::time::sleep(options.progress_interval) => {}
            }

            if last_progress.elapsed() >= options.progress_interval {
                last_progress = Instant::now();
                self.log_progress(&records, inflight.len()).await?;
            }
        }

        let report = self
            .build_report(run_id, &records, &costs, started.elapsed(), cancelled)
            .await?;
        info!(
            %run_id,
            succeeded = report.total_succeeded(),
            failed = report.total_failed(),
            cancelled = report.cancelled,
            cost_usd = format!("{:.4}", report.cost_usd),
            "run finished"
        );
        Ok(report)
    }

    fn unit_fingerprint(
        &self,
        by_id: &HashMap<String, Arc<Record>>,
        unit: &UnitKey,
    ) -> Option<String> {
        let record = by_id.get(&unit.record_id)?;
        let extract = self.registry.get(&unit.stage)?.dedup_key.as_ref()?;
        extract(record)
    }

    async fn load_state_map(&self) -> Result<HashMap<UnitKey, crate::state::StageState>> {
        Ok(self
            .store
            .load_all()
            .await?
            .into_iter()
            .map(|s| (UnitKey::new(&s.record_id, &s.stage), s))
            .collect())
    }

    async fn log_progress(&self, records: &[Arc<Record>], inflight: usize) -> Result<()> {
        let states = self.store.load_all().await?;
        let done = states.iter().filter(|s| s.status.is_terminal()).count();
        let total = records.len() * self.registry.len();
        info!(done, total, inflight, "progress");
        Ok(())
    }

    async fn build_report(
        &self,
        run_id: Uuid,
        records: &[Arc<Record>],
        costs: &CostTracker,
        duration: Duration,
        cancelled: bool,
    ) -> Result<RunReport> {
        let mut per_stage: BTreeMap<String, StageCounts> = self
            .registry
            .stages()
            .iter()
            .map(|s| (s.name.clone(), StageCounts::default()))
            .collect();

        for state in self.store.load_all().await? {
            let Some(counts) = per_stage.get_mut(&state.stage) else {
                warn!(stage = %state.stage, "ledger row for unregistered stage");
                continue;
            };
            match state.status {
                StageStatus::Succeeded => counts.succeeded += 1,
                StageStatus::Failed => counts.failed += 1,
                StageStatus::Skipped => counts.skipped += 1,
                StageStatus::Pending => counts.pending += 1,
                StageStatus::Running => counts.running += 1,
            }
        }

        Ok(RunReport {
            run_id,
            records_total: records.len(),
            per_stage,
            usage: costs.snapshot(),
            cost_usd: costs.total_cost_usd(),
            duration,
            cancelled,
        })
    }
}
