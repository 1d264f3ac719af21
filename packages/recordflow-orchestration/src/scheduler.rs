//! Ready-set computation over a ledger snapshot.
//!
//! The scheduler is a pure function: it never touches the store. The run
//! controller feeds it a snapshot after every batch of completions
//! (level-triggered), applies its skip decisions, and dispatches its ready
//! units.

use crate::record::Record;
use crate::stage::StageRegistry;
use crate::state::{StageState, StageStatus};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// One (record, stage) unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UnitKey {
    pub record_id: String,
    pub stage: String,
}

impl UnitKey {
    pub fn new(record_id: impl Into<String>, stage: impl Into<String>) -> Self {
        Self {
            record_id: record_id.into(),
            stage: stage.into(),
        }
    }
}

impl std::fmt::Display for UnitKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.record_id, self.stage)
    }
}

/// Result of one scheduling pass.
#[derive(Debug, Default)]
pub struct SchedulePass {
    /// Units eligible for dispatch: pending, retry gate elapsed, all
    /// dependencies succeeded.
    pub ready: Vec<UnitKey>,
    /// Units to mark skipped, with the dependency that blocked each.
    pub skip: Vec<(UnitKey, String)>,
    /// Earliest backoff gate among otherwise-ready units, so the caller can
    /// sleep instead of polling.
    pub next_retry_at: Option<DateTime<Utc>>,
}

pub struct Scheduler {
    registry: Arc<StageRegistry>,
    topo_order: Vec<String>,
}

impl Scheduler {
    pub fn new(registry: Arc<StageRegistry>) -> crate::error::Result<Self> {
        let topo_order = registry.topological_order()?;
        Ok(Self {
            registry,
            topo_order,
        })
    }

    /// Compute the ready set for one pass. `inflight` units are treated as
    /// running regardless of what the snapshot says, so a unit is never
    /// dispatched twice concurrently.
    pub fn compute_ready_set(
        &self,
        records: &[Arc<Record>],
        states: &HashMap<UnitKey, StageState>,
        inflight: &HashSet<UnitKey>,
        now: DateTime<Utc>,
    ) -> SchedulePass {
        let mut pass = SchedulePass::default();

        for record in records {
            // Effective status per stage for this record, including skip
            // decisions made earlier in this pass: walking in topological
            // order makes the skip cascade transitive within a single pass.
            let mut effective: HashMap<&str, StageStatus> = HashMap::new();

            for stage_name in &self.topo_order {
                let unit = UnitKey::new(&record.record_id, stage_name);
                let state = states.get(&unit);

                let status = if inflight.contains(&unit) {
                    StageStatus::Running
                } else {
                    state.map(|s| s.status).unwrap_or(StageStatus::Pending)
                };

                if status != StageStatus::Pending {
                    effective.insert(stage_name, status);
                    continue;
                }

                let deps = match self.registry.dependencies_of(stage_name) {
                    Ok(deps) => deps,
                    Err(_) => continue,
                };

                let blocked = deps.iter().find(|dep| {
                    matches!(
                        effective.get(dep.as_str()),
                        Some(StageStatus::Failed) | Some(StageStatus::Skipped)
                    )
                });
                if let Some(dep) = blocked {
                    pass.skip.push((unit, dep.clone()));
                    effective.insert(stage_name, StageStatus::Skipped);
                    continue;
                }

                let all_succeeded = deps
                    .iter()
                    .all(|dep| effective.get(dep.as_str()) == Some(&StageStatus::Succeeded));
                if !all_succeeded {
                    effective.insert(stage_name, StageStatus::Pending);
                    continue;
                }

                // Backoff gate for retry-pending units.
                if let Some(retry_at) = state.and_then(|s| s.next_retry_at) {
                    if retry_at > now {
                        pass.next_retry_at = Some(match pass.next_retry_at {
                            Some(existing) => existing.min(retry_at),
                            None => retry_at,
                        });
                        effective.insert(stage_name, StageStatus::Pending);
                        continue;
                    }
                }

                pass.ready.push(unit);
                effective.insert(stage_name, StageStatus::Pending);
            }
        }

        pass
    }
}
