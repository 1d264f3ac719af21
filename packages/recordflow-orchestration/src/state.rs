use crate::error::{PipelineError, Result};
use crate::stage::BackoffPolicy;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Status of one (record, stage) unit of work.
///
/// Transitions are forward-only, except `Running -> Pending` during
/// crash-recovery reconciliation. `Succeeded`, `Failed` and `Skipped` are
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Pending => "pending",
            StageStatus::Running => "running",
            StageStatus::Succeeded => "succeeded",
            StageStatus::Failed => "failed",
            StageStatus::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(StageStatus::Pending),
            "running" => Ok(StageStatus::Running),
            "succeeded" => Ok(StageStatus::Succeeded),
            "failed" => Ok(StageStatus::Failed),
            "skipped" => Ok(StageStatus::Skipped),
            _ => Err(PipelineError::parse(format!("invalid stage status: {s}"))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StageStatus::Succeeded | StageStatus::Failed | StageStatus::Skipped
        )
    }
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transient,
    Permanent,
    /// Derived by the scheduler when an upstream stage failed or was
    /// skipped; never raised by executors, never retried.
    Dependency,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Permanent => "permanent",
            ErrorKind::Dependency => "dependency",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "transient" => Ok(ErrorKind::Transient),
            "permanent" => Ok(ErrorKind::Permanent),
            "dependency" => Ok(ErrorKind::Dependency),
            _ => Err(PipelineError::parse(format!("invalid error kind: {s}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageError {
    pub kind: ErrorKind,
    pub message: String,
}

impl StageError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Permanent,
            message: message.into(),
        }
    }

    pub fn dependency(blocked_on: &str) -> Self {
        Self {
            kind: ErrorKind::Dependency,
            message: format!("dependency {blocked_on} did not succeed"),
        }
    }
}

/// Persisted status of one (record, stage) pair: the resumability ledger.
/// Created lazily on first eligibility, mutated only by the owning worker,
/// never deleted.
#[derive(Debug, Clone)]
pub struct StageState {
    pub record_id: String,
    pub stage: String,
    pub status: StageStatus,
    pub attempt_count: u32,
    pub last_error: Option<StageError>,
    /// Opaque pointer to the stage's artifact; set on success.
    pub output_ref: Option<String>,
    /// Backoff gate: the unit is not ready again before this instant.
    pub next_retry_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl StageState {
    pub fn new_pending(record_id: impl Into<String>, stage: impl Into<String>) -> Self {
        Self {
            record_id: record_id.into(),
            stage: stage.into(),
            status: StageStatus::Pending,
            attempt_count: 0,
            last_error: None,
            output_ref: None,
            next_retry_at: None,
            updated_at: Utc::now(),
        }
    }
}

/// Durable table mapping (record_id, stage) to execution state. Single
/// source of truth for resumability; `try_claim` is the only operation that
/// needs compare-and-set semantics under concurrency.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, record_id: &str, stage: &str) -> Result<Option<StageState>>;

    async fn load_all(&self) -> Result<Vec<StageState>>;

    /// Insert a `pending` row if none exists; idempotent.
    async fn create_pending(&self, record_id: &str, stage: &str) -> Result<()>;

    /// Atomically transition `pending -> running` and increment the attempt
    /// count. Returns `false` when another worker already owns the unit.
    async fn try_claim(&self, record_id: &str, stage: &str) -> Result<bool>;

    async fn mark_succeeded(&self, record_id: &str, stage: &str, output_ref: &str) -> Result<()>;

    /// Record a failed attempt. Becomes `failed` when `permanent` or the
    /// attempt budget is exhausted; otherwise reverts to `pending` with a
    /// backoff gate. Returns the resulting status.
    async fn mark_failed(
        &self,
        record_id: &str,
        stage: &str,
        error: &StageError,
        permanent: bool,
        max_attempts: u32,
        backoff: BackoffPolicy,
    ) -> Result<StageStatus>;

    /// Terminal skip due to an upstream failure; idempotent, upserts when
    /// the ledger row was never created.
    async fn mark_skipped(&self, record_id: &str, stage: &str, error: &StageError) -> Result<()>;

    /// Crash recovery: any unit found `running` at startup lost its worker
    /// and is reset to `pending`. Returns how many were reset.
    async fn reset_running_to_pending(&self) -> Result<u64>;
}

fn invalid_transition(state: &StageState, to: StageStatus) -> PipelineError {
    PipelineError::InvalidTransition {
        record_id: state.record_id.clone(),
        stage: state.stage.clone(),
        from: state.status.as_str().to_string(),
        to: to.as_str().to_string(),
    }
}

/// In-memory ledger for tests and dry runs; interface-identical to the
/// SQLite backend.
#[derive(Default)]
pub struct MemoryStateStore {
    states: DashMap<(String, String), StageState>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(record_id: &str, stage: &str) -> (String, String) {
        (record_id.to_string(), stage.to_string())
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, record_id: &str, stage: &str) -> Result<Option<StageState>> {
        Ok(self
            .states
            .get(&Self::key(record_id, stage))
            .map(|s| s.clone()))
    }

    async fn load_all(&self) -> Result<Vec<StageState>> {
        Ok(self.states.iter().map(|e| e.value().clone()).collect())
    }

    async fn create_pending(&self, record_id: &str, stage: &str) -> Result<()> {
        self.states
            .entry(Self::key(record_id, stage))
            .or_insert_with(|| StageState::new_pending(record_id, stage));
        Ok(())
    }

    async fn try_claim(&self, record_id: &str, stage: &str) -> Result<bool> {
        match self.states.get_mut(&Self::key(record_id, stage)) {
            Some(mut entry) => {
                if entry.status != StageStatus::Pending {
                    return Ok(false);
                }
                entry.status = StageStatus::Running;
                entry.attempt_count += 1;
                entry.next_retry_at = None;
                entry.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn mark_succeeded(&self, record_id: &str, stage: &str, output_ref: &str) -> Result<()> {
        let mut entry = self
            .states
            .get_mut(&Self::key(record_id, stage))
            .ok_or_else(|| PipelineError::UnknownStage(format!("{record_id}/{stage}")))?;
        if entry.status != StageStatus::Running {
            return Err(invalid_transition(&entry, StageStatus::Succeeded));
        }
        entry.status = StageStatus::Succeeded;
        entry.output_ref = Some(output_ref.to_string());
        entry.last_error = None;
        entry.next_retry_at = None;
        entry.updated_at = Utc::now();
        Ok(())
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
        let mut entry = self
            .states
            .get_mut(&Self::key(record_id, stage))
            .ok_or_else(|| PipelineError::UnknownStage(format!("{record_id}/{stage}")))?;
        if entry.status != StageStatus::Running {
            return Err(invalid_transition(&entry, StageStatus::Failed));
        }

        entry.last_error = Some(error.clone());
        entry.updated_at = Utc::now();

        if permanent || entry.attempt_count >= max_attempts {
            entry.status = StageStatus::Failed;
            entry.next_retry_at = None;
        } else {
            entry.status = StageStatus::Pending;
            let delay = backoff.delay_for(entry.attempt_count);
            entry.next_retry_at = Some(
                Utc::now()
                    + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero()),
            );
        }
        Ok(entry.status)
    }

    async fn mark_skipped(&self, record_id: &str, stage: &str, error: &StageError) -> Result<()> {
        let mut entry = self
            .states
            .entry(Self::key(record_id, stage))
            .or_insert_with(|| StageState::new_pending(record_id, stage));
        match entry.status {
            StageStatus::Pending => {
                entry.status = StageStatus::Skipped;
                entry.last_error = Some(error.clone());
                entry.next_retry_at = None;
                entry.updated_at = Utc::now();
                Ok(())
            }
            StageStatus::Skipped => Ok(()),
            _ => Err(invalid_transition(&entry, StageStatus::Skipped)),
        }
    }

    async fn reset_running_to_pending(&self) -> Result<u64> {
        let mut reset = 0;
        for mut entry in self.states.iter_mut() {
            if entry.status == StageStatus::Running {
                entry.status = StageStatus::Pending;
                entry.updated_at = Utc::now();
                reset += 1;
            }
        }
        Ok(reset)
    }
}
