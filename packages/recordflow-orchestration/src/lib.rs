//! Resumable multi-stage enrichment orchestration.
//!
//! Records flow through a static DAG of stages. Every (record, stage) pair
//! is tracked in a durable ledger, so an interrupted run picks up exactly
//! where it stopped: succeeded units are never re-executed, units caught
//! mid-flight are reset and retried. A fingerprint index deduplicates
//! expensive fetches across records that resolve to the same source.
//!
//! The crate is storage-agnostic at the seams (`StateStore`, `DedupIndex`,
//! `StageExecutor` are traits); SQLite and in-memory backends ship here,
//! stage executors live in `recordflow-stages`.

pub mod controller;
pub mod cost;
pub mod dedup;
pub mod error;
pub mod executor;
pub mod limiter;
pub mod record;
pub mod scheduler;
pub mod sqlite;
pub mod stage;
pub mod state;

mod worker;

pub use controller::{RunController, RunOptions, RunReport, StageCounts};
pub use cost::{CostTracker, Pricing};
pub use dedup::{DedupEntry, DedupIndex, MemoryDedupIndex, PublishOutcome};
pub use error::{PipelineError, Result};
pub use executor::{ExecutorError, StageExecutor, StageInput, StageOutput, TokenUsage};
pub use limiter::RateLimiterSet;
pub use record::Record;
pub use scheduler::{SchedulePass, Scheduler, UnitKey};
pub use sqlite::{init_schema, open_in_memory_db, open_pipeline_db, SqliteDedupIndex, SqliteStateStore};
pub use stage::{BackoffPolicy, IdempotencyClass, StageDefinition, StageRegistry};
pub use state::{ErrorKind, MemoryStateStore, StageError, StageState, StageStatus, StateStore};
