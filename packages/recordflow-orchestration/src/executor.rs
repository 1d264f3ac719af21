use crate::record::Record;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Failure classification raised by stage executors.
///
/// Transient failures are retried up to the stage's attempt budget with
/// backoff; permanent failures fail the unit immediately.
#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("transient: {0}")]
    Transient(String),

    #[error("permanent: {0}")]
    Permanent(String),
}

impl ExecutorError {
    pub fn transient<E: std::fmt::Display>(e: E) -> Self {
        Self::Transient(e.to_string())
    }

    pub fn permanent<E: std::fmt::Display>(e: E) -> Self {
        Self::Permanent(e.to_string())
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }
}

/// Token consumption reported by model-backed executors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn add(&mut self, other: TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

/// Everything an executor gets for one (record, stage) attempt.
#[derive(Clone)]
pub struct StageInput {
    pub record: Arc<Record>,
    /// Output references of the stage's dependencies, resolved by the
    /// orchestrator before invocation, keyed by stage name.
    pub upstream: HashMap<String, String>,
    /// Cooperative cancellation; the orchestrator also enforces the stage
    /// deadline from the outside.
    pub cancel: CancellationToken,
}

impl StageInput {
    pub fn upstream_ref(&self, stage: &str) -> Result<&str, ExecutorError> {
        self.upstream
            .get(stage)
            .map(String::as_str)
            .ok_or_else(|| ExecutorError::permanent(format!("missing upstream output: {stage}")))
    }
}

/// Successful attempt result.
#[derive(Debug, Clone)]
pub struct StageOutput {
    /// Opaque pointer to the produced artifact; stored in the ledger,
    /// never interpreted by the orchestrator.
    pub output_ref: String,
    /// Content fingerprint for deduped stages; `None` skips the index.
    pub fingerprint: Option<String>,
    pub usage: Option<TokenUsage>,
}

impl StageOutput {
    pub fn new(output_ref: impl Into<String>) -> Self {
        Self {
            output_ref: output_ref.into(),
            fingerprint: None,
            usage: None,
        }
    }

    pub fn with_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.fingerprint = Some(fingerprint.into());
        self
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = Some(usage);
        self
    }
}

/// The contract every external collaborator implements to plug into the
/// orchestrator. Pure stages must tolerate repeated invocation for the same
/// record; side-effecting stages must write upsert-style keyed by record id.
#[async_trait]
pub trait StageExecutor: Send + Sync {
    async fn execute(&self, input: StageInput) -> Result<StageOutput, ExecutorError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(ExecutorError::permanent("bad input").is_permanent());
        assert!(!ExecutorError::transient("timeout").is_permanent());
    }

    #[test]
    fn test_token_usage_accumulates() {
        let mut usage = TokenUsage::default();
        usage.add(TokenUsage {
            input_tokens: 100,
            output_tokens: 20,
        });
        usage.add(TokenUsage {
            input_tokens: 50,
            output_tokens: 5,
        });
        assert_eq!(usage.input_tokens, 150);
        assert_eq!(usage.output_tokens, 25);
    }

    #[test]
    fn test_missing_upstream_is_permanent() {
        let input = StageInput {
            record: Arc::new(Record::new("d-1")),
            upstream: HashMap::new(),
            cancel: CancellationToken::new(),
        };
        let err = input.upstream_ref("places").unwrap_err();
        assert!(err.is_permanent());
    }
}
