use crate::error::{PipelineError, Result};
use crate::record::Record;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

/// Fingerprint extractor for deduped stages. Returns `None` when the record
/// has no usable key, in which case the stage executes per record.
pub type DedupKeyFn = Arc<dyn Fn(&Record) -> Option<String> + Send + Sync>;

/// Whether a retried attempt needs guarding on the executor side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdempotencyClass {
    /// Safe to retry freely.
    Pure,
    /// Retries must be upsert-guarded by the executor (e.g. sinks).
    SideEffecting,
}

/// Exponential backoff: `base_delay * 2^(attempt - 1)`, capped.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(300),
        }
    }
}

impl BackoffPolicy {
    pub fn new(base_delay: Duration) -> Self {
        Self {
            base_delay,
            ..Self::default()
        }
    }

    /// Delay before the next attempt, given how many attempts have run.
    pub fn delay_for(&self, attempts_so_far: u32) -> Duration {
        let exp = attempts_so_far.saturating_sub(1).min(16);
        let delay = self.base_delay.saturating_mul(1u32 << exp);
        delay.min(self.max_delay)
    }
}

/// Static definition of one enrichment stage. Loaded at startup, never
/// mutated at runtime.
#[derive(Clone)]
pub struct StageDefinition {
    pub name: String,
    pub depends_on: Vec<String>,
    pub idempotency: IdempotencyClass,
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    pub timeout: Duration,
    /// Which external-dependency limiter the executor runs under.
    pub rate_limit_key: Option<String>,
    pub dedup_key: Option<DedupKeyFn>,
}

impl std::fmt::Debug for StageDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageDefinition")
            .field("name", &self.name)
            .field("depends_on", &self.depends_on)
            .field("idempotency", &self.idempotency)
            .field("max_attempts", &self.max_attempts)
            .field("timeout", &self.timeout)
            .field("rate_limit_key", &self.rate_limit_key)
            .field("deduped", &self.dedup_key.is_some())
            .finish()
    }
}

impl StageDefinition {
    pub fn new(name: impl Into<String>, depends_on: Vec<&str>) -> Self {
        Self {
            name: name.into(),
            depends_on: depends_on.into_iter().map(str::to_string).collect(),
            idempotency: IdempotencyClass::Pure,
            max_attempts: 3,
            backoff: BackoffPolicy::default(),
            timeout: Duration::from_secs(60),
            rate_limit_key: None,
            dedup_key: None,
        }
    }

    pub fn side_effecting(mut self) -> Self {
        self.idempotency = IdempotencyClass::SideEffecting;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_rate_limit_key(mut self, key: impl Into<String>) -> Self {
        self.rate_limit_key = Some(key.into());
        self
    }

    pub fn with_dedup_key<F>(mut self, extractor: F) -> Self
    where
        F: Fn(&Record) -> Option<String> + Send + Sync + 'static,
    {
        self.dedup_key = Some(Arc::new(extractor));
        self
    }
}

/// Static directed acyclic graph of stages. Effectively immutable
/// configuration: registered at process start, validated once, never
/// mutated afterward.
#[derive(Debug, Default)]
pub struct StageRegistry {
    stages: Vec<StageDefinition>,
    by_name: HashMap<String, usize>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, definition: StageDefinition) -> Result<()> {
        if self.by_name.contains_key(&definition.name) {
            return Err(PipelineError::DuplicateStage(definition.name));
        }
        self.by_name
            .insert(definition.name.clone(), self.stages.len());
        self.stages.push(definition);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&StageDefinition> {
        self.by_name.get(name).map(|&i| &self.stages[i])
    }

    pub fn stages(&self) -> &[StageDefinition] {
        &self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn dependencies_of(&self, name: &str) -> Result<&[String]> {
        self.get(name)
            .map(|d| d.depends_on.as_slice())
            .ok_or_else(|| PipelineError::UnknownStage(name.to_string()))
    }

    /// Topological order over the declared dependencies, used only for
    /// startup validation. Fails fast on an unknown dependency or a cycle.
    pub fn topological_order(&self) -> Result<Vec<String>> {
        for stage in &self.stages {
            for dep in &stage.depends_on {
                if !self.by_name.contains_key(dep) {
                    return Err(PipelineError::UnknownDependency {
                        stage: stage.name.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        let mut in_degree: HashMap<&str, usize> = self
            .stages
            .iter()
            .map(|s| (s.name.as_str(), s.depends_on.len()))
            .collect();

        let mut order = Vec::with_capacity(self.stages.len());
        let mut done: HashSet<&str> = HashSet::new();

        while done.len() < self.stages.len() {
            // Preserve registration order among ready stages for stable output.
            let ready: Vec<&str> = self
                .stages
                .iter()
                .map(|s| s.name.as_str())
                .filter(|name| !done.contains(name) && in_degree[name] == 0)
                .collect();

            if ready.is_empty() {
                return Err(PipelineError::CycleDetected);
            }

            for name in ready {
                done.insert(name);
                order.push(name.to_string());
                for stage in &self.stages {
                    if stage.depends_on.iter().any(|d| d == name) {
                        if let Some(degree) = in_degree.get_mut(stage.name.as_str()) {
                            *degree -= 1;
                        }
                    }
                }
            }
        }

        Ok(order)
    }

    pub fn validate(&self) -> Result<()> {
        self.topological_order().map(|_| ())
    }
}
