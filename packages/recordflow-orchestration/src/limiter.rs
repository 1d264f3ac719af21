use crate::error::{PipelineError, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Per-external-dependency concurrency caps, independent of the worker pool
/// size. A stage executor acquires its dependency's permit before the
/// external call; the permit is released on drop, success or failure alike.
#[derive(Default)]
pub struct RateLimiterSet {
    limiters: HashMap<String, Arc<Semaphore>>,
}

impl RateLimiterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(mut self, key: impl Into<String>, max_in_flight: usize) -> Self {
        self.limiters
            .insert(key.into(), Arc::new(Semaphore::new(max_in_flight.max(1))));
        self
    }

    pub fn contains(&self, key: &str) -> bool {
        self.limiters.contains_key(key)
    }

    /// Acquire a permit for the given dependency. `None` key means the
    /// stage declared no external dependency and runs unlimited.
    pub async fn acquire(&self, key: Option<&str>) -> Result<Option<OwnedSemaphorePermit>> {
        let Some(key) = key else {
            return Ok(None);
        };
        let semaphore = self
            .limiters
            .get(key)
            .ok_or_else(|| PipelineError::config(format!("no rate limiter configured: {key}")))?
            .clone();
        let permit = semaphore
            .acquire_owned()
            .await
            .map_err(|_| PipelineError::config(format!("rate limiter closed: {key}")))?;
        Ok(Some(permit))
    }
}
