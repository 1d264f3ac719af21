use crate::executor::TokenUsage;
use dashmap::DashMap;
use std::collections::BTreeMap;

/// Pricing in USD per one million tokens.
#[derive(Debug, Clone, Copy)]
pub struct Pricing {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

impl Default for Pricing {
    fn default() -> Self {
        Self {
            input_per_million: 0.50,
            output_per_million: 3.00,
        }
    }
}

/// Shared per-stage token accounting for paid model calls.
#[derive(Default)]
pub struct CostTracker {
    per_stage: DashMap<String, TokenUsage>,
    pricing: Pricing,
}

impl CostTracker {
    pub fn new(pricing: Pricing) -> Self {
        Self {
            per_stage: DashMap::new(),
            pricing,
        }
    }

    pub fn add(&self, stage: &str, usage: TokenUsage) {
        self.per_stage
            .entry(stage.to_string())
            .or_default()
            .add(usage);
    }

    /// Stable per-stage snapshot for reporting.
    pub fn snapshot(&self) -> BTreeMap<String, TokenUsage> {
        self.per_stage
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect()
    }

    pub fn total_cost_usd(&self) -> f64 {
        self.per_stage
            .iter()
            .map(|e| {
                let usage = e.value();
                (usage.input_tokens as f64 / 1_000_000.0) * self.pricing.input_per_million
                    + (usage.output_tokens as f64 / 1_000_000.0) * self.pricing.output_per_million
            })
            .sum()
    }
}
