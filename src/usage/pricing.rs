//! Model Pricing
//!
//! Maps (model, token usage) to estimated USD cost. Rates are quoted per
//! million tokens the way providers publish them. The built-in table covers
//! commonly routed models; deployments override or extend it from
//! configuration, and anything unknown falls back to a deliberately
//! conservative default rate so spend is overestimated rather than missed.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::types::TokenUsage;

/// USD per million tokens, split by direction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelRate {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

impl ModelRate {
    pub const fn new(input_per_million: f64, output_per_million: f64) -> Self {
        Self {
            input_per_million,
            output_per_million,
        }
    }

    /// Cost of the given usage at this rate.
    pub fn cost(&self, usage: TokenUsage) -> f64 {
        let input = usage.prompt_tokens as f64 / 1_000_000.0 * self.input_per_million;
        let output = usage.completion_tokens as f64 / 1_000_000.0 * self.output_per_million;
        input + output
    }
}

/// Applied when a model has no listed or configured rate.
pub const DEFAULT_RATE: ModelRate = ModelRate::new(5.00, 15.00);

/// Published rates for models this gateway commonly routes.
const BUILTIN_RATES: &[(&str, ModelRate)] = &[
    ("gpt-4o", ModelRate::new(2.50, 10.00)),
    ("gpt-4o-mini", ModelRate::new(0.15, 0.60)),
    ("gpt-4.1", ModelRate::new(2.00, 8.00)),
    ("gpt-4.1-mini", ModelRate::new(0.40, 1.60)),
    ("claude-opus-4-1", ModelRate::new(15.00, 75.00)),
    ("claude-sonnet-4-5", ModelRate::new(3.00, 15.00)),
    ("claude-haiku-4-5", ModelRate::new(1.00, 5.00)),
];

/// Rate lookup with config overrides layered on the built-in table.
#[derive(Debug, Clone)]
pub struct PriceBook {
    rates: HashMap<String, ModelRate>,
    default_rate: ModelRate,
}

impl PriceBook {
    /// Built-in rates only.
    pub fn builtin() -> Self {
        Self::new(HashMap::new(), DEFAULT_RATE)
    }

    /// Built-in rates with overrides applied on top.
    pub fn new(overrides: HashMap<String, ModelRate>, default_rate: ModelRate) -> Self {
        let mut rates: HashMap<String, ModelRate> = BUILTIN_RATES
            .iter()
            .map(|(name, rate)| (name.to_string(), *rate))
            .collect();
        rates.extend(overrides);
        Self {
            rates,
            default_rate,
        }
    }

    /// Rate for a model.
    ///
    /// Exact name first, then the longest listed prefix, so dated variants
    /// like `gpt-4o-2024-08-06` price as their base model. Unknown models
    /// get the default rate.
    pub fn rate_for(&self, model: &str) -> ModelRate {
        if let Some(rate) = self.rates.get(model) {
            return *rate;
        }

        self.rates
            .iter()
            .filter(|(name, _)| model.starts_with(name.as_str()))
            .max_by_key(|(name, _)| name.len())
            .map(|(_, rate)| *rate)
            .unwrap_or(self.default_rate)
    }

    /// Estimated USD cost for one completion.
    pub fn estimate(&self, model: &str, usage: TokenUsage) -> f64 {
        self.rate_for(model).cost(usage)
    }

    /// Add or replace the rate for one model.
    pub fn set_rate(&mut self, model: &str, rate: ModelRate) {
        self.rates.insert(model.to_string(), rate);
    }

    /// Replace the fallback rate for unlisted models.
    pub fn set_default_rate(&mut self, rate: ModelRate) {
        self.default_rate = rate;
    }
}

impl Default for PriceBook {
    fn default() -> Self {
        Self::builtin()
    }
}
