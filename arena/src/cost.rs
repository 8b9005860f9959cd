//! Token usage and cost accounting.
//!
//! Providers report a [`Usage`] per call; the execution context folds those
//! into a [`CostInfo`] using the provider's [`Pricing`], and the save
//! middleware persists the totals to conversation metadata.

use std::ops::{Add, AddAssign};

use serde::{Deserialize, Serialize};

/// Token counts from a single provider call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Tokens in the prompt.
    #[serde(default, alias = "prompt_tokens")]
    pub input_tokens: u64,

    /// Tokens in the completion.
    #[serde(default, alias = "completion_tokens")]
    pub output_tokens: u64,

    /// Prompt tokens served from the provider's cache.
    #[serde(default)]
    pub cached_tokens: u64,
}

impl Usage {
    /// Create a usage record with no cached tokens.
    #[must_use]
    pub const fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            cached_tokens: 0,
        }
    }

    /// Set the cached token count.
    #[must_use]
    pub const fn with_cached(mut self, cached_tokens: u64) -> Self {
        self.cached_tokens = cached_tokens;
        self
    }

    /// Total tokens across input and output.
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    /// Whether no tokens were recorded.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

impl Add for Usage {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Self {
            input_tokens: self.input_tokens + rhs.input_tokens,
            output_tokens: self.output_tokens + rhs.output_tokens,
            cached_tokens: self.cached_tokens + rhs.cached_tokens,
        }
    }
}

impl AddAssign for Usage {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

/// Per-1k-token prices in USD for one provider model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Pricing {
    /// Price per 1k input tokens.
    #[serde(default)]
    pub input_per_1k: f64,

    /// Price per 1k output tokens.
    #[serde(default)]
    pub output_per_1k: f64,

    /// Price per 1k cached input tokens.
    #[serde(default)]
    pub cached_per_1k: f64,
}

impl Pricing {
    /// Create a pricing table.
    #[must_use]
    pub const fn new(input_per_1k: f64, output_per_1k: f64, cached_per_1k: f64) -> Self {
        Self {
            input_per_1k,
            output_per_1k,
            cached_per_1k,
        }
    }

    /// Cost in USD of one provider call.
    ///
    /// Cached tokens are billed at the cached rate; the remaining input
    /// tokens at the input rate.
    #[must_use]
    pub fn cost_of(&self, usage: &Usage) -> f64 {
        let uncached = usage.input_tokens.saturating_sub(usage.cached_tokens) as f64;
        (uncached * self.input_per_1k
            + usage.output_tokens as f64 * self.output_per_1k
            + usage.cached_tokens as f64 * self.cached_per_1k)
            / 1000.0
    }
}

/// Accumulated tokens and cost for a turn or a whole run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CostInfo {
    /// Total input tokens.
    pub input_tokens: u64,
    /// Total output tokens.
    pub output_tokens: u64,
    /// Total cached input tokens.
    pub cached_tokens: u64,
    /// Total cost in USD.
    pub total_cost: f64,
}

impl CostInfo {
    /// Fold one provider call's usage into the totals.
    pub fn record(&mut self, usage: &Usage, pricing: &Pricing) {
        self.input_tokens += usage.input_tokens;
        self.output_tokens += usage.output_tokens;
        self.cached_tokens += usage.cached_tokens;
        self.total_cost += pricing.cost_of(usage);
    }

    /// Total tokens across input and output.
    #[must_use]
    pub const fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

impl Add for CostInfo {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Self {
            input_tokens: self.input_tokens + rhs.input_tokens,
            output_tokens: self.output_tokens + rhs.output_tokens,
            cached_tokens: self.cached_tokens + rhs.cached_tokens,
            total_cost: self.total_cost + rhs.total_cost,
        }
    }
}

impl AddAssign for CostInfo {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn usage_adds_componentwise() {
        let a = Usage::new(100, 50).with_cached(20);
        let b = Usage::new(200, 100);
        let sum = a + b;
        assert_eq!(sum.input_tokens, 300);
        assert_eq!(sum.output_tokens, 150);
        assert_eq!(sum.cached_tokens, 20);
        assert_eq!(sum.total(), 450);
    }

    #[test]
    fn pricing_uses_per_1k_rates() {
        let pricing = Pricing::new(1.0, 2.0, 0.1);
        let usage = Usage::new(1000, 500);
        let cost = pricing.cost_of(&usage);
        assert!((cost - 2.0).abs() < 1e-9);
    }

    #[test]
    fn cached_tokens_bill_at_cached_rate() {
        let pricing = Pricing::new(1.0, 0.0, 0.1);
        let usage = Usage::new(1000, 0).with_cached(400);
        // 600 uncached * 1.0 + 400 cached * 0.1 = 640 per-1k units.
        let cost = pricing.cost_of(&usage);
        assert!((cost - 0.64).abs() < 1e-9);
    }

    #[test]
    fn cost_info_records_and_sums() {
        let pricing = Pricing::new(1.0, 2.0, 0.0);
        let mut cost = CostInfo::default();
        cost.record(&Usage::new(1000, 1000), &pricing);
        cost.record(&Usage::new(500, 0), &pricing);

        assert_eq!(cost.input_tokens, 1500);
        assert_eq!(cost.output_tokens, 1000);
        assert_eq!(cost.total_tokens(), 2500);
        assert!((cost.total_cost - 3.5).abs() < 1e-9);
    }

    #[test]
    fn cost_info_add_matches_per_turn_sum() {
        let pricing = Pricing::new(2.0, 4.0, 0.0);
        let mut turn1 = CostInfo::default();
        turn1.record(&Usage::new(100, 10), &pricing);
        let mut turn2 = CostInfo::default();
        turn2.record(&Usage::new(200, 20), &pricing);

        let total = turn1 + turn2;
        assert_eq!(total.input_tokens, 300);
        assert!((total.total_cost - (turn1.total_cost + turn2.total_cost)).abs() < 1e-9);
    }
}
