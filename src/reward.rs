//! Turns a model's observed quality/latency/cost for one race into the
//! scalar reward fed back into the router.

use std::collections::HashMap;

use crate::query::{ModelId, Query};

/// One model's observed outcome for a single race, as input to reward
/// computation.
#[derive(Debug, Clone)]
pub struct RewardInputs {
    pub judge_overall: f64,
    pub preview_latency_secs: f64,
    pub tokens_consumed: u64,
    pub was_fallback: bool,
    /// `true` when the preview text was served from cache: `reward.rs`
    /// substitutes the model's recent p95 for the recorded (artificially
    /// low) latency so cache hits cannot win purely on a latency bonus.
    pub served_from_cache: bool,
}

pub trait RewardPolicy: Send + Sync {
    /// Compute a reward in `[0, 1]` for `model` given this race's query and
    /// observed `inputs`; `p95_fallback` is the model's own tracked p95,
    /// used in place of a cache-hit's near-zero recorded latency.
    fn reward(
        &self,
        query: &Query,
        model: &ModelId,
        inputs: &RewardInputs,
        p95_fallback_secs: f64,
    ) -> f64;

    /// USD price per token for `model`, used by the orchestrator to
    /// accumulate the full-stage cost ceiling independently of any one
    /// race's reward computation.
    fn price_per_token(&self, model: &ModelId) -> f64;
}

fn clip(x: f64, lo: f64, hi: f64) -> f64 {
    x.max(lo).min(hi)
}

/// Default policy: weighted blend of quality, inverted latency, inverted
/// cost, minus a flat penalty for models attempted-then-abandoned in the
/// full-answer stage.
pub struct QualityLatencyCostPolicy {
    pub weight_quality: f64,
    pub weight_latency: f64,
    pub weight_cost: f64,
    pub fallback_penalty: f64,
    pub length_threshold_chars: f64,
    pub reference_latency_floor_secs: f64,
    pub price_per_token: HashMap<ModelId, f64>,
    pub default_price_per_token: f64,
}

impl QualityLatencyCostPolicy {
    /// Longer queries tolerate proportionally higher latency before being
    /// penalized, scaling with the same length threshold features use.
    fn reference_latency(&self, query: &Query) -> f64 {
        let scale = 1.0 + (query.char_len() as f64 / self.length_threshold_chars).min(2.0);
        (self.reference_latency_floor_secs * scale).max(self.reference_latency_floor_secs)
    }

    fn reference_cost(&self, query: &Query, price_per_token: f64) -> f64 {
        // A generous ceiling: twice the length-scaled token budget's price.
        let tokens_budget = (query.char_len() as f64 / 4.0).max(256.0) * 2.0;
        (tokens_budget * price_per_token).max(1e-6)
    }

    fn price_for(&self, model: &ModelId) -> f64 {
        self.price_per_token
            .get(model)
            .copied()
            .unwrap_or(self.default_price_per_token)
    }
}

impl RewardPolicy for QualityLatencyCostPolicy {
    fn reward(
        &self,
        query: &Query,
        model: &ModelId,
        inputs: &RewardInputs,
        p95_fallback_secs: f64,
    ) -> f64 {
        let quality = clip(inputs.judge_overall, 0.0, 1.0);

        let effective_latency_secs = if inputs.served_from_cache {
            p95_fallback_secs
        } else {
            inputs.preview_latency_secs
        };
        let reference_latency = self.reference_latency(query);
        let lat_norm = clip(effective_latency_secs / reference_latency, 0.0, 1.0);
        let latency = 1.0 - lat_norm;

        let price = self.price_for(model);
        let cost = inputs.tokens_consumed as f64 * price;
        let reference_cost = self.reference_cost(query, price);
        let cost_norm = clip(cost / reference_cost, 0.0, 1.0);
        let cost_score = 1.0 - cost_norm;

        let fallback_penalty = if inputs.was_fallback { self.fallback_penalty } else { 0.0 };

        clip(
            self.weight_quality * quality + self.weight_latency * latency
                + self.weight_cost * cost_score
                - fallback_penalty,
            0.0,
            1.0,
        )
    }

    fn price_per_token(&self, model: &ModelId) -> f64 {
        self.price_for(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> QualityLatencyCostPolicy {
        QualityLatencyCostPolicy {
            weight_quality: 0.6,
            weight_latency: 0.25,
            weight_cost: 0.15,
            fallback_penalty: 0.2,
            length_threshold_chars: 2000.0,
            reference_latency_floor_secs: 3.0,
            price_per_token: HashMap::new(),
            default_price_per_token: 1.0 / 100_000.0,
        }
    }

    fn inputs(quality: f64, latency: f64, tokens: u64) -> RewardInputs {
        RewardInputs {
            judge_overall: quality,
            preview_latency_secs: latency,
            tokens_consumed: tokens,
            was_fallback: false,
            served_from_cache: false,
        }
    }

    #[test]
    fn higher_quality_strictly_increases_reward() {
        let p = policy();
        let q = Query::new("hi");
        let m = ModelId::new("a");
        let low = p.reward(&q, &m, &inputs(0.2, 1.0, 100), 1.0);
        let high = p.reward(&q, &m, &inputs(0.9, 1.0, 100), 1.0);
        assert!(high > low);
    }

    #[test]
    fn higher_latency_strictly_decreases_reward() {
        let p = policy();
        let q = Query::new("hi");
        let m = ModelId::new("a");
        let fast = p.reward(&q, &m, &inputs(0.8, 0.5, 100), 1.0);
        let slow = p.reward(&q, &m, &inputs(0.8, 5.0, 100), 1.0);
        assert!(fast > slow);
    }

    #[test]
    fn higher_cost_strictly_decreases_reward() {
        let p = policy();
        let q = Query::new("hi");
        let m = ModelId::new("a");
        let cheap = p.reward(&q, &m, &inputs(0.8, 1.0, 100), 1.0);
        let pricey = p.reward(&q, &m, &inputs(0.8, 1.0, 100_000), 1.0);
        assert!(cheap > pricey);
    }

    #[test]
    fn fallback_penalty_reduces_reward() {
        let p = policy();
        let q = Query::new("hi");
        let m = ModelId::new("a");
        let mut penalized = inputs(0.8, 1.0, 100);
        penalized.was_fallback = true;
        let base = p.reward(&q, &m, &inputs(0.8, 1.0, 100), 1.0);
        let with_penalty = p.reward(&q, &m, &penalized, 1.0);
        assert!(with_penalty < base);
    }

    #[test]
    fn reward_is_always_clipped_to_unit_interval() {
        let p = policy();
        let q = Query::new("hi");
        let m = ModelId::new("a");
        let r = p.reward(&q, &m, &inputs(1.0, 0.0, 0), 0.0);
        assert!((0.0..=1.0).contains(&r));
    }

    #[test]
    fn cache_hit_uses_p95_fallback_instead_of_near_zero_latency() {
        let p = policy();
        let q = Query::new("hi");
        let m = ModelId::new("a");
        let mut cached = inputs(0.8, 0.0, 100);
        cached.served_from_cache = true;
        let with_slow_p95 = p.reward(&q, &m, &cached, 10.0);
        let with_fast_p95 = p.reward(&q, &m, &cached, 0.1);
        assert!(with_fast_p95 > with_slow_p95);
    }
}
