//! LinUCB contextual bandit router: per-arm inverse-covariance matrix
//! maintained incrementally via Sherman-Morrison, UCB scoring biased by
//! observed p95 latency.
//!
//! The update rule keeps `A_inv` current directly rather than storing `A`
//! and re-inverting it on every update; this is the one place this router
//! deliberately diverges from the simpler re-invert-per-call approach seen
//! elsewhere in the wild, in favor of the incremental form the algorithm
//! actually calls for.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use tracing::warn;

use crate::error::{RaceError, Result};
use crate::latency::LatencyMetrics;
use crate::query::{ContextVector, ModelId};
use crate::state_store::RouterStateStore;

use super::{ArmState, Router, RouterState};

fn mat_vec_mul(a: &[f64], x: &[f64], dim: usize) -> Vec<f64> {
    (0..dim)
        .map(|i| (0..dim).map(|j| a[i * dim + j] * x[j]).sum())
        .collect()
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Tunables for arm scoring and update.
#[derive(Debug, Clone)]
pub struct LinUcbConfig {
    pub alpha: f64,
    pub lambda: f64,
    pub latency_bias_scale: f64,
    pub reference_latency_secs: f64,
}

pub struct LinUcbRouter {
    state: Mutex<RouterState>,
    store: Arc<dyn RouterStateStore>,
    latency: Arc<LatencyMetrics>,
    config: LinUcbConfig,
}

impl LinUcbRouter {
    pub fn new(
        dim: usize,
        store: Arc<dyn RouterStateStore>,
        latency: Arc<LatencyMetrics>,
        config: LinUcbConfig,
    ) -> Self {
        LinUcbRouter {
            state: Mutex::new(RouterState::new(dim)),
            store,
            latency,
            config,
        }
    }

    fn dim(&self) -> usize {
        self.state.lock().expect("router state lock poisoned").dim
    }

    fn ensure_arm<'a>(state: &'a mut RouterState, model: &ModelId, lambda: f64) -> &'a mut ArmState {
        let dim = state.dim;
        state
            .arms
            .entry(model.clone())
            .or_insert_with(|| ArmState::new(dim, lambda))
    }

    /// Multiplicatively inflates uncertainty and decays accumulated reward,
    /// letting stale evidence matter less over time.
    pub fn decay(&self, factor: f64) {
        assert!(factor > 0.0 && factor <= 1.0, "decay factor must be in (0, 1]");
        let mut state = self.state.lock().expect("router state lock poisoned");
        for arm in state.arms.values_mut() {
            for v in arm.a_inv.iter_mut() {
                *v /= factor;
            }
            for v in arm.b.iter_mut() {
                *v *= factor;
            }
        }
    }

    /// Deactivates arms with enough trials but a poor win rate; history is
    /// kept, only `select` stops offering them.
    pub fn prune(&self, min_trials: u64, min_win_rate: f64) {
        let mut state = self.state.lock().expect("router state lock poisoned");
        for arm in state.arms.values_mut() {
            if arm.trials >= min_trials && arm.win_rate() < min_win_rate {
                arm.deactivated = true;
            }
        }
    }
}

#[async_trait::async_trait]
impl Router for LinUcbRouter {
    async fn select(
        &self,
        context: &ContextVector,
        candidates: &[ModelId],
        top_k: Option<usize>,
    ) -> Result<Vec<ModelId>> {
        let dim = self.dim();
        if context.dim() != dim {
            return Err(RaceError::DimensionMismatch { expected: dim, actual: context.dim() });
        }
        let x = context.as_slice();

        let mut scored: Vec<(ModelId, f64)> = {
            let mut state = self.state.lock().expect("router state lock poisoned");
            candidates
                .iter()
                .filter_map(|model| {
                    let arm = Self::ensure_arm(&mut state, model, self.config.lambda);
                    if arm.deactivated {
                        return None;
                    }
                    let theta = mat_vec_mul(&arm.a_inv, &arm.b, dim);
                    let mean = dot(&theta, x);
                    let quad = dot(&mat_vec_mul(&arm.a_inv, x, dim), x).max(0.0);
                    let uncertainty = quad.sqrt();
                    let ucb = mean + self.config.alpha * uncertainty;
                    let latency_norm =
                        self.latency.p95_norm(model, self.config.reference_latency_secs);
                    let adjusted = ucb - self.config.latency_bias_scale * latency_norm;
                    Some((model.clone(), adjusted))
                })
                .collect()
        };

        // Stable sort descending by score; ties keep candidates' relative
        // (insertion) order, matching `sort_by` being stable.
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        let mut ranked: Vec<ModelId> = scored.into_iter().map(|(m, _)| m).collect();
        if let Some(k) = top_k {
            ranked.truncate(k);
        }
        Ok(ranked)
    }

    async fn bulk_update(
        &self,
        context: &ContextVector,
        rewards: &HashMap<ModelId, f64>,
        top_ranked: Option<&ModelId>,
    ) -> Result<()> {
        let dim = self.dim();
        if context.dim() != dim {
            return Err(RaceError::DimensionMismatch { expected: dim, actual: context.dim() });
        }
        let x = context.as_slice();

        {
            let mut state = self.state.lock().expect("router state lock poisoned");
            for (model, &reward) in rewards {
                if !reward.is_finite() || !(0.0..=1.0).contains(&reward) {
                    warn!(model = %model, reward, "skipping non-finite or out-of-range reward");
                    continue;
                }
                let arm = Self::ensure_arm(&mut state, model, self.config.lambda);

                let v = mat_vec_mul(&arm.a_inv, x, dim);
                let s = 1.0 + dot(x, &v);
                if s <= 0.0 {
                    warn!(model = %model, s, "numerical anomaly updating arm; skipping update");
                    continue;
                }
                for i in 0..dim {
                    for j in 0..dim {
                        arm.a_inv[i * dim + j] -= v[i] * v[j] / s;
                    }
                }
                for i in 0..dim {
                    arm.b[i] += reward * x[i];
                }
                arm.trials += 1;
                if top_ranked == Some(model) {
                    arm.wins += 1;
                }
            }
        }
        self.save().await
    }

    async fn save(&self) -> Result<()> {
        let state = self.state.lock().expect("router state lock poisoned").clone();
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        self.store.save(&state, now).await
    }

    async fn load(&self) -> Result<()> {
        let dim = self.dim();
        match self.store.load().await? {
            Some(loaded) if loaded.dim == dim => {
                *self.state.lock().expect("router state lock poisoned") = loaded;
            }
            Some(loaded) => {
                warn!(
                    expected = dim,
                    actual = loaded.dim,
                    "router state dimension mismatch on load; reinitializing"
                );
                *self.state.lock().expect("router state lock poisoned") = RouterState::new(dim);
            }
            None => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_store::LocalFileStateStore;
    use std::collections::HashMap;

    fn make_router(dim: usize) -> LinUcbRouter {
        let store: Arc<dyn RouterStateStore> =
            Arc::new(LocalFileStateStore::new(std::env::temp_dir().join("linucb-test-unused.json")));
        let latency = Arc::new(LatencyMetrics::new(32));
        LinUcbRouter::new(
            dim,
            store,
            latency,
            LinUcbConfig { alpha: 0.5, lambda: 1.0, latency_bias_scale: 0.1, reference_latency_secs: 3.0 },
        )
    }

    #[tokio::test]
    async fn select_ranks_higher_reward_arm_first() {
        let router = make_router(2);
        let ctx = ContextVector(vec![1.0, 1.0]);
        let a = ModelId::new("a");
        let b = ModelId::new("b");
        let candidates = vec![a.clone(), b.clone()];

        // Train `a` with strong positive reward repeatedly so its posterior
        // mean clearly exceeds `b`'s, which sees nothing.
        for _ in 0..20 {
            let mut rewards = HashMap::new();
            rewards.insert(a.clone(), 1.0);
            router.bulk_update(&ctx, &rewards, Some(&a)).await.unwrap();
        }

        let ranked = router.select(&ctx, &candidates, None).await.unwrap();
        assert_eq!(ranked[0], a);
    }

    #[tokio::test]
    async fn fifty_rounds_of_length_split_rewards_teach_select_the_right_arm() {
        let router = make_router(3);
        let a = ModelId::new("a");
        let b = ModelId::new("b");
        let c = ModelId::new("c");
        let candidates = vec![a.clone(), b.clone(), c.clone()];

        // length_norm clipped to [0, 2]; "long" queries sit above 1, "short"
        // queries below. `a` wins on long queries, `b` on short ones, `c`
        // never wins.
        let long_ctx = ContextVector(vec![1.0, 2.0, 0.5]);
        let short_ctx = ContextVector(vec![1.0, 0.3, 0.2]);
        for _ in 0..50 {
            let mut long_rewards = HashMap::new();
            long_rewards.insert(a.clone(), 1.0);
            long_rewards.insert(b.clone(), 0.0);
            long_rewards.insert(c.clone(), 0.0);
            router.bulk_update(&long_ctx, &long_rewards, Some(&a)).await.unwrap();

            let mut short_rewards = HashMap::new();
            short_rewards.insert(a.clone(), 0.0);
            short_rewards.insert(b.clone(), 1.0);
            short_rewards.insert(c.clone(), 0.0);
            router.bulk_update(&short_ctx, &short_rewards, Some(&b)).await.unwrap();
        }

        let query_ctx = ContextVector(vec![1.0, 2.0, 0.5]); // 4000-char-equivalent, length_norm = 2
        let ranked = router.select(&query_ctx, &candidates, None).await.unwrap();
        assert_eq!(ranked[0], a);
    }

    #[tokio::test]
    async fn dimension_mismatch_is_rejected() {
        let router = make_router(3);
        let ctx = ContextVector(vec![1.0, 1.0]);
        let candidates = vec![ModelId::new("a")];
        let err = router.select(&ctx, &candidates, None).await.unwrap_err();
        assert!(matches!(err, RaceError::DimensionMismatch { .. }));
    }

    #[tokio::test]
    async fn deactivated_arm_is_excluded_from_selection() {
        let router = make_router(1);
        let ctx = ContextVector(vec![1.0]);
        let a = ModelId::new("a");
        let mut rewards = HashMap::new();
        rewards.insert(a.clone(), 0.0);
        router.bulk_update(&ctx, &rewards, None).await.unwrap();
        router.prune(0, 1.0); // win_rate 0 < 1.0 for every trialed arm
        let ranked = router.select(&ctx, &[a], None).await.unwrap();
        assert!(ranked.is_empty());
    }

    #[tokio::test]
    async fn decay_inflates_uncertainty_and_shrinks_b() {
        let router = make_router(1);
        let ctx = ContextVector(vec![1.0]);
        let a = ModelId::new("a");
        let mut rewards = HashMap::new();
        rewards.insert(a.clone(), 1.0);
        router.bulk_update(&ctx, &rewards, Some(&a)).await.unwrap();
        let before_b = router.state.lock().unwrap().arms.get(&a).unwrap().b.clone();
        router.decay(0.5);
        let after = router.state.lock().unwrap();
        let arm = after.arms.get(&a).unwrap();
        assert!(arm.b[0] < before_b[0]);
    }

    #[tokio::test]
    async fn sherman_morrison_update_recovers_observed_reward_under_a_weak_prior() {
        // A near-zero lambda makes the prior negligible, so a single
        // observation's posterior mean should land close to the reward
        // itself rather than being shrunk toward zero.
        let store: Arc<dyn RouterStateStore> =
            Arc::new(LocalFileStateStore::new(std::env::temp_dir().join("linucb-s3-unused.json")));
        let latency = Arc::new(LatencyMetrics::new(8));
        let router = LinUcbRouter::new(
            2,
            store,
            latency,
            LinUcbConfig { alpha: 0.0, lambda: 1e-6, latency_bias_scale: 0.0, reference_latency_secs: 3.0 },
        );
        let a = ModelId::new("a");
        let ctx = ContextVector(vec![1.0, 0.0]);
        let mut rewards = HashMap::new();
        rewards.insert(a.clone(), 0.5);
        router.bulk_update(&ctx, &rewards, Some(&a)).await.unwrap();

        // alpha = 0 and latency_bias_scale = 0 collapse `select`'s UCB score
        // to the bare posterior mean theta . x, so ranking a lone arm against
        // an untrained one exposes the sign/magnitude of that mean:
        // an untrained arm's mean is exactly 0, so "a" outranking it only
        // confirms theta . x > 0. To check the magnitude directly, read the
        // arm's theta . x via the same matrix-vector form `select` uses.
        let state = router.state.lock().unwrap();
        let arm = state.arms.get(&a).unwrap();
        let theta = mat_vec_mul(&arm.a_inv, &arm.b, arm.dim);
        let theta_dot_x = dot(&theta, &ctx.0);
        assert!(
            (theta_dot_x - 0.5).abs() < 1e-3,
            "expected theta . x close to the observed reward 0.5, got {theta_dot_x}"
        );
    }
}
