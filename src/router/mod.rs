//! Candidate selection and the state it keeps between races.

pub mod linucb;

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::query::{ContextVector, ModelId};

pub use linucb::LinUcbRouter;

/// Per-arm bandit state: inverse covariance matrix (row-major, `dim x dim`)
/// and response vector, plus trial/win counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArmState {
    pub a_inv: Vec<f64>,
    pub b: Vec<f64>,
    pub dim: usize,
    pub trials: u64,
    pub wins: u64,
    pub deactivated: bool,
}

impl ArmState {
    /// `A_inv = (1/lambda) * I`, `b = 0`.
    pub fn new(dim: usize, lambda: f64) -> Self {
        let mut a_inv = vec![0.0; dim * dim];
        let inv_lambda = 1.0 / lambda;
        for i in 0..dim {
            a_inv[i * dim + i] = inv_lambda;
        }
        ArmState {
            a_inv,
            b: vec![0.0; dim],
            dim,
            trials: 0,
            wins: 0,
            deactivated: false,
        }
    }

    pub fn win_rate(&self) -> f64 {
        if self.trials == 0 {
            0.0
        } else {
            self.wins as f64 / self.trials as f64
        }
    }
}

/// Full persisted router state: schema-checked dimension plus every arm
/// observed so far, keyed by model for deterministic serialization order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterState {
    pub dim: usize,
    pub arms: BTreeMap<ModelId, ArmState>,
}

impl RouterState {
    pub fn new(dim: usize) -> Self {
        RouterState { dim, arms: BTreeMap::new() }
    }
}

/// Capability every candidate-selection strategy implements.
#[async_trait::async_trait]
pub trait Router: Send + Sync {
    /// Rank `candidates` for this context, optionally truncating to `top_k`.
    async fn select(
        &self,
        context: &ContextVector,
        candidates: &[ModelId],
        top_k: Option<usize>,
    ) -> Result<Vec<ModelId>>;

    /// Apply one round of reward updates. `top_ranked` identifies the
    /// judge's winner for win-rate bookkeeping.
    async fn bulk_update(
        &self,
        context: &ContextVector,
        rewards: &HashMap<ModelId, f64>,
        top_ranked: Option<&ModelId>,
    ) -> Result<()>;

    async fn save(&self) -> Result<()>;
    async fn load(&self) -> Result<()>;
}

/// Trivial control router: candidates in supplied order, no learning.
pub struct BaselineRouter;

#[async_trait::async_trait]
impl Router for BaselineRouter {
    async fn select(
        &self,
        _context: &ContextVector,
        candidates: &[ModelId],
        top_k: Option<usize>,
    ) -> Result<Vec<ModelId>> {
        let mut out = candidates.to_vec();
        if let Some(k) = top_k {
            out.truncate(k);
        }
        Ok(out)
    }

    async fn bulk_update(
        &self,
        _context: &ContextVector,
        _rewards: &HashMap<ModelId, f64>,
        _top_ranked: Option<&ModelId>,
    ) -> Result<()> {
        Ok(())
    }

    async fn save(&self) -> Result<()> {
        Ok(())
    }

    async fn load(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn baseline_router_preserves_order_and_truncates() {
        let router = BaselineRouter;
        let candidates = vec![ModelId::new("a"), ModelId::new("b"), ModelId::new("c")];
        let ctx = ContextVector(vec![1.0]);
        let selected = router.select(&ctx, &candidates, Some(2)).await.unwrap();
        assert_eq!(selected, vec![ModelId::new("a"), ModelId::new("b")]);
    }

    #[test]
    fn new_arm_state_is_identity_over_lambda() {
        let arm = ArmState::new(2, 2.0);
        assert_eq!(arm.a_inv, vec![0.5, 0.0, 0.0, 0.5]);
        assert_eq!(arm.b, vec![0.0, 0.0]);
    }
}
