//! Structured telemetry emitted once per race, both returned to the caller
//! and logged as a single `tracing` event.

use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;

use crate::query::ModelId;

#[derive(Debug, Clone, Serialize)]
pub enum FullStatus {
    Ok,
    Error,
    Cancelled,
    BudgetExceeded,
    NotAttempted,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelSummary {
    pub selected_rank: usize,
    pub preview_latency_secs: f64,
    pub preview_tokens: u64,
    pub preview_from_cache: bool,
    pub judge_overall: f64,
    pub full_attempted: bool,
    pub full_status: FullStatus,
    pub full_latency_secs: Option<f64>,
    pub full_tokens: u64,
    pub reward: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub query_id: uuid::Uuid,
    pub query_char_len: usize,
    pub strategy: &'static str,
    pub context: Vec<f64>,
    pub per_model: HashMap<ModelId, ModelSummary>,
    pub total_tokens: u64,
    pub total_cost_usd: f64,
    pub fallback_count: u32,
    pub cache_hit_count: u32,
    pub wall_clock_secs: f64,
    pub winner: Option<ModelId>,
}

impl RunSummary {
    pub fn log(&self) {
        tracing::info!(
            query_id = %self.query_id,
            strategy = self.strategy,
            total_tokens = self.total_tokens,
            total_cost_usd = self.total_cost_usd,
            fallback_count = self.fallback_count,
            cache_hit_count = self.cache_hit_count,
            wall_clock_secs = self.wall_clock_secs,
            winner = ?self.winner,
            "race summary",
        );
    }
}

pub fn duration_secs(d: Duration) -> f64 {
    d.as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_summary_serializes_to_json() {
        let summary = RunSummary {
            query_id: uuid::Uuid::nil(),
            query_char_len: 5,
            strategy: "sequential_fallback",
            context: vec![1.0, 0.5, 0.5],
            per_model: HashMap::new(),
            total_tokens: 0,
            total_cost_usd: 0.0,
            fallback_count: 0,
            cache_hit_count: 0,
            wall_clock_secs: 0.01,
            winner: None,
        };
        let json = serde_json::to_string(&summary).unwrap();
        assert!(json.contains("sequential_fallback"));
    }
}
