//! Process configuration, read from the environment. Every field defaults
//! so the binary runs with no configuration at all (against mock backends).

use std::env;
use std::time::Duration;

use crate::error::{RaceError, Result};

fn env_f64(key: &str, default: f64) -> Result<f64> {
    match env::var(key) {
        Ok(v) => v
            .parse()
            .map_err(|_| RaceError::Config(format!("{key} must be a number, got {v:?}"))),
        Err(_) => Ok(default),
    }
}

fn env_usize(key: &str, default: usize) -> Result<usize> {
    match env::var(key) {
        Ok(v) => v
            .parse()
            .map_err(|_| RaceError::Config(format!("{key} must be a non-negative integer, got {v:?}"))),
        Err(_) => Ok(default),
    }
}

fn env_u32(key: &str, default: u32) -> Result<u32> {
    match env::var(key) {
        Ok(v) => v
            .parse()
            .map_err(|_| RaceError::Config(format!("{key} must be a non-negative integer, got {v:?}"))),
        Err(_) => Ok(default),
    }
}

fn env_duration_secs(key: &str, default_secs: f64) -> Result<Duration> {
    Ok(Duration::from_secs_f64(env_f64(key, default_secs)?))
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_models(key: &str) -> Vec<String> {
    env::var(key)
        .ok()
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

fn env_opt_string(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

/// Which `Router` implementation drives candidate selection: the learning
/// `LinUcbRouter` or the fixed-order `BaselineRouter` control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Baseline,
    Bandit,
}

impl std::str::FromStr for Strategy {
    type Err = RaceError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "baseline" => Ok(Strategy::Baseline),
            "bandit" => Ok(Strategy::Bandit),
            other => Err(RaceError::Config(format!(
                "strategy must be \"baseline\" or \"bandit\", got {other:?}"
            ))),
        }
    }
}

fn env_strategy(key: &str, default: Strategy) -> Result<Strategy> {
    match env::var(key) {
        Ok(v) => v.parse(),
        Err(_) => Ok(default),
    }
}

/// All tunables named in the external-interfaces table, defaulted per the
/// values documented alongside each component.
#[derive(Debug, Clone)]
pub struct RaceConfig {
    pub candidate_models: Vec<String>,
    pub judge_model: Option<String>,
    pub strategy: Strategy,
    pub state_remote_key: Option<String>,
    /// Connection URL for the optional remote state backend (e.g. a redis
    /// URL). Only consulted when the `redis-backend` feature is compiled in.
    pub state_remote_url: Option<String>,

    pub router_alpha: f64,
    pub router_lambda: f64,
    pub router_latency_bias_scale: f64,
    pub router_reference_latency_secs: f64,
    pub context_dim_embedding_slots: usize,

    pub length_threshold_chars: f64,
    pub word_threshold_words: f64,

    pub reward_weight_quality: f64,
    pub reward_weight_latency: f64,
    pub reward_weight_cost: f64,
    pub reward_fallback_penalty: f64,
    /// USD per token when no per-model price table is configured; tokens
    /// themselves become the cost proxy at the default of 1.0.
    pub default_price_per_token: f64,

    pub min_preview_tokens: usize,
    pub adaptive_min_scale: f64,
    pub adaptive_max_scale: f64,
    pub speculative_min_query_length: usize,
    pub max_total_full_tokens: u64,
    pub max_total_cost_usd: f64,
    pub preview_timeout: Duration,
    pub full_timeout: Duration,
    pub judge_timeout: Duration,
    pub preview_retry_limit: u32,
    pub judge_retry_limit: u32,

    pub cache_ttl_secs: u64,
    pub latency_window_capacity: usize,

    pub state_store_path: String,
}

impl Default for RaceConfig {
    fn default() -> Self {
        RaceConfig {
            candidate_models: Vec::new(),
            judge_model: None,
            strategy: Strategy::Bandit,
            state_remote_key: None,
            state_remote_url: None,
            router_alpha: 0.5,
            router_lambda: 1.0,
            router_latency_bias_scale: 0.1,
            router_reference_latency_secs: 3.0,
            context_dim_embedding_slots: 0,
            length_threshold_chars: 2000.0,
            word_threshold_words: 400.0,
            reward_weight_quality: 0.6,
            reward_weight_latency: 0.25,
            reward_weight_cost: 0.15,
            reward_fallback_penalty: 0.2,
            default_price_per_token: 1.0,
            min_preview_tokens: 120,
            adaptive_min_scale: 0.75,
            adaptive_max_scale: 1.5,
            speculative_min_query_length: 2000,
            max_total_full_tokens: 20_000,
            max_total_cost_usd: 1.0,
            preview_timeout: Duration::from_secs(8),
            full_timeout: Duration::from_secs(60),
            judge_timeout: Duration::from_secs(10),
            preview_retry_limit: 2,
            judge_retry_limit: 3,
            cache_ttl_secs: 600,
            latency_window_capacity: 128,
            state_store_path: "raceroute-state.json".to_string(),
        }
    }
}

impl RaceConfig {
    /// Build configuration from the environment, falling back to the
    /// documented defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        let defaults = RaceConfig::default();
        let config = RaceConfig {
            candidate_models: {
                let m = env_models("RACEROUTE_MODELS");
                if m.is_empty() { defaults.candidate_models } else { m }
            },
            judge_model: env_opt_string("RACEROUTE_JUDGE_MODEL").or(defaults.judge_model),
            strategy: env_strategy("RACEROUTE_STRATEGY", defaults.strategy)?,
            state_remote_key: env_opt_string("RACEROUTE_STATE_REMOTE_KEY")
                .or(defaults.state_remote_key),
            state_remote_url: env_opt_string("RACEROUTE_STATE_REMOTE_URL")
                .or(defaults.state_remote_url),
            router_alpha: env_f64("RACEROUTE_ROUTER_ALPHA", defaults.router_alpha)?,
            router_lambda: env_f64("RACEROUTE_ROUTER_LAMBDA", defaults.router_lambda)?,
            router_latency_bias_scale: env_f64(
                "RACEROUTE_ROUTER_LATENCY_BIAS_SCALE",
                defaults.router_latency_bias_scale,
            )?,
            router_reference_latency_secs: env_f64(
                "RACEROUTE_ROUTER_REFERENCE_LATENCY_SECS",
                defaults.router_reference_latency_secs,
            )?,
            context_dim_embedding_slots: env_usize(
                "RACEROUTE_EMBEDDING_SLOTS",
                defaults.context_dim_embedding_slots,
            )?,
            length_threshold_chars: env_f64(
                "RACEROUTE_LENGTH_THRESHOLD_CHARS",
                defaults.length_threshold_chars,
            )?,
            word_threshold_words: env_f64(
                "RACEROUTE_WORD_THRESHOLD_WORDS",
                defaults.word_threshold_words,
            )?,
            reward_weight_quality: env_f64(
                "RACEROUTE_REWARD_WEIGHT_QUALITY",
                defaults.reward_weight_quality,
            )?,
            reward_weight_latency: env_f64(
                "RACEROUTE_REWARD_WEIGHT_LATENCY",
                defaults.reward_weight_latency,
            )?,
            reward_weight_cost: env_f64(
                "RACEROUTE_REWARD_WEIGHT_COST",
                defaults.reward_weight_cost,
            )?,
            reward_fallback_penalty: env_f64(
                "RACEROUTE_REWARD_FALLBACK_PENALTY",
                defaults.reward_fallback_penalty,
            )?,
            default_price_per_token: env_f64(
                "RACEROUTE_DEFAULT_PRICE_PER_TOKEN",
                defaults.default_price_per_token,
            )?,
            min_preview_tokens: env_usize(
                "RACEROUTE_MIN_PREVIEW_TOKENS",
                defaults.min_preview_tokens,
            )?,
            adaptive_min_scale: env_f64(
                "RACEROUTE_ADAPTIVE_MIN_SCALE",
                defaults.adaptive_min_scale,
            )?,
            adaptive_max_scale: env_f64(
                "RACEROUTE_ADAPTIVE_MAX_SCALE",
                defaults.adaptive_max_scale,
            )?,
            speculative_min_query_length: env_usize(
                "RACEROUTE_SPECULATIVE_MIN_QUERY_LENGTH",
                defaults.speculative_min_query_length,
            )?,
            max_total_full_tokens: env_usize(
                "RACEROUTE_MAX_TOTAL_FULL_TOKENS",
                defaults.max_total_full_tokens as usize,
            )? as u64,
            max_total_cost_usd: env_f64(
                "RACEROUTE_MAX_TOTAL_COST_USD",
                defaults.max_total_cost_usd,
            )?,
            preview_timeout: env_duration_secs(
                "RACEROUTE_PREVIEW_TIMEOUT_SECS",
                defaults.preview_timeout.as_secs_f64(),
            )?,
            full_timeout: env_duration_secs(
                "RACEROUTE_FULL_TIMEOUT_SECS",
                defaults.full_timeout.as_secs_f64(),
            )?,
            judge_timeout: env_duration_secs(
                "RACEROUTE_JUDGE_TIMEOUT_SECS",
                defaults.judge_timeout.as_secs_f64(),
            )?,
            preview_retry_limit: env_u32(
                "RACEROUTE_PREVIEW_RETRY_LIMIT",
                defaults.preview_retry_limit,
            )?,
            judge_retry_limit: env_u32("RACEROUTE_JUDGE_RETRY_LIMIT", defaults.judge_retry_limit)?,
            cache_ttl_secs: env_usize("RACEROUTE_CACHE_TTL_SECS", defaults.cache_ttl_secs as usize)?
                as u64,
            latency_window_capacity: env_usize(
                "RACEROUTE_LATENCY_WINDOW_CAPACITY",
                defaults.latency_window_capacity,
            )?,
            state_store_path: env_string("RACEROUTE_STATE_PATH", &defaults.state_store_path),
        };

        if config.reward_weight_quality + config.reward_weight_latency + config.reward_weight_cost
            > 1.0 + 1e-9
        {
            return Err(RaceError::Config(
                "reward weights (quality + latency + cost) must not exceed 1.0".to_string(),
            ));
        }
        Ok(config)
    }

    /// Total context vector dimension: bias + length + word-count + embedding slots.
    pub fn context_dim(&self) -> usize {
        3 + self.context_dim_embedding_slots
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_satisfy_weight_invariant() {
        let c = RaceConfig::default();
        assert!(c.reward_weight_quality + c.reward_weight_latency + c.reward_weight_cost <= 1.0);
    }

    #[test]
    fn context_dim_accounts_for_embedding_slots() {
        let mut c = RaceConfig::default();
        c.context_dim_embedding_slots = 4;
        assert_eq!(c.context_dim(), 7);
    }

    #[test]
    fn strategy_parses_known_values_case_insensitively() {
        assert_eq!("Bandit".parse::<Strategy>().unwrap(), Strategy::Bandit);
        assert_eq!("baseline".parse::<Strategy>().unwrap(), Strategy::Baseline);
        assert!("quantum".parse::<Strategy>().is_err());
    }
}
