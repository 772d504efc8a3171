//! CLI entrypoint: build every race dependency from `RaceConfig`, run one
//! race for the prompt given on the command line, and print the winner's
//! answer.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use eyre::Result;

use crate::display::{self, AnyDisplay};
use raceroute::cache::LocalPreviewCache;
use raceroute::config::{RaceConfig, Strategy};
use raceroute::error::RaceError;
use raceroute::features::{
    DeterministicHashEmbeddingProvider, FeatureExtractor, NullEmbeddingProvider,
};
use raceroute::judge::{Judge, LengthHeuristicJudge, LlmJudge};
use raceroute::latency::LatencyMetrics;
use raceroute::logging;
use raceroute::model_client::{HttpModelClient, MockModelClient, ModelClient};
use raceroute::router::linucb::LinUcbConfig;
use raceroute::router::{BaselineRouter, LinUcbRouter, Router};
use raceroute::state_store::{LocalFileStateStore, RouterStateStore};
use raceroute::{ModelId, Query, RaceOrchestrator};
use raceroute::reward::QualityLatencyCostPolicy;

/// CLI entrypoint: parse the prompt from argv, wire a race from the
/// environment, run it, and print the winning answer to stdout.
pub async fn run() -> Result<()> {
    logging::init();

    let config = match RaceConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err}");
            std::process::exit(2);
        }
    };

    let prompt = {
        let mut args = std::env::args();
        let _ = args.next(); // binary name
        args.collect::<Vec<String>>().join(" ")
    };
    if prompt.trim().is_empty() {
        eprintln!("usage: raceroute <query text>");
        std::process::exit(2);
    }
    if config.candidate_models.is_empty() {
        eprintln!("configuration error: RACEROUTE_MODELS must list at least one candidate model");
        std::process::exit(2);
    }

    let display = display::make_display();
    let orchestrator = build_orchestrator(&config);

    match orchestrator.run(Query::new(prompt)).await {
        Ok(result) => {
            display.show_delta(&result.answer).await;
            display.end_answer().await;
            Ok(())
        }
        Err(err) => {
            display.show_log(&format!("race failed: {err}")).await;
            std::process::exit(exit_code_for(&err));
        }
    }
}

/// Build a fully wired orchestrator from configuration. Separated from
/// `run` so integration tests can construct one without going through
/// argv/env parsing.
pub fn build_orchestrator(config: &RaceConfig) -> RaceOrchestrator {
    let base_url = std::env::var("RACEROUTE_BASE_URL").ok();
    let api_key = std::env::var("RACEROUTE_API_KEY").ok();

    let mut clients: HashMap<ModelId, Arc<dyn ModelClient>> = HashMap::new();
    for name in &config.candidate_models {
        let model = ModelId::new(name.clone());
        let client: Arc<dyn ModelClient> = match &base_url {
            Some(url) => {
                Arc::new(HttpModelClient::new(model.clone(), url.clone(), api_key.clone()))
            }
            None => Arc::new(MockModelClient::new(
                model.clone(),
                demo_tokens(name),
                Duration::from_millis(30),
            )),
        };
        clients.insert(model, client);
    }

    let judge: Arc<dyn Judge> = match (&base_url, &config.judge_model) {
        (Some(url), Some(judge_model)) => Arc::new(LlmJudge::new(
            HttpModelClient::new(ModelId::new(judge_model.clone()), url.clone(), api_key.clone()),
            512,
        )),
        _ => Arc::new(LengthHeuristicJudge),
    };

    let embedding_slots = config.context_dim_embedding_slots;
    let embedding_provider: Box<dyn raceroute::features::EmbeddingProvider> = if embedding_slots > 0 {
        Box::new(DeterministicHashEmbeddingProvider::new(embedding_slots.max(16)))
    } else {
        Box::new(NullEmbeddingProvider)
    };
    let feature_extractor = FeatureExtractor::new(
        config.length_threshold_chars,
        config.word_threshold_words,
        embedding_slots,
        embedding_provider,
        0xC0FFEE,
    );

    let latency = Arc::new(LatencyMetrics::new(config.latency_window_capacity));
    let cache = Arc::new(LocalPreviewCache::new());
    let state_store = build_state_store(config);

    let router: Arc<dyn Router> = match config.strategy {
        Strategy::Baseline => Arc::new(BaselineRouter),
        Strategy::Bandit => Arc::new(LinUcbRouter::new(
            config.context_dim(),
            state_store,
            latency.clone(),
            LinUcbConfig {
                alpha: config.router_alpha,
                lambda: config.router_lambda,
                latency_bias_scale: config.router_latency_bias_scale,
                reference_latency_secs: config.router_reference_latency_secs,
            },
        )),
    };

    let reward_policy = Arc::new(QualityLatencyCostPolicy {
        weight_quality: config.reward_weight_quality,
        weight_latency: config.reward_weight_latency,
        weight_cost: config.reward_weight_cost,
        fallback_penalty: config.reward_fallback_penalty,
        length_threshold_chars: config.length_threshold_chars,
        reference_latency_floor_secs: config.router_reference_latency_secs,
        price_per_token: HashMap::new(),
        default_price_per_token: config.default_price_per_token,
    });

    RaceOrchestrator::new(
        config.clone(),
        feature_extractor,
        router,
        reward_policy,
        latency,
        cache,
        clients,
        judge,
    )
}

/// Wires the local file store alone, or layers a redis-backed remote on top
/// when both the feature and `RACEROUTE_STATE_REMOTE_URL` are present.
#[cfg(not(feature = "redis-backend"))]
fn build_state_store(config: &RaceConfig) -> Arc<dyn RouterStateStore> {
    Arc::new(LocalFileStateStore::new(config.state_store_path.clone()))
}

#[cfg(feature = "redis-backend")]
fn build_state_store(config: &RaceConfig) -> Arc<dyn RouterStateStore> {
    use raceroute::state_store::redis_kv::RedisKv;
    use raceroute::state_store::LayeredStateStore;

    let local = LocalFileStateStore::new(config.state_store_path.clone());
    match &config.state_remote_url {
        Some(url) => match RedisKv::new(url) {
            Ok(remote) => {
                let key = config
                    .state_remote_key
                    .clone()
                    .unwrap_or_else(|| "raceroute:router-state".to_string());
                Arc::new(LayeredStateStore::new(local, remote, key))
            }
            Err(err) => {
                eprintln!("redis state backend disabled: {err}");
                Arc::new(local)
            }
        },
        None => Arc::new(local),
    }
}

/// Maps the error taxonomy to the exit codes documented in the external
/// interfaces table.
fn exit_code_for(err: &RaceError) -> i32 {
    match err {
        RaceError::Config(_) => 2,
        RaceError::AllPreviewsFailed => 3,
        RaceError::JudgeFailure { .. } => 4,
        RaceError::BudgetExceeded { .. } => 5,
        RaceError::AllFullAttemptsFailed => 6,
        _ => 1,
    }
}

/// Filler response used when no real backend is configured (`RACEROUTE_BASE_URL`
/// unset), so the binary is runnable out of the box against mock candidates.
fn demo_tokens(model: &str) -> Vec<String> {
    vec![
        format!("[{model}] "),
        "this is a mock response ".to_string(),
        "generated without a configured backend. ".to_string(),
        "set RACEROUTE_BASE_URL to race real models.".to_string(),
    ]
}
