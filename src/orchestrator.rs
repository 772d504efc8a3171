//! Coordinates one race: preview fan-out, judge-gated ranking, full-answer
//! execution (ordered fallback or speculative top-2), and the reward
//! feedback that closes the loop back into the router.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::warn;

use crate::cache::{cache_key, PreviewCache};
use crate::config::RaceConfig;
use crate::error::{RaceError, Result};
use crate::features::FeatureExtractor;
use crate::judge::Judge;
use crate::latency::LatencyMetrics;
use crate::model_client::ModelClient;
use crate::query::{ModelId, Query};
use crate::reward::{RewardInputs, RewardPolicy};
use crate::router::Router;
use crate::summary::{FullStatus, ModelSummary, RunSummary};

/// One candidate's preview attempt.
#[derive(Debug, Clone)]
struct PreviewOutcome {
    model: ModelId,
    text: Option<String>,
    tokens_consumed: u64,
    latency_secs: f64,
    from_cache: bool,
}

/// Linearly maps `[0, length_threshold]` into `[min_scale, max_scale]`,
/// clamped at both ends.
fn adaptive_scale(char_len: usize, length_threshold: f64, min_scale: f64, max_scale: f64) -> f64 {
    if length_threshold <= 0.0 {
        return min_scale;
    }
    let t = (char_len as f64 / length_threshold).clamp(0.0, 1.0);
    min_scale + t * (max_scale - min_scale)
}

/// Everything the orchestrator needs to run a race; constructed once per
/// process and reused across queries.
pub struct RaceOrchestrator {
    config: RaceConfig,
    feature_extractor: FeatureExtractor,
    router: Arc<dyn Router>,
    reward_policy: Arc<dyn RewardPolicy>,
    latency: Arc<LatencyMetrics>,
    cache: Arc<dyn PreviewCache>,
    clients: HashMap<ModelId, Arc<dyn ModelClient>>,
    judge: Arc<dyn Judge>,
}

/// The final, user-visible result of a race.
pub struct RaceResult {
    pub answer: String,
    pub summary: RunSummary,
}

impl RaceOrchestrator {
    pub fn new(
        config: RaceConfig,
        feature_extractor: FeatureExtractor,
        router: Arc<dyn Router>,
        reward_policy: Arc<dyn RewardPolicy>,
        latency: Arc<LatencyMetrics>,
        cache: Arc<dyn PreviewCache>,
        clients: HashMap<ModelId, Arc<dyn ModelClient>>,
        judge: Arc<dyn Judge>,
    ) -> Self {
        RaceOrchestrator {
            config,
            feature_extractor,
            router,
            reward_policy,
            latency,
            cache,
            clients,
            judge,
        }
    }

    pub async fn run(&self, query: Query) -> Result<RaceResult> {
        let started_at = Instant::now();
        self.router.load().await?;

        let context = self.feature_extractor.compute(&query).await;
        let candidates: Vec<ModelId> = self.clients.keys().cloned().collect();
        let ranked = self.router.select(&context, &candidates, None).await?;
        if ranked.is_empty() {
            return Err(RaceError::AllPreviewsFailed);
        }

        let previews = self.run_previews(&query, &ranked).await;
        let successful: Vec<(ModelId, String)> = previews
            .iter()
            .filter_map(|p| p.text.clone().map(|t| (p.model.clone(), t)))
            .collect();
        if successful.is_empty() {
            return Err(RaceError::AllPreviewsFailed);
        }

        let judge_scores = self.run_judge(&query, &successful).await?;
        let mut full_order = judge_scores.ranking.clone();
        if full_order.is_empty() {
            full_order = successful.iter().map(|(m, _)| m.clone()).collect();
        }
        // Judge order is primarily by `overall`; equal scores are broken by
        // lower p95 latency, then lexicographically by model id, so ranking
        // is fully deterministic even when the judge returns ties.
        full_order.sort_by(|a, b| {
            judge_scores
                .overall(b)
                .partial_cmp(&judge_scores.overall(a))
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    self.latency
                        .p95(a)
                        .partial_cmp(&self.latency.p95(b))
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| a.as_str().cmp(b.as_str()))
        });

        let speculative = query.char_len() >= self.config.speculative_min_query_length;
        let mut full_attempts = HashMap::new();
        let budget = Arc::new(FullBudget::new(self.config.max_total_full_tokens, self.config.max_total_cost_usd));
        let full_result = if speculative && full_order.len() >= 2 {
            self.run_full_speculative(&query, &full_order, &mut full_attempts, budget.clone()).await
        } else {
            self.run_full_sequential(&query, &full_order, &mut full_attempts, budget.clone()).await
        };

        let rewards = self.compute_rewards(&query, &previews, &judge_scores, &full_attempts);

        // A budget breach still owes every model that participated a reward
        // update on the partial quality observed so far; only then does the
        // race surface the error to the caller.
        let (winner, answer) = match full_result {
            Ok(pair) => pair,
            Err(err) => {
                let _ = self.apply_rewards(&context, &rewards, None).await;
                return Err(err);
            }
        };

        let summary = self.build_summary(
            &query,
            &context,
            &previews,
            &judge_scores,
            &full_attempts,
            &rewards,
            winner.clone(),
            started_at.elapsed(),
        );

        self.apply_rewards(&context, &rewards, winner.as_ref()).await?;

        summary.log();
        Ok(RaceResult { answer, summary })
    }

    async fn run_previews(&self, query: &Query, ranked: &[ModelId]) -> Vec<PreviewOutcome> {
        let scale = adaptive_scale(
            query.char_len(),
            self.config.length_threshold_chars,
            self.config.adaptive_min_scale,
            self.config.adaptive_max_scale,
        );
        let cap = ((self.config.min_preview_tokens as f64) * scale).round() as usize;

        let tasks = ranked.iter().cloned().map(|model| {
            let query = query.clone();
            let cache = self.cache.clone();
            let latency = self.latency.clone();
            let client = self.clients.get(&model).cloned();
            let preview_timeout = self.config.preview_timeout;
            let retry_limit = self.config.preview_retry_limit;
            async move {
                let Some(client) = client else {
                    return PreviewOutcome {
                        model,
                        text: None,
                        tokens_consumed: 0,
                        latency_secs: 0.0,
                        from_cache: false,
                    };
                };
                let key = cache_key(&model, &query.text, cap);
                if let Some(text) = cache.get(&key).await {
                    return PreviewOutcome {
                        model,
                        text: Some(text),
                        tokens_consumed: 0,
                        latency_secs: 0.0,
                        from_cache: true,
                    };
                }

                let mut attempt = 0u32;
                loop {
                    let (tx, mut rx) = mpsc::unbounded_channel();
                    let start = Instant::now();
                    let result = timeout(preview_timeout, client.stream(&query, cap, tx)).await;
                    let mut buf = String::new();
                    while let Ok(Some(piece)) =
                        tokio::time::timeout(Duration::from_millis(1), rx.recv()).await
                    {
                        buf.push_str(&piece);
                    }
                    // Drain any remaining pieces once streaming finished.
                    while let Some(piece) = rx.recv().await {
                        buf.push_str(&piece);
                    }
                    let elapsed = start.elapsed().as_secs_f64();

                    match result {
                        Ok(Ok(outcome)) => {
                            latency.record(&model, elapsed);
                            cache.put(&key, buf.clone(), Duration::from_secs(600)).await;
                            let _ = outcome.tokens_consumed; // recorded via summary below
                            break PreviewOutcome {
                                model: model.clone(),
                                text: Some(buf),
                                tokens_consumed: outcome.tokens_consumed,
                                latency_secs: elapsed,
                                from_cache: false,
                            };
                        }
                        Ok(Err(e)) if e.is_transient() && attempt < retry_limit => {
                            attempt += 1;
                            tokio::time::sleep(Duration::from_millis(50 * (1u64 << attempt.min(6))))
                                .await;
                            continue;
                        }
                        Ok(Err(_)) => {
                            break PreviewOutcome {
                                model: model.clone(),
                                text: None,
                                tokens_consumed: 0,
                                latency_secs: elapsed,
                                from_cache: false,
                            };
                        }
                        Err(_) if attempt < retry_limit => {
                            attempt += 1;
                            tokio::time::sleep(Duration::from_millis(50 * (1u64 << attempt.min(6))))
                                .await;
                            continue;
                        }
                        Err(_) => {
                            warn!(model = %model, "preview timed out after retries");
                            break PreviewOutcome {
                                model: model.clone(),
                                text: None,
                                tokens_consumed: 0,
                                latency_secs: preview_timeout.as_secs_f64(),
                                from_cache: false,
                            };
                        }
                    }
                }
            }
        });

        futures::future::join_all(tasks).await
    }

    async fn run_judge(
        &self,
        query: &Query,
        previews: &[(ModelId, String)],
    ) -> Result<crate::judge::JudgeScores> {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match timeout(self.config.judge_timeout, self.judge.rank(query, previews)).await {
                Ok(Ok(scores)) => return Ok(scores),
                Ok(Err(_)) | Err(_) if attempts <= self.config.judge_retry_limit => continue,
                Ok(Err(e)) => {
                    return Err(RaceError::JudgeFailure { attempts, source: Box::new(e) })
                }
                Err(_) => {
                    return Err(RaceError::JudgeFailure {
                        attempts,
                        source: "judge timed out".into(),
                    })
                }
            }
        }
    }

    async fn run_full_sequential(
        &self,
        query: &Query,
        ranked: &[ModelId],
        attempts: &mut HashMap<ModelId, FullAttempt>,
        budget: Arc<FullBudget>,
    ) -> Result<(Option<ModelId>, String)> {
        for (idx, model) in ranked.iter().enumerate() {
            let Some(client) = self.clients.get(model).cloned() else { continue };
            let was_fallback = idx > 0;
            let price = self.reward_policy.price_per_token(model);
            let (tx, mut rx) = mpsc::unbounded_channel();
            let start = Instant::now();
            let stream_fut = client.stream(query, usize::MAX, tx);
            tokio::pin!(stream_fut);
            let mut buf = String::new();
            let mut model_tokens = 0u64;

            // Races the stream future against the piece channel directly
            // (rather than awaiting the stream to completion first) so the
            // budget is checked against every token as it lands, not after
            // the whole answer has already been generated.
            let raced = async {
                loop {
                    tokio::select! {
                        outcome = &mut stream_fut => break outcome,
                        piece = rx.recv() => {
                            let Some(piece) = piece else { continue };
                            buf.push_str(&piece);
                            model_tokens += 1;
                            if let Some(breach) = budget.record(price) {
                                break Err(breach);
                            }
                        }
                    }
                }
            };

            match timeout(self.config.full_timeout, raced).await {
                Ok(Ok(outcome)) => {
                    attempts.insert(
                        model.clone(),
                        FullAttempt {
                            status: FullStatus::Ok,
                            latency_secs: start.elapsed().as_secs_f64(),
                            tokens: outcome.tokens_consumed,
                            was_fallback,
                        },
                    );
                    let _ = outcome.status;
                    return Ok((Some(model.clone()), buf));
                }
                Ok(Err(budget_err @ RaceError::BudgetExceeded { .. })) => {
                    attempts.insert(
                        model.clone(),
                        FullAttempt {
                            status: FullStatus::BudgetExceeded,
                            latency_secs: start.elapsed().as_secs_f64(),
                            tokens: model_tokens,
                            was_fallback,
                        },
                    );
                    return Err(budget_err);
                }
                Ok(Err(_)) => {
                    attempts.insert(
                        model.clone(),
                        FullAttempt {
                            status: FullStatus::Error,
                            latency_secs: start.elapsed().as_secs_f64(),
                            tokens: model_tokens,
                            was_fallback,
                        },
                    );
                    continue;
                }
                Err(_) => {
                    attempts.insert(
                        model.clone(),
                        FullAttempt {
                            status: FullStatus::Error,
                            latency_secs: self.config.full_timeout.as_secs_f64(),
                            tokens: model_tokens,
                            was_fallback,
                        },
                    );
                    continue;
                }
            }
        }
        Err(RaceError::AllFullAttemptsFailed)
    }

    async fn run_full_speculative(
        &self,
        query: &Query,
        ranked: &[ModelId],
        attempts: &mut HashMap<ModelId, FullAttempt>,
        budget: Arc<FullBudget>,
    ) -> Result<(Option<ModelId>, String)> {
        let top2: Vec<ModelId> = ranked.iter().take(2).cloned().collect();
        let mut handles = Vec::new();
        let mut firsts = Vec::new();

        for model in &top2 {
            let Some(client) = self.clients.get(model).cloned() else { continue };
            let query = query.clone();
            let model = model.clone();
            let price = self.reward_policy.price_per_token(&model);
            let task_budget = budget.clone();
            let (first_tx, first_rx) = tokio::sync::oneshot::channel::<String>();
            let (piece_tx, mut piece_rx) = mpsc::unbounded_channel::<String>();
            let handle: tokio::task::JoinHandle<(ModelId, Result<crate::model_client::StreamOutcome>, String)> =
                tokio::spawn(async move {
                    let stream_fut = client.stream(&query, usize::MAX, piece_tx);
                    tokio::pin!(stream_fut);
                    let mut buf = String::new();
                    let mut first_sent = false;
                    let mut first_tx = Some(first_tx);
                    loop {
                        tokio::select! {
                            outcome = &mut stream_fut => {
                                break (model, outcome, buf);
                            }
                            piece = piece_rx.recv() => {
                                let Some(piece) = piece else { continue };
                                if !first_sent && !piece.is_empty() {
                                    first_sent = true;
                                    if let Some(tx) = first_tx.take() {
                                        let _ = tx.send(piece.clone());
                                    }
                                }
                                buf.push_str(&piece);
                                if let Some(breach) = task_budget.record(price) {
                                    break (model, Err(breach), buf);
                                }
                            }
                        }
                    }
                });
            handles.push(handle);
            firsts.push(first_rx);
        }

        if handles.is_empty() {
            return Err(RaceError::AllFullAttemptsFailed);
        }

        let start = Instant::now();
        let mut pending: FuturesUnordered<_> = firsts
            .into_iter()
            .enumerate()
            .map(|(i, rx)| Box::pin(async move { (i, rx.await) }))
            .collect();
        let mut winner_idx = None;
        while let Some((i, result)) = pending.next().await {
            if result.is_ok() {
                winner_idx = Some(i);
                break;
            }
            // That candidate's task finished or dropped before signaling a
            // first token; keep waiting on whatever else is still racing.
        }

        match winner_idx {
            Some(i) => {
                for (j, handle) in handles.iter().enumerate() {
                    if j != i {
                        handle.abort();
                    }
                }
                let winner_model = top2[i].clone();
                let (_, outcome, buf) = handles
                    .remove(i)
                    .await
                    .map_err(|_| RaceError::AllFullAttemptsFailed)?;
                match outcome {
                    Ok(stream_outcome) => {
                        attempts.insert(
                            winner_model.clone(),
                            FullAttempt {
                                status: FullStatus::Ok,
                                latency_secs: start.elapsed().as_secs_f64(),
                                tokens: stream_outcome.tokens_consumed,
                                was_fallback: false,
                            },
                        );
                        for (j, model) in top2.iter().enumerate() {
                            if j != i {
                                attempts.insert(
                                    model.clone(),
                                    FullAttempt {
                                        status: FullStatus::Cancelled,
                                        latency_secs: start.elapsed().as_secs_f64(),
                                        tokens: 0,
                                        was_fallback: false,
                                    },
                                );
                            }
                        }
                        Ok((Some(winner_model), buf))
                    }
                    Err(budget_err @ RaceError::BudgetExceeded { .. }) => {
                        attempts.insert(
                            winner_model,
                            FullAttempt {
                                status: FullStatus::BudgetExceeded,
                                latency_secs: start.elapsed().as_secs_f64(),
                                tokens: 0,
                                was_fallback: false,
                            },
                        );
                        for (j, model) in top2.iter().enumerate() {
                            if j != i {
                                attempts.insert(
                                    model.clone(),
                                    FullAttempt {
                                        status: FullStatus::Cancelled,
                                        latency_secs: start.elapsed().as_secs_f64(),
                                        tokens: 0,
                                        was_fallback: false,
                                    },
                                );
                            }
                        }
                        Err(budget_err)
                    }
                    Err(other) => Err(other),
                }
            }
            None => {
                let mut results = Vec::with_capacity(handles.len());
                for handle in handles {
                    results.push(handle.await.map_err(|_| RaceError::AllFullAttemptsFailed)?);
                }
                let mut breach = None;
                for (model, outcome, _buf) in &results {
                    if let Err(RaceError::BudgetExceeded { kind, limit, used }) = outcome {
                        attempts.insert(
                            model.clone(),
                            FullAttempt {
                                status: FullStatus::BudgetExceeded,
                                latency_secs: start.elapsed().as_secs_f64(),
                                tokens: 0,
                                was_fallback: false,
                            },
                        );
                        breach.get_or_insert(RaceError::BudgetExceeded { kind: *kind, limit: *limit, used: *used });
                    }
                }
                if let Some(err) = breach {
                    return Err(err);
                }
                // Both speculative attempts died before producing a first
                // token: fall back to the remaining ranked models.
                self.run_full_sequential(
                    query,
                    &ranked[top2.len().min(ranked.len())..],
                    attempts,
                    budget,
                )
                .await
            }
        }
    }

    fn build_summary(
        &self,
        query: &Query,
        context: &crate::query::ContextVector,
        previews: &[PreviewOutcome],
        judge_scores: &crate::judge::JudgeScores,
        full_attempts: &HashMap<ModelId, FullAttempt>,
        rewards: &HashMap<ModelId, f64>,
        winner: Option<ModelId>,
        wall_clock: Duration,
    ) -> RunSummary {
        let mut per_model = HashMap::new();
        let mut total_tokens = 0u64;
        let mut total_cost_usd = 0.0;
        let mut fallback_count = 0u32;
        let mut cache_hit_count = 0u32;

        for (rank, preview) in previews.iter().enumerate() {
            if preview.from_cache {
                cache_hit_count += 1;
            }
            let full = full_attempts.get(&preview.model);
            let model_tokens = preview.tokens_consumed + full.map(|f| f.tokens).unwrap_or(0);
            total_tokens += model_tokens;
            total_cost_usd += model_tokens as f64 * self.reward_policy.price_per_token(&preview.model);
            if let Some(f) = full {
                if f.was_fallback {
                    fallback_count += 1;
                }
            }
            per_model.insert(
                preview.model.clone(),
                ModelSummary {
                    selected_rank: rank,
                    preview_latency_secs: preview.latency_secs,
                    preview_tokens: preview.tokens_consumed,
                    preview_from_cache: preview.from_cache,
                    judge_overall: judge_scores.overall(&preview.model),
                    full_attempted: full.is_some(),
                    full_status: full.map(|f| f.status.clone()).unwrap_or(FullStatus::NotAttempted),
                    full_latency_secs: full.map(|f| f.latency_secs),
                    full_tokens: full.map(|f| f.tokens).unwrap_or(0),
                    reward: rewards.get(&preview.model).copied().unwrap_or(0.0),
                },
            );
        }

        RunSummary {
            query_id: query.id,
            query_char_len: query.char_len(),
            strategy: if query.char_len() >= self.config.speculative_min_query_length {
                "speculative_top2"
            } else {
                "sequential_fallback"
            },
            context: context.as_slice().to_vec(),
            per_model,
            total_tokens,
            total_cost_usd,
            fallback_count,
            cache_hit_count,
            wall_clock_secs: wall_clock.as_secs_f64(),
            winner,
        }
    }

    /// Scalar reward per model that took part in this race, fed back to the
    /// router; computed once so both the reward round and the telemetry
    /// summary report the same numbers.
    fn compute_rewards(
        &self,
        query: &Query,
        previews: &[PreviewOutcome],
        judge_scores: &crate::judge::JudgeScores,
        full_attempts: &HashMap<ModelId, FullAttempt>,
    ) -> HashMap<ModelId, f64> {
        let mut rewards = HashMap::new();
        for preview in previews {
            let full = full_attempts.get(&preview.model);
            let was_fallback = full.map(|f| f.was_fallback && f.status != FullStatus::Ok).unwrap_or(false);
            let tokens = preview.tokens_consumed + full.map(|f| f.tokens).unwrap_or(0);
            let p95 = self.latency.p95(&preview.model);
            let reward = self.reward_policy.reward(
                query,
                &preview.model,
                &RewardInputs {
                    judge_overall: judge_scores.overall(&preview.model),
                    preview_latency_secs: preview.latency_secs,
                    tokens_consumed: tokens,
                    was_fallback,
                    served_from_cache: preview.from_cache,
                },
                p95,
            );
            rewards.insert(preview.model.clone(), reward);
        }
        rewards
    }

    async fn apply_rewards(
        &self,
        context: &crate::query::ContextVector,
        rewards: &HashMap<ModelId, f64>,
        winner: Option<&ModelId>,
    ) -> Result<()> {
        self.router.bulk_update(context, rewards, winner).await
    }
}

/// Shared across one race's full-answer stage (sequential, speculative, and
/// any sequential fallback from a died-out speculative attempt) so both
/// ceilings in the external-interfaces table are enforced against the
/// combined total, not reset per attempt.
struct FullBudget {
    max_tokens: u64,
    max_cost_usd: f64,
    tokens_used: AtomicU64,
    cost_used_usd: Mutex<f64>,
}

impl FullBudget {
    fn new(max_tokens: u64, max_cost_usd: f64) -> Self {
        FullBudget {
            max_tokens,
            max_cost_usd,
            tokens_used: AtomicU64::new(0),
            cost_used_usd: Mutex::new(0.0),
        }
    }

    /// Accounts for one more token costing `price_per_token`; returns the
    /// ceiling breached, if this token pushed the running total over either
    /// one. Called once per piece as it arrives, not after a stream drains.
    fn record(&self, price_per_token: f64) -> Option<RaceError> {
        let tokens = self.tokens_used.fetch_add(1, Ordering::SeqCst) + 1;
        if tokens > self.max_tokens {
            return Some(RaceError::BudgetExceeded {
                kind: "tokens",
                limit: self.max_tokens as f64,
                used: tokens as f64,
            });
        }
        let cost = {
            let mut guard = self.cost_used_usd.lock().expect("budget lock poisoned");
            *guard += price_per_token;
            *guard
        };
        if cost > self.max_cost_usd {
            return Some(RaceError::BudgetExceeded { kind: "cost", limit: self.max_cost_usd, used: cost });
        }
        None
    }
}

#[derive(Debug, Clone)]
struct FullAttempt {
    status: FullStatus,
    latency_secs: f64,
    tokens: u64,
    was_fallback: bool,
}

impl PartialEq for FullStatus {
    fn eq(&self, other: &Self) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::LocalPreviewCache;
    use crate::features::NullEmbeddingProvider;
    use crate::judge::ScriptedJudge;
    use crate::model_client::MockModelClient;
    use crate::reward::QualityLatencyCostPolicy;
    use crate::router::BaselineRouter;
    use std::collections::HashMap as Map;

    fn build_orchestrator(
        clients: Map<ModelId, Arc<dyn ModelClient>>,
        ranking: Vec<(ModelId, f64)>,
        config: RaceConfig,
    ) -> RaceOrchestrator {
        let fx = FeatureExtractor::new(
            config.length_threshold_chars,
            config.word_threshold_words,
            0,
            Box::new(NullEmbeddingProvider),
            1,
        );
        RaceOrchestrator::new(
            config,
            fx,
            Arc::new(BaselineRouter),
            Arc::new(QualityLatencyCostPolicy {
                weight_quality: 0.6,
                weight_latency: 0.25,
                weight_cost: 0.15,
                fallback_penalty: 0.2,
                length_threshold_chars: 2000.0,
                reference_latency_floor_secs: 3.0,
                price_per_token: Map::new(),
                default_price_per_token: 0.0,
            }),
            Arc::new(LatencyMetrics::new(32)),
            Arc::new(LocalPreviewCache::new()),
            clients,
            Arc::new(ScriptedJudge::new(ranking)),
        )
    }

    #[tokio::test]
    async fn race_picks_winner_and_returns_its_text() {
        let mut clients: Map<ModelId, Arc<dyn ModelClient>> = Map::new();
        clients.insert(
            ModelId::new("a"),
            Arc::new(MockModelClient::new(
                ModelId::new("a"),
                vec!["hello ".into(), "world".into()],
                Duration::from_millis(1),
            )),
        );
        clients.insert(
            ModelId::new("b"),
            Arc::new(MockModelClient::new(
                ModelId::new("b"),
                vec!["nope".into()],
                Duration::from_millis(1),
            )),
        );
        let orchestrator = build_orchestrator(
            clients,
            vec![(ModelId::new("a"), 0.9), (ModelId::new("b"), 0.3)],
            RaceConfig::default(),
        );
        let result = orchestrator.run(Query::new("short query")).await.unwrap();
        assert_eq!(result.answer, "hello world");
        assert_eq!(result.summary.winner, Some(ModelId::new("a")));
    }

    #[tokio::test]
    async fn all_previews_failing_is_an_error() {
        let mut clients: Map<ModelId, Arc<dyn ModelClient>> = Map::new();
        clients.insert(
            ModelId::new("a"),
            Arc::new(MockModelClient::failing(
                ModelId::new("a"),
                RaceError::PermanentBackend { model: "a".into(), source: "down".into() },
                Duration::from_millis(1),
            )),
        );
        let orchestrator =
            build_orchestrator(clients, vec![(ModelId::new("a"), 0.9)], RaceConfig::default());
        let err = orchestrator.run(Query::new("q")).await.unwrap_err();
        assert!(matches!(err, RaceError::AllPreviewsFailed));
    }

    #[tokio::test]
    async fn sequential_fallback_skips_failed_top_ranked_model() {
        let mut clients: Map<ModelId, Arc<dyn ModelClient>> = Map::new();
        clients.insert(
            ModelId::new("a"),
            Arc::new(MockModelClient::new(
                ModelId::new("a"),
                vec!["preview-a".into()],
                Duration::from_millis(1),
            )),
        );
        clients.insert(
            ModelId::new("b"),
            Arc::new(MockModelClient::new(
                ModelId::new("b"),
                vec!["preview-b".into()],
                Duration::from_millis(1),
            )),
        );
        let orchestrator = build_orchestrator(
            clients,
            vec![(ModelId::new("a"), 0.9), (ModelId::new("b"), 0.5)],
            RaceConfig::default(),
        );
        // Both previews and full answers use the same mock stream content in
        // this test; what matters is that a winner is chosen and a reward
        // round completes without error.
        let result = orchestrator.run(Query::new("short query")).await.unwrap();
        assert!(result.summary.winner.is_some());
    }

    #[tokio::test]
    async fn sequential_full_stage_stops_within_one_batch_of_the_token_ceiling() {
        let hungry = ModelId::new("hungry");
        let pieces: Vec<String> = (0..1000).map(|i| format!("t{i} ")).collect();
        let mut clients: Map<ModelId, Arc<dyn ModelClient>> = Map::new();
        clients.insert(
            hungry.clone(),
            Arc::new(MockModelClient::new(hungry.clone(), pieces, Duration::from_millis(0))),
        );
        let orchestrator =
            build_orchestrator(clients, vec![(hungry.clone(), 0.9)], RaceConfig::default());

        let mut attempts = Map::new();
        let budget = Arc::new(FullBudget::new(5, f64::MAX));
        let query = Query::new("short query");
        let err = orchestrator
            .run_full_sequential(&query, &[hungry.clone()], &mut attempts, budget)
            .await
            .unwrap_err();

        assert!(matches!(err, RaceError::BudgetExceeded { kind: "tokens", .. }));
        // The ceiling is 5; streaming must be cancelled within the next
        // batch, nowhere near the full 1000-piece answer.
        assert!(attempts[&hungry].tokens < 20, "tokens = {}", attempts[&hungry].tokens);
    }

    #[tokio::test]
    async fn cost_ceiling_is_enforced_independently_of_the_token_ceiling() {
        let pricey = ModelId::new("pricey");
        let pieces: Vec<String> = (0..1000).map(|i| format!("t{i} ")).collect();
        let mut clients: Map<ModelId, Arc<dyn ModelClient>> = Map::new();
        clients.insert(
            pricey.clone(),
            Arc::new(MockModelClient::new(pricey.clone(), pieces, Duration::from_millis(0))),
        );
        let config = RaceConfig::default();
        let fx = FeatureExtractor::new(
            config.length_threshold_chars,
            config.word_threshold_words,
            0,
            Box::new(NullEmbeddingProvider),
            1,
        );
        let orchestrator = RaceOrchestrator::new(
            config,
            fx,
            Arc::new(BaselineRouter),
            Arc::new(QualityLatencyCostPolicy {
                weight_quality: 0.6,
                weight_latency: 0.25,
                weight_cost: 0.15,
                fallback_penalty: 0.2,
                length_threshold_chars: 2000.0,
                reference_latency_floor_secs: 3.0,
                price_per_token: Map::new(),
                default_price_per_token: 0.01,
            }),
            Arc::new(LatencyMetrics::new(32)),
            Arc::new(LocalPreviewCache::new()),
            clients,
            Arc::new(ScriptedJudge::new(vec![(pricey.clone(), 0.9)])),
        );

        let mut attempts = Map::new();
        let budget = Arc::new(FullBudget::new(u64::MAX, 0.10));
        let query = Query::new("short query");
        let err = orchestrator
            .run_full_sequential(&query, &[pricey.clone()], &mut attempts, budget)
            .await
            .unwrap_err();

        assert!(matches!(err, RaceError::BudgetExceeded { kind: "cost", .. }));
        // 0.10 USD ceiling at 0.01 USD/token breaches after ~10 tokens.
        assert!(attempts[&pricey].tokens < 20, "tokens = {}", attempts[&pricey].tokens);
    }
}
