//! Scores previews across dimensions and returns a total ranking. How the
//! judge actually evaluates text is out of scope; this module only
//! constrains the contract every judge implementation honors.

use std::collections::HashMap;

use crate::error::RaceError;
use crate::model_client::{collect_full, ModelClient};
use crate::query::{ModelId, Query};

#[derive(Debug, Clone)]
pub struct JudgeSubScores {
    pub relevance: f64,
    pub coverage: f64,
    pub faithfulness: f64,
    pub overall: f64,
}

#[derive(Debug, Clone, Default)]
pub struct JudgeScores {
    pub per_model: HashMap<ModelId, JudgeSubScores>,
    /// Highest-ranked first.
    pub ranking: Vec<ModelId>,
}

impl JudgeScores {
    pub fn overall(&self, model: &ModelId) -> f64 {
        self.per_model.get(model).map(|s| s.overall).unwrap_or(0.0)
    }
}

#[async_trait::async_trait]
pub trait Judge: Send + Sync {
    async fn rank(
        &self,
        query: &Query,
        previews: &[(ModelId, String)],
    ) -> Result<JudgeScores, RaceError>;
}

/// Delegates scoring to a configured model backend (the judge model is just
/// another candidate) and parses a constrained JSON response.
pub struct LlmJudge<C: ModelClient> {
    client: C,
    token_cap: usize,
}

impl<C: ModelClient> LlmJudge<C> {
    pub fn new(client: C, token_cap: usize) -> Self {
        LlmJudge { client, token_cap }
    }

    fn build_prompt(query: &Query, previews: &[(ModelId, String)]) -> String {
        let mut prompt = format!(
            "Score each candidate answer to the question below from 0.0 to 1.0 on \
             relevance, coverage, and faithfulness, then give an overall score. \
             Respond as a JSON array of objects with fields model, relevance, \
             coverage, faithfulness, overall.\n\nQuestion: {}\n\n",
            query.text
        );
        for (model, text) in previews {
            prompt.push_str(&format!("Candidate {}:\n{}\n\n", model.as_str(), text));
        }
        prompt
    }

    fn parse_response(raw: &str) -> Option<JudgeScores> {
        #[derive(serde::Deserialize)]
        struct Row {
            model: String,
            relevance: f64,
            coverage: f64,
            faithfulness: f64,
            overall: f64,
        }
        let rows: Vec<Row> = serde_json::from_str(raw).ok()?;
        let mut per_model = HashMap::new();
        let mut ranking: Vec<(ModelId, f64)> = Vec::new();
        for row in rows {
            let model = ModelId::new(row.model);
            per_model.insert(
                model.clone(),
                JudgeSubScores {
                    relevance: row.relevance,
                    coverage: row.coverage,
                    faithfulness: row.faithfulness,
                    overall: row.overall,
                },
            );
            ranking.push((model, row.overall));
        }
        ranking.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        Some(JudgeScores { per_model, ranking: ranking.into_iter().map(|(m, _)| m).collect() })
    }
}

#[async_trait::async_trait]
impl<C: ModelClient> Judge for LlmJudge<C> {
    async fn rank(
        &self,
        query: &Query,
        previews: &[(ModelId, String)],
    ) -> Result<JudgeScores, RaceError> {
        let prompt = Self::build_prompt(query, previews);
        let judging_query = Query::new(prompt);
        let (raw, _) = collect_full(&self.client, &judging_query, self.token_cap).await?;
        Self::parse_response(&raw).ok_or_else(|| RaceError::JudgeFailure {
            attempts: 1,
            source: "failed to parse judge response as JSON".into(),
        })
    }
}

/// Offline default judge for running without any judge backend configured:
/// ranks previews by length, on the heuristic that a backend that was
/// truncated early on the same token cap produced a less complete answer.
/// Meant only as a zero-configuration fallback, not a quality signal worth
/// trusting in production.
pub struct LengthHeuristicJudge;

#[async_trait::async_trait]
impl Judge for LengthHeuristicJudge {
    async fn rank(
        &self,
        _query: &Query,
        previews: &[(ModelId, String)],
    ) -> Result<JudgeScores, RaceError> {
        let max_len = previews.iter().map(|(_, t)| t.len()).max().unwrap_or(0).max(1);
        let mut scored: Vec<(ModelId, f64)> = previews
            .iter()
            .map(|(model, text)| (model.clone(), text.len() as f64 / max_len as f64))
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        let per_model = scored
            .iter()
            .map(|(model, overall)| {
                (
                    model.clone(),
                    JudgeSubScores {
                        relevance: *overall,
                        coverage: *overall,
                        faithfulness: *overall,
                        overall: *overall,
                    },
                )
            })
            .collect();
        Ok(JudgeScores {
            per_model,
            ranking: scored.into_iter().map(|(m, _)| m).collect(),
        })
    }
}

/// Deterministic, table-driven judge for tests: returns pre-assigned scores
/// in a fixed order, ignoring preview text entirely.
pub struct ScriptedJudge {
    scores: HashMap<ModelId, JudgeSubScores>,
    ranking: Vec<ModelId>,
}

impl ScriptedJudge {
    pub fn new(ranking: Vec<(ModelId, f64)>) -> Self {
        let mut scores = HashMap::new();
        let mut ranking_only = Vec::new();
        for (model, overall) in ranking {
            scores.insert(
                model.clone(),
                JudgeSubScores { relevance: overall, coverage: overall, faithfulness: overall, overall },
            );
            ranking_only.push(model);
        }
        ScriptedJudge { scores, ranking: ranking_only }
    }
}

#[async_trait::async_trait]
impl Judge for ScriptedJudge {
    async fn rank(
        &self,
        _query: &Query,
        previews: &[(ModelId, String)],
    ) -> Result<JudgeScores, RaceError> {
        let present: std::collections::HashSet<&ModelId> =
            previews.iter().map(|(m, _)| m).collect();
        let ranking: Vec<ModelId> =
            self.ranking.iter().filter(|m| present.contains(m)).cloned().collect();
        let per_model = self
            .scores
            .iter()
            .filter(|(m, _)| present.contains(m))
            .map(|(m, s)| (m.clone(), s.clone()))
            .collect();
        Ok(JudgeScores { per_model, ranking })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_judge_ranks_by_configured_order_restricted_to_present_models() {
        let judge = ScriptedJudge::new(vec![
            (ModelId::new("a"), 0.9),
            (ModelId::new("b"), 0.5),
            (ModelId::new("c"), 0.8),
        ]);
        let previews = vec![
            (ModelId::new("b"), "B".to_string()),
            (ModelId::new("c"), "C".to_string()),
        ];
        let scores = judge.rank(&Query::new("q"), &previews).await.unwrap();
        assert_eq!(scores.ranking, vec![ModelId::new("c"), ModelId::new("b")]);
        assert_eq!(scores.overall(&ModelId::new("c")), 0.8);
    }

    #[test]
    fn parse_response_sorts_by_overall_descending() {
        let raw = r#"[
            {"model":"a","relevance":0.5,"coverage":0.5,"faithfulness":0.5,"overall":0.5},
            {"model":"b","relevance":0.9,"coverage":0.9,"faithfulness":0.9,"overall":0.9}
        ]"#;
        let scores = LlmJudge::<crate::model_client::MockModelClient>::parse_response(raw).unwrap();
        assert_eq!(scores.ranking, vec![ModelId::new("b"), ModelId::new("a")]);
    }

    #[tokio::test]
    async fn length_heuristic_judge_ranks_longer_preview_first() {
        let judge = LengthHeuristicJudge;
        let previews = vec![
            (ModelId::new("short"), "hi".to_string()),
            (ModelId::new("long"), "a much longer answer with more detail".to_string()),
        ];
        let scores = judge.rank(&Query::new("q"), &previews).await.unwrap();
        assert_eq!(scores.ranking[0], ModelId::new("long"));
        assert_eq!(scores.overall(&ModelId::new("long")), 1.0);
    }

    #[test]
    fn parse_response_rejects_non_json() {
        assert!(LlmJudge::<crate::model_client::MockModelClient>::parse_response("not json").is_none());
    }
}
