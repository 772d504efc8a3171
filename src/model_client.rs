//! Abstract streaming interface to an LLM backend. The text-generation
//! logic of any given backend is out of scope here — this module only
//! frames the request/response and classifies failures as transient or
//! permanent so the orchestrator knows whether to retry.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::error::RaceError;
use crate::query::{ModelId, Query};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    Ok,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct StreamOutcome {
    pub tokens_consumed: u64,
    pub status: CompletionStatus,
}

/// Capability every candidate backend implements: stream text pieces for a
/// query, capped at `token_cap` tokens, through an unbounded channel.
#[async_trait::async_trait]
pub trait ModelClient: Send + Sync {
    fn model_id(&self) -> &ModelId;

    /// Streams text pieces into `piece_tx`; returns once generation
    /// finishes, errors, or is dropped by the caller (receiver closed).
    async fn stream(
        &self,
        query: &Query,
        token_cap: usize,
        piece_tx: mpsc::UnboundedSender<String>,
    ) -> Result<StreamOutcome, RaceError>;
}

/// Convenience: buffer a full response for callers that don't need to
/// forward tokens incrementally (previews).
pub async fn collect_full<C: ModelClient + ?Sized>(
    client: &C,
    query: &Query,
    token_cap: usize,
) -> Result<(String, StreamOutcome), RaceError> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let outcome_fut = client.stream(query, token_cap, tx);
    let collect_fut = async {
        let mut buf = String::new();
        while let Some(piece) = rx.recv().await {
            buf.push_str(&piece);
        }
        buf
    };
    let (outcome, text) = tokio::join!(outcome_fut, collect_fut);
    Ok((text, outcome?))
}

/// HTTP/SSE client speaking an OpenAI-compatible streaming chat endpoint.
pub struct HttpModelClient {
    model: ModelId,
    base_url: String,
    api_key: Option<String>,
    http: reqwest::Client,
}

impl HttpModelClient {
    pub fn new(model: ModelId, base_url: impl Into<String>, api_key: Option<String>) -> Self {
        HttpModelClient {
            model,
            base_url: base_url.into(),
            api_key,
            http: reqwest::Client::new(),
        }
    }

    fn classify_status(model: &ModelId, status: reqwest::StatusCode) -> RaceError {
        let transient = status.is_server_error() || status.as_u16() == 429;
        let source: Box<dyn std::error::Error + Send + Sync> =
            format!("http status {status}").into();
        if transient {
            RaceError::TransientBackend { model: model.to_string(), source }
        } else {
            RaceError::PermanentBackend { model: model.to_string(), source }
        }
    }
}

#[async_trait::async_trait]
impl ModelClient for HttpModelClient {
    fn model_id(&self) -> &ModelId {
        &self.model
    }

    async fn stream(
        &self,
        query: &Query,
        token_cap: usize,
        piece_tx: mpsc::UnboundedSender<String>,
    ) -> Result<StreamOutcome, RaceError> {
        use futures_util::StreamExt;

        let mut request = self
            .http
            .post(format!("{}/v1/chat/completions", self.base_url))
            .json(&serde_json::json!({
                "model": self.model.as_str(),
                "stream": true,
                "max_tokens": token_cap,
                "messages": [{"role": "user", "content": query.text}],
            }));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            let transient = e.is_timeout() || e.is_connect();
            let source: Box<dyn std::error::Error + Send + Sync> = Box::new(e);
            if transient {
                RaceError::TransientBackend { model: self.model.to_string(), source }
            } else {
                RaceError::PermanentBackend { model: self.model.to_string(), source }
            }
        })?;

        if !response.status().is_success() {
            return Err(Self::classify_status(&self.model, response.status()));
        }

        let mut tokens_consumed = 0u64;
        let mut body = response.bytes_stream();
        let mut carry = String::new();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| RaceError::TransientBackend {
                model: self.model.to_string(),
                source: Box::new(e),
            })?;
            carry.push_str(&String::from_utf8_lossy(&chunk));
            while let Some(pos) = carry.find('\n') {
                let line = carry[..pos].trim().to_string();
                carry = carry[pos + 1..].to_string();
                let Some(payload) = line.strip_prefix("data: ") else { continue };
                if payload == "[DONE]" {
                    return Ok(StreamOutcome { tokens_consumed, status: CompletionStatus::Ok });
                }
                if let Ok(value) = serde_json::from_str::<serde_json::Value>(payload) {
                    if let Some(piece) = value["choices"][0]["delta"]["content"].as_str() {
                        tokens_consumed += 1;
                        if piece_tx.send(piece.to_string()).is_err() {
                            return Ok(StreamOutcome {
                                tokens_consumed,
                                status: CompletionStatus::Cancelled,
                            });
                        }
                    }
                }
            }
        }
        Ok(StreamOutcome { tokens_consumed, status: CompletionStatus::Ok })
    }
}

/// Deterministic, network-free client for tests and local demos: emits a
/// configured token stream after a configured latency, optionally failing.
pub struct MockModelClient {
    model: ModelId,
    pieces: Vec<String>,
    latency: Duration,
    fail_with: Option<Arc<RaceError>>,
}

impl MockModelClient {
    pub fn new(model: ModelId, pieces: Vec<String>, latency: Duration) -> Self {
        MockModelClient { model, pieces, latency, fail_with: None }
    }

    pub fn failing(model: ModelId, err: RaceError, latency: Duration) -> Self {
        MockModelClient { model, pieces: Vec::new(), latency, fail_with: Some(Arc::new(err)) }
    }
}

#[async_trait::async_trait]
impl ModelClient for MockModelClient {
    fn model_id(&self) -> &ModelId {
        &self.model
    }

    async fn stream(
        &self,
        _query: &Query,
        token_cap: usize,
        piece_tx: mpsc::UnboundedSender<String>,
    ) -> Result<StreamOutcome, RaceError> {
        tokio::time::sleep(self.latency).await;
        if let Some(err) = &self.fail_with {
            return Err(clone_race_error(err));
        }
        let mut tokens_consumed = 0u64;
        for piece in self.pieces.iter().take(token_cap) {
            tokens_consumed += 1;
            if piece_tx.send(piece.clone()).is_err() {
                return Ok(StreamOutcome { tokens_consumed, status: CompletionStatus::Cancelled });
            }
            // Yield between pieces like a real streaming backend would
            // between chunks, so callers racing this stream against a
            // receiver loop see one piece at a time instead of the whole
            // response landing in a single poll.
            tokio::task::yield_now().await;
        }
        Ok(StreamOutcome { tokens_consumed, status: CompletionStatus::Ok })
    }
}

fn clone_race_error(err: &RaceError) -> RaceError {
    match err {
        RaceError::TransientBackend { model, source } => RaceError::TransientBackend {
            model: model.clone(),
            source: source.to_string().into(),
        },
        RaceError::PermanentBackend { model, source } => RaceError::PermanentBackend {
            model: model.clone(),
            source: source.to_string().into(),
        },
        RaceError::Timeout { phase, elapsed_secs } => {
            RaceError::Timeout { phase: *phase, elapsed_secs: *elapsed_secs }
        }
        other => RaceError::TransientBackend {
            model: "mock".to_string(),
            source: other.to_string().into(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_client_streams_configured_pieces() {
        let client = MockModelClient::new(
            ModelId::new("m"),
            vec!["hello ".to_string(), "world".to_string()],
            Duration::from_millis(1),
        );
        let (text, outcome) = collect_full(&client, &Query::new("hi"), 10).await.unwrap();
        assert_eq!(text, "hello world");
        assert_eq!(outcome.tokens_consumed, 2);
        assert_eq!(outcome.status, CompletionStatus::Ok);
    }

    #[tokio::test]
    async fn mock_client_respects_token_cap() {
        let client = MockModelClient::new(
            ModelId::new("m"),
            vec!["a".to_string(), "b".to_string(), "c".to_string()],
            Duration::from_millis(1),
        );
        let (text, outcome) = collect_full(&client, &Query::new("hi"), 2).await.unwrap();
        assert_eq!(text, "ab");
        assert_eq!(outcome.tokens_consumed, 2);
    }

    #[tokio::test]
    async fn mock_client_reports_configured_failure() {
        let client = MockModelClient::failing(
            ModelId::new("m"),
            RaceError::PermanentBackend {
                model: "m".to_string(),
                source: "nope".into(),
            },
            Duration::from_millis(1),
        );
        let err = collect_full(&client, &Query::new("hi"), 10).await.unwrap_err();
        assert!(matches!(err, RaceError::PermanentBackend { .. }));
    }
}
