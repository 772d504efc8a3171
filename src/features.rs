//! Deterministic mapping from a query to the fixed-dimension context vector
//! the router scores arms against.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::query::{ContextVector, Query};

/// Samples uniformly from `[-1.0, 1.0]`; used instead of a normal
/// distribution so the projection matrix needs no extra distribution crate.
fn sample_weight(rng: &mut ChaCha8Rng) -> f32 {
    rng.gen_range(-1.0f32..=1.0f32)
}

/// Narrow async capability for turning text into an embedding. Failures are
/// non-fatal to feature extraction: callers fall back to zeroed slots.
#[async_trait::async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    /// Native dimensionality of embeddings this provider returns.
    fn native_dim(&self) -> usize;
}

#[derive(Debug, thiserror::Error)]
#[error("embedding backend failure: {0}")]
pub struct EmbeddingError(pub String);

/// Embeddings disabled; `k = 0`, `compute` uses only the bias/length/word slots.
pub struct NullEmbeddingProvider;

#[async_trait::async_trait]
impl EmbeddingProvider for NullEmbeddingProvider {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
        Ok(Vec::new())
    }

    fn native_dim(&self) -> usize {
        0
    }
}

/// Reproducible stand-in embedding: derives a pseudo-embedding from a seeded
/// hash of the text. Not semantically meaningful, but deterministic and
/// network-free, useful for tests and as a last-resort default.
pub struct DeterministicHashEmbeddingProvider {
    dim: usize,
}

impl DeterministicHashEmbeddingProvider {
    pub fn new(dim: usize) -> Self {
        DeterministicHashEmbeddingProvider { dim }
    }
}

#[async_trait::async_trait]
impl EmbeddingProvider for DeterministicHashEmbeddingProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        use sha2::{Digest, Sha256};
        let digest = Sha256::digest(text.as_bytes());
        let seed = u64::from_le_bytes(digest[0..8].try_into().unwrap());
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        Ok((0..self.dim).map(|_| sample_weight(&mut rng)).collect())
    }

    fn native_dim(&self) -> usize {
        self.dim
    }
}

fn clip(x: f64, lo: f64, hi: f64) -> f64 {
    x.max(lo).min(hi)
}

/// Rolling mean/variance for z-score normalization of embedding slots,
/// updated with every query observed (Welford's algorithm).
struct RollingStats {
    count: u64,
    mean: f64,
    m2: f64,
}

impl RollingStats {
    fn new() -> Self {
        RollingStats { count: 0, mean: 0.0, m2: 0.0 }
    }

    fn update(&mut self, x: f64) {
        self.count += 1;
        let delta = x - self.mean;
        self.mean += delta / self.count as f64;
        let delta2 = x - self.mean;
        self.m2 += delta * delta2;
    }

    fn z_score(&self, x: f64) -> f64 {
        if self.count < 2 {
            return 0.0;
        }
        let variance = self.m2 / (self.count as f64 - 1.0);
        let std = variance.sqrt();
        if std < 1e-9 {
            0.0
        } else {
            (x - self.mean) / std
        }
    }
}

/// Deterministic context-vector builder: bias, length, word-count, and an
/// optional seeded random projection of an embedding down to `k` dimensions.
pub struct FeatureExtractor {
    length_threshold: f64,
    word_threshold: f64,
    embedding_slots: usize,
    projection: Option<Vec<Vec<f32>>>, // k x native_dim, seeded
    embedding_provider: Box<dyn EmbeddingProvider>,
    rolling: std::sync::Mutex<Vec<RollingStats>>,
}

impl FeatureExtractor {
    pub fn new(
        length_threshold: f64,
        word_threshold: f64,
        embedding_slots: usize,
        embedding_provider: Box<dyn EmbeddingProvider>,
        projection_seed: u64,
    ) -> Self {
        let native_dim = embedding_provider.native_dim();
        let projection = if embedding_slots > 0 && native_dim > 0 {
            let mut rng = ChaCha8Rng::seed_from_u64(projection_seed);
            Some(
                (0..embedding_slots)
                    .map(|_| (0..native_dim).map(|_| sample_weight(&mut rng)).collect::<Vec<f32>>())
                    .collect(),
            )
        } else {
            None
        };
        FeatureExtractor {
            length_threshold,
            word_threshold,
            embedding_slots,
            projection,
            embedding_provider,
            rolling: std::sync::Mutex::new(
                (0..embedding_slots).map(|_| RollingStats::new()).collect(),
            ),
        }
    }

    pub fn dim(&self) -> usize {
        3 + self.embedding_slots
    }

    pub async fn compute(&self, query: &Query) -> ContextVector {
        let mut out = Vec::with_capacity(self.dim());
        out.push(1.0);
        out.push(clip(
            query.char_len() as f64 / self.length_threshold,
            0.0,
            2.0,
        ));
        out.push(clip(
            query.word_count() as f64 / self.word_threshold,
            0.0,
            2.0,
        ));

        if self.embedding_slots == 0 {
            return ContextVector(out);
        }

        let projected = match self.embedding_provider.embed(&query.text).await {
            Ok(raw) if !raw.is_empty() => self.project(&raw),
            _ => vec![0.0; self.embedding_slots],
        };

        let mut rolling = self.rolling.lock().expect("rolling stats lock poisoned");
        for (slot, value) in projected.into_iter().enumerate() {
            rolling[slot].update(value);
            out.push(rolling[slot].z_score(value));
        }
        ContextVector(out)
    }

    fn project(&self, embedding: &[f32]) -> Vec<f64> {
        match &self.projection {
            Some(matrix) => matrix
                .iter()
                .map(|row| {
                    row.iter()
                        .zip(embedding)
                        .map(|(w, e)| (*w as f64) * (*e as f64))
                        .sum()
                })
                .collect(),
            None => vec![0.0; self.embedding_slots],
        }
    }
}
