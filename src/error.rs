//! Error taxonomy shared by every component of the race.
//!
//! The orchestrator matches on these variants to decide whether to retry,
//! skip a model, or abort the whole race; nothing in this crate stringly
//! types an error path.

/// A structured error raised by any stage of a race.
#[derive(Debug, thiserror::Error)]
pub enum RaceError {
    #[error("transient backend error for {model}: {source}")]
    TransientBackend {
        model: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("permanent backend error for {model}: {source}")]
    PermanentBackend {
        model: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("{phase} timed out after {elapsed_secs:.1}s")]
    Timeout { phase: &'static str, elapsed_secs: f64 },

    #[error("budget exceeded: {kind} limit {limit} breached (used {used})")]
    BudgetExceeded {
        kind: &'static str,
        limit: f64,
        used: f64,
    },

    #[error("judge failed after {attempts} attempt(s): {source}")]
    JudgeFailure {
        attempts: u32,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("state store error: {0}")]
    StateStore(String),

    #[error("numerical anomaly updating arm {model}: {detail}")]
    NumericalAnomaly { model: String, detail: &'static str },

    #[error("no candidate models produced a usable preview")]
    AllPreviewsFailed,

    #[error("no candidate models produced a usable full answer")]
    AllFullAttemptsFailed,

    #[error("router context dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl RaceError {
    /// Whether retrying the same model for the same phase might succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RaceError::TransientBackend { .. } | RaceError::Timeout { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, RaceError>;
