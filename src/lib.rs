//! Races a pool of candidate LLM backends against each other for a single
//! query and streams the winner's answer, adapting future routing decisions
//! via a LinUCB contextual bandit over observed quality/latency/cost.

pub mod cache;
pub mod config;
pub mod error;
pub mod features;
pub mod judge;
pub mod latency;
pub mod logging;
pub mod model_client;
pub mod orchestrator;
pub mod query;
pub mod reward;
pub mod router;
pub mod state_store;
pub mod summary;

pub use error::RaceError;
pub use orchestrator::RaceOrchestrator;
pub use query::{ContextVector, ModelId, Query};
