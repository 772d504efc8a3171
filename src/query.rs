//! Core data types shared across the race: the incoming query, model
//! identifiers, and the fixed-dimension context vector fed to the router.

use serde::{Deserialize, Serialize};

/// Opaque, stable identifier for a configured candidate backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModelId(pub String);

impl ModelId {
    pub fn new(s: impl Into<String>) -> Self {
        ModelId(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ModelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ModelId {
    fn from(s: &str) -> Self {
        ModelId(s.to_string())
    }
}

/// Optional caller-supplied hints about a query, used by the feature
/// extractor and reward policy but never required.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryHints {
    pub intent: Option<String>,
    pub risk: Option<String>,
}

/// An immutable user request to race.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Query {
    pub id: uuid::Uuid,
    pub text: String,
    pub user_id: Option<String>,
    pub hints: QueryHints,
}

impl Query {
    pub fn new(text: impl Into<String>) -> Self {
        Query {
            id: uuid::Uuid::new_v4(),
            text: text.into(),
            user_id: None,
            hints: QueryHints::default(),
        }
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn word_count(&self) -> usize {
        self.text.split_whitespace().count()
    }

    pub fn char_len(&self) -> usize {
        self.text.chars().count()
    }
}

/// A fixed-dimension real-valued context vector, one per query, used by the
/// router to score candidate arms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextVector(pub Vec<f64>);

impl ContextVector {
    pub fn dim(&self) -> usize {
        self.0.len()
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }

    pub fn dot(&self, other: &[f64]) -> f64 {
        self.0.iter().zip(other).map(|(a, b)| a * b).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_id_roundtrips_through_display() {
        let m = ModelId::new("gpt-x");
        assert_eq!(format!("{m}"), "gpt-x");
    }

    #[test]
    fn query_word_and_char_counts() {
        let q = Query::new("hello brave new world");
        assert_eq!(q.word_count(), 4);
        assert_eq!(q.char_len(), 21);
    }

    #[test]
    fn context_vector_dot_product() {
        let cv = ContextVector(vec![1.0, 2.0, 3.0]);
        assert_eq!(cv.dot(&[1.0, 1.0, 1.0]), 6.0);
    }
}
