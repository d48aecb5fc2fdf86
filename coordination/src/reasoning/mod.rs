//! External reasoning collaborators.
//!
//! The debate core never talks to a model directly. Every call goes through
//! one of the traits below and carries an immutable request describing the
//! persona, topic and model choice it is made for, so per-participant model
//! selection never touches shared defaults.
//!
//! - [`StatementGenerator`]: produce the next statement for a speaker
//! - [`VoteGenerator`]: produce a final vote from folded state
//! - [`Embedder`]: embed text for convergence and engagement checks
//! - [`EngagementPolicy`]: decide whether a listener raises a hand

pub mod embedding;
pub mod engagement;
pub mod http;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{ModelChoice, ParticipantConfig};

pub use embedding::{cosine_similarity, CachedEmbedder};
pub use engagement::{AlwaysEngage, SimilarityEngagement};
pub use http::{ChatCompletionsBackend, HttpBackendConfig};

/// Failure of an external reasoning call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GenerationError {
    /// Temporary failure (connection reset, 429, 5xx).
    #[error("transient: {0}")]
    Transient(String),

    /// The attempt exceeded its wall-clock budget.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Will not succeed on retry (auth, malformed response).
    #[error("permanent: {0}")]
    Permanent(String),
}

impl GenerationError {
    /// Whether retrying the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout(_))
    }
}

/// Persona and model choice of one participant, as seen by a collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonaProfile {
    pub name: String,
    pub background: String,
    #[serde(default)]
    pub model: ModelChoice,
}

impl From<&ParticipantConfig> for PersonaProfile {
    fn from(config: &ParticipantConfig) -> Self {
        Self {
            name: config.name.clone(),
            background: config.persona_background.clone(),
            model: config.model.clone(),
        }
    }
}

/// What a speaker knows when asked for a statement.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TurnContext {
    /// Digests of statements the speaker engaged with, oldest first.
    pub memory: Vec<String>,
    pub previous_speaker: Option<String>,
    pub previous_statement: Option<String>,
    pub own_last_statement: Option<String>,
}

impl TurnContext {
    /// Memory joined one digest per line.
    pub fn memory_text(&self) -> String {
        self.memory.join("\n")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatementRequest {
    pub run_id: String,
    pub iteration: u64,
    pub persona: PersonaProfile,
    pub topic: String,
    pub context: TurnContext,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoteRequest {
    pub run_id: String,
    pub persona: PersonaProfile,
    pub topic: String,
    /// Terminal memory of the participant, oldest first.
    pub memory: Vec<String>,
    /// Terminal own statement; empty if the participant never spoke.
    pub last_statement: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteDecision {
    pub decision: bool,
    pub rationale: String,
}

/// Asked of every listener with budget after a statement is produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngagementRequest {
    pub run_id: String,
    pub iteration: u64,
    pub listener: PersonaProfile,
    /// Listener's own last statement; empty if it has not spoken.
    pub listener_last_statement: String,
    pub speaker: String,
    pub statement: String,
    pub topic: String,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StatementGenerator: Send + Sync {
    async fn generate_statement(&self, request: StatementRequest)
        -> Result<String, GenerationError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VoteGenerator: Send + Sync {
    async fn generate_vote(&self, request: VoteRequest) -> Result<VoteDecision, GenerationError>;
}

#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, GenerationError>;
}

#[async_trait]
pub trait EngagementPolicy: Send + Sync {
    async fn wants_to_respond(&self, request: EngagementRequest)
        -> Result<bool, GenerationError>;
}

/// The full set of collaborators a run needs.
#[derive(Clone)]
pub struct Collaborators {
    pub statements: Arc<dyn StatementGenerator>,
    pub votes: Arc<dyn VoteGenerator>,
    pub embedder: Arc<dyn Embedder>,
    pub engagement: Arc<dyn EngagementPolicy>,
}

impl Collaborators {
    /// Use one backend for statements, votes and embeddings, with
    /// similarity-driven engagement on top of the same embedder.
    pub fn from_backend<B>(backend: Arc<B>) -> Self
    where
        B: StatementGenerator + VoteGenerator + Embedder + 'static,
    {
        let embedder: Arc<dyn Embedder> = Arc::new(CachedEmbedder::new(backend.clone()));
        Self {
            statements: backend.clone(),
            votes: backend,
            engagement: Arc::new(SimilarityEngagement::new(embedder.clone())),
            embedder,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(GenerationError::Transient("503".into()).is_retryable());
        assert!(GenerationError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!GenerationError::Permanent("401".into()).is_retryable());
    }

    #[test]
    fn test_persona_from_config() {
        let config = ParticipantConfig::new("Ana", "economist").with_model("small-model");
        let persona = PersonaProfile::from(&config);
        assert_eq!(persona.name, "Ana");
        assert_eq!(persona.background, "economist");
        assert_eq!(persona.model.model.as_deref(), Some("small-model"));
    }

    #[test]
    fn test_memory_text() {
        let ctx = TurnContext {
            memory: vec!["Ben: a".into(), "Cai: b".into()],
            ..Default::default()
        };
        assert_eq!(ctx.memory_text(), "Ben: a\nCai: b");
    }
}
