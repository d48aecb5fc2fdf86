//! Engagement policies: who raises a hand after a statement.

use std::sync::Arc;

use async_trait::async_trait;

use super::embedding::cosine_similarity;
use super::{Embedder, EngagementPolicy, EngagementRequest, GenerationError};

/// Raise a hand when the new statement is either far from or very close to
/// the listener's own last statement: disagreement invites a rebuttal,
/// strong agreement invites support. Lukewarm overlap stays silent.
pub struct SimilarityEngagement {
    embedder: Arc<dyn Embedder>,
    low: f64,
    high: f64,
}

impl SimilarityEngagement {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self::with_bounds(embedder, 0.3, 0.75)
    }

    pub fn with_bounds(embedder: Arc<dyn Embedder>, low: f64, high: f64) -> Self {
        Self {
            embedder,
            low,
            high,
        }
    }

    /// Whether a similarity score falls outside the silent band.
    pub fn triggers(&self, similarity: f64) -> bool {
        similarity < self.low || similarity > self.high
    }
}

#[async_trait]
impl EngagementPolicy for SimilarityEngagement {
    async fn wants_to_respond(
        &self,
        request: EngagementRequest,
    ) -> Result<bool, GenerationError> {
        // Someone who has not spoken yet always wants the floor.
        if request.listener_last_statement.trim().is_empty() {
            return Ok(true);
        }
        let own = self.embedder.embed(&request.listener_last_statement).await?;
        let heard = self.embedder.embed(&request.statement).await?;
        Ok(self.triggers(cosine_similarity(&own, &heard)))
    }
}

/// Every listener always raises a hand.
pub struct AlwaysEngage;

#[async_trait]
impl EngagementPolicy for AlwaysEngage {
    async fn wants_to_respond(&self, _: EngagementRequest) -> Result<bool, GenerationError> {
        Ok(true)
    }
}
