//! Convergence detection: stop when recent statements say the same thing.
//!
//! The detector is advisory and stateless: it reads a window of statement
//! texts and returns a verdict. It never touches agent state or the log.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::log::StatementEvent;
use crate::config::ConvergenceConfig;
use crate::reasoning::{cosine_similarity, Embedder};
use crate::resilience::{retry_with_backoff, RetryPolicy};

/// Outcome of one convergence check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvergenceVerdict {
    pub too_similar: bool,
    /// Highest similarity between the newest statement and a prior one.
    pub max_similarity: Option<f64>,
    /// Number of prior statements compared.
    pub compared: usize,
}

impl ConvergenceVerdict {
    pub fn not_similar() -> Self {
        Self {
            too_similar: false,
            max_similarity: None,
            compared: 0,
        }
    }
}

pub struct ConvergenceDetector {
    config: ConvergenceConfig,
    embedder: Arc<dyn Embedder>,
    retry: RetryPolicy,
}

impl ConvergenceDetector {
    pub fn new(config: ConvergenceConfig, embedder: Arc<dyn Embedder>, retry: RetryPolicy) -> Self {
        Self {
            config,
            embedder,
            retry,
        }
    }

    pub fn config(&self) -> &ConvergenceConfig {
        &self.config
    }

    /// Check a candidate event against the committed events before it.
    ///
    /// Only the newest `window - 1` committed events take part.
    pub async fn check_events(
        &self,
        committed: &[StatementEvent],
        candidate: &StatementEvent,
    ) -> ConvergenceVerdict {
        let start = committed.len().saturating_sub(self.config.window.saturating_sub(1));
        let mut texts: Vec<&str> = committed[start..].iter().map(|e| e.content.as_str()).collect();
        texts.push(&candidate.content);
        self.check(&texts, candidate.iteration).await
    }

    /// Check a window of texts, oldest first, newest last.
    ///
    /// Only the last `window` texts are used.
    pub async fn check(&self, texts: &[&str], iteration: u64) -> ConvergenceVerdict {
        if !self.config.enabled || iteration < self.config.min_iterations {
            return ConvergenceVerdict::not_similar();
        }
        let start = texts.len().saturating_sub(self.config.window);
        let window = &texts[start..];
        if window.len() < 2 {
            return ConvergenceVerdict::not_similar();
        }

        let mut vectors = Vec::with_capacity(window.len());
        for text in window {
            let label = format!("embed@{}", iteration);
            let result =
                retry_with_backoff(&self.retry, &label, |_| self.embedder.embed(text)).await;
            match result {
                Ok(v) => vectors.push(v),
                Err(e) => {
                    warn!(iteration, error = %e, "Embedding failed, skipping convergence check");
                    return ConvergenceVerdict::not_similar();
                }
            }
        }

        let verdict = judge(&vectors, self.config.threshold);
        debug!(
            iteration,
            max_similarity = ?verdict.max_similarity,
            too_similar = verdict.too_similar,
            "Convergence check"
        );
        verdict
    }
}

/// Compare the last vector against every earlier one.
pub fn judge(vectors: &[Vec<f32>], threshold: f64) -> ConvergenceVerdict {
    let Some((newest, prior)) = vectors.split_last() else {
        return ConvergenceVerdict::not_similar();
    };
    if prior.is_empty() {
        return ConvergenceVerdict::not_similar();
    }
    let max = prior
        .iter()
        .map(|v| cosine_similarity(newest, v))
        .fold(f64::NEG_INFINITY, f64::max);
    ConvergenceVerdict {
        too_similar: max > threshold,
        max_similarity: Some(max),
        compared: prior.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reasoning::GenerationError;
    use async_trait::async_trait;
    use std::collections::HashMap;

    struct MapEmbedder(HashMap<&'static str, Vec<f32>>);

    #[async_trait]
    impl Embedder for MapEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>, GenerationError> {
            self.0
                .get(text)
                .cloned()
                .ok_or_else(|| GenerationError::Permanent(format!("no vector for {}", text)))
        }
    }

    fn detector(threshold: f64) -> ConvergenceDetector {
        // cos(a, b) = 0.95, cos(a, c) = 0.0
        let map = HashMap::from([
            ("a", vec![1.0, 0.0]),
            ("b", vec![0.95, 0.312_249_9]),
            ("c", vec![0.0, 1.0]),
        ]);
        ConvergenceDetector::new(
            ConvergenceConfig {
                threshold,
                ..Default::default()
            },
            Arc::new(MapEmbedder(map)),
            RetryPolicy::immediate(1),
        )
    }

    #[tokio::test]
    async fn test_fires_above_threshold() {
        let verdict = detector(0.9).check(&["a", "b"], 2).await;
        assert!(verdict.too_similar);
        assert!((verdict.max_similarity.unwrap() - 0.95).abs() < 1e-3);
    }

    #[tokio::test]
    async fn test_quiet_below_threshold() {
        let verdict = detector(0.96).check(&["a", "b"], 2).await;
        assert!(!verdict.too_similar);
    }

    #[tokio::test]
    async fn test_only_newest_is_compared() {
        // "b" vs "a" would fire, but the newest is "c".
        let verdict = detector(0.9).check(&["a", "b", "c"], 3).await;
        assert!(!verdict.too_similar);
        assert_eq!(verdict.compared, 2);
    }

    #[tokio::test]
    async fn test_idempotent() {
        let d = detector(0.9);
        let first = d.check(&["c", "a", "b"], 3).await;
        let second = d.check(&["c", "a", "b"], 3).await;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_candidate_checked_against_committed_tail() {
        let committed: Vec<StatementEvent> = ["c", "c", "c", "a"]
            .iter()
            .enumerate()
            .map(|(i, text)| StatementEvent::new(i as u64 + 1, "Ana", text, vec![]))
            .collect();
        let candidate = StatementEvent::new(5, "Ben", "b", vec![]);

        let d = detector(0.9);
        let verdict = d.check_events(&committed, &candidate).await;
        assert!(verdict.too_similar);
        // window 4: three committed events plus the candidate.
        assert_eq!(verdict.compared, 3);
        assert_eq!(verdict, d.check(&["c", "c", "a", "b"], 5).await);

        // "a" has slid out of the window.
        let older: Vec<StatementEvent> = ["a", "c", "c", "c"]
            .iter()
            .enumerate()
            .map(|(i, text)| StatementEvent::new(i as u64 + 1, "Ana", text, vec![]))
            .collect();
        assert!(!d.check_events(&older, &candidate).await.too_similar);
    }

    #[tokio::test]
    async fn test_single_statement_never_fires() {
        assert!(!detector(0.1).check(&["a"], 1).await.too_similar);
    }

    #[tokio::test]
    async fn test_embedding_failure_is_not_similar() {
        let verdict = detector(0.9).check(&["a", "unknown"], 2).await;
        assert_eq!(verdict, ConvergenceVerdict::not_similar());
    }

    #[tokio::test]
    async fn test_disabled_and_min_iterations() {
        let mut d = detector(0.9);
        d.config.min_iterations = 5;
        assert!(!d.check(&["a", "b"], 2).await.too_similar);
        d.config.min_iterations = 0;
        d.config.enabled = false;
        assert!(!d.check(&["a", "b"], 2).await.too_similar);
    }

    #[test]
    fn test_judge_window_respects_size() {
        let vectors = vec![vec![1.0, 0.0], vec![1.0, 0.0]];
        assert!(judge(&vectors, 0.99).too_similar);
        assert!(!judge(&vectors[..1], 0.0).too_similar);
    }
}
