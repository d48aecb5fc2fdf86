//! Run and engine configuration.
//!
//! A `RunConfig` is fixed for the lifetime of a run and persisted with its
//! record, so every fold, resume, and vote sees the same participants,
//! budgets, weights, and seed.

use std::collections::HashSet;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::debate::error::{DebateError, DebateResult};
use crate::resilience::RetryPolicy;

/// Per-participant model selection, carried by every request made on its behalf.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelChoice {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

/// Static description of one participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantConfig {
    pub name: String,
    #[serde(default)]
    pub persona_background: String,
    #[serde(default = "default_bias_weight")]
    pub bias_weight: f64,
    /// Maximum statements this participant may make. `None` = `max_iterations`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_interventions: Option<u32>,
    #[serde(default)]
    pub model: ModelChoice,
}

fn default_bias_weight() -> f64 {
    1.0
}

impl ParticipantConfig {
    pub fn new(name: &str, persona_background: &str) -> Self {
        Self {
            name: name.to_string(),
            persona_background: persona_background.to_string(),
            bias_weight: default_bias_weight(),
            max_interventions: None,
            model: ModelChoice::default(),
        }
    }

    pub fn with_bias(mut self, bias_weight: f64) -> Self {
        self.bias_weight = bias_weight;
        self
    }

    pub fn with_max_interventions(mut self, max: u32) -> Self {
        self.max_interventions = Some(max);
        self
    }

    pub fn with_model(mut self, model: &str) -> Self {
        self.model.model = Some(model.to_string());
        self
    }
}

/// How selection weights are derived for eligible speakers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightingMode {
    /// Weight = configured `bias_weight`.
    #[default]
    Bias,
    /// Weight = exp(hands_raised - spoken_turns / bias_weight), favouring
    /// participants who asked often but spoke rarely.
    Fairness,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub weighting: WeightingMode,
}

/// Settings for the semantic-redundancy stop condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvergenceConfig {
    pub enabled: bool,
    /// Number of most recent statements inspected, newest included.
    pub window: usize,
    /// Fires when the max cosine similarity is strictly above this value.
    pub threshold: f64,
    /// The check is skipped before this iteration.
    pub min_iterations: u64,
}

impl Default for ConvergenceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window: 4,
            threshold: 0.9,
            min_iterations: 0,
        }
    }
}

/// Full configuration of one debate run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub topic: String,
    pub participants: Vec<ParticipantConfig>,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u64,
    /// Digests kept per participant. `None` keeps everything.
    #[serde(default = "default_memory_capacity")]
    pub memory_capacity: Option<usize>,
    /// Selection seed. Assigned at start when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub convergence: ConvergenceConfig,
}

fn default_max_iterations() -> u64 {
    21
}

fn default_memory_capacity() -> Option<usize> {
    Some(3)
}

impl RunConfig {
    pub fn new(topic: &str, participants: Vec<ParticipantConfig>) -> Self {
        Self {
            topic: topic.to_string(),
            participants,
            max_iterations: default_max_iterations(),
            memory_capacity: default_memory_capacity(),
            seed: None,
            scheduler: SchedulerConfig::default(),
            convergence: ConvergenceConfig::default(),
        }
    }

    pub fn with_max_iterations(mut self, max_iterations: u64) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Parse from TOML text and validate.
    pub fn from_toml_str(text: &str) -> DebateResult<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| DebateError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML run configuration from disk.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read run config {}", path.display()))?;
        Self::from_toml_str(&text)
            .with_context(|| format!("Invalid run config {}", path.display()))
    }

    /// Configured budget of a participant.
    pub fn budget_of(&self, participant: &ParticipantConfig) -> u32 {
        participant
            .max_interventions
            .unwrap_or_else(|| self.max_iterations.min(u32::MAX as u64) as u32)
    }

    pub fn validate(&self) -> DebateResult<()> {
        let invalid = |msg: String| Err(DebateError::InvalidConfig(msg));

        if self.topic.trim().is_empty() {
            return invalid("topic is empty".into());
        }
        if self.participants.is_empty() {
            return invalid("no participants".into());
        }
        if self.max_iterations == 0 {
            return invalid("max_iterations must be at least 1".into());
        }
        if self.memory_capacity == Some(0) {
            return invalid("memory_capacity must be positive or absent".into());
        }

        let mut seen = HashSet::new();
        for p in &self.participants {
            if p.name.trim().is_empty() {
                return invalid("participant with empty name".into());
            }
            if !seen.insert(p.name.as_str()) {
                return invalid(format!("duplicate participant name {}", p.name));
            }
            if !p.bias_weight.is_finite() || p.bias_weight < 0.0 {
                return invalid(format!(
                    "bias_weight of {} must be finite and non-negative",
                    p.name
                ));
            }
        }
        if self.participants.iter().all(|p| self.budget_of(p) == 0) {
            return invalid("every participant has a zero intervention budget".into());
        }

        let c = &self.convergence;
        if c.window < 2 {
            return invalid("convergence window must be at least 2".into());
        }
        if !(c.threshold > 0.0 && c.threshold <= 1.0) {
            return invalid("convergence threshold must be in (0, 1]".into());
        }
        Ok(())
    }
}

/// Engine-wide settings shared by every run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Events returned by `poll`.
    pub latest_events: usize,
    /// Retry budget for statement generation within one turn.
    pub turn_retry: RetryPolicy,
    /// Retry budget for each participant's vote.
    pub vote_retry: RetryPolicy,
    /// Retry budget for convergence embeddings.
    pub embedding_retry: RetryPolicy,
    /// Snapshot after every N committed turns; 0 disables snapshots.
    pub snapshot_interval: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            latest_events: 5,
            turn_retry: RetryPolicy::default(),
            vote_retry: RetryPolicy::default(),
            embedding_retry: RetryPolicy {
                max_attempts: 2,
                attempt_timeout_ms: Some(60_000),
                ..RetryPolicy::default()
            },
            snapshot_interval: 1,
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(text: &str) -> DebateResult<Self> {
        toml::from_str(text).map_err(|e| DebateError::InvalidConfig(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three() -> Vec<ParticipantConfig> {
        vec![
            ParticipantConfig::new("Ana", "economist").with_bias(0.5),
            ParticipantConfig::new("Ben", "farmer").with_bias(0.3),
            ParticipantConfig::new("Cai", "student").with_bias(0.2),
        ]
    }

    #[test]
    fn test_defaults() {
        let config = RunConfig::new("Tax reform", three());
        assert_eq!(config.max_iterations, 21);
        assert_eq!(config.memory_capacity, Some(3));
        assert_eq!(config.scheduler.weighting, WeightingMode::Bias);
        assert!((config.convergence.threshold - 0.9).abs() < f64::EPSILON);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_budget_defaults_to_max_iterations() {
        let config = RunConfig::new("t", three()).with_max_iterations(7);
        assert_eq!(config.budget_of(&config.participants[0]), 7);
        let p = ParticipantConfig::new("Dee", "").with_max_interventions(2);
        assert_eq!(config.budget_of(&p), 2);
    }

    #[test]
    fn test_rejects_duplicate_names() {
        let mut participants = three();
        participants.push(ParticipantConfig::new("Ana", "twin"));
        let err = RunConfig::new("t", participants).validate().unwrap_err();
        assert!(err.to_string().contains("duplicate participant name Ana"));
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(RunConfig::new("", three()).validate().is_err());
        assert!(RunConfig::new("t", vec![]).validate().is_err());
        assert!(RunConfig::new("t", three())
            .with_max_iterations(0)
            .validate()
            .is_err());

        let mut participants = three();
        participants[1].bias_weight = f64::NAN;
        assert!(RunConfig::new("t", participants).validate().is_err());

        let participants = three()
            .into_iter()
            .map(|p| p.with_max_interventions(0))
            .collect();
        assert!(RunConfig::new("t", participants).validate().is_err());

        let mut config = RunConfig::new("t", three());
        config.convergence.window = 1;
        assert!(config.validate().is_err());

        let mut config = RunConfig::new("t", three());
        config.memory_capacity = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_toml() {
        let text = r#"
topic = "Should the city ban cars downtown?"
max_iterations = 8
seed = 42

[scheduler]
weighting = "fairness"

[convergence]
threshold = 0.85

[[participants]]
name = "Ana"
persona_background = "urban planner"
bias_weight = 2.0

[[participants]]
name = "Ben"
max_interventions = 3
model = { model = "mistral-small", temperature = 0.4 }
"#;
        let config = RunConfig::from_toml_str(text).unwrap();
        assert_eq!(config.max_iterations, 8);
        assert_eq!(config.seed, Some(42));
        assert_eq!(config.scheduler.weighting, WeightingMode::Fairness);
        assert_eq!(config.convergence.window, 4);
        assert!((config.convergence.threshold - 0.85).abs() < f64::EPSILON);
        assert_eq!(config.participants[1].max_interventions, Some(3));
        assert_eq!(
            config.participants[1].model.model.as_deref(),
            Some("mistral-small")
        );
        assert!((config.participants[1].bias_weight - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_from_toml_invalid() {
        let err = RunConfig::from_toml_str("topic = \"x\"\nparticipants = []").unwrap_err();
        assert!(matches!(err, DebateError::InvalidConfig(_)));
    }

    #[test]
    fn test_load_missing_file() {
        let err = RunConfig::load("/nonexistent/run.toml").unwrap_err();
        assert!(err.to_string().contains("Failed to read run config"));
    }

    #[test]
    fn test_engine_config_toml() {
        let config = EngineConfig::from_toml_str(
            "latest_events = 3\n[turn_retry]\nmax_attempts = 5\n",
        )
        .unwrap();
        assert_eq!(config.latest_events, 3);
        assert_eq!(config.turn_retry.max_attempts, 5);
        assert_eq!(config.snapshot_interval, 1);
    }
}
