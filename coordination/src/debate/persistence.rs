//! Run snapshots: checkpoint folded state so resume only folds the suffix.
//!
//! A snapshot is a cache of `fold(log[..=applied_through])`. It is never the
//! source of truth: if it does not agree with the log and configuration it is
//! discarded and the whole log is folded instead.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::agents::AgentState;
use super::error::DebateError;
use super::log::EventLog;
use super::state::RunState;
use crate::config::RunConfig;

/// Folded state of a run at one iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSnapshot {
    /// Schema version for forward compatibility.
    pub version: u32,
    pub run_id: String,
    pub run_state: RunState,
    pub agents: AgentState,
    /// Monotonic snapshot sequence number within the run.
    pub sequence: u64,
    pub taken_at: DateTime<Utc>,
}

impl RunSnapshot {
    pub const CURRENT_VERSION: u32 = 1;

    pub fn new(run_id: &str, run_state: &RunState, agents: &AgentState, sequence: u64) -> Self {
        Self {
            version: Self::CURRENT_VERSION,
            run_id: run_id.to_string(),
            run_state: run_state.clone(),
            agents: agents.clone(),
            sequence,
            taken_at: Utc::now(),
        }
    }

    /// Last iteration folded into the snapshot.
    pub fn applied_through(&self) -> u64 {
        self.agents.applied_through()
    }

    pub fn to_json(&self) -> Result<String, PersistenceError> {
        serde_json::to_string_pretty(self).map_err(|e| PersistenceError::SerializeFailed {
            reason: e.to_string(),
        })
    }

    pub fn from_json(json: &str) -> Result<Self, PersistenceError> {
        let snapshot: Self =
            serde_json::from_str(json).map_err(|e| PersistenceError::DeserializeFailed {
                reason: e.to_string(),
            })?;

        if snapshot.version > Self::CURRENT_VERSION {
            return Err(PersistenceError::VersionMismatch {
                expected: Self::CURRENT_VERSION,
                found: snapshot.version,
            });
        }

        Ok(snapshot)
    }
}

/// Error during snapshot (de)serialization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistenceError {
    SerializeFailed { reason: String },
    DeserializeFailed { reason: String },
    VersionMismatch { expected: u32, found: u32 },
}

impl std::fmt::Display for PersistenceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializeFailed { reason } => write!(f, "serialize failed: {}", reason),
            Self::DeserializeFailed { reason } => write!(f, "deserialize failed: {}", reason),
            Self::VersionMismatch { expected, found } => {
                write!(
                    f,
                    "version mismatch: expected {}, found {}",
                    expected, found
                )
            }
        }
    }
}

impl std::error::Error for PersistenceError {}

impl From<PersistenceError> for DebateError {
    fn from(err: PersistenceError) -> Self {
        DebateError::Snapshot(err.to_string())
    }
}

/// Integrity check result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrityStatus {
    /// Snapshot matches the log head exactly.
    Valid,
    /// Usable, but the log has events past the snapshot.
    Recoverable { warnings: Vec<String> },
    /// Must not be used; fold the whole log instead.
    Corrupted { errors: Vec<String> },
}

impl IntegrityStatus {
    /// Whether resume from the snapshot is safe.
    pub fn can_resume(&self) -> bool {
        matches!(self, Self::Valid | Self::Recoverable { .. })
    }
}

/// Check a snapshot against the configuration and the committed log.
pub fn validate_snapshot(
    snapshot: &RunSnapshot,
    config: &RunConfig,
    log: &EventLog,
) -> IntegrityStatus {
    let mut errors: Vec<String> = Vec::new();
    let mut warnings: Vec<String> = Vec::new();

    if snapshot.version > RunSnapshot::CURRENT_VERSION {
        errors.push(format!(
            "version {} > current {}",
            snapshot.version,
            RunSnapshot::CURRENT_VERSION
        ));
    }

    let applied = snapshot.applied_through();
    let head = log.last_iteration();
    if applied > head {
        errors.push(format!(
            "snapshot at iteration {} but log ends at {}",
            applied, head
        ));
    } else if applied < head {
        warnings.push(format!("{} events past snapshot", head - applied));
    }

    if snapshot.run_state.iteration_count != applied {
        errors.push(format!(
            "run state at iteration {} disagrees with agents at {}",
            snapshot.run_state.iteration_count, applied
        ));
    }

    if snapshot.run_state.is_finished() && !log.is_finished() {
        errors.push("snapshot finished but log has no final event".to_string());
    }

    let agents = snapshot.agents.participants();
    if agents.len() != config.participants.len() {
        errors.push(format!(
            "{} participants in snapshot, {} configured",
            agents.len(),
            config.participants.len()
        ));
    } else {
        for (agent, configured) in agents.iter().zip(&config.participants) {
            if agent.name != configured.name {
                errors.push(format!(
                    "participant {} where {} is configured",
                    agent.name, configured.name
                ));
            } else if agent.max_interventions != config.budget_of(configured) {
                errors.push(format!("budget of {} differs from configuration", agent.name));
            }
        }
    }
    if !snapshot.agents.budgets_consistent() {
        errors.push("spoken turns exceed configured budget".to_string());
    }

    if !errors.is_empty() {
        IntegrityStatus::Corrupted { errors }
    } else if !warnings.is_empty() {
        IntegrityStatus::Recoverable { warnings }
    } else {
        IntegrityStatus::Valid
    }
}
