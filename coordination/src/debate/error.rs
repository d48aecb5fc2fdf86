//! Debate error taxonomy.
//!
//! | Variant               | Fatal | Surfaced to caller |
//! |-----------------------|-------|--------------------|
//! | InvalidEvent          | yes   | via run failure    |
//! | OutOfOrder            | yes   | via run failure    |
//! | GenerationTransient   | after retries | via run failure |
//! | RunNotFinished        | no    | yes                |
//! | BudgetExhausted       | no    | never (termination signal) |

use thiserror::Error;

use crate::state::StoreError;

/// Result type alias for debate operations
pub type DebateResult<T> = Result<T, DebateError>;

/// Errors raised by the debate core and the engine around it.
#[derive(Debug, Error)]
pub enum DebateError {
    /// An event cannot be folded: unknown speaker, exhausted budget, gap in
    /// iterations, or a malformed final marker.
    #[error("invalid event at iteration {iteration}: {reason}")]
    InvalidEvent { iteration: u64, reason: String },

    /// Append attempted with an iteration other than `last + 1`.
    #[error("out of order append: expected iteration {expected}, found {found}")]
    OutOfOrder { expected: u64, found: u64 },

    /// External generation kept failing after the retry budget.
    #[error("generation failed after {attempts} attempts: {last_error}")]
    GenerationTransient { attempts: u32, last_error: String },

    /// Voting requested before the log carries a final event.
    #[error("run {0} has not finished")]
    RunNotFinished(String),

    /// Speaker selected with no budget left. Feeds termination, never user-visible.
    #[error("participant {0} has no interventions left")]
    BudgetExhausted(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("run not found: {0}")]
    RunNotFound(String),

    #[error("run {0} already has an active scheduler")]
    RunAlreadyActive(String),

    #[error("run {run_id} failed: {reason}")]
    RunFailed { run_id: String, reason: String },

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("snapshot error: {0}")]
    Snapshot(String),
}

impl DebateError {
    pub(crate) fn invalid_event(iteration: u64, reason: impl Into<String>) -> Self {
        Self::InvalidEvent {
            iteration,
            reason: reason.into(),
        }
    }

    /// Whether this error ends the run it occurred in.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::RunNotFinished(_) | Self::BudgetExhausted(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        let err = DebateError::OutOfOrder {
            expected: 4,
            found: 6,
        };
        assert_eq!(
            err.to_string(),
            "out of order append: expected iteration 4, found 6"
        );

        let err = DebateError::invalid_event(3, "unknown speaker Zed");
        assert_eq!(
            err.to_string(),
            "invalid event at iteration 3: unknown speaker Zed"
        );
    }

    #[test]
    fn test_fatality() {
        assert!(!DebateError::RunNotFinished("r".into()).is_fatal());
        assert!(!DebateError::BudgetExhausted("Ana".into()).is_fatal());
        assert!(DebateError::OutOfOrder {
            expected: 1,
            found: 2
        }
        .is_fatal());
        assert!(DebateError::GenerationTransient {
            attempts: 3,
            last_error: "503".into()
        }
        .is_fatal());
    }
}
