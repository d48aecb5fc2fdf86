//! Run state machine: phases, termination reasons, and the derived run state.

use serde::{Deserialize, Serialize};

use super::log::StatementEvent;

/// Phase of a debate run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    /// Run created but no turn taken yet.
    NotStarted,
    /// Turns are being scheduled. Re-entrant across process restarts.
    Running,
    /// A final statement event has been committed.
    Finished,
    /// A fatal error ended the run before a final event was committed.
    Failed,
}

impl RunPhase {
    /// Whether this is a terminal phase.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Failed)
    }

    /// Valid transitions from this phase.
    pub fn valid_transitions(self) -> &'static [RunPhase] {
        match self {
            Self::NotStarted => &[Self::Running, Self::Failed],
            Self::Running => &[Self::Finished, Self::Failed],
            Self::Finished | Self::Failed => &[],
        }
    }
}

impl std::fmt::Display for RunPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotStarted => write!(f, "not_started"),
            Self::Running => write!(f, "running"),
            Self::Finished => write!(f, "finished"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Why a run ended.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    /// Nobody raised a hand and nobody has budget left.
    NoOneWantsToContinue,
    /// The newest statement is semantically redundant with the recent window.
    CommentsTooSimilar,
    /// Iteration ceiling reached.
    MaxItersReached,
    /// An operator asked the run to stop.
    ManualStop,
    /// A fatal error; never carried by a statement event.
    Failed { error: String },
}

impl TerminationReason {
    /// Whether a statement event may carry this reason.
    pub fn is_event_reason(&self) -> bool {
        !matches!(self, Self::Failed { .. })
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoOneWantsToContinue => write!(f, "no_one_wants_to_continue"),
            Self::CommentsTooSimilar => write!(f, "comments_too_similar"),
            Self::MaxItersReached => write!(f, "max_iters_reached"),
            Self::ManualStop => write!(f, "manual_stop"),
            Self::Failed { error } => write!(f, "failed: {}", error),
        }
    }
}

/// Error for invalid phase transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionError {
    pub from: RunPhase,
    pub to: RunPhase,
}

impl std::fmt::Display for TransitionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid transition {} → {} (allowed: {:?})",
            self.from,
            self.to,
            self.from.valid_transitions()
        )
    }
}

impl std::error::Error for TransitionError {}

/// Derived state of a run. Never persisted on its own: it is always
/// recomputable from the event log plus the failure marker of the run record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunState {
    pub iteration_count: u64,
    pub phase: RunPhase,
    pub termination_reason: Option<TerminationReason>,
}

impl RunState {
    pub fn new() -> Self {
        Self {
            iteration_count: 0,
            phase: RunPhase::NotStarted,
            termination_reason: None,
        }
    }

    /// Rebuild the run state from committed events.
    pub fn from_events<'a>(events: impl IntoIterator<Item = &'a StatementEvent>) -> Self {
        let mut state = Self::new();
        for event in events {
            state.observe(event);
        }
        state
    }

    /// Rebuild from events, then apply a recorded failure (if any).
    pub fn from_events_and_failure<'a>(
        events: impl IntoIterator<Item = &'a StatementEvent>,
        failure: Option<&str>,
    ) -> Self {
        let mut state = Self::from_events(events);
        if let Some(error) = failure {
            if !state.phase.is_terminal() {
                state.phase = RunPhase::Failed;
                state.termination_reason = Some(TerminationReason::Failed {
                    error: error.to_string(),
                });
            }
        }
        state
    }

    /// Fold a single committed event into the run state.
    pub fn observe(&mut self, event: &StatementEvent) {
        self.iteration_count = event.iteration;
        if self.phase == RunPhase::NotStarted {
            self.phase = RunPhase::Running;
        }
        if event.is_final {
            self.phase = RunPhase::Finished;
            self.termination_reason = event.termination_reason.clone();
        }
    }

    /// Move to a new phase, rejecting transitions the table does not allow.
    pub fn transition(&mut self, to: RunPhase) -> Result<(), TransitionError> {
        if !self.phase.valid_transitions().contains(&to) {
            return Err(TransitionError {
                from: self.phase,
                to,
            });
        }
        self.phase = to;
        Ok(())
    }

    /// Mark the run failed with the given error.
    pub fn fail(&mut self, error: &str) -> Result<(), TransitionError> {
        self.transition(RunPhase::Failed)?;
        self.termination_reason = Some(TerminationReason::Failed {
            error: error.to_string(),
        });
        Ok(())
    }

    pub fn is_finished(&self) -> bool {
        self.phase == RunPhase::Finished
    }

    /// Compact status line.
    pub fn status_line(&self) -> String {
        match &self.termination_reason {
            Some(reason) => format!("[{}] {} iterations | {}", self.phase, self.iteration_count, reason),
            None => format!("[{}] {} iterations", self.phase, self.iteration_count),
        }
    }
}

impl Default for RunState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(iteration: u64, is_final: bool) -> StatementEvent {
        let event = StatementEvent::new(iteration, "Ana", "text", vec![]);
        if is_final {
            event.finalize(TerminationReason::MaxItersReached)
        } else {
            event
        }
    }

    #[test]
    fn test_new_state() {
        let state = RunState::new();
        assert_eq!(state.phase, RunPhase::NotStarted);
        assert_eq!(state.iteration_count, 0);
        assert!(state.termination_reason.is_none());
    }

    #[test]
    fn test_from_events_running() {
        let events = vec![event(1, false), event(2, false)];
        let state = RunState::from_events(&events);
        assert_eq!(state.phase, RunPhase::Running);
        assert_eq!(state.iteration_count, 2);
    }

    #[test]
    fn test_from_events_finished() {
        let events = vec![event(1, false), event(2, true)];
        let state = RunState::from_events(&events);
        assert!(state.is_finished());
        assert_eq!(
            state.termination_reason,
            Some(TerminationReason::MaxItersReached)
        );
    }

    #[test]
    fn test_failure_marker_applies_only_to_unfinished_runs() {
        let events = vec![event(1, false)];
        let state = RunState::from_events_and_failure(&events, Some("503 upstream"));
        assert_eq!(state.phase, RunPhase::Failed);
        assert_eq!(
            state.termination_reason,
            Some(TerminationReason::Failed {
                error: "503 upstream".into()
            })
        );

        let events = vec![event(1, true)];
        let state = RunState::from_events_and_failure(&events, Some("late"));
        assert_eq!(state.phase, RunPhase::Finished);
    }

    #[test]
    fn test_invalid_transition() {
        let mut state = RunState::new();
        let err = state.transition(RunPhase::Finished).unwrap_err();
        assert_eq!(err.from, RunPhase::NotStarted);
        assert_eq!(err.to, RunPhase::Finished);
    }

    #[test]
    fn test_terminal_no_transitions() {
        let mut state = RunState::new();
        state.transition(RunPhase::Running).unwrap();
        state.fail("boom").unwrap();
        assert!(state.transition(RunPhase::Running).is_err());
        assert!(state.fail("again").is_err());
    }

    #[test]
    fn test_reason_serde_snake_case() {
        let json = serde_json::to_string(&TerminationReason::CommentsTooSimilar).unwrap();
        assert_eq!(json, "\"comments_too_similar\"");
        let parsed: TerminationReason = serde_json::from_str("\"manual_stop\"").unwrap();
        assert_eq!(parsed, TerminationReason::ManualStop);
    }

    #[test]
    fn test_reason_display() {
        assert_eq!(
            TerminationReason::NoOneWantsToContinue.to_string(),
            "no_one_wants_to_continue"
        );
        assert_eq!(
            TerminationReason::MaxItersReached.to_string(),
            "max_iters_reached"
        );
        assert_eq!(
            TerminationReason::Failed {
                error: "x".into()
            }
            .to_string(),
            "failed: x"
        );
        assert!(!TerminationReason::Failed { error: "x".into() }.is_event_reason());
    }

    #[test]
    fn test_status_line() {
        let events = vec![event(1, true)];
        let line = RunState::from_events(&events).status_line();
        assert!(line.contains("[finished]"));
        assert!(line.contains("max_iters_reached"));
    }
}
