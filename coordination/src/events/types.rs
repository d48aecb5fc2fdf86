//! Notifications published while debate runs progress.
//!
//! These are advisory: the event log in the store is the record of what
//! happened. A subscriber that lags and misses notifications can always
//! re-read the log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::debate::state::TerminationReason;
use crate::state::RunId;

/// All debate coordination events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DebateEvent {
    /// A run was created and its loop spawned
    RunStarted {
        run_id: RunId,
        topic: String,
        participants: Vec<String>,
        seed: u64,
        timestamp: DateTime<Utc>,
    },

    /// An unfinished run was picked up again
    RunResumed {
        run_id: RunId,
        from_iteration: u64,
        from_snapshot: bool,
        timestamp: DateTime<Utc>,
    },

    /// The moderator picked the next speaker
    SpeakerSelected {
        run_id: RunId,
        iteration: u64,
        speaker: String,
        fallback: bool,
        timestamp: DateTime<Utc>,
    },

    /// A statement event was appended to the log
    StatementCommitted {
        run_id: RunId,
        iteration: u64,
        speaker: String,
        engaged_with: Vec<String>,
        is_final: bool,
        timestamp: DateTime<Utc>,
    },

    /// A stop was requested; honored at the next turn boundary
    StopRequested {
        run_id: RunId,
        timestamp: DateTime<Utc>,
    },

    /// A final event was committed
    RunFinished {
        run_id: RunId,
        iterations: u64,
        reason: TerminationReason,
        timestamp: DateTime<Utc>,
    },

    /// The run ended on a fatal error
    RunFailed {
        run_id: RunId,
        iteration: u64,
        error: String,
        timestamp: DateTime<Utc>,
    },

    /// A vote tally was stored
    VotesRecorded {
        run_id: RunId,
        yea: usize,
        nay: usize,
        abstain: usize,
        timestamp: DateTime<Utc>,
    },
}

impl DebateEvent {
    /// Get the timestamp of this event
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            DebateEvent::RunStarted { timestamp, .. } => *timestamp,
            DebateEvent::RunResumed { timestamp, .. } => *timestamp,
            DebateEvent::SpeakerSelected { timestamp, .. } => *timestamp,
            DebateEvent::StatementCommitted { timestamp, .. } => *timestamp,
            DebateEvent::StopRequested { timestamp, .. } => *timestamp,
            DebateEvent::RunFinished { timestamp, .. } => *timestamp,
            DebateEvent::RunFailed { timestamp, .. } => *timestamp,
            DebateEvent::VotesRecorded { timestamp, .. } => *timestamp,
        }
    }

    /// Get the event type as a string
    pub fn event_type(&self) -> &'static str {
        match self {
            DebateEvent::RunStarted { .. } => "run_started",
            DebateEvent::RunResumed { .. } => "run_resumed",
            DebateEvent::SpeakerSelected { .. } => "speaker_selected",
            DebateEvent::StatementCommitted { .. } => "statement_committed",
            DebateEvent::StopRequested { .. } => "stop_requested",
            DebateEvent::RunFinished { .. } => "run_finished",
            DebateEvent::RunFailed { .. } => "run_failed",
            DebateEvent::VotesRecorded { .. } => "votes_recorded",
        }
    }

    /// Run this event belongs to
    pub fn run_id(&self) -> &str {
        match self {
            DebateEvent::RunStarted { run_id, .. }
            | DebateEvent::RunResumed { run_id, .. }
            | DebateEvent::SpeakerSelected { run_id, .. }
            | DebateEvent::StatementCommitted { run_id, .. }
            | DebateEvent::StopRequested { run_id, .. }
            | DebateEvent::RunFinished { run_id, .. }
            | DebateEvent::RunFailed { run_id, .. }
            | DebateEvent::VotesRecorded { run_id, .. } => run_id,
        }
    }

    /// Whether this event ends the run's loop
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DebateEvent::RunFinished { .. } | DebateEvent::RunFailed { .. }
        )
    }
}
