//! Debate core: the event log and everything derived from it.
//!
//! # Turn Flow
//!
//! ```text
//! Scheduler::select_speaker ──▶ StatementGenerator ──▶ poll_engagement
//!        ▲                                                  │
//!        │                                                  ▼
//!        │                         commit: AgentState::apply on a clone
//!        │                                 termination check
//!        │                                 EventLog::append
//!        │                                                  │
//!        └───────────── not final ◀─────────────────────────┤
//!                                                           ▼ final
//!                                             VotingReconstructor (later)
//! ```
//!
//! The log is the only durable truth. [`AgentState`] and [`RunState`] are
//! folds over it; [`RunSnapshot`] caches a fold so resume only replays the
//! suffix. Voting reads the finished log and never regenerates a turn.

pub mod agents;
pub mod convergence;
pub mod error;
pub mod log;
pub mod persistence;
pub mod scheduler;
pub mod state;
pub mod voting;

pub use agents::{AgentState, Participant};
pub use convergence::{ConvergenceDetector, ConvergenceVerdict};
pub use error::{DebateError, DebateResult};
pub use log::{EventLog, StatementEvent};
pub use persistence::{validate_snapshot, IntegrityStatus, PersistenceError, RunSnapshot};
pub use scheduler::{Scheduler, Selection};
pub use state::{RunPhase, RunState, TerminationReason};
pub use voting::{VoteRecord, VoteTally, VotingReconstructor};
