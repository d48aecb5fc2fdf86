//! Debate Coordination Library
//!
//! Orchestrates multi-agent debates on a topic: who speaks next, when the
//! debate is over, and how every participant finally votes.
//!
//! # Features
//!
//! ## Debate Core
//! - Append-only statement log as the single source of truth
//! - Agent state (memory, budgets, counters) as a pure fold over the log
//! - Seeded, resume-safe weighted speaker selection with a raise-hand signal
//! - Termination on manual stop, empty hands, converging comments, or the
//!   iteration ceiling, always marked on the last committed event
//! - Votes reconstructed from the finished log without replaying any turn
//!
//! ## Engine
//! - `start` / `resume` / `poll` / `request_stop` / `vote` / `wait`
//! - One background loop per run, snapshots for fast resume
//! - Broadcast notifications for every lifecycle step
//!
//! ## Collaborators
//! - Trait seams for statement, vote, embedding and engagement calls
//! - Retry with exponential backoff and per-attempt timeouts
//! - Optional OpenAI-compatible HTTP backend
//!
//! # Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use debate_coordination::{
//!     ChatCompletionsBackend, Collaborators, DebateEngine, EngineConfig, FileEventStore,
//!     ParticipantConfig, RunConfig,
//! };
//!
//! debate_coordination::telemetry::init_tracing();
//! let store = Arc::new(FileEventStore::open("./debate-runs")?);
//! let backend = Arc::new(ChatCompletionsBackend::from_env()?);
//! let engine = DebateEngine::new(store, Collaborators::from_backend(backend), EngineConfig::default());
//!
//! let run_id = engine
//!     .start(RunConfig::new(
//!         "Should cities ban cars from the centre?",
//!         vec![
//!             ParticipantConfig::new("Ana", "urban planner"),
//!             ParticipantConfig::new("Ben", "shop owner"),
//!         ],
//!     ))
//!     .await?;
//! let status = engine.wait(&run_id).await?;
//! let tally = engine.vote(&run_id).await?;
//! ```

#![allow(clippy::uninlined_format_args)]

pub mod config;
pub mod debate;
pub mod engine;
pub mod events;
pub mod reasoning;
pub mod resilience;
pub mod state;
pub mod telemetry;

// Re-export configuration
pub use config::{
    ConvergenceConfig, EngineConfig, ModelChoice, ParticipantConfig, RunConfig, SchedulerConfig,
    WeightingMode,
};

// Re-export key debate types
pub use debate::{
    AgentState, ConvergenceDetector, DebateError, DebateResult, EventLog, Participant, RunPhase,
    RunSnapshot, RunState, Scheduler, StatementEvent, TerminationReason, VoteRecord, VoteTally,
    VotingReconstructor,
};

// Re-export engine types
pub use engine::{DebateEngine, RunStatus};

// Re-export key event types
pub use events::{DebateEvent, EventBus, EventFilter, SharedEventBus};

// Re-export collaborator seam
pub use reasoning::{
    AlwaysEngage, CachedEmbedder, ChatCompletionsBackend, Collaborators, Embedder,
    EngagementPolicy, GenerationError, HttpBackendConfig, SimilarityEngagement,
    StatementGenerator, VoteGenerator,
};

// Re-export resilience types
pub use resilience::{retry_with_backoff, RetryExhausted, RetryPolicy};

// Re-export key state types
pub use state::{EventStore, FileEventStore, MemoryEventStore, RunId, RunRecord, SharedEventStore};
