//! Deterministic collaborators shared by the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use debate_coordination::reasoning::{
    EngagementRequest, StatementRequest, VoteDecision, VoteRequest,
};
use debate_coordination::{
    Collaborators, ConvergenceConfig, Embedder, EngagementPolicy, EngineConfig, GenerationError,
    ParticipantConfig, RetryPolicy, RunConfig, StatementGenerator, VoteGenerator,
};

// ── Statement generators ───────────────────────────────────────────

/// Distinct text per turn; records every iteration it was asked for.
#[derive(Default)]
pub struct ScriptedStatements {
    pub calls: AtomicUsize,
    pub iterations: Mutex<Vec<u64>>,
}

impl ScriptedStatements {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn iterations(&self) -> Vec<u64> {
        self.iterations.lock().unwrap().clone()
    }
}

#[async_trait]
impl StatementGenerator for ScriptedStatements {
    async fn generate_statement(&self, request: StatementRequest) -> Result<String, GenerationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.iterations.lock().unwrap().push(request.iteration);
        Ok(format!(
            "{} on '{}', turn {}",
            request.persona.name, request.topic, request.iteration
        ))
    }
}

/// Always fails with a transient error.
#[derive(Default)]
pub struct FailingStatements {
    pub calls: AtomicUsize,
}

#[async_trait]
impl StatementGenerator for FailingStatements {
    async fn generate_statement(&self, _: StatementRequest) -> Result<String, GenerationError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        Err(GenerationError::Transient(format!("upstream overloaded #{}", n)))
    }
}

/// First attempt hangs far past any attempt timeout; later attempts answer.
#[derive(Default)]
pub struct SlowFirstStatements {
    pub calls: AtomicUsize,
}

#[async_trait]
impl StatementGenerator for SlowFirstStatements {
    async fn generate_statement(&self, request: StatementRequest) -> Result<String, GenerationError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        Ok(format!("{} speaks at {}", request.persona.name, request.iteration))
    }
}

/// Holds its first call until released, so a test can act mid-turn.
#[derive(Default)]
pub struct GatedStatements {
    pub entered: Notify,
    pub release: Notify,
    pub calls: AtomicUsize,
}

#[async_trait]
impl StatementGenerator for GatedStatements {
    async fn generate_statement(&self, request: StatementRequest) -> Result<String, GenerationError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            self.entered.notify_one();
            self.release.notified().await;
        }
        Ok(format!("{} at turn {}", request.persona.name, request.iteration))
    }
}

// ── Embedding / engagement ─────────────────────────────────────────

/// Same vector for every text: any two statements are identical to it.
pub struct ConstantEmbedder;

#[async_trait]
impl Embedder for ConstantEmbedder {
    async fn embed(&self, _: &str) -> Result<Vec<f32>, GenerationError> {
        Ok(vec![0.6, 0.8])
    }
}

pub struct NeverEngage;

#[async_trait]
impl EngagementPolicy for NeverEngage {
    async fn wants_to_respond(&self, _: EngagementRequest) -> Result<bool, GenerationError> {
        Ok(false)
    }
}

// ── Votes ──────────────────────────────────────────────────────────

/// Everyone but "Cai" votes yes.
#[derive(Default)]
pub struct FixedVotes {
    pub calls: AtomicUsize,
    pub requests: Mutex<Vec<VoteRequest>>,
}

impl FixedVotes {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VoteGenerator for FixedVotes {
    async fn generate_vote(&self, request: VoteRequest) -> Result<VoteDecision, GenerationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let decision = request.persona.name != "Cai";
        self.requests.lock().unwrap().push(request);
        Ok(VoteDecision {
            decision,
            rationale: if decision { "convinced".into() } else { "not convinced".into() },
        })
    }
}

// ── Builders ───────────────────────────────────────────────────────

pub fn collaborators(
    statements: Arc<dyn StatementGenerator>,
    votes: Arc<dyn VoteGenerator>,
    engagement: Arc<dyn EngagementPolicy>,
) -> Collaborators {
    Collaborators {
        statements,
        votes,
        embedder: Arc::new(ConstantEmbedder),
        engagement,
    }
}

/// Three participants, convergence off, fixed seed.
pub fn three(max_iterations: u64) -> RunConfig {
    let mut config = RunConfig::new(
        "Should homework be abolished?",
        vec![
            ParticipantConfig::new("Ana", "teacher"),
            ParticipantConfig::new("Ben", "parent"),
            ParticipantConfig::new("Cai", "pupil"),
        ],
    )
    .with_max_iterations(max_iterations)
    .with_seed(42);
    config.convergence = ConvergenceConfig {
        enabled: false,
        ..ConvergenceConfig::default()
    };
    config
}

/// No sleeps, no timeouts, three attempts everywhere.
pub fn fast_engine_config() -> EngineConfig {
    EngineConfig {
        turn_retry: RetryPolicy::immediate(3),
        vote_retry: RetryPolicy::immediate(3),
        embedding_retry: RetryPolicy::immediate(1),
        ..EngineConfig::default()
    }
}
