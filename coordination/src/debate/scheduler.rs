//! Turn scheduler / moderator.
//!
//! # Turn Flow
//!
//! ```text
//! select_speaker ──▶ (statement generated outside) ──▶ poll_engagement
//!       ▲                                                   │
//!       │                                                   ▼
//!       └──── not final ◀── termination check ◀── commit (fold into clone)
//!                                  │
//!                                  └─ reason fired → event k is final
//! ```
//!
//! Termination runs at the end of turn k, on the state that already
//! includes event k, in this order: manual stop, nobody left to continue,
//! convergence, iteration ceiling. The turn that triggers a reason is the
//! one marked final, so no statement is ever generated after the decision.
//!
//! Selection is reproducible: the RNG for iteration i is seeded from the run
//! seed and i alone, so a resumed run draws exactly what the original would.

use futures::future::join_all;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::agents::{AgentState, Participant};
use super::convergence::ConvergenceDetector;
use super::error::{DebateError, DebateResult};
use super::log::{EventLog, StatementEvent};
use super::persistence::{validate_snapshot, RunSnapshot};
use super::state::{RunState, TerminationReason, TransitionError};
use crate::config::{RunConfig, WeightingMode};
use crate::reasoning::{EngagementPolicy, EngagementRequest, PersonaProfile, StatementRequest};

const GOLDEN_GAMMA: u64 = 0x9E37_79B9_7F4A_7C15;

/// Who speaks at a given iteration and how they were picked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Selection {
    pub iteration: u64,
    pub speaker: String,
    /// Names considered, in configured-index order.
    pub eligible: Vec<String>,
    /// True when nobody with budget had raised a hand.
    pub fallback: bool,
}

pub struct Scheduler {
    run_id: String,
    config: RunConfig,
    seed: u64,
    agents: AgentState,
    run_state: RunState,
    log: EventLog,
    detector: ConvergenceDetector,
}

impl Scheduler {
    /// Fresh scheduler for a run with no events.
    pub fn new(run_id: &str, config: RunConfig, detector: ConvergenceDetector) -> DebateResult<Self> {
        config.validate()?;
        Ok(Self {
            run_id: run_id.to_string(),
            seed: config.seed.unwrap_or_default(),
            agents: AgentState::new(&config),
            run_state: RunState::new(),
            log: EventLog::new(),
            config,
            detector,
        })
    }

    /// Rebuild from committed events, folding only what the snapshot has not.
    ///
    /// A snapshot that fails validation is ignored and the whole log folded.
    pub fn resume(
        run_id: &str,
        config: RunConfig,
        detector: ConvergenceDetector,
        snapshot: Option<&RunSnapshot>,
        log: EventLog,
    ) -> DebateResult<Self> {
        config.validate()?;

        let restored = snapshot.and_then(|snap| {
            let status = validate_snapshot(snap, &config, &log);
            if status.can_resume() {
                Some(snap)
            } else {
                warn!(run_id, ?status, "Ignoring unusable snapshot, folding full log");
                None
            }
        });

        let (mut agents, mut run_state) = match restored {
            Some(snap) => (snap.agents.clone(), snap.run_state.clone()),
            None => (AgentState::new(&config), RunState::new()),
        };
        let from = agents.applied_through();
        let mut folded = 0usize;
        for event in log.suffix(from) {
            agents.apply(event)?;
            run_state.observe(event);
            folded += 1;
        }
        debug!(run_id, from, folded, "Scheduler resumed");

        Ok(Self {
            run_id: run_id.to_string(),
            seed: config.seed.unwrap_or_default(),
            agents,
            run_state,
            log,
            config,
            detector,
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn agents(&self) -> &AgentState {
        &self.agents
    }

    pub fn run_state(&self) -> &RunState {
        &self.run_state
    }

    pub fn log(&self) -> &EventLog {
        &self.log
    }

    pub fn is_finished(&self) -> bool {
        self.log.is_finished()
    }

    pub fn next_iteration(&self) -> u64 {
        self.log.last_iteration() + 1
    }

    /// Names that engaged with the previous statement.
    pub fn hands_raised(&self) -> &[String] {
        self.log
            .last()
            .map(|e| e.engaged_with.as_slice())
            .unwrap_or(&[])
    }

    /// Pick the speaker of the next iteration.
    pub fn select_speaker(&self) -> DebateResult<Selection> {
        let iteration = self.next_iteration();
        if self.is_finished() {
            return Err(DebateError::invalid_event(iteration, "run already finished"));
        }

        let hands = self.hands_raised();
        let raised: Vec<&Participant> = self
            .agents
            .participants()
            .iter()
            .filter(|p| p.has_budget() && hands.contains(&p.name))
            .collect();
        let fallback = raised.is_empty();
        let eligible: Vec<&Participant> = if fallback {
            self.agents
                .participants()
                .iter()
                .filter(|p| p.has_budget())
                .collect()
        } else {
            raised
        };
        if eligible.is_empty() {
            return Err(DebateError::BudgetExhausted(format!(
                "nobody can speak at iteration {}",
                iteration
            )));
        }

        let weights: Vec<f64> = eligible
            .iter()
            .map(|p| sanitize(self.weight_of(p)))
            .collect();
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed ^ iteration.wrapping_mul(GOLDEN_GAMMA));
        let pick = weighted_pick(&weights, rng.gen::<f64>());
        let speaker = eligible[pick].name.clone();

        debug!(
            run_id = %self.run_id,
            iteration,
            speaker = %speaker,
            fallback,
            "Speaker selected"
        );
        Ok(Selection {
            iteration,
            speaker,
            eligible: eligible.iter().map(|p| p.name.clone()).collect(),
            fallback,
        })
    }

    fn weight_of(&self, p: &Participant) -> f64 {
        match self.config.scheduler.weighting {
            WeightingMode::Bias => p.bias_weight,
            WeightingMode::Fairness => {
                let bias = if p.bias_weight == 0.0 { 1.0 } else { p.bias_weight };
                let exponent = p.hands_raised as f64 - p.spoken_turns as f64 / bias;
                exponent.clamp(-50.0, 50.0).exp()
            }
        }
    }

    /// Request for the selected speaker's statement.
    pub fn statement_request(&self, selection: &Selection) -> StatementRequest {
        let persona = self
            .agents
            .participant(&selection.speaker)
            .map(Participant::persona)
            .unwrap_or_else(|| PersonaProfile {
                name: selection.speaker.clone(),
                background: String::new(),
                model: Default::default(),
            });
        StatementRequest {
            run_id: self.run_id.clone(),
            iteration: selection.iteration,
            persona,
            topic: self.config.topic.clone(),
            context: self.agents.turn_context(&selection.speaker, self.log.last()),
        }
    }

    /// Participants who may raise a hand after `speaker` talks.
    pub fn listeners(&self, speaker: &str) -> Vec<&Participant> {
        self.agents
            .participants()
            .iter()
            .filter(|p| p.name != speaker && p.has_budget())
            .collect()
    }

    /// Ask every listener, concurrently, whether it wants to respond.
    ///
    /// Failures count as no hand. Result is in configured-index order.
    pub async fn poll_engagement(
        &self,
        policy: &dyn EngagementPolicy,
        selection: &Selection,
        statement: &str,
    ) -> Vec<String> {
        let listeners = self.listeners(&selection.speaker);
        let asks = listeners.iter().map(|p| {
            policy.wants_to_respond(EngagementRequest {
                run_id: self.run_id.clone(),
                iteration: selection.iteration,
                listener: p.persona(),
                listener_last_statement: p.last_statement.clone(),
                speaker: selection.speaker.clone(),
                statement: statement.to_string(),
                topic: self.config.topic.clone(),
            })
        });
        let answers = join_all(asks).await;

        listeners
            .iter()
            .zip(answers)
            .filter_map(|(p, answer)| match answer {
                Ok(true) => Some(p.name.clone()),
                Ok(false) => None,
                Err(e) => {
                    warn!(
                        run_id = %self.run_id,
                        iteration = selection.iteration,
                        listener = %p.name,
                        error = %e,
                        "Engagement check failed, counting as no hand"
                    );
                    None
                }
            })
            .collect()
    }

    /// Commit the statement of `selection` as the next event.
    ///
    /// The event is folded into a copy of the agent state first; only when the
    /// fold, termination check and log append all succeed does the copy
    /// replace the live state.
    pub async fn commit(
        &mut self,
        selection: &Selection,
        content: String,
        engaged_with: Vec<String>,
        stop_requested: bool,
    ) -> DebateResult<StatementEvent> {
        let expected = self.next_iteration();
        if selection.iteration != expected {
            return Err(DebateError::OutOfOrder {
                expected,
                found: selection.iteration,
            });
        }

        let event = StatementEvent::new(selection.iteration, &selection.speaker, &content, engaged_with);
        let mut candidate = self.agents.clone();
        candidate.apply(&event)?;

        let event = match self.termination(&candidate, &event, stop_requested).await {
            Some(reason) => event.finalize(reason),
            None => event,
        };

        self.log.append(event.clone())?;
        self.agents = candidate;
        self.run_state.observe(&event);
        Ok(event)
    }

    async fn termination(
        &self,
        candidate: &AgentState,
        event: &StatementEvent,
        stop_requested: bool,
    ) -> Option<TerminationReason> {
        if stop_requested {
            return Some(TerminationReason::ManualStop);
        }
        // Only participants with budget are ever asked to engage, so an empty
        // budget pool also means an empty set of usable hands.
        if !candidate.any_budget_left() {
            return Some(TerminationReason::NoOneWantsToContinue);
        }

        let window = self.detector.config().window;
        let committed = self.log.latest(window.saturating_sub(1));
        if self.detector.check_events(committed, event).await.too_similar {
            return Some(TerminationReason::CommentsTooSimilar);
        }

        if event.iteration >= self.config.max_iterations {
            return Some(TerminationReason::MaxItersReached);
        }
        None
    }

    /// Mark the run failed. No event is written.
    pub fn fail(&mut self, error: &str) -> Result<(), TransitionError> {
        self.run_state.fail(error)
    }

    /// Snapshot of the current folded state.
    pub fn snapshot(&self, sequence: u64) -> RunSnapshot {
        RunSnapshot::new(&self.run_id, &self.run_state, &self.agents, sequence)
    }
}

fn sanitize(weight: f64) -> f64 {
    if weight.is_finite() && weight > 0.0 {
        weight
    } else {
        0.0
    }
}

/// Index picked by a uniform draw `u` in [0, 1) over `weights`.
///
/// Walks in order and returns the first index whose cumulative weight
/// exceeds `u * total`. All-zero weights fall back to a uniform pick.
pub fn weighted_pick(weights: &[f64], u: f64) -> usize {
    if weights.is_empty() {
        return 0;
    }
    let total: f64 = weights.iter().sum();
    if total <= 0.0 || !total.is_finite() {
        let idx = (u * weights.len() as f64) as usize;
        return idx.min(weights.len() - 1);
    }
    let target = u * total;
    let mut acc = 0.0;
    for (idx, w) in weights.iter().enumerate() {
        acc += w;
        if acc > target {
            return idx;
        }
    }
    // Rounding can leave `acc` a hair below `target`; pick the last non-zero.
    weights.iter().rposition(|w| *w > 0.0).unwrap_or(weights.len() - 1)
}
