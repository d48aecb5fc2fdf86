//! Per-participant state folded from the event log.
//!
//! `AgentState` is never edited directly: it only moves forward through
//! [`AgentState::apply`], one committed [`StatementEvent`] at a time, so the
//! state after iteration k is always a pure function of the log prefix `1..=k`.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use super::error::{DebateError, DebateResult};
use super::log::StatementEvent;
use crate::config::{ModelChoice, RunConfig};
use crate::reasoning::{PersonaProfile, TurnContext};

/// Mutable state of one participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    /// Position in the run configuration. Used for deterministic ordering.
    pub index: usize,
    pub name: String,
    pub persona_background: String,
    pub bias_weight: f64,
    /// Configured maximum number of statements.
    pub max_interventions: u32,
    /// Statements still allowed. Never negative.
    pub intervention_budget: u32,
    /// Digests of statements this participant engaged with, oldest first.
    pub memory: VecDeque<String>,
    /// Most recent own statement; empty until the first turn.
    pub last_statement: String,
    pub spoken_turns: u32,
    pub hands_raised: u32,
    #[serde(default)]
    pub model: ModelChoice,
}

impl Participant {
    pub fn has_budget(&self) -> bool {
        self.intervention_budget > 0
    }

    pub fn persona(&self) -> PersonaProfile {
        PersonaProfile {
            name: self.name.clone(),
            background: self.persona_background.clone(),
            model: self.model.clone(),
        }
    }

    pub fn memory_vec(&self) -> Vec<String> {
        self.memory.iter().cloned().collect()
    }
}

/// Digest stored in a listener's memory for one statement.
pub fn digest(speaker: &str, content: &str) -> String {
    format!("{}: {}", speaker, content)
}

/// Folded state of every participant in a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    participants: Vec<Participant>,
    memory_capacity: Option<usize>,
    applied_through: u64,
}

impl AgentState {
    /// Blank state built from configuration, before any event.
    pub fn new(config: &RunConfig) -> Self {
        let participants = config
            .participants
            .iter()
            .enumerate()
            .map(|(index, p)| {
                let budget = config.budget_of(p);
                Participant {
                    index,
                    name: p.name.clone(),
                    persona_background: p.persona_background.clone(),
                    bias_weight: p.bias_weight,
                    max_interventions: budget,
                    intervention_budget: budget,
                    memory: VecDeque::new(),
                    last_statement: String::new(),
                    spoken_turns: 0,
                    hands_raised: 0,
                    model: p.model.clone(),
                }
            })
            .collect();
        Self {
            participants,
            memory_capacity: config.memory_capacity,
            applied_through: 0,
        }
    }

    /// Fold a sequence of events from blank state.
    pub fn fold<'a>(
        config: &RunConfig,
        events: impl IntoIterator<Item = &'a StatementEvent>,
    ) -> DebateResult<Self> {
        let mut state = Self::new(config);
        for event in events {
            state.apply(event)?;
        }
        Ok(state)
    }

    /// Fold one committed event.
    ///
    /// Validates everything first; on error the state is left untouched.
    pub fn apply(&mut self, event: &StatementEvent) -> DebateResult<()> {
        let iteration = event.iteration;
        if iteration != self.applied_through + 1 {
            return Err(DebateError::invalid_event(
                iteration,
                format!(
                    "expected iteration {}, state is at {}",
                    self.applied_through + 1,
                    self.applied_through
                ),
            ));
        }

        let speaker = self.position(&event.speaker).ok_or_else(|| {
            DebateError::invalid_event(iteration, format!("unknown speaker {}", event.speaker))
        })?;
        if !self.participants[speaker].has_budget() {
            return Err(DebateError::invalid_event(
                iteration,
                format!("{} has no interventions left", event.speaker),
            ));
        }

        let mut listeners = Vec::with_capacity(event.engaged_with.len());
        for name in &event.engaged_with {
            let idx = self.position(name).ok_or_else(|| {
                DebateError::invalid_event(iteration, format!("unknown engaged participant {}", name))
            })?;
            if idx == speaker {
                return Err(DebateError::invalid_event(
                    iteration,
                    format!("{} cannot engage with their own statement", name),
                ));
            }
            if listeners.contains(&idx) {
                return Err(DebateError::invalid_event(
                    iteration,
                    format!("{} engaged twice", name),
                ));
            }
            listeners.push(idx);
        }

        let p = &mut self.participants[speaker];
        p.intervention_budget -= 1;
        p.spoken_turns += 1;
        p.last_statement = event.content.clone();

        let line = digest(&event.speaker, &event.content);
        for idx in listeners {
            let listener = &mut self.participants[idx];
            listener.hands_raised += 1;
            listener.memory.push_back(line.clone());
            if let Some(cap) = self.memory_capacity {
                while listener.memory.len() > cap {
                    listener.memory.pop_front();
                }
            }
        }

        self.applied_through = iteration;
        Ok(())
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.participants.iter().position(|p| p.name == name)
    }

    pub fn participant(&self, name: &str) -> Option<&Participant> {
        self.participants.iter().find(|p| p.name == name)
    }

    /// Participants in configured-index order.
    pub fn participants(&self) -> &[Participant] {
        &self.participants
    }

    pub fn any_budget_left(&self) -> bool {
        self.participants.iter().any(Participant::has_budget)
    }

    /// Last iteration folded into this state (0 = none).
    pub fn applied_through(&self) -> u64 {
        self.applied_through
    }

    pub fn memory_capacity(&self) -> Option<usize> {
        self.memory_capacity
    }

    /// What `speaker` knows going into its turn.
    pub fn turn_context(&self, speaker: &str, previous: Option<&StatementEvent>) -> TurnContext {
        let Some(p) = self.participant(speaker) else {
            return TurnContext::default();
        };
        TurnContext {
            memory: p.memory_vec(),
            previous_speaker: previous.map(|e| e.speaker.clone()),
            previous_statement: previous.map(|e| e.content.clone()),
            own_last_statement: (!p.last_statement.is_empty()).then(|| p.last_statement.clone()),
        }
    }

    /// Spoken turns never exceed configured maxima.
    pub fn budgets_consistent(&self) -> bool {
        self.participants.iter().all(|p| {
            p.spoken_turns <= p.max_interventions
                && p.intervention_budget + p.spoken_turns == p.max_interventions
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ParticipantConfig;

    fn config() -> RunConfig {
        RunConfig::new(
            "Four-day week",
            vec![
                ParticipantConfig::new("Ana", "manager").with_max_interventions(2),
                ParticipantConfig::new("Ben", "nurse"),
                ParticipantConfig::new("Cai", "student"),
            ],
        )
        .with_max_iterations(10)
    }

    fn event(iteration: u64, speaker: &str, engaged: &[&str]) -> StatementEvent {
        StatementEvent::new(
            iteration,
            speaker,
            &format!("{} says #{}", speaker, iteration),
            engaged.iter().map(|s| s.to_string()).collect(),
        )
    }

    #[test]
    fn test_apply_updates_speaker_and_listeners() {
        let mut state = AgentState::new(&config());
        state.apply(&event(1, "Ana", &["Ben"])).unwrap();

        let ana = state.participant("Ana").unwrap();
        assert_eq!(ana.intervention_budget, 1);
        assert_eq!(ana.spoken_turns, 1);
        assert_eq!(ana.last_statement, "Ana says #1");

        let ben = state.participant("Ben").unwrap();
        assert_eq!(ben.memory_vec(), vec!["Ana: Ana says #1".to_string()]);
        assert_eq!(ben.hands_raised, 1);

        let cai = state.participant("Cai").unwrap();
        assert!(cai.memory.is_empty());
        assert_eq!(state.applied_through(), 1);
    }

    #[test]
    fn test_memory_is_bounded() {
        let mut state = AgentState::new(&config());
        for i in 1..=5 {
            let speaker = if i % 2 == 1 { "Ben" } else { "Cai" };
            state.apply(&event(i, speaker, &["Ana"])).unwrap();
        }
        let ana = state.participant("Ana").unwrap();
        assert_eq!(ana.memory.len(), 3);
        assert_eq!(ana.memory.front().unwrap(), "Ben: Ben says #3");
        assert_eq!(ana.hands_raised, 5);
    }

    #[test]
    fn test_unbounded_memory() {
        let mut cfg = config();
        cfg.memory_capacity = None;
        let mut state = AgentState::new(&cfg);
        for i in 1..=5 {
            state.apply(&event(i, "Ben", &["Ana"])).unwrap();
        }
        assert_eq!(state.participant("Ana").unwrap().memory.len(), 5);
    }

    #[test]
    fn test_unknown_speaker_rejected() {
        let mut state = AgentState::new(&config());
        let err = state.apply(&event(1, "Zed", &[])).unwrap_err();
        assert!(matches!(err, DebateError::InvalidEvent { iteration: 1, .. }));
    }

    #[test]
    fn test_exhausted_budget_rejected_without_mutation() {
        let mut state = AgentState::new(&config());
        state.apply(&event(1, "Ana", &[])).unwrap();
        state.apply(&event(2, "Ana", &[])).unwrap();
        let before = state.clone();
        let err = state.apply(&event(3, "Ana", &["Ben"])).unwrap_err();
        assert!(err.to_string().contains("no interventions left"));
        assert_eq!(state, before);
    }

    #[test]
    fn test_bad_engagement_rejected_atomically() {
        let mut state = AgentState::new(&config());
        let before = state.clone();
        assert!(state.apply(&event(1, "Ana", &["Ben", "Ana"])).is_err());
        assert!(state.apply(&event(1, "Ana", &["Ben", "Zed"])).is_err());
        assert!(state.apply(&event(1, "Ana", &["Ben", "Ben"])).is_err());
        assert_eq!(state, before);
    }

    #[test]
    fn test_gap_rejected() {
        let mut state = AgentState::new(&config());
        assert!(state.apply(&event(2, "Ana", &[])).is_err());
    }

    #[test]
    fn test_fold_is_deterministic_for_every_prefix() {
        let cfg = config();
        let events = vec![
            event(1, "Ana", &["Ben", "Cai"]),
            event(2, "Ben", &["Ana"]),
            event(3, "Cai", &[]),
            event(4, "Ana", &["Cai"]),
            event(5, "Ben", &["Cai"]),
        ];
        for k in 0..=events.len() {
            let a = AgentState::fold(&cfg, &events[..k]).unwrap();
            let b = AgentState::fold(&cfg, &events[..k]).unwrap();
            assert_eq!(
                serde_json::to_string(&a).unwrap(),
                serde_json::to_string(&b).unwrap()
            );
            assert!(a.budgets_consistent());
        }
    }

    #[test]
    fn test_incremental_equals_full_fold() {
        let cfg = config();
        let events = vec![event(1, "Ana", &["Ben"]), event(2, "Ben", &["Ana", "Cai"])];
        let mut incremental = AgentState::fold(&cfg, &events[..1]).unwrap();
        incremental.apply(&events[1]).unwrap();
        assert_eq!(incremental, AgentState::fold(&cfg, &events).unwrap());
    }

    #[test]
    fn test_turn_context() {
        let mut state = AgentState::new(&config());
        let first = event(1, "Ana", &["Ben"]);
        state.apply(&first).unwrap();

        let ctx = state.turn_context("Ben", Some(&first));
        assert_eq!(ctx.memory, vec!["Ana: Ana says #1".to_string()]);
        assert_eq!(ctx.previous_speaker.as_deref(), Some("Ana"));
        assert!(ctx.own_last_statement.is_none());

        let ctx = state.turn_context("Ana", Some(&first));
        assert_eq!(ctx.own_last_statement.as_deref(), Some("Ana says #1"));
    }
}
