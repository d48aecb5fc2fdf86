//! Voting reconstruction: votes from the committed log, never from replay.
//!
//! ```text
//! store.get_votes ──Some──▶ return stored tally (no external calls)
//!       │ None
//!       ▼
//! EventLog::from_events ──not final──▶ RunNotFinished
//!       │
//!       ▼
//! AgentState::fold(log)            terminal memory + last statement
//!       │
//!       ▼
//! generate_vote × N (concurrent, retried per participant)
//!       │                          exhausted → abstain record
//!       ▼
//! store.put_votes_if_absent ──▶ tally (first writer wins)
//! ```
//!
//! The reconstructor never appends to the log and never asks for a
//! statement.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{info, warn, Instrument};

use super::agents::{AgentState, Participant};
use super::error::{DebateError, DebateResult};
use super::log::EventLog;
use crate::config::RunConfig;
use crate::events::{DebateEvent, SharedEventBus};
use crate::reasoning::{VoteGenerator, VoteRequest};
use crate::resilience::{retry_with_backoff, RetryPolicy};
use crate::state::SharedEventStore;
use crate::telemetry;

/// Final vote of one participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRecord {
    pub participant: String,
    /// `None` = abstain: the vote call kept failing.
    pub decision: Option<bool>,
    pub rationale: String,
    /// Vote calls made for this record.
    pub attempts: u32,
}

impl VoteRecord {
    pub fn is_abstain(&self) -> bool {
        self.decision.is_none()
    }
}

/// All vote records of a run, one per configured participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteTally {
    pub run_id: String,
    pub yea: usize,
    pub nay: usize,
    pub abstain: usize,
    /// In configured-index order.
    pub records: Vec<VoteRecord>,
    pub recorded_at: DateTime<Utc>,
}

impl VoteTally {
    pub fn from_records(run_id: &str, records: Vec<VoteRecord>) -> Self {
        let yea = records.iter().filter(|r| r.decision == Some(true)).count();
        let nay = records.iter().filter(|r| r.decision == Some(false)).count();
        let abstain = records.iter().filter(|r| r.is_abstain()).count();
        Self {
            run_id: run_id.to_string(),
            yea,
            nay,
            abstain,
            records,
            recorded_at: Utc::now(),
        }
    }

    pub fn record(&self, participant: &str) -> Option<&VoteRecord> {
        self.records.iter().find(|r| r.participant == participant)
    }

    /// Majority outcome; `None` on a tie.
    pub fn passed(&self) -> Option<bool> {
        match self.yea.cmp(&self.nay) {
            std::cmp::Ordering::Greater => Some(true),
            std::cmp::Ordering::Less => Some(false),
            std::cmp::Ordering::Equal => None,
        }
    }
}

pub struct VotingReconstructor {
    store: SharedEventStore,
    votes: Arc<dyn VoteGenerator>,
    retry: RetryPolicy,
    event_bus: Option<SharedEventBus>,
}

impl VotingReconstructor {
    pub fn new(store: SharedEventStore, votes: Arc<dyn VoteGenerator>, retry: RetryPolicy) -> Self {
        Self {
            store,
            votes,
            retry,
            event_bus: None,
        }
    }

    pub fn with_event_bus(mut self, bus: SharedEventBus) -> Self {
        self.event_bus = Some(bus);
        self
    }

    /// Votes of a finished run. Idempotent: a stored tally is returned as is.
    ///
    /// Callers that may race must serialize per run; the store's
    /// compare-and-set keeps the first tally either way.
    pub async fn vote(&self, run_id: &str) -> DebateResult<VoteTally> {
        let span = telemetry::vote_span(run_id);
        let result = self.reconstruct(run_id).instrument(span.clone()).await;
        let outcome = match &result {
            Ok(tally) => match tally.passed() {
                Some(true) => "passed",
                Some(false) => "rejected",
                None => "tied",
            },
            Err(_) => "error",
        };
        telemetry::record_outcome(&span, outcome);
        result
    }

    async fn reconstruct(&self, run_id: &str) -> DebateResult<VoteTally> {
        if let Some(existing) = self.store.get_votes(run_id)? {
            return Ok(existing);
        }

        let record = self.store.get_run(run_id)?;
        let log = EventLog::from_events(self.store.events(run_id)?)?;
        if !log.is_finished() {
            return Err(DebateError::RunNotFinished(run_id.to_string()));
        }

        let records = self.collect(run_id, &record.config, &log).await?;
        let tally = VoteTally::from_records(run_id, records);
        let stored = self.store.put_votes_if_absent(run_id, &tally)?;

        info!(
            run_id,
            yea = stored.yea,
            nay = stored.nay,
            abstain = stored.abstain,
            "Votes recorded"
        );
        if let Some(bus) = &self.event_bus {
            bus.publish(DebateEvent::VotesRecorded {
                run_id: run_id.to_string(),
                yea: stored.yea,
                nay: stored.nay,
                abstain: stored.abstain,
                timestamp: Utc::now(),
            });
        }
        Ok(stored)
    }

    /// Fold the finished log and ask every participant once, concurrently.
    pub async fn collect(
        &self,
        run_id: &str,
        config: &RunConfig,
        log: &EventLog,
    ) -> DebateResult<Vec<VoteRecord>> {
        if !log.is_finished() {
            return Err(DebateError::RunNotFinished(run_id.to_string()));
        }
        let agents = AgentState::fold(config, log)?;
        let calls = agents
            .participants()
            .iter()
            .map(|p| self.vote_of(run_id, &config.topic, p));
        Ok(join_all(calls).await)
    }

    async fn vote_of(&self, run_id: &str, topic: &str, participant: &Participant) -> VoteRecord {
        let request = VoteRequest {
            run_id: run_id.to_string(),
            persona: participant.persona(),
            topic: topic.to_string(),
            memory: participant.memory_vec(),
            last_statement: participant.last_statement.clone(),
        };
        let label = format!("vote:{}", participant.name);
        let mut attempts = 0;
        let result = retry_with_backoff(&self.retry, &label, |attempt| {
            attempts = attempt;
            self.votes.generate_vote(request.clone())
        })
        .await;

        match result {
            Ok(decision) => VoteRecord {
                participant: participant.name.clone(),
                decision: Some(decision.decision),
                rationale: decision.rationale,
                attempts,
            },
            Err(e) => {
                warn!(
                    run_id,
                    participant = %participant.name,
                    attempts = e.attempts,
                    error = %e.last_error,
                    "Vote failed, recording abstention"
                );
                VoteRecord {
                    participant: participant.name.clone(),
                    decision: None,
                    rationale: format!("abstained: {}", e.last_error),
                    attempts: e.attempts,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ParticipantConfig;
    use crate::debate::log::StatementEvent;
    use crate::debate::state::TerminationReason;
    use crate::reasoning::{GenerationError, MockVoteGenerator, VoteDecision};
    use crate::state::{MemoryEventStore, RunRecord};

    fn config() -> RunConfig {
        RunConfig::new(
            "Ban homework",
            vec![
                ParticipantConfig::new("Ana", "teacher"),
                ParticipantConfig::new("Ben", "parent"),
                ParticipantConfig::new("Cai", "pupil"),
            ],
        )
    }

    fn finished_store(run_id: &str) -> SharedEventStore {
        let store = MemoryEventStore::new().shared();
        store.create_run(&RunRecord::with_id(run_id, config())).unwrap();
        store
            .append_event(run_id, &StatementEvent::new(1, "Ana", "No homework.", vec![]))
            .unwrap();
        store
            .append_event(
                run_id,
                &StatementEvent::new(2, "Ana", "Still no homework.", vec![])
                    .finalize(TerminationReason::MaxItersReached),
            )
            .unwrap();
        store
    }

    #[test]
    fn test_tally_counts() {
        let records = vec![
            VoteRecord {
                participant: "Ana".into(),
                decision: Some(true),
                rationale: String::new(),
                attempts: 1,
            },
            VoteRecord {
                participant: "Ben".into(),
                decision: Some(true),
                rationale: String::new(),
                attempts: 1,
            },
            VoteRecord {
                participant: "Cai".into(),
                decision: None,
                rationale: String::new(),
                attempts: 3,
            },
        ];
        let tally = VoteTally::from_records("r", records);
        assert_eq!((tally.yea, tally.nay, tally.abstain), (2, 0, 1));
        assert_eq!(tally.passed(), Some(true));
        assert!(tally.record("Cai").unwrap().is_abstain());
    }

    #[tokio::test]
    async fn test_one_call_per_participant_and_idempotent() {
        let store = finished_store("r1");
        let mut mock = MockVoteGenerator::new();
        mock.expect_generate_vote().times(3).returning(|req| {
            Ok(VoteDecision {
                decision: req.persona.name != "Cai",
                rationale: format!("{} decided", req.persona.name),
            })
        });
        let voter = VotingReconstructor::new(store.clone(), Arc::new(mock), RetryPolicy::immediate(2));

        let first = voter.vote("r1").await.unwrap();
        let second = voter.vote("r1").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.records.len(), 3);
        assert_eq!((first.yea, first.nay, first.abstain), (2, 1, 0));
        assert_eq!(store.events("r1").unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_silent_participants_vote_with_empty_memory() {
        let store = finished_store("r1");
        let mut mock = MockVoteGenerator::new();
        mock.expect_generate_vote().times(3).returning(|req| {
            if req.persona.name == "Ana" {
                assert_eq!(req.last_statement, "Still no homework.");
            } else {
                assert!(req.memory.is_empty());
                assert!(req.last_statement.is_empty());
            }
            Ok(VoteDecision {
                decision: true,
                rationale: String::new(),
            })
        });
        let voter = VotingReconstructor::new(store, Arc::new(mock), RetryPolicy::immediate(1));
        let tally = voter.vote("r1").await.unwrap();
        let names: Vec<_> = tally.records.iter().map(|r| r.participant.as_str()).collect();
        assert_eq!(names, vec!["Ana", "Ben", "Cai"]);
    }

    #[tokio::test]
    async fn test_exhausted_participant_abstains() {
        let store = finished_store("r1");
        let mut mock = MockVoteGenerator::new();
        mock.expect_generate_vote().returning(|req| {
            if req.persona.name == "Ben" {
                Err(GenerationError::Transient("overloaded".into()))
            } else {
                Ok(VoteDecision {
                    decision: false,
                    rationale: "no".into(),
                })
            }
        });
        let voter = VotingReconstructor::new(store, Arc::new(mock), RetryPolicy::immediate(3));
        let tally = voter.vote("r1").await.unwrap();
        let ben = tally.record("Ben").unwrap();
        assert!(ben.is_abstain());
        assert_eq!(ben.attempts, 3);
        assert!(ben.rationale.contains("overloaded"));
        assert_eq!((tally.yea, tally.nay, tally.abstain), (0, 2, 1));
    }

    #[tokio::test]
    async fn test_unfinished_run_rejected_without_calls() {
        let store = MemoryEventStore::new().shared();
        store.create_run(&RunRecord::with_id("r2", config())).unwrap();
        store
            .append_event("r2", &StatementEvent::new(1, "Ana", "x", vec![]))
            .unwrap();
        let mut mock = MockVoteGenerator::new();
        mock.expect_generate_vote().times(0);
        let voter = VotingReconstructor::new(store, Arc::new(mock), RetryPolicy::immediate(1));
        assert!(matches!(
            voter.vote("r2").await,
            Err(DebateError::RunNotFinished(_))
        ));
    }
}
