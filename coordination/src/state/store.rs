//! Event store: durable home of run records, event logs, snapshots, votes.
//!
//! The store is single-writer per run (the run's scheduler task) and
//! multi-reader (polling, voting). It enforces the ordering invariant itself
//! so a misbehaving writer cannot corrupt a log.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use super::types::{RunId, RunRecord};
use crate::debate::log::StatementEvent;
use crate::debate::persistence::RunSnapshot;
use crate::debate::voting::VoteTally;

/// Error type for event store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Run not found: {0}")]
    NotFound(String),

    #[error("Run already exists: {0}")]
    AlreadyExists(String),

    #[error("Out of order append to {run_id}: expected iteration {expected}, found {found}")]
    OutOfOrder {
        run_id: String,
        expected: u64,
        found: u64,
    },

    #[error("Run {0} already holds a final event")]
    Finalized(String),

    #[error("Lock poisoned")]
    LockPoisoned,
}

/// Result type for event store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Shared reference to an event store
pub type SharedEventStore = Arc<dyn EventStore>;

/// Storage operations the engine needs.
pub trait EventStore: Send + Sync {
    fn create_run(&self, record: &RunRecord) -> StoreResult<()>;

    fn get_run(&self, run_id: &str) -> StoreResult<RunRecord>;

    fn list_runs(&self) -> StoreResult<Vec<RunId>>;

    /// Append the next event. Iteration must be exactly `last + 1` and the
    /// log must not already be final.
    fn append_event(&self, run_id: &str, event: &StatementEvent) -> StoreResult<()>;

    /// All events in iteration order.
    fn events(&self, run_id: &str) -> StoreResult<Vec<StatementEvent>>;

    /// Mark the run failed. A first recorded failure is never overwritten.
    fn record_failure(&self, run_id: &str, reason: &str) -> StoreResult<()>;

    fn put_snapshot(&self, run_id: &str, snapshot: &RunSnapshot) -> StoreResult<()>;

    fn latest_snapshot(&self, run_id: &str) -> StoreResult<Option<RunSnapshot>>;

    /// Store `tally` unless votes already exist; return whichever is stored.
    fn put_votes_if_absent(&self, run_id: &str, tally: &VoteTally) -> StoreResult<VoteTally>;

    fn get_votes(&self, run_id: &str) -> StoreResult<Option<VoteTally>>;
}

/// Check the append invariant against the current tail.
pub(crate) fn check_append(
    run_id: &str,
    last: Option<&StatementEvent>,
    event: &StatementEvent,
) -> StoreResult<()> {
    if last.map(|e| e.is_final).unwrap_or(false) {
        return Err(StoreError::Finalized(run_id.to_string()));
    }
    let expected = last.map(|e| e.iteration).unwrap_or(0) + 1;
    if event.iteration != expected {
        return Err(StoreError::OutOfOrder {
            run_id: run_id.to_string(),
            expected,
            found: event.iteration,
        });
    }
    Ok(())
}

#[derive(Debug, Clone)]
struct StoredRun {
    record: RunRecord,
    events: Vec<StatementEvent>,
    snapshot: Option<RunSnapshot>,
    votes: Option<VoteTally>,
}

/// In-process store. Everything is lost when the process exits.
#[derive(Debug, Default)]
pub struct MemoryEventStore {
    runs: RwLock<HashMap<RunId, StoredRun>>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a shared reference to this store
    pub fn shared(self) -> SharedEventStore {
        Arc::new(self)
    }

    fn read<T>(&self, run_id: &str, f: impl FnOnce(&StoredRun) -> T) -> StoreResult<T> {
        let runs = self.runs.read().map_err(|_| StoreError::LockPoisoned)?;
        let run = runs
            .get(run_id)
            .ok_or_else(|| StoreError::NotFound(run_id.to_string()))?;
        Ok(f(run))
    }

    fn write<T>(
        &self,
        run_id: &str,
        f: impl FnOnce(&mut StoredRun) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let mut runs = self.runs.write().map_err(|_| StoreError::LockPoisoned)?;
        let run = runs
            .get_mut(run_id)
            .ok_or_else(|| StoreError::NotFound(run_id.to_string()))?;
        f(run)
    }
}

impl EventStore for MemoryEventStore {
    fn create_run(&self, record: &RunRecord) -> StoreResult<()> {
        let mut runs = self.runs.write().map_err(|_| StoreError::LockPoisoned)?;
        if runs.contains_key(&record.run_id) {
            return Err(StoreError::AlreadyExists(record.run_id.clone()));
        }
        runs.insert(
            record.run_id.clone(),
            StoredRun {
                record: record.clone(),
                events: Vec::new(),
                snapshot: None,
                votes: None,
            },
        );
        Ok(())
    }

    fn get_run(&self, run_id: &str) -> StoreResult<RunRecord> {
        self.read(run_id, |run| run.record.clone())
    }

    fn list_runs(&self) -> StoreResult<Vec<RunId>> {
        let runs = self.runs.read().map_err(|_| StoreError::LockPoisoned)?;
        let mut ids: Vec<RunId> = runs.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    fn append_event(&self, run_id: &str, event: &StatementEvent) -> StoreResult<()> {
        self.write(run_id, |run| {
            check_append(run_id, run.events.last(), event)?;
            run.events.push(event.clone());
            Ok(())
        })
    }

    fn events(&self, run_id: &str) -> StoreResult<Vec<StatementEvent>> {
        self.read(run_id, |run| run.events.clone())
    }

    fn record_failure(&self, run_id: &str, reason: &str) -> StoreResult<()> {
        self.write(run_id, |run| {
            run.record.mark_failed(reason);
            Ok(())
        })
    }

    fn put_snapshot(&self, run_id: &str, snapshot: &RunSnapshot) -> StoreResult<()> {
        self.write(run_id, |run| {
            run.snapshot = Some(snapshot.clone());
            Ok(())
        })
    }

    fn latest_snapshot(&self, run_id: &str) -> StoreResult<Option<RunSnapshot>> {
        self.read(run_id, |run| run.snapshot.clone())
    }

    fn put_votes_if_absent(&self, run_id: &str, tally: &VoteTally) -> StoreResult<VoteTally> {
        self.write(run_id, |run| {
            Ok(run.votes.get_or_insert_with(|| tally.clone()).clone())
        })
    }

    fn get_votes(&self, run_id: &str) -> StoreResult<Option<VoteTally>> {
        self.read(run_id, |run| run.votes.clone())
    }
}
