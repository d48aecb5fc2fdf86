//! Debate engine: the public face of the crate.
//!
//! ```text
//! start(config) ──▶ RunRecord (seed fixed) ──▶ spawn RunLoop ──▶ run_id
//! poll(run_id)  ──▶ RunState derived from the stored log + failure marker
//! request_stop  ──▶ cancel token, honored when the in-flight turn commits
//! vote(run_id)  ──▶ VotingReconstructor (serialized per run)
//! resume(run_id)──▶ snapshot + log suffix ──▶ spawn RunLoop
//! ```
//!
//! At most one loop drives a run inside one engine. Every read goes through
//! the store, so `poll` sees exactly what a resumed process would see.

pub mod runner;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{EngineConfig, RunConfig};
use crate::debate::convergence::ConvergenceDetector;
use crate::debate::error::{DebateError, DebateResult};
use crate::debate::log::{EventLog, StatementEvent};
use crate::debate::scheduler::Scheduler;
use crate::debate::state::{RunPhase, RunState, TerminationReason};
use crate::debate::voting::{VoteTally, VotingReconstructor};
use crate::events::{DebateEvent, EventBus, SharedEventBus};
use crate::reasoning::Collaborators;
use crate::state::{RunId, RunRecord, SharedEventStore, StoreError};

pub use runner::{RunLoop, TurnOutcome};

/// What `poll` reports about a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStatus {
    pub run_id: RunId,
    pub iteration_count: u64,
    pub phase: RunPhase,
    pub finished: bool,
    pub termination_reason: Option<TerminationReason>,
    /// Newest committed events, oldest first.
    pub latest_events: Vec<StatementEvent>,
}

impl RunStatus {
    fn from_log(run_id: &str, state: RunState, log: &EventLog, latest: usize) -> Self {
        Self {
            run_id: run_id.to_string(),
            iteration_count: state.iteration_count,
            finished: state.is_finished(),
            phase: state.phase,
            termination_reason: state.termination_reason,
            latest_events: log.latest(latest).to_vec(),
        }
    }
}

struct ActiveRun {
    stop: CancellationToken,
    done: watch::Receiver<Option<RunPhase>>,
}

impl ActiveRun {
    fn is_live(&self) -> bool {
        self.done.borrow().is_none() && self.done.has_changed().is_ok()
    }
}

/// Claim on a run's slot in `runs`, taken before any loop exists.
struct Reservation {
    stop: CancellationToken,
    done: watch::Sender<Option<RunPhase>>,
}

type ActiveRuns = Arc<Mutex<HashMap<RunId, ActiveRun>>>;

pub struct DebateEngine {
    store: SharedEventStore,
    collaborators: Collaborators,
    config: EngineConfig,
    event_bus: SharedEventBus,
    voting: VotingReconstructor,
    runs: ActiveRuns,
    vote_locks: Mutex<HashMap<RunId, Arc<Mutex<()>>>>,
}

impl DebateEngine {
    pub fn new(store: SharedEventStore, collaborators: Collaborators, config: EngineConfig) -> Self {
        Self::with_event_bus(store, collaborators, config, EventBus::new().shared())
    }

    pub fn with_event_bus(
        store: SharedEventStore,
        collaborators: Collaborators,
        config: EngineConfig,
        event_bus: SharedEventBus,
    ) -> Self {
        let voting = VotingReconstructor::new(
            store.clone(),
            collaborators.votes.clone(),
            config.vote_retry.clone(),
        )
        .with_event_bus(event_bus.clone());
        Self {
            store,
            collaborators,
            config,
            event_bus,
            voting,
            runs: Arc::new(Mutex::new(HashMap::new())),
            vote_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &SharedEventStore {
        &self.store
    }

    pub fn event_bus(&self) -> &SharedEventBus {
        &self.event_bus
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DebateEvent> {
        self.event_bus.subscribe()
    }

    /// Create a run and start its loop. Returns as soon as the loop is spawned.
    pub async fn start(&self, mut config: RunConfig) -> DebateResult<RunId> {
        config.validate()?;
        let seed = *config.seed.get_or_insert_with(rand::random);

        let record = RunRecord::new(config);
        self.store.create_run(&record)?;
        let run_id = record.run_id.clone();

        let scheduler = Scheduler::new(&run_id, record.config.clone(), self.detector(&record.config))?;
        let reservation = self.reserve(&run_id).await?;

        info!(
            run_id = %run_id,
            topic = %record.config.topic,
            participants = record.config.participants.len(),
            seed,
            "Run started"
        );
        self.event_bus.publish(DebateEvent::RunStarted {
            run_id: run_id.clone(),
            topic: record.config.topic.clone(),
            participants: record.config.participants.iter().map(|p| p.name.clone()).collect(),
            seed,
            timestamp: Utc::now(),
        });

        self.launch(scheduler, 0, reservation);
        Ok(run_id)
    }

    /// Pick up an unfinished run from its stored log.
    ///
    /// A finished run is left alone. A failed run is refused: its failure
    /// marker is part of its derived state.
    pub async fn resume(&self, run_id: &str) -> DebateResult<()> {
        self.record(run_id)?;
        let reservation = self.reserve(run_id).await?;
        let (scheduler, from_snapshot) = match self.prepare_resume(run_id) {
            Ok(Some(prepared)) => prepared,
            Ok(None) => {
                self.release(run_id).await;
                return Ok(());
            }
            Err(e) => {
                self.release(run_id).await;
                return Err(e);
            }
        };

        info!(
            run_id,
            from_iteration = scheduler.next_iteration(),
            from_snapshot = from_snapshot.is_some(),
            "Run resumed"
        );
        self.event_bus.publish(DebateEvent::RunResumed {
            run_id: run_id.to_string(),
            from_iteration: scheduler.next_iteration(),
            from_snapshot: from_snapshot.is_some(),
            timestamp: Utc::now(),
        });

        self.launch(scheduler, from_snapshot.unwrap_or(0), reservation);
        Ok(())
    }

    /// Rebuild the scheduler of a reserved run, with the sequence of the
    /// snapshot it started from. `None` when the log is already finished.
    fn prepare_resume(&self, run_id: &str) -> DebateResult<Option<(Scheduler, Option<u64>)>> {
        // Read again under the reservation: a loop that just exited may
        // have marked the run failed.
        let record = self.record(run_id)?;
        if let Some(reason) = &record.failure {
            return Err(DebateError::RunFailed {
                run_id: run_id.to_string(),
                reason: reason.clone(),
            });
        }

        let log = EventLog::from_events(self.store.events(run_id)?)?;
        if log.is_finished() {
            info!(run_id, iterations = log.last_iteration(), "Run already finished, nothing to resume");
            return Ok(None);
        }

        let snapshot = match self.store.latest_snapshot(run_id) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(run_id, error = %e, "Snapshot unreadable, folding full log");
                None
            }
        };
        let detector = self.detector(&record.config);
        let scheduler = Scheduler::resume(run_id, record.config, detector, snapshot.as_ref(), log)?;
        Ok(Some((scheduler, snapshot.map(|s| s.sequence))))
    }

    /// Current derived state plus the newest events. Never blocks on a turn.
    pub async fn poll(&self, run_id: &str) -> DebateResult<RunStatus> {
        let record = self.record(run_id)?;
        let log = EventLog::from_events(self.store.events(run_id)?)?;
        let state = RunState::from_events_and_failure(&log, record.failure.as_deref());
        Ok(RunStatus::from_log(run_id, state, &log, self.config.latest_events))
    }

    /// Ask the run to stop. The turn in flight still commits, as the final one.
    ///
    /// Idempotent, and a no-op for runs that are not being driven here.
    pub async fn request_stop(&self, run_id: &str) -> DebateResult<()> {
        self.record(run_id)?;
        let runs = self.runs.lock().await;
        let Some(active) = runs.get(run_id) else {
            return Ok(());
        };
        if active.stop.is_cancelled() || !active.is_live() {
            return Ok(());
        }
        active.stop.cancel();
        info!(run_id, "Stop requested");
        self.event_bus.publish(DebateEvent::StopRequested {
            run_id: run_id.to_string(),
            timestamp: Utc::now(),
        });
        Ok(())
    }

    /// Votes of a finished run, computed once and stored.
    pub async fn vote(&self, run_id: &str) -> DebateResult<VoteTally> {
        self.record(run_id)?;
        let lock = {
            let mut locks = self.vote_locks.lock().await;
            locks.entry(run_id.to_string()).or_default().clone()
        };
        let result = {
            let _guard = lock.lock().await;
            self.voting.vote(run_id).await
        };

        let mut locks = self.vote_locks.lock().await;
        // Two holders left: the map and this call. Nobody else is queued.
        if Arc::strong_count(&lock) == 2
            && locks.get(run_id).is_some_and(|held| Arc::ptr_eq(held, &lock))
        {
            locks.remove(run_id);
        }
        result
    }

    /// Wait for the loop driving `run_id` (if any) to exit, then poll.
    pub async fn wait(&self, run_id: &str) -> DebateResult<RunStatus> {
        let done = {
            let runs = self.runs.lock().await;
            runs.get(run_id).map(|active| active.done.clone())
        };
        if let Some(mut done) = done {
            // A dropped sender means the task is gone; the store has the rest.
            let _ = done.wait_for(|phase| phase.is_some()).await;
        }
        self.poll(run_id).await
    }

    pub async fn is_active(&self, run_id: &str) -> bool {
        let runs = self.runs.lock().await;
        runs.get(run_id).is_some_and(ActiveRun::is_live)
    }

    fn record(&self, run_id: &str) -> DebateResult<RunRecord> {
        self.store.get_run(run_id).map_err(|e| match e {
            StoreError::NotFound(_) => DebateError::RunNotFound(run_id.to_string()),
            other => DebateError::Store(other),
        })
    }

    fn detector(&self, config: &RunConfig) -> ConvergenceDetector {
        ConvergenceDetector::new(
            config.convergence.clone(),
            self.collaborators.embedder.clone(),
            self.config.embedding_retry.clone(),
        )
    }

    /// Claim the run's slot, refusing if a live loop already holds it.
    ///
    /// Check and insert happen under one lock, so two callers can never
    /// both drive the same run.
    async fn reserve(&self, run_id: &str) -> DebateResult<Reservation> {
        let mut runs = self.runs.lock().await;
        if runs.get(run_id).is_some_and(ActiveRun::is_live) {
            return Err(DebateError::RunAlreadyActive(run_id.to_string()));
        }
        // A loop that panicked never cleans up after itself.
        runs.retain(|_, active| active.is_live());

        let stop = CancellationToken::new();
        let (tx, done) = watch::channel(None);
        runs.insert(
            run_id.to_string(),
            ActiveRun {
                stop: stop.clone(),
                done,
            },
        );
        Ok(Reservation { stop, done: tx })
    }

    /// Give up a reservation that never got a loop.
    async fn release(&self, run_id: &str) {
        self.runs.lock().await.remove(run_id);
    }

    fn launch(&self, scheduler: Scheduler, snapshot_sequence: u64, reservation: Reservation) {
        let run_id = scheduler.run_id().to_string();
        let Reservation { stop, done } = reservation;

        let run_loop = RunLoop::new(
            scheduler,
            self.store.clone(),
            self.collaborators.clone(),
            self.config.clone(),
            self.event_bus.clone(),
            stop,
        )
        .with_snapshot_sequence(snapshot_sequence);
        let runs = self.runs.clone();
        tokio::spawn(async move {
            let phase = run_loop.run().await;
            // Publish and unregister under the lock: the slot stays ours
            // until both are done.
            let mut runs = runs.lock().await;
            done.send_replace(Some(phase));
            runs.remove(&run_id);
            debug!(run_id = %run_id, phase = %phase, "Run loop exited");
        });
    }
}
