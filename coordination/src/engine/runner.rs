//! Background loop that drives one run, one turn at a time.
//!
//! ```text
//! RunLoop::run
//!   → loop:
//!       step()                 select → generate (retried) → engage → commit
//!         Continue             → next turn
//!         Finished(reason)     → publish RunFinished, exit
//!         Failed(error)        → record_failure, publish RunFailed, exit
//! ```
//!
//! Exactly one statement is in flight at a time. The stop token is read only
//! when a turn commits, so a stop never interrupts a turn halfway.

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument, Span};

use crate::config::EngineConfig;
use crate::debate::error::DebateError;
use crate::debate::scheduler::Scheduler;
use crate::debate::state::{RunPhase, TerminationReason};
use crate::events::{DebateEvent, SharedEventBus};
use crate::reasoning::Collaborators;
use crate::resilience::retry_with_backoff;
use crate::state::SharedEventStore;
use crate::telemetry;

/// Result of one turn.
#[derive(Debug)]
pub enum TurnOutcome {
    Continue,
    Finished(TerminationReason),
    Failed(String),
}

pub struct RunLoop {
    scheduler: Scheduler,
    store: SharedEventStore,
    collaborators: Collaborators,
    config: EngineConfig,
    event_bus: SharedEventBus,
    stop: CancellationToken,
    snapshots: u64,
}

impl RunLoop {
    pub fn new(
        scheduler: Scheduler,
        store: SharedEventStore,
        collaborators: Collaborators,
        config: EngineConfig,
        event_bus: SharedEventBus,
        stop: CancellationToken,
    ) -> Self {
        Self {
            scheduler,
            store,
            collaborators,
            config,
            event_bus,
            stop,
            snapshots: 0,
        }
    }

    /// Continue snapshot numbering after `sequence`, the newest stored one.
    pub fn with_snapshot_sequence(mut self, sequence: u64) -> Self {
        self.snapshots = sequence;
        self
    }

    fn run_id(&self) -> String {
        self.scheduler.run_id().to_string()
    }

    /// Drive the run to a terminal phase.
    pub async fn run(self) -> RunPhase {
        let span = telemetry::run_span(self.scheduler.run_id(), self.scheduler.seed());
        let phase = self.drive().instrument(span.clone()).await;
        telemetry::record_outcome(&span, &phase.to_string());
        phase
    }

    async fn drive(mut self) -> RunPhase {
        let run_id = self.run_id();
        info!(run_id = %run_id, from = self.scheduler.next_iteration(), "Run loop started");

        if self.scheduler.is_finished() {
            return RunPhase::Finished;
        }

        loop {
            let span = telemetry::turn_span(&run_id, self.scheduler.next_iteration());
            match self.step().instrument(span).await {
                TurnOutcome::Continue => continue,
                TurnOutcome::Finished(reason) => {
                    let iterations = self.scheduler.log().last_iteration();
                    info!(run_id = %run_id, iterations, reason = %reason, "Run finished");
                    self.event_bus.publish(DebateEvent::RunFinished {
                        run_id,
                        iterations,
                        reason,
                        timestamp: Utc::now(),
                    });
                    return RunPhase::Finished;
                }
                TurnOutcome::Failed(message) => {
                    self.fail(&message);
                    return RunPhase::Failed;
                }
            }
        }
    }

    /// One full turn.
    pub async fn step(&mut self) -> TurnOutcome {
        let run_id = self.run_id();

        let selection = match self.scheduler.select_speaker() {
            Ok(selection) => selection,
            Err(e) => return TurnOutcome::Failed(e.to_string()),
        };
        self.event_bus.publish(DebateEvent::SpeakerSelected {
            run_id: run_id.clone(),
            iteration: selection.iteration,
            speaker: selection.speaker.clone(),
            fallback: selection.fallback,
            timestamp: Utc::now(),
        });

        let request = self.scheduler.statement_request(&selection);
        let statements = self.collaborators.statements.clone();
        let label = format!("statement@{}", selection.iteration);
        let content = match retry_with_backoff(&self.config.turn_retry, &label, |_| {
            statements.generate_statement(request.clone())
        })
        .await
        {
            Ok(content) => content,
            Err(e) => {
                return TurnOutcome::Failed(
                    DebateError::GenerationTransient {
                        attempts: e.attempts,
                        last_error: e.last_error.to_string(),
                    }
                    .to_string(),
                )
            }
        };

        let engaged = self
            .scheduler
            .poll_engagement(&*self.collaborators.engagement, &selection, &content)
            .await;

        let stop = self.stop.is_cancelled();
        let event = match self.scheduler.commit(&selection, content, engaged, stop).await {
            Ok(event) => event,
            Err(e) => return TurnOutcome::Failed(e.to_string()),
        };

        if let Err(e) = self.store.append_event(&run_id, &event) {
            return TurnOutcome::Failed(DebateError::from(e).to_string());
        }
        debug!(
            run_id = %run_id,
            iteration = event.iteration,
            speaker = %event.speaker,
            engaged = event.engaged_with.len(),
            "Statement committed"
        );

        telemetry::record_turn(&Span::current(), &event.speaker, event.is_final);
        self.maybe_snapshot(event.iteration, event.is_final);

        self.event_bus.publish(DebateEvent::StatementCommitted {
            run_id,
            iteration: event.iteration,
            speaker: event.speaker.clone(),
            engaged_with: event.engaged_with.clone(),
            is_final: event.is_final,
            timestamp: Utc::now(),
        });

        match event.termination_reason {
            Some(reason) if event.is_final => TurnOutcome::Finished(reason),
            _ => TurnOutcome::Continue,
        }
    }

    fn maybe_snapshot(&mut self, iteration: u64, is_final: bool) {
        let interval = self.config.snapshot_interval;
        if interval == 0 || (iteration % interval != 0 && !is_final) {
            return;
        }
        self.snapshots += 1;
        let snapshot = self.scheduler.snapshot(self.snapshots);
        // The log stays authoritative; a missing snapshot only costs a longer fold.
        if let Err(e) = self.store.put_snapshot(self.scheduler.run_id(), &snapshot) {
            warn!(run_id = %self.scheduler.run_id(), iteration, error = %e, "Snapshot failed");
        }
    }

    fn fail(&mut self, message: &str) {
        let run_id = self.run_id();
        let iteration = self.scheduler.log().last_iteration();
        error!(run_id = %run_id, iteration, error = %message, "Run failed");

        if let Err(e) = self.scheduler.fail(message) {
            warn!(run_id = %run_id, error = %e, "Run state transition rejected");
        }
        if let Err(e) = self.store.record_failure(&run_id, message) {
            error!(run_id = %run_id, error = %e, "Failed to record run failure");
        }
        self.event_bus.publish(DebateEvent::RunFailed {
            run_id,
            iteration,
            error: message.to_string(),
            timestamp: Utc::now(),
        });
    }
}
