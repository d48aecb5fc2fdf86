//! Statement events and the append-only, iteration-ordered event log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::{DebateError, DebateResult};
use super::state::TerminationReason;

/// One committed turn. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatementEvent {
    /// 1-based, gapless, strictly increasing.
    pub iteration: u64,
    /// Name of the participant who spoke.
    pub speaker: String,
    /// The statement text.
    pub content: String,
    /// Participants that raised a hand after hearing this statement,
    /// in configured-index order.
    #[serde(default)]
    pub engaged_with: Vec<String>,
    /// True only on the event that ends the run.
    #[serde(default)]
    pub is_final: bool,
    /// Present iff `is_final`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub termination_reason: Option<TerminationReason>,
    /// Wall-clock commit time. Informational only.
    pub recorded_at: DateTime<Utc>,
}

impl StatementEvent {
    pub fn new(iteration: u64, speaker: &str, content: &str, engaged_with: Vec<String>) -> Self {
        Self {
            iteration,
            speaker: speaker.to_string(),
            content: content.to_string(),
            engaged_with,
            is_final: false,
            termination_reason: None,
            recorded_at: Utc::now(),
        }
    }

    /// Mark this event as the one ending the run.
    pub fn finalize(mut self, reason: TerminationReason) -> Self {
        self.is_final = true;
        self.termination_reason = Some(reason);
        self
    }

    /// Check the final marker invariant.
    pub fn validate(&self) -> DebateResult<()> {
        if self.iteration == 0 {
            return Err(DebateError::invalid_event(0, "iterations start at 1"));
        }
        match (&self.termination_reason, self.is_final) {
            (Some(reason), true) if reason.is_event_reason() => Ok(()),
            (Some(reason), true) => Err(DebateError::invalid_event(
                self.iteration,
                format!("{} cannot end a run through a statement", reason),
            )),
            (None, false) => Ok(()),
            (Some(_), false) => Err(DebateError::invalid_event(
                self.iteration,
                "termination reason on a non-final event",
            )),
            (None, true) => Err(DebateError::invalid_event(
                self.iteration,
                "final event without termination reason",
            )),
        }
    }
}

/// Append-only log of one run's statement events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventLog {
    events: Vec<StatementEvent>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a log from stored events, re-checking every append invariant.
    pub fn from_events(events: Vec<StatementEvent>) -> DebateResult<Self> {
        let mut log = Self {
            events: Vec::with_capacity(events.len()),
        };
        for event in events {
            log.append(event)?;
        }
        Ok(log)
    }

    /// Append the next event.
    ///
    /// Fails with `OutOfOrder` unless `event.iteration == last_iteration() + 1`,
    /// and with `InvalidEvent` once a final event has been appended.
    pub fn append(&mut self, event: StatementEvent) -> DebateResult<()> {
        let expected = self.last_iteration() + 1;
        if event.iteration != expected {
            return Err(DebateError::OutOfOrder {
                expected,
                found: event.iteration,
            });
        }
        if self.is_finished() {
            return Err(DebateError::invalid_event(
                event.iteration,
                "log already holds a final event",
            ));
        }
        event.validate()?;
        self.events.push(event);
        Ok(())
    }

    /// Events with `iteration <= up_to`, lazily.
    pub fn prefix(&self, up_to: u64) -> impl Iterator<Item = &StatementEvent> + '_ {
        self.events.iter().take_while(move |e| e.iteration <= up_to)
    }

    /// Events with `iteration > after`, lazily.
    pub fn suffix(&self, after: u64) -> impl Iterator<Item = &StatementEvent> + '_ {
        self.events.iter().skip_while(move |e| e.iteration <= after)
    }

    /// The most recent `n` events, oldest first.
    pub fn latest(&self, n: usize) -> &[StatementEvent] {
        let start = self.events.len().saturating_sub(n);
        &self.events[start..]
    }

    pub fn last(&self) -> Option<&StatementEvent> {
        self.events.last()
    }

    /// Iteration of the newest event, 0 when empty.
    pub fn last_iteration(&self) -> u64 {
        self.events.last().map(|e| e.iteration).unwrap_or(0)
    }

    /// True once an event with `is_final = true` exists.
    pub fn is_finished(&self) -> bool {
        self.events.last().map(|e| e.is_final).unwrap_or(false)
    }

    pub fn events(&self) -> &[StatementEvent] {
        &self.events
    }

    pub fn iter(&self) -> std::slice::Iter<'_, StatementEvent> {
        self.events.iter()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

impl<'a> IntoIterator for &'a EventLog {
    type Item = &'a StatementEvent;
    type IntoIter = std::slice::Iter<'a, StatementEvent>;

    fn into_iter(self) -> Self::IntoIter {
        self.events.iter()
    }
}
