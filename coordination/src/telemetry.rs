//! Tracing setup and span helpers for debate runs.
//!
//! # Span Hierarchy
//!
//! ```text
//! debate.run          (one per RunLoop, started or resumed)
//!   └─ debate.turn    (select → generate → engage → commit)
//! debate.vote         (one per reconstruction)
//! ```
//!
//! Field names use dot notation so they export cleanly to OpenTelemetry
//! collectors.

use tracing::Span;
use tracing_subscriber::EnvFilter;

pub const SPAN_RUN: &str = "debate.run";
pub const SPAN_TURN: &str = "debate.turn";
pub const SPAN_VOTE: &str = "debate.vote";

pub const FIELD_RUN_ID: &str = "debate.run_id";
pub const FIELD_ITERATION: &str = "debate.iteration";
pub const FIELD_SPEAKER: &str = "debate.speaker";
pub const FIELD_FINAL: &str = "debate.final";
pub const FIELD_OUTCOME: &str = "debate.outcome";

/// Install a stderr `fmt` subscriber filtered by `RUST_LOG` (default `info`).
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Root span of a run loop.
pub fn run_span(run_id: &str, seed: u64) -> Span {
    tracing::info_span!(
        "debate.run",
        "debate.run_id" = %run_id,
        "debate.seed" = seed,
        "debate.outcome" = tracing::field::Empty,
    )
}

pub fn record_outcome(span: &Span, outcome: &str) {
    span.record(FIELD_OUTCOME, outcome);
}

/// Span of one turn. Speaker and finality are filled once known.
pub fn turn_span(run_id: &str, iteration: u64) -> Span {
    tracing::info_span!(
        "debate.turn",
        "debate.run_id" = %run_id,
        "debate.iteration" = iteration,
        "debate.speaker" = tracing::field::Empty,
        "debate.final" = tracing::field::Empty,
    )
}

pub fn record_turn(span: &Span, speaker: &str, is_final: bool) {
    span.record(FIELD_SPEAKER, speaker);
    span.record(FIELD_FINAL, is_final);
}

pub fn vote_span(run_id: &str) -> Span {
    tracing::info_span!(
        "debate.vote",
        "debate.run_id" = %run_id,
        "debate.outcome" = tracing::field::Empty,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Once;

    static INIT: Once = Once::new();

    fn init_test_subscriber() {
        INIT.call_once(|| {
            let _ = tracing_subscriber::fmt()
                .with_test_writer()
                .with_max_level(tracing::Level::TRACE)
                .try_init();
        });
    }

    #[test]
    fn test_spans_enabled_and_recordable() {
        init_test_subscriber();
        let run = run_span("r1", 7);
        assert!(!run.is_disabled());
        record_outcome(&run, "finished");

        let turn = turn_span("r1", 3);
        assert!(!turn.is_disabled());
        record_turn(&turn, "Ana", true);

        assert!(!vote_span("r1").is_disabled());
    }

    #[test]
    fn test_init_tracing_is_idempotent() {
        init_tracing();
        init_tracing();
    }
}
