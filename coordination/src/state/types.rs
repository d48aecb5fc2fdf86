//! Persistent record types for debate runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::RunConfig;

/// Unique identifier for a debate run
pub type RunId = String;

/// Durable header of a run: configuration plus the failure marker.
///
/// The phase and termination reason are not stored here; they are derived
/// from the event log and `failure`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: RunId,
    /// Static configuration, including the seed assigned at start.
    pub config: RunConfig,
    pub created_at: DateTime<Utc>,
    /// Last error of a run that ended without a final event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
}

impl RunRecord {
    /// New record with a fresh v4 id.
    pub fn new(config: RunConfig) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), config)
    }

    pub fn with_id(run_id: impl Into<RunId>, config: RunConfig) -> Self {
        Self {
            run_id: run_id.into(),
            config,
            created_at: Utc::now(),
            failure: None,
            failed_at: None,
        }
    }

    pub fn is_failed(&self) -> bool {
        self.failure.is_some()
    }

    /// Mark failed. Returns false if a failure was already recorded.
    pub fn mark_failed(&mut self, reason: &str) -> bool {
        if self.failure.is_some() {
            return false;
        }
        self.failure = Some(reason.to_string());
        self.failed_at = Some(Utc::now());
        true
    }
}
