//! Timing of stage invocations.

use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Outcome of one stage invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationStatus {
    /// The stage function returned `Ok`.
    Completed,
    /// The stage function returned a failure.
    Failed,
}

impl std::fmt::Display for InvocationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Attributes recorded for one stage invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageSpanAttributes {
    /// Stage name.
    pub stage_name: String,
    /// Replica index.
    pub replica: Option<usize>,
    /// Invocation outcome.
    pub status: Option<InvocationStatus>,
    /// Duration in milliseconds.
    pub duration_ms: Option<f64>,
    /// Failure message.
    pub error: Option<String>,
}

impl StageSpanAttributes {
    /// Creates attributes for a stage.
    #[must_use]
    pub fn new(stage_name: impl Into<String>) -> Self {
        Self {
            stage_name: stage_name.into(),
            ..Default::default()
        }
    }

    /// Sets the replica index.
    #[must_use]
    pub fn with_replica(mut self, replica: usize) -> Self {
        self.replica = Some(replica);
        self
    }

    /// Sets the outcome.
    #[must_use]
    pub fn with_status(mut self, status: InvocationStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Sets the duration.
    #[must_use]
    pub fn with_duration_ms(mut self, duration_ms: f64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    /// Sets the failure message.
    #[must_use]
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Emits the attributes as a debug event.
    pub fn emit(&self) {
        tracing::debug!(
            stage = %self.stage_name,
            replica = ?self.replica,
            status = ?self.status,
            duration_ms = ?self.duration_ms,
            error = ?self.error,
            "Stage invocation finished"
        );
    }
}

/// Simple span timing helper.
#[derive(Debug)]
pub struct SpanTimer {
    start: Instant,
    name: String,
}

impl SpanTimer {
    /// Starts a new span timer.
    #[must_use]
    pub fn start(name: impl Into<String>) -> Self {
        Self {
            start: Instant::now(),
            name: name.into(),
        }
    }

    /// Returns the elapsed time in milliseconds.
    #[must_use]
    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }

    /// Returns the span name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Finishes the span and returns the duration.
    #[must_use]
    pub fn finish(self) -> f64 {
        self.elapsed_ms()
    }
}
