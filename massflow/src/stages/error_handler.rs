//! Backup error handlers and failure forwarding.
//!
//! A backup handler sees every failure a stage function returns. It is for
//! observability only; the payload being processed is gone by then. Stages
//! that want failed payloads reported forward them before returning, using
//! [`forward_failure_blocking`] or [`forward_failure`].

use super::sockets::{AsyncSockets, SyncSockets};
use crate::errors::{SocketError, StageFailure};
use crate::payload::StagePayload;
use std::collections::HashMap;
use std::fmt::{Debug, Display};
use std::sync::atomic::{AtomicUsize, Ordering};
use parking_lot::RwLock;
use tracing::error;

/// Name of the stage failed payloads are forwarded to.
pub const DEFAULT_REPORT_STAGE: &str = "report";

/// Receives every failure returned by a stage function.
pub trait StageErrorHandler: Send + Sync + Debug {
    /// Handles one failure of `stage`.
    fn handle(&self, stage: &str, failure: &StageFailure);
}

/// Logs failures with `tracing`. The default handler.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingErrorHandler;

impl StageErrorHandler for LoggingErrorHandler {
    fn handle(&self, stage: &str, failure: &StageFailure) {
        error!(
            stage,
            kind = %failure.kind,
            error = %failure.message,
            context = ?failure.context,
            "Stage invocation failed"
        );
    }
}

/// Counts failures per stage.
#[derive(Debug, Default)]
pub struct CountingErrorHandler {
    total: AtomicUsize,
    per_stage: RwLock<HashMap<String, usize>>,
    last: RwLock<Option<StageFailure>>,
}

impl CountingErrorHandler {
    /// Creates a handler with all counters at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of handled failures.
    #[must_use]
    pub fn count(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }

    /// Number of handled failures of one stage.
    #[must_use]
    pub fn count_for(&self, stage: &str) -> usize {
        self.per_stage.read().get(stage).copied().unwrap_or(0)
    }

    /// The most recent failure.
    #[must_use]
    pub fn last_failure(&self) -> Option<StageFailure> {
        self.last.read().clone()
    }
}

impl StageErrorHandler for CountingErrorHandler {
    fn handle(&self, stage: &str, failure: &StageFailure) {
        *self.per_stage.write().entry(stage.to_string()).or_insert(0) += 1;
        *self.last.write() = Some(failure.clone());
        self.total.fetch_add(1, Ordering::SeqCst);
    }
}

/// Marks `payload` failed with `error` and sends it to the report stage.
///
/// The default [`report`](crate::stages::defaults::report) stage only
/// accepts request payloads and rejects anything else as a new failure.
/// Forward other payload kinds only when the stage named
/// [`DEFAULT_REPORT_STAGE`] handles them.
pub fn forward_failure_blocking(
    sockets: &SyncSockets,
    mut payload: StagePayload,
    error: &dyn Display,
) -> Result<(), SocketError> {
    payload.envelope_mut().mark_failed(error.to_string());
    sockets.send_to(payload, DEFAULT_REPORT_STAGE)
}

/// Async variant of [`forward_failure_blocking`].
pub async fn forward_failure(
    sockets: &AsyncSockets,
    mut payload: StagePayload,
    error: &dyn Display,
) -> Result<(), SocketError> {
    payload.envelope_mut().mark_failed(error.to_string());
    sockets.send_to(payload, DEFAULT_REPORT_STAGE).await
}
