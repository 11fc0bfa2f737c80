//! Stage functions, their sockets and the loops that run them.
//!
//! A stage is a named function that the frame calls forever. Process-mode
//! stages get blocking [`SyncSockets`] and run on their own threads;
//! cooperative stages get [`AsyncSockets`] and share one event loop.

pub mod defaults;
mod error_handler;
#[cfg(feature = "http")]
mod fetch;
mod runtime;
mod sockets;

use crate::errors::StageResult;
use futures::future::LocalBoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;

pub use error_handler::{
    forward_failure, forward_failure_blocking, CountingErrorHandler, LoggingErrorHandler,
    StageErrorHandler, DEFAULT_REPORT_STAGE,
};
pub use runtime::{
    panic_message, spawn_cooperative, spawn_sync_replica, supervise_async, supervise_sync,
    CooperativeReplica, ReplicaContext, ReplicaExit, COOPERATIVE_THREAD_NAME,
};
pub use sockets::{AsyncSockets, OutboundTable, SyncSockets};

/// A process-mode stage function.
pub type SyncStageFn = Arc<dyn Fn(&mut SyncSockets) -> StageResult + Send + Sync>;

/// A cooperative stage function.
pub type AsyncStageFn =
    Arc<dyn Fn(AsyncSockets) -> LocalBoxFuture<'static, StageResult> + Send + Sync>;

/// How the replicas of a stage are run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Concurrency {
    /// One OS thread per replica with blocking sockets.
    #[default]
    Process,
    /// One task per replica on the frame's shared event loop.
    Cooperative,
}

impl std::fmt::Display for Concurrency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Process => write!(f, "process"),
            Self::Cooperative => write!(f, "cooperative"),
        }
    }
}

/// A stage function of either concurrency mode.
#[derive(Clone)]
pub enum StageFn {
    /// Runs with [`SyncSockets`].
    Sync(SyncStageFn),
    /// Runs with [`AsyncSockets`].
    Async(AsyncStageFn),
}

impl StageFn {
    /// The concurrency mode this function needs.
    #[must_use]
    pub fn concurrency(&self) -> Concurrency {
        match self {
            Self::Sync(_) => Concurrency::Process,
            Self::Async(_) => Concurrency::Cooperative,
        }
    }
}

impl std::fmt::Debug for StageFn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("StageFn").field(&self.concurrency()).finish()
    }
}

impl From<SyncStageFn> for StageFn {
    fn from(f: SyncStageFn) -> Self {
        Self::Sync(f)
    }
}

impl From<AsyncStageFn> for StageFn {
    fn from(f: AsyncStageFn) -> Self {
        Self::Async(f)
    }
}

/// Wraps a closure as a process-mode stage function.
pub fn sync_stage<F>(f: F) -> SyncStageFn
where
    F: Fn(&mut SyncSockets) -> StageResult + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Wraps an async closure as a cooperative stage function.
///
/// The returned future only has to be `'static`; it never leaves the
/// cooperative thread.
pub fn async_stage<F, Fut>(f: F) -> AsyncStageFn
where
    F: Fn(AsyncSockets) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = StageResult> + 'static,
{
    Arc::new(move |sockets| f(sockets).boxed_local())
}
