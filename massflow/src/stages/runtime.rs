//! Supervision loops that run stage functions forever.
//!
//! A replica calls its stage function in a loop. Failures go to the stage's
//! backup handler and the loop continues; the loop ends when the frame shuts
//! down or the replica's queues are gone.

use super::error_handler::StageErrorHandler;
use super::sockets::{AsyncSockets, SyncSockets};
use super::{AsyncStageFn, SyncStageFn};
use crate::cancellation::CancellationToken;
use crate::errors::StageResult;
use crate::observability::{InvocationStatus, SpanTimer, StageSpanAttributes};
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Name of the thread running every cooperative replica.
pub const COOPERATIVE_THREAD_NAME: &str = "frame-cooperative";

/// Why a supervision loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaExit {
    /// The frame is shutting down.
    Cancelled,
    /// The replica's queues closed while the frame was running.
    ChannelClosed,
}

/// Identity and shared state of one replica.
#[derive(Debug, Clone)]
pub struct ReplicaContext {
    stage: String,
    replica: usize,
    handler: Arc<dyn StageErrorHandler>,
    token: Arc<CancellationToken>,
}

impl ReplicaContext {
    /// Creates the context of replica `replica` of `stage`.
    #[must_use]
    pub fn new(
        stage: impl Into<String>,
        replica: usize,
        handler: Arc<dyn StageErrorHandler>,
        token: Arc<CancellationToken>,
    ) -> Self {
        Self {
            stage: stage.into(),
            replica,
            handler,
            token,
        }
    }

    /// The stage name.
    #[must_use]
    pub fn stage(&self) -> &str {
        &self.stage
    }

    /// The replica index.
    #[must_use]
    pub fn replica(&self) -> usize {
        self.replica
    }

    /// Handles the result of one invocation; `Some` ends the loop.
    fn after_invocation(&self, result: StageResult, timer: SpanTimer) -> Option<ReplicaExit> {
        let attrs = StageSpanAttributes::new(&self.stage)
            .with_replica(self.replica)
            .with_duration_ms(timer.finish());

        match result {
            Ok(()) => {
                attrs.with_status(InvocationStatus::Completed).emit();
                None
            }
            Err(failure) if failure.is_channel_closed() => {
                if self.token.is_cancelled() {
                    debug!(stage = %self.stage, replica = self.replica, "Replica stopped");
                    Some(ReplicaExit::Cancelled)
                } else {
                    warn!(
                        stage = %self.stage,
                        replica = self.replica,
                        error = %failure.message,
                        "Replica lost its queue"
                    );
                    Some(ReplicaExit::ChannelClosed)
                }
            }
            Err(failure) => {
                attrs
                    .with_status(InvocationStatus::Failed)
                    .with_error(failure.message.clone())
                    .emit();
                self.handler.handle(&self.stage, &failure);
                None
            }
        }
    }
}

/// Runs a process-mode stage function until the loop ends.
pub fn supervise_sync(
    ctx: &ReplicaContext,
    stage_fn: &SyncStageFn,
    sockets: &mut SyncSockets,
) -> ReplicaExit {
    info!(stage = %ctx.stage, replica = ctx.replica, "Replica started");
    loop {
        if ctx.token.is_cancelled() {
            return ReplicaExit::Cancelled;
        }
        let timer = SpanTimer::start(&ctx.stage);
        let result = stage_fn(sockets);
        if let Some(exit) = ctx.after_invocation(result, timer) {
            return exit;
        }
    }
}

/// Runs a cooperative stage function until the loop ends.
///
/// A pending invocation is dropped as soon as the token fires.
pub async fn supervise_async(
    ctx: ReplicaContext,
    stage_fn: AsyncStageFn,
    sockets: AsyncSockets,
) -> ReplicaExit {
    info!(stage = %ctx.stage, replica = ctx.replica, "Cooperative replica started");
    loop {
        if ctx.token.is_cancelled() {
            return ReplicaExit::Cancelled;
        }
        let timer = SpanTimer::start(&ctx.stage);
        let result = tokio::select! {
            biased;
            () = ctx.token.cancelled() => return ReplicaExit::Cancelled,
            result = stage_fn(sockets.clone()) => result,
        };
        if let Some(exit) = ctx.after_invocation(result, timer) {
            return exit;
        }
    }
}

/// Starts one process-mode replica on its own thread.
pub fn spawn_sync_replica(
    ctx: ReplicaContext,
    stage_fn: SyncStageFn,
    mut sockets: SyncSockets,
) -> std::io::Result<JoinHandle<ReplicaExit>> {
    std::thread::Builder::new()
        .name(format!("stage-{}-{}", ctx.stage, ctx.replica))
        .spawn(move || supervise_sync(&ctx, &stage_fn, &mut sockets))
}

/// One cooperative replica waiting to be started.
pub struct CooperativeReplica {
    /// Replica identity.
    pub ctx: ReplicaContext,
    /// The stage function.
    pub stage_fn: AsyncStageFn,
    /// The replica's sockets.
    pub sockets: AsyncSockets,
}

impl std::fmt::Debug for CooperativeReplica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CooperativeReplica")
            .field("stage", &self.ctx.stage)
            .field("replica", &self.ctx.replica)
            .finish_non_exhaustive()
    }
}

/// Starts every cooperative replica on one shared event loop thread.
///
/// The thread returns `Err` with a description when a replica panics or
/// loses its queue while the frame is running.
pub fn spawn_cooperative(
    replicas: Vec<CooperativeReplica>,
    token: Arc<CancellationToken>,
) -> std::io::Result<JoinHandle<Result<(), String>>> {
    std::thread::Builder::new()
        .name(COOPERATIVE_THREAD_NAME.to_string())
        .spawn(move || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(|e| format!("failed to build cooperative runtime: {e}"))?;
            let local = tokio::task::LocalSet::new();
            local.block_on(&runtime, run_cooperative(replicas, token))
        })
}

async fn run_cooperative(
    replicas: Vec<CooperativeReplica>,
    token: Arc<CancellationToken>,
) -> Result<(), String> {
    let mut tasks = JoinSet::new();
    for CooperativeReplica {
        ctx,
        stage_fn,
        sockets,
    } in replicas
    {
        let stage = ctx.stage.clone();
        let replica = ctx.replica;
        tasks.spawn_local(async move {
            let exit = AssertUnwindSafe(supervise_async(ctx, stage_fn, sockets))
                .catch_unwind()
                .await
                .map_err(|panic| panic_message(panic.as_ref()));
            (stage, replica, exit)
        });
    }

    while let Some(joined) = tasks.join_next().await {
        let (stage, replica, exit) = joined.map_err(|e| format!("cooperative task failed: {e}"))?;
        match exit {
            Ok(ReplicaExit::Cancelled) => {}
            Ok(ReplicaExit::ChannelClosed) if token.is_cancelled() => {}
            Ok(ReplicaExit::ChannelClosed) => {
                return Err(format!(
                    "replica {replica} of stage '{stage}' lost its queue"
                ));
            }
            Err(reason) => {
                return Err(format!(
                    "replica {replica} of stage '{stage}' panicked: {reason}"
                ));
            }
        }
    }
    Ok(())
}

/// Extracts the message of a panic payload.
#[must_use]
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{FailureKind, StageFailure};
    use crate::payload::StagePayload;
    use crate::stages::error_handler::CountingErrorHandler;
    use crate::stages::sockets::OutboundTable;
    use crate::stages::{async_stage, sync_stage};
    use crate::transport::channel;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn no_routes() -> Arc<OutboundTable> {
        Arc::new(OutboundTable::default())
    }

    #[test]
    fn test_failures_go_to_handler_and_loop_continues() {
        let (push, pull) = channel(8);
        let handler = Arc::new(CountingErrorHandler::new());
        let token = Arc::new(CancellationToken::new());
        let ctx = ReplicaContext::new("s", 0, handler.clone(), token.clone());

        for _ in 0..3 {
            push.send_blocking(crate::codec::encode(&StagePayload::generic()).unwrap())
                .unwrap();
        }

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let stage_fn = sync_stage(move |sockets| {
            sockets.receive()?;
            if counter.fetch_add(1, Ordering::SeqCst) == 1 {
                return Err(StageFailure::new("second call fails"));
            }
            Ok(())
        });

        let mut sockets = SyncSockets::new("s", None, no_routes(), pull);
        let worker = std::thread::spawn(move || supervise_sync(&ctx, &stage_fn, &mut sockets));

        while calls.load(Ordering::SeqCst) < 3 {
            std::thread::sleep(Duration::from_millis(5));
        }
        token.cancel("test done");
        drop(push);

        assert_eq!(worker.join().unwrap(), ReplicaExit::Cancelled);
        assert_eq!(handler.count_for("s"), 1);
    }

    #[test]
    fn test_closed_queue_without_shutdown_ends_loop() {
        let (_push, pull) = channel(1);
        let handler = Arc::new(CountingErrorHandler::new());
        let ctx = ReplicaContext::new("s", 0, handler.clone(), Arc::new(CancellationToken::new()));
        let stage_fn =
            sync_stage(|_| Err(StageFailure::with_kind(FailureKind::ChannelClosed, "gone")));

        let mut sockets = SyncSockets::new("s", None, no_routes(), pull);
        assert_eq!(
            supervise_sync(&ctx, &stage_fn, &mut sockets),
            ReplicaExit::ChannelClosed
        );
        assert_eq!(handler.count(), 0);
    }

    #[tokio::test]
    async fn test_async_loop_stops_on_cancel() {
        let (_push, pull) = channel(1);
        let token = Arc::new(CancellationToken::new());
        let ctx = ReplicaContext::new("s", 0, Arc::new(CountingErrorHandler::new()), token.clone());
        let stage_fn = async_stage(|sockets: AsyncSockets| async move {
            sockets.receive().await?;
            StageResult::Ok(())
        });
        let sockets = AsyncSockets::new("s", None, no_routes(), pull);

        let local = tokio::task::LocalSet::new();
        let exit = local
            .run_until(async move {
                let handle = tokio::task::spawn_local(supervise_async(ctx, stage_fn, sockets));
                tokio::task::yield_now().await;
                token.cancel("test done");
                handle.await.unwrap()
            })
            .await;
        assert_eq!(exit, ReplicaExit::Cancelled);
    }

    #[test]
    fn test_cooperative_panic_is_reported() {
        let (_push, pull) = channel(1);
        let token = Arc::new(CancellationToken::new());
        let ctx = ReplicaContext::new("s", 1, Arc::new(CountingErrorHandler::new()), token.clone());
        let stage_fn = async_stage(|_sockets: AsyncSockets| async move {
            let message = "cooperative boom";
            if !message.is_empty() {
                panic!("{message}");
            }
            StageResult::Ok(())
        });

        let handle = spawn_cooperative(
            vec![CooperativeReplica {
                ctx,
                stage_fn,
                sockets: AsyncSockets::new("s", None, no_routes(), pull),
            }],
            token,
        )
        .unwrap();

        let reason = handle.join().unwrap().unwrap_err();
        assert!(reason.contains("stage 's'"));
        assert!(reason.contains("cooperative boom"));
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("static message");
        assert_eq!(panic_message(payload.as_ref()), "static message");

        let payload: Box<dyn Any + Send> = Box::new(String::from("owned message"));
        assert_eq!(panic_message(payload.as_ref()), "owned message");

        let payload: Box<dyn Any + Send> = Box::new(42);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic");
    }
}
