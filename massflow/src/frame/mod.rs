//! The analysis frame: registers stages, wires their queues and runs them.
//!
//! ```rust,ignore
//! use massflow::prelude::*;
//!
//! let mut frame = AnalysisFrame::new(FrameConfig::default())?;
//! frame
//!     .add_sync_stage("requests", StageOptions::new().with_next_stage("report"), get_requests(source))?
//!     .add_sync_stage("report", StageOptions::new().with_replicas(2), report(sink))?;
//! frame.start_all_stages()?;
//! ```

mod config;


pub use config::{
    FrameConfig, ENV_IPC_ROOT, ENV_POLL_INTERVAL_MS, ENV_QUEUE_SIZE, ENV_SHUTDOWN_TIMEOUT_MS,
};

use crate::cancellation::CancellationToken;
use crate::errors::{FrameError, StageResult};
use crate::stages::{
    async_stage, panic_message, spawn_cooperative, spawn_sync_replica, sync_stage,
    AsyncSockets, Concurrency, CooperativeReplica, LoggingErrorHandler, OutboundTable,
    ReplicaContext, ReplicaExit, StageErrorHandler, StageFn, SyncSockets,
};
use crate::transport::{AddressAllocator, ChannelPair, ChannelRegistry, Relay, RelayStats};
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, LazyLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

static STAGE_NAME: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.\-]*$"));

const JOIN_POLL: Duration = Duration::from_millis(10);

/// Per-stage registration options.
///
/// Every replica is a thread of the frame's process. A replica that panics
/// is reported by [`RunningFrame::wait`], but a stage calling
/// [`std::process::exit`] ends the whole process with the status it passes.
#[derive(Debug, Clone)]
pub struct StageOptions {
    /// Number of replicas competing for the stage's queue.
    pub replicas: usize,
    /// Default target of `send`.
    pub next_stage: Option<String>,
    /// Frontend queue capacity; the frame default when `None`.
    pub queue_size: Option<usize>,
    /// Backup handler for failures; logs them when `None`.
    pub error_handler: Option<Arc<dyn StageErrorHandler>>,
}

impl Default for StageOptions {
    fn default() -> Self {
        Self {
            replicas: 1,
            next_stage: None,
            queue_size: None,
            error_handler: None,
        }
    }
}

impl StageOptions {
    /// One replica, no next stage, default queue and handler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the replica count.
    #[must_use]
    pub fn with_replicas(mut self, replicas: usize) -> Self {
        self.replicas = replicas;
        self
    }

    /// Sets the default next stage.
    #[must_use]
    pub fn with_next_stage(mut self, stage: impl Into<String>) -> Self {
        self.next_stage = Some(stage.into());
        self
    }

    /// Sets the frontend queue capacity.
    #[must_use]
    pub fn with_queue_size(mut self, size: usize) -> Self {
        self.queue_size = Some(size);
        self
    }

    /// Sets the backup error handler.
    #[must_use]
    pub fn with_error_handler(mut self, handler: Arc<dyn StageErrorHandler>) -> Self {
        self.error_handler = Some(handler);
        self
    }
}

/// A registered stage.
#[derive(Debug)]
pub struct StageDefinition {
    name: String,
    replicas: usize,
    next_stage: Option<String>,
    queue_size: usize,
    pair: ChannelPair,
    error_handler: Arc<dyn StageErrorHandler>,
    stage_fn: StageFn,
}

impl StageDefinition {
    /// The stage name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of replicas.
    #[must_use]
    pub fn replicas(&self) -> usize {
        self.replicas
    }

    /// How the replicas run.
    #[must_use]
    pub fn concurrency(&self) -> Concurrency {
        self.stage_fn.concurrency()
    }

    /// The default next stage.
    #[must_use]
    pub fn next_stage(&self) -> Option<&str> {
        self.next_stage.as_deref()
    }

    /// Frontend queue capacity.
    #[must_use]
    pub fn queue_size(&self) -> usize {
        self.queue_size
    }

    /// The stage's channel addresses.
    #[must_use]
    pub fn pair(&self) -> &ChannelPair {
        &self.pair
    }
}

/// A frame that is still being assembled.
#[derive(Debug)]
pub struct AnalysisFrame {
    id: Uuid,
    config: FrameConfig,
    allocator: AddressAllocator,
    registry: ChannelRegistry,
    relays: Vec<Relay>,
    stages: Vec<StageDefinition>,
}

impl AnalysisFrame {
    /// Creates an empty frame with a fresh address namespace.
    pub fn new(config: FrameConfig) -> Result<Self, FrameError> {
        config.validate()?;
        let allocator = AddressAllocator::new(&config.ipc_root);
        let id = Uuid::now_v7();
        debug!(frame = %id, namespace = allocator.namespace(), "Frame created");
        Ok(Self {
            id,
            config,
            allocator,
            registry: ChannelRegistry::new(),
            relays: Vec::new(),
            stages: Vec::new(),
        })
    }

    /// Identifies the frame in logs.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The frame configuration.
    #[must_use]
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }

    /// The random namespace of this frame's addresses.
    #[must_use]
    pub fn namespace(&self) -> &str {
        self.allocator.namespace()
    }

    /// Registered stages in registration order.
    #[must_use]
    pub fn stages(&self) -> &[StageDefinition] {
        &self.stages
    }

    /// Looks up a registered stage.
    #[must_use]
    pub fn stage(&self, name: &str) -> Option<&StageDefinition> {
        self.stages.iter().find(|stage| stage.name == name)
    }

    /// Registers a stage and binds its relay.
    pub fn add_stage(
        &mut self,
        name: impl Into<String>,
        options: StageOptions,
        stage_fn: impl Into<StageFn>,
    ) -> Result<&mut Self, FrameError> {
        let name = name.into();
        let stage_fn = stage_fn.into();
        validate_name(&name)?;
        if self.stage(&name).is_some() {
            return Err(FrameError::DuplicateStage(name));
        }
        if options.replicas == 0 {
            return Err(FrameError::InvalidStage {
                stage: name,
                reason: "replicas must be at least 1".to_string(),
            });
        }
        let queue_size = options.queue_size.unwrap_or(self.config.default_queue_size);
        if queue_size == 0 {
            return Err(FrameError::InvalidStage {
                stage: name,
                reason: "queue_size must be at least 1".to_string(),
            });
        }

        let pair = self.allocator.allocate_pair();
        let relay = Relay::bind(name.clone(), pair.clone(), queue_size, &self.registry)?;
        debug!(
            stage = %name,
            concurrency = %stage_fn.concurrency(),
            replicas = options.replicas,
            frontend = %pair.frontend,
            backend = %pair.backend,
            "Stage registered"
        );

        self.relays.push(relay);
        self.stages.push(StageDefinition {
            name,
            replicas: options.replicas,
            next_stage: options.next_stage,
            queue_size,
            pair,
            error_handler: options
                .error_handler
                .unwrap_or_else(|| Arc::new(LoggingErrorHandler)),
            stage_fn,
        });
        Ok(self)
    }

    /// Registers a process-mode stage.
    ///
    /// Each replica runs `f` on its own thread. Stage functions should fail
    /// by returning `Err` or panicking; `std::process::exit` bypasses the
    /// frame and exits with the given status, `0` included.
    pub fn add_sync_stage<F>(
        &mut self,
        name: impl Into<String>,
        options: StageOptions,
        f: F,
    ) -> Result<&mut Self, FrameError>
    where
        F: Fn(&mut SyncSockets) -> StageResult + Send + Sync + 'static,
    {
        self.add_stage(name, options, StageFn::Sync(sync_stage(f)))
    }

    /// Registers a cooperative stage.
    pub fn add_async_stage<F, Fut>(
        &mut self,
        name: impl Into<String>,
        options: StageOptions,
        f: F,
    ) -> Result<&mut Self, FrameError>
    where
        F: Fn(AsyncSockets) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = StageResult> + 'static,
    {
        self.add_stage(name, options, StageFn::Async(async_stage(f)))
    }

    fn validate_routes(&self) -> Result<(), FrameError> {
        if self.stages.is_empty() {
            return Err(FrameError::Empty);
        }
        let names: HashSet<&str> = self.stages.iter().map(|s| s.name.as_str()).collect();
        for stage in &self.stages {
            if let Some(next) = stage.next_stage.as_deref() {
                if !names.contains(next) {
                    return Err(FrameError::UnknownNextStage {
                        stage: stage.name.clone(),
                        next_stage: next.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Starts relays, then cooperative replicas, then process replicas.
    pub fn start(self) -> Result<RunningFrame, FrameError> {
        self.validate_routes()?;

        let Self {
            id,
            config,
            allocator,
            registry,
            relays,
            stages,
        } = self;

        let mut routes = HashMap::new();
        for stage in &stages {
            routes.insert(
                stage.name.clone(),
                registry.connect_push(&stage.pair.frontend)?,
            );
        }
        let outbound = Arc::new(OutboundTable::new(routes));

        let token = Arc::new(CancellationToken::new());
        token.on_cancel(move |reason| info!(frame = %id, reason, "Frame cancelled"));

        let mut running = RunningFrame {
            id,
            config,
            token,
            relays: Vec::new(),
            replicas: Vec::new(),
            cooperative: None,
        };

        if let Err(e) = running.launch(relays, &stages, &registry, &outbound) {
            running.stop("startup failed");
            return Err(e);
        }

        info!(
            frame = %id,
            namespace = allocator.namespace(),
            stages = stages.len(),
            replicas = running.replicas.len(),
            cooperative = running.cooperative.is_some(),
            "Frame started"
        );
        Ok(running)
    }

    /// Starts the frame and blocks until a thread dies.
    pub fn start_all_stages(self) -> Result<(), FrameError> {
        self.start()?.wait()
    }
}

fn validate_name(name: &str) -> Result<(), FrameError> {
    let valid = match &*STAGE_NAME {
        Ok(pattern) => pattern.is_match(name),
        Err(e) => {
            return Err(FrameError::InvalidStage {
                stage: name.to_string(),
                reason: e.to_string(),
            })
        }
    };
    if valid {
        Ok(())
    } else {
        Err(FrameError::InvalidStage {
            stage: name.to_string(),
            reason: "names use letters, digits, '_', '-' and '.'".to_string(),
        })
    }
}

#[derive(Debug)]
struct RelayHandle {
    stage: String,
    handle: JoinHandle<std::io::Result<RelayStats>>,
}

#[derive(Debug)]
struct ReplicaHandle {
    stage: String,
    replica: usize,
    handle: JoinHandle<ReplicaExit>,
}

/// A started frame.
///
/// Dropping it shuts the frame down without waiting for its threads.
#[derive(Debug)]
pub struct RunningFrame {
    id: Uuid,
    config: FrameConfig,
    token: Arc<CancellationToken>,
    relays: Vec<RelayHandle>,
    replicas: Vec<ReplicaHandle>,
    cooperative: Option<JoinHandle<Result<(), String>>>,
}

impl RunningFrame {
    fn launch(
        &mut self,
        relays: Vec<Relay>,
        stages: &[StageDefinition],
        registry: &ChannelRegistry,
        outbound: &Arc<OutboundTable>,
    ) -> Result<(), FrameError> {
        for relay in relays {
            let stage = relay.stage().to_string();
            let handle = relay.spawn(self.token.clone())?;
            self.relays.push(RelayHandle { stage, handle });
        }

        let mut cooperative = Vec::new();
        for stage in stages {
            let StageFn::Async(stage_fn) = &stage.stage_fn else {
                continue;
            };
            for replica in 0..stage.replicas {
                cooperative.push(CooperativeReplica {
                    ctx: self.context(stage, replica),
                    stage_fn: stage_fn.clone(),
                    sockets: AsyncSockets::new(
                        stage.name.clone(),
                        stage.next_stage.clone(),
                        outbound.clone(),
                        registry.connect_pull(&stage.pair.backend)?,
                    ),
                });
            }
        }
        if !cooperative.is_empty() {
            self.cooperative = Some(spawn_cooperative(cooperative, self.token.clone())?);
        }

        for stage in stages {
            let StageFn::Sync(stage_fn) = &stage.stage_fn else {
                continue;
            };
            for replica in 0..stage.replicas {
                let sockets = SyncSockets::new(
                    stage.name.clone(),
                    stage.next_stage.clone(),
                    outbound.clone(),
                    registry.connect_pull(&stage.pair.backend)?,
                );
                let handle =
                    spawn_sync_replica(self.context(stage, replica), stage_fn.clone(), sockets)?;
                self.replicas.push(ReplicaHandle {
                    stage: stage.name.clone(),
                    replica,
                    handle,
                });
            }
        }
        Ok(())
    }

    fn context(&self, stage: &StageDefinition, replica: usize) -> ReplicaContext {
        ReplicaContext::new(
            stage.name.clone(),
            replica,
            stage.error_handler.clone(),
            self.token.clone(),
        )
    }

    /// The token that shuts this frame down when cancelled.
    ///
    /// Cancelling it from another thread makes [`wait`](Self::wait) return
    /// `Ok` after the threads stopped.
    #[must_use]
    pub fn cancellation_token(&self) -> Arc<CancellationToken> {
        self.token.clone()
    }

    /// Identifies the frame in logs.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Number of process-mode replica threads.
    #[must_use]
    pub fn replica_count(&self) -> usize {
        self.replicas.len()
    }

    /// Blocks until a thread dies or the frame is cancelled.
    ///
    /// Threads are checked every poll interval. A death shuts the rest of the
    /// frame down before the error is returned.
    pub fn wait(mut self) -> Result<(), FrameError> {
        let interval = self.config.poll_interval();
        loop {
            if self.token.is_cancelled() {
                self.join_all();
                return Ok(());
            }
            if let Some(failure) = self.reap() {
                error!(error = %failure, "Frame thread died, shutting down");
                self.stop("frame thread died");
                return Err(failure);
            }
            std::thread::sleep(interval);
        }
    }

    /// Cancels the frame and waits up to the shutdown timeout for its threads.
    ///
    /// Messages still queued are discarded.
    pub fn shutdown(mut self) {
        self.stop("shutdown requested");
    }

    fn stop(&mut self, reason: &str) {
        self.token.cancel(reason);
        debug!(frame = %self.id, "Joining frame threads");
        self.join_all();
    }

    /// Joins the first finished thread and describes its death.
    fn reap(&mut self) -> Option<FrameError> {
        if self.token.is_cancelled() {
            return None;
        }
        if let Some(pos) = self.replicas.iter().position(|r| r.handle.is_finished()) {
            let ReplicaHandle {
                stage,
                replica,
                handle,
            } = self.replicas.swap_remove(pos);
            let reason = match handle.join() {
                Ok(ReplicaExit::ChannelClosed) => "lost its queue".to_string(),
                Ok(ReplicaExit::Cancelled) => "stopped".to_string(),
                Err(panic) => format!("panicked: {}", panic_message(panic.as_ref())),
            };
            return Some(FrameError::StageDied {
                stage,
                replica,
                reason,
            });
        }

        if let Some(pos) = self.relays.iter().position(|r| r.handle.is_finished()) {
            let RelayHandle { stage, handle } = self.relays.swap_remove(pos);
            let reason = match handle.join() {
                Ok(Ok(stats)) => format!("stopped after {} messages", stats.forwarded),
                Ok(Err(e)) => e.to_string(),
                Err(panic) => format!("panicked: {}", panic_message(panic.as_ref())),
            };
            return Some(FrameError::RelayDied { stage, reason });
        }

        if self
            .cooperative
            .as_ref()
            .is_some_and(JoinHandle::is_finished)
        {
            let handle = self.cooperative.take()?;
            let reason = match handle.join() {
                Ok(Ok(())) => "stopped".to_string(),
                Ok(Err(reason)) => reason,
                Err(panic) => format!("panicked: {}", panic_message(panic.as_ref())),
            };
            return Some(FrameError::CooperativeLoopDied(reason));
        }

        None
    }

    /// Waits for every thread until the shutdown timeout passes.
    fn join_all(&mut self) {
        let deadline = Instant::now() + self.config.shutdown_timeout();
        while !self.all_finished() && Instant::now() < deadline {
            std::thread::sleep(JOIN_POLL);
        }

        for ReplicaHandle {
            stage,
            replica,
            handle,
        } in self.replicas.drain(..)
        {
            if !handle.is_finished() {
                warn!(stage = %stage, replica, "Replica did not stop in time, detaching");
                continue;
            }
            if let Err(panic) = handle.join() {
                warn!(stage = %stage, replica, reason = %panic_message(panic.as_ref()), "Replica panicked");
            }
        }

        for RelayHandle { stage, handle } in self.relays.drain(..) {
            if !handle.is_finished() {
                warn!(stage = %stage, "Relay did not stop in time, detaching");
                continue;
            }
            match handle.join() {
                Ok(Ok(stats)) => debug!(stage = %stage, forwarded = stats.forwarded, "Relay joined"),
                Ok(Err(e)) => warn!(stage = %stage, error = %e, "Relay failed"),
                Err(panic) => {
                    warn!(stage = %stage, reason = %panic_message(panic.as_ref()), "Relay panicked");
                }
            }
        }

        if let Some(handle) = self.cooperative.take() {
            if !handle.is_finished() {
                warn!("Cooperative loop did not stop in time, detaching");
            } else if let Ok(Err(reason)) = handle.join() {
                warn!(reason = %reason, "Cooperative loop failed");
            }
        }
    }

    fn all_finished(&self) -> bool {
        self.replicas.iter().all(|r| r.handle.is_finished())
            && self.relays.iter().all(|r| r.handle.is_finished())
            && self
                .cooperative
                .as_ref()
                .map_or(true, JoinHandle::is_finished)
    }
}

impl Drop for RunningFrame {
    fn drop(&mut self) {
        self.token.cancel("frame dropped");
    }
}
