//! # Massflow
//!
//! Multi-stage analysis pipelines for the MASS analysis service.
//!
//! Massflow wires independently running analysis stages together through
//! bounded queues:
//!
//! - **Stages**: named functions called forever by supervised replicas
//! - **Two concurrency modes**: one thread per replica, or tasks on a shared
//!   event loop
//! - **Backpressure**: every stage has a bounded queue behind a relay
//! - **Routing**: default next stage, explicit targets and instructed
//!   request/response fan-out
//! - **Error isolation**: failures go to a backup handler and the replica
//!   keeps running
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use massflow::prelude::*;
//!
//! let mut frame = AnalysisFrame::new(FrameConfig::from_env()?)?;
//! frame
//!     .add_sync_stage("requests", StageOptions::new().with_next_stage("tag"), get_requests(source))?
//!     .add_async_stage("tag", StageOptions::new().with_next_stage("report"), |sockets: AsyncSockets| async move {
//!         let mut payload = sockets.receive().await?;
//!         payload.envelope_mut().report_tags(["tagged"]);
//!         sockets.send(payload).await?;
//!         StageResult::Ok(())
//!     })?
//!     .add_sync_stage("report", StageOptions::new(), report(sink))?;
//!
//! frame.start_all_stages()?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod codec;
pub mod collaborators;
pub mod errors;
pub mod frame;
pub mod observability;
pub mod payload;
pub mod resources;
pub mod stages;
pub mod testing;
pub mod transport;

#[cfg(feature = "http")]
pub mod client;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::CancellationToken;
    pub use crate::collaborators::{
        PollingWorkSource, ReportSink, RequestFeed, SampleSink, WorkItem, WorkSource,
    };
    pub use crate::errors::{
        CodecError, CollaboratorError, ConfigError, FailureKind, FrameError, MassflowError,
        SocketError, StageFailure, StageResult, TransportError,
    };
    pub use crate::frame::{AnalysisFrame, FrameConfig, RunningFrame, StageOptions};
    pub use crate::observability::{init_logging, LogConfig, LogFormat};
    pub use crate::payload::{ReportFields, StageEnvelope, StageIdentity, StagePayload};
    pub use crate::resources::{Sample, SampleKind, SampleSubmission, ScheduledAnalysis};
    pub use crate::stages::defaults::{create_sample, create_sample_and_report, get_requests, report};
    pub use crate::stages::{
        forward_failure, forward_failure_blocking, AsyncSockets, Concurrency,
        CountingErrorHandler, LoggingErrorHandler, StageErrorHandler, SyncSockets,
    };

    #[cfg(feature = "http")]
    pub use crate::stages::defaults::get_http;
    #[cfg(feature = "http")]
    pub use crate::client::{
        ClientConfig, Connection, ConnectionRegistry, HttpReportSink, HttpRequestFeed,
        HttpSampleSink,
    };
}
