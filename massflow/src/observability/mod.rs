//! Observability utilities.
//!
//! Library code only emits `tracing` events; binaries decide where they go by
//! calling [`init_logging`] once at startup.

mod logging;
mod span;

pub use logging::{init_logging, LogConfig, LogFormat, DEFAULT_LOG_FILTER};
pub use span::{InvocationStatus, SpanTimer, StageSpanAttributes};
