//! Blocking HTTP client for the MASS REST API.
//!
//! This module provides:
//! - [`ClientConfig`] and the explicit [`ConnectionRegistry`]
//! - [`Connection`] with JSON, paginated and multipart requests
//! - HTTP implementations of the collaborator contracts
//!
//! Requests block, so these types belong in process-mode stages.

mod collaborators;
mod config;
mod connection;

pub use collaborators::{
    report_metadata, sample_fields, HttpReportSink, HttpRequestFeed, HttpSampleSink,
    REPORT_STATUS_FAILURE, REPORT_STATUS_OK,
};
pub use config::{ClientConfig, ENV_API_KEY, ENV_BASE_URL, ENV_TIMEOUT_SECS};
pub use connection::{Connection, ConnectionRegistry, Page, Target, DEFAULT_ALIAS};
