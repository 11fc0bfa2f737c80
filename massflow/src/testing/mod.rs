//! Testing utilities for massflow frames.
//!
//! This module provides:
//! - In-memory work sources and recording sinks
//! - Recording error handlers
//! - Fixtures for resources and payloads
//! - Assertions on payload reports

mod assertions;
mod fixtures;
mod mocks;

pub use assertions::{
    assert_report_failed, assert_report_has_json, assert_report_succeeded, assert_report_tags,
};
pub use fixtures::{sample_fixture, scheduled_analysis_fixture, tagged_payload, payload_tag};
pub use mocks::{RecordingErrorHandler, RecordingReportSink, RecordingSampleSink, VecWorkSource};
pub use crate::stages::CountingErrorHandler;
