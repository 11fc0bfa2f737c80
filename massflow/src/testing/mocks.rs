//! In-memory collaborators and handlers for testing.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::collaborators::{ReportSink, SampleSink, WorkItem, WorkSource};
use crate::errors::{CollaboratorError, StageFailure};
use crate::payload::ReportFields;
use crate::resources::{Sample, SampleSubmission, ScheduledAnalysis};
use crate::stages::StageErrorHandler;

/// A work source backed by a queue.
///
/// Unacknowledged items go back to the front of the queue.
#[derive(Debug)]
pub struct VecWorkSource {
    items: Mutex<VecDeque<WorkItem>>,
    acked: AtomicUsize,
    idle: Duration,
}

impl Default for VecWorkSource {
    fn default() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            acked: AtomicUsize::new(0),
            idle: Duration::from_millis(10),
        }
    }
}

impl VecWorkSource {
    /// Creates an empty source.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets how long `consume` sleeps when the queue is empty.
    #[must_use]
    pub fn with_idle(mut self, idle: Duration) -> Self {
        self.idle = idle;
        self
    }

    /// Queues a work item.
    pub fn push(&self, request: ScheduledAnalysis, sample: Sample) {
        self.items.lock().push_back(WorkItem { request, sample });
    }

    /// Number of acknowledged items.
    #[must_use]
    pub fn acked(&self) -> usize {
        self.acked.load(Ordering::SeqCst)
    }

    /// Number of items waiting for delivery.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.items.lock().len()
    }
}

impl WorkSource for VecWorkSource {
    fn consume(
        &self,
        on_work: &mut dyn FnMut(WorkItem) -> bool,
    ) -> Result<(), CollaboratorError> {
        let batch: Vec<WorkItem> = self.items.lock().drain(..).collect();
        if batch.is_empty() {
            std::thread::sleep(self.idle);
            return Ok(());
        }

        let mut rejected = Vec::new();
        for item in batch {
            if on_work(item.clone()) {
                self.acked.fetch_add(1, Ordering::SeqCst);
            } else {
                rejected.push(item);
            }
        }

        let mut items = self.items.lock();
        for item in rejected.into_iter().rev() {
            items.push_front(item);
        }
        Ok(())
    }
}

/// A report sink that records every submission.
#[derive(Debug, Default)]
pub struct RecordingReportSink {
    reports: Mutex<Vec<(ScheduledAnalysis, ReportFields)>>,
}

impl RecordingReportSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every submitted report, in order.
    #[must_use]
    pub fn reports(&self) -> Vec<(ScheduledAnalysis, ReportFields)> {
        self.reports.lock().clone()
    }

    /// Number of submitted reports.
    #[must_use]
    pub fn len(&self) -> usize {
        self.reports.lock().len()
    }

    /// Returns true if nothing was submitted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ReportSink for RecordingReportSink {
    fn submit(
        &self,
        request: &ScheduledAnalysis,
        report: &ReportFields,
    ) -> Result<(), CollaboratorError> {
        self.reports.lock().push((request.clone(), report.clone()));
        Ok(())
    }
}

/// A sample sink that records creations and hands out numbered samples.
#[derive(Debug, Default)]
pub struct RecordingSampleSink {
    created: Mutex<Vec<SampleSubmission>>,
    reports: Mutex<Vec<(Sample, ReportFields)>>,
}

impl RecordingSampleSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every sample creation, in order.
    #[must_use]
    pub fn created(&self) -> Vec<SampleSubmission> {
        self.created.lock().clone()
    }

    /// Every report submitted without a request, in order.
    #[must_use]
    pub fn reports(&self) -> Vec<(Sample, ReportFields)> {
        self.reports.lock().clone()
    }
}

impl SampleSink for RecordingSampleSink {
    fn create_sample(&self, sample: &SampleSubmission) -> Result<Sample, CollaboratorError> {
        let mut created = self.created.lock();
        created.push(sample.clone());
        Ok(super::fixtures::sample_fixture(&created.len().to_string()))
    }

    fn submit_report_without_request(
        &self,
        sample: &Sample,
        report: &ReportFields,
    ) -> Result<(), CollaboratorError> {
        self.reports.lock().push((sample.clone(), report.clone()));
        Ok(())
    }
}

/// An error handler that keeps every failure it sees.
#[derive(Debug, Default)]
pub struct RecordingErrorHandler {
    failures: Mutex<Vec<(String, StageFailure)>>,
}

impl RecordingErrorHandler {
    /// Creates an empty handler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every handled failure with its stage name, in order.
    #[must_use]
    pub fn failures(&self) -> Vec<(String, StageFailure)> {
        self.failures.lock().clone()
    }
}

impl StageErrorHandler for RecordingErrorHandler {
    fn handle(&self, stage: &str, failure: &StageFailure) {
        self.failures
            .lock()
            .push((stage.to_string(), failure.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{sample_fixture, scheduled_analysis_fixture};

    #[test]
    fn test_vec_work_source_requeues_in_order() {
        let source = VecWorkSource::new().with_idle(Duration::from_millis(1));
        for id in ["1", "2", "3"] {
            source.push(scheduled_analysis_fixture(id), sample_fixture(id));
        }

        source
            .consume(&mut |item| item.request.id == "2")
            .unwrap();
        assert_eq!(source.acked(), 1);

        let mut order = Vec::new();
        source
            .consume(&mut |item| {
                order.push(item.request.id);
                true
            })
            .unwrap();
        assert_eq!(order, vec!["1", "3"]);
        assert_eq!(source.remaining(), 0);
    }

    #[test]
    fn test_empty_source_returns() {
        let source = VecWorkSource::new().with_idle(Duration::from_millis(1));
        let mut called = false;
        source
            .consume(&mut |_| {
                called = true;
                true
            })
            .unwrap();
        assert!(!called);
    }

    #[test]
    fn test_recording_sample_sink_numbers_samples() {
        let sink = RecordingSampleSink::new();
        let first = sink.create_sample(&SampleSubmission::default()).unwrap();
        let second = sink.create_sample(&SampleSubmission::default()).unwrap();
        assert_eq!(first.id, "1");
        assert_eq!(second.id, "2");

        sink.submit_report_without_request(&second, &ReportFields::default())
            .unwrap();
        assert_eq!(sink.reports().len(), 1);
        assert_eq!(sink.created().len(), 2);
    }

    #[test]
    fn test_recording_error_handler() {
        let handler = RecordingErrorHandler::new();
        handler.handle("a", &StageFailure::new("boom"));
        let failures = handler.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, "a");
        assert_eq!(failures[0].1.message, "boom");
    }
}
