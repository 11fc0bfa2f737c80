//! Ready-made stages.
//!
//! The collaborator stages are process-mode functions for
//! [`crate::frame::AnalysisFrame::add_sync_stage`]; the HTTP fetch stage is a
//! cooperative function for [`crate::frame::AnalysisFrame::add_async_stage`].

use super::sockets::SyncSockets;
use crate::collaborators::{ReportSink, SampleSink, WorkSource};
use crate::errors::{SocketError, StageFailure, StageResult};
use crate::payload::StagePayload;
use std::sync::Arc;
use tracing::debug;

#[cfg(feature = "http")]
pub use super::fetch::{
    decode_body, get_http, get_http_with, FetchOptions, FetchRequest, DEFAULT_CONN_TIMEOUT,
    DEFAULT_PARALLEL_REQUESTS, DEFAULT_STREAM_TIMEOUT,
};

fn unexpected(stage: &str, payload: &StagePayload) -> StageFailure {
    StageFailure::new(format!(
        "stage '{stage}' cannot handle '{}' payloads",
        payload.kind()
    ))
    .with_context_entry("kind", payload.kind())
}

/// Pulls work from `source` and sends one request payload per item to the
/// stage's next stage. Items are acknowledged only after a successful send.
pub fn get_requests(
    source: Arc<dyn WorkSource>,
) -> impl Fn(&mut SyncSockets) -> StageResult + Send + Sync + 'static {
    move |sockets| {
        let mut send_error: Option<SocketError> = None;
        source.consume(&mut |item| {
            if send_error.is_some() {
                return false;
            }
            match sockets.send(StagePayload::request(item.request, item.sample)) {
                Ok(()) => true,
                Err(e) => {
                    send_error = Some(e);
                    false
                }
            }
        })?;

        match send_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}

/// Receives request payloads and submits their reports to `sink`.
pub fn report(
    sink: Arc<dyn ReportSink>,
) -> impl Fn(&mut SyncSockets) -> StageResult + Send + Sync + 'static {
    move |sockets| {
        let payload = sockets.receive()?;
        let StagePayload::Request(request) = &payload else {
            return Err(unexpected(sockets.name(), &payload));
        };

        sink.submit(&request.request, &request.envelope.report)?;
        debug!(request = %request.request.id, failed = request.envelope.report.failed, "Report submitted");
        Ok(())
    }
}

/// Receives sample creation payloads and creates the samples.
pub fn create_sample(
    sink: Arc<dyn SampleSink>,
) -> impl Fn(&mut SyncSockets) -> StageResult + Send + Sync + 'static {
    move |sockets| {
        let payload = sockets.receive()?;
        let StagePayload::CreateSampleAndReport(object) = &payload else {
            return Err(unexpected(sockets.name(), &payload));
        };

        let sample = sink.create_sample(&object.sample)?;
        debug!(sample = %sample.id, "Sample created");
        Ok(())
    }
}

/// Receives sample creation payloads, creates the samples and attaches the
/// payload's report to each.
pub fn create_sample_and_report(
    sink: Arc<dyn SampleSink>,
) -> impl Fn(&mut SyncSockets) -> StageResult + Send + Sync + 'static {
    move |sockets| {
        let payload = sockets.receive()?;
        let StagePayload::CreateSampleAndReport(object) = &payload else {
            return Err(unexpected(sockets.name(), &payload));
        };

        let sample = sink.create_sample(&object.sample)?;
        sink.submit_report_without_request(&sample, &object.envelope.report)?;
        debug!(sample = %sample.id, "Sample created with report");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;
    use crate::collaborators::{MockReportSink, MockSampleSink};
    use crate::errors::{CollaboratorError, FailureKind};
    use crate::resources::{Sample, SampleSubmission, ScheduledAnalysis};
    use crate::stages::sockets::OutboundTable;
    use crate::stages::{forward_failure_blocking, DEFAULT_REPORT_STAGE};
    use crate::testing::{RecordingReportSink, VecWorkSource};
    use crate::transport::{channel, PushSocket};
    use std::collections::HashMap;

    fn analysis(id: &str) -> ScheduledAnalysis {
        ScheduledAnalysis {
            url: format!("http://mass/api/scheduled_analysis/{id}/"),
            id: id.to_string(),
            analysis_system_instance: "http://mass/api/analysis_system_instance/x/".to_string(),
            sample: "http://mass/api/sample/1/".to_string(),
            analysis_scheduled: None,
        }
    }

    fn sample() -> Sample {
        serde_json::from_value(serde_json::json!({
            "url": "http://mass/api/sample/1/",
            "id": "1"
        }))
        .unwrap()
    }

    /// Sockets of a stage named `stage` whose own queue is fed by the
    /// returned push socket.
    fn fed_sockets(stage: &str) -> (PushSocket, SyncSockets) {
        let (push, pull) = channel(4);
        let sockets = SyncSockets::new(stage, None, Arc::new(OutboundTable::default()), pull);
        (push, sockets)
    }

    fn feed(push: &PushSocket, payload: &StagePayload) {
        push.send_blocking(codec::encode(payload).unwrap()).unwrap();
    }

    #[test]
    fn test_get_requests_sends_and_acks() {
        let (next_push, next_pull) = channel(4);
        let (_own_push, own_pull) = channel(1);
        let mut routes = HashMap::new();
        routes.insert("next".to_string(), next_push);
        let mut sockets = SyncSockets::new(
            "requests",
            Some("next".to_string()),
            Arc::new(OutboundTable::new(routes)),
            own_pull,
        );

        let source = Arc::new(VecWorkSource::new());
        source.push(analysis("1"), sample());
        source.push(analysis("2"), sample());

        let stage = get_requests(source.clone());
        stage(&mut sockets).unwrap();

        for id in ["1", "2"] {
            let payload = codec::decode(&next_pull.receive_blocking().unwrap()).unwrap();
            assert_eq!(payload.as_request().unwrap().request.id, id);
        }
        assert_eq!(source.acked(), 2);
        assert_eq!(source.remaining(), 0);
    }

    #[test]
    fn test_get_requests_keeps_items_when_send_fails() {
        let (_own_push, own_pull) = channel(1);
        let mut sockets =
            SyncSockets::new("requests", None, Arc::new(OutboundTable::default()), own_pull);

        let source = Arc::new(VecWorkSource::new());
        source.push(analysis("1"), sample());

        let failure = get_requests(source.clone())(&mut sockets).unwrap_err();
        assert_eq!(failure.kind, FailureKind::Routing);
        assert_eq!(source.acked(), 0);
        assert_eq!(source.remaining(), 1);
    }

    #[test]
    fn test_report_submits_request_report() {
        let (push, mut sockets) = fed_sockets("report");
        let mut payload = StagePayload::request(analysis("7"), sample());
        payload.envelope_mut().report_tags(["done"]);
        feed(&push, &payload);

        let sink = Arc::new(RecordingReportSink::new());
        report(sink.clone())(&mut sockets).unwrap();

        let submitted = sink.reports();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].0.id, "7");
        assert_eq!(submitted[0].1.tags, vec!["done"]);
    }

    #[test]
    fn test_report_rejects_other_payloads() {
        let (push, mut sockets) = fed_sockets("report");
        feed(&push, &StagePayload::generic());

        let mut sink = MockReportSink::new();
        sink.expect_submit().never();

        let failure = report(Arc::new(sink))(&mut sockets).unwrap_err();
        assert_eq!(failure.kind, FailureKind::Stage);
        assert_eq!(failure.context.get("kind").map(String::as_str), Some("generic"));
    }

    #[test]
    fn test_report_rejects_forwarded_sample_payloads() {
        let (report_push, report_pull) = channel(4);
        let (_own_push, own_pull) = channel(1);
        let mut routes = HashMap::new();
        routes.insert(DEFAULT_REPORT_STAGE.to_string(), report_push);
        let crawler = SyncSockets::new("crawl", None, Arc::new(OutboundTable::new(routes)), own_pull);

        let payload = StagePayload::create_sample(SampleSubmission {
            domain: Some("example.org".to_string()),
            ..Default::default()
        });
        forward_failure_blocking(&crawler, payload, &"resolver down").unwrap();

        let mut report_sockets =
            SyncSockets::new("report", None, Arc::new(OutboundTable::default()), report_pull);
        let mut sink = MockReportSink::new();
        sink.expect_submit().never();

        let failure = report(Arc::new(sink))(&mut report_sockets).unwrap_err();
        assert_eq!(
            failure.context.get("kind").map(String::as_str),
            Some("create_sample_and_report")
        );
    }

    #[test]
    fn test_report_sink_errors_become_collaborator_failures() {
        let (push, mut sockets) = fed_sockets("report");
        feed(&push, &StagePayload::request(analysis("7"), sample()));

        let mut sink = MockReportSink::new();
        sink.expect_submit()
            .times(1)
            .returning(|_, _| Err(CollaboratorError::Rejected("409".to_string())));

        let failure = report(Arc::new(sink))(&mut sockets).unwrap_err();
        assert_eq!(failure.kind, FailureKind::Collaborator);
    }

    #[test]
    fn test_create_sample_and_report() {
        let (push, mut sockets) = fed_sockets("create");
        let mut payload = StagePayload::create_sample(SampleSubmission {
            domain: Some("example.org".to_string()),
            ..Default::default()
        });
        payload.envelope_mut().report_tags(["crawled"]);
        feed(&push, &payload);

        let mut sink = MockSampleSink::new();
        sink.expect_create_sample()
            .withf(|submission| submission.domain.as_deref() == Some("example.org"))
            .times(1)
            .returning(|_| Ok(sample()));
        sink.expect_submit_report_without_request()
            .withf(|sample, report| sample.id == "1" && report.tags == ["crawled"])
            .times(1)
            .returning(|_, _| Ok(()));

        create_sample_and_report(Arc::new(sink))(&mut sockets).unwrap();
    }

    #[test]
    fn test_create_sample_only() {
        let (push, mut sockets) = fed_sockets("create");
        feed(
            &push,
            &StagePayload::create_sample(SampleSubmission {
                uri: Some("http://example.org/".to_string()),
                ..Default::default()
            }),
        );

        let mut sink = MockSampleSink::new();
        sink.expect_create_sample().times(1).returning(|_| Ok(sample()));
        sink.expect_submit_report_without_request().never();

        create_sample(Arc::new(sink))(&mut sockets).unwrap();
    }
}
