//! HTTP implementations of the collaborator contracts.

use super::connection::{Connection, Target};
use crate::collaborators::{PollingWorkSource, RequestFeed, ReportSink, SampleSink};
use crate::errors::CollaboratorError;
use crate::payload::ReportFields;
use crate::resources::{Sample, SampleKind, SampleSubmission, ScheduledAnalysis};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

/// Report status sent for successful analyses.
pub const REPORT_STATUS_OK: u8 = 0;
/// Report status sent for failed analyses.
pub const REPORT_STATUS_FAILURE: u8 = 1;

/// Lists the scheduled analyses of one analysis system instance.
#[derive(Debug, Clone)]
pub struct HttpRequestFeed {
    connection: Arc<Connection>,
    instance_url: String,
}

impl HttpRequestFeed {
    /// Creates a feed for the instance at `instance_url`.
    #[must_use]
    pub fn new(connection: Arc<Connection>, instance_url: impl Into<String>) -> Self {
        let instance_url = instance_url.into();
        let instance_url = format!("{}/", instance_url.trim_end_matches('/'));
        Self {
            connection,
            instance_url,
        }
    }

    /// Wraps the feed in a polling work source.
    #[must_use]
    pub fn into_work_source(self) -> PollingWorkSource<Self> {
        PollingWorkSource::new(self)
    }

    fn scheduled_analyses_url(&self) -> String {
        format!("{}scheduled_analyses/", self.instance_url)
    }
}

impl RequestFeed for HttpRequestFeed {
    fn pending(&self) -> Result<Vec<ScheduledAnalysis>, CollaboratorError> {
        self.connection
            .get_all(Target::Url(&self.scheduled_analyses_url()))
    }

    fn sample(&self, request: &ScheduledAnalysis) -> Result<Sample, CollaboratorError> {
        self.connection.get_json(Target::Url(&request.sample))
    }
}

/// Submits reports of scheduled analyses.
#[derive(Debug, Clone)]
pub struct HttpReportSink {
    connection: Arc<Connection>,
}

impl HttpReportSink {
    /// Creates a sink on `connection`.
    #[must_use]
    pub fn new(connection: Arc<Connection>) -> Self {
        Self { connection }
    }
}

impl ReportSink for HttpReportSink {
    fn submit(
        &self,
        request: &ScheduledAnalysis,
        report: &ReportFields,
    ) -> Result<(), CollaboratorError> {
        let path = format!("scheduled_analysis/{}/submit_report/", request.id);
        self.connection.post_multipart(
            Target::Path(&path),
            &report_metadata(report, None),
            &report.json_report_objects,
            &report.raw_report_objects,
        )?;
        info!(request = %request.id, failed = report.failed, "Report submitted");
        Ok(())
    }
}

/// Creates samples and reports them on behalf of one analysis system.
#[derive(Debug, Clone)]
pub struct HttpSampleSink {
    connection: Arc<Connection>,
    analysis_system: String,
}

impl HttpSampleSink {
    /// Creates a sink reporting as the analysis system at `analysis_system`.
    #[must_use]
    pub fn new(connection: Arc<Connection>, analysis_system: impl Into<String>) -> Self {
        Self {
            connection,
            analysis_system: analysis_system.into(),
        }
    }
}

impl SampleSink for HttpSampleSink {
    fn create_sample(&self, sample: &SampleSubmission) -> Result<Sample, CollaboratorError> {
        let kind = sample.kind().ok_or_else(|| {
            CollaboratorError::Rejected("sample submission has no content".to_string())
        })?;
        let target = Target::Path(kind.endpoint());
        let fields = sample_fields(sample, kind);

        let created: Value = if kind == SampleKind::File {
            let mut files = BTreeMap::new();
            files.insert(
                sample.filename.clone().unwrap_or_else(|| "file".to_string()),
                sample.file.clone().unwrap_or_default(),
            );
            self.connection
                .post_multipart(target, &fields, &Map::new(), &files)?
        } else {
            self.connection.post_json(target, &fields)?
        };

        serde_json::from_value(created).map_err(|e| CollaboratorError::InvalidResponse {
            url: self.connection.url(target),
            reason: e.to_string(),
        })
    }

    fn submit_report_without_request(
        &self,
        sample: &Sample,
        report: &ReportFields,
    ) -> Result<(), CollaboratorError> {
        let path = format!("sample/{}/submit_report/", sample.id);
        self.connection.post_multipart(
            Target::Path(&path),
            &report_metadata(report, Some(&self.analysis_system)),
            &report.json_report_objects,
            &report.raw_report_objects,
        )?;
        info!(sample = %sample.id, "Report without request submitted");
        Ok(())
    }
}

/// The `metadata` part of a report submission.
#[must_use]
pub fn report_metadata(report: &ReportFields, analysis_system: Option<&str>) -> Value {
    let status = if report.failed {
        REPORT_STATUS_FAILURE
    } else {
        REPORT_STATUS_OK
    };
    let mut metadata = json!({
        "tags": report.tags,
        "additional_metadata": report.additional_metadata,
        "status": status,
        "error_message": report.error_message,
    });
    if let Value::Object(fields) = &mut metadata {
        if let Some(date) = report.analysis_date {
            fields.insert("analysis_date".to_string(), json!(date));
        }
        if let Some(system) = analysis_system {
            fields.insert("analysis_system".to_string(), json!(system));
        }
    }
    metadata
}

/// The creation body of a sample submission of `kind`.
#[must_use]
pub fn sample_fields(sample: &SampleSubmission, kind: SampleKind) -> Value {
    let mut fields = Map::new();
    fields.insert("tlp_level".to_string(), json!(sample.tlp_level));
    fields.insert("tags".to_string(), json!(sample.tags));
    match kind {
        SampleKind::File => {}
        SampleKind::Uri => {
            fields.insert("uri".to_string(), json!(sample.uri));
        }
        SampleKind::Domain => {
            fields.insert("domain".to_string(), json!(sample.domain));
        }
        SampleKind::Ip => {
            fields.insert("ip_address".to_string(), json!(sample.ip_address()));
        }
    }
    if let Some(port) = sample.port {
        fields.insert("port".to_string(), json!(port));
    }
    Value::Object(fields)
}
