//! Payloads that travel between stages.
//!
//! Every payload variant embeds a [`StageEnvelope`]: the MASS report being
//! built up, a per-stage scratch map for passing data between stages, and an
//! optional routing instruction.

use crate::codec::base64_serde;
use crate::resources::{Sample, SampleSubmission, ScheduledAnalysis};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Key of the stage-report entry that names where an instructed report goes.
pub const REPORT_NAME_KEY: &str = "report_name";

/// Tag added to the report of a payload marked as failed.
pub const FAILED_TAG: &str = "failed";

/// Anything that knows the name of the stage it acts for.
///
/// Implemented by both socket types so payload helpers can address the
/// calling stage's entries, and by `str` for direct use.
pub trait StageIdentity {
    /// Name of the calling stage.
    fn stage_name(&self) -> &str;
}

impl StageIdentity for str {
    fn stage_name(&self) -> &str {
        self
    }
}

impl StageIdentity for String {
    fn stage_name(&self) -> &str {
        self
    }
}

/// The MASS report assembled while a payload moves through the stages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportFields {
    /// JSON report objects, usually one object per stage.
    #[serde(default)]
    pub json_report_objects: Map<String, Value>,
    /// Binary report objects by file name.
    #[serde(default, with = "base64_serde::bytes_map")]
    pub raw_report_objects: BTreeMap<String, Vec<u8>>,
    /// Free form metadata stored with the report.
    #[serde(default)]
    pub additional_metadata: Map<String, Value>,
    /// Report tags.
    #[serde(default)]
    pub tags: Vec<String>,
    /// When the analysis ran.
    #[serde(default)]
    pub analysis_date: Option<DateTime<Utc>>,
    /// Whether the analysis failed.
    #[serde(default)]
    pub failed: bool,
    /// Error description of a failed analysis.
    #[serde(default)]
    pub error_message: Option<String>,
}

/// State shared by every payload variant.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageEnvelope {
    /// The MASS report under construction.
    #[serde(default)]
    pub report: ReportFields,
    /// Scratch data keyed by stage or report name.
    #[serde(default)]
    pub stage_report: BTreeMap<String, Value>,
    /// Stage that `send_instructed` routes to.
    #[serde(default)]
    pub stage_instruction: Option<String>,
}

impl StageEnvelope {
    /// Returns the stage report stored under `report_name`.
    #[must_use]
    pub fn get_stage_report(&self, report_name: &str) -> Option<&Value> {
        self.stage_report.get(report_name)
    }

    /// Stores a stage report under the calling stage's name.
    pub fn make_stage_report<S>(&mut self, stage: &S, report: Value)
    where
        S: StageIdentity + ?Sized,
    {
        self.stage_report
            .insert(stage.stage_name().to_string(), report);
    }

    /// Removes and returns one instruction left for the calling stage.
    ///
    /// Instructions are the keys of the calling stage's stage-report object.
    pub fn get_instruction<S>(&mut self, stage: &S, key: &str) -> Option<Value>
    where
        S: StageIdentity + ?Sized,
    {
        self.stage_report
            .get_mut(stage.stage_name())
            .and_then(Value::as_object_mut)
            .and_then(|instructions| instructions.remove(key))
    }

    /// Stores a stage report under the name the caller of this stage asked for.
    ///
    /// Returns the name used, or `None` (storing nothing) when no
    /// `report_name` instruction was left for the calling stage.
    pub fn make_instructed_stage_report<S>(&mut self, stage: &S, report: Value) -> Option<String>
    where
        S: StageIdentity + ?Sized,
    {
        let report_name = match self.get_instruction(stage, REPORT_NAME_KEY)? {
            Value::String(name) => name,
            other => other.to_string(),
        };
        self.stage_report.insert(report_name.clone(), report);
        Some(report_name)
    }

    /// Leaves instructions for `called_stage` and sets the return route.
    ///
    /// `data` becomes the called stage's stage report with `report_name`
    /// added; the called stage reads it with [`Self::get_instruction`] and
    /// answers with [`Self::make_instructed_stage_report`].
    pub fn instruct(
        &mut self,
        called_stage: &str,
        report_name: &str,
        mut data: Map<String, Value>,
        return_to: Option<String>,
    ) {
        data.insert(
            REPORT_NAME_KEY.to_string(),
            Value::String(report_name.to_string()),
        );
        self.stage_report
            .insert(called_stage.to_string(), Value::Object(data));
        self.stage_instruction = return_to;
    }

    /// Adds a JSON report.
    ///
    /// Reports are namespaced by the calling stage's name unless
    /// `suppress_stage_name` is set. With a `report_name` the whole report is
    /// stored under that name; otherwise its keys are merged in.
    pub fn report_json<S>(
        &mut self,
        stage: &S,
        report: Map<String, Value>,
        report_name: Option<&str>,
        suppress_stage_name: bool,
    ) where
        S: StageIdentity + ?Sized,
    {
        if suppress_stage_name {
            merge_json_report(&mut self.report.json_report_objects, report, report_name);
            return;
        }

        let slot = self
            .report
            .json_report_objects
            .entry(stage.stage_name().to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !slot.is_object() {
            *slot = Value::Object(Map::new());
        }
        if let Value::Object(target) = slot {
            merge_json_report(target, report, report_name);
        }
    }

    /// Appends tags to the report.
    pub fn report_tags<I, T>(&mut self, tags: I)
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.report.tags.extend(tags.into_iter().map(Into::into));
    }

    /// Sets the failed flag of the report.
    pub fn report_failed(&mut self, failed: bool) {
        self.report.failed = failed;
    }

    /// Replaces all raw report objects.
    pub fn report_raw_report_objects(&mut self, objects: BTreeMap<String, Vec<u8>>) {
        self.report.raw_report_objects = objects;
    }

    /// Adds one raw report object.
    pub fn report_raw_report_object(&mut self, name: impl Into<String>, content: Vec<u8>) {
        self.report.raw_report_objects.insert(name.into(), content);
    }

    /// Replaces the additional metadata.
    pub fn report_additional_metadata(&mut self, metadata: Map<String, Value>) {
        self.report.additional_metadata = metadata;
    }

    /// Sets the analysis date.
    pub fn report_analysis_date(&mut self, date: DateTime<Utc>) {
        self.report.analysis_date = Some(date);
    }

    /// Sets the error message.
    pub fn report_error_message(&mut self, message: impl Into<String>) {
        self.report.error_message = Some(message.into());
    }

    /// Marks the report as failed with `message` and tags it.
    pub fn mark_failed(&mut self, message: impl Into<String>) {
        self.report_failed(true);
        self.report_error_message(message);
        self.report_tags([FAILED_TAG]);
    }
}

fn merge_json_report(
    target: &mut Map<String, Value>,
    report: Map<String, Value>,
    report_name: Option<&str>,
) {
    match report_name {
        Some(name) => {
            target.insert(name.to_string(), Value::Object(report));
        }
        None => target.extend(report),
    }
}

/// A payload with no predefined content.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenericStageObject {
    /// Shared stage state.
    #[serde(default)]
    pub envelope: StageEnvelope,
    /// Application data.
    #[serde(default)]
    pub data: Map<String, Value>,
}

/// A scheduled analysis and its sample, as fetched from the work source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestPayload {
    /// Shared stage state.
    #[serde(default)]
    pub envelope: StageEnvelope,
    /// The work unit to report on.
    pub request: ScheduledAnalysis,
    /// The sample to analyse.
    pub sample: Sample,
}

/// A sample to create together with a report to attach to it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateSampleAndReportPayload {
    /// Shared stage state.
    #[serde(default)]
    pub envelope: StageEnvelope,
    /// The sample to create.
    #[serde(default)]
    pub sample: SampleSubmission,
}

/// Every kind of payload a stage can send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StagePayload {
    /// Application defined payload.
    Generic(GenericStageObject),
    /// Scheduled analysis request.
    Request(RequestPayload),
    /// Sample creation with a report.
    CreateSampleAndReport(CreateSampleAndReportPayload),
}

impl StagePayload {
    /// Creates an empty generic payload.
    #[must_use]
    pub fn generic() -> Self {
        Self::Generic(GenericStageObject::default())
    }

    /// Creates a request payload.
    #[must_use]
    pub fn request(request: ScheduledAnalysis, sample: Sample) -> Self {
        Self::Request(RequestPayload {
            envelope: StageEnvelope::default(),
            request,
            sample,
        })
    }

    /// Creates a sample creation payload.
    #[must_use]
    pub fn create_sample(sample: SampleSubmission) -> Self {
        Self::CreateSampleAndReport(CreateSampleAndReportPayload {
            envelope: StageEnvelope::default(),
            sample,
        })
    }

    /// The wire name of the variant.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Generic(_) => "generic",
            Self::Request(_) => "request",
            Self::CreateSampleAndReport(_) => "create_sample_and_report",
        }
    }

    /// The shared stage state.
    #[must_use]
    pub fn envelope(&self) -> &StageEnvelope {
        match self {
            Self::Generic(object) => &object.envelope,
            Self::Request(object) => &object.envelope,
            Self::CreateSampleAndReport(object) => &object.envelope,
        }
    }

    /// The shared stage state, mutably.
    pub fn envelope_mut(&mut self) -> &mut StageEnvelope {
        match self {
            Self::Generic(object) => &mut object.envelope,
            Self::Request(object) => &mut object.envelope,
            Self::CreateSampleAndReport(object) => &mut object.envelope,
        }
    }

    /// The report under construction.
    #[must_use]
    pub fn report(&self) -> &ReportFields {
        &self.envelope().report
    }

    /// The routing instruction, if any.
    #[must_use]
    pub fn stage_instruction(&self) -> Option<&str> {
        self.envelope().stage_instruction.as_deref()
    }

    /// Returns the generic payload, if this is one.
    #[must_use]
    pub fn as_generic(&self) -> Option<&GenericStageObject> {
        match self {
            Self::Generic(object) => Some(object),
            _ => None,
        }
    }

    /// Returns the request payload, if this is one.
    #[must_use]
    pub fn as_request(&self) -> Option<&RequestPayload> {
        match self {
            Self::Request(object) => Some(object),
            _ => None,
        }
    }

    /// Returns the sample creation payload, if this is one.
    #[must_use]
    pub fn as_create_sample(&self) -> Option<&CreateSampleAndReportPayload> {
        match self {
            Self::CreateSampleAndReport(object) => Some(object),
            _ => None,
        }
    }
}

impl From<GenericStageObject> for StagePayload {
    fn from(object: GenericStageObject) -> Self {
        Self::Generic(object)
    }
}

impl From<RequestPayload> for StagePayload {
    fn from(object: RequestPayload) -> Self {
        Self::Request(object)
    }
}

impl From<CreateSampleAndReportPayload> for StagePayload {
    fn from(object: CreateSampleAndReportPayload) -> Self {
        Self::CreateSampleAndReport(object)
    }
}
