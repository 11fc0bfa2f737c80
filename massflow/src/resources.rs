//! MASS resource records carried through the pipeline.
//!
//! Only the fields the pipeline and its collaborators use are modelled; the
//! rest of a server response is ignored on deserialization.

use crate::codec::base64_serde;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A unit of scheduled work for one analysis system instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledAnalysis {
    /// Resource URL.
    pub url: String,
    /// Server-side identifier.
    pub id: String,
    /// URL of the analysis system instance the work is scheduled for.
    pub analysis_system_instance: String,
    /// URL of the sample to analyse.
    pub sample: String,
    /// When the analysis was scheduled.
    #[serde(default)]
    pub analysis_scheduled: Option<DateTime<Utc>>,
}

/// A sample stored on the service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Resource URL.
    pub url: String,
    /// Server-side identifier.
    pub id: String,
    /// Traffic light protocol level.
    #[serde(default)]
    pub tlp_level: u8,
    /// Sample tags.
    #[serde(default)]
    pub tags: Vec<String>,
    /// First time the sample was seen.
    #[serde(default)]
    pub first_seen: Option<DateTime<Utc>>,
    /// Every delivery of the sample.
    #[serde(default)]
    pub delivery_dates: Vec<DateTime<Utc>>,
    /// Analysis systems the sample was dispatched to.
    #[serde(default)]
    pub dispatched_to: Vec<String>,
    /// Kind specific features (hashes, domain, address, ...).
    #[serde(default)]
    pub unique_features: serde_json::Map<String, serde_json::Value>,
}

/// The submission endpoint a new sample goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleKind {
    /// A file upload.
    File,
    /// A URI.
    Uri,
    /// A domain name.
    Domain,
    /// An IPv4 or IPv6 address.
    Ip,
}

impl SampleKind {
    /// The creation endpoint relative to the API base URL.
    #[must_use]
    pub fn endpoint(self) -> &'static str {
        match self {
            Self::File => "sample/submit_file/",
            Self::Uri => "sample/submit_uri/",
            Self::Domain => "sample/submit_domain/",
            Self::Ip => "sample/submit_ip/",
        }
    }
}

/// A sample that a stage wants created on the service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleSubmission {
    /// Sample URI.
    #[serde(default)]
    pub uri: Option<String>,
    /// Sample domain.
    #[serde(default)]
    pub domain: Option<String>,
    /// Port of the URI or address.
    #[serde(default)]
    pub port: Option<u16>,
    /// IPv4 address.
    #[serde(default)]
    pub ipv4: Option<String>,
    /// IPv6 address.
    #[serde(default)]
    pub ipv6: Option<String>,
    /// File name of a file sample.
    #[serde(default)]
    pub filename: Option<String>,
    /// File content of a file sample.
    #[serde(default, with = "base64_serde::optional_bytes")]
    pub file: Option<Vec<u8>>,
    /// Traffic light protocol level.
    #[serde(default)]
    pub tlp_level: u8,
    /// Sample tags.
    #[serde(default)]
    pub tags: Vec<String>,
}

impl SampleSubmission {
    /// Decides which kind of sample this submission creates.
    ///
    /// Files win over URIs, URIs over domains, domains over addresses.
    #[must_use]
    pub fn kind(&self) -> Option<SampleKind> {
        if self.file.is_some() {
            Some(SampleKind::File)
        } else if self.uri.is_some() {
            Some(SampleKind::Uri)
        } else if self.domain.is_some() {
            Some(SampleKind::Domain)
        } else if self.ipv4.is_some() || self.ipv6.is_some() {
            Some(SampleKind::Ip)
        } else {
            None
        }
    }

    /// The IP address of the submission, preferring IPv4.
    #[must_use]
    pub fn ip_address(&self) -> Option<&str> {
        self.ipv4.as_deref().or(self.ipv6.as_deref())
    }
}
