//! Fixtures for tests that need resources or payloads.

use crate::payload::StagePayload;
use crate::resources::{Sample, ScheduledAnalysis};

/// A scheduled analysis with the given id.
#[must_use]
pub fn scheduled_analysis_fixture(id: &str) -> ScheduledAnalysis {
    ScheduledAnalysis {
        url: format!("http://localhost:8000/api/scheduled_analysis/{id}/"),
        id: id.to_string(),
        analysis_system_instance: "http://localhost:8000/api/analysis_system_instance/test/"
            .to_string(),
        sample: format!("http://localhost:8000/api/sample/{id}/"),
        analysis_scheduled: None,
    }
}

/// A sample with the given id.
#[must_use]
pub fn sample_fixture(id: &str) -> Sample {
    Sample {
        url: format!("http://localhost:8000/api/sample/{id}/"),
        id: id.to_string(),
        tlp_level: 0,
        tags: Vec::new(),
        first_seen: None,
        delivery_dates: Vec::new(),
        dispatched_to: Vec::new(),
        unique_features: serde_json::Map::new(),
    }
}

/// A generic payload carrying `tag` as its `seq` field.
#[must_use]
pub fn tagged_payload(tag: u64) -> StagePayload {
    let mut payload = StagePayload::generic();
    if let StagePayload::Generic(object) = &mut payload {
        object.data.insert("seq".to_string(), serde_json::json!(tag));
    }
    payload
}

/// Reads the tag written by [`tagged_payload`].
#[must_use]
pub fn payload_tag(payload: &StagePayload) -> Option<u64> {
    payload.as_generic()?.data.get("seq")?.as_u64()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tagged_payload() {
        assert_eq!(payload_tag(&tagged_payload(3)), Some(3));
        assert_eq!(payload_tag(&StagePayload::generic()), None);
    }

    #[test]
    fn test_resource_fixtures_link_up() {
        let analysis = scheduled_analysis_fixture("9");
        assert_eq!(analysis.sample, sample_fixture("9").url);
    }
}
