//! Test assertions for payload reports.

use crate::payload::ReportFields;

/// Asserts that the report is not marked failed.
pub fn assert_report_succeeded(report: &ReportFields) {
    assert!(
        !report.failed,
        "Expected a successful report, got error: {:?}",
        report.error_message
    );
}

/// Asserts that the report is marked failed with a message containing
/// `needle`.
pub fn assert_report_failed(report: &ReportFields, needle: &str) {
    assert!(report.failed, "Expected a failed report");
    let message = report.error_message.as_deref().unwrap_or_default();
    assert!(
        message.contains(needle),
        "Expected error message to contain '{needle}', got '{message}'"
    );
}

/// Asserts that the report carries exactly `expected` tags, in order.
pub fn assert_report_tags(report: &ReportFields, expected: &[&str]) {
    let actual: Vec<&str> = report.tags.iter().map(String::as_str).collect();
    assert_eq!(actual, expected, "Unexpected report tags");
}

/// Asserts that the report has a JSON report object named `name`.
pub fn assert_report_has_json(report: &ReportFields, name: &str) {
    assert!(
        report.json_report_objects.contains_key(name),
        "Expected JSON report '{}', got keys: {:?}",
        name,
        report.json_report_objects.keys().collect::<Vec<_>>()
    );
}
