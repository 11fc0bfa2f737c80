//! Contracts for the services a frame talks to.
//!
//! The frame never calls the MASS service itself. Default stages in
//! [`crate::stages::defaults`] drive these traits; [`crate::client`] provides
//! HTTP implementations and [`crate::testing`] in-memory ones.

use crate::errors::CollaboratorError;
use crate::payload::ReportFields;
use crate::resources::{Sample, SampleSubmission, ScheduledAnalysis};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, warn};

/// Default pause of a polling source after a round with nothing to deliver.
pub const DEFAULT_IDLE_INTERVAL: Duration = Duration::from_secs(5);

/// One unit of scheduled work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    /// The scheduled analysis.
    pub request: ScheduledAnalysis,
    /// The sample to analyse.
    pub sample: Sample,
}

/// Source of scheduled analysis work.
pub trait WorkSource: Send + Sync {
    /// Delivers available work items to `on_work`.
    ///
    /// Returning `true` from `on_work` acknowledges the item; `false` leaves
    /// it for redelivery on a later call. Blocks for at most one delivery
    /// round, so callers loop.
    fn consume(
        &self,
        on_work: &mut dyn FnMut(WorkItem) -> bool,
    ) -> Result<(), CollaboratorError>;
}

/// Destination of finished reports.
#[cfg_attr(test, mockall::automock)]
pub trait ReportSink: Send + Sync {
    /// Submits the report for a scheduled analysis.
    fn submit(
        &self,
        request: &ScheduledAnalysis,
        report: &ReportFields,
    ) -> Result<(), CollaboratorError>;
}

/// Creates samples and reports that were not requested by the service.
#[cfg_attr(test, mockall::automock)]
pub trait SampleSink: Send + Sync {
    /// Creates a sample.
    fn create_sample(&self, sample: &SampleSubmission) -> Result<Sample, CollaboratorError>;

    /// Attaches a report to a sample without a scheduled analysis.
    fn submit_report_without_request(
        &self,
        sample: &Sample,
        report: &ReportFields,
    ) -> Result<(), CollaboratorError>;
}

/// Lists pending work for a [`PollingWorkSource`].
#[cfg_attr(test, mockall::automock)]
pub trait RequestFeed: Send + Sync {
    /// Every analysis currently scheduled.
    fn pending(&self) -> Result<Vec<ScheduledAnalysis>, CollaboratorError>;

    /// The sample of a scheduled analysis.
    fn sample(&self, request: &ScheduledAnalysis) -> Result<Sample, CollaboratorError>;
}

/// A [`WorkSource`] that polls a [`RequestFeed`].
///
/// Scheduled analyses stay listed until their report arrives, so acknowledged
/// ids are remembered and skipped while the feed still lists them.
#[derive(Debug)]
pub struct PollingWorkSource<F> {
    feed: F,
    acked: Mutex<HashSet<String>>,
    idle_interval: Duration,
}

impl<F: RequestFeed> PollingWorkSource<F> {
    /// Creates a source over `feed`.
    #[must_use]
    pub fn new(feed: F) -> Self {
        Self {
            feed,
            acked: Mutex::new(HashSet::new()),
            idle_interval: DEFAULT_IDLE_INTERVAL,
        }
    }

    /// Sets the pause after a round with nothing to deliver.
    #[must_use]
    pub fn with_idle_interval(mut self, interval: Duration) -> Self {
        self.idle_interval = interval;
        self
    }

    /// The underlying feed.
    #[must_use]
    pub fn feed(&self) -> &F {
        &self.feed
    }

    /// Number of acknowledged analyses still listed by the feed.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.acked.lock().len()
    }
}

impl<F: RequestFeed> WorkSource for PollingWorkSource<F> {
    fn consume(
        &self,
        on_work: &mut dyn FnMut(WorkItem) -> bool,
    ) -> Result<(), CollaboratorError> {
        let pending = self.feed.pending()?;

        let fresh: Vec<ScheduledAnalysis> = {
            let mut acked = self.acked.lock();
            acked.retain(|id| pending.iter().any(|request| &request.id == id));
            pending
                .into_iter()
                .filter(|request| !acked.contains(&request.id))
                .collect()
        };

        let mut delivered = 0usize;
        for request in fresh {
            let sample = match self.feed.sample(&request) {
                Ok(sample) => sample,
                Err(e) => {
                    warn!(request = %request.id, error = %e, "Skipping request without sample");
                    continue;
                }
            };

            let id = request.id.clone();
            if on_work(WorkItem { request, sample }) {
                self.acked.lock().insert(id);
                delivered += 1;
            }
        }

        debug!(delivered, "Polling round finished");
        if delivered == 0 {
            std::thread::sleep(self.idle_interval);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::always;
    use pretty_assertions::assert_eq;

    fn analysis(id: &str) -> ScheduledAnalysis {
        ScheduledAnalysis {
            url: format!("http://mass/api/scheduled_analysis/{id}/"),
            id: id.to_string(),
            analysis_system_instance: "http://mass/api/analysis_system_instance/x/".to_string(),
            sample: format!("http://mass/api/sample/{id}/"),
            analysis_scheduled: None,
        }
    }

    fn sample_for(request: &ScheduledAnalysis) -> Sample {
        Sample {
            url: request.sample.clone(),
            id: request.id.clone(),
            tlp_level: 0,
            tags: Vec::new(),
            first_seen: None,
            delivery_dates: Vec::new(),
            dispatched_to: Vec::new(),
            unique_features: serde_json::Map::new(),
        }
    }

    fn feed_listing(ids: &'static [&'static str]) -> MockRequestFeed {
        let mut feed = MockRequestFeed::new();
        feed.expect_pending()
            .returning(move || Ok(ids.iter().map(|id| analysis(id)).collect()));
        feed.expect_sample()
            .with(always())
            .returning(|request| Ok(sample_for(request)));
        feed
    }

    #[test]
    fn test_acked_items_are_not_redelivered() {
        let source = PollingWorkSource::new(feed_listing(&["1", "2"]))
            .with_idle_interval(Duration::from_millis(1));

        let mut seen = Vec::new();
        source
            .consume(&mut |item| {
                seen.push(item.request.id);
                true
            })
            .unwrap();
        source
            .consume(&mut |item| {
                seen.push(item.request.id);
                true
            })
            .unwrap();

        assert_eq!(seen, vec!["1", "2"]);
        assert_eq!(source.in_flight(), 2);
    }

    #[test]
    fn test_nacked_items_are_redelivered() {
        let source = PollingWorkSource::new(feed_listing(&["1"]))
            .with_idle_interval(Duration::from_millis(1));

        let mut calls = 0;
        for _ in 0..3 {
            source
                .consume(&mut |_| {
                    calls += 1;
                    false
                })
                .unwrap();
        }
        assert_eq!(calls, 3);
        assert_eq!(source.in_flight(), 0);
    }

    #[test]
    fn test_reported_items_leave_the_ledger() {
        let mut feed = MockRequestFeed::new();
        let mut rounds = 0;
        feed.expect_pending().returning(move || {
            rounds += 1;
            if rounds == 1 {
                Ok(vec![analysis("1")])
            } else {
                Ok(Vec::new())
            }
        });
        feed.expect_sample().returning(|request| Ok(sample_for(request)));

        let source = PollingWorkSource::new(feed).with_idle_interval(Duration::from_millis(1));
        source.consume(&mut |_| true).unwrap();
        assert_eq!(source.in_flight(), 1);

        source.consume(&mut |_| true).unwrap();
        assert_eq!(source.in_flight(), 0);
    }

    #[test]
    fn test_feed_errors_propagate() {
        let mut feed = MockRequestFeed::new();
        feed.expect_pending()
            .returning(|| Err(CollaboratorError::Rejected("down".to_string())));

        let source = PollingWorkSource::new(feed);
        let err = source.consume(&mut |_| true).unwrap_err();
        assert_eq!(err.to_string(), "down");
    }

    #[test]
    fn test_missing_sample_skips_item() {
        let mut feed = MockRequestFeed::new();
        feed.expect_pending()
            .returning(|| Ok(vec![analysis("1"), analysis("2")]));
        feed.expect_sample().returning(|request| {
            if request.id == "1" {
                Err(CollaboratorError::Rejected("gone".to_string()))
            } else {
                Ok(sample_for(request))
            }
        });

        let source = PollingWorkSource::new(feed).with_idle_interval(Duration::from_millis(1));
        let mut seen = Vec::new();
        source
            .consume(&mut |item| {
                seen.push(item.request.id);
                true
            })
            .unwrap();
        assert_eq!(seen, vec!["2"]);
    }
}
