//! Per-species sliding time windows
//!
//! Each species keeps an ordered deque of `(timestamp, value)` entries and a
//! cached running sum, so ingest and query are amortized O(1). The retained
//! window is `(latest - window_seconds, latest]`.

use outfall_core::{Permit, PipelineError, Reading};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// Window length for species without a permit rule
pub const DEFAULT_WINDOW_SECONDS: f64 = 300.0;

/// Aggregate over a species window
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct WindowAggregate {
    pub average: f64,
    pub sample_count: usize,
    pub latest_value: Option<f64>,
}

struct WindowState {
    entries: VecDeque<(f64, f64)>,
    sum: f64,
    window_seconds: f64,
}

impl WindowState {
    fn new(window_seconds: f64) -> Self {
        Self {
            entries: VecDeque::new(),
            sum: 0.0,
            window_seconds,
        }
    }

    fn latest_timestamp(&self) -> Option<f64> {
        self.entries.back().map(|(ts, _)| *ts)
    }

    fn insert(&mut self, timestamp: f64, value: f64) {
        match self.latest_timestamp() {
            Some(latest) if timestamp < latest => {
                let pos = self.entries.partition_point(|(ts, _)| *ts <= timestamp);
                self.entries.insert(pos, (timestamp, value));
            }
            _ => self.entries.push_back((timestamp, value)),
        }
        self.sum += value;
    }

    fn evict(&mut self) {
        let Some(latest) = self.latest_timestamp() else {
            return;
        };
        let cutoff = latest - self.window_seconds;
        while let Some(&(ts, value)) = self.entries.front() {
            if ts > cutoff {
                break;
            }
            self.entries.pop_front();
            self.sum -= value;
        }
        if self.entries.is_empty() {
            self.sum = 0.0;
        }
    }

    fn aggregate(&self) -> WindowAggregate {
        let count = self.entries.len();
        if count == 0 {
            return WindowAggregate::default();
        }
        WindowAggregate {
            average: self.sum / count as f64,
            sample_count: count,
            latest_value: self.entries.back().map(|(_, v)| *v),
        }
    }
}

/// Rolling-window aggregation keyed by species
///
/// Owned by a single shard; not shared across tasks.
pub struct WindowTracker {
    permit: Arc<Permit>,
    windows: HashMap<String, WindowState>,
    tolerance: f64,
    default_window: f64,
}

impl WindowTracker {
    /// Strict per-species ordering (tolerance 0)
    pub fn new(permit: Arc<Permit>) -> Self {
        Self {
            permit,
            windows: HashMap::new(),
            tolerance: 0.0,
            default_window: DEFAULT_WINDOW_SECONDS,
        }
    }

    /// Accept readings up to `seconds` older than the species' latest
    pub fn with_tolerance(mut self, seconds: f64) -> Self {
        self.tolerance = seconds.max(0.0);
        self
    }

    /// Window length for species the permit does not cover
    pub fn with_default_window(mut self, seconds: f64) -> Self {
        self.default_window = seconds;
        self
    }

    /// Add a reading to its species window and return the updated aggregate
    ///
    /// A rejected reading leaves the window untouched.
    pub fn ingest(&mut self, reading: &Reading) -> Result<WindowAggregate, PipelineError> {
        if let Some(latest) = self.latest_timestamp(reading.species()) {
            if reading.timestamp() < latest - self.tolerance {
                return Err(PipelineError::OutOfOrder {
                    species: reading.species().to_string(),
                    timestamp: reading.timestamp(),
                    latest,
                });
            }
        }

        let window_seconds = self
            .permit
            .get(reading.species())
            .map(|rule| rule.window_seconds)
            .unwrap_or(self.default_window);
        let state = self
            .windows
            .entry(reading.species().to_string())
            .or_insert_with(|| WindowState::new(window_seconds));

        state.insert(reading.timestamp(), reading.value());
        state.evict();
        Ok(state.aggregate())
    }

    /// Current aggregate; empty when the species has no data
    pub fn query(&self, species: &str) -> WindowAggregate {
        self.windows
            .get(species)
            .map(WindowState::aggregate)
            .unwrap_or_default()
    }

    /// Latest accepted timestamp for a species
    pub fn latest_timestamp(&self, species: &str) -> Option<f64> {
        self.windows
            .get(species)
            .and_then(WindowState::latest_timestamp)
    }

    /// Drop the species window
    pub fn reset(&mut self, species: &str) -> bool {
        self.windows.remove(species).is_some()
    }

    /// Number of species with a window
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use outfall_core::PermitRule;

    fn tracker(window: f64) -> WindowTracker {
        let permit = Permit::new().with_rule("SO4", PermitRule::new(250.0, window));
        WindowTracker::new(Arc::new(permit))
    }

    fn reading(species: &str, ts: f64, value: f64) -> Reading {
        Reading::new(species, ts, value).unwrap()
    }

    #[test]
    fn test_constant_stream_keeps_average() {
        let mut tracker = tracker(5.0);
        for t in 0..=4 {
            let agg = tracker.ingest(&reading("SO4", t as f64, 10.0)).unwrap();
            assert_eq!(agg.average, 10.0);
            assert_eq!(agg.sample_count, t as usize + 1);
        }

        // The window is half-open: at t=5 it spans (0, 5], so t=0 is gone
        let agg = tracker.ingest(&reading("SO4", 5.0, 10.0)).unwrap();
        assert_eq!(agg.average, 10.0);
        assert_eq!(agg.sample_count, 5);

        // t=1 falls out of (1, 6]
        let agg = tracker.ingest(&reading("SO4", 6.0, 10.0)).unwrap();
        assert_eq!(agg.average, 10.0);
        assert_eq!(agg.sample_count, 5);
    }

    #[test]
    fn test_average_follows_window() {
        let mut tracker = tracker(2.0);
        tracker.ingest(&reading("SO4", 0.0, 100.0)).unwrap();
        tracker.ingest(&reading("SO4", 1.0, 200.0)).unwrap();
        let agg = tracker.ingest(&reading("SO4", 2.0, 300.0)).unwrap();
        assert_eq!(agg.sample_count, 2);
        assert_eq!(agg.average, 250.0);
        assert_eq!(agg.latest_value, Some(300.0));
    }

    #[test]
    fn test_out_of_order_rejected_without_mutation() {
        let mut tracker = tracker(10.0);
        tracker.ingest(&reading("SO4", 5.0, 1.0)).unwrap();
        tracker.ingest(&reading("SO4", 6.0, 3.0)).unwrap();
        let before = tracker.query("SO4");

        let err = tracker.ingest(&reading("SO4", 4.0, 100.0)).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::OutOfOrder { latest, .. } if latest == 6.0
        ));
        assert_eq!(tracker.query("SO4"), before);
        assert_eq!(tracker.latest_timestamp("SO4"), Some(6.0));
    }

    #[test]
    fn test_equal_timestamp_accepted() {
        let mut tracker = tracker(10.0);
        tracker.ingest(&reading("SO4", 5.0, 1.0)).unwrap();
        let agg = tracker.ingest(&reading("SO4", 5.0, 3.0)).unwrap();
        assert_eq!(agg.sample_count, 2);
    }

    #[test]
    fn test_tolerance_inserts_in_order() {
        let mut tracker = tracker(10.0).with_tolerance(2.0);
        tracker.ingest(&reading("SO4", 5.0, 1.0)).unwrap();
        tracker.ingest(&reading("SO4", 8.0, 2.0)).unwrap();

        let agg = tracker.ingest(&reading("SO4", 7.0, 3.0)).unwrap();
        assert_eq!(agg.sample_count, 3);
        // Latest value still belongs to t=8
        assert_eq!(agg.latest_value, Some(2.0));
        assert_eq!(tracker.latest_timestamp("SO4"), Some(8.0));

        assert!(tracker.ingest(&reading("SO4", 5.5, 1.0)).is_err());
    }

    #[test]
    fn test_species_are_independent() {
        let mut tracker = tracker(10.0);
        tracker.ingest(&reading("SO4", 100.0, 1.0)).unwrap();
        // Older timestamp on another species is fine
        assert!(tracker.ingest(&reading("Ni", 1.0, 0.2)).is_ok());
        assert_eq!(tracker.len(), 2);
    }

    #[test]
    fn test_empty_query_is_defined() {
        let tracker = tracker(10.0);
        let agg = tracker.query("As");
        assert_eq!(agg.sample_count, 0);
        assert_eq!(agg.average, 0.0);
        assert_eq!(agg.latest_value, None);
    }

    #[test]
    fn test_reset_drops_window() {
        let mut tracker = tracker(10.0);
        tracker.ingest(&reading("SO4", 5.0, 1.0)).unwrap();
        assert!(tracker.reset("SO4"));
        assert_eq!(tracker.query("SO4").sample_count, 0);
        // Timeline restarts after reset
        assert!(tracker.ingest(&reading("SO4", 1.0, 1.0)).is_ok());
        assert!(!tracker.reset("Cu"));
    }

    #[test]
    fn test_unpermitted_species_uses_default_window() {
        let mut tracker = tracker(5.0).with_default_window(1.0);
        tracker.ingest(&reading("Cu", 0.0, 1.0)).unwrap();
        let agg = tracker.ingest(&reading("Cu", 1.0, 3.0)).unwrap();
        assert_eq!(agg.sample_count, 1);
        assert_eq!(agg.average, 3.0);
    }
}
