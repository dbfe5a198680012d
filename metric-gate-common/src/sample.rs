//! Sample data model shared by the parser, the aggregator and the analyzer.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Label set of a sample, ordered by label name.
///
/// A label with an empty value is treated as absent by
/// [`canonical_key`](crate::labels::canonical_key) but may still be present here.
pub type Labels = BTreeMap<String, String>;

/// Reserved label carrying the metric name during relabeling.
pub const METRIC_NAME_LABEL: &str = "__name__";

/// One observation parsed from an exposition line.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// Metric name.
    pub name: String,

    /// Labels attached to the sample.
    pub labels: Labels,

    /// Sample value.
    pub value: f64,

    /// Explicit timestamp in Unix epoch milliseconds, if the line carried one.
    pub timestamp_ms: Option<i64>,
}

impl Sample {
    /// Create a sample without labels or timestamp.
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            labels: Labels::new(),
            value,
            timestamp_ms: None,
        }
    }

    /// Add a label to this sample.
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Set an explicit timestamp.
    pub fn with_timestamp(mut self, timestamp_ms: i64) -> Self {
        self.timestamp_ms = Some(timestamp_ms);
        self
    }
}

/// Get current Unix timestamp in milliseconds.
pub fn current_timestamp_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
