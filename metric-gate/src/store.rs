//! Per-cycle aggregation of relabeled samples.
//!
//! An [`AggregationStore`] lives for exactly one scrape cycle and is shared by
//! every target task of that cycle. Once the cycle completes it is frozen
//! into an immutable [`Series`] and published inside a [`Snapshot`].

use std::collections::HashMap;

use parking_lot::Mutex;

/// Running sum for one (metric name, canonical key) pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AggregatedSample {
    /// Sum of every merged value.
    pub value: f64,
    /// First explicit timestamp seen, if any.
    pub timestamp_ms: Option<i64>,
}

/// Metric name -> canonical label key -> aggregated sample.
pub type SeriesMap = HashMap<String, HashMap<String, AggregatedSample>>;

/// Thread-safe sum-merge store for one subset and one cycle.
#[derive(Debug, Default)]
pub struct AggregationStore {
    series: Mutex<SeriesMap>,
}

impl AggregationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one sample.
    ///
    /// The lock is held only for the lookup-or-insert of this single key.
    pub fn add(&self, name: String, key: String, value: f64, timestamp_ms: Option<i64>) {
        let mut series = self.series.lock();
        series
            .entry(name)
            .or_default()
            .entry(key)
            .and_modify(|existing| {
                existing.value += value;
                if existing.timestamp_ms.is_none() {
                    existing.timestamp_ms = timestamp_ms;
                }
            })
            .or_insert(AggregatedSample {
                value,
                timestamp_ms,
            });
    }

    /// Move the merged series out, leaving the store empty.
    pub fn take(&self) -> Series {
        Series {
            data: std::mem::take(&mut *self.series.lock()),
        }
    }
}

/// Immutable aggregation result of one subset.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Series {
    data: SeriesMap,
}

impl Series {
    /// Look up one aggregated sample.
    pub fn get(&self, name: &str, key: &str) -> Option<&AggregatedSample> {
        self.data.get(name)?.get(key)
    }

    /// Iterate over `(metric name, canonical key, sample)`.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str, &AggregatedSample)> {
        self.data.iter().flat_map(|(name, by_key)| {
            by_key
                .iter()
                .map(move |(key, sample)| (name.as_str(), key.as_str(), sample))
        })
    }

    /// Number of distinct series.
    pub fn len(&self) -> usize {
        self.data.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Number of distinct metric names.
    pub fn metric_count(&self) -> usize {
        self.data.len()
    }
}

/// The published result of one completed scrape cycle.
#[derive(Debug)]
pub struct Snapshot {
    subsets: HashMap<String, Series>,
    completed_at_ms: i64,
}

impl Snapshot {
    pub fn new(subsets: HashMap<String, Series>, completed_at_ms: i64) -> Self {
        Self {
            subsets,
            completed_at_ms,
        }
    }

    /// Series of a subset, if it was part of the cycle.
    pub fn subset(&self, name: &str) -> Option<&Series> {
        self.subsets.get(name)
    }

    /// Cycle completion time in Unix epoch milliseconds.
    pub fn completed_at_ms(&self) -> i64 {
        self.completed_at_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_add_new_series() {
        let store = AggregationStore::new();
        store.add("m".into(), "{}".into(), 10.0, None);

        let series = store.take();
        assert_eq!(
            series.get("m", "{}"),
            Some(&AggregatedSample {
                value: 10.0,
                timestamp_ms: None
            })
        );
    }

    #[test]
    fn test_add_sums_values() {
        let store = AggregationStore::new();
        store.add("m".into(), r#"{a="1"}"#.into(), 1.0, None);
        store.add("m".into(), r#"{a="1"}"#.into(), 2.0, None);
        store.add("m".into(), r#"{a="2"}"#.into(), 5.0, None);

        let series = store.take();
        assert_eq!(series.get("m", r#"{a="1"}"#).unwrap().value, 3.0);
        assert_eq!(series.get("m", r#"{a="2"}"#).unwrap().value, 5.0);
        assert_eq!(series.len(), 2);
        assert_eq!(series.metric_count(), 1);
    }

    #[test]
    fn test_first_explicit_timestamp_wins() {
        let store = AggregationStore::new();
        store.add("m".into(), "{}".into(), 1.0, None);
        store.add("m".into(), "{}".into(), 1.0, Some(100));
        store.add("m".into(), "{}".into(), 1.0, Some(200));

        let series = store.take();
        assert_eq!(
            series.get("m", "{}"),
            Some(&AggregatedSample {
                value: 3.0,
                timestamp_ms: Some(100)
            })
        );
    }

    #[test]
    fn test_merge_is_commutative() {
        let a = ("m".to_string(), "{}".to_string(), 1.5, Some(7));
        let b = ("m".to_string(), "{}".to_string(), 2.25, None);

        let ab = AggregationStore::new();
        ab.add(a.0.clone(), a.1.clone(), a.2, a.3);
        ab.add(b.0.clone(), b.1.clone(), b.2, b.3);

        let ba = AggregationStore::new();
        ba.add(b.0, b.1, b.2, b.3);
        ba.add(a.0, a.1, a.2, a.3);

        assert_eq!(ab.take(), ba.take());
    }

    #[test]
    fn test_take_empties_store() {
        let store = AggregationStore::new();
        store.add("m".into(), "{}".into(), 1.0, None);

        assert_eq!(store.take().len(), 1);
        assert!(store.take().is_empty());
    }

    #[test]
    fn test_concurrent_adds() {
        let store = Arc::new(AggregationStore::new());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for i in 0..1000 {
                        store.add("m".into(), format!("{{i=\"{}\"}}", i % 10), 1.0, None);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let series = store.take();
        assert_eq!(series.len(), 10);
        for (_, _, sample) in series.iter() {
            assert_eq!(sample.value, 800.0);
        }
    }

    #[test]
    fn test_snapshot_lookup() {
        let store = AggregationStore::new();
        store.add("m".into(), "{}".into(), 1.0, None);
        let snapshot = Snapshot::new(HashMap::from([("default".to_string(), store.take())]), 42);

        assert_eq!(snapshot.completed_at_ms(), 42);
        assert!(snapshot.subset("default").is_some());
        assert!(snapshot.subset("other").is_none());
    }
}
