//! Metric and label cardinality report.
//!
//! Counts samples per metric name and distinct values per label, to find the
//! labels worth aggregating away.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::io::BufRead;
use std::path::Path;

use metric_gate_common::{ParseError, Sample, parse_line};
use thiserror::Error;

/// Labels with at most this many distinct values have them listed.
const MAX_LISTED_VALUES: usize = 5;

#[derive(Debug, Error)]
pub enum AnalyzeError {
    #[error("Error opening file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Error parsing file: {0}")]
    Parse(#[from] ParseError),
}

/// Cardinality of one metric name.
#[derive(Debug, Default, Clone)]
pub struct MetricStats {
    /// Number of samples seen.
    pub count: usize,
    /// Distinct values per label name.
    pub labels: BTreeMap<String, BTreeSet<String>>,
}

/// Accumulates samples into a cardinality report.
#[derive(Debug, Default)]
pub struct Analyzer {
    metrics: HashMap<String, MetricStats>,
}

impl Analyzer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one sample.
    pub fn add(&mut self, sample: &Sample) {
        let stats = self.metrics.entry(sample.name.clone()).or_default();
        stats.count += 1;
        for (name, value) in &sample.labels {
            stats
                .labels
                .entry(name.clone())
                .or_default()
                .insert(value.clone());
        }
    }

    /// Parse and record one line; comments and blanks are ignored.
    pub fn add_line(&mut self, line: &str) -> Result<(), ParseError> {
        if let Some(sample) = parse_line(line)? {
            self.add(&sample);
        }
        Ok(())
    }

    /// Stats of one metric name.
    pub fn metric(&self, name: &str) -> Option<&MetricStats> {
        self.metrics.get(name)
    }

    pub fn finish(self) -> Report {
        Report {
            metrics: self.metrics,
        }
    }
}

/// Analyze a complete exposition payload.
pub fn analyze_str(payload: &str) -> Result<Report, ParseError> {
    let mut analyzer = Analyzer::new();
    for line in payload.lines() {
        analyzer.add_line(line)?;
    }
    Ok(analyzer.finish())
}

/// Analyze a reader line by line.
pub fn analyze_reader<R: BufRead>(reader: R) -> Result<Report, AnalyzeError> {
    let mut analyzer = Analyzer::new();
    for line in reader.lines() {
        analyzer.add_line(&line?)?;
    }
    Ok(analyzer.finish())
}

/// Analyze an exposition file.
pub fn analyze_file(path: impl AsRef<Path>) -> Result<Report, AnalyzeError> {
    let file = std::fs::File::open(path)?;
    analyze_reader(std::io::BufReader::new(file))
}

/// Cardinality report, rendered with [`fmt::Display`].
///
/// Metrics are listed by sample count, labels by distinct value count, both
/// descending.
#[derive(Debug, Default)]
pub struct Report {
    metrics: HashMap<String, MetricStats>,
}

impl Report {
    pub fn metric(&self, name: &str) -> Option<&MetricStats> {
        self.metrics.get(name)
    }

    /// Number of distinct metric names.
    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut metrics: Vec<_> = self.metrics.iter().collect();
        metrics.sort_by(|a, b| b.1.count.cmp(&a.1.count).then_with(|| a.0.cmp(b.0)));

        for (name, stats) in metrics {
            write!(f, "\n{} {}\n", stats.count, name)?;

            let mut labels: Vec<_> = stats.labels.iter().collect();
            labels.sort_by(|a, b| b.1.len().cmp(&a.1.len()).then_with(|| a.0.cmp(b.0)));

            for (label, values) in labels {
                write!(f, "  {} {}", values.len(), label)?;
                if values.len() <= MAX_LISTED_VALUES {
                    let listed: Vec<&str> = values.iter().map(String::as_str).collect();
                    write!(f, " [{}]", listed.join(", "))?;
                }
                writeln!(f)?;
            }
        }
        Ok(())
    }
}
