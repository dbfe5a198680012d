//! Configuration for the aggregation proxy.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use metric_gate_common::{LoggingConfig, load_config, parse_config};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::relabel::{RelabelConfig, RelabelError, RelabelPipeline, Subset};

/// Name of the mandatory subset served by `/metrics`.
pub const DEFAULT_SUBSET: &str = "metric_relabel_configs";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Load(#[from] metric_gate_common::Error),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Invalid relabel rule in subset '{subset}': {source}")]
    Relabel {
        subset: String,
        #[source]
        source: RelabelError,
    },
}

/// Complete proxy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    /// Upstream scrape settings.
    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// HTTP server settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Relabel rules per subset name.
    #[serde(default = "default_relabel")]
    pub relabel: BTreeMap<String, Vec<RelabelConfig>>,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_relabel() -> BTreeMap<String, Vec<RelabelConfig>> {
    BTreeMap::from([(DEFAULT_SUBSET.to_string(), Vec::new())])
}

/// Where and how to scrape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Source URL to get metrics from (default: "http://localhost:10254/metrics").
    #[serde(default = "default_url")]
    pub url: String,

    /// Scrape every address the upstream hostname resolves to.
    #[serde(default)]
    pub resolve: bool,

    /// Per-target fetch timeout in seconds (default: 10).
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_url() -> String {
    "http://localhost:10254/metrics".to_string()
}

fn default_timeout() -> u64 {
    10
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            resolve: false,
            timeout_secs: default_timeout(),
        }
    }
}

impl UpstreamConfig {
    /// Parse the upstream URL, assuming `http://` when no scheme is given.
    pub fn parsed_url(&self) -> Result<Url, ConfigError> {
        let raw = if self.url.contains("://") {
            self.url.clone()
        } else {
            format!("http://{}", self.url)
        };

        let url = Url::parse(&raw)
            .map_err(|e| ConfigError::Validation(format!("Invalid upstream URL '{}': {}", raw, e)))?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::Validation(format!(
                "Unsupported upstream scheme: {}",
                url.scheme()
            )));
        }
        if url.host_str().is_none() {
            return Err(ConfigError::Validation(format!(
                "Upstream URL has no host: {}",
                raw
            )));
        }

        Ok(url)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on (default: "0.0.0.0:8080").
    #[serde(default = "default_listen")]
    pub listen: String,
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

impl GateConfig {
    /// Load configuration from a JSON5 file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: GateConfig = load_config(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a JSON5 string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: GateConfig = parse_config(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.upstream.parsed_url()?;

        if self.upstream.timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "timeout_secs must be > 0".to_string(),
            ));
        }

        if self.server.listen.parse::<std::net::SocketAddr>().is_err() {
            return Err(ConfigError::Validation(format!(
                "Invalid listen address: {}",
                self.server.listen
            )));
        }

        if !self.relabel.contains_key(DEFAULT_SUBSET) {
            return Err(ConfigError::Validation(format!(
                "relabel must define the '{}' subset",
                DEFAULT_SUBSET
            )));
        }

        if let Some(name) = self.relabel.keys().find(|name| !is_valid_subset_name(name)) {
            return Err(ConfigError::Validation(format!(
                "Invalid subset name: '{}'",
                name
            )));
        }

        self.compile_subsets().map(|_| ())
    }

    /// Compile every subset's relabel rules.
    ///
    /// The default subset comes first.
    pub fn compile_subsets(&self) -> Result<Vec<Subset>, ConfigError> {
        let mut subsets = Vec::with_capacity(self.relabel.len());
        for (name, rules) in &self.relabel {
            let pipeline = RelabelPipeline::compile(rules).map_err(|e| ConfigError::Relabel {
                subset: name.clone(),
                source: e,
            })?;
            subsets.push(Subset::new(name.clone(), pipeline));
        }
        subsets.sort_by_key(|s| s.name != DEFAULT_SUBSET);
        Ok(subsets)
    }

    /// Prepend rules that aggregate away the given labels in the default subset.
    pub fn drop_labels(&mut self, labels: &[String]) {
        let rules = labels
            .iter()
            .map(|label| RelabelConfig::label_drop(regex::escape(label)));
        self.prepend_default_rules(rules);
    }

    /// Prepend a rule that drops metrics whose name matches `regex`.
    pub fn drop_metrics_matching(&mut self, regex: &str) {
        self.prepend_default_rules(std::iter::once(RelabelConfig::drop_metrics(regex)));
    }

    fn prepend_default_rules(&mut self, rules: impl IntoIterator<Item = RelabelConfig>) {
        let default = self.relabel.entry(DEFAULT_SUBSET.to_string()).or_default();
        let existing = std::mem::take(default);
        default.extend(rules);
        default.extend(existing);
    }
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            upstream: UpstreamConfig::default(),
            server: ServerConfig::default(),
            relabel: default_relabel(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Subset names become URL path segments.
fn is_valid_subset_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relabel::Action;
    use std::io::Write;

    #[test]
    fn test_parse_minimal_config() {
        let config = GateConfig::parse("{}").unwrap();

        assert_eq!(config.upstream.url, "http://localhost:10254/metrics");
        assert!(!config.upstream.resolve);
        assert_eq!(config.upstream.timeout(), Duration::from_secs(10));
        assert_eq!(config.server.listen, "0.0.0.0:8080");
        assert_eq!(config.relabel.len(), 1);
        assert!(config.relabel[DEFAULT_SUBSET].is_empty());
    }

    #[test]
    fn test_parse_full_config() {
        let json = r#"{
            upstream: {
                url: "http://ingress-nginx-metrics.ingress:10254/metrics?x=1",
                resolve: true,
                timeout_secs: 3
            },
            server: { listen: "127.0.0.1:9091" },
            relabel: {
                metric_relabel_configs: [
                    { action: "labeldrop", regex: "controller_pod|canary" },
                    { action: "drop", source_labels: ["__name__"], regex: "go_.*" }
                ],
                nginx: [
                    { action: "keep", source_labels: ["__name__"], regex: "nginx_.*" }
                ]
            },
            logging: { level: "debug", format: "json" }
        }"#;

        let config = GateConfig::parse(json).unwrap();

        assert!(config.upstream.resolve);
        assert_eq!(config.upstream.timeout_secs, 3);
        assert_eq!(config.server.listen, "127.0.0.1:9091");
        assert_eq!(config.relabel[DEFAULT_SUBSET].len(), 2);
        assert_eq!(config.relabel["nginx"][0].action, Action::Keep);
        assert_eq!(config.logging.level, "debug");

        let subsets = config.compile_subsets().unwrap();
        assert_eq!(subsets[0].name, DEFAULT_SUBSET);
        assert_eq!(subsets[0].pipeline.len(), 2);
        assert_eq!(subsets[1].name, "nginx");
    }

    #[test]
    fn test_default_subset_sorted_first() {
        let json = r#"{ relabel: { a: [], metric_relabel_configs: [], zz: [] } }"#;
        let subsets = GateConfig::parse(json).unwrap().compile_subsets().unwrap();
        let names: Vec<_> = subsets.iter().map(|s| s.name.as_str()).collect();

        assert_eq!(names, vec![DEFAULT_SUBSET, "a", "zz"]);
    }

    #[test]
    fn test_upstream_without_scheme() {
        let upstream = UpstreamConfig {
            url: "localhost:9100/metrics".to_string(),
            ..Default::default()
        };
        let url = upstream.parsed_url().unwrap();

        assert_eq!(url.as_str(), "http://localhost:9100/metrics");
    }

    #[test]
    fn test_validate_missing_default_subset() {
        let json = r#"{ relabel: { other: [] } }"#;
        let err = GateConfig::parse(json).unwrap_err();

        assert!(err.to_string().contains(DEFAULT_SUBSET));
    }

    #[test]
    fn test_validate_invalid_rule() {
        let json = r#"{
            relabel: { metric_relabel_configs: [ { action: "labeldrop", regex: "(" } ] }
        }"#;
        let err = GateConfig::parse(json).unwrap_err();

        assert!(matches!(err, ConfigError::Relabel { .. }));
    }

    #[test]
    fn test_validate_unknown_action() {
        let json = r#"{
            relabel: { metric_relabel_configs: [ { action: "hashmod" } ] }
        }"#;

        assert!(matches!(GateConfig::parse(json), Err(ConfigError::Load(_))));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "{{ upstream: {{ url: 'metrics.svc:9100/metrics', resolve: true }}, \
             relabel: {{ metric_relabel_configs: [], per_pod: [] }} }}"
        )
        .unwrap();

        let config = GateConfig::load_from_file(file.path()).unwrap();
        assert!(config.upstream.resolve);
        assert_eq!(
            config.upstream.parsed_url().unwrap().as_str(),
            "http://metrics.svc:9100/metrics"
        );
        assert_eq!(config.compile_subsets().unwrap().len(), 2);
    }

    #[test]
    fn test_load_from_file_validates() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "{{ relabel: {{ other: [] }} }}").unwrap();

        let err = GateConfig::load_from_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn test_load_missing_file() {
        let err = GateConfig::load_from_file("/nonexistent/metric-gate.json5").unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }

    #[test]
    fn test_validate_invalid_listen() {
        let json = r#"{ server: { listen: "not-an-address" } }"#;
        let err = GateConfig::parse(json).unwrap_err();

        assert!(err.to_string().contains("Invalid listen address"));
    }

    #[test]
    fn test_validate_zero_timeout() {
        let json = r#"{ upstream: { timeout_secs: 0 } }"#;
        assert!(GateConfig::parse(json).is_err());
    }

    #[test]
    fn test_validate_bad_scheme() {
        let json = r#"{ upstream: { url: "ftp://example.com/metrics" } }"#;
        assert!(GateConfig::parse(json).is_err());
    }

    #[test]
    fn test_validate_bad_subset_name() {
        let json = r#"{ relabel: { metric_relabel_configs: [], "a/b": [] } }"#;
        let err = GateConfig::parse(json).unwrap_err();

        assert!(err.to_string().contains("Invalid subset name"));
    }

    #[test]
    fn test_cli_shorthands_prepend_rules() {
        let json = r#"{
            relabel: { metric_relabel_configs: [ { action: "labeldrop", regex: "pod" } ] }
        }"#;
        let mut config = GateConfig::parse(json).unwrap();
        config.drop_labels(&["code".to_string(), "le.x".to_string()]);
        config.drop_metrics_matching("go_.*");

        let rules = &config.relabel[DEFAULT_SUBSET];
        assert_eq!(rules.len(), 4);
        assert_eq!(rules[0].action, Action::Drop);
        assert_eq!(rules[0].regex, "go_.*");
        assert_eq!(rules[1].regex, "code");
        assert_eq!(rules[2].regex, "le\\.x");
        assert_eq!(rules[3].regex, "pod");
        assert!(config.validate().is_ok());
    }
}
