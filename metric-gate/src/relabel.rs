//! Prometheus-style relabeling applied to every scraped sample.
//!
//! Rules follow the shape of Prometheus `metric_relabel_configs` and are
//! evaluated in order against a label set that carries the metric name as
//! `__name__`. Each configured subset owns one [`RelabelPipeline`].

use metric_gate_common::{Labels, METRIC_NAME_LABEL, Sample, canonical_key};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while compiling relabel rules.
#[derive(Debug, Error)]
pub enum RelabelError {
    #[error("invalid regex '{pattern}': {source}")]
    InvalidRegex {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("action '{0}' requires a target_label")]
    MissingTargetLabel(&'static str),

    #[error("invalid target_label '{0}'")]
    InvalidLabelName(String),
}

/// Relabel action.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Write the regex replacement into `target_label`.
    #[default]
    Replace,
    /// Discard samples whose source value does not match.
    Keep,
    /// Discard samples whose source value matches.
    Drop,
    /// Keep samples whose source value equals the `target_label` value.
    KeepEqual,
    /// Drop samples whose source value equals the `target_label` value.
    DropEqual,
    /// Copy labels whose name matches to the name given by the replacement.
    LabelMap,
    /// Remove labels whose name matches.
    LabelDrop,
    /// Remove labels whose name does not match.
    LabelKeep,
    /// Write the lowercased source value into `target_label`.
    Lowercase,
    /// Write the uppercased source value into `target_label`.
    Uppercase,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Replace => "replace",
            Self::Keep => "keep",
            Self::Drop => "drop",
            Self::KeepEqual => "keepequal",
            Self::DropEqual => "dropequal",
            Self::LabelMap => "labelmap",
            Self::LabelDrop => "labeldrop",
            Self::LabelKeep => "labelkeep",
            Self::Lowercase => "lowercase",
            Self::Uppercase => "uppercase",
        }
    }

    fn needs_target_label(&self) -> bool {
        matches!(
            self,
            Self::Replace | Self::KeepEqual | Self::DropEqual | Self::Lowercase | Self::Uppercase
        )
    }
}

/// One relabel rule as written in the configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelabelConfig {
    /// Labels whose values are joined with `separator` to form the source value.
    #[serde(default)]
    pub source_labels: Vec<String>,

    /// Separator between source label values (default: ";").
    #[serde(default = "default_separator")]
    pub separator: String,

    /// Label written by `replace`, `lowercase` and `uppercase`, compared by
    /// `keepequal` and `dropequal`.
    #[serde(default)]
    pub target_label: Option<String>,

    /// Regular expression, anchored at both ends (default: "(.*)").
    #[serde(default = "default_regex")]
    pub regex: String,

    /// Replacement with `$1`-style capture references (default: "$1").
    #[serde(default = "default_replacement")]
    pub replacement: String,

    /// Action to perform (default: "replace").
    #[serde(default)]
    pub action: Action,
}

fn default_separator() -> String {
    ";".to_string()
}

fn default_regex() -> String {
    "(.*)".to_string()
}

fn default_replacement() -> String {
    "$1".to_string()
}

impl Default for RelabelConfig {
    fn default() -> Self {
        Self {
            source_labels: Vec::new(),
            separator: default_separator(),
            target_label: None,
            regex: default_regex(),
            replacement: default_replacement(),
            action: Action::default(),
        }
    }
}

impl RelabelConfig {
    /// Remove every label whose name matches `regex`.
    pub fn label_drop(regex: impl Into<String>) -> Self {
        Self {
            regex: regex.into(),
            action: Action::LabelDrop,
            ..Default::default()
        }
    }

    /// Keep only metrics whose name matches `regex`.
    pub fn keep_metrics(regex: impl Into<String>) -> Self {
        Self {
            source_labels: vec![METRIC_NAME_LABEL.to_string()],
            regex: regex.into(),
            action: Action::Keep,
            ..Default::default()
        }
    }

    /// Drop metrics whose name matches `regex`.
    pub fn drop_metrics(regex: impl Into<String>) -> Self {
        Self {
            source_labels: vec![METRIC_NAME_LABEL.to_string()],
            regex: regex.into(),
            action: Action::Drop,
            ..Default::default()
        }
    }
}

/// A rule with its regex compiled.
#[derive(Debug)]
struct RelabelRule {
    config: RelabelConfig,
    regex: Regex,
}

impl RelabelRule {
    fn compile(config: &RelabelConfig) -> Result<Self, RelabelError> {
        let regex = Regex::new(&format!("^(?s:{})$", config.regex)).map_err(|e| {
            RelabelError::InvalidRegex {
                pattern: config.regex.clone(),
                source: e,
            }
        })?;

        if config.action.needs_target_label() {
            match config.target_label.as_deref() {
                None | Some("") => {
                    return Err(RelabelError::MissingTargetLabel(config.action.as_str()));
                }
                // `replace` may build the target from capture groups.
                Some(target) if config.action != Action::Replace && !is_valid_label_name(target) => {
                    return Err(RelabelError::InvalidLabelName(target.to_string()));
                }
                Some(_) => {}
            }
        }

        Ok(Self {
            config: config.clone(),
            regex,
        })
    }

    fn target_label(&self) -> &str {
        self.config.target_label.as_deref().unwrap_or_default()
    }

    fn source_value(&self, labels: &Labels) -> String {
        let mut value = String::new();
        for (i, name) in self.config.source_labels.iter().enumerate() {
            if i > 0 {
                value.push_str(&self.config.separator);
            }
            if let Some(v) = labels.get(name) {
                value.push_str(v);
            }
        }
        value
    }

    /// Apply the rule; `false` means the sample is discarded.
    fn apply(&self, labels: &mut Labels) -> bool {
        match self.config.action {
            Action::Keep => self.regex.is_match(&self.source_value(labels)),
            Action::Drop => !self.regex.is_match(&self.source_value(labels)),
            Action::KeepEqual => {
                let target = labels.get(self.target_label()).map(String::as_str);
                target.unwrap_or_default() == self.source_value(labels)
            }
            Action::DropEqual => {
                let target = labels.get(self.target_label()).map(String::as_str);
                target.unwrap_or_default() != self.source_value(labels)
            }
            Action::Replace => {
                let source = self.source_value(labels);
                let Some(captures) = self.regex.captures(&source) else {
                    return true;
                };

                let mut target = String::new();
                captures.expand(self.target_label(), &mut target);
                if !is_valid_label_name(&target) {
                    return true;
                }

                let mut value = String::new();
                captures.expand(&self.config.replacement, &mut value);
                set_label(labels, target, value);
                true
            }
            Action::Lowercase => {
                let value = self.source_value(labels).to_lowercase();
                set_label(labels, self.target_label().to_string(), value);
                true
            }
            Action::Uppercase => {
                let value = self.source_value(labels).to_uppercase();
                set_label(labels, self.target_label().to_string(), value);
                true
            }
            Action::LabelMap => {
                let mapped: Vec<(String, String)> = labels
                    .iter()
                    .filter(|(name, _)| self.regex.is_match(name))
                    .map(|(name, value)| {
                        let new_name = self
                            .regex
                            .replace(name, self.config.replacement.as_str())
                            .into_owned();
                        (new_name, value.clone())
                    })
                    .collect();
                labels.extend(mapped);
                true
            }
            Action::LabelDrop => {
                labels.retain(|name, _| !self.regex.is_match(name));
                true
            }
            Action::LabelKeep => {
                labels.retain(|name, _| self.regex.is_match(name));
                true
            }
        }
    }
}

/// Write a label; an empty value removes it.
fn set_label(labels: &mut Labels, name: String, value: String) {
    if value.is_empty() {
        labels.remove(&name);
    } else {
        labels.insert(name, value);
    }
}

/// Whether `name` is a valid Prometheus label name (`[a-zA-Z_][a-zA-Z0-9_]*`).
pub fn is_valid_label_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// An ordered, compiled list of relabel rules.
#[derive(Debug, Default)]
pub struct RelabelPipeline {
    rules: Vec<RelabelRule>,
}

impl RelabelPipeline {
    /// Compile rules in order, failing on the first invalid one.
    pub fn compile(configs: &[RelabelConfig]) -> Result<Self, RelabelError> {
        let rules = configs
            .iter()
            .map(RelabelRule::compile)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rules })
    }

    /// Number of rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Run every rule against `labels`.
    ///
    /// Returns `false` as soon as a rule discards the sample; `labels` is
    /// left in an unspecified state in that case.
    pub fn process(&self, labels: &mut Labels) -> bool {
        self.rules.iter().all(|rule| rule.apply(labels))
    }
}

/// A named relabel pipeline with its own aggregated output.
#[derive(Debug)]
pub struct Subset {
    pub name: String,
    pub pipeline: RelabelPipeline,
}

impl Subset {
    pub fn new(name: impl Into<String>, pipeline: RelabelPipeline) -> Self {
        Self {
            name: name.into(),
            pipeline,
        }
    }

    /// Relabel a sample for this subset.
    ///
    /// Works on a private copy of the labels, so subsets never observe each
    /// other's rewrites. Returns the (possibly renamed) metric name and the
    /// canonical label key, or `None` when the sample is discarded.
    pub fn apply(&self, sample: &Sample) -> Option<(String, String)> {
        if self.pipeline.is_empty() {
            return Some((sample.name.clone(), canonical_key(&sample.labels)));
        }

        let mut labels = sample.labels.clone();
        labels.insert(METRIC_NAME_LABEL.to_string(), sample.name.clone());

        if !self.pipeline.process(&mut labels) {
            return None;
        }

        let name = labels
            .remove(METRIC_NAME_LABEL)
            .filter(|name| !name.is_empty())?;
        Some((name, canonical_key(&labels)))
    }
}
