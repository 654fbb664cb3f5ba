//! ICA component classification summaries.
//!
//! Joins the classifier's per-component labels (`fix4melview*.txt` or a
//! hand-label list) with MELODIC's per-component variance statistics
//! (`melodic_ICstats`) and reduces them to a summary that is published as
//! acquisition metadata.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::AggregationError;

pub const SIGNAL_LABEL: &str = "Signal";
pub const NOISE_LABEL: &str = "Noise";

/// Label assigned to one component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentLabel {
    pub ordinal: u32,
    pub label: String,
    pub is_noise: bool,
    /// Classifier probability, absent for hand labels.
    pub weight: Option<f64>,
}

/// Per-component labels in ordinal order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LabelTable {
    pub components: Vec<ComponentLabel>,
}

fn parse_error(file: &str, line: usize, message: impl Into<String>) -> AggregationError {
    AggregationError::Parse {
        file: file.to_string(),
        line,
        message: message.into(),
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" => Some(true),
        "false" => Some(false),
        _ => None,
    }
}

impl LabelTable {
    /// Parses a FIX label file.
    ///
    /// ```text
    /// /path/to/filtered_func_data.ica
    /// 1, Signal, False, 0.93
    /// 2, Unclassified Noise, True, 0.02
    /// [2]
    /// ```
    ///
    /// The first line names the ICA directory; the trailing bracketed noise
    /// list repeats the third column and is ignored.
    pub fn parse_fix4melview(content: &str, file: &str) -> Result<Self, AggregationError> {
        let mut components = Vec::new();
        for (idx, line) in content.lines().enumerate().skip(1) {
            let line_no = idx + 1;
            let line = line.trim();
            if line.is_empty() || line.starts_with('[') {
                continue;
            }
            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            if fields.len() < 3 {
                return Err(parse_error(file, line_no, "expected 'ordinal, label, noise[, weight]'"));
            }
            let ordinal = fields[0]
                .parse()
                .map_err(|_| parse_error(file, line_no, format!("bad ordinal '{}'", fields[0])))?;
            let is_noise = parse_bool(fields[2])
                .ok_or_else(|| parse_error(file, line_no, format!("bad noise flag '{}'", fields[2])))?;
            let weight = match fields.get(3) {
                Some(w) if !w.is_empty() => Some(
                    w.parse()
                        .map_err(|_| parse_error(file, line_no, format!("bad weight '{}'", w)))?,
                ),
                _ => None,
            };
            components.push(ComponentLabel {
                ordinal,
                label: fields[1].to_string(),
                is_noise,
                weight,
            });
        }
        if components.is_empty() {
            return Err(AggregationError::Empty(file.to_string()));
        }
        Ok(Self { components })
    }

    pub fn from_path(path: &Path) -> Result<Self, AggregationError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse_fix4melview(&content, &path.display().to_string())
    }

    /// Labels components `1..=component_count` from a hand-labeled noise list.
    pub fn from_noise_list(noise: &[u32], component_count: usize) -> Result<Self, AggregationError> {
        let noise: BTreeSet<u32> = noise.iter().copied().collect();
        let out_of_range: Vec<u32> = noise
            .iter()
            .copied()
            .filter(|n| *n == 0 || *n as usize > component_count)
            .collect();
        if !out_of_range.is_empty() {
            return Err(AggregationError::MissingVariance(out_of_range));
        }

        let components = (1..=component_count as u32)
            .map(|ordinal| {
                let is_noise = noise.contains(&ordinal);
                ComponentLabel {
                    ordinal,
                    label: if is_noise { NOISE_LABEL } else { SIGNAL_LABEL }.to_string(),
                    is_noise,
                    weight: None,
                }
            })
            .collect();
        Ok(Self { components })
    }
}

/// Parses a hand-label file (`[1, 4, 7]`). Brackets are optional.
pub fn parse_noise_list(content: &str) -> Result<Vec<u32>, AggregationError> {
    let inner = content.trim().trim_start_matches('[').trim_end_matches(']');
    inner
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse()
                .map_err(|_| parse_error("hand label list", 1, format!("bad component '{}'", s)))
        })
        .collect()
}

/// Formats components in the bracketed form FIX reads.
pub fn format_noise_list(noise: &[u32]) -> String {
    let items: Vec<String> = noise.iter().map(u32::to_string).collect();
    format!("[{}]", items.join(", "))
}

/// Variance statistics of one component.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ComponentVariance {
    pub ordinal: u32,
    /// Percent of explained variance.
    pub explained: f64,
    /// Percent of total variance.
    pub total: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VarianceTable {
    pub components: Vec<ComponentVariance>,
}

impl VarianceTable {
    /// Parses `melodic_ICstats`: whitespace-separated columns, row `i` is
    /// component `i + 1`, the first two columns are percent explained and
    /// percent total variance.
    pub fn parse_icstats(content: &str, file: &str) -> Result<Self, AggregationError> {
        let mut components = Vec::new();
        for (idx, line) in content.lines().enumerate() {
            let cols: Vec<&str> = line.split_whitespace().collect();
            if cols.is_empty() {
                continue;
            }
            let number = |i: usize| -> Result<f64, AggregationError> {
                let raw = cols
                    .get(i)
                    .ok_or_else(|| parse_error(file, idx + 1, format!("missing column {}", i + 1)))?;
                raw.parse()
                    .map_err(|_| parse_error(file, idx + 1, format!("bad number '{}'", raw)))
            };
            components.push(ComponentVariance {
                ordinal: components.len() as u32 + 1,
                explained: number(0)?,
                total: number(1)?,
            });
        }
        if components.is_empty() {
            return Err(AggregationError::Empty(file.to_string()));
        }
        Ok(Self { components })
    }

    pub fn from_path(path: &Path) -> Result<Self, AggregationError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse_icstats(&content, &path.display().to_string())
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }
}

/// Joined label and variance of one component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentRecord {
    pub label: String,
    pub is_noise: bool,
    pub weight: Option<f64>,
    pub explained_variance: f64,
    pub total_variance: f64,
}

/// Per-component classification, keyed by ordinal.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub components: BTreeMap<u32, ComponentRecord>,
}

fn duplicates(ordinals: impl Iterator<Item = u32>) -> Vec<u32> {
    let mut seen = BTreeSet::new();
    let mut repeated = BTreeSet::new();
    for ordinal in ordinals {
        if !seen.insert(ordinal) {
            repeated.insert(ordinal);
        }
    }
    repeated.into_iter().collect()
}

/// Joins labels and variance on ordinal; every component must be in both,
/// exactly once.
pub fn join(
    labels: &LabelTable,
    variance: &VarianceTable,
) -> Result<ClassificationResult, AggregationError> {
    for (table, repeated) in [
        ("label", duplicates(labels.components.iter().map(|c| c.ordinal))),
        ("variance", duplicates(variance.components.iter().map(|c| c.ordinal))),
    ] {
        if !repeated.is_empty() {
            return Err(AggregationError::DuplicateComponents {
                table,
                ordinals: repeated,
            });
        }
    }
    let stats: BTreeMap<u32, &ComponentVariance> =
        variance.components.iter().map(|c| (c.ordinal, c)).collect();
    let labelled: BTreeSet<u32> = labels.components.iter().map(|c| c.ordinal).collect();

    let unlabelled: Vec<u32> = stats.keys().filter(|o| !labelled.contains(o)).copied().collect();
    if !unlabelled.is_empty() {
        return Err(AggregationError::MissingLabels(unlabelled));
    }
    let missing: Vec<u32> = labelled.iter().filter(|o| !stats.contains_key(o)).copied().collect();
    if !missing.is_empty() {
        return Err(AggregationError::MissingVariance(missing));
    }

    let components = labels
        .components
        .iter()
        .filter_map(|label| {
            stats.get(&label.ordinal).map(|v| {
                (
                    label.ordinal,
                    ComponentRecord {
                        label: label.label.clone(),
                        is_noise: label.is_noise,
                        weight: label.weight,
                        explained_variance: v.explained,
                        total_variance: v.total,
                    },
                )
            })
        })
        .collect();
    Ok(ClassificationResult { components })
}

/// Component count and variance sums of one label.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LabelStats {
    pub components: usize,
    pub prc_explained_variance: f64,
    pub prc_total_variance: f64,
}

impl LabelStats {
    fn add(&mut self, record: &ComponentRecord) {
        self.components += 1;
        self.prc_explained_variance += record.explained_variance;
        self.prc_total_variance += record.total_variance;
    }
}

/// Aggregate view of a [`ClassificationResult`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClassificationSummary {
    pub component_count: usize,
    pub noise_count: usize,
    pub signal_count: usize,
    pub noise_percent: f64,
    pub signal_percent: f64,
    /// Sum of percent-explained variance over noise components.
    pub noise_explained_variance: f64,
    pub signal_explained_variance: f64,
    /// Noise share of all explained variance, in percent.
    pub noise_variance_percent: f64,
    pub noise_total_variance: f64,
    pub signal_total_variance: f64,
    pub by_label: BTreeMap<String, LabelStats>,
}

fn percent(part: f64, whole: f64) -> f64 {
    if whole > 0.0 {
        100.0 * part / whole
    } else {
        0.0
    }
}

impl ClassificationResult {
    pub fn summary(&self) -> ClassificationSummary {
        let mut noise = LabelStats::default();
        let mut signal = LabelStats::default();
        let mut by_label: BTreeMap<String, LabelStats> = BTreeMap::new();

        for record in self.components.values() {
            if record.is_noise {
                noise.add(record);
            } else {
                signal.add(record);
            }
            by_label.entry(record.label.clone()).or_default().add(record);
        }

        let count = self.components.len();
        ClassificationSummary {
            component_count: count,
            noise_count: noise.components,
            signal_count: signal.components,
            noise_percent: percent(noise.components as f64, count as f64),
            signal_percent: percent(signal.components as f64, count as f64),
            noise_explained_variance: noise.prc_explained_variance,
            signal_explained_variance: signal.prc_explained_variance,
            noise_variance_percent: percent(
                noise.prc_explained_variance,
                noise.prc_explained_variance + signal.prc_explained_variance,
            ),
            noise_total_variance: noise.prc_total_variance,
            signal_total_variance: signal.prc_total_variance,
            by_label,
        }
    }
}

/// Metadata document for one acquisition, keyed by training configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub training: String,
    pub job: String,
    pub summary: ClassificationSummary,
}

impl RunMetadata {
    pub fn new(training: impl Into<String>, job: impl Into<String>, summary: ClassificationSummary) -> Self {
        Self {
            training: training.into(),
            job: job.into(),
            summary,
        }
    }

    /// `{"<training>": {<summary fields>..., "job": "<job>"}}`
    pub fn to_json(&self) -> Value {
        let mut body = serde_json::to_value(&self.summary).unwrap_or_else(|_| json!({}));
        if let Value::Object(map) = &mut body {
            map.insert("job".to_string(), Value::String(self.job.clone()));
        }
        let mut doc = serde_json::Map::new();
        doc.insert(self.training.clone(), body);
        Value::Object(doc)
    }
}
