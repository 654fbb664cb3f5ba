//! Execution mode selection.
//!
//! A run is in exactly one of three modes, decided once from which inputs
//! were supplied:
//!
//! | full-analysis | previous results | hand labels | mode |
//! |---|---|---|---|
//! | yes | no | no | `FullAnalysis` |
//! | no | yes | no | `ClassifyAndClean` |
//! | no | yes | yes (matching) | `HandLabeled` |
//!
//! Anything else is a configuration error.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::FixConfig;
use crate::error::ModeError;

/// The closed set of processing modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Run hcp_fix end to end on preprocessed data.
    FullAnalysis,
    /// Re-classify existing ICA output with a training file, then clean.
    ClassifyAndClean,
    /// Clean existing ICA output with hand-labeled noise components.
    HandLabeled,
}

impl ExecutionMode {
    /// Returns the display name for this mode.
    pub fn display_name(&self) -> &'static str {
        match self {
            ExecutionMode::FullAnalysis => "hcpfix",
            ExecutionMode::ClassifyAndClean => "fix cleanup",
            ExecutionMode::HandLabeled => "hand labeled",
        }
    }

    /// Whether the mode consumes a previous ICA-FIX run instead of raw preprocessing output.
    pub fn uses_previous_results(&self) -> bool {
        !matches!(self, ExecutionMode::FullAnalysis)
    }

    /// Tag distinguishing cleaned outputs (`<ica-stem>_<tag>_clean.nii.gz`).
    pub fn clean_tag(&self, config: &FixConfig) -> Option<String> {
        match self {
            ExecutionMode::FullAnalysis => None,
            ExecutionMode::ClassifyAndClean => Some(config.training_stem()),
            ExecutionMode::HandLabeled => Some("handlabel".to_string()),
        }
    }

    /// Suffix handed to the derivative mapper; empty for a full analysis.
    pub fn derivative_suffix(&self, config: &FixConfig) -> String {
        self.clean_tag(config)
            .map(|tag| format!("_{}", tag))
            .unwrap_or_default()
    }
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// Subject and session a run belongs to, without `sub-`/`ses-` prefixes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionIdentity {
    pub subject: String,
    pub session: String,
}

impl SessionIdentity {
    pub fn new(subject: impl AsRef<str>, session: impl AsRef<str>) -> Self {
        Self {
            subject: strip_entity(subject.as_ref(), "sub-").to_string(),
            session: strip_entity(session.as_ref(), "ses-").to_string(),
        }
    }

    /// Reads the identity from the `sub-<id>/ses-<id>` components of a path.
    pub fn from_path(path: &Path) -> Option<Self> {
        let mut subject = None;
        let mut session = None;
        for component in path.components() {
            let text = component.as_os_str().to_string_lossy();
            if subject.is_none() && text.starts_with("sub-") {
                subject = Some(text.to_string());
            } else if session.is_none() && text.starts_with("ses-") {
                session = Some(text.to_string());
            }
        }
        Some(Self::new(subject?, session?))
    }
}

fn strip_entity<'a>(value: &'a str, prefix: &str) -> &'a str {
    value.strip_prefix(prefix).unwrap_or(value)
}

/// BIDS acquisition name of a task label: the tokens between the leading
/// session token and `bold` (`ses-01_task-rest_acq-AP_bold` -> `task-rest_acq-AP`).
pub fn acquisition_name(task_label: &str) -> Option<String> {
    let stem = task_label.split('.').next().unwrap_or(task_label);
    let tokens: Vec<&str> = stem.split('_').collect();
    let bold = tokens.iter().position(|t| *t == "bold")?;
    if bold < 2 {
        return None;
    }
    Some(tokens[1..bold].join("_"))
}

/// One row of the hand-labeled noise table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoiseLabelRow {
    #[serde(default)]
    pub subject: Option<String>,
    pub session: String,
    pub acquisition: String,
    pub noise_labels: Vec<u32>,
}

/// Hand-labeled noise components per acquisition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NoiseLabelTable {
    pub rows: Vec<NoiseLabelRow>,
}

impl NoiseLabelTable {
    /// Loads the table from a JSON list of rows.
    pub fn from_path(path: &Path) -> Result<Self, ModeError> {
        let table_error = |message: String| ModeError::NoiseLabelTable {
            path: path.display().to_string(),
            message,
        };
        let content = std::fs::read_to_string(path).map_err(|e| table_error(e.to_string()))?;
        serde_json::from_str(&content).map_err(|e| table_error(e.to_string()))
    }

    fn row_matches(row: &NoiseLabelRow, identity: &SessionIdentity) -> bool {
        if strip_entity(&row.session, "ses-") != identity.session {
            return false;
        }
        match &row.subject {
            Some(subject) => strip_entity(subject, "sub-") == identity.subject,
            None => true,
        }
    }

    /// Whether any row belongs to this subject and session (or session alone
    /// when the row carries no subject).
    pub fn matches_identity(&self, identity: &SessionIdentity) -> bool {
        self.rows.iter().any(|row| Self::row_matches(row, identity))
    }

    /// Noise components recorded for one acquisition of this session.
    pub fn labels_for(&self, identity: &SessionIdentity, acquisition: &str) -> Option<&[u32]> {
        self.rows
            .iter()
            .filter(|row| Self::row_matches(row, identity))
            .find(|row| {
                row.acquisition == acquisition
                    || row.acquisition.strip_prefix("func-bold_") == Some(acquisition)
            })
            .map(|row| row.noise_labels.as_slice())
    }
}

/// Which external inputs were supplied for this run.
#[derive(Debug, Clone, Default)]
pub struct ModeInputs {
    pub full_analysis: bool,
    pub previous_results: bool,
    pub hand_labels: Option<NoiseLabelTable>,
}

/// Derives the single applicable mode.
pub fn select_mode(
    inputs: &ModeInputs,
    identity: &SessionIdentity,
) -> Result<ExecutionMode, ModeError> {
    let mode = match (inputs.full_analysis, inputs.previous_results, &inputs.hand_labels) {
        (true, false, None) => ExecutionMode::FullAnalysis,
        (false, true, None) => ExecutionMode::ClassifyAndClean,
        (false, true, Some(table)) => {
            if !table.matches_identity(identity) {
                return Err(ModeError::HandLabelsNotOrganized(format!(
                    "no rows for subject '{}' session '{}'",
                    identity.subject, identity.session
                )));
            }
            ExecutionMode::HandLabeled
        }
        (true, false, Some(_)) => return Err(ModeError::HandLabelsWithoutPreviousResults),
        (full, previous, _) => return Err(ModeError::AmbiguousInputs { full, previous }),
    };
    info!("Selected execution mode: {}", mode);
    Ok(mode)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> SessionIdentity {
        SessionIdentity::new("sub-01", "ses-A")
    }

    fn table(subject: Option<&str>, session: &str) -> NoiseLabelTable {
        NoiseLabelTable {
            rows: vec![NoiseLabelRow {
                subject: subject.map(String::from),
                session: session.to_string(),
                acquisition: "task-rest_acq-AP".to_string(),
                noise_labels: vec![1, 4, 7],
            }],
        }
    }

    fn inputs(full: bool, previous: bool, hand: Option<NoiseLabelTable>) -> ModeInputs {
        ModeInputs {
            full_analysis: full,
            previous_results: previous,
            hand_labels: hand,
        }
    }

    #[test]
    fn test_mode_table() {
        let id = identity();
        assert_eq!(
            select_mode(&inputs(true, false, None), &id).unwrap(),
            ExecutionMode::FullAnalysis
        );
        assert_eq!(
            select_mode(&inputs(false, true, None), &id).unwrap(),
            ExecutionMode::ClassifyAndClean
        );
        assert_eq!(
            select_mode(&inputs(false, true, Some(table(Some("sub-01"), "ses-A"))), &id).unwrap(),
            ExecutionMode::HandLabeled
        );
    }

    #[test]
    fn test_ambiguous_inputs() {
        let id = identity();
        assert!(matches!(
            select_mode(&inputs(true, true, None), &id),
            Err(ModeError::AmbiguousInputs { full: true, previous: true })
        ));
        assert!(matches!(
            select_mode(&inputs(false, false, None), &id),
            Err(ModeError::AmbiguousInputs { .. })
        ));
        assert!(matches!(
            select_mode(&inputs(true, false, Some(table(None, "A"))), &id),
            Err(ModeError::HandLabelsWithoutPreviousResults)
        ));
    }

    #[test]
    fn test_hand_labels_must_match_identity() {
        let id = identity();
        let err = select_mode(&inputs(false, true, Some(table(Some("02"), "A"))), &id).unwrap_err();
        assert!(matches!(err, ModeError::HandLabelsNotOrganized(_)));
        assert!(err.to_string().contains("not correctly organized"));

        // A session-only row is enough.
        assert_eq!(
            select_mode(&inputs(false, true, Some(table(None, "A"))), &id).unwrap(),
            ExecutionMode::HandLabeled
        );
    }

    #[test]
    fn test_labels_lookup() {
        let id = identity();
        let t = table(Some("01"), "ses-A");
        assert_eq!(t.labels_for(&id, "task-rest_acq-AP"), Some(&[1, 4, 7][..]));
        assert_eq!(t.labels_for(&id, "task-motor"), None);
    }

    #[test]
    fn test_acquisition_name() {
        assert_eq!(
            acquisition_name("ses-01_task-rest_acq-AP_bold").as_deref(),
            Some("task-rest_acq-AP")
        );
        assert_eq!(
            acquisition_name("ses-01_task-rest_bold_hp2000.nii.gz").as_deref(),
            Some("task-rest")
        );
        assert_eq!(acquisition_name("task-rest"), None);
    }

    #[test]
    fn test_identity_from_path() {
        let path = Path::new("/work/sub-01/ses-A/MNINonLinear/Results/ses-A_task-rest_bold");
        assert_eq!(SessionIdentity::from_path(path), Some(identity()));
        assert_eq!(SessionIdentity::from_path(Path::new("/work/other")), None);
    }

    #[test]
    fn test_derivative_suffix() {
        let config = FixConfig::new();
        assert_eq!(ExecutionMode::FullAnalysis.derivative_suffix(&config), "");
        assert_eq!(
            ExecutionMode::ClassifyAndClean.derivative_suffix(&config),
            "_HCP_hp2000"
        );
        assert_eq!(
            ExecutionMode::HandLabeled.derivative_suffix(&config),
            "_handlabel"
        );
    }

    #[test]
    fn test_noise_table_json() {
        let rows: NoiseLabelTable = serde_json::from_str(
            r#"[{"session": "ses-A", "acquisition": "task-rest", "noise_labels": [2, 3]}]"#,
        )
        .unwrap();
        assert_eq!(rows.rows.len(), 1);
        assert!(rows.rows[0].subject.is_none());
    }
}
