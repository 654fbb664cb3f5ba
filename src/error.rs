//! Error types for icafix-runner operations.
//!
//! Defines error types for each subsystem:
//! - Artifact resolution inside the analysis tree
//! - Execution mode selection and hand-label validation
//! - Configuration loading and validation
//! - External tool invocation
//! - Dummy-frame trim and restore
//! - Classification aggregation
//!
//! `PipelineError` collects all of them and decides which ones abort a run.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while resolving artifact patterns.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("No files match pattern '{pattern}'")]
    NotFound { pattern: String },

    #[error("Invalid pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },

    #[error("Failed to walk '{pattern}': {message}")]
    Walk { pattern: String, message: String },
}

/// Errors that can occur while selecting the execution mode.
#[derive(Debug, Error)]
pub enum ModeError {
    #[error("Ambiguous inputs: full-analysis input {full}, previous-results input {previous}; exactly one is required")]
    AmbiguousInputs { full: bool, previous: bool },

    #[error("Hand-labeled noise requires previous ICA-FIX results as input")]
    HandLabelsWithoutPreviousResults,

    #[error("Hand-labeled noise not correctly organized: {0}")]
    HandLabelsNotOrganized(String),

    #[error("Failed to read noise label table '{path}': {message}")]
    NoiseLabelTable { path: String, message: String },
}

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    #[error("Custom training file passed as input, but training_file is set to '{configured}'")]
    CustomTrainingMismatch { configured: String },

    #[error("Dropping non-steady-state volumes is enabled but no dummy volume count is available for '{acquisition}'")]
    MissingDummyVolumes { acquisition: String },

    #[error("Unsupported configuration format: {0}")]
    UnsupportedFormat(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors raised by external tool invocations.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Failed to spawn {program}: {message}")]
    Spawn { program: String, message: String },

    #[error("{program} failed (exit code {exit_code:?}): {detail}")]
    Failed {
        program: String,
        exit_code: Option<i32>,
        detail: String,
    },

    #[error("Unexpected output from {program}: '{output}'")]
    UnexpectedOutput { program: String, output: String },
}

/// Errors that can occur while trimming or restoring dummy frames.
#[derive(Debug, Error)]
pub enum TrimRestoreError {
    #[error("Backup file missing at restore time: {0}")]
    MissingBackup(PathBuf),

    #[error("Intermediate artifact missing: {0}")]
    MissingIntermediate(PathBuf),

    #[error("Restored frame count mismatch for {path}: expected {expected}, got {actual}")]
    FrameCountMismatch {
        path: PathBuf,
        expected: usize,
        actual: usize,
    },

    #[error("Cannot drop {dummy} dummy frames from {path}: series only has {frames} frames")]
    TooManyDummyFrames {
        path: PathBuf,
        dummy: usize,
        frames: usize,
    },

    #[error("No step interval recorded for surface series {0}")]
    MissingStepInterval(PathBuf),

    #[error("Volume tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur while aggregating classification statistics.
#[derive(Debug, Error)]
pub enum AggregationError {
    #[error("Components {0:?} appear in the variance table but not in the label table")]
    MissingLabels(Vec<u32>),

    #[error("Components {0:?} appear in the label table but not in the variance table")]
    MissingVariance(Vec<u32>),

    #[error("Failed to parse '{file}' line {line}: {message}")]
    Parse {
        file: String,
        line: usize,
        message: String,
    },

    #[error("Components {ordinals:?} appear more than once in the {table} table")]
    DuplicateComponents {
        table: &'static str,
        ordinals: Vec<u32>,
    },

    #[error("No components found in '{0}'")]
    Empty(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Top-level error for a pipeline run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("Configuration error: {0}")]
    Mode(#[from] ModeError),

    #[error("Not found: {0}")]
    NotFound(#[from] ResolveError),

    #[error("External tool error: {0}")]
    ExternalTool(#[from] ToolError),

    #[error("Trim/restore error: {0}")]
    TrimRestore(#[from] TrimRestoreError),

    #[error("Aggregation error: {0}")]
    Aggregation(#[from] AggregationError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PipelineError {
    /// Whether this failure aborts the remaining task units.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            PipelineError::ExternalTool(_) | PipelineError::Aggregation(_)
        )
    }

    /// Short machine-readable class name used in run summaries.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Configuration(_) | PipelineError::Mode(_) => "configuration",
            PipelineError::NotFound(_) => "not_found",
            PipelineError::ExternalTool(_) => "external_tool",
            PipelineError::TrimRestore(_) => "trim_restore",
            PipelineError::Aggregation(_) => "aggregation",
            PipelineError::Io(_) | PipelineError::Serialization(_) => "io",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatality_classes() {
        let not_found = PipelineError::from(ResolveError::NotFound {
            pattern: "x/*.ica".to_string(),
        });
        assert!(not_found.is_fatal());
        assert_eq!(not_found.kind(), "not_found");

        let tool = PipelineError::from(ToolError::Failed {
            program: "fix".to_string(),
            exit_code: Some(1),
            detail: "boom".to_string(),
        });
        assert!(!tool.is_fatal());

        let agg = PipelineError::from(AggregationError::MissingLabels(vec![3]));
        assert!(!agg.is_fatal());

        let trim = PipelineError::from(TrimRestoreError::MissingBackup(PathBuf::from("/tmp/b")));
        assert!(trim.is_fatal());
        assert_eq!(trim.kind(), "trim_restore");
    }

    #[test]
    fn test_mode_errors_read_as_configuration() {
        let err = PipelineError::from(ModeError::AmbiguousInputs {
            full: true,
            previous: true,
        });
        assert_eq!(err.kind(), "configuration");
        assert!(err.to_string().contains("Ambiguous inputs"));
    }
}
