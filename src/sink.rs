//! Where per-unit results go once a unit finishes.
//!
//! Metadata, report inputs and the derivative request are handed to a
//! [`ResultSink`]; the pipeline never writes them itself. [`JsonFileSink`]
//! stores each one as a JSON document under the output directory.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tokio::fs;
use tracing::info;

use crate::classification::RunMetadata;
use crate::command::StageCommand;
use crate::error::PipelineError;
use crate::task::TaskUnit;

/// Consumer of unit results.
#[async_trait]
pub trait ResultSink: Send + Sync {
    /// Classification metadata of one acquisition.
    async fn publish_metadata(
        &self,
        unit: &TaskUnit,
        metadata: &RunMetadata,
    ) -> Result<(), PipelineError>;

    /// Inputs for the component report of one unit.
    async fn publish_report_input(
        &self,
        unit: &TaskUnit,
        ica_dir: &Path,
        command: &StageCommand,
    ) -> Result<(), PipelineError>;

    /// Request to map the analysis tree into derivatives, once per run.
    async fn publish_derivative_request(
        &self,
        root: &Path,
        run_id: &str,
        suffix: &str,
    ) -> Result<(), PipelineError>;
}

/// Writes results as JSON files:
///
/// - `metadata/<task-label>.json`
/// - `reports/<task-label>.json`
/// - `derivative_request.json`
#[derive(Debug, Clone)]
pub struct JsonFileSink {
    output_dir: PathBuf,
}

impl JsonFileSink {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn metadata_path(&self, unit: &TaskUnit) -> PathBuf {
        self.output_dir
            .join("metadata")
            .join(format!("{}.json", unit.task_label))
    }

    pub fn report_path(&self, unit: &TaskUnit) -> PathBuf {
        self.output_dir
            .join("reports")
            .join(format!("{}.json", unit.task_label))
    }

    pub fn derivative_request_path(&self) -> PathBuf {
        self.output_dir.join("derivative_request.json")
    }

    async fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), PipelineError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(path, serde_json::to_string_pretty(value)?).await?;
        info!("Wrote {}", path.display());
        Ok(())
    }
}

#[async_trait]
impl ResultSink for JsonFileSink {
    async fn publish_metadata(
        &self,
        unit: &TaskUnit,
        metadata: &RunMetadata,
    ) -> Result<(), PipelineError> {
        let doc = json!({
            "subject": unit.identity.subject,
            "session": unit.identity.session,
            "acquisition": unit.acquisition(),
            "task_label": unit.task_label,
            "ICAFIX": metadata.to_json(),
        });
        Self::write_json(&self.metadata_path(unit), &doc).await
    }

    async fn publish_report_input(
        &self,
        unit: &TaskUnit,
        ica_dir: &Path,
        command: &StageCommand,
    ) -> Result<(), PipelineError> {
        let doc = json!({
            "task_label": unit.task_label,
            "task_dir": unit.task_dir,
            "ica_dir": ica_dir,
            "role": command.role,
            "command": command.command_line(),
        });
        Self::write_json(&self.report_path(unit), &doc).await
    }

    async fn publish_derivative_request(
        &self,
        root: &Path,
        run_id: &str,
        suffix: &str,
    ) -> Result<(), PipelineError> {
        let doc = json!({
            "root": root,
            "run_id": run_id,
            "suffix": suffix,
            "requested_at": Utc::now().to_rfc3339(),
        });
        Self::write_json(&self.derivative_request_path(), &doc).await
    }
}
