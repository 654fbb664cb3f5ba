//! Run-level coordination: mode selection, unit discovery, sequential unit
//! processing and the run summary.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use super::unit::{process_task_unit, UnitContext, UnitOutcome};
use crate::command::{stages, Stage};
use crate::config::{FixConfig, ToolPaths};
use crate::error::{ModeError, PipelineError};
use crate::mode::{select_mode, ExecutionMode, ModeInputs, NoiseLabelTable, SessionIdentity};
use crate::runner::ToolRunner;
use crate::sink::ResultSink;
use crate::task::{discover_identity, discover_task_units, TaskUnit};
use crate::volume::VolumeTools;

/// File name of the run summary in the output directory.
pub const RUN_SUMMARY_FILE: &str = "run_summary.json";

/// Inputs of a run as given on the command line.
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    /// Root of a preprocessed HCP tree (full analysis).
    pub preprocessed: Option<PathBuf>,
    /// Root of a tree with earlier ICA-FIX results.
    pub previous_results: Option<PathBuf>,
    /// Hand-labeled noise table.
    pub hand_labels: Option<PathBuf>,
    pub config: FixConfig,
    pub job_id: Option<String>,
    pub output_dir: PathBuf,
}

/// Status of a unit in the run summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    Completed,
    CompletedWithToolFailures,
    Failed,
    Skipped,
}

impl std::fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UnitStatus::Completed => write!(f, "completed"),
            UnitStatus::CompletedWithToolFailures => write!(f, "completed_with_tool_failures"),
            UnitStatus::Failed => write!(f, "failed"),
            UnitStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// One line of the run summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitReport {
    pub task_label: String,
    pub status: UnitStatus,
    pub outcome: Option<UnitOutcome>,
    pub error_kind: Option<String>,
    pub error: Option<String>,
}

/// Everything that happened in one run; written as `run_summary.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub job_id: String,
    pub mode: ExecutionMode,
    pub root: PathBuf,
    pub dry_run: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub units: Vec<UnitReport>,
    /// Set when a fatal failure aborted the run.
    pub aborted: bool,
}

impl RunSummary {
    pub fn tool_failures(&self) -> usize {
        self.units
            .iter()
            .filter_map(|u| u.outcome.as_ref())
            .map(UnitOutcome::tool_failures)
            .sum()
    }
}

/// What a run would do, without running anything.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunPlan {
    pub mode: ExecutionMode,
    pub root: PathBuf,
    pub identity: SessionIdentity,
    pub derivative_suffix: String,
    pub units: Vec<PlannedUnit>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedUnit {
    pub unit: TaskUnit,
    pub acquisition: Option<String>,
    pub dummy_frames: Option<usize>,
    /// Why the dummy-frame count could not be resolved.
    pub dummy_frames_error: Option<String>,
    pub stages: Vec<Stage>,
}

/// Drives all task units of one analysis tree.
pub struct Pipeline {
    ctx: UnitContext,
    root: PathBuf,
    identity: SessionIdentity,
    mode: ExecutionMode,
    run_id: String,
    output_dir: PathBuf,
}

impl Pipeline {
    /// Selects the execution mode and prepares a run.
    pub fn prepare(
        request: RunRequest,
        tools: ToolPaths,
        runner: Arc<dyn ToolRunner>,
        volumes: Arc<dyn VolumeTools>,
        sink: Arc<dyn ResultSink>,
    ) -> Result<Self, PipelineError> {
        request.config.validate()?;

        let root = match (&request.preprocessed, &request.previous_results) {
            (Some(root), None) | (None, Some(root)) => root.clone(),
            (full, previous) => {
                return Err(ModeError::AmbiguousInputs {
                    full: full.is_some(),
                    previous: previous.is_some(),
                }
                .into())
            }
        };
        if request.preprocessed.is_some() && request.hand_labels.is_some() {
            return Err(ModeError::HandLabelsWithoutPreviousResults.into());
        }
        let identity = discover_identity(&root)?;
        let hand_labels = request
            .hand_labels
            .as_deref()
            .map(NoiseLabelTable::from_path)
            .transpose()?;

        let inputs = ModeInputs {
            full_analysis: request.preprocessed.is_some(),
            previous_results: request.previous_results.is_some(),
            hand_labels: hand_labels.clone(),
        };
        let mode = select_mode(&inputs, &identity)?;

        let run_id = Uuid::new_v4().to_string();
        let job_id = request.job_id.unwrap_or_else(|| run_id.clone());
        info!(
            "Prepared run {} for subject {} session {} in {} mode",
            run_id, identity.subject, identity.session, mode
        );

        Ok(Self {
            ctx: UnitContext {
                config: request.config,
                tools,
                runner,
                volumes,
                sink,
                hand_labels,
                job_id,
            },
            root,
            identity,
            mode,
            run_id,
            output_dir: request.output_dir,
        })
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn summary_path(&self) -> PathBuf {
        self.output_dir.join(RUN_SUMMARY_FILE)
    }

    /// Discovers units and resolves their parameters without touching anything.
    pub fn plan(&self) -> Result<RunPlan, PipelineError> {
        let units = discover_task_units(&self.root, self.mode, &self.ctx.config)?;
        let units = units
            .into_iter()
            .map(|unit| {
                let acquisition = unit.acquisition();
                let (dummy_frames, dummy_frames_error) =
                    match self.ctx.config.dummy_frames_for(acquisition.as_deref()) {
                        Ok(count) => (Some(count), None),
                        Err(e) => (None, Some(e.to_string())),
                    };
                PlannedUnit {
                    unit,
                    acquisition,
                    dummy_frames,
                    dummy_frames_error,
                    stages: stages(self.mode).to_vec(),
                }
            })
            .collect();
        Ok(RunPlan {
            mode: self.mode,
            root: self.root.clone(),
            identity: self.identity.clone(),
            derivative_suffix: self.mode.derivative_suffix(&self.ctx.config),
            units,
        })
    }

    /// Processes every unit in order.
    ///
    /// The summary is written even when a fatal failure aborts the run; the
    /// failure is then returned.
    pub async fn run(&self) -> Result<RunSummary, PipelineError> {
        let started_at = Utc::now();
        let start = Instant::now();
        let units = discover_task_units(&self.root, self.mode, &self.ctx.config)?;

        let mut reports = Vec::with_capacity(units.len());
        let mut fatal = None;
        for (idx, unit) in units.iter().enumerate() {
            if fatal.is_some() {
                reports.push(UnitReport {
                    task_label: unit.task_label.clone(),
                    status: UnitStatus::Skipped,
                    outcome: None,
                    error_kind: None,
                    error: None,
                });
                continue;
            }

            info!("[{}/{}] {}", idx + 1, units.len(), unit.task_label);
            match process_task_unit(unit, self.mode, &self.ctx).await {
                Ok(outcome) => {
                    let status = if outcome.tool_failures() > 0 {
                        UnitStatus::CompletedWithToolFailures
                    } else {
                        UnitStatus::Completed
                    };
                    reports.push(UnitReport {
                        task_label: unit.task_label.clone(),
                        status,
                        outcome: Some(outcome),
                        error_kind: None,
                        error: None,
                    });
                }
                Err(e) => {
                    error!("{} failed: {}", unit.task_label, e);
                    reports.push(UnitReport {
                        task_label: unit.task_label.clone(),
                        status: UnitStatus::Failed,
                        outcome: None,
                        error_kind: Some(e.kind().to_string()),
                        error: Some(e.to_string()),
                    });
                    if e.is_fatal() {
                        fatal = Some(e);
                    }
                }
            }
        }

        if fatal.is_none() && !self.ctx.config.dry_run {
            let suffix = self.mode.derivative_suffix(&self.ctx.config);
            self.ctx
                .sink
                .publish_derivative_request(&self.root, &self.run_id, &suffix)
                .await?;
        }

        let summary = RunSummary {
            run_id: self.run_id.clone(),
            job_id: self.ctx.job_id.clone(),
            mode: self.mode,
            root: self.root.clone(),
            dry_run: self.ctx.config.dry_run,
            started_at,
            finished_at: Utc::now(),
            duration_ms: u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
            units: reports,
            aborted: fatal.is_some(),
        };
        self.write_summary(&summary).await?;

        match fatal {
            Some(e) => Err(e),
            None => {
                let failures = summary.tool_failures();
                if failures > 0 {
                    warn!("Run finished with {} tool failure(s)", failures);
                } else {
                    info!("Run finished");
                }
                Ok(summary)
            }
        }
    }

    async fn write_summary(&self, summary: &RunSummary) -> Result<(), PipelineError> {
        tokio::fs::create_dir_all(&self.output_dir).await?;
        let path = self.summary_path();
        tokio::fs::write(&path, serde_json::to_string_pretty(summary)?).await?;
        info!("Run summary written to {}", path.display());
        Ok(())
    }
}
