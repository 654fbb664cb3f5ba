//! Per-unit driver.
//!
//! `process_task_unit` takes one task unit through trim, the mode's stages,
//! restore and metadata. All run-wide parameters come in through
//! [`UnitContext`]; the dummy-frame count is resolved here and passed on
//! explicitly.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, error, info, warn};

use crate::classification::{self, LabelTable, RunMetadata, VarianceTable};
use crate::command::{stages, CommandBuilder, Stage, StageCommand, ToolRole};
use crate::config::{FixConfig, ToolPaths};
use crate::error::{ModeError, PipelineError, ResolveError};
use crate::mode::{ExecutionMode, NoiseLabelTable};
use crate::resolver;
use crate::runner::ToolRunner;
use crate::sink::ResultSink;
use crate::task::{self, TaskUnit, HAND_LABEL_FILE};
use crate::volume::{TrimEngine, TrimRecord, VolumeTools};

/// Staged input of the cleanup applier inside the ICA directory.
pub const FILTERED_FUNC: &str = "filtered_func_data.nii.gz";

/// Cleanup applier output inside the ICA directory.
pub const FILTERED_FUNC_CLEAN: &str = "filtered_func_data_clean.nii.gz";

/// Everything a unit needs that is shared across the run.
#[derive(Clone)]
pub struct UnitContext {
    pub config: FixConfig,
    pub tools: ToolPaths,
    pub runner: Arc<dyn ToolRunner>,
    pub volumes: Arc<dyn VolumeTools>,
    pub sink: Arc<dyn ResultSink>,
    /// Parsed noise table, hand-labeled mode only.
    pub hand_labels: Option<NoiseLabelTable>,
    /// Identifier stored with the metadata.
    pub job_id: String,
}

/// Audit record of one stage invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage: Stage,
    pub role: ToolRole,
    pub command_line: String,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub dry_run: bool,
    /// Why the invocation counts as failed.
    pub error: Option<String>,
}

impl StageRecord {
    fn new(stage: Stage, command: &StageCommand) -> Self {
        Self {
            stage,
            role: command.role,
            command_line: command.command_line(),
            exit_code: None,
            duration_ms: 0,
            dry_run: false,
            error: None,
        }
    }

    pub fn failed(&self) -> bool {
        self.error.is_some()
    }
}

/// Result of a unit that was processed to the end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitOutcome {
    pub task_label: String,
    pub task_dir: PathBuf,
    pub dummy_frames: usize,
    pub stages: Vec<StageRecord>,
    /// Cleaned series moved out of the ICA directory.
    pub cleaned_outputs: Vec<PathBuf>,
    pub metadata: Option<RunMetadata>,
    /// Why no metadata was produced, if it was attempted.
    pub metadata_error: Option<String>,
}

impl UnitOutcome {
    pub fn tool_failures(&self) -> usize {
        self.stages.iter().filter(|s| s.failed()).count()
    }
}

/// Runs one task unit end to end.
///
/// Tool failures are recorded in the outcome and the unit carries on.
/// Trim/restore, configuration and required-artifact failures are returned;
/// when they happen after the trim, the trimmed inputs are first reinstated
/// from their backups.
pub async fn process_task_unit(
    unit: &TaskUnit,
    mode: ExecutionMode,
    ctx: &UnitContext,
) -> Result<UnitOutcome, PipelineError> {
    let config = &ctx.config;
    info!("Processing {} ({})", unit.task_label, mode);

    if !unit.volume.exists() {
        error!("Input volume {} does not exist", unit.volume.display());
        return Err(ResolveError::NotFound {
            pattern: unit.volume.display().to_string(),
        }
        .into());
    }
    let dummy_frames = config.dummy_frames_for(unit.acquisition().as_deref())?;

    // Inputs that already exist are resolved before any series is modified.
    let ica_dir = match mode {
        ExecutionMode::FullAnalysis => None,
        ExecutionMode::ClassifyAndClean | ExecutionMode::HandLabeled => {
            Some(resolver::first(&unit.ica_dir_pattern())?)
        }
    };
    let hand_labels = match mode {
        ExecutionMode::HandLabeled => Some(hand_labels_for(unit, ctx)?),
        ExecutionMode::FullAnalysis | ExecutionMode::ClassifyAndClean => None,
    };

    let engine = TrimEngine::new(ctx.volumes.clone());
    let record = if config.dry_run {
        if dummy_frames > 0 {
            info!("Dry run: not trimming {} dummy frames", dummy_frames);
        }
        TrimRecord::noop()
    } else {
        engine.trim(unit, dummy_frames).await?
    };

    let inputs = UnitInputs {
        dummy_frames,
        ica_dir,
        hand_labels,
    };
    match run_trimmed(unit, mode, ctx, &engine, &record, inputs).await {
        Ok(outcome) => {
            record.discard().await?;
            info!(
                "Finished {} with {} tool failure(s)",
                unit.task_label,
                outcome.tool_failures()
            );
            Ok(outcome)
        }
        Err(e) => {
            roll_back(unit, &record).await;
            Err(e)
        }
    }
}

/// Per-unit inputs resolved before the trim.
struct UnitInputs<'a> {
    dummy_frames: usize,
    ica_dir: Option<PathBuf>,
    hand_labels: Option<&'a [u32]>,
}

/// Everything between trim and discard: stages, restore, metadata and the
/// report input.
async fn run_trimmed(
    unit: &TaskUnit,
    mode: ExecutionMode,
    ctx: &UnitContext,
    engine: &TrimEngine,
    record: &TrimRecord,
    inputs: UnitInputs<'_>,
) -> Result<UnitOutcome, PipelineError> {
    let config = &ctx.config;
    let mut outcome = UnitOutcome {
        task_label: unit.task_label.clone(),
        task_dir: unit.task_dir.clone(),
        dummy_frames: inputs.dummy_frames,
        stages: Vec::new(),
        cleaned_outputs: Vec::new(),
        metadata: None,
        metadata_error: None,
    };

    let builder = CommandBuilder::new(config, &ctx.tools);
    let mut last_command = None;
    for stage in stages(mode) {
        let command = match stage {
            Stage::FullPipeline => builder.build(*stage, &unit.volume, &unit.task_dir),
            Stage::Classify => {
                let ica_dir = ica_dir_of(unit, &inputs)?;
                builder.build(*stage, &ica_dir, &unit.task_dir)
            }
            Stage::ApplyCleanup => {
                let ica_dir = ica_dir_of(unit, &inputs)?;
                let labels = cleanup_labels(mode, ctx, &ica_dir, inputs.hand_labels).await?;
                let command = builder.build(*stage, &labels, &unit.task_dir);
                let staged = stage_filtered_func(&ica_dir, config.dry_run).await?;
                outcome.stages.push(execute(ctx, *stage, &command).await);
                if staged {
                    fs::remove_file(ica_dir.join(FILTERED_FUNC)).await?;
                }
                if let Some(cleaned) = collect_cleaned(unit, mode, config, &ica_dir).await? {
                    outcome.cleaned_outputs.push(cleaned);
                }
                last_command = Some(command);
                continue;
            }
        };
        outcome.stages.push(execute(ctx, *stage, &command).await);
        last_command = Some(command);
    }

    if config.dry_run {
        info!("Dry run: skipping restore and metadata for {}", unit.task_label);
        return Ok(outcome);
    }

    let volumes = resolver::all(&unit.restore_volume_pattern())?;
    let surfaces = resolver::all(&unit.restore_surface_pattern())?;
    engine.restore(unit, record, &volumes, &surfaces).await?;

    match build_metadata(unit, mode, ctx) {
        Ok(metadata) => {
            ctx.sink.publish_metadata(unit, &metadata).await?;
            outcome.metadata = Some(metadata);
        }
        Err(e @ (PipelineError::Aggregation(_) | PipelineError::NotFound(_))) => {
            warn!("No classification metadata for {}: {}", unit.task_label, e);
            outcome.metadata_error = Some(e.to_string());
        }
        Err(e) => return Err(e),
    }

    if let (Some(command), Ok(ica_dir)) = (&last_command, resolver::first(&unit.ica_dir_pattern())) {
        ctx.sink.publish_report_input(unit, &ica_dir, command).await?;
    }
    Ok(outcome)
}

/// The ICA directory resolved up front, or looked up now for a full
/// analysis, which creates it.
fn ica_dir_of(unit: &TaskUnit, inputs: &UnitInputs<'_>) -> Result<PathBuf, PipelineError> {
    match &inputs.ica_dir {
        Some(dir) => Ok(dir.clone()),
        None => Ok(resolver::first(&unit.ica_dir_pattern())?),
    }
}

/// Reinstates the trimmed inputs after a failed unit.
async fn roll_back(unit: &TaskUnit, record: &TrimRecord) {
    if record.is_noop() {
        return;
    }
    match record.rollback().await {
        Ok(()) => warn!("Reinstated the original inputs of {}", unit.task_label),
        Err(e) => {
            let scratch = record
                .scratch_dir
                .as_deref()
                .map(|d| d.display().to_string())
                .unwrap_or_default();
            error!(
                "Could not reinstate the inputs of {} ({}); backups left in {}",
                unit.task_label, e, scratch
            );
        }
    }
}

/// Runs a stage command and turns its result into a record.
async fn execute(ctx: &UnitContext, stage: Stage, command: &StageCommand) -> StageRecord {
    let mut record = StageRecord::new(stage, command);
    let program = command.command.program_name();
    match ctx.runner.run(&command.command).await {
        Ok(output) => {
            record.exit_code = output.exit_code;
            record.duration_ms = duration_ms(output.duration);
            record.dry_run = output.dry_run;
            if let Some(reason) = output.failure_reason(ctx.config.scan_stderr_for_errors) {
                let err = output.into_error(program, reason);
                error!("{}", err);
                record.error = Some(err.to_string());
            }
        }
        Err(err) => {
            error!("{}", err);
            record.error = Some(err.to_string());
        }
    }
    record
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Label file handed to the cleanup applier.
async fn cleanup_labels(
    mode: ExecutionMode,
    ctx: &UnitContext,
    ica_dir: &Path,
    hand_labels: Option<&[u32]>,
) -> Result<PathBuf, PipelineError> {
    match (mode, hand_labels) {
        (ExecutionMode::HandLabeled, Some(labels)) => {
            let path = ica_dir.join(HAND_LABEL_FILE);
            if ctx.config.dry_run {
                info!("Dry run: not writing {}", path.display());
            } else {
                fs::write(&path, classification::format_noise_list(labels)).await?;
                debug!("Wrote hand labels {:?} to {}", labels, path.display());
            }
            Ok(path)
        }
        (ExecutionMode::HandLabeled, None) => Err(ModeError::HandLabelsNotOrganized(
            "no noise labels resolved for this unit".to_string(),
        )
        .into()),
        (ExecutionMode::ClassifyAndClean | ExecutionMode::FullAnalysis, _) => {
            match resolver::most_recent(&task::label_file_pattern(ica_dir)) {
                Ok(path) => Ok(path),
                // The classifier did not run, so its output is not there yet.
                Err(ResolveError::NotFound { .. }) if ctx.config.dry_run => Ok(ica_dir.join(format!(
                    "fix4melview_{}_thr{}.txt",
                    ctx.config.training_name(),
                    ctx.config.fix_threshold
                ))),
                Err(e) => Err(e.into()),
            }
        }
    }
}

fn hand_labels_for<'a>(unit: &TaskUnit, ctx: &'a UnitContext) -> Result<&'a [u32], PipelineError> {
    let acquisition = unit.acquisition().unwrap_or_default();
    ctx.hand_labels
        .as_ref()
        .and_then(|table| table.labels_for(&unit.identity, &acquisition))
        .ok_or_else(|| {
            ModeError::HandLabelsNotOrganized(format!(
                "no noise labels for acquisition '{}'",
                acquisition
            ))
            .into()
        })
}

/// Links `filtered_func_data.nii.gz` to the highpass-filtered series next to
/// the ICA directory. Returns whether a link was created.
async fn stage_filtered_func(ica_dir: &Path, dry_run: bool) -> Result<bool, PipelineError> {
    let link = ica_dir.join(FILTERED_FUNC);
    let target = PathBuf::from("..").join(format!("{}.nii.gz", ica_stem(ica_dir)));
    if dry_run {
        info!("Dry run: not linking {} -> {}", link.display(), target.display());
        return Ok(false);
    }

    if let Ok(meta) = fs::symlink_metadata(&link).await {
        if meta.file_type().is_symlink() {
            fs::remove_file(&link).await?;
        } else {
            warn!("{} exists and is not a link; using it as is", link.display());
            return Ok(false);
        }
    }
    symlink(&target, &link).await?;
    debug!("Linked {} -> {}", link.display(), target.display());
    Ok(true)
}

#[cfg(unix)]
async fn symlink(target: &Path, link: &Path) -> std::io::Result<()> {
    fs::symlink(target, link).await
}

#[cfg(not(unix))]
async fn symlink(target: &Path, link: &Path) -> std::io::Result<()> {
    let source = link.parent().unwrap_or(Path::new(".")).join(target);
    fs::copy(source, link).await.map(|_| ())
}

fn ica_stem(ica_dir: &Path) -> String {
    ica_dir
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default()
}

/// Moves the cleanup applier's output next to the ICA directory as
/// `<ica-stem>_<tag>_clean.nii.gz`.
async fn collect_cleaned(
    unit: &TaskUnit,
    mode: ExecutionMode,
    config: &FixConfig,
    ica_dir: &Path,
) -> Result<Option<PathBuf>, PipelineError> {
    let source = ica_dir.join(FILTERED_FUNC_CLEAN);
    let name = match mode.clean_tag(config) {
        Some(tag) => format!("{}_{}_clean.nii.gz", ica_stem(ica_dir), tag),
        None => format!("{}_clean.nii.gz", ica_stem(ica_dir)),
    };
    let dest = unit.task_dir.join(name);
    if config.dry_run {
        info!("Dry run: not moving {} -> {}", source.display(), dest.display());
        return Ok(None);
    }
    if !source.exists() {
        warn!("No cleaned output at {}", source.display());
        return Ok(None);
    }
    fs::rename(&source, &dest).await?;
    info!("Cleaned series written to {}", dest.display());
    Ok(Some(dest))
}

/// Aggregates the unit's classification into a metadata document.
fn build_metadata(
    unit: &TaskUnit,
    mode: ExecutionMode,
    ctx: &UnitContext,
) -> Result<RunMetadata, PipelineError> {
    let ica_dir = resolver::first(&unit.ica_dir_pattern())?;
    let variance = VarianceTable::from_path(&resolver::first(&task::icstats_pattern(&ica_dir))?)?;
    let labels = match mode {
        ExecutionMode::HandLabeled => {
            LabelTable::from_noise_list(hand_labels_for(unit, ctx)?, variance.len())?
        }
        ExecutionMode::FullAnalysis | ExecutionMode::ClassifyAndClean => {
            LabelTable::from_path(&resolver::most_recent(&task::label_file_pattern(&ica_dir))?)?
        }
    };
    let summary = classification::join(&labels, &variance)?.summary();
    info!(
        "{}: {} components, {} noise ({:.2}% of explained variance)",
        unit.task_label, summary.component_count, summary.noise_count, summary.noise_variance_percent
    );
    Ok(RunMetadata::new(
        ctx.config.training_name(),
        ctx.job_id.clone(),
        summary,
    ))
}
