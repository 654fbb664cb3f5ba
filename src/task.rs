//! Task units: one functional run's artifact set.
//!
//! Task directories follow the HCP layout
//! `<root>/sub-<id>/ses-<id>/MNINonLinear/Results/<task-label>/` and are
//! processed in lexicographic order.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::FixConfig;
use crate::error::ResolveError;
use crate::mode::{acquisition_name, ExecutionMode, SessionIdentity};
use crate::resolver;

/// Motion regressor table written by the HCP functional pipeline.
pub const MOTION_TABLE: &str = "Movement_Regressors.txt";

/// Hand-label file written into the ICA directory.
pub const HAND_LABEL_FILE: &str = "hand_label_noise.txt";

/// Pattern of task directories relative to the analysis root.
pub fn task_dir_pattern(root: &Path) -> PathBuf {
    root.join("sub-*")
        .join("ses-*")
        .join("MNINonLinear")
        .join("Results")
        .join("*task*")
}

/// Artifacts of one functional run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskUnit {
    /// `.../Results/<task-label>`
    pub task_dir: PathBuf,
    /// Directory name, also the stem of the preprocessed volume.
    pub task_label: String,
    /// Subject and session read from the path.
    pub identity: SessionIdentity,
    /// Volume handed to the first stage.
    pub volume: PathBuf,
    /// Motion regressors, when present.
    pub motion_table: Option<PathBuf>,
    /// CIFTI dense timeseries, when present.
    pub surface_series: Option<PathBuf>,
}

impl TaskUnit {
    /// Builds the unit for a task directory.
    ///
    /// A full analysis starts from `<label>.nii.gz`; the other modes start
    /// from the highpass-filtered `<label>_hp<cutoff>.nii.gz` written by the
    /// previous run. The volume is not required to exist yet.
    pub fn from_task_dir(task_dir: &Path, mode: ExecutionMode, config: &FixConfig) -> Option<Self> {
        let task_label = task_dir.file_name()?.to_string_lossy().to_string();
        let identity = SessionIdentity::from_path(task_dir)?;
        let hp = if mode.uses_previous_results() {
            config.highpass_tag()
        } else {
            String::new()
        };

        let volume = task_dir.join(format!("{}{}.nii.gz", task_label, hp));
        let motion_table = Some(task_dir.join(MOTION_TABLE)).filter(|p| p.is_file());
        let surface_series = Some(task_dir.join(format!("{}_Atlas{}.dtseries.nii", task_label, hp)))
            .filter(|p| p.is_file());

        Some(Self {
            task_dir: task_dir.to_path_buf(),
            task_label,
            identity,
            volume,
            motion_table,
            surface_series,
        })
    }

    /// BIDS acquisition name used for dummy-volume and hand-label lookups.
    pub fn acquisition(&self) -> Option<String> {
        acquisition_name(&self.task_label)
    }

    /// ICA working directory (`<label>_hp<cutoff>.ica`).
    pub fn ica_dir_pattern(&self) -> PathBuf {
        self.task_dir.join("*_hp*.ica")
    }

    /// Highpass-filtered volumes that must get their dummy frames back.
    pub fn restore_volume_pattern(&self) -> PathBuf {
        self.task_dir.join("*hp*.nii.gz")
    }

    /// Highpass-filtered surface series that must get their dummy frames back.
    pub fn restore_surface_pattern(&self) -> PathBuf {
        self.task_dir.join("*Atlas*hp*.dtseries.nii")
    }
}

/// Classifier label file inside an ICA directory (newest wins).
pub fn label_file_pattern(ica_dir: &Path) -> PathBuf {
    ica_dir.join("fix4melview*.txt")
}

/// Per-component variance statistics inside an ICA directory.
pub fn icstats_pattern(ica_dir: &Path) -> PathBuf {
    ica_dir.join("filtered_func_data.ica").join("melodic_ICstats")
}

/// Reads the subject/session identity of the analysis tree.
pub fn discover_identity(root: &Path) -> Result<SessionIdentity, ResolveError> {
    let session_dir = resolver::first(&root.join("sub-*").join("ses-*"))?;
    SessionIdentity::from_path(&session_dir).ok_or_else(|| ResolveError::NotFound {
        pattern: session_dir.display().to_string(),
    })
}

/// Enumerates task units under the analysis root, in lexicographic order.
pub fn discover_task_units(
    root: &Path,
    mode: ExecutionMode,
    config: &FixConfig,
) -> Result<Vec<TaskUnit>, ResolveError> {
    let pattern = task_dir_pattern(root);
    let dirs: Vec<PathBuf> = resolver::all(&pattern)?
        .into_iter()
        .filter(|p| p.is_dir())
        .collect();

    if dirs.is_empty() {
        return Err(ResolveError::NotFound {
            pattern: pattern.display().to_string(),
        });
    }

    info!("Running ICA-FIX for the following directories:");
    let mut units = Vec::with_capacity(dirs.len());
    for dir in dirs {
        match TaskUnit::from_task_dir(&dir, mode, config) {
            Some(unit) => {
                info!("  {}", dir.display());
                units.push(unit);
            }
            None => warn!("Skipping unrecognized task directory {}", dir.display()),
        }
    }
    Ok(units)
}
