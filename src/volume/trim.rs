//! Dummy-frame trim and restore.
//!
//! `trim` backs the unit's inputs up into a hidden scratch directory inside
//! the task directory (`.dummy-trim-<uuid>/`) and rewrites them without their
//! first `d` frames. `restore` prepends those frames to every output so the
//! restored series has exactly the original length.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{FrameRange, VolumeTools};
use crate::error::TrimRestoreError;
use crate::task::TaskUnit;

/// Prefix of per-unit scratch directories. The leading dot keeps them out of
/// every resolver pattern.
pub const SCRATCH_PREFIX: &str = ".dummy-trim-";

/// One backed-up input series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesBackup {
    /// Path the series lives at in the task directory.
    pub original: PathBuf,
    /// Untouched copy in the scratch directory.
    pub backup: PathBuf,
    /// Frame count before trimming.
    pub frames: usize,
    /// Step interval, surface series only.
    pub step: Option<f64>,
}

/// What `trim` did to a unit, and everything `restore` needs to undo it.
///
/// A zero count means nothing was trimmed and no backup exists. Otherwise the
/// volume is always trimmed; the motion table and surface series only when
/// the unit has them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrimRecord {
    pub dummy_frames: usize,
    pub scratch_dir: Option<PathBuf>,
    pub volume: Option<SeriesBackup>,
    pub motion_table: Option<SeriesBackup>,
    pub surface: Option<SeriesBackup>,
}

impl TrimRecord {
    /// Record of a unit that was left untouched.
    pub fn noop() -> Self {
        Self {
            dummy_frames: 0,
            scratch_dir: None,
            volume: None,
            motion_table: None,
            surface: None,
        }
    }

    pub fn is_noop(&self) -> bool {
        self.dummy_frames == 0
    }

    pub fn volume_trimmed(&self) -> bool {
        self.volume.is_some()
    }

    pub fn motion_trimmed(&self) -> bool {
        self.motion_table.is_some()
    }

    pub fn surface_trimmed(&self) -> bool {
        self.surface.is_some()
    }

    /// Copies every backup back over its original and removes the scratch
    /// directory. The scratch directory is kept if any copy fails.
    pub async fn rollback(&self) -> Result<(), TrimRestoreError> {
        for series in [&self.volume, &self.motion_table, &self.surface]
            .into_iter()
            .flatten()
        {
            require(&series.backup, TrimRestoreError::MissingBackup)?;
            fs::copy(&series.backup, &series.original).await?;
            info!("Rolled back {} from backup", series.original.display());
        }
        self.discard().await
    }

    /// Removes the scratch directory and its backups.
    pub async fn discard(&self) -> Result<(), TrimRestoreError> {
        if let Some(dir) = &self.scratch_dir {
            match fs::remove_dir_all(dir).await {
                Ok(()) => debug!("Removed scratch directory {}", dir.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "series".to_string())
}

async fn remove_if_present(path: &Path) -> Result<(), TrimRestoreError> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn require(path: &Path, missing: fn(PathBuf) -> TrimRestoreError) -> Result<(), TrimRestoreError> {
    if path.exists() {
        Ok(())
    } else {
        Err(missing(path.to_path_buf()))
    }
}

/// Trims and restores dummy frames through a [`VolumeTools`] backend.
pub struct TrimEngine {
    tools: Arc<dyn VolumeTools>,
}

impl TrimEngine {
    pub fn new(tools: Arc<dyn VolumeTools>) -> Self {
        Self { tools }
    }

    /// Removes the first `dummy_frames` frames from the unit's inputs.
    pub async fn trim(
        &self,
        unit: &TaskUnit,
        dummy_frames: usize,
    ) -> Result<TrimRecord, TrimRestoreError> {
        if dummy_frames == 0 {
            return Ok(TrimRecord::noop());
        }
        info!("Removing dummy volumes for ICA-FIX component creation...");

        let frames = self.tools.frame_count(&unit.volume).await?;
        if dummy_frames >= frames {
            return Err(TrimRestoreError::TooManyDummyFrames {
                path: unit.volume.clone(),
                dummy: dummy_frames,
                frames,
            });
        }

        let scratch = unit
            .task_dir
            .join(format!("{}{}", SCRATCH_PREFIX, Uuid::new_v4()));
        fs::create_dir_all(&scratch).await?;
        let mut record = TrimRecord {
            dummy_frames,
            scratch_dir: Some(scratch.clone()),
            ..TrimRecord::noop()
        };

        if let Err(e) = self.trim_series(unit, &scratch, frames, &mut record).await {
            warn!("Trimming {} failed: {}", unit.task_label, e);
            if let Err(rollback) = record.rollback().await {
                error!(
                    "Rollback of {} failed ({}); backups left in {}",
                    unit.task_label,
                    rollback,
                    scratch.display()
                );
            }
            return Err(e);
        }

        info!(
            "Trimmed {} dummy frames from {} (backups in {})",
            dummy_frames,
            unit.task_label,
            scratch.display()
        );
        Ok(record)
    }

    /// Trims each series in turn. A series is registered on `record` once its
    /// backup exists and before its original is rewritten.
    async fn trim_series(
        &self,
        unit: &TaskUnit,
        scratch: &Path,
        frames: usize,
        record: &mut TrimRecord,
    ) -> Result<(), TrimRestoreError> {
        let dummy_frames = record.dummy_frames;

        let backup = scratch.join(file_name(&unit.volume));
        fs::copy(&unit.volume, &backup).await?;
        record.volume = Some(SeriesBackup {
            original: unit.volume.clone(),
            backup: backup.clone(),
            frames,
            step: None,
        });
        self.tools
            .extract_frames(&backup, &unit.volume, FrameRange::from(dummy_frames))
            .await?;

        if let Some(motion) = &unit.motion_table {
            self.trim_motion_table(motion, scratch, record).await?;
        }
        if let Some(surface) = &unit.surface_series {
            self.trim_surface(surface, scratch, record).await?;
        }
        Ok(())
    }

    async fn trim_motion_table(
        &self,
        motion: &Path,
        scratch: &Path,
        record: &mut TrimRecord,
    ) -> Result<(), TrimRestoreError> {
        let backup = scratch.join(file_name(motion));
        fs::copy(motion, &backup).await?;

        let content = fs::read_to_string(&backup).await?;
        let rows: Vec<&str> = content.lines().collect();
        record.motion_table = Some(SeriesBackup {
            original: motion.to_path_buf(),
            backup,
            frames: rows.len(),
            step: None,
        });

        let mut trimmed = rows
            .iter()
            .skip(record.dummy_frames)
            .copied()
            .collect::<Vec<_>>()
            .join("\n");
        if !trimmed.is_empty() {
            trimmed.push('\n');
        }
        fs::write(motion, trimmed).await?;
        Ok(())
    }

    async fn trim_surface(
        &self,
        surface: &Path,
        scratch: &Path,
        record: &mut TrimRecord,
    ) -> Result<(), TrimRestoreError> {
        let dummy_frames = record.dummy_frames;
        let step = self.tools.step_interval(surface).await?;
        let backup = scratch.join(file_name(surface));
        fs::copy(surface, &backup).await?;

        let as_volume = scratch.join("surface_as_volume.nii.gz");
        let trimmed = scratch.join("surface_as_volume_trimmed.nii.gz");
        self.tools.surface_to_volume(&backup, &as_volume).await?;
        let frames = self.tools.frame_count(&as_volume).await?;
        if dummy_frames >= frames {
            return Err(TrimRestoreError::TooManyDummyFrames {
                path: surface.to_path_buf(),
                dummy: dummy_frames,
                frames,
            });
        }
        self.tools
            .extract_frames(&as_volume, &trimmed, FrameRange::from(dummy_frames))
            .await?;

        record.surface = Some(SeriesBackup {
            original: surface.to_path_buf(),
            backup: backup.clone(),
            frames,
            step: Some(step),
        });
        self.tools
            .volume_to_surface(&trimmed, &backup, surface, step)
            .await?;

        remove_if_present(&as_volume).await?;
        remove_if_present(&trimmed).await?;
        Ok(())
    }

    /// Prepends the dummy frames to every output series and reinstates the
    /// trimmed inputs that are not outputs themselves.
    ///
    /// Backups stay in place; call [`TrimRecord::discard`] once the unit is done.
    pub async fn restore(
        &self,
        unit: &TaskUnit,
        record: &TrimRecord,
        volumes: &[PathBuf],
        surfaces: &[PathBuf],
    ) -> Result<(), TrimRestoreError> {
        if record.is_noop() {
            return Ok(());
        }
        let scratch = record
            .scratch_dir
            .clone()
            .unwrap_or_else(|| unit.task_dir.clone());
        let volume = record
            .volume
            .as_ref()
            .ok_or_else(|| TrimRestoreError::MissingBackup(unit.volume.clone()))?;
        require(&volume.backup, TrimRestoreError::MissingBackup)?;

        let head = scratch.join("dummy_frames.nii.gz");
        self.tools
            .extract_frames(&volume.backup, &head, FrameRange::head(record.dummy_frames))
            .await?;
        require(&head, TrimRestoreError::MissingIntermediate)?;

        for output in volumes {
            info!("Adding dummy frames back to ICA cleaned output {}!", file_name(output));
            let merged = scratch.join(format!("merged_{}", file_name(output)));
            self.tools
                .concat_frames(&merged, &[head.clone(), output.clone()])
                .await?;
            self.check_length(&merged, output, volume.frames).await?;
            fs::rename(&merged, output).await?;
        }
        remove_if_present(&head).await?;

        if !surfaces.is_empty() {
            match &record.surface {
                Some(surface) => self.restore_surfaces(&scratch, record, surface, surfaces).await?,
                None => warn!(
                    "{} surface outputs found but no surface series was trimmed; leaving them as is",
                    surfaces.len()
                ),
            }
        }

        if let Some(motion) = &record.motion_table {
            require(&motion.backup, TrimRestoreError::MissingBackup)?;
            fs::copy(&motion.backup, &motion.original).await?;
        }
        for input in [Some(volume), record.surface.as_ref()].into_iter().flatten() {
            let restored = volumes.contains(&input.original) || surfaces.contains(&input.original);
            if !restored {
                require(&input.backup, TrimRestoreError::MissingBackup)?;
                fs::copy(&input.backup, &input.original).await?;
                debug!("Reinstated {} from backup", input.original.display());
            }
        }
        Ok(())
    }

    async fn restore_surfaces(
        &self,
        scratch: &Path,
        record: &TrimRecord,
        surface: &SeriesBackup,
        outputs: &[PathBuf],
    ) -> Result<(), TrimRestoreError> {
        require(&surface.backup, TrimRestoreError::MissingBackup)?;
        let step = surface
            .step
            .ok_or_else(|| TrimRestoreError::MissingStepInterval(surface.original.clone()))?;

        // Head of the original conversion, shared by every output.
        let original = scratch.join("surface_original.nii.gz");
        let head = scratch.join("surface_dummy_frames.nii.gz");
        self.tools.surface_to_volume(&surface.backup, &original).await?;
        self.tools
            .extract_frames(&original, &head, FrameRange::head(record.dummy_frames))
            .await?;
        require(&head, TrimRestoreError::MissingIntermediate)?;
        remove_if_present(&original).await?;

        let converted = scratch.join("surface_output.nii.gz");
        let merged = scratch.join("surface_merged.nii.gz");
        for output in outputs {
            info!("Adding dummy frames back to ICA cleaned output {}!", file_name(output));
            self.tools.surface_to_volume(output, &converted).await?;
            self.tools
                .concat_frames(&merged, &[head.clone(), converted.clone()])
                .await?;
            self.check_length(&merged, output, surface.frames).await?;
            self.tools
                .volume_to_surface(&merged, output, output, step)
                .await?;
            remove_if_present(&converted).await?;
            remove_if_present(&merged).await?;
        }
        remove_if_present(&head).await?;
        Ok(())
    }

    async fn check_length(
        &self,
        merged: &Path,
        output: &Path,
        expected: usize,
    ) -> Result<(), TrimRestoreError> {
        require(merged, TrimRestoreError::MissingIntermediate)?;
        let actual = self.tools.frame_count(merged).await?;
        if actual != expected {
            return Err(TrimRestoreError::FrameCountMismatch {
                path: output.to_path_buf(),
                expected,
                actual,
            });
        }
        Ok(())
    }
}
