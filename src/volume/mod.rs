//! Timeseries manipulation for dummy-frame handling.
//!
//! This module removes leading non-steady-state frames before ICA and puts
//! them back afterwards, so every output keeps the scan length of its input.
//!
//! # Architecture
//!
//! ```text
//! TrimEngine ──uses──> dyn VolumeTools ──> FslTools (fslroi / fslmerge / fslnvols / wb_command)
//! ```
//!
//! Surface (CIFTI) series are handled by converting them to a volumetric
//! form, editing the frames there and converting back with the original
//! step interval.

pub mod fsl;
pub mod trim;

#[cfg(test)]
pub(crate) mod fake;

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::ToolError;

pub use fsl::FslTools;
pub use trim::{SeriesBackup, TrimEngine, TrimRecord};

/// A contiguous run of frames along the time axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameRange {
    /// First frame (0-based).
    pub start: usize,
    /// Number of frames; `None` runs to the end of the series.
    pub count: Option<usize>,
}

impl FrameRange {
    /// The first `count` frames.
    pub fn head(count: usize) -> Self {
        Self {
            start: 0,
            count: Some(count),
        }
    }

    /// Everything from `start` on.
    pub fn from(start: usize) -> Self {
        Self { start, count: None }
    }
}

/// Frame-level operations on 4D volumes and surface series.
#[async_trait]
pub trait VolumeTools: Send + Sync {
    /// Number of frames in a volume.
    async fn frame_count(&self, volume: &Path) -> Result<usize, ToolError>;

    /// Writes the frames of `src` selected by `range` to `dst`.
    async fn extract_frames(&self, src: &Path, dst: &Path, range: FrameRange)
        -> Result<(), ToolError>;

    /// Concatenates `parts` along time into `dst`.
    async fn concat_frames(&self, dst: &Path, parts: &[PathBuf]) -> Result<(), ToolError>;

    /// Step interval (TR) of a surface series.
    async fn step_interval(&self, surface: &Path) -> Result<f64, ToolError>;

    /// Converts a surface series to a volumetric form with the same frames.
    async fn surface_to_volume(&self, surface: &Path, dst: &Path) -> Result<(), ToolError>;

    /// Converts a volume back to a surface series shaped like `template`,
    /// resetting the time axis to `step` with a zero origin.
    async fn volume_to_surface(
        &self,
        volume: &Path,
        template: &Path,
        dst: &Path,
        step: f64,
    ) -> Result<(), ToolError>;
}
