//! `VolumeTools` backed by FSL and Connectome Workbench.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use super::{FrameRange, VolumeTools};
use crate::config::ToolPaths;
use crate::error::ToolError;
use crate::runner::{ExternalCommand, ToolRunner};

/// Drives `fslroi`, `fslmerge`, `fslnvols` and `wb_command` through a [`ToolRunner`].
pub struct FslTools {
    runner: Arc<dyn ToolRunner>,
    paths: ToolPaths,
}

impl FslTools {
    pub fn new(runner: Arc<dyn ToolRunner>, paths: ToolPaths) -> Self {
        Self { runner, paths }
    }

    async fn run(&self, command: ExternalCommand) -> Result<String, ToolError> {
        let output = self.runner.run_checked(&command).await?;
        Ok(output.stdout)
    }

    fn parse<T: std::str::FromStr>(program: &str, stdout: &str) -> Result<T, ToolError> {
        let text = stdout.trim();
        text.parse().map_err(|_| ToolError::UnexpectedOutput {
            program: program.to_string(),
            output: text.to_string(),
        })
    }
}

#[async_trait]
impl VolumeTools for FslTools {
    async fn frame_count(&self, volume: &Path) -> Result<usize, ToolError> {
        let stdout = self
            .run(ExternalCommand::new(self.paths.fsl("fslnvols")).path_arg(volume))
            .await?;
        Self::parse("fslnvols", &stdout)
    }

    async fn extract_frames(
        &self,
        src: &Path,
        dst: &Path,
        range: FrameRange,
    ) -> Result<(), ToolError> {
        // fslroi takes -1 as "through the last frame"
        let size = range
            .count
            .map(|c| c.to_string())
            .unwrap_or_else(|| "-1".to_string());
        self.run(
            ExternalCommand::new(self.paths.fsl("fslroi"))
                .path_arg(src)
                .path_arg(dst)
                .arg(range.start.to_string())
                .arg(size),
        )
        .await?;
        Ok(())
    }

    async fn concat_frames(&self, dst: &Path, parts: &[PathBuf]) -> Result<(), ToolError> {
        let mut command = ExternalCommand::new(self.paths.fsl("fslmerge"))
            .arg("-t")
            .path_arg(dst);
        for part in parts {
            command = command.path_arg(part);
        }
        self.run(command).await?;
        Ok(())
    }

    async fn step_interval(&self, surface: &Path) -> Result<f64, ToolError> {
        let stdout = self
            .run(
                ExternalCommand::new(&self.paths.wb_command)
                    .arg("-file-information")
                    .path_arg(surface)
                    .arg("-only-step-interval"),
            )
            .await?;
        Self::parse("wb_command", &stdout)
    }

    async fn surface_to_volume(&self, surface: &Path, dst: &Path) -> Result<(), ToolError> {
        self.run(
            ExternalCommand::new(&self.paths.wb_command)
                .arg("-cifti-convert")
                .arg("-to-nifti")
                .path_arg(surface)
                .path_arg(dst),
        )
        .await?;
        Ok(())
    }

    async fn volume_to_surface(
        &self,
        volume: &Path,
        template: &Path,
        dst: &Path,
        step: f64,
    ) -> Result<(), ToolError> {
        self.run(
            ExternalCommand::new(&self.paths.wb_command)
                .arg("-cifti-convert")
                .arg("-from-nifti")
                .path_arg(volume)
                .path_arg(template)
                .path_arg(dst)
                .arg("-reset-timepoints")
                .arg(step.to_string())
                .arg("0"),
        )
        .await?;
        Ok(())
    }
}
