//! In-memory stand-in for FSL: a "volume" is a text file with one frame per
//! line, a "surface" is the same with a `# step <tr>` header line.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use super::{FrameRange, VolumeTools};
use crate::error::ToolError;

const STEP_HEADER: &str = "# step ";

fn io_error(path: &Path, e: std::io::Error) -> ToolError {
    ToolError::Failed {
        program: "fake-volume".to_string(),
        exit_code: Some(1),
        detail: format!("{}: {}", path.display(), e),
    }
}

fn read_frames(path: &Path) -> Result<Vec<String>, ToolError> {
    let content = std::fs::read_to_string(path).map_err(|e| io_error(path, e))?;
    Ok(content
        .lines()
        .filter(|l| !l.starts_with(STEP_HEADER))
        .map(String::from)
        .collect())
}

fn write_frames(path: &Path, header: Option<String>, frames: &[String]) -> Result<(), ToolError> {
    let mut content = String::new();
    if let Some(header) = header {
        content.push_str(&header);
        content.push('\n');
    }
    for frame in frames {
        content.push_str(frame);
        content.push('\n');
    }
    std::fs::write(path, content).map_err(|e| io_error(path, e))
}

/// Writes a fake volume.
pub fn write_volume(path: &Path, frames: &[&str]) {
    let frames: Vec<String> = frames.iter().map(|f| f.to_string()).collect();
    write_frames(path, None, &frames).unwrap();
}

/// Writes a fake surface series.
pub fn write_surface(path: &Path, step: f64, frames: &[&str]) {
    let frames: Vec<String> = frames.iter().map(|f| f.to_string()).collect();
    write_frames(path, Some(format!("{}{}", STEP_HEADER, step)), &frames).unwrap();
}

/// Frames of a fake volume or surface.
pub fn frames(path: &Path) -> Vec<String> {
    read_frames(path).unwrap()
}

#[derive(Debug, Default)]
pub struct TextFrameTools;

#[async_trait]
impl VolumeTools for TextFrameTools {
    async fn frame_count(&self, volume: &Path) -> Result<usize, ToolError> {
        Ok(read_frames(volume)?.len())
    }

    async fn extract_frames(
        &self,
        src: &Path,
        dst: &Path,
        range: FrameRange,
    ) -> Result<(), ToolError> {
        let frames = read_frames(src)?;
        let selected: Vec<String> = frames
            .into_iter()
            .skip(range.start)
            .take(range.count.unwrap_or(usize::MAX))
            .collect();
        write_frames(dst, None, &selected)
    }

    async fn concat_frames(&self, dst: &Path, parts: &[PathBuf]) -> Result<(), ToolError> {
        let mut all = Vec::new();
        for part in parts {
            all.extend(read_frames(part)?);
        }
        write_frames(dst, None, &all)
    }

    async fn step_interval(&self, surface: &Path) -> Result<f64, ToolError> {
        let content = std::fs::read_to_string(surface).map_err(|e| io_error(surface, e))?;
        content
            .lines()
            .find_map(|l| l.strip_prefix(STEP_HEADER))
            .and_then(|s| s.trim().parse().ok())
            .ok_or_else(|| ToolError::UnexpectedOutput {
                program: "fake-volume".to_string(),
                output: content.clone(),
            })
    }

    async fn surface_to_volume(&self, surface: &Path, dst: &Path) -> Result<(), ToolError> {
        let frames = read_frames(surface)?;
        write_frames(dst, None, &frames)
    }

    async fn volume_to_surface(
        &self,
        volume: &Path,
        template: &Path,
        dst: &Path,
        step: f64,
    ) -> Result<(), ToolError> {
        if !template.exists() {
            return Err(io_error(
                template,
                std::io::Error::new(std::io::ErrorKind::NotFound, "template missing"),
            ));
        }
        let frames = read_frames(volume)?;
        write_frames(dst, Some(format!("{}{}", STEP_HEADER, step)), &frames)
    }
}
