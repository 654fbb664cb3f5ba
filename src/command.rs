//! Construction of the FIX stage invocations.
//!
//! Each mode maps to a fixed sequence of stages:
//!
//! ```text
//! FullAnalysis     -> [FullPipeline]
//! ClassifyAndClean -> [Classify, ApplyCleanup]
//! HandLabeled      -> [ApplyCleanup]
//! ```
//!
//! The input of a stage is resolved by the caller just before the stage runs,
//! because later stages consume files written by earlier ones.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::{FixConfig, ToolPaths};
use crate::mode::ExecutionMode;
use crate::runner::ExternalCommand;

/// Abstract tool roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolRole {
    /// hcp_fix: ICA, classification and cleanup in one go.
    FullPipelineTool,
    /// `fix -c`: classify existing ICA components.
    ClassifierTool,
    /// `fix -a`: regress out the noise components listed in a label file.
    CleanupApplierTool,
}

impl std::fmt::Display for ToolRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ToolRole::FullPipelineTool => "hcp_fix",
            ToolRole::ClassifierTool => "fix classify",
            ToolRole::CleanupApplierTool => "fix apply cleanup",
        };
        write!(f, "{}", name)
    }
}

/// One stage of a mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Input: the preprocessed volume.
    FullPipeline,
    /// Input: the ICA directory.
    Classify,
    /// Input: the label file (classifier output or hand labels).
    ApplyCleanup,
}

impl Stage {
    /// Tool role that executes this stage.
    pub fn role(&self) -> ToolRole {
        match self {
            Stage::FullPipeline => ToolRole::FullPipelineTool,
            Stage::Classify => ToolRole::ClassifierTool,
            Stage::ApplyCleanup => ToolRole::CleanupApplierTool,
        }
    }
}

/// Stages required by a mode, in execution order.
pub fn stages(mode: ExecutionMode) -> &'static [Stage] {
    match mode {
        ExecutionMode::FullAnalysis => &[Stage::FullPipeline],
        ExecutionMode::ClassifyAndClean => &[Stage::Classify, Stage::ApplyCleanup],
        ExecutionMode::HandLabeled => &[Stage::ApplyCleanup],
    }
}

/// A fully built stage invocation. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageCommand {
    pub role: ToolRole,
    pub command: ExternalCommand,
}

impl StageCommand {
    /// Positional parameters, in order.
    pub fn args(&self) -> &[String] {
        &self.command.args
    }

    /// Verbatim command line for audit and report display.
    pub fn command_line(&self) -> String {
        self.command.command_line()
    }
}

/// Optional motion regression arguments of the cleanup stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CleanupOptions {
    /// Regress motion parameters (`-m`).
    pub motion_regression: bool,
    /// Highpass cutoff applied to the motion parameters (`-h <cutoff>`); only
    /// emitted together with motion regression.
    pub highpass: Option<u32>,
}

impl CleanupOptions {
    pub fn from_config(config: &FixConfig) -> Self {
        Self {
            motion_regression: config.motion_regression,
            highpass: config.motion_regression.then_some(config.highpass),
        }
    }

    fn args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if self.motion_regression {
            args.push("-m".to_string());
            if let Some(highpass) = self.highpass {
                args.push("-h".to_string());
                args.push(highpass.to_string());
            }
        }
        args
    }
}

fn flag(value: bool) -> String {
    let text = if value { "TRUE" } else { "FALSE" };
    text.to_string()
}

/// Stateless builder for stage commands.
pub struct CommandBuilder<'a> {
    config: &'a FixConfig,
    tools: &'a ToolPaths,
}

impl<'a> CommandBuilder<'a> {
    pub fn new(config: &'a FixConfig, tools: &'a ToolPaths) -> Self {
        Self { config, tools }
    }

    /// Builds the command for `stage` with its resolved input.
    pub fn build(&self, stage: Stage, input: &Path, working_dir: &Path) -> StageCommand {
        let command = match stage {
            Stage::FullPipeline => self.full_pipeline(input),
            Stage::Classify => self.classify(input),
            Stage::ApplyCleanup => self.apply_cleanup(input),
        };
        StageCommand {
            role: stage.role(),
            command: command.in_dir(working_dir),
        }
    }

    /// `hcp_fix <input> <highpass> <mot_reg> <training> <threshold> <del_intermediates>`
    fn full_pipeline(&self, input: &Path) -> ExternalCommand {
        ExternalCommand::new(&self.tools.hcp_fix)
            .path_arg(input)
            .arg(self.config.highpass.to_string())
            .arg(flag(self.config.motion_regression))
            .path_arg(&self.config.training_file_path())
            .arg(self.config.fix_threshold.to_string())
            .arg(flag(self.config.delete_intermediates))
    }

    /// `fix -c <ica_dir> <training> <threshold>`
    fn classify(&self, ica_dir: &Path) -> ExternalCommand {
        ExternalCommand::new(&self.tools.fix)
            .arg("-c")
            .path_arg(ica_dir)
            .path_arg(&self.config.training_file_path())
            .arg(self.config.fix_threshold.to_string())
    }

    /// `fix -a <labels> [-m [-h <highpass>]]`
    fn apply_cleanup(&self, labels: &Path) -> ExternalCommand {
        let mut command = ExternalCommand::new(&self.tools.fix)
            .arg("-a")
            .path_arg(labels);
        for arg in CleanupOptions::from_config(self.config).args() {
            command = command.arg(arg);
        }
        command
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn tools() -> ToolPaths {
        ToolPaths {
            hcp_fix: PathBuf::from("/opt/hcp/hcp_fix"),
            fix: PathBuf::from("/opt/fix/fix"),
            fsl_bin: PathBuf::from("/fsl/bin"),
            wb_command: PathBuf::from("/wb/wb_command"),
        }
    }

    #[test]
    fn test_stage_sequences() {
        assert_eq!(stages(ExecutionMode::FullAnalysis), &[Stage::FullPipeline]);
        assert_eq!(
            stages(ExecutionMode::ClassifyAndClean),
            &[Stage::Classify, Stage::ApplyCleanup]
        );
        assert_eq!(stages(ExecutionMode::HandLabeled), &[Stage::ApplyCleanup]);
    }

    #[test]
    fn test_full_pipeline_parameter_order() {
        let mut config = FixConfig::new();
        config.motion_regression = true;
        let tools = tools();
        let builder = CommandBuilder::new(&config, &tools);

        let cmd = builder.build(
            Stage::FullPipeline,
            Path::new("/r/task/task.nii.gz"),
            Path::new("/r/task"),
        );
        assert_eq!(cmd.role, ToolRole::FullPipelineTool);
        assert_eq!(cmd.command.program, PathBuf::from("/opt/hcp/hcp_fix"));
        assert_eq!(
            cmd.args(),
            &[
                "/r/task/task.nii.gz",
                "2000",
                "TRUE",
                "/opt/fix/training_files/HCP_hp2000.RData",
                "10",
                "FALSE"
            ]
        );
        assert_eq!(cmd.command.working_dir, Some(PathBuf::from("/r/task")));
    }

    #[test]
    fn test_classify_parameters() {
        let config = FixConfig::new();
        let tools = tools();
        let cmd = CommandBuilder::new(&config, &tools).build(
            Stage::Classify,
            Path::new("/r/task/task_hp2000.ica"),
            Path::new("/r/task"),
        );
        assert_eq!(cmd.role, ToolRole::ClassifierTool);
        assert_eq!(
            cmd.args(),
            &[
                "-c",
                "/r/task/task_hp2000.ica",
                "/opt/fix/training_files/HCP_hp2000.RData",
                "10"
            ]
        );
    }

    #[test]
    fn test_cleanup_without_motion_regression() {
        let config = FixConfig::new();
        let tools = tools();
        let cmd = CommandBuilder::new(&config, &tools).build(
            Stage::ApplyCleanup,
            Path::new("/ica/hand_label_noise.txt"),
            Path::new("/ica"),
        );
        assert_eq!(cmd.args(), &["-a", "/ica/hand_label_noise.txt"]);
        assert_eq!(cmd.command_line(), "/opt/fix/fix -a /ica/hand_label_noise.txt");
    }

    #[test]
    fn test_cleanup_with_motion_regression() {
        let mut config = FixConfig::new();
        config.motion_regression = true;
        config.highpass = 100;
        let tools = tools();
        let cmd = CommandBuilder::new(&config, &tools).build(
            Stage::ApplyCleanup,
            Path::new("/ica/fix4melview_HCP_hp2000_thr10.txt"),
            Path::new("/ica"),
        );
        assert_eq!(
            cmd.args(),
            &["-a", "/ica/fix4melview_HCP_hp2000_thr10.txt", "-m", "-h", "100"]
        );
    }
}
