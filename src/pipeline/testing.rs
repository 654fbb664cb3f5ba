//! Test doubles for driving units without FSL or FIX installed.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::unit::{UnitContext, FILTERED_FUNC, FILTERED_FUNC_CLEAN};
use crate::classification::RunMetadata;
use crate::command::StageCommand;
use crate::config::{FixConfig, ToolPaths};
use crate::error::{PipelineError, ToolError};
use crate::mode::ExecutionMode;
use crate::runner::{ExternalCommand, ToolOutput, ToolRunner};
use crate::sink::ResultSink;
use crate::task::{TaskUnit, MOTION_TABLE};
use crate::volume::fake::{frames, write_volume, TextFrameTools};
use crate::volume::trim::SCRATCH_PREFIX;

pub const LABEL: &str = "ses-A_task-rest_bold";
pub const ICSTATS: &str = "10.0 4.0\n5.0 2.0\n15.0 6.0\n";
pub const FIX4MELVIEW: &str = "filtered_func_data.ica\n1, Signal, False, 0.9\n2, Unclassified Noise, True, 0.1\n3, Signal, False, 0.8\n[2]\n";

/// Builds one task directory of an HCP tree under `root`.
///
/// Full analysis gets the preprocessed volume; the other modes get the
/// highpass-filtered volume and an ICA directory with variance stats.
pub fn hcp_tree(root: &Path, mode: ExecutionMode) -> TaskUnit {
    let task_dir = root
        .join("sub-01/ses-A/MNINonLinear/Results")
        .join(LABEL);
    std::fs::create_dir_all(&task_dir).unwrap();
    std::fs::write(
        task_dir.join(MOTION_TABLE),
        "0 0 0\n1 1 1\n2 2 2\n3 3 3\n4 4 4\n5 5 5\n",
    )
    .unwrap();

    let frames6 = ["f0", "f1", "f2", "f3", "f4", "f5"];
    if mode.uses_previous_results() {
        write_volume(&task_dir.join(format!("{}_hp2000.nii.gz", LABEL)), &frames6);
        write_ica_dir(&task_dir.join(format!("{}_hp2000.ica", LABEL)), false);
    } else {
        write_volume(&task_dir.join(format!("{}.nii.gz", LABEL)), &frames6);
    }
    TaskUnit::from_task_dir(&task_dir, mode, &FixConfig::new()).unwrap()
}

fn write_ica_dir(ica_dir: &Path, with_labels: bool) {
    let stats_dir = ica_dir.join("filtered_func_data.ica");
    std::fs::create_dir_all(&stats_dir).unwrap();
    std::fs::write(stats_dir.join("melodic_ICstats"), ICSTATS).unwrap();
    if with_labels {
        std::fs::write(ica_dir.join("fix4melview_HCP_hp2000_thr10.txt"), FIX4MELVIEW).unwrap();
    }
}

fn clean(src: &Path, dst: &Path) {
    let cleaned: Vec<String> = frames(src).iter().map(|f| f.replace('f', "c")).collect();
    let cleaned: Vec<&str> = cleaned.iter().map(String::as_str).collect();
    write_volume(dst, &cleaned);
}

/// Plays hcp_fix and fix against the fake frame-per-line files.
pub struct SimulatedFix {
    fail_on: Option<String>,
    calls: Mutex<Vec<ExternalCommand>>,
}

impl SimulatedFix {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            fail_on: None,
            calls: Mutex::new(Vec::new()),
        })
    }

    /// Fails every call whose program name or first argument is `what`.
    pub fn failing(what: &str) -> Arc<Self> {
        Arc::new(Self {
            fail_on: Some(what.to_string()),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn simulate(&self, command: &ExternalCommand) {
        let args = &command.args;
        match (command.program_name().as_str(), args.first().map(String::as_str)) {
            ("hcp_fix", Some(input)) => {
                let input = PathBuf::from(input);
                let task_dir = input.parent().unwrap();
                let stem = input
                    .file_name()
                    .unwrap()
                    .to_string_lossy()
                    .trim_end_matches(".nii.gz")
                    .to_string();
                let hp = format!("{}_hp{}", stem, args[1]);
                std::fs::copy(&input, task_dir.join(format!("{}.nii.gz", hp))).unwrap();
                clean(&input, &task_dir.join(format!("{}_clean.nii.gz", hp)));
                write_ica_dir(&task_dir.join(format!("{}.ica", hp)), true);
            }
            ("fix", Some("-c")) => {
                let ica_dir = Path::new(&args[1]);
                std::fs::write(ica_dir.join("fix4melview_HCP_hp2000_thr10.txt"), FIX4MELVIEW)
                    .unwrap();
            }
            ("fix", Some("-a")) => {
                let ica_dir = Path::new(&args[1]).parent().unwrap();
                clean(&ica_dir.join(FILTERED_FUNC), &ica_dir.join(FILTERED_FUNC_CLEAN));
            }
            _ => {}
        }
    }
}

#[async_trait]
impl ToolRunner for SimulatedFix {
    async fn run(&self, command: &ExternalCommand) -> Result<ToolOutput, ToolError> {
        self.calls.lock().unwrap().push(command.clone());
        let fail = self.fail_on.as_deref().is_some_and(|what| {
            command.program_name() == what || command.args.first().map(String::as_str) == Some(what)
        });
        if !fail {
            self.simulate(command);
        }
        Ok(ToolOutput {
            exit_code: Some(if fail { 1 } else { 0 }),
            stdout: String::new(),
            stderr: if fail {
                "ERROR: simulated failure".to_string()
            } else {
                String::new()
            },
            duration: Duration::from_millis(5),
            dry_run: false,
        })
    }
}

/// Counts what was published.
#[derive(Default)]
pub struct RecordingSink {
    metadata: Mutex<Vec<RunMetadata>>,
    reports: Mutex<Vec<String>>,
    derivatives: Mutex<Vec<(PathBuf, String, String)>>,
    /// Whether a trim scratch directory existed at each metadata publish.
    scratch_at_metadata: Mutex<Vec<bool>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn metadata_count(&self) -> usize {
        self.metadata.lock().unwrap().len()
    }

    pub fn report_count(&self) -> usize {
        self.reports.lock().unwrap().len()
    }

    pub fn derivative_requests(&self) -> Vec<(PathBuf, String, String)> {
        self.derivatives.lock().unwrap().clone()
    }

    pub fn scratch_at_metadata(&self) -> Vec<bool> {
        self.scratch_at_metadata.lock().unwrap().clone()
    }
}

#[async_trait]
impl ResultSink for RecordingSink {
    async fn publish_metadata(
        &self,
        unit: &TaskUnit,
        metadata: &RunMetadata,
    ) -> Result<(), PipelineError> {
        let scratch = std::fs::read_dir(&unit.task_dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .any(|e| e.file_name().to_string_lossy().starts_with(SCRATCH_PREFIX));
        self.scratch_at_metadata.lock().unwrap().push(scratch);
        self.metadata.lock().unwrap().push(metadata.clone());
        Ok(())
    }

    async fn publish_report_input(
        &self,
        _unit: &TaskUnit,
        _ica_dir: &Path,
        command: &StageCommand,
    ) -> Result<(), PipelineError> {
        self.reports.lock().unwrap().push(command.command_line());
        Ok(())
    }

    async fn publish_derivative_request(
        &self,
        root: &Path,
        run_id: &str,
        suffix: &str,
    ) -> Result<(), PipelineError> {
        self.derivatives.lock().unwrap().push((
            root.to_path_buf(),
            run_id.to_string(),
            suffix.to_string(),
        ));
        Ok(())
    }
}

/// Context with a fixed dummy-frame count and fake tools.
pub fn context(runner: Arc<SimulatedFix>, sink: Arc<RecordingSink>, dummy_frames: usize) -> UnitContext {
    UnitContext {
        config: FixConfig::new().with_dummy_volumes(dummy_frames),
        tools: ToolPaths::default(),
        runner,
        volumes: Arc::new(TextFrameTools),
        sink,
        hand_labels: None,
        job_id: "job-test".to_string(),
    }
}
