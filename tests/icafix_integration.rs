//! Integration tests through the public API.
//!
//! External tools are never spawned: runs use dry-run mode, and the
//! resolver and aggregation tests work on plain files.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use icafix_runner::classification::{join, LabelTable, VarianceTable};
use icafix_runner::pipeline::{Pipeline, RunRequest, RunSummary, UnitStatus};
use icafix_runner::resolver;
use icafix_runner::{
    select_mode, ExecutionMode, FixConfig, FslTools, JsonFileSink, ModeInputs, NoiseLabelTable,
    ProcessRunner, SessionIdentity, ToolPaths,
};
use tempfile::TempDir;

const LABEL: &str = "ses-A_task-rest_acq-AP_bold";

fn task_dir(root: &Path) -> PathBuf {
    let dir = root.join("sub-01/ses-A/MNINonLinear/Results").join(LABEL);
    fs::create_dir_all(&dir).unwrap();
    dir
}

#[test]
fn test_resolver_tie_breaks() {
    let temp = TempDir::new().unwrap();
    fs::create_dir(temp.path().join("b.ica")).unwrap();
    fs::create_dir(temp.path().join("a.ica")).unwrap();
    fs::create_dir(temp.path().join(".hidden.ica")).unwrap();

    assert_eq!(
        resolver::first(&temp.path().join("*.ica")).unwrap(),
        temp.path().join("a.ica")
    );
    assert_eq!(resolver::all(&temp.path().join("*.ica")).unwrap().len(), 2);

    let old = temp.path().join("fix4melview_old.txt");
    let new = temp.path().join("fix4melview_new.txt");
    fs::write(&old, "old").unwrap();
    fs::write(&new, "new").unwrap();
    let past = SystemTime::now() - Duration::from_secs(3600);
    fs::File::options()
        .write(true)
        .open(&new)
        .unwrap()
        .set_modified(SystemTime::now())
        .unwrap();
    fs::File::options()
        .write(true)
        .open(&old)
        .unwrap()
        .set_modified(past)
        .unwrap();
    assert_eq!(
        resolver::most_recent(&temp.path().join("fix4melview*.txt")).unwrap(),
        new
    );
    assert!(resolver::first(&temp.path().join("*.nii.gz")).is_err());
}

#[test]
fn test_mode_table_through_public_api() {
    let identity = SessionIdentity::new("sub-01", "ses-A");
    let full = ModeInputs {
        full_analysis: true,
        ..ModeInputs::default()
    };
    assert_eq!(select_mode(&full, &identity).unwrap(), ExecutionMode::FullAnalysis);

    let table: NoiseLabelTable = serde_json::from_str(
        r#"[{"session": "ses-A", "acquisition": "task-rest_acq-AP", "noise_labels": [1, 4, 7]}]"#,
    )
    .unwrap();
    let hand = ModeInputs {
        previous_results: true,
        hand_labels: Some(table),
        ..ModeInputs::default()
    };
    assert_eq!(select_mode(&hand, &identity).unwrap(), ExecutionMode::HandLabeled);
    assert!(select_mode(&ModeInputs::default(), &identity).is_err());
}

#[test]
fn test_aggregation_from_files() {
    let temp = TempDir::new().unwrap();
    let labels = temp.path().join("fix4melview_HCP_hp2000_thr10.txt");
    let stats = temp.path().join("melodic_ICstats");
    fs::write(
        &labels,
        "/data/x.ica\n1, Signal, False\n2, Unclassified Noise, True\n3, Signal, False\n[2]\n",
    )
    .unwrap();
    fs::write(&stats, "10 3.1\n5 1.2\n15 4.4\n").unwrap();

    let result = join(
        &LabelTable::from_path(&labels).unwrap(),
        &VarianceTable::from_path(&stats).unwrap(),
    )
    .unwrap();
    let summary = result.summary();
    assert_eq!(summary.noise_count, 1);
    assert_eq!(summary.signal_count, 2);
    assert!((summary.noise_variance_percent - 100.0 / 6.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_dry_run_leaves_tree_untouched() {
    let temp = TempDir::new().unwrap();
    let root = temp.path().join("hcp");
    let out = temp.path().join("out");
    let dir = task_dir(&root);
    let volume = dir.join(format!("{}_hp2000.nii.gz", LABEL));
    fs::write(&volume, "volume").unwrap();
    fs::create_dir_all(dir.join(format!("{}_hp2000.ica", LABEL))).unwrap();

    let mut config = FixConfig::new().with_dry_run(true);
    config
        .acquisition_dummy_volumes
        .insert("task-rest_acq-AP".to_string(), 3);

    let tools = ToolPaths::default();
    let runner = Arc::new(ProcessRunner::new().with_dry_run(true));
    let pipeline = Pipeline::prepare(
        RunRequest {
            previous_results: Some(root.clone()),
            config,
            output_dir: out.clone(),
            ..RunRequest::default()
        },
        tools.clone(),
        runner.clone(),
        Arc::new(FslTools::new(runner, tools)),
        Arc::new(JsonFileSink::new(&out)),
    )
    .unwrap();

    let plan = pipeline.plan().unwrap();
    assert_eq!(plan.units[0].dummy_frames, Some(3));
    assert_eq!(plan.derivative_suffix, "_HCP_hp2000");

    let summary = pipeline.run().await.unwrap();
    assert_eq!(summary.units[0].status, UnitStatus::Completed);
    let outcome = summary.units[0].outcome.as_ref().unwrap();
    assert_eq!(outcome.dummy_frames, 3);
    assert!(outcome.stages.iter().all(|s| s.dry_run));
    assert!(outcome.stages[0].command_line.contains(" -c "));

    assert_eq!(fs::read_to_string(&volume).unwrap(), "volume");
    assert!(!out.join("derivative_request.json").exists());

    let written: RunSummary =
        serde_json::from_str(&fs::read_to_string(out.join("run_summary.json")).unwrap()).unwrap();
    assert!(written.dry_run);
    assert_eq!(written.mode, ExecutionMode::ClassifyAndClean);
}
