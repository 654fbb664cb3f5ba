//! icafix-runner: ICA-FIX denoising for HCP-style functional MRI trees.
//!
//! This library selects an execution mode from the supplied inputs, walks
//! the task runs of an analysis tree, trims and restores non-steady-state
//! frames around the external FIX tools, and summarizes the resulting ICA
//! component classification.

pub mod classification;
pub mod cli;
pub mod command;
pub mod config;
pub mod error;
pub mod mode;
pub mod pipeline;
pub mod resolver;
pub mod runner;
pub mod sink;
pub mod task;
pub mod volume;

pub use classification::{ClassificationResult, ClassificationSummary, RunMetadata};
pub use command::{CommandBuilder, Stage, StageCommand, ToolRole};
pub use config::{FixConfig, ToolPaths};
pub use error::PipelineError;
pub use mode::{select_mode, ExecutionMode, ModeInputs, NoiseLabelTable, SessionIdentity};
pub use pipeline::{process_task_unit, Pipeline, RunRequest, RunSummary, UnitContext};
pub use resolver::TieBreak;
pub use runner::{ExternalCommand, ProcessRunner, ToolOutput, ToolRunner};
pub use sink::{JsonFileSink, ResultSink};
pub use task::{discover_task_units, TaskUnit};
pub use volume::{FslTools, TrimEngine, TrimRecord, VolumeTools};
