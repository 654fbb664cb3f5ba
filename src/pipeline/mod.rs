//! ICA-FIX run orchestration.
//!
//! # Pipeline Flow
//!
//! 1. **Mode selection**: the supplied inputs decide between a full
//!    analysis, classify-and-clean and hand-labeled cleanup
//! 2. **Discovery**: task directories are enumerated in lexicographic order
//! 3. **Trim**: dummy frames are cut from each unit's inputs
//! 4. **Stages**: the mode's tool invocations run one at a time
//! 5. **Restore**: dummy frames are stitched back onto every output
//! 6. **Metadata**: the component classification is summarized and published
//!
//! A fatal failure stops the run after the current unit; external tool
//! failures are recorded and the run carries on.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use icafix_runner::pipeline::{Pipeline, RunRequest};
//!
//! let runner = Arc::new(ProcessRunner::new());
//! let pipeline = Pipeline::prepare(
//!     request,
//!     tools.clone(),
//!     runner.clone(),
//!     Arc::new(FslTools::new(runner, tools)),
//!     Arc::new(JsonFileSink::new("output")),
//! )?;
//! let summary = pipeline.run().await?;
//! println!("{} units, {} tool failures", summary.units.len(), summary.tool_failures());
//! ```

pub mod orchestrator;
pub mod unit;

#[cfg(test)]
pub(crate) mod testing;

pub use orchestrator::{
    Pipeline, PlannedUnit, RunPlan, RunRequest, RunSummary, UnitReport, UnitStatus,
    RUN_SUMMARY_FILE,
};
pub use unit::{process_task_unit, StageRecord, UnitContext, UnitOutcome};
