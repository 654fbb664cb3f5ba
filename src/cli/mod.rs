//! Command-line interface for icafix.
//!
//! Provides the `run` and `plan` commands.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
