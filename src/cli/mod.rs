//! Command-line interface for rcabench-dispatch.
//!
//! Provides commands for running the dispatcher, submitting and cancelling
//! tasks, and inspecting queues and traces.

mod commands;

pub use commands::{
    exit_code, parse_cli, run, run_with_cli, Cli, CliError, Commands, EXIT_CONFIG,
    EXIT_UNAVAILABLE,
};
