//! Command-line interface for taskrelay.
//!
//! Provides commands to submit and poll tasks, run workers, and inspect
//! the queue and the Redis connection.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
