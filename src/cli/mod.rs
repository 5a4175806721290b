//! Command-line interface for skyscan.
//!
//! Provides the producer, worker, consolidator and fleet processes plus
//! broker maintenance commands.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
