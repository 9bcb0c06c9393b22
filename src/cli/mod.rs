//! CLI layer for DeepScan.
//!
//! Provides the command-line interface using clap, with commands for
//! session lifecycle, sandboxed evaluation, map/reduce, and progress
//! monitoring. Shortcut forms are expanded before argument parsing.

pub mod commands;
pub mod output;
pub mod parser;

pub use commands::execute;
pub use output::OutputFormat;
pub use parser::{Cli, Commands, expand_shortcuts};
