//! Binary entry point for DeepScan-RS.

#![allow(clippy::print_stdout, clippy::print_stderr)]

use clap::Parser;
use deepscan_rs::cli::output::{OutputFormat, format_error};
use deepscan_rs::cli::{Cli, execute, expand_shortcuts};
use deepscan_rs::error::ErrorContext;
use deepscan_rs::sandbox;
use std::io::{self, Write};
use std::process::ExitCode;

fn main() -> ExitCode {
    // The sandbox worker re-invokes this executable; route it before
    // any argument parsing.
    if std::env::args().nth(1).as_deref() == Some(sandbox::WORKER_ARG) {
        return sandbox::run_worker();
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    let args = expand_shortcuts(std::env::args().collect());
    let cli = Cli::parse_from(args);
    let format = OutputFormat::parse(&cli.format);
    let verbose = cli.verbose;

    deepscan_rs::cancel::manager().setup();

    match execute(&cli) {
        Ok(output) => {
            if !output.is_empty() {
                // Handle broken pipe gracefully (e.g. when piped to `head`).
                if let Err(e) = write!(io::stdout(), "{output}")
                    && e.kind() != io::ErrorKind::BrokenPipe
                {
                    eprintln!("Error writing to stdout: {e}");
                    return ExitCode::FAILURE;
                }
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            let rendered = format_error(&e, &ErrorContext::default(), verbose, format);
            match format {
                OutputFormat::Json => {
                    // JSON errors go to stdout for programmatic parsing.
                    println!("{rendered}");
                }
                OutputFormat::Text => {
                    eprintln!("{rendered}");
                }
            }
            ExitCode::from(e.exit_code())
        }
    }
}
