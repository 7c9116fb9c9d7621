//! Common utilities and types for the hlab tools
//!
//! This crate provides the shared functionality behind the `rmv` tool: moving directory trees
//! with an rsync-compatible copy tool and running such moves periodically under supervision.
//!
//! # Core Modules
//!
//! - [`parser`] - Incremental classification of `rsync -rP --remove-source-files` output
//! - [`executor`] - Runs external commands and streams their output line by line
//! - [`transfer`] - Copy, verify and clean up a source tree; reports a [`transfer::MoveStatus`]
//! - [`runner`] - Periodic execution of a unit of work with failure back-off and cooperative stop
//! - [`config`] - Runtime, output and runner configuration
//!
//! # Move semantics
//!
//! The copy tool deletes each source file as soon as it is copied. Afterwards the source tree is
//! checked for leftover files: if any remain the tree is left alone and the leftovers are
//! reported, otherwise the (now empty) tree is removed unless dry-run mode is enabled.
//!
//! # Logging
//!
//! Everything logs through `tracing`. [`run`] installs a subscriber whose level follows
//! [`OutputConfig::verbose`] (0 = ERROR, 1 = INFO, 2 = DEBUG, 3 = TRACE) unless `RUST_LOG` is set.

pub mod config;
pub mod executor;
pub mod parser;
pub mod runner;
pub mod transfer;

#[cfg(test)]
mod testutils;

pub use config::{OutputConfig, RunnerConfig, RuntimeConfig};
pub use runner::{Phase, RunnerSummary, SupervisedRunner, install_signal_handlers};
pub use transfer::{MoveResult, MoveStatus, TransferEngine, TransferRecord, remaining_files};

fn setup_tracing(output: &OutputConfig) {
    let level = if output.quiet {
        "off"
    } else {
        match output.verbose {
            0 => "error",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    let result = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(output.verbose > 2)
        .try_init();
    if let Err(error) = result {
        eprintln!("failed to install tracing subscriber: {error}");
    }
}

/// Sets up logging and a tokio runtime, then drives `func` to completion.
///
/// Returns `None` on failure; the error has been logged already. The summary is printed on
/// success when requested (or when running verbose).
pub fn run<Fut, Summary, Error>(
    output: OutputConfig,
    runtime: RuntimeConfig,
    func: impl FnOnce() -> Fut,
) -> Option<Summary>
where
    Summary: std::fmt::Display,
    Error: std::fmt::Display,
    Fut: std::future::Future<Output = Result<Summary, Error>>,
{
    setup_tracing(&output);
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if runtime.max_workers > 0 {
        builder.worker_threads(runtime.max_workers);
    }
    let runtime = match builder.build() {
        Ok(runtime) => runtime,
        Err(error) => {
            tracing::error!("failed to start tokio runtime: {:#}", &error);
            return None;
        }
    };
    match runtime.block_on(func()) {
        Ok(summary) => {
            if output.print_summary || output.verbose > 0 {
                println!("{summary}");
            }
            Some(summary)
        }
        Err(error) => {
            if !output.quiet {
                tracing::error!("{:#}", &error);
            }
            None
        }
    }
}
