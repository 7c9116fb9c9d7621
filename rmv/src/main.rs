use std::sync::Arc;

use anyhow::{Result, anyhow};
use clap::Parser;
use tracing::instrument;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "rmv",
    version,
    about = "Move a directory tree with rsync and remove the emptied source",
    long_about = "`rmv` copies SOURCE into DESTINATION with `rsync -rP --remove-source-files`, checks that no \
file was left behind and removes the emptied SOURCE tree.

If any file is still present under SOURCE after the copy, nothing is removed and the leftover files are reported.

EXAMPLE:
    # Move a finished download into the library once
    rmv /downloads/complete/show /media/tv --summary

    # Keep moving it every 5 minutes until SIGTERM/SIGINT
    rmv /downloads/complete/show /media/tv --every 5min"
)]
struct Args {
    // Move options
    /// Copy everything but leave the emptied source directory tree in place
    ///
    /// The copy tool still runs and deletes each source file once it has been copied; only the
    /// final removal of the source directories is skipped.
    #[arg(long, help_heading = "Move options")]
    dry_run: bool,

    /// Program used for the copy step, must accept rsync's `-rP --remove-source-files`
    #[arg(
        long,
        default_value = common::transfer::DEFAULT_COPY_TOOL,
        value_name = "PATH",
        help_heading = "Move options"
    )]
    copy_tool: String,

    // Supervision
    /// Repeat the move periodically until SIGTERM/SIGINT
    ///
    /// A failed move is retried after --failure-sleep; a successful one is repeated once this
    /// much time has passed since it started. Accepts a human readable duration, e.g. "30s",
    /// "5min".
    #[arg(long, value_name = "DURATION", value_parser = humantime::parse_duration, help_heading = "Supervision")]
    every: Option<std::time::Duration>,

    /// Pause before retrying a failed move
    #[arg(
        long,
        default_value = "5s",
        value_name = "DURATION",
        value_parser = humantime::parse_duration,
        help_heading = "Supervision"
    )]
    failure_sleep: std::time::Duration,

    /// Longest time to sleep without checking whether a stop was requested
    #[arg(
        long,
        default_value = "5s",
        value_name = "DURATION",
        value_parser = humantime::parse_duration,
        help_heading = "Supervision"
    )]
    poll_interval: std::time::Duration,

    // Progress & output
    /// Verbose level (implies "summary"): -v INFO / -vv DEBUG / -vvv TRACE (default: ERROR)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, help_heading = "Progress & output")]
    verbose: u8,

    /// Print summary at the end
    #[arg(long, help_heading = "Progress & output")]
    summary: bool,

    /// Print the summary as a single JSON object (implies "summary")
    #[arg(long, help_heading = "Progress & output")]
    json: bool,

    /// Quiet mode, don't report errors
    #[arg(short = 'q', long = "quiet", help_heading = "Progress & output")]
    quiet: bool,

    // Advanced settings
    /// Number of worker threads, 0 means number of cores
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_workers: usize,

    // ARGUMENTS
    /// Directory tree to move
    #[arg()]
    source: std::path::PathBuf,

    /// Directory to move SOURCE into
    #[arg()]
    destination: std::path::PathBuf,
}

enum Report {
    Move(common::MoveResult),
    Supervised(common::RunnerSummary),
}

fn describe_failure(status: &common::MoveStatus) -> Option<String> {
    match status {
        common::MoveStatus::Moved | common::MoveStatus::DryRunSkipped => None,
        common::MoveStatus::FilesRemaining { remaining } => Some(format!(
            "{} file(s) still present in source, not removed",
            remaining.len()
        )),
        common::MoveStatus::TransferFailed { cause } => Some(match std::error::Error::source(cause) {
            Some(source) => format!("{cause}: {source}"),
            None => cause.to_string(),
        }),
        common::MoveStatus::CleanupFailed { cause } => Some(format!("{cause:#}")),
    }
}

impl Report {
    fn to_json(&self) -> serde_json::Value {
        match self {
            Report::Move(result) => {
                let remaining = match &result.status {
                    common::MoveStatus::FilesRemaining { remaining } => remaining
                        .iter()
                        .map(|path| path.to_string_lossy().into_owned())
                        .collect(),
                    _ => vec![],
                };
                serde_json::json!({
                    "status": result.status.name(),
                    "record": &result.record,
                    "remaining": remaining,
                    "error": describe_failure(&result.status),
                })
            }
            Report::Supervised(summary) => serde_json::json!({
                "cycles": summary.cycles,
                "failures": summary.failures,
            }),
        }
    }
}

struct Output {
    report: Report,
    json: bool,
}

impl std::fmt::Display for Output {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        if self.json {
            return write!(f, "{}", self.report.to_json());
        }
        match &self.report {
            Report::Move(result) => write!(f, "status: {}\n{}", result.status.name(), result.record),
            Report::Supervised(summary) => write!(f, "{summary}"),
        }
    }
}

async fn move_once(args: &Args, engine: &common::TransferEngine) -> Result<Output> {
    let result = engine
        .move_files(&args.source, &args.destination, args.dry_run)
        .await;
    let failure = describe_failure(&result.status);
    if let common::MoveStatus::FilesRemaining { remaining } = &result.status {
        for path in remaining {
            tracing::error!("left in source: {:?}", path);
        }
    }
    let output = Output {
        report: Report::Move(result),
        json: args.json,
    };
    let Some(failure) = failure else {
        return Ok(output);
    };
    if args.json {
        // failures are not printed by the caller
        println!("{output}");
    }
    if args.summary && !args.json {
        return Err(anyhow!(
            "failed moving {:?} to {:?}: {}\n\n{}",
            args.source,
            args.destination,
            failure,
            output
        ));
    }
    Err(anyhow!(
        "failed moving {:?} to {:?}: {}",
        args.source,
        args.destination,
        failure
    ))
}

async fn move_periodically(
    args: &Args,
    engine: common::TransferEngine,
    period: std::time::Duration,
) -> Result<Output> {
    let config = common::RunnerConfig {
        period,
        failure_sleep: args.failure_sleep,
        poll_interval: args.poll_interval,
    };
    let stop = tokio_util::sync::CancellationToken::new();
    let signals = common::install_signal_handlers(stop.clone())?;
    let engine = Arc::new(engine);
    let work = {
        let source = args.source.clone();
        let destination = args.destination.clone();
        let dry_run = args.dry_run;
        move || {
            let engine = engine.clone();
            let source = source.clone();
            let destination = destination.clone();
            async move {
                // an earlier cycle already moved everything, nothing to do until it reappears
                if !tokio::fs::try_exists(&source).await.unwrap_or(true) {
                    tracing::debug!("{:?} does not exist, nothing to move", source);
                    return anyhow::Ok(true);
                }
                let result = engine.move_files(&source, &destination, dry_run).await;
                if let Some(failure) = describe_failure(&result.status) {
                    tracing::warn!("failed moving {:?}: {}", source, failure);
                }
                anyhow::Ok(result.is_success())
            }
        }
    };
    let runner = common::SupervisedRunner::new("rmv", config, work, stop)?;
    let summary = runner.run().await;
    signals.await?;
    Ok(Output {
        report: Report::Supervised(summary),
        json: args.json,
    })
}

#[instrument]
async fn async_main(args: Args) -> Result<Output> {
    let engine = common::TransferEngine::new(common::transfer::Settings {
        copy_tool: args.copy_tool.clone(),
    });
    match args.every {
        Some(period) => move_periodically(&args, engine, period).await,
        None => move_once(&args, &engine).await,
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    let func = {
        let args = args.clone();
        || async_main(args)
    };
    let output = common::OutputConfig {
        quiet: args.quiet,
        verbose: args.verbose,
        print_summary: args.summary || args.json,
    };
    let runtime = common::RuntimeConfig {
        max_workers: args.max_workers,
    };
    let res = common::run(output, runtime, func);
    if res.is_none() {
        std::process::exit(1);
    }
    Ok(())
}
