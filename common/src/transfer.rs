//! Move a directory tree by delegating the copy to an rsync-compatible tool.
//!
//! A move is three steps:
//!
//! 1. run `<copy-tool> -rP --remove-source-files <source> <destination>`; the tool deletes every
//!    source file right after it has been copied,
//! 2. verify that no file is left under `source`,
//! 3. remove the now empty `source` tree (skipped in dry-run mode).
//!
//! Every outcome, including failures, is reported as a [`MoveStatus`]; nothing here returns an
//! error.

use std::path::{Path, PathBuf};

use anyhow::Context;
use async_recursion::async_recursion;
use tracing::instrument;

use crate::executor::{self, CommandExecutor, ProcessExecutor};
use crate::parser::{OutputParser, ParseEvent, ParserState};

pub const DEFAULT_COPY_TOOL: &str = "rsync";
/// The parser's literal tokens are only valid for this exact flag set.
pub const COPY_FLAGS: [&str; 2] = ["-rP", "--remove-source-files"];

#[derive(Debug, Clone)]
pub struct Settings {
    /// Program invoked for the copy step, resolved through `PATH`.
    pub copy_tool: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            copy_tool: DEFAULT_COPY_TOOL.to_string(),
        }
    }
}

/// Ledger of a single transfer, in the order the tool reported files as done.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct TransferRecord {
    /// File count announced by the tool, if it printed one.
    pub announced: Option<u64>,
    pub files: Vec<String>,
    pub bytes: u64,
    #[serde(skip)]
    last: Option<(u64, u64)>,
}

impl TransferRecord {
    /// Folds a parser event into the ledger; events other than size and completion are ignored.
    pub fn record(&mut self, event: &ParseEvent) {
        match event {
            ParseEvent::SizeAnnounced { count } => self.announced = Some(*count),
            ParseEvent::FileCompleted {
                path,
                counter,
                progress,
            } => {
                let bytes = progress.bytes.unwrap_or_default();
                match (self.last, self.files.last()) {
                    // another progress line for the file that was recorded last
                    (Some((last_counter, last_bytes)), Some(last_path))
                        if last_counter == *counter && last_path == path =>
                    {
                        self.bytes = self.bytes - last_bytes + bytes;
                    }
                    _ => {
                        self.files.push(path.clone());
                        self.bytes += bytes;
                    }
                }
                self.last = Some((*counter, bytes));
            }
            ParseEvent::TransferEnded | ParseEvent::Noise { .. } => {}
        }
    }
}

impl std::fmt::Display for TransferRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "files moved: {}\n\
            files announced: {}\n\
            bytes moved: {}",
            self.files.len(),
            self.announced
                .map_or_else(|| "unknown".to_string(), |count| count.to_string()),
            bytesize::ByteSize(self.bytes),
        )
    }
}

#[derive(Debug)]
pub enum MoveStatus {
    /// Everything was copied and the source tree is gone.
    Moved,
    /// Everything was copied, the (empty) source tree was left in place.
    DryRunSkipped,
    /// The copy tool reported success but files are still present under the source.
    FilesRemaining { remaining: Vec<PathBuf> },
    /// The copy tool could not be started or exited with an error.
    TransferFailed { cause: executor::Error },
    /// Verification or removal of the source tree failed.
    CleanupFailed { cause: anyhow::Error },
}

impl MoveStatus {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            MoveStatus::Moved => "moved",
            MoveStatus::DryRunSkipped => "dry-run-skipped",
            MoveStatus::FilesRemaining { .. } => "files-remaining",
            MoveStatus::TransferFailed { .. } => "transfer-failed",
            MoveStatus::CleanupFailed { .. } => "cleanup-failed",
        }
    }
}

#[derive(Debug)]
pub struct MoveResult {
    pub status: MoveStatus,
    pub record: TransferRecord,
}

impl MoveResult {
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self.status, MoveStatus::Moved | MoveStatus::DryRunSkipped)
    }
}

fn log_event(event: &ParseEvent) {
    match event {
        ParseEvent::SizeAnnounced { count } => tracing::debug!("{} files to consider", count),
        ParseEvent::FileCompleted {
            path,
            counter,
            progress,
        } => tracing::info!(
            "[{}] {}: {}",
            counter,
            path,
            progress.rate.as_deref().unwrap_or("-")
        ),
        ParseEvent::TransferEnded => tracing::debug!("transfer ended"),
        ParseEvent::Noise { line } => tracing::debug!("=> {}", line),
    }
}

/// Lists every non-directory entry under `path`; a missing `path` has none.
#[async_recursion]
pub async fn remaining_files(path: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let metadata = match tokio::fs::symlink_metadata(path).await {
        Ok(metadata) => metadata,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
        Err(error) => {
            return Err(error).with_context(|| format!("failed reading metadata from {path:?}"));
        }
    };
    if !metadata.is_dir() {
        return Ok(vec![path.to_path_buf()]);
    }
    let mut entries = tokio::fs::read_dir(path)
        .await
        .with_context(|| format!("cannot open directory {path:?} for reading"))?;
    let mut remaining = vec![];
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("failed traversing directory {path:?}"))?
    {
        remaining.extend(remaining_files(&entry.path()).await?);
    }
    Ok(remaining)
}

pub struct TransferEngine<E: CommandExecutor = ProcessExecutor> {
    executor: E,
    settings: Settings,
}

impl TransferEngine<ProcessExecutor> {
    #[must_use]
    pub fn new(settings: Settings) -> Self {
        Self::with_executor(ProcessExecutor, settings)
    }
}

impl<E: CommandExecutor> TransferEngine<E> {
    #[must_use]
    pub fn with_executor(executor: E, settings: Settings) -> Self {
        Self { executor, settings }
    }

    #[must_use]
    pub fn copy_command(&self, source: &Path, destination: &Path) -> Vec<String> {
        let mut command = vec![self.settings.copy_tool.clone()];
        command.extend(COPY_FLAGS.iter().map(|flag| (*flag).to_string()));
        command.push(source.to_string_lossy().into_owned());
        command.push(destination.to_string_lossy().into_owned());
        command
    }

    /// Moves `source` to `destination`.
    ///
    /// `dry_run` only prevents removal of the emptied source directory tree. The copy tool runs
    /// in every mode and deletes each source file as soon as it has been copied, so a dry run
    /// still moves the files themselves.
    ///
    /// Moves of overlapping paths must not run concurrently.
    #[instrument(skip(self))]
    pub async fn move_files(&self, source: &Path, destination: &Path, dry_run: bool) -> MoveResult {
        let command = self.copy_command(source, destination);
        let mut parser = OutputParser::new();
        let mut record = TransferRecord::default();
        let outcome = self
            .executor
            .execute(&command, &mut |line: &str| {
                let before = parser.state();
                for event in parser.feed(line) {
                    log_event(&event);
                    record.record(&event);
                }
                if before != ParserState::Copying && parser.state() == ParserState::Copying {
                    tracing::debug!("parsing file list...");
                }
            })
            .await;
        if let Err(cause) = outcome {
            tracing::warn!(
                "failed moving {:?} to {:?}: {:#}",
                source,
                destination,
                &cause
            );
            return MoveResult {
                status: MoveStatus::TransferFailed { cause },
                record,
            };
        }
        tracing::debug!("copied {} file(s), verifying {:?}", record.files.len(), source);
        let status = match cleanup_source(source, dry_run).await {
            Ok(status) => status,
            Err(cause) => {
                tracing::warn!("failed cleaning up {:?}: {:#}", source, &cause);
                MoveStatus::CleanupFailed { cause }
            }
        };
        MoveResult { status, record }
    }
}

async fn cleanup_source(source: &Path, dry_run: bool) -> anyhow::Result<MoveStatus> {
    let mut remaining = remaining_files(source).await?;
    if !remaining.is_empty() {
        remaining.sort();
        tracing::warn!(
            "{} file(s) still present in {:?}, not removing it",
            remaining.len(),
            source
        );
        tracing::warn!("{:?}", &remaining);
        return Ok(MoveStatus::FilesRemaining { remaining });
    }
    if dry_run {
        tracing::info!("dry run, leaving {:?} in place", source);
        return Ok(MoveStatus::DryRunSkipped);
    }
    if tokio::fs::try_exists(source)
        .await
        .with_context(|| format!("failed checking {source:?}"))?
    {
        tracing::info!("removing path and contents of {:?}", source);
        tokio::fs::remove_dir_all(source)
            .await
            .with_context(|| format!("failed removing directory {source:?}"))?;
    }
    Ok(MoveStatus::Moved)
}
