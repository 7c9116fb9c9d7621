use std::process::Stdio;

use tokio::io::AsyncBufReadExt;
use tracing::instrument;

/// Failures of a single external command invocation.
///
/// A non-zero exit is reported only after every line the child produced has been handed to the
/// line handler.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("refusing to run an empty command")]
    EmptyCommand,
    #[error("failed to spawn {command:?}")]
    SpawnFailed {
        command: Vec<String>,
        #[source]
        source: std::io::Error,
    },
    #[error("{command:?} {}", describe_exit(.code))]
    TransferFailed {
        code: Option<i32>,
        command: Vec<String>,
    },
    #[error("failed reading output of {command:?}")]
    Io {
        command: Vec<String>,
        #[source]
        source: std::io::Error,
    },
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exited with status code {code}"),
        None => "was terminated by a signal".to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub exit_code: i32,
    /// Last non-blank stdout line, handy for error reports.
    pub last_line: Option<String>,
}

/// Seam between the transfer engine and the operating system.
pub trait CommandExecutor: Send + Sync {
    /// Runs `command` to completion, passing every stdout line to `on_line` as it arrives.
    fn execute(
        &self,
        command: &[String],
        on_line: &mut (dyn FnMut(&str) + Send),
    ) -> impl std::future::Future<Output = Result<ExecutionResult, Error>> + Send;
}

/// Runs commands as local child processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessExecutor;

impl CommandExecutor for ProcessExecutor {
    fn execute(
        &self,
        command: &[String],
        on_line: &mut (dyn FnMut(&str) + Send),
    ) -> impl std::future::Future<Output = Result<ExecutionResult, Error>> + Send {
        run(command, on_line)
    }
}

/// Spawns `command` and streams its stdout line by line into `on_line`.
///
/// Does not return before the child closes stdout; there is no timeout and no way to interrupt
/// a running child from here. Stderr is drained concurrently and forwarded to the log.
#[instrument(skip(on_line))]
pub async fn run(
    command: &[String],
    on_line: &mut (dyn FnMut(&str) + Send),
) -> Result<ExecutionResult, Error> {
    let (program, args) = command.split_first().ok_or(Error::EmptyCommand)?;
    tracing::debug!("spawning {:?}", command);
    let mut child = tokio::process::Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| Error::SpawnFailed {
            command: command.to_vec(),
            source,
        })?;
    let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
        return Err(Error::Io {
            command: command.to_vec(),
            source: std::io::Error::other("child output is not captured"),
        });
    };
    let (read_result, ()) = tokio::join!(
        read_lines(stdout, on_line),
        forward_stderr(program, stderr)
    );
    let last_line = match read_result {
        Ok(last_line) => last_line,
        Err(source) => {
            if let Err(error) = child.start_kill() {
                tracing::debug!("failed to kill {:?}: {}", program, error);
            }
            return Err(Error::Io {
                command: command.to_vec(),
                source,
            });
        }
    };
    let status = child.wait().await.map_err(|source| Error::Io {
        command: command.to_vec(),
        source,
    })?;
    tracing::debug!("{:?} finished: {}", program, status);
    if !status.success() {
        return Err(Error::TransferFailed {
            code: status.code(),
            command: command.to_vec(),
        });
    }
    Ok(ExecutionResult {
        exit_code: status.code().unwrap_or_default(),
        last_line,
    })
}

async fn read_lines(
    stdout: tokio::process::ChildStdout,
    on_line: &mut (dyn FnMut(&str) + Send),
) -> std::io::Result<Option<String>> {
    let mut reader = tokio::io::BufReader::new(stdout);
    let mut buffer = Vec::new();
    let mut last_line = None;
    loop {
        buffer.clear();
        if reader.read_until(b'\n', &mut buffer).await? == 0 {
            return Ok(last_line);
        }
        // file names are not guaranteed to be valid UTF-8
        let line = String::from_utf8_lossy(&buffer);
        let line = line.trim_end_matches(['\n', '\r']);
        on_line(line);
        if !line.trim().is_empty() {
            last_line = Some(line.to_string());
        }
    }
}

/// Logs every stderr line at warn until EOF.
///
/// The pipe is never dropped early: the child would die of SIGPIPE on its next write.
async fn forward_stderr(program: &str, stderr: tokio::process::ChildStderr) {
    let mut reader = tokio::io::BufReader::new(stderr);
    let mut buffer = Vec::new();
    loop {
        buffer.clear();
        match reader.read_until(b'\n', &mut buffer).await {
            Ok(0) => return,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buffer);
                tracing::warn!("{}: {}", program, line.trim_end_matches(['\n', '\r']));
            }
            Err(error) => {
                tracing::debug!("failed reading stderr of {:?}: {}", program, error);
                if let Err(error) = tokio::io::copy(&mut reader, &mut tokio::io::sink()).await {
                    tracing::debug!("failed draining stderr of {:?}: {}", program, error);
                }
                return;
            }
        }
    }
}
