//! Periodic, failure tolerant execution of a unit of work.
//!
//! A [`SupervisedRunner`] calls its [`Work`] over and over:
//!
//! - after a successful cycle it waits until `period` has passed since the cycle started,
//! - after a failed cycle (`Ok(false)`, an error or a panic) it sleeps `failure_sleep` and
//!   retries, forever,
//! - once the stop token is cancelled it leaves the loop at the next check without calling the
//!   work again.
//!
//! Stopping is cooperative. The token is checked before every cycle and every sleep wakes up as
//! soon as it is cancelled, but a cycle that is already running (e.g. an in-flight transfer) is
//! always allowed to finish.
//!
//! Every runner owns its state and runs on its own task; runners only share what the caller
//! explicitly gives them (typically the stop token).

use std::future::Future;

use anyhow::Context;
use futures::FutureExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::RunnerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Running,
    Stopping,
    Stopped,
}

/// A unit of work invoked once per cycle.
pub trait Work: Send {
    /// Returns whether the cycle succeeded; an error counts as a failed cycle.
    fn run(&mut self) -> impl Future<Output = anyhow::Result<bool>> + Send;
}

impl<F, Fut> Work for F
where
    F: FnMut() -> Fut + Send,
    Fut: Future<Output = anyhow::Result<bool>> + Send,
{
    fn run(&mut self) -> impl Future<Output = anyhow::Result<bool>> + Send {
        self()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunnerSummary {
    pub cycles: u64,
    pub failures: u64,
}

impl std::fmt::Display for RunnerSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "cycles: {}\n\
            failed cycles: {}",
            self.cycles, self.failures,
        )
    }
}

pub struct SupervisedRunner<W> {
    name: String,
    config: RunnerConfig,
    work: W,
    stop: CancellationToken,
    phase: tokio::sync::watch::Sender<Phase>,
}

impl<W: Work> SupervisedRunner<W> {
    pub fn new(
        name: impl Into<String>,
        config: RunnerConfig,
        work: W,
        stop: CancellationToken,
    ) -> anyhow::Result<Self> {
        config.validate().map_err(anyhow::Error::msg)?;
        let (phase, _) = tokio::sync::watch::channel(Phase::Running);
        Ok(Self {
            name: name.into(),
            config,
            work,
            stop,
            phase,
        })
    }

    /// Subscribes to phase transitions.
    pub fn phases(&self) -> tokio::sync::watch::Receiver<Phase> {
        self.phase.subscribe()
    }

    /// Runs cycles until the stop token is cancelled.
    pub async fn run(mut self) -> RunnerSummary {
        let mut summary = RunnerSummary::default();
        tracing::info!(
            "{}: running every {} (retry after {})",
            self.name,
            humantime::format_duration(self.config.period),
            humantime::format_duration(self.config.failure_sleep),
        );
        while !self.stop.is_cancelled() {
            let cycle_start = Instant::now();
            summary.cycles += 1;
            tracing::debug!("{}: cycle {}", self.name, summary.cycles);
            if self.run_work().await {
                wait_until(
                    &self.stop,
                    cycle_start + self.config.period,
                    self.config.poll_interval,
                )
                .await;
            } else {
                summary.failures += 1;
                tracing::warn!(
                    "{}: cycle failed, retrying in {}",
                    self.name,
                    humantime::format_duration(self.config.failure_sleep)
                );
                sleep_unless_stopped(&self.stop, self.config.failure_sleep).await;
            }
        }
        self.phase.send_replace(Phase::Stopping);
        tracing::info!("{}: stopping", self.name);
        self.phase.send_replace(Phase::Stopped);
        tracing::info!(
            "{}: stopped after {} cycle(s), {} failed",
            self.name,
            summary.cycles,
            summary.failures
        );
        summary
    }

    async fn run_work(&mut self) -> bool {
        // the call itself happens inside the guarded future so a panicking closure is caught too
        let work = &mut self.work;
        match std::panic::AssertUnwindSafe(async move { work.run().await })
            .catch_unwind()
            .await
        {
            Ok(Ok(success)) => success,
            Ok(Err(error)) => {
                tracing::warn!("{}: {:#}", self.name, error);
                false
            }
            Err(panic) => {
                tracing::error!("{}: work panicked: {}", self.name, panic_message(&*panic));
                false
            }
        }
    }
}

impl<W: Work + 'static> SupervisedRunner<W> {
    /// Runs the loop on its own task.
    pub fn spawn(self) -> tokio::task::JoinHandle<RunnerSummary> {
        tokio::spawn(self.run())
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

async fn sleep_unless_stopped(stop: &CancellationToken, duration: std::time::Duration) {
    tokio::select! {
        () = tokio::time::sleep(duration) => {}
        () = stop.cancelled() => {}
    }
}

/// Sleeps until `deadline` in steps of at most `poll_interval`, returning early once stopped.
async fn wait_until(stop: &CancellationToken, deadline: Instant, poll_interval: std::time::Duration) {
    loop {
        let now = Instant::now();
        if stop.is_cancelled() || now >= deadline {
            return;
        }
        sleep_unless_stopped(stop, (deadline - now).min(poll_interval)).await;
    }
}

/// Cancels `stop` on the first SIGTERM or SIGINT.
///
/// The handlers are registered before this returns; the returned task only flips the token and
/// exits, it never does any other work. It also exits quietly if `stop` is cancelled by someone
/// else.
pub fn install_signal_handlers(
    stop: CancellationToken,
) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    use tokio::signal::unix::{SignalKind, signal};
    let mut terminate =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    let mut interrupt =
        signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;
    Ok(tokio::spawn(async move {
        let received = tokio::select! {
            _ = terminate.recv() => "SIGTERM",
            _ = interrupt.recv() => "SIGINT",
            () = stop.cancelled() => return,
        };
        tracing::info!("received {}, requesting stop", received);
        stop.cancel();
    }))
}
