//! Per-source workers
//!
//! One worker owns one source: push workers hold a stream subscription, pull
//! workers run a paced polling loop. A worker handles its own per-event and
//! per-tick errors and only returns on shutdown; an `Err` or a panic is a
//! crash for the supervisor to restart.

pub mod pull;
pub mod push;

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::error::Result;
use crate::rotation::RotationOutcome;
use crate::roster::SourceDescriptor;

pub use pull::{pacing_delay, PullWorker, PullWorkerFactory, PullWorkerSettings, TickReport};
pub use push::{PushWorker, PushWorkerFactory, PushWorkerSettings};

/// Sending side of the process shutdown signal
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }

    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }
}

/// Receiving side, cloned into every worker. Dropping the trigger counts as
/// shutdown.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

pub fn shutdown_channel() -> (ShutdownTrigger, ShutdownSignal) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, ShutdownSignal { rx })
}

impl ShutdownSignal {
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }

    /// Resolves once shutdown has been requested
    pub async fn triggered(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Sleeps for `duration` unless shutdown comes first. Returns true on shutdown.
pub async fn sleep_or_shutdown(duration: Duration, shutdown: &mut ShutdownSignal) -> bool {
    if shutdown.is_triggered() {
        return true;
    }
    tokio::select! {
        _ = tokio::time::sleep(duration) => shutdown.is_triggered(),
        _ = shutdown.triggered() => true,
    }
}

/// A supervised per-source worker
#[async_trait]
pub trait SourceWorker: Send {
    fn source_id(&self) -> &str;

    /// Runs until `shutdown` fires. `Ok` means a clean stop.
    async fn run(&mut self, shutdown: ShutdownSignal) -> Result<()>;
}

/// Builds a fresh worker for a source, once per (re)start
pub trait WorkerFactory: Send + Sync {
    /// Metrics label for the workers this factory builds
    fn mode(&self) -> &'static str;

    fn build(&self, source: &SourceDescriptor) -> Box<dyn SourceWorker>;
}

pub(crate) fn log_rotation(outcome: &RotationOutcome) {
    match outcome {
        RotationOutcome::Archived { date, bundle } => {
            info!(date = %date, bundle = %bundle.display(), "Rotation complete")
        }
        RotationOutcome::AlreadyArchived { date } => {
            info!(date = %date, "Day already archived")
        }
        RotationOutcome::Skipped { date } => {
            info!(date = %date, "Archiving disabled, day directory kept")
        }
        RotationOutcome::Failed { date, reason } => {
            warn!(date = %date, reason = %reason, "Rotation failed, continuing on new day")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shutdown_signal() {
        let (trigger, mut signal) = shutdown_channel();
        let other = trigger.signal();
        assert!(!signal.is_triggered());

        trigger.trigger();
        signal.triggered().await;
        assert!(signal.is_triggered());
        assert!(other.is_triggered());
    }

    #[tokio::test]
    async fn test_dropped_trigger_counts_as_shutdown() {
        let (trigger, mut signal) = shutdown_channel();
        drop(trigger);
        assert!(signal.is_triggered());
        signal.triggered().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_interrupted_by_shutdown() {
        let (trigger, mut signal) = shutdown_channel();
        let sleeper = tokio::spawn(async move {
            sleep_or_shutdown(Duration::from_secs(3600), &mut signal).await
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        trigger.trigger();
        assert!(sleeper.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_runs_to_completion() {
        let (_trigger, mut signal) = shutdown_channel();
        assert!(!sleep_or_shutdown(Duration::from_millis(10), &mut signal).await);
    }
}
