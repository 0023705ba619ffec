//! Worker supervision
//!
//! One task per source. Each (re)start runs the worker in its own spawned
//! task so a panic surfaces as a `JoinError` instead of taking down its
//! neighbours. Crashed workers are rebuilt after an exponential backoff that
//! resets once a worker has stayed up longer than the backoff ceiling.

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, info_span, warn, Instrument, Span};

use crate::config::Config;
use crate::metrics;
use crate::roster::SourceDescriptor;
use crate::worker::{sleep_or_shutdown, ShutdownSignal, WorkerFactory};

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(60),
        }
    }
}

impl SupervisorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            initial_backoff: config.restart_initial_backoff(),
            max_backoff: config.restart_max_backoff(),
        }
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_backoff)
            .with_max_interval(self.max_backoff)
            .with_multiplier(2.0)
            .with_randomization_factor(0.2)
            .with_max_elapsed_time(None)
            .build()
    }
}

/// Per-source restart counts, returned once every worker has stopped
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SupervisorReport {
    pub restarts: Vec<(String, u32)>,
}

impl SupervisorReport {
    pub fn restarts_for(&self, source_id: &str) -> Option<u32> {
        self.restarts
            .iter()
            .find(|(id, _)| id == source_id)
            .map(|(_, n)| *n)
    }
}

pub struct Supervisor {
    factory: Arc<dyn WorkerFactory>,
    settings: SupervisorSettings,
    span: Span,
}

impl Supervisor {
    /// `span` is the logging handle every worker span is parented to
    pub fn new(factory: Arc<dyn WorkerFactory>, settings: SupervisorSettings, span: Span) -> Self {
        Self {
            factory,
            settings,
            span,
        }
    }

    /// Runs one worker per source and returns once all of them have stopped,
    /// which only happens after `shutdown` fires.
    pub async fn run(&self, sources: Vec<SourceDescriptor>, shutdown: ShutdownSignal) -> SupervisorReport {
        let mode = self.factory.mode();
        let mut handles = Vec::with_capacity(sources.len());

        for source in sources {
            let span = info_span!(parent: &self.span, "worker", source = %source.id, mode);
            let id = source.id.clone();
            let task = supervise(source, self.factory.clone(), self.settings.clone(), shutdown.clone());
            handles.push((id, tokio::spawn(task.instrument(span))));
        }

        self.span.in_scope(|| info!(workers = handles.len(), mode, "All workers started"));

        let mut report = SupervisorReport::default();
        for (id, handle) in handles {
            match handle.await {
                Ok(restarts) => report.restarts.push((id, restarts)),
                Err(e) => {
                    self.span.in_scope(|| error!(source = %id, error = %e, "Supervision task failed"));
                    report.restarts.push((id, 0));
                }
            }
        }

        self.span.in_scope(|| info!(mode, "All workers stopped"));
        report
    }
}

/// Keeps one source alive until shutdown. Returns the number of restarts.
async fn supervise(
    source: SourceDescriptor,
    factory: Arc<dyn WorkerFactory>,
    settings: SupervisorSettings,
    mut shutdown: ShutdownSignal,
) -> u32 {
    let mode = factory.mode();
    let mut backoff = settings.backoff();
    let mut restarts = 0u32;

    loop {
        if shutdown.is_triggered() {
            break;
        }

        let mut worker = factory.build(&source);
        let worker_shutdown = shutdown.clone();
        let started = Instant::now();

        metrics::inc_active_workers(mode);
        let handle = tokio::spawn(async move { worker.run(worker_shutdown).await }.in_current_span());
        let joined = handle.await;
        metrics::dec_active_workers(mode);

        let fault = match joined {
            Ok(Ok(())) if shutdown.is_triggered() => break,
            Ok(Ok(())) => "worker returned before shutdown".to_string(),
            Ok(Err(e)) => e.to_string(),
            Err(e) if e.is_panic() => format!("panicked: {}", panic_message(e.into_panic())),
            Err(e) => e.to_string(),
        };

        if shutdown.is_triggered() {
            break;
        }

        error!(error = %fault, uptime = %humantime::format_duration(round_secs(started.elapsed())), "Worker crashed");

        if started.elapsed() > settings.max_backoff {
            backoff.reset();
        }
        let delay = backoff.next_backoff().unwrap_or(settings.max_backoff);
        restarts += 1;
        metrics::record_restart(mode);
        warn!(restarts, delay = %humantime::format_duration(delay), "Restarting worker");

        if sleep_or_shutdown(delay, &mut shutdown).await {
            break;
        }
    }

    info!(restarts, "Supervision ended");
    restarts
}

fn round_secs(d: Duration) -> Duration {
    Duration::from_secs(d.as_secs())
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{IngestionError, Result};
    use crate::worker::{shutdown_channel, SourceWorker};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    enum Behaviour {
        Healthy,
        Panics,
        Fails,
    }

    struct TestWorker {
        id: String,
        behaviour: Behaviour,
        ticks: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl SourceWorker for TestWorker {
        fn source_id(&self) -> &str {
            &self.id
        }

        async fn run(&mut self, mut shutdown: ShutdownSignal) -> Result<()> {
            match self.behaviour {
                Behaviour::Panics => panic!("boom in {}", self.id),
                Behaviour::Fails => Err(IngestionError::WorkerFailed("disk gone".into())),
                Behaviour::Healthy => loop {
                    self.ticks.fetch_add(1, Ordering::SeqCst);
                    if sleep_or_shutdown(Duration::from_millis(5), &mut shutdown).await {
                        return Ok(());
                    }
                },
            }
        }
    }

    struct TestFactory {
        builds: AtomicUsize,
        healthy_ticks: Arc<AtomicUsize>,
    }

    impl WorkerFactory for TestFactory {
        fn mode(&self) -> &'static str {
            "test"
        }

        fn build(&self, source: &SourceDescriptor) -> Box<dyn SourceWorker> {
            self.builds.fetch_add(1, Ordering::SeqCst);
            let behaviour = match source.id.as_str() {
                "panics.social" => Behaviour::Panics,
                "fails.social" => Behaviour::Fails,
                _ => Behaviour::Healthy,
            };
            Box::new(TestWorker {
                id: source.id.clone(),
                behaviour,
                ticks: self.healthy_ticks.clone(),
            })
        }
    }

    fn settings() -> SupervisorSettings {
        SupervisorSettings {
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(20),
        }
    }

    #[tokio::test]
    async fn test_panicking_worker_is_isolated_and_restarted() {
        let factory = Arc::new(TestFactory {
            builds: AtomicUsize::new(0),
            healthy_ticks: Arc::new(AtomicUsize::new(0)),
        });
        let supervisor = Supervisor::new(factory.clone(), settings(), Span::none());
        let sources = vec![
            SourceDescriptor::new("ok.social", None).unwrap(),
            SourceDescriptor::new("panics.social", None).unwrap(),
            SourceDescriptor::new("fails.social", None).unwrap(),
        ];
        let (trigger, signal) = shutdown_channel();

        let run = tokio::spawn(async move { supervisor.run(sources, signal).await });
        tokio::time::sleep(Duration::from_millis(200)).await;
        let ticks_before = factory.healthy_ticks.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.trigger();
        let report = run.await.unwrap();

        assert!(factory.healthy_ticks.load(Ordering::SeqCst) > ticks_before);
        assert_eq!(report.restarts_for("ok.social"), Some(0));
        assert!(report.restarts_for("panics.social").unwrap() >= 2);
        assert!(report.restarts_for("fails.social").unwrap() >= 2);
    }

    #[tokio::test]
    async fn test_run_returns_after_shutdown() {
        let factory = Arc::new(TestFactory {
            builds: AtomicUsize::new(0),
            healthy_ticks: Arc::new(AtomicUsize::new(0)),
        });
        let supervisor = Supervisor::new(factory.clone(), settings(), Span::none());
        let (trigger, signal) = shutdown_channel();
        trigger.trigger();

        let report = supervisor
            .run(vec![SourceDescriptor::new("ok.social", None).unwrap()], signal)
            .await;

        assert_eq!(report.restarts_for("ok.social"), Some(0));
        assert_eq!(factory.builds.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_panic_message() {
        assert_eq!(panic_message(Box::new("static")), "static");
        assert_eq!(panic_message(Box::new(String::from("owned"))), "owned");
        assert_eq!(panic_message(Box::new(7u8)), "non-string panic payload");
    }
}
