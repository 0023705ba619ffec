//! Push worker: one long-lived event-stream subscription per source

use async_trait::async_trait;
use futures::StreamExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::{log_rotation, sleep_or_shutdown, ShutdownSignal, SourceWorker, WorkerFactory};
use crate::append_log::AppendLogStorage;
use crate::bucket::{self, Clock};
use crate::config::Config;
use crate::error::{ErrorKind, Result};
use crate::metrics::{self, MODE_PUSH};
use crate::rotation::{Archiver, HourlyTally, PeriodRotator};
use crate::roster::SourceDescriptor;
use crate::schemas::StoredRecord;
use crate::sources::{EventStream, EventStreamClient, StreamMessage};

#[derive(Debug, Clone)]
pub struct PushWorkerSettings {
    /// Fixed wait between a stream failure and the next subscription
    pub reconnect_backoff: Duration,
    /// A subscription silent for this long is treated as dead
    pub idle_timeout: Duration,
    pub hourly_tally: bool,
}

impl Default for PushWorkerSettings {
    fn default() -> Self {
        Self {
            reconnect_backoff: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(90),
            hourly_tally: true,
        }
    }
}

impl PushWorkerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            reconnect_backoff: config.reconnect_backoff(),
            idle_timeout: config.stream_idle_timeout(),
            hourly_tally: config.hourly_tally,
        }
    }
}

pub struct PushWorker {
    source: SourceDescriptor,
    client: Arc<dyn EventStreamClient>,
    storage: Arc<dyn AppendLogStorage>,
    base: PathBuf,
    clock: Arc<dyn Clock>,
    rotator: PeriodRotator,
    tally: Option<HourlyTally>,
    settings: PushWorkerSettings,
}

enum SessionEnd {
    Shutdown,
    Disconnected,
}

impl PushWorker {
    pub fn new(
        source: SourceDescriptor,
        client: Arc<dyn EventStreamClient>,
        storage: Arc<dyn AppendLogStorage>,
        base: impl Into<PathBuf>,
        clock: Arc<dyn Clock>,
        archiver: Option<Arc<Archiver>>,
        settings: PushWorkerSettings,
    ) -> Self {
        let rotator = PeriodRotator::new(clock.now(), archiver);
        let tally = settings.hourly_tally.then(HourlyTally::new);
        Self {
            source,
            client,
            storage,
            base: base.into(),
            clock,
            rotator,
            tally,
            settings,
        }
    }

    /// Handles one inbound message: rotation check, tagging, append.
    /// Returns the number of records written.
    pub async fn deliver(&mut self, message: StreamMessage) -> Result<usize> {
        let (event_type, record) = match message {
            StreamMessage::Heartbeat => {
                debug!("Received heartbeat");
                return Ok(0);
            }
            StreamMessage::Event { event_type, record } => (event_type, record),
        };

        // Held until the append completes so the day cannot be archived under it
        let admission = self.rotator.enter(self.clock.as_ref()).await;
        admission.rotations.iter().for_each(log_rotation);
        let now = admission.now;
        if let Some((hour, count)) = self.tally.as_mut().and_then(|t| t.record(now)) {
            info!(hour = %hour.format("%Y-%m-%dT%H:00Z"), records = count, "Hourly tally");
        }

        let path = bucket::bucket_path(&self.base, &self.source.id, now, None);
        let stored = StoredRecord::new(record, now, Some(event_type));
        let written = self.storage.append(&path, std::slice::from_ref(&stored)).await?;

        drop(admission);

        metrics::record_appended(MODE_PUSH, &self.source.id, written as u64);
        Ok(written)
    }

    /// Reads one subscription until it fails, goes idle, or shutdown fires.
    /// Appends are never raced against shutdown.
    async fn consume(&mut self, mut stream: EventStream, shutdown: &mut ShutdownSignal) -> SessionEnd {
        let idle = self.settings.idle_timeout;
        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.triggered() => return SessionEnd::Shutdown,
                next = tokio::time::timeout(idle, stream.next()) => next,
            };

            match next {
                Err(_) => {
                    warn!(idle_secs = idle.as_secs(), "Stream idle, reconnecting");
                    metrics::record_error(MODE_PUSH, ErrorKind::Transport.as_str());
                    return SessionEnd::Disconnected;
                }
                Ok(None) => {
                    warn!("Stream closed by server");
                    return SessionEnd::Disconnected;
                }
                Ok(Some(Err(e))) if e.kind() == ErrorKind::Decode => {
                    warn!(error = %e, "Dropping undecodable event");
                    metrics::record_error(MODE_PUSH, e.kind().as_str());
                }
                Ok(Some(Err(e))) => {
                    error!(error = %e, "Streaming aborted");
                    metrics::record_error(MODE_PUSH, e.kind().as_str());
                    return SessionEnd::Disconnected;
                }
                Ok(Some(Ok(message))) => {
                    if let Err(e) = self.deliver(message).await {
                        error!(error = %e, "Failed to save event");
                        metrics::record_error(MODE_PUSH, e.kind().as_str());
                    }
                }
            }
        }
    }
}

#[async_trait]
impl SourceWorker for PushWorker {
    fn source_id(&self) -> &str {
        &self.source.id
    }

    async fn run(&mut self, mut shutdown: ShutdownSignal) -> Result<()> {
        info!(url = %self.source.api_base_url, "Starting push worker");

        loop {
            if shutdown.is_triggered() {
                break;
            }

            let client = self.client.clone();
            let subscribed = tokio::select! {
                biased;
                _ = shutdown.triggered() => break,
                result = client.subscribe(&self.source) => result,
            };

            match subscribed {
                Ok(stream) => {
                    info!("Listening to stream");
                    if let SessionEnd::Shutdown = self.consume(stream, &mut shutdown).await {
                        break;
                    }
                }
                Err(e) => {
                    error!(error = %e, "Error in streaming");
                    metrics::record_error(MODE_PUSH, e.kind().as_str());
                }
            }

            metrics::record_reconnect(&self.source.id);
            debug!(backoff_secs = self.settings.reconnect_backoff.as_secs(), "Waiting before reconnect");
            if sleep_or_shutdown(self.settings.reconnect_backoff, &mut shutdown).await {
                break;
            }
        }

        info!("Push worker stopped");
        Ok(())
    }
}

/// Shared parts for building push workers
pub struct PushWorkerFactory {
    pub client: Arc<dyn EventStreamClient>,
    pub storage: Arc<dyn AppendLogStorage>,
    pub base: PathBuf,
    pub clock: Arc<dyn Clock>,
    pub archiver: Option<Arc<Archiver>>,
    pub settings: PushWorkerSettings,
}

impl WorkerFactory for PushWorkerFactory {
    fn mode(&self) -> &'static str {
        MODE_PUSH
    }

    fn build(&self, source: &SourceDescriptor) -> Box<dyn SourceWorker> {
        Box::new(PushWorker::new(
            source.clone(),
            self.client.clone(),
            self.storage.clone(),
            self.base.clone(),
            self.clock.clone(),
            self.archiver.clone(),
            self.settings.clone(),
        ))
    }
}
