//! Pull worker: paced polling of a source's newest-accounts listing
//!
//! The seen-key set is rebuilt from the current bucket at startup and again
//! whenever the bucket path changes (day boundary), then extended only with
//! keys whose records were actually written.

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

use super::{log_rotation, sleep_or_shutdown, ShutdownSignal, SourceWorker, WorkerFactory};
use crate::append_log::AppendLogStorage;
use crate::bucket::{self, Category, Clock};
use crate::config::Config;
use crate::error::Result;
use crate::history;
use crate::metrics::{self, MODE_PULL};
use crate::novelty::{self, SeenKeySet};
use crate::rotation::{Archiver, PeriodRotator};
use crate::roster::SourceDescriptor;
use crate::schemas::{Record, StoredRecord};
use crate::sources::DirectoryFetcher;

#[derive(Debug, Clone)]
pub struct PullWorkerSettings {
    /// Target time between the starts of consecutive ticks
    pub poll_interval: Duration,
    /// Most recent records considered when rebuilding the seen set
    pub dedup_window: usize,
    pub key_field: String,
}

impl Default for PullWorkerSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            dedup_window: 160,
            key_field: "url".to_string(),
        }
    }
}

impl PullWorkerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            dedup_window: config.dedup_window,
            ..Default::default()
        }
    }
}

/// Remaining sleep after a tick that took `elapsed`; zero once over budget
pub fn pacing_delay(interval: Duration, elapsed: Duration) -> Duration {
    interval.saturating_sub(elapsed)
}

/// What one tick did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub path: PathBuf,
    pub fetched: usize,
    pub novel: usize,
    pub written: usize,
}

pub struct PullWorker {
    source: SourceDescriptor,
    fetcher: Arc<dyn DirectoryFetcher>,
    storage: Arc<dyn AppendLogStorage>,
    base: PathBuf,
    clock: Arc<dyn Clock>,
    rotator: PeriodRotator,
    settings: PullWorkerSettings,
    bucket: Option<PathBuf>,
    seen: SeenKeySet,
}

impl PullWorker {
    pub fn new(
        source: SourceDescriptor,
        fetcher: Arc<dyn DirectoryFetcher>,
        storage: Arc<dyn AppendLogStorage>,
        base: impl Into<PathBuf>,
        clock: Arc<dyn Clock>,
        archiver: Option<Arc<Archiver>>,
        settings: PullWorkerSettings,
    ) -> Self {
        let rotator = PeriodRotator::new(clock.now(), archiver);
        Self {
            source,
            fetcher,
            storage,
            base: base.into(),
            clock,
            rotator,
            settings,
            bucket: None,
            seen: SeenKeySet::new(),
        }
    }

    pub fn seen(&self) -> &SeenKeySet {
        &self.seen
    }

    /// Loads the seen set for the current bucket
    pub async fn start(&mut self) {
        let now = self.clock.now();
        self.ensure_bucket(now).await;
    }

    async fn ensure_bucket(&mut self, now: chrono::DateTime<chrono::Utc>) -> PathBuf {
        let path = bucket::bucket_path(&self.base, &self.source.id, now, Some(Category::NewUsers));
        if self.bucket.as_ref() != Some(&path) {
            if self.bucket.is_some() {
                info!(path = %path.display(), "Bucket changed, reloading seen keys");
            }
            self.seen = history::recover(&path, &self.settings.key_field, Some(self.settings.dedup_window)).await;
            self.bucket = Some(path.clone());
        }
        path
    }

    /// Filters a fetched batch and appends the novel records. On a partial
    /// write only the keys of the records that made it are remembered.
    pub async fn process(&mut self, batch: Vec<Record>) -> Result<TickReport> {
        // Held until the append completes so the day cannot be archived under it
        let admission = self.rotator.enter(self.clock.as_ref()).await;
        admission.rotations.iter().for_each(log_rotation);
        let now = admission.now;
        let path = self.ensure_bucket(now).await;

        let fetched = batch.len();
        let novel = novelty::select_novel(batch, &self.seen, &self.settings.key_field);
        metrics::record_duplicates(&self.source.id, (fetched - novel.len()) as u64);

        let (keys, records): (Vec<String>, Vec<StoredRecord>) = novel
            .into_iter()
            .map(|(key, record)| (key, StoredRecord::new(record, now, None)))
            .unzip();

        info!(new_users = records.len(), fetched, "New users received");

        let result = self.storage.append(&path, &records).await;
        drop(admission);
        let written = match &result {
            Ok(written) => *written,
            Err(e) => e.written().unwrap_or(0),
        };
        self.seen.extend(keys.into_iter().take(written));
        metrics::record_appended(MODE_PULL, &self.source.id, written as u64);
        result?;

        Ok(TickReport {
            path,
            fetched,
            novel: records.len(),
            written,
        })
    }

    /// One fetch-filter-append cycle, without pacing or cancellation
    pub async fn tick(&mut self) -> Result<TickReport> {
        let started = Instant::now();
        let batch = self.fetcher.fetch(&self.source).await?;
        metrics::record_fetch_latency(&self.source.id, started.elapsed().as_secs_f64());
        self.process(batch).await
    }
}

#[async_trait]
impl SourceWorker for PullWorker {
    fn source_id(&self) -> &str {
        &self.source.id
    }

    async fn run(&mut self, mut shutdown: ShutdownSignal) -> Result<()> {
        info!(url = %self.source.api_base_url, "Starting pull worker");
        self.start().await;

        loop {
            if shutdown.is_triggered() {
                break;
            }
            let started = Instant::now();

            // Only the fetch is abandoned on shutdown; appends always finish
            let fetcher = self.fetcher.clone();
            let fetched = tokio::select! {
                biased;
                _ = shutdown.triggered() => break,
                fetched = fetcher.fetch(&self.source) => fetched,
            };

            match fetched {
                Ok(batch) => {
                    metrics::record_fetch_latency(&self.source.id, started.elapsed().as_secs_f64());
                    match self.process(batch).await {
                        Ok(report) => debug!(written = report.written, "Tick complete"),
                        Err(e) => {
                            error!(error = %e, "Failed to save new users");
                            metrics::record_error(MODE_PULL, e.kind().as_str());
                        }
                    }
                }
                Err(e) => {
                    error!(error = %e, "Failed to fetch data");
                    metrics::record_error(MODE_PULL, e.kind().as_str());
                }
            }

            let delay = pacing_delay(self.settings.poll_interval, started.elapsed());
            if sleep_or_shutdown(delay, &mut shutdown).await {
                break;
            }
        }

        info!("Pull worker stopped");
        Ok(())
    }
}

/// Shared parts for building pull workers
pub struct PullWorkerFactory {
    pub fetcher: Arc<dyn DirectoryFetcher>,
    pub storage: Arc<dyn AppendLogStorage>,
    pub base: PathBuf,
    pub clock: Arc<dyn Clock>,
    pub archiver: Option<Arc<Archiver>>,
    pub settings: PullWorkerSettings,
}

impl WorkerFactory for PullWorkerFactory {
    fn mode(&self) -> &'static str {
        MODE_PULL
    }

    fn build(&self, source: &SourceDescriptor) -> Box<dyn SourceWorker> {
        Box::new(PullWorker::new(
            source.clone(),
            self.fetcher.clone(),
            self.storage.clone(),
            self.base.clone(),
            self.clock.clone(),
            self.archiver.clone(),
            self.settings.clone(),
        ))
    }
}
