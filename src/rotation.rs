//! Period rotation and day archives
//!
//! A running worker remembers the UTC day it last observed. When the clock
//! moves to a later day, the previous day's directory is bundled into
//! `{YYYY-MM}/{YYYY-MM-DD}.tar.gz` and then removed. The directory is removed
//! only after the bundle has been completely written and synced; a failed
//! bundle leaves the directory untouched and ingestion carries on.
//!
//! Appends to a day hold that day's gate shared for the duration of the write;
//! archiving holds it exclusively, so a bundle never races a late append. A
//! worker that finds its day already sealed re-reads the clock and moves on.

use chrono::{DateTime, NaiveDate, Timelike, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedRwLockReadGuard, RwLock};
use tracing::{debug, error, info, warn};

use crate::bucket::{self, Clock};
use crate::error::{IngestionError, Result};
use crate::metrics;

/// Rotator state. `Rotating` only lasts for the duration of one archive attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationState {
    WithinPeriod,
    Rotating,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RotationOutcome {
    /// Bundle written and the day directory removed
    Archived { date: NaiveDate, bundle: PathBuf },
    /// Another worker (or an earlier run) already rotated this day
    AlreadyArchived { date: NaiveDate },
    /// Archiving is disabled; the directory stays as is
    Skipped { date: NaiveDate },
    /// Bundle could not be written; the directory is intact
    Failed { date: NaiveDate, reason: String },
}

impl RotationOutcome {
    pub fn date(&self) -> NaiveDate {
        match self {
            Self::Archived { date, .. }
            | Self::AlreadyArchived { date }
            | Self::Skipped { date }
            | Self::Failed { date, .. } => *date,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Archived { .. } => "archived",
            Self::AlreadyArchived { .. } => "already_archived",
            Self::Skipped { .. } => "skipped",
            Self::Failed { .. } => "failed",
        }
    }
}

/// Writes a compressed bundle of a directory tree
#[async_trait::async_trait]
pub trait BundleWriter: Send + Sync {
    /// Bundles `source_dir` into `bundle`. On success the bundle is complete
    /// and durable; on failure no file exists at `bundle`.
    async fn write_bundle(&self, source_dir: &Path, bundle: &Path) -> Result<()>;
}

/// gzip-compressed tar bundles
#[derive(Debug, Clone, Copy)]
pub struct TarGzBundleWriter {
    level: Compression,
}

impl Default for TarGzBundleWriter {
    fn default() -> Self {
        Self {
            level: Compression::default(),
        }
    }
}

impl TarGzBundleWriter {
    pub fn new(level: u32) -> Self {
        Self {
            level: Compression::new(level),
        }
    }
}

#[async_trait::async_trait]
impl BundleWriter for TarGzBundleWriter {
    async fn write_bundle(&self, source_dir: &Path, bundle: &Path) -> Result<()> {
        let source_dir = source_dir.to_path_buf();
        let bundle = bundle.to_path_buf();
        let level = self.level;

        tokio::task::spawn_blocking(move || write_tar_gz(&source_dir, &bundle, level))
            .await
            .map_err(|e| IngestionError::ArchiveError(format!("bundle task failed: {}", e)))?
    }
}

fn write_tar_gz(source_dir: &Path, bundle: &Path, level: Compression) -> Result<()> {
    let arcname = source_dir
        .file_name()
        .ok_or_else(|| {
            IngestionError::ArchiveError(format!("no directory name in {}", source_dir.display()))
        })?
        .to_owned();

    let mut partial_name = bundle.as_os_str().to_owned();
    partial_name.push(".partial");
    let partial = PathBuf::from(partial_name);

    let result = (|| -> std::io::Result<()> {
        let file = File::create(&partial)?;
        let mut builder = tar::Builder::new(GzEncoder::new(file, level));
        builder.append_dir_all(&arcname, source_dir)?;
        let encoder = builder.into_inner()?;
        let file = encoder.finish()?;
        file.sync_all()?;
        std::fs::rename(&partial, bundle)
    })();

    if let Err(e) = result {
        let _ = std::fs::remove_file(&partial);
        return Err(IngestionError::ArchiveError(format!(
            "failed to bundle {}: {}",
            source_dir.display(),
            e
        )));
    }
    Ok(())
}

/// Days whose gates are kept around behind the newest requested day
const GATE_RETENTION_DAYS: i64 = 3;

/// Coordination for one day directory
#[derive(Debug, Default)]
struct DayGate {
    /// `true` once the day has been bundled and removed
    sealed: Arc<RwLock<bool>>,
    archiving: AtomicBool,
}

/// Clears the in-progress flag however the attempt ends
struct ArchivingClaim<'a>(&'a AtomicBool);

impl Drop for ArchivingClaim<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Shared hold on one day directory. Archiving that day waits until every
/// guard has been dropped.
#[derive(Debug)]
pub struct DayGuard {
    guard: OwnedRwLockReadGuard<bool>,
}

impl DayGuard {
    /// The day was archived before this guard was granted
    pub fn is_sealed(&self) -> bool {
        *self.guard
    }
}

/// Archives whole day directories. Every worker of a mode shares the same day
/// directory, so one archiver is shared process-wide. Only one attempt per day
/// runs at a time; concurrent observers return immediately.
pub struct Archiver {
    base: PathBuf,
    writer: Arc<dyn BundleWriter>,
    days: std::sync::Mutex<HashMap<NaiveDate, Arc<DayGate>>>,
}

impl Archiver {
    pub fn new(base: impl Into<PathBuf>, writer: Arc<dyn BundleWriter>) -> Self {
        Self {
            base: base.into(),
            writer,
            days: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Archiver writing `.tar.gz` bundles
    pub fn tar_gz(base: impl Into<PathBuf>) -> Self {
        Self::new(base, Arc::new(TarGzBundleWriter::default()))
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    fn gate(&self, date: NaiveDate) -> Arc<DayGate> {
        let mut days = self.days.lock().unwrap_or_else(|e| e.into_inner());
        days.retain(|day, _| (date - *day).num_days() < GATE_RETENTION_DAYS);
        days.entry(date).or_default().clone()
    }

    /// Waits out any archive attempt for `date` and holds the day open for
    /// appends until the guard is dropped.
    pub async fn enter(&self, date: NaiveDate) -> DayGuard {
        let gate = self.gate(date);
        DayGuard {
            guard: gate.sealed.clone().read_owned().await,
        }
    }

    /// Bundles and removes the directory for `date`. Never returns an error:
    /// every failure is reported as `RotationOutcome::Failed`. While another
    /// attempt for the same day is running this returns `AlreadyArchived`
    /// without waiting.
    pub async fn archive_day(&self, date: NaiveDate) -> RotationOutcome {
        let gate = self.gate(date);
        if gate.archiving.swap(true, Ordering::SeqCst) {
            debug!(date = %date, "Archive of day already in progress");
            let outcome = RotationOutcome::AlreadyArchived { date };
            metrics::record_rotation(outcome.label());
            return outcome;
        }
        let _claim = ArchivingClaim(&gate.archiving);

        // Waits for in-flight appends to the day, then blocks new ones
        let mut sealed = gate.sealed.write().await;
        let dir = bucket::day_dir(&self.base, date);

        let outcome = match tokio::fs::metadata(&dir).await {
            Ok(meta) if meta.is_dir() => self.bundle_and_remove(&dir, date).await,
            Ok(_) => RotationOutcome::Failed {
                date,
                reason: format!("{} is not a directory", dir.display()),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(date = %date, "Day directory already gone");
                RotationOutcome::AlreadyArchived { date }
            }
            Err(e) => RotationOutcome::Failed {
                date,
                reason: e.to_string(),
            },
        };

        *sealed = !matches!(outcome, RotationOutcome::Failed { .. });
        metrics::record_rotation(outcome.label());
        outcome
    }

    async fn bundle_and_remove(&self, dir: &Path, date: NaiveDate) -> RotationOutcome {
        let failed = |reason: String| RotationOutcome::Failed { date, reason };

        let bundle = match next_free_bundle(&self.base, date).await {
            Ok(path) => path,
            Err(e) => return failed(e.to_string()),
        };
        let before = match snapshot(dir).await {
            Ok(files) => files,
            Err(e) => return failed(e.to_string()),
        };

        if let Err(e) = self.writer.write_bundle(dir, &bundle).await {
            error!(date = %date, error = %e, "Archive failed, keeping day directory");
            return failed(e.to_string());
        }

        // Anything written around the gate since the snapshot is not in the bundle
        match snapshot(dir).await {
            Ok(after) if after == before => {}
            Ok(_) => {
                warn!(date = %date, "Day directory changed while bundling, keeping it");
                let _ = tokio::fs::remove_file(&bundle).await;
                return failed(format!("{} changed while bundling", dir.display()));
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&bundle).await;
                return failed(e.to_string());
            }
        }

        if let Err(e) = tokio::fs::remove_dir_all(dir).await {
            // The bundle is complete; a leftover directory is picked up by the next rotation
            warn!(date = %date, bundle = %bundle.display(), error = %e, "Bundle written but day directory not removed");
            return failed(format!("remove {}: {}", dir.display(), e));
        }

        info!(date = %date, bundle = %bundle.display(), "Archived day directory");
        RotationOutcome::Archived { date, bundle }
    }
}

async fn next_free_bundle(base: &Path, date: NaiveDate) -> Result<PathBuf> {
    let mut attempt = 0u32;
    loop {
        let candidate = bucket::archive_path(base, date, attempt);
        if !tokio::fs::try_exists(&candidate).await? {
            if attempt > 0 {
                warn!(date = %date, bundle = %candidate.display(), "Bundle exists, writing numbered sibling");
            }
            return Ok(candidate);
        }
        attempt += 1;
    }
}

/// Relative path and size of every file under `dir`
async fn snapshot(dir: &Path) -> Result<BTreeMap<PathBuf, u64>> {
    let dir = dir.to_path_buf();
    let files = tokio::task::spawn_blocking(move || {
        let mut files = BTreeMap::new();
        walk(&dir, &dir, &mut files).map(|_| files)
    })
    .await
    .map_err(|e| IngestionError::ArchiveError(format!("snapshot task failed: {}", e)))??;
    Ok(files)
}

fn walk(root: &Path, dir: &Path, files: &mut BTreeMap<PathBuf, u64>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        let path = entry.path();
        if meta.is_dir() {
            walk(root, &path, files)?;
        } else {
            let relative = path.strip_prefix(root).unwrap_or(&path).to_path_buf();
            files.insert(relative, meta.len());
        }
    }
    Ok(())
}

/// Per-worker day tracker
pub struct PeriodRotator {
    current: NaiveDate,
    state: RotationState,
    archiver: Option<Arc<Archiver>>,
}

impl PeriodRotator {
    /// Starts in `WithinPeriod` on the day of `now`. Without an archiver,
    /// boundaries are still tracked but every rotation is `Skipped`.
    pub fn new(now: DateTime<Utc>, archiver: Option<Arc<Archiver>>) -> Self {
        Self {
            current: now.date_naive(),
            state: RotationState::WithinPeriod,
            archiver,
        }
    }

    pub fn current(&self) -> NaiveDate {
        self.current
    }

    pub fn state(&self) -> RotationState {
        self.state
    }

    /// Records `now`. When it falls on a later day than the last observation,
    /// archives the last observed day and returns the outcome. A clock moving
    /// backwards is ignored.
    pub async fn observe(&mut self, now: DateTime<Utc>) -> Option<RotationOutcome> {
        let today = now.date_naive();
        if today <= self.current {
            return None;
        }

        self.state = RotationState::Rotating;
        let previous = std::mem::replace(&mut self.current, today);
        info!(from = %previous, to = %today, "Day boundary crossed");

        let outcome = match &self.archiver {
            Some(archiver) => archiver.archive_day(previous).await,
            None => RotationOutcome::Skipped { date: previous },
        };

        self.state = RotationState::WithinPeriod;
        Some(outcome)
    }

    /// Reads the clock, rotates if the day changed, and holds the resulting
    /// day open for appends. Drop the admission once the append is done.
    pub async fn enter(&mut self, clock: &dyn Clock) -> Admission {
        let mut now = clock.now();
        let mut rotations: Vec<RotationOutcome> = self.observe(now).await.into_iter().collect();

        let Some(archiver) = self.archiver.clone() else {
            return Admission {
                now,
                rotations,
                guard: None,
            };
        };

        let mut guard = archiver.enter(now.date_naive()).await;
        if guard.is_sealed() {
            // Another worker crossed midnight first; our reading is stale
            drop(guard);
            now = clock.now();
            rotations.extend(self.observe(now).await);
            guard = archiver.enter(now.date_naive()).await;
            if guard.is_sealed() {
                warn!(date = %now.date_naive(), "Appending to a day that was already archived");
            }
        }

        Admission {
            now,
            rotations,
            guard: Some(guard),
        }
    }
}

/// Result of `PeriodRotator::enter`
#[derive(Debug)]
pub struct Admission {
    /// Timestamp to bucket and tag the records with
    pub now: DateTime<Utc>,
    /// Rotations triggered on the way in, oldest first
    pub rotations: Vec<RotationOutcome>,
    guard: Option<DayGuard>,
}

impl Admission {
    pub fn is_guarded(&self) -> bool {
        self.guard.is_some()
    }
}

/// Counts records per UTC hour and reports the total when the hour changes
#[derive(Debug, Default)]
pub struct HourlyTally {
    hour: Option<DateTime<Utc>>,
    count: u64,
}

impl HourlyTally {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts one record at `now`. Returns the previous hour and its count
    /// when `now` starts a new hour.
    pub fn record(&mut self, now: DateTime<Utc>) -> Option<(DateTime<Utc>, u64)> {
        let hour = truncate_to_hour(now);
        match self.hour {
            Some(current) if current == hour => {
                self.count += 1;
                None
            }
            Some(current) => {
                let finished = (current, self.count);
                self.hour = Some(hour);
                self.count = 1;
                Some(finished)
            }
            None => {
                self.hour = Some(hour);
                self.count = 1;
                None
            }
        }
    }
}

fn truncate_to_hour(instant: DateTime<Utc>) -> DateTime<Utc> {
    instant
        .with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(instant)
}
