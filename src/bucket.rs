//! Time-bucketed output paths
//!
//! Layout under the base folder:
//! - `{YYYY-MM}/{YYYY-MM-DD}/{source}_{YYYY-MM-DD}.json` (stream events)
//! - `{YYYY-MM}/{YYYY-MM-DD}/new_users/{source}_{YYYY-MM-DD}_new_users.json`
//! - `{YYYY-MM}/{YYYY-MM-DD}.tar.gz` once the day has been archived
//!
//! Everything here is pure; directories are created by the writer.

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};

/// Record category, one bucket file per category per day
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    NewUsers,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NewUsers => "new_users",
        }
    }
}

fn month_str(date: NaiveDate) -> String {
    format!("{:04}-{:02}", date.year(), date.month())
}

fn day_str(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

/// `{base}/{YYYY-MM}/{YYYY-MM-DD}`
pub fn day_dir(base: &Path, date: NaiveDate) -> PathBuf {
    base.join(month_str(date)).join(day_str(date))
}

/// Bucket file for `source_id` on the UTC calendar day of `instant`
pub fn bucket_path(
    base: &Path,
    source_id: &str,
    instant: DateTime<Utc>,
    category: Option<Category>,
) -> PathBuf {
    let date = instant.date_naive();
    let day = day_str(date);
    let dir = day_dir(base, date);

    match category {
        Some(category) => dir
            .join(category.as_str())
            .join(format!("{}_{}_{}.json", source_id, day, category.as_str())),
        None => dir.join(format!("{}_{}.json", source_id, day)),
    }
}

/// Bundle path for a completed day. `attempt` 0 is the canonical name; later
/// attempts get a numbered sibling so an existing bundle is never replaced.
pub fn archive_path(base: &Path, date: NaiveDate, attempt: u32) -> PathBuf {
    let name = if attempt == 0 {
        format!("{}.tar.gz", day_str(date))
    } else {
        format!("{}.{}.tar.gz", day_str(date), attempt)
    };
    base.join(month_str(date)).join(name)
}

/// Source of "now" for workers and rotators
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to. Used to drive day boundaries in tests.
#[derive(Debug)]
pub struct ManualClock {
    micros: AtomicI64,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            micros: AtomicI64::new(start.timestamp_micros()),
        }
    }

    pub fn set(&self, instant: DateTime<Utc>) {
        self.micros.store(instant.timestamp_micros(), Ordering::SeqCst);
    }

    pub fn advance(&self, by: chrono::Duration) {
        let step = by.num_microseconds().unwrap_or(i64::MAX);
        self.micros.fetch_add(step, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_micros(self.micros.load(Ordering::SeqCst)).unwrap_or_default()
    }
}
