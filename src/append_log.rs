//! Append-Only Bucket Writer
//!
//! Appends newline-delimited JSON records to bucket files. Existing content is
//! never truncated or rewritten; each record is one `write_all` of a complete
//! line followed by a flush, so a failure mid-batch leaves every earlier line
//! intact and reports how many made it.
//!
//! A file left without a trailing newline (process killed mid-write) is
//! terminated before the first new line, so the torn fragment stays a line of
//! its own and never swallows the next record.

use std::io::SeekFrom;
use std::path::Path;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, warn};

use crate::error::{IngestionError, Result};
use crate::schemas::StoredRecord;

/// Trait for bucket storage backends
#[async_trait::async_trait]
pub trait AppendLogStorage: Send + Sync {
    /// Appends `records` to `path` in order and returns how many were written.
    /// Failures are `IngestionError::PartialWrite` carrying that count.
    async fn append(&self, path: &Path, records: &[StoredRecord]) -> Result<usize>;
}

/// Local filesystem bucket storage
#[derive(Debug, Clone, Copy, Default)]
pub struct FileSystemAppendLog;

impl FileSystemAppendLog {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl AppendLogStorage for FileSystemAppendLog {
    async fn append(&self, path: &Path, records: &[StoredRecord]) -> Result<usize> {
        append_records(path, records).await
    }
}

/// Appends `records` to `path`, creating parent directories as needed.
/// An empty batch touches nothing.
pub async fn append_records(path: &Path, records: &[StoredRecord]) -> Result<usize> {
    if records.is_empty() {
        return Ok(0);
    }

    let total = records.len();
    let partial = |written: usize, source: std::io::Error| IngestionError::PartialWrite {
        path: path.display().to_string(),
        written,
        total,
        source,
    };

    // Serialize up front so an encoding failure never leaves half a batch
    let lines = records
        .iter()
        .map(|r| r.to_json_line().map(|json| format!("{}\n", json)))
        .collect::<Result<Vec<_>>>()?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await.map_err(|e| partial(0, e))?;
    }

    let mut file = OpenOptions::new()
        .create(true)
        .read(true)
        .append(true)
        .open(path)
        .await
        .map_err(|e| partial(0, e))?;

    if !ends_on_line_boundary(&mut file).await.map_err(|e| partial(0, e))? {
        warn!(path = %path.display(), "Bucket ends mid-line, terminating torn record");
        file.write_all(b"\n").await.map_err(|e| partial(0, e))?;
    }

    let mut written = 0;
    for line in &lines {
        file.write_all(line.as_bytes()).await.map_err(|e| partial(written, e))?;
        file.flush().await.map_err(|e| partial(written, e))?;
        written += 1;
    }

    debug!(path = %path.display(), records = written, "Appended records to bucket");

    Ok(written)
}

/// True for an empty file or one whose last byte is `\n`
async fn ends_on_line_boundary(file: &mut File) -> std::io::Result<bool> {
    if file.metadata().await?.len() == 0 {
        return Ok(true);
    }
    let mut last = [0u8; 1];
    file.seek(SeekFrom::End(-1)).await?;
    file.read_exact(&mut last).await?;
    Ok(last[0] == b'\n')
}
