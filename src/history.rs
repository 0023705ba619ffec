//! History Recoverer
//!
//! Rebuilds the seen-key set for a bucket from the bucket file itself, so
//! restart safety depends only on the durability of the appended lines.
//!
//! With a limit, only the newest `limit` parseable records are considered and
//! the file is read backwards in growing blocks. This is an approximation: a
//! source that produced more than `limit` new entries since the last restart
//! can reintroduce a duplicate.

use std::io::SeekFrom;
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, error, info};

use crate::error::Result;
use crate::novelty::SeenKeySet;
use crate::schemas::Record;

/// First backwards read size; doubled until enough records are found
const TAIL_BLOCK_SIZE: u64 = 64 * 1024;

/// Keys under `key_field` of the records in `path`. Never fails: a missing
/// file is an empty history and read errors are logged and treated the same.
pub async fn recover(path: &Path, key_field: &str, limit: Option<usize>) -> SeenKeySet {
    match read_records(path, limit).await {
        Ok(records) => {
            let seen: SeenKeySet = records
                .iter()
                .filter_map(|r| r.identity_key(key_field))
                .collect();
            info!(
                path = %path.display(),
                records = records.len(),
                keys = seen.len(),
                "Loaded latest keys from bucket"
            );
            seen
        }
        Err(e) => {
            error!(path = %path.display(), error = %e, "Error reading bucket, starting with empty history");
            SeenKeySet::new()
        }
    }
}

/// Parses the records stored in `path`; the newest `limit` when given.
pub async fn read_records(path: &Path, limit: Option<usize>) -> Result<Vec<Record>> {
    let file = match File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    match limit {
        Some(0) => Ok(Vec::new()),
        Some(limit) => read_tail(file, limit).await,
        None => {
            let mut file = file;
            let mut bytes = Vec::new();
            file.read_to_end(&mut bytes).await?;
            Ok(parse_records(&String::from_utf8_lossy(&bytes)))
        }
    }
}

async fn read_tail(mut file: File, limit: usize) -> Result<Vec<Record>> {
    let len = file.metadata().await?.len();
    let mut start = len;
    let mut block = TAIL_BLOCK_SIZE;
    let mut buf: Vec<u8> = Vec::new();

    loop {
        let from = start.saturating_sub(block);
        let mut chunk = vec![0u8; (start - from) as usize];
        file.seek(SeekFrom::Start(from)).await?;
        file.read_exact(&mut chunk).await?;
        chunk.extend_from_slice(&buf);
        buf = chunk;
        start = from;

        let text = String::from_utf8_lossy(&buf);
        // The first line may be cut mid-record unless we reached the file start.
        let body = if start == 0 {
            &text[..]
        } else {
            match text.find('\n') {
                Some(i) => &text[i + 1..],
                None => "",
            }
        };

        let mut records = parse_records(body);
        if start == 0 || records.len() >= limit {
            if records.len() > limit {
                records.drain(..records.len() - limit);
            }
            debug!(bytes_read = buf.len(), records = records.len(), "Tail read complete");
            return Ok(records);
        }
        block = block.saturating_mul(2);
    }
}

/// Parses newline-delimited JSON objects. Lines that do not parse on their own
/// are buffered until the accumulated text forms a complete record, so values
/// spanning several lines are kept whole. A buffered fragment is abandoned
/// when a later line parses by itself, and an unterminated tail is ignored.
pub fn parse_records(text: &str) -> Vec<Record> {
    let mut records = Vec::new();
    let mut pending = String::new();

    for line in text.split('\n') {
        let line = line.strip_suffix('\r').unwrap_or(line);

        if pending.is_empty() {
            if line.trim().is_empty() {
                continue;
            }
            match parse_object(line) {
                Some(record) => records.push(record),
                None => pending.push_str(line),
            }
            continue;
        }

        pending.push('\n');
        pending.push_str(line);

        if let Some(record) = parse_object(&escape_newlines_in_strings(&pending)) {
            records.push(record);
            pending.clear();
        } else if let Some(record) = parse_object(line) {
            debug!(dropped_bytes = pending.len() - line.len(), "Discarding unparseable fragment");
            records.push(record);
            pending.clear();
        }
    }

    if !pending.trim().is_empty() {
        debug!(bytes = pending.len(), "Ignoring incomplete trailing record");
    }

    records
}

fn parse_object(text: &str) -> Option<Record> {
    serde_json::from_str::<serde_json::Value>(text)
        .ok()
        .and_then(|value| Record::from_value(value).ok())
}

/// Raw newlines are invalid inside JSON strings; re-escape those that a
/// multi-line record carries inside string values.
fn escape_newlines_in_strings(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 8);
    let mut in_string = false;
    let mut escaped = false;

    for c in text.chars() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                '\n' => {
                    out.push_str("\\n");
                    continue;
                }
                _ => {}
            }
        } else if c == '"' {
            in_string = true;
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;
    use tempfile::tempdir;

    fn line(url: &str) -> String {
        format!("{}\n", json!({ "url": url, "note": "x" }))
    }

    fn write_file(path: &Path, content: &str) {
        let mut f = std::fs::File::create(path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
    }

    #[tokio::test]
    async fn test_missing_file_is_empty_history() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nope").join("a.json");
        let seen = recover(&path, "url", Some(160)).await;
        assert!(seen.is_empty());
        assert!(!path.parent().unwrap().exists());
    }

    #[tokio::test]
    async fn test_truncated_tail_is_ignored() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.json");
        let content = format!("{}{}{{\"url\": \"u3\", \"no", line("u1"), line("u2"));
        write_file(&path, &content);

        for limit in [None, Some(160)] {
            let seen = recover(&path, "url", limit).await;
            let expected: SeenKeySet = ["u1", "u2"].into_iter().collect();
            assert_eq!(seen, expected);
        }
    }

    #[tokio::test]
    async fn test_limit_keeps_newest_records() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.json");
        let content: String = (0..10).map(|i| line(&format!("u{}", i))).collect();
        write_file(&path, &content);

        let seen = recover(&path, "url", Some(3)).await;
        let expected: SeenKeySet = ["u7", "u8", "u9"].into_iter().collect();
        assert_eq!(seen, expected);
    }

    #[tokio::test]
    async fn test_tail_read_spans_multiple_blocks() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("big.json");
        let padding = "p".repeat(1000);
        let content: String = (0..300)
            .map(|i| format!("{}\n", json!({ "url": format!("u{}", i), "pad": padding })))
            .collect();
        write_file(&path, &content);

        let records = read_records(&path, Some(160)).await.unwrap();
        assert_eq!(records.len(), 160);
        assert_eq!(records[0].identity_key("url").as_deref(), Some("u140"));
        assert_eq!(records[159].identity_key("url").as_deref(), Some("u299"));
    }

    #[test]
    fn test_multiline_record_is_kept_whole() {
        let text = "{\"url\": \"u1\", \"bio\": \"line one\nline two\"}\n{\"url\": \"u2\"}\n";
        let records = parse_records(text);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].get("bio").unwrap(), "line one\nline two");
    }

    #[test]
    fn test_pretty_printed_record() {
        let text = "{\n  \"url\": \"u1\"\n}\n{\"url\": \"u2\"}\n";
        let records = parse_records(text);
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn test_garbage_fragment_does_not_swallow_later_records() {
        let text = "not json at all\n{\"url\": \"u1\"}\n{\"url\": \"u2\"}\n";
        let records = parse_records(text);
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn test_escape_newlines_only_inside_strings() {
        let escaped = escape_newlines_in_strings("{\n\"a\": \"x\ny\\\"\n\"}");
        assert_eq!(escaped, "{\n\"a\": \"x\\ny\\\"\\n\"}");
    }
}
