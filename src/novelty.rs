//! Novelty Filter
//!
//! Per-source deduplication against the keys already recorded in the
//! current bucket. Pure: no I/O, no shared state.

use std::collections::HashSet;

use crate::schemas::Record;

/// Identity keys considered already recorded for one source's current bucket.
///
/// Rebuilt from the bucket file at startup and on day change, then extended
/// in memory. Never persisted on its own.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeenKeySet {
    keys: HashSet<String>,
}

impl SeenKeySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    /// Returns true if the key was not present
    pub fn insert(&mut self, key: impl Into<String>) -> bool {
        self.keys.insert(key.into())
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.keys.iter().map(String::as_str)
    }

    pub fn clear(&mut self) {
        self.keys.clear();
    }
}

impl Extend<String> for SeenKeySet {
    fn extend<I: IntoIterator<Item = String>>(&mut self, iter: I) {
        self.keys.extend(iter);
    }
}

impl FromIterator<String> for SeenKeySet {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        Self {
            keys: iter.into_iter().collect(),
        }
    }
}

impl<'a> FromIterator<&'a str> for SeenKeySet {
    fn from_iter<I: IntoIterator<Item = &'a str>>(iter: I) -> Self {
        iter.into_iter().map(str::to_string).collect()
    }
}

/// Records of `batch` whose key is non-empty and unseen, paired with that
/// key, in batch order. A key repeated inside the batch is only novel the
/// first time.
pub fn select_novel(batch: Vec<Record>, seen: &SeenKeySet, key_field: &str) -> Vec<(String, Record)> {
    let mut in_batch: HashSet<String> = HashSet::new();

    batch
        .into_iter()
        .filter_map(|record| {
            let key = record.identity_key(key_field)?;
            if seen.contains(&key) || !in_batch.insert(key.clone()) {
                return None;
            }
            Some((key, record))
        })
        .collect()
}

/// Splits `batch` into novel records and the seen set extended with their keys.
pub fn filter(batch: Vec<Record>, mut seen: SeenKeySet, key_field: &str) -> (Vec<Record>, SeenKeySet) {
    let novel = select_novel(batch, &seen, key_field);
    let mut records = Vec::with_capacity(novel.len());
    for (key, record) in novel {
        seen.insert(key);
        records.push(record);
    }
    (records, seen)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn user(url: &str) -> Record {
        Record::from_value(json!({ "url": url, "username": "u" })).unwrap()
    }

    fn keys(records: &[Record]) -> Vec<String> {
        records.iter().filter_map(|r| r.identity_key("url")).collect()
    }

    #[test]
    fn test_filter_drops_seen_and_repeated_keys() {
        let seen: SeenKeySet = ["url1", "url2"].into_iter().collect();
        let batch = vec![user("url1"), user("url3"), user("url3")];

        let (novel, updated) = filter(batch, seen, "url");

        assert_eq!(keys(&novel), vec!["url3"]);
        let expected: SeenKeySet = ["url1", "url2", "url3"].into_iter().collect();
        assert_eq!(updated, expected);
    }

    #[test]
    fn test_keyless_records_are_never_novel() {
        let batch = vec![
            Record::from_value(json!({"username": "nourl"})).unwrap(),
            user(""),
            user("url9"),
        ];
        let (novel, updated) = filter(batch, SeenKeySet::new(), "url");
        assert_eq!(keys(&novel), vec!["url9"]);
        assert_eq!(updated.len(), 1);
    }

    #[test]
    fn test_preserves_batch_order() {
        let batch = vec![user("c"), user("a"), user("b")];
        let (novel, _) = filter(batch, SeenKeySet::new(), "url");
        assert_eq!(keys(&novel), vec!["c", "a", "b"]);
    }

    #[test]
    fn test_no_key_is_novel_twice_across_batches() {
        let batches = vec![
            vec![user("a"), user("b")],
            vec![user("b"), user("c"), user("a")],
            vec![user("d"), user("c"), user("d")],
            vec![],
            vec![user("e"), user("a")],
        ];

        let mut seen = SeenKeySet::new();
        let mut emitted = Vec::new();
        for batch in batches {
            let (novel, next) = filter(batch, seen, "url");
            emitted.extend(keys(&novel));
            seen = next;
        }

        assert_eq!(emitted, vec!["a", "b", "c", "d", "e"]);
    }

    #[test]
    fn test_select_novel_leaves_seen_untouched() {
        let seen: SeenKeySet = ["a"].into_iter().collect();
        let novel = select_novel(vec![user("a"), user("b")], &seen, "url");
        assert_eq!(novel.len(), 1);
        assert_eq!(novel[0].0, "b");
        assert_eq!(seen.len(), 1);
    }
}
