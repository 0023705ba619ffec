//! Record and StoredRecord

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::fmt;

use crate::error::{IngestionError, Result};

/// strftime pattern for `collected_at_str`
pub const COLLECTED_AT_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

/// One event or directory entry from a source, field name to value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(Map<String, Value>);

impl Record {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self(fields)
    }

    /// Wraps a JSON value, rejecting anything that is not an object.
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(fields) => Ok(Self(fields)),
            other => Err(IngestionError::ValidationError(format!(
                "expected a JSON object, got {}",
                json_type_name(&other)
            ))),
        }
    }

    /// Identity key under `key_field`. Strings are taken as-is, numbers are
    /// rendered in decimal; empty strings and other types have no key.
    pub fn identity_key(&self, key_field: &str) -> Option<String> {
        match self.0.get(key_field)? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_fields(self) -> Map<String, Value> {
        self.0
    }
}

impl From<Map<String, Value>> for Record {
    fn from(fields: Map<String, Value>) -> Self {
        Self(fields)
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Event name as delivered by the streaming API
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventType {
    Update,
    Delete,
    StatusUpdate,
    Other(String),
}

impl EventType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Update => "update",
            Self::Delete => "delete",
            Self::StatusUpdate => "status.update",
            Self::Other(name) => name,
        }
    }
}

impl From<&str> for EventType {
    fn from(name: &str) -> Self {
        match name {
            "update" => Self::Update,
            "delete" => Self::Delete,
            "status.update" => Self::StatusUpdate,
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for EventType {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Ok(Self::from(name.as_str()))
    }
}

/// A record plus ingestion metadata, as written to a bucket line
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub collected_at: DateTime<Utc>,
    pub event_type: Option<EventType>,
    pub record: Record,
}

impl StoredRecord {
    pub fn new(record: Record, collected_at: DateTime<Utc>, event_type: Option<EventType>) -> Self {
        Self {
            collected_at,
            event_type,
            record,
        }
    }

    /// Epoch seconds with microsecond fraction
    pub fn collected_at_epoch(&self) -> f64 {
        self.collected_at.timestamp() as f64
            + f64::from(self.collected_at.timestamp_subsec_micros()) / 1_000_000.0
    }

    pub fn collected_at_str(&self) -> String {
        self.collected_at.format(COLLECTED_AT_FORMAT).to_string()
    }

    /// Flattens metadata and record fields into one object. Record fields are
    /// merged last and win on collision.
    pub fn to_value(&self) -> Value {
        let mut out = Map::with_capacity(self.record.fields().len() + 3);
        out.insert("collected_at".into(), Value::from(self.collected_at_epoch()));
        out.insert("collected_at_str".into(), Value::from(self.collected_at_str()));
        if let Some(ref event_type) = self.event_type {
            out.insert("event_type".into(), Value::from(event_type.as_str()));
        }
        for (k, v) in self.record.fields() {
            out.insert(k.clone(), v.clone());
        }
        Value::Object(out)
    }

    /// Single JSON line without the trailing newline
    pub fn to_json_line(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.to_value())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn record(value: Value) -> Record {
        Record::from_value(value).unwrap()
    }

    #[test]
    fn test_identity_key() {
        let r = record(json!({"url": "https://example.social/@a", "id": 42}));
        assert_eq!(r.identity_key("url").as_deref(), Some("https://example.social/@a"));
        assert_eq!(r.identity_key("id").as_deref(), Some("42"));
        assert_eq!(r.identity_key("missing"), None);

        let empty = record(json!({"url": ""}));
        assert_eq!(empty.identity_key("url"), None);

        let nested = record(json!({"url": {"href": "x"}}));
        assert_eq!(nested.identity_key("url"), None);
    }

    #[test]
    fn test_from_value_rejects_non_objects() {
        assert!(Record::from_value(json!([1, 2])).is_err());
        assert!(Record::from_value(json!("12345")).is_err());
    }

    #[test]
    fn test_event_type_names() {
        assert_eq!(EventType::from("status.update"), EventType::StatusUpdate);
        assert_eq!(EventType::from("notification"), EventType::Other("notification".into()));
        assert_eq!(serde_json::to_string(&EventType::Delete).unwrap(), "\"delete\"");
    }

    #[test]
    fn test_stored_record_line() {
        let at = Utc.with_ymd_and_hms(2024, 3, 5, 10, 0, 0).unwrap()
            + chrono::Duration::microseconds(250_000);
        let stored = StoredRecord::new(
            record(json!({"id": "109", "url": "https://example.social/@a/109"})),
            at,
            Some(EventType::Update),
        );

        let value: Value = serde_json::from_str(&stored.to_json_line().unwrap()).unwrap();
        assert_eq!(value["event_type"], "update");
        assert_eq!(value["collected_at_str"], "2024-03-05T10:00:00.250000Z");
        assert_eq!(value["collected_at"].as_f64().unwrap(), 1709632800.25);
        assert_eq!(value["url"], "https://example.social/@a/109");
    }

    #[test]
    fn test_record_fields_win_on_collision() {
        let at = Utc.with_ymd_and_hms(2024, 3, 5, 10, 0, 0).unwrap();
        let stored = StoredRecord::new(record(json!({"event_type": "custom"})), at, Some(EventType::Update));
        assert_eq!(stored.to_value()["event_type"], "custom");
    }

    #[test]
    fn test_pull_records_have_no_event_type() {
        let at = Utc.with_ymd_and_hms(2024, 3, 5, 10, 0, 0).unwrap();
        let stored = StoredRecord::new(record(json!({"url": "u"})), at, None);
        assert!(stored.to_value().get("event_type").is_none());
    }
}
