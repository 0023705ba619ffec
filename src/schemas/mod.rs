//! Record schemas
//!
//! Upstream payloads are kept as opaque JSON objects so that unknown fields
//! pass through untouched; only the ingestion metadata is typed.

pub mod record;

pub use record::{EventType, Record, StoredRecord, COLLECTED_AT_FORMAT};
