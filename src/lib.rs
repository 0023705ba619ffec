//! Fedi Ingestion
//! Per-server ingestion of federated social-network activity
//!
//! Features:
//! - Push mode: one server-sent event stream per server, every event appended
//! - Pull mode: paced polling of the newest-accounts directory with dedup
//! - Seen keys rebuilt from the bucket file tail, no separate checkpoint store
//! - Day-bucketed append-only files, archived to tar.gz at day boundaries
//! - Supervised workers with per-source crash isolation and restart backoff
//! - Prometheus metrics and structured tracing spans per worker

pub mod append_log;
pub mod bucket;
pub mod config;
pub mod error;
pub mod history;
pub mod http_client;
pub mod metrics;
pub mod novelty;
pub mod roster;
pub mod rotation;
pub mod schemas;
pub mod sources;
pub mod supervisor;
pub mod worker;

pub use error::{ErrorKind, IngestionError, Result};
