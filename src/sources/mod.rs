//! Upstream clients for ingestion
//!
//! Push workers subscribe through an `EventStreamClient`; pull workers poll
//! through a `DirectoryFetcher`. Both are supplied to the workers from
//! outside, so tests drive them with scripted fakes.

pub mod directory;
pub mod scripted;
pub mod streaming;

use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;

use crate::error::Result;
use crate::roster::SourceDescriptor;
use crate::schemas::{EventType, Record};

/// One item read from an event stream
#[derive(Debug, Clone, PartialEq)]
pub enum StreamMessage {
    Event { event_type: EventType, record: Record },
    /// Keep-alive from the server; carries no data
    Heartbeat,
}

/// Open subscription. Ends when the server closes the connection; an `Err`
/// item is either a transport failure or one undecodable event.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamMessage>> + Send>>;

/// Opens event-stream subscriptions (push mode)
#[async_trait]
pub trait EventStreamClient: Send + Sync {
    async fn subscribe(&self, source: &SourceDescriptor) -> Result<EventStream>;
}

/// Fetches the current newest-accounts listing (pull mode)
#[async_trait]
pub trait DirectoryFetcher: Send + Sync {
    async fn fetch(&self, source: &SourceDescriptor) -> Result<Vec<Record>>;
}

pub use directory::MastodonDirectoryClient;
pub use scripted::{ScriptedFetcher, ScriptedStreamClient};
pub use streaming::{MastodonStreamClient, SseDecoder, SseFrame};
