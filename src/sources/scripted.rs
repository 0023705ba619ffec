//! Scripted upstreams for driving workers without a network

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use super::{DirectoryFetcher, EventStream, EventStreamClient, StreamMessage};
use crate::error::{IngestionError, Result};
use crate::roster::SourceDescriptor;
use crate::schemas::Record;

type Responder = Box<dyn Fn(usize) -> Result<Vec<Record>> + Send + Sync>;

/// Answers each fetch from a responder called with the zero-based call number
pub struct ScriptedFetcher {
    responder: Responder,
    calls: AtomicUsize,
}

impl ScriptedFetcher {
    /// Returns `batches` in order, then empty batches
    pub fn new(batches: Vec<Vec<Record>>) -> Self {
        Self::from_fn(move |call| Ok(batches.get(call).cloned().unwrap_or_default()))
    }

    pub fn from_fn<F>(responder: F) -> Self
    where
        F: Fn(usize) -> Result<Vec<Record>> + Send + Sync + 'static,
    {
        Self {
            responder: Box::new(responder),
            calls: AtomicUsize::new(0),
        }
    }

    /// Every fetch fails with a 503
    pub fn failing() -> Self {
        Self::from_fn(|_| {
            Err(IngestionError::ApiError {
                code: "503 Service Unavailable".to_string(),
                message: "scripted outage".to_string(),
            })
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DirectoryFetcher for ScriptedFetcher {
    async fn fetch(&self, _source: &SourceDescriptor) -> Result<Vec<Record>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        (self.responder)(call)
    }
}

/// Serves one scripted session per subscription. Once the sessions run out,
/// subscriptions either fail or stay open and silent.
pub struct ScriptedStreamClient {
    sessions: Mutex<VecDeque<Vec<Result<StreamMessage>>>>,
    fail_when_exhausted: bool,
    subscriptions: AtomicUsize,
}

impl ScriptedStreamClient {
    pub fn new(sessions: Vec<Vec<Result<StreamMessage>>>) -> Self {
        Self {
            sessions: Mutex::new(sessions.into()),
            fail_when_exhausted: false,
            subscriptions: AtomicUsize::new(0),
        }
    }

    /// Every subscription is refused
    pub fn failing() -> Self {
        Self {
            fail_when_exhausted: true,
            ..Self::new(Vec::new())
        }
    }

    pub fn subscriptions(&self) -> usize {
        self.subscriptions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventStreamClient for ScriptedStreamClient {
    async fn subscribe(&self, source: &SourceDescriptor) -> Result<EventStream> {
        self.subscriptions.fetch_add(1, Ordering::SeqCst);
        let next = self
            .sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();

        match next {
            Some(items) => Ok(Box::pin(futures::stream::iter(items))),
            None if self.fail_when_exhausted => Err(IngestionError::ApiError {
                code: "503 Service Unavailable".to_string(),
                message: format!("{} refused subscription", source.id),
            }),
            None => Ok(Box::pin(futures::stream::pending())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::json;

    fn source() -> SourceDescriptor {
        SourceDescriptor::new("example.social", None).unwrap()
    }

    #[tokio::test]
    async fn test_fetcher_replays_batches() {
        let batch = vec![Record::from_value(json!({"url": "a"})).unwrap()];
        let fetcher = ScriptedFetcher::new(vec![batch]);

        assert_eq!(fetcher.fetch(&source()).await.unwrap().len(), 1);
        assert!(fetcher.fetch(&source()).await.unwrap().is_empty());
        assert_eq!(fetcher.calls(), 2);
        assert!(ScriptedFetcher::failing().fetch(&source()).await.is_err());
    }

    #[tokio::test]
    async fn test_stream_sessions() {
        let client = ScriptedStreamClient::new(vec![vec![Ok(StreamMessage::Heartbeat)]]);
        let first: Vec<_> = client.subscribe(&source()).await.unwrap().collect().await;
        assert_eq!(first.len(), 1);
        assert_eq!(client.subscriptions(), 1);

        assert!(ScriptedStreamClient::failing().subscribe(&source()).await.is_err());
    }
}
