//! Mastodon profile directory (newest accounts first)

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use super::DirectoryFetcher;
use crate::error::{IngestionError, Result};
use crate::http_client::HttpClient;
use crate::roster::SourceDescriptor;
use crate::schemas::Record;

pub const DIRECTORY_PATH: &str = "/api/v1/directory";

/// Polls `GET {api_base_url}/api/v1/directory?order=new&limit=N`. The
/// directory is public, so no credential is sent.
pub struct MastodonDirectoryClient {
    http: Arc<HttpClient>,
    limit: u32,
}

impl MastodonDirectoryClient {
    pub fn new(http: Arc<HttpClient>, limit: u32) -> Self {
        Self { http, limit }
    }
}

#[async_trait]
impl DirectoryFetcher for MastodonDirectoryClient {
    async fn fetch(&self, source: &SourceDescriptor) -> Result<Vec<Record>> {
        let mut url = source.endpoint(DIRECTORY_PATH)?;
        url.query_pairs_mut()
            .append_pair("order", "new")
            .append_pair("limit", &self.limit.to_string());

        let body: Value = self.http.get_json(url, None).await?;
        let records = parse_directory(body)?;

        debug!(source = %source.id, accounts = records.len(), "Fetched directory page");
        Ok(records)
    }
}

/// The listing must be a JSON array of account objects
pub fn parse_directory(body: Value) -> Result<Vec<Record>> {
    match body {
        Value::Array(items) => items.into_iter().map(Record::from_value).collect(),
        _ => Err(IngestionError::ValidationError(
            "directory response is not an array".to_string(),
        )),
    }
}
