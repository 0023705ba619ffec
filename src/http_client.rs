//! HTTP Client Module
//!
//! One reqwest client shared by every worker, with a global semaphore bounding
//! concurrent directory requests. Streaming subscriptions use a second client
//! without a total request timeout, since an event stream never completes.

use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::debug;
use url::Url;

use crate::config::Config;
use crate::error::{IngestionError, Result};

/// Configuration for the HTTP client
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Maximum concurrent requests across all sources
    pub max_concurrent_requests: usize,
    /// Total timeout for one-shot requests
    pub request_timeout: Duration,
    /// Connection timeout (both clients)
    pub connect_timeout: Duration,
    pub user_agent: String,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 64,
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            user_agent: "curl/7.68.0".to_string(),
        }
    }
}

impl HttpClientConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_concurrent_requests: config.max_concurrent_requests,
            request_timeout: config.request_timeout(),
            user_agent: config.user_agent.clone(),
            ..Default::default()
        }
    }
}

/// HTTP client with process-wide concurrency limiting
pub struct HttpClient {
    client: Client,
    stream_client: Client,
    semaphore: Arc<Semaphore>,
}

impl HttpClient {
    pub fn new(config: HttpClientConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .user_agent(&config.user_agent)
            .gzip(true)
            .brotli(true)
            .build()?;

        let stream_client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .user_agent(&config.user_agent)
            .build()?;

        Ok(Self {
            client,
            stream_client,
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_requests)),
        })
    }

    pub fn with_defaults() -> Result<Self> {
        Self::new(HttpClientConfig::default())
    }

    /// GET `url` and decode the JSON body. Non-2xx responses become `ApiError`.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        url: Url,
        bearer: Option<&str>,
    ) -> Result<T> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| IngestionError::WorkerFailed("HTTP semaphore closed".to_string()))?;

        debug!(url = %url, "Executing HTTP request");

        let mut request = self.client.get(url);
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }

        let response = check_status(request.send().await?).await?;
        let bytes = response.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Opens a long-lived GET. The permit is released once headers arrive so
    /// open streams do not starve directory requests.
    pub async fn open_stream(&self, url: Url, bearer: Option<&str>) -> Result<Response> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| IngestionError::WorkerFailed("HTTP semaphore closed".to_string()))?;

        debug!(url = %url, "Opening event stream");

        let mut request = self
            .stream_client
            .get(url)
            .header(reqwest::header::ACCEPT, "text/event-stream");
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }

        check_status(request.send().await?).await
    }

    /// Gets the number of available permits
    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }
}

async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(IngestionError::ApiError {
        code: status.to_string(),
        message: body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_config_from_settings() {
        let config = HttpClientConfig::from_config(&Config::default());
        assert_eq!(config.max_concurrent_requests, 64);
        assert_eq!(config.user_agent, "curl/7.68.0");
    }

    #[tokio::test]
    async fn test_semaphore_limiting() {
        let config = HttpClientConfig {
            max_concurrent_requests: 2,
            ..Default::default()
        };

        let client = HttpClient::new(config).unwrap();

        assert_eq!(client.available_permits(), 2);
    }

    #[tokio::test]
    async fn test_get_json_sends_bearer() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/directory"))
            .and(header("authorization", "Bearer secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([{"url": "u"}])))
            .mount(&server)
            .await;

        let client = HttpClient::with_defaults().unwrap();
        let url = Url::parse(&format!("{}/api/v1/directory", server.uri())).unwrap();
        let body: serde_json::Value = client.get_json(url, Some("secret")).await.unwrap();
        assert_eq!(body[0]["url"], "u");
    }

    #[tokio::test]
    async fn test_non_success_is_api_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503).set_body_string("down"))
            .mount(&server)
            .await;

        let client = HttpClient::with_defaults().unwrap();
        let url = Url::parse(&server.uri()).unwrap();
        let err = client.get_json::<serde_json::Value>(url, None).await.unwrap_err();
        assert!(matches!(err, IngestionError::ApiError { ref code, .. } if code.starts_with("503")));
        assert_eq!(client.available_permits(), 64);
    }
}
