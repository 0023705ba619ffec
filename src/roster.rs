//! Server roster
//!
//! Reads `{"mastodon_servers": [{"api_base_url": "...", "access_token": "..."}]}`
//! into one `SourceDescriptor` per distinct server.

use serde::Deserialize;
use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use tracing::{info, warn};
use url::Url;

use crate::error::{IngestionError, Result};

/// One server to ingest. Immutable for the lifetime of its worker.
#[derive(Clone, PartialEq, Eq)]
pub struct SourceDescriptor {
    /// Host (and port, if any) of the server; names its bucket files
    pub id: String,
    pub api_base_url: Url,
    pub credential: Option<String>,
}

impl SourceDescriptor {
    /// Builds a descriptor from a base URL or a bare hostname
    pub fn new(api_base_url: &str, credential: Option<String>) -> Result<Self> {
        let trimmed = api_base_url.trim();
        let with_scheme = if trimmed.contains("://") {
            trimmed.to_string()
        } else {
            format!("https://{}", trimmed)
        };

        let url = Url::parse(&with_scheme).map_err(|e| {
            IngestionError::ConfigError(format!("invalid api_base_url {:?}: {}", api_base_url, e))
        })?;
        let host = url.host_str().filter(|h| !h.is_empty()).ok_or_else(|| {
            IngestionError::ConfigError(format!("api_base_url {:?} has no host", api_base_url))
        })?;

        let id = match url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };

        Ok(Self {
            id,
            api_base_url: url,
            credential: credential
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty()),
        })
    }

    /// `api_base_url` joined with an absolute API path such as `/api/v1/directory`
    pub fn endpoint(&self, path: &str) -> Result<Url> {
        self.api_base_url
            .join(path)
            .map_err(|e| IngestionError::ConfigError(format!("bad endpoint {}: {}", path, e)))
    }
}

impl fmt::Debug for SourceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceDescriptor")
            .field("id", &self.id)
            .field("api_base_url", &self.api_base_url.as_str())
            .field("credential", &self.credential.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct RosterFile {
    mastodon_servers: Vec<RosterEntry>,
}

#[derive(Debug, Deserialize)]
struct RosterEntry {
    api_base_url: String,
    #[serde(default)]
    access_token: Option<String>,
}

/// Loads and deduplicates the roster. The first entry for a server wins.
pub async fn load_roster(path: &Path) -> Result<Vec<SourceDescriptor>> {
    let text = tokio::fs::read_to_string(path).await.map_err(|e| {
        IngestionError::ConfigError(format!("cannot read roster {}: {}", path.display(), e))
    })?;
    let sources = parse_roster(&text)?;

    info!(path = %path.display(), servers = sources.len(), "Roster loaded");
    Ok(sources)
}

pub fn parse_roster(text: &str) -> Result<Vec<SourceDescriptor>> {
    let file: RosterFile = serde_json::from_str(text)
        .map_err(|e| IngestionError::ConfigError(format!("malformed roster: {}", e)))?;

    let mut seen = HashSet::new();
    let mut sources = Vec::with_capacity(file.mastodon_servers.len());

    for entry in file.mastodon_servers {
        let source = SourceDescriptor::new(&entry.api_base_url, entry.access_token)?;
        if !seen.insert(source.id.clone()) {
            warn!(source = %source.id, "Duplicate server in roster, keeping first entry");
            continue;
        }
        sources.push(source);
    }

    if sources.is_empty() {
        return Err(IngestionError::ConfigError("roster lists no servers".into()));
    }
    Ok(sources)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use tempfile::tempdir;

    #[test]
    fn test_id_is_host() {
        let s = SourceDescriptor::new("https://example.social/", Some("tok".into())).unwrap();
        assert_eq!(s.id, "example.social");
        assert_eq!(s.credential.as_deref(), Some("tok"));

        let bare = SourceDescriptor::new("mastodon.online", None).unwrap();
        assert_eq!(bare.id, "mastodon.online");
        assert_eq!(bare.api_base_url.as_str(), "https://mastodon.online/");

        let port = SourceDescriptor::new("http://127.0.0.1:8080", None).unwrap();
        assert_eq!(port.id, "127.0.0.1:8080");
    }

    #[test]
    fn test_blank_token_is_none() {
        let s = SourceDescriptor::new("example.social", Some("  ".into())).unwrap();
        assert_eq!(s.credential, None);
    }

    #[test]
    fn test_debug_redacts_credential() {
        let s = SourceDescriptor::new("example.social", Some("secret-token".into())).unwrap();
        let debug = format!("{:?}", s);
        assert!(!debug.contains("secret-token"));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn test_first_duplicate_wins() {
        let text = r#"{"mastodon_servers": [
            {"api_base_url": "https://a.social", "access_token": "first"},
            {"api_base_url": "https://b.social", "access_token": ""},
            {"api_base_url": "a.social", "access_token": "second"}
        ]}"#;
        let sources = parse_roster(text).unwrap();
        assert_eq!(sources.len(), 2);
        assert_eq!(sources[0].credential.as_deref(), Some("first"));
        assert_eq!(sources[1].id, "b.social");
        assert_eq!(sources[1].credential, None);
    }

    #[test]
    fn test_empty_or_malformed_roster_is_config_error() {
        let empty = parse_roster(r#"{"mastodon_servers": []}"#).unwrap_err();
        assert_eq!(empty.kind(), ErrorKind::Config);

        let malformed = parse_roster("{not json").unwrap_err();
        assert_eq!(malformed.kind(), ErrorKind::Config);

        let missing_key = parse_roster(r#"{"servers": []}"#).unwrap_err();
        assert_eq!(missing_key.kind(), ErrorKind::Config);
    }

    #[tokio::test]
    async fn test_missing_file_is_config_error() {
        let dir = tempdir().unwrap();
        let err = load_roster(&dir.path().join("servers.json")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[tokio::test]
    async fn test_load_roster_from_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("servers.json");
        std::fs::write(
            &path,
            r#"{"mastodon_servers": [
                {"api_base_url": "https://a.social"},
                {"api_base_url": "https://a.social", "access_token": "ignored"},
                {"api_base_url": "https://b.social", "access_token": "t"}
            ]}"#,
        )
        .unwrap();

        let sources = load_roster(&path).await.unwrap();

        assert_eq!(sources.len(), 2);
        assert_eq!(sources[0].id, "a.social");
        assert_eq!(sources[1].id, "b.social");
    }

    #[test]
    fn test_endpoint_join() {
        let s = SourceDescriptor::new("https://example.social/", None).unwrap();
        assert_eq!(
            s.endpoint("/api/v1/directory").unwrap().as_str(),
            "https://example.social/api/v1/directory"
        );
    }
}
