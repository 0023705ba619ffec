//! Error types for the Ingestion Service

use thiserror::Error;

/// Coarse classification used by workers to pick a recovery policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Fatal before startup: bad roster, bad settings.
    Config,
    /// Network or upstream failure, retried per worker policy.
    Transport,
    /// Malformed upstream payload, dropped.
    Decode,
    /// Append, mkdir or archive failure on local disk.
    Storage,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Config => "config",
            Self::Transport => "transport",
            Self::Decode => "decode",
            Self::Storage => "storage",
        }
    }
}

#[derive(Error, Debug)]
pub enum IngestionError {
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("JSON parsing failed: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("API error: {code} - {message}")]
    ApiError {
        code: String,
        message: String,
    },

    #[error("Stream ended by upstream: {0}")]
    StreamEnded(String),

    #[error("Malformed server-sent event: {0}")]
    SseError(String),

    #[error("Invalid data: {0}")]
    ValidationError(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Append to {path} stopped after {written} of {total} records: {source}")]
    PartialWrite {
        path: String,
        written: usize,
        total: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("Archive error: {0}")]
    ArchiveError(String),

    #[error("Worker task failed: {0}")]
    WorkerFailed(String),
}

impl IngestionError {
    /// Maps the error onto the recovery taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ConfigError(_) => ErrorKind::Config,
            Self::HttpError(_)
            | Self::ApiError { .. }
            | Self::StreamEnded(_)
            | Self::WorkerFailed(_) => ErrorKind::Transport,
            Self::JsonError(_) | Self::SseError(_) | Self::ValidationError(_) => ErrorKind::Decode,
            Self::IoError(_)
            | Self::StorageError(_)
            | Self::PartialWrite { .. }
            | Self::ArchiveError(_) => ErrorKind::Storage,
        }
    }

    /// Number of records durably written before the failure, if this was an append.
    pub fn written(&self) -> Option<usize> {
        match self {
            Self::PartialWrite { written, .. } => Some(*written),
            _ => None,
        }
    }
}

impl From<config::ConfigError> for IngestionError {
    fn from(e: config::ConfigError) -> Self {
        Self::ConfigError(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, IngestionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(IngestionError::ConfigError("x".into()).kind(), ErrorKind::Config);
        assert_eq!(IngestionError::StreamEnded("host".into()).kind(), ErrorKind::Transport);
        assert_eq!(IngestionError::SseError("bad".into()).kind(), ErrorKind::Decode);

        let partial = IngestionError::PartialWrite {
            path: "a.json".into(),
            written: 3,
            total: 5,
            source: std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
        };
        assert_eq!(partial.kind(), ErrorKind::Storage);
        assert_eq!(partial.written(), Some(3));
        assert!(partial.to_string().contains("3 of 5"));
    }
}
