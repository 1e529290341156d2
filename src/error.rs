use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure of a single generation task. Never escapes the dispatcher; it is
/// folded into a failed `TaskResult` there.
#[derive(Debug, Error)]
pub enum ImagegenError {
    #[error("{provider} is not configured (set {key})")]
    Configuration { provider: String, key: String },
    #[error("api error ({status}): {body}")]
    Api {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("malformed json from provider ({source}): {body}")]
    MalformedJson {
        #[source]
        source: serde_json::Error,
        body: String,
    },
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("generation failed: {0}")]
    GenerationFailed(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("task cancelled")]
    Cancelled,
    #[error("http error: {0}")]
    Http(reqwest::Error),
}

impl From<reqwest::Error> for ImagegenError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(err.to_string())
        } else {
            Self::Http(err)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Unsupported,
    Configuration,
    Provider,
    Protocol,
    Timeout,
    Cancelled,
}

impl ImagegenError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration { .. } => ErrorKind::Configuration,
            Self::Api { .. }
            | Self::MalformedJson { .. }
            | Self::InvalidResponse(_)
            | Self::GenerationFailed(_)
            | Self::Http(_) => ErrorKind::Provider,
            Self::Protocol(_) => ErrorKind::Protocol,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }
}

pub type Result<T> = std::result::Result<T, ImagegenError>;
