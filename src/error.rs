use std::time::Duration;
use thiserror::Error;

/// Errors produced by the story pipeline and its collaborators.
#[derive(Error, Debug)]
pub enum StoryError {
    /// Low-level HTTP transport failure (connection refused, reset, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// JSON parsing failed at the serde level.
    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error with status code, response body, and optional Retry-After hint.
    ///
    /// Returned by [`TextBackend`](crate::backend::TextBackend) and
    /// [`ImageBackend`](crate::backend::ImageBackend) implementations when
    /// the collaborator answers with a non-success status code.
    #[error("HTTP {status}: {body}")]
    HttpError {
        /// HTTP status code (e.g. 403, 429, 500).
        status: u16,
        /// Response body text.
        body: String,
        /// Parsed `Retry-After` header value, if present.
        retry_after: Option<Duration>,
    },

    /// Invalid configuration detected while building or loading config.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A share request failed validation.
    #[error("{0}")]
    InvalidShare(String),

    /// The session was replaced by a newer one before it finished.
    #[error("Session was superseded by a newer one")]
    Superseded,

    /// Catch-all for other errors.
    #[error("{0}")]
    Other(String),
}

impl StoryError {
    /// The message shown to a user next to the failed story.
    ///
    /// For HTTP errors this is the collaborator's response body, falling back
    /// to a generic message when the body is empty.
    pub fn user_message(&self) -> String {
        match self {
            StoryError::HttpError { body, .. } if body.trim().is_empty() => {
                "Unknown error.".to_string()
            }
            StoryError::HttpError { body, .. } => body.clone(),
            other => other.to_string(),
        }
    }
}

impl From<anyhow::Error> for StoryError {
    fn from(err: anyhow::Error) -> Self {
        StoryError::Other(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StoryError>;
