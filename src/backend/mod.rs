//! Collaborator traits and request types.
//!
//! Two collaborators feed the pipeline: a text model that streams story text,
//! and an image model that streams one result record per prompt. Both are
//! reached through object-safe traits so sessions and the image orchestrator
//! can be driven by [`mock`] backends in tests.
//!
//! ## Architecture
//!
//! ```text
//! StorySession ──► StoryRequest ──► TextBackend::stream_story() ──► ChunkStream
//!                                          │
//!                            ┌─────────────┴─────────────┐
//!                     HttpTextBackend             OpenAiTextBackend
//!                    POST {model, prompt}        /v1/chat/completions (SSE)
//!
//! ImageGenerator ──► ImageRequest ──► ImageBackend::generate_images() ──► ChunkStream
//!                                          │
//!                                   HttpImageBackend
//!                                  POST {model, prompts}
//! ```

pub mod http;
pub mod mock;
#[cfg(feature = "openai")]
pub mod openai;
#[cfg(feature = "openai")]
pub mod sse;

pub use http::{HttpImageBackend, HttpTextBackend};
pub use mock::{MockImageBackend, MockTextBackend};
#[cfg(feature = "openai")]
pub use openai::OpenAiTextBackend;

use crate::error::Result;
use crate::models::DEFAULT_IMAGE_MODEL;
use crate::StoryError;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Raw chunks as read from a collaborator, in arrival order.
///
/// An `Err` item ends the useful part of the stream: the connection broke
/// after the response head was received.
pub type ChunkStream = BoxStream<'static, Result<Vec<u8>>>;

/// A story generation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoryRequest {
    /// Text model identifier (e.g. `"gpt-3.5-turbo"`).
    pub model: String,
    /// The user's story prompt.
    pub prompt: String,
    /// Image model used for the story's illustrations. Not sent to the text
    /// collaborator; carried so the session can report it.
    #[serde(default = "default_image_model")]
    pub image_model: String,
}

fn default_image_model() -> String {
    DEFAULT_IMAGE_MODEL.to_string()
}

impl StoryRequest {
    pub fn new(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            prompt: prompt.into(),
            image_model: default_image_model(),
        }
    }

    pub fn with_image_model(mut self, image_model: impl Into<String>) -> Self {
        self.image_model = image_model.into();
        self
    }
}

/// A batched image generation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRequest {
    /// Image model identifier (e.g. `"stabilityai/stable-diffusion-2-1"`).
    pub model: String,
    /// Prompts to generate, one result record expected per prompt.
    pub prompts: Vec<String>,
}

/// The text generation collaborator.
///
/// # Object Safety
///
/// This trait is object-safe and designed to be used as `Arc<dyn TextBackend>`.
#[async_trait]
pub trait TextBackend: Send + Sync {
    /// Open a streaming call. Resolves once the response head is in; a
    /// non-success status is an [`StoryError::HttpError`].
    async fn stream_story(&self, request: &StoryRequest) -> Result<ChunkStream>;

    /// Human-readable name for logging.
    fn name(&self) -> &'static str;
}

/// The image generation collaborator.
///
/// The returned stream carries `{ok, prompt?, url?, message?}` records,
/// decoded by [`ImageEventDecoder`](crate::streaming::ImageEventDecoder).
#[async_trait]
pub trait ImageBackend: Send + Sync {
    /// Open one batched generation call for every prompt in `request`.
    async fn generate_images(&self, request: &ImageRequest) -> Result<ChunkStream>;

    /// Human-readable name for logging.
    fn name(&self) -> &'static str;
}

/// Parse a Retry-After header value as seconds.
pub(crate) fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

/// Turn a non-success response into [`StoryError::HttpError`].
pub(crate) async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status().as_u16();
    let retry_after = resp
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(parse_retry_after);
    let body = resp.text().await.unwrap_or_default();
    Err(StoryError::HttpError {
        status,
        body,
        retry_after,
    })
}

/// Expose a response body as a [`ChunkStream`].
pub(crate) fn body_chunks(resp: reqwest::Response) -> ChunkStream {
    resp.bytes_stream()
        .map(|chunk| chunk.map(|bytes| bytes.to_vec()).map_err(StoryError::Request))
        .boxed()
}
