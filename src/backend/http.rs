//! Plain HTTP collaborators.
//!
//! [`HttpTextBackend`] POSTs `{model, prompt}` to a text endpoint that
//! answers with raw story text in chunked transfer encoding.
//! [`HttpImageBackend`] POSTs `{model, prompts}` to an image endpoint that
//! answers with `data: {...}` result records.

use super::{
    body_chunks, check_status, ChunkStream, ImageBackend, ImageRequest, StoryRequest, TextBackend,
};
use crate::config::StoryConfig;
use crate::error::Result;
use crate::StoryError;
use async_trait::async_trait;
use reqwest::header::ACCEPT;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::{debug, instrument};

/// Text collaborator reached over plain HTTP.
#[derive(Debug, Clone)]
pub struct HttpTextBackend {
    client: Client,
    endpoint: String,
}

impl HttpTextBackend {
    pub fn new(client: Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }

    /// Build from `STORY_TEXT_ENDPOINT` and the shared HTTP settings.
    pub fn from_config(config: &StoryConfig) -> Result<Self> {
        let endpoint = config
            .text_endpoint
            .clone()
            .ok_or_else(|| StoryError::InvalidConfig("text endpoint is not set".into()))?;
        Ok(Self::new(config.http_client()?, endpoint))
    }

    fn build_body(request: &StoryRequest) -> Value {
        json!({
            "model": request.model,
            "prompt": request.prompt,
        })
    }
}

#[async_trait]
impl TextBackend for HttpTextBackend {
    #[instrument(skip_all, fields(endpoint = %self.endpoint, model = %request.model))]
    async fn stream_story(&self, request: &StoryRequest) -> Result<ChunkStream> {
        let resp = self
            .client
            .post(&self.endpoint)
            .json(&Self::build_body(request))
            .send()
            .await?;
        let resp = check_status(resp).await?;
        debug!(status = resp.status().as_u16(), "story stream opened");
        Ok(body_chunks(resp))
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

/// Image collaborator reached over plain HTTP.
#[derive(Debug, Clone)]
pub struct HttpImageBackend {
    client: Client,
    endpoint: String,
}

impl HttpImageBackend {
    pub fn new(client: Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }

    /// Build from `STORY_IMAGE_ENDPOINT` and the shared HTTP settings.
    pub fn from_config(config: &StoryConfig) -> Result<Self> {
        let endpoint = config
            .image_endpoint
            .clone()
            .ok_or_else(|| StoryError::InvalidConfig("image endpoint is not set".into()))?;
        Ok(Self::new(config.http_client()?, endpoint))
    }

    fn build_body(request: &ImageRequest) -> Value {
        json!({
            "model": request.model,
            "prompts": request.prompts,
        })
    }
}

#[async_trait]
impl ImageBackend for HttpImageBackend {
    #[instrument(skip_all, fields(endpoint = %self.endpoint, prompts = request.prompts.len()))]
    async fn generate_images(&self, request: &ImageRequest) -> Result<ChunkStream> {
        let resp = self
            .client
            .post(&self.endpoint)
            .header(ACCEPT, "text/event-stream")
            .json(&Self::build_body(request))
            .send()
            .await?;
        let resp = check_status(resp).await?;
        debug!(status = resp.status().as_u16(), "image stream opened");
        Ok(body_chunks(resp))
    }

    fn name(&self) -> &'static str {
        "http"
    }
}
