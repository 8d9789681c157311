//! Sharing finished stories.
//!
//! A [`ShareRequest`] is built from the final story and image state,
//! validated, and handed to a [`StoryStore`]. Only [`InMemoryStoryStore`]
//! ships with the crate; durable stores live with the application.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::info;

use crate::config::StoryConfig;
use crate::error::Result;
use crate::images::ImageBoard;
use crate::models::{find_image_model, find_text_model, Model, UNKNOWN_MODEL};
use crate::parser;
use crate::reassembly;
use crate::session::StoryState;
use crate::story::StoryElement;
use crate::StoryError;

/// Everything needed to publish a story.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShareRequest {
    pub prompt: String,
    pub title: String,
    /// Serialized story text with generated image URLs folded in.
    pub content: String,
    pub text_model: String,
    pub image_model: String,
    pub share_username: Option<String>,
}

impl ShareRequest {
    /// Build a share request from the final state of a session.
    ///
    /// The title falls back to the prompt when the story has none. Fails
    /// while text or images are still being generated.
    pub fn from_story(
        state: &StoryState,
        board: &ImageBoard,
        share_username: Option<String>,
    ) -> Result<Self> {
        let request = state
            .request
            .as_ref()
            .ok_or_else(|| StoryError::InvalidShare("There is no story to share.".into()))?;
        if state.is_generating {
            return Err(StoryError::InvalidShare(
                "The story is still being written.".into(),
            ));
        }
        if board.has_generating() {
            return Err(StoryError::InvalidShare(
                "Images are still being generated.".into(),
            ));
        }

        let content = reassembly::serialize(&state.elements, &board.generated_urls());
        let title = state.elements.title().unwrap_or(request.prompt.as_str()).to_string();
        Ok(Self {
            prompt: request.prompt.clone(),
            title,
            content,
            text_model: request.model.clone(),
            image_model: request.image_model.clone(),
            share_username,
        })
    }

    /// Check required fields and return the elements worth sharing.
    ///
    /// Images without a URL are dropped; a story left with nothing is
    /// rejected.
    pub fn validate(&self, allowed_image_url_prefix: &str) -> Result<Vec<StoryElement>> {
        let required = [
            ("prompt", &self.prompt),
            ("title", &self.title),
            ("content", &self.content),
            ("textModel", &self.text_model),
            ("imageModel", &self.image_model),
        ];
        for (name, value) in required {
            if value.is_empty() {
                return Err(StoryError::InvalidShare(format!(
                    "Non-empty '{}' required.",
                    name
                )));
            }
        }

        let elements = reassembly::shareable(&parser::parse(
            &self.content,
            allowed_image_url_prefix,
        ));
        if elements.is_empty() {
            return Err(StoryError::InvalidShare(
                "Seems there is nothing in this story?!".into(),
            ));
        }
        Ok(elements)
    }
}

/// A published story.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedStory {
    pub id: String,
    /// Public link to the story.
    pub url: String,
    /// URL of the first image, if any.
    pub cover: Option<String>,
    pub story: ShareRequest,
}

impl SharedStory {
    /// Catalog entry of the text model, or [`UNKNOWN_MODEL`].
    pub fn text_model(&self) -> &'static Model {
        find_text_model(&self.story.text_model).unwrap_or(&UNKNOWN_MODEL)
    }

    /// Catalog entry of the image model, or [`UNKNOWN_MODEL`].
    pub fn image_model(&self) -> &'static Model {
        find_image_model(&self.story.image_model).unwrap_or(&UNKNOWN_MODEL)
    }
}

/// Persistence collaborator for shared stories.
#[async_trait]
pub trait StoryStore: Send + Sync {
    /// Validate and persist `request`.
    async fn share(&self, request: ShareRequest) -> Result<SharedStory>;

    /// Load a previously shared story.
    async fn get(&self, id: &str) -> Result<Option<SharedStory>>;
}

/// HashMap-backed [`StoryStore`]. All data is lost when it is dropped.
///
/// # Example
///
/// ```
/// use story_pipeline::share::{InMemoryStoryStore, ShareRequest, StoryStore};
///
/// # tokio_test::block_on(async {
/// let store = InMemoryStoryStore::new("stories.example", "https://cdn.example/");
/// let shared = store
///     .share(ShareRequest {
///         prompt: "a red moon".into(),
///         title: "The Red Moon".into(),
///         content: "# The Red Moon\n\nIt rose.".into(),
///         text_model: "gpt-3.5-turbo".into(),
///         image_model: "stabilityai/stable-diffusion-2-1".into(),
///         share_username: None,
///     })
///     .await
///     .unwrap();
/// assert_eq!(shared.url, format!("https://stories.example/story/{}", shared.id));
/// # });
/// ```
#[derive(Debug, Clone)]
pub struct InMemoryStoryStore {
    hosted_domain: String,
    allowed_image_url_prefix: String,
    stories: Arc<RwLock<HashMap<String, SharedStory>>>,
    next_id: Arc<RwLock<u64>>,
}

impl InMemoryStoryStore {
    pub fn new(hosted_domain: impl Into<String>, allowed_image_url_prefix: impl Into<String>) -> Self {
        Self {
            hosted_domain: hosted_domain.into(),
            allowed_image_url_prefix: allowed_image_url_prefix.into(),
            stories: Arc::new(RwLock::new(HashMap::new())),
            next_id: Arc::new(RwLock::new(1)),
        }
    }

    /// Build from `HOSTED_DOMAIN` and the image URL allow-list.
    pub fn from_config(config: &StoryConfig) -> Result<Self> {
        let domain = config
            .hosted_domain
            .clone()
            .ok_or_else(|| StoryError::InvalidConfig("hosted domain is not set".into()))?;
        Ok(Self::new(domain, config.allowed_image_url_prefix.clone()))
    }

    /// Public link for a story id.
    pub fn story_url(&self, id: &str) -> String {
        format!("https://{}/story/{}", self.hosted_domain, id)
    }

    /// Number of stored stories.
    pub async fn len(&self) -> usize {
        self.stories.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.stories.read().await.is_empty()
    }
}

#[async_trait]
impl StoryStore for InMemoryStoryStore {
    async fn share(&self, request: ShareRequest) -> Result<SharedStory> {
        let elements = request.validate(&self.allowed_image_url_prefix)?;

        let mut next_id = self.next_id.write().await;
        let id = next_id.to_string();
        *next_id += 1;
        drop(next_id);

        let shared = SharedStory {
            url: self.story_url(&id),
            cover: reassembly::cover(&elements).map(str::to_string),
            id: id.clone(),
            story: request,
        };
        self.stories.write().await.insert(id, shared.clone());
        info!(
            id = %shared.id,
            title = %shared.story.title,
            text_model = shared.text_model().human_name,
            image_model = shared.image_model().human_name,
            "story shared"
        );
        Ok(shared)
    }

    async fn get(&self, id: &str) -> Result<Option<SharedStory>> {
        Ok(self.stories.read().await.get(id).cloned())
    }
}
