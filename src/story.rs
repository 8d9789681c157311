//! Story document data model.
//!
//! A story is an ordered sequence of [`StoryElement`]s derived from the
//! model's markdown-ish output. Image elements are keyed by their prompt,
//! which is how generated images are correlated back into the document.

use serde::{Deserialize, Serialize};
use std::ops::Deref;

/// One element of a story document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoryElement {
    /// A `# Title` line. By convention the first element when present.
    Title { text: String },
    /// A free text block.
    Paragraph { text: String },
    /// A prompted image. `url` stays `None` until an allowed URL is known.
    Image { prompt: String, url: Option<String> },
}

impl StoryElement {
    pub fn title(text: impl Into<String>) -> Self {
        StoryElement::Title { text: text.into() }
    }

    pub fn paragraph(text: impl Into<String>) -> Self {
        StoryElement::Paragraph { text: text.into() }
    }

    pub fn image(prompt: impl Into<String>, url: Option<String>) -> Self {
        StoryElement::Image {
            prompt: prompt.into(),
            url,
        }
    }

    /// The image prompt, if this is an image element.
    pub fn prompt(&self) -> Option<&str> {
        match self {
            StoryElement::Image { prompt, .. } => Some(prompt),
            StoryElement::Title { .. } | StoryElement::Paragraph { .. } => None,
        }
    }
}

/// An ordered story document, as produced by [`parse`](crate::parser::parse).
///
/// Documents are never mutated in place; every re-parse yields a fresh one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StoryDocument(Vec<StoryElement>);

impl StoryDocument {
    pub fn new(elements: Vec<StoryElement>) -> Self {
        Self(elements)
    }

    pub fn elements(&self) -> &[StoryElement] {
        &self.0
    }

    pub fn into_elements(self) -> Vec<StoryElement> {
        self.0
    }

    /// Text of the first title element.
    pub fn title(&self) -> Option<&str> {
        crate::reassembly::resolve_title(&self.0)
    }

    /// All image elements, in document order.
    pub fn images(&self) -> impl Iterator<Item = &StoryElement> {
        self.0
            .iter()
            .filter(|e| matches!(e, StoryElement::Image { .. }))
    }

    /// Prompts of images that have no URL yet, in order, without duplicates.
    pub fn prompts_without_url(&self) -> Vec<String> {
        let mut prompts: Vec<String> = Vec::new();
        for element in &self.0 {
            if let StoryElement::Image { prompt, url: None } = element {
                if !prompts.iter().any(|p| p == prompt) {
                    prompts.push(prompt.clone());
                }
            }
        }
        prompts
    }
}

impl Deref for StoryDocument {
    type Target = [StoryElement];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<Vec<StoryElement>> for StoryDocument {
    fn from(elements: Vec<StoryElement>) -> Self {
        Self(elements)
    }
}

/// Lifecycle of one image prompt's generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum GenerationState {
    /// Known but not requested yet.
    Waiting,
    /// A request is in flight.
    Generating,
    /// An allowed URL arrived.
    Succeeded { url: String },
    /// The request failed, timed out, or returned garbage.
    Failed { message: String },
}

/// Per-prompt entry on the image board.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerativeImage {
    pub prompt: String,
    pub state: GenerationState,
    /// Id of the generation request that currently owns this slot.
    /// Results from any other request are discarded.
    pub request: u64,
}

impl GenerativeImage {
    pub fn waiting(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            state: GenerationState::Waiting,
            request: 0,
        }
    }

    pub fn url(&self) -> Option<&str> {
        match &self.state {
            GenerationState::Succeeded { url } => Some(url),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match &self.state {
            GenerationState::Failed { message } => Some(message),
            _ => None,
        }
    }

    pub fn is_waiting(&self) -> bool {
        matches!(self.state, GenerationState::Waiting)
    }

    pub fn is_generating(&self) -> bool {
        matches!(self.state, GenerationState::Generating)
    }
}
