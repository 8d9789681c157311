//! # Story Pipeline
//!
//! Streaming illustrated-story generation.
//!
//! A language model writes a short story in a small markdown dialect while
//! this crate re-parses the growing text after every chunk, discovers image
//! prompts as they appear, requests images for them in batches with a
//! per-prompt deadline, and folds the resulting URLs back into the document
//! so the finished story can be shared.
//!
//! ## Core Concepts
//!
//! - **[`parser`]**: total, pure parser for titles, paragraphs and
//!   `![prompt](url)` images. Safe on truncated input.
//! - **[`StoryWriter`]**: consumes a text stream for one session at a time
//!   and publishes [`StoryState`] snapshots through a `watch` channel.
//! - **[`ImageGenerator`]**: orchestrates image requests, decodes the
//!   chunked `data: {json}` response and publishes an [`ImageBoard`].
//! - **[`reassembly`]**: serializes elements back to text, merging
//!   generated URLs by prompt.
//! - **[`share`]**: validates and stores finished stories.
//!
//! Transport sits behind [`TextBackend`](backend::TextBackend) and
//! [`ImageBackend`](backend::ImageBackend); HTTP and mock implementations
//! ship with the crate.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use story_pipeline::backend::{HttpImageBackend, HttpTextBackend, StoryRequest};
//! use story_pipeline::{ImageGenerator, StoryConfig, StoryWriter};
//!
//! #[tokio::main]
//! async fn main() -> story_pipeline::Result<()> {
//!     let config = StoryConfig::from_env()?;
//!     let writer = StoryWriter::new(Arc::new(HttpTextBackend::from_config(&config)?), &config);
//!     let images = ImageGenerator::new(Arc::new(HttpImageBackend::from_config(&config)?), &config);
//!     images.follow(writer.subscribe());
//!
//!     writer.begin(StoryRequest::new("gpt-3.5-turbo", "a lighthouse keeper's cat")).run().await?;
//!     println!("{}", writer.state().content);
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod config;
pub mod error;
pub mod events;
pub mod images;
pub mod models;
pub mod parser;
pub mod prompt;
pub mod reassembly;
pub mod session;
pub mod share;
pub mod story;
pub mod streaming;

pub use backend::{ImageBackend, StoryRequest, TextBackend};
pub use config::{StoryConfig, StoryConfigBuilder};
pub use error::{Result, StoryError};
pub use events::{Event, EventHandler, FnEventHandler};
pub use images::{ImageBoard, ImageGenerator};
pub use session::{StorySession, StoryState, StoryWriter};
pub use share::{InMemoryStoryStore, ShareRequest, SharedStory, StoryStore};
pub use story::{GenerationState, GenerativeImage, StoryDocument, StoryElement};
pub use streaming::{DecodedItem, ImageEvent, ImageEventDecoder};
