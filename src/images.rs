//! Image generation orchestrator.
//!
//! [`ImageGenerator`] keeps one [`GenerativeImage`] slot per prompt on an
//! [`ImageBoard`] published through a [`tokio::sync::watch`] channel. A call
//! to [`generate`](ImageGenerator::generate) issues one batched request for
//! its prompts and demultiplexes the result stream back onto the board.
//!
//! The collaborator works through a batch in request order, so every prompt
//! carries its own deadline: the first one's starts with the request, each
//! later one's starts when the prompt before it settles. When it passes, the
//! prompt fails with "Request timed out." while the shared stream keeps
//! being read for the others. Each slot records the id of the request that owns it and only
//! that request may settle it, once: whichever of result or timeout comes
//! first wins, and a later regeneration takes the slot over.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, instrument, warn};

use crate::backend::{ImageBackend, ImageRequest};
use crate::config::StoryConfig;
use crate::events::{emit, Event, EventHandler};
use crate::models::DEFAULT_IMAGE_MODEL;
use crate::parser::is_allowed_image_url;
use crate::session::StoryState;
use crate::story::{GenerationState, GenerativeImage, StoryElement};
use crate::streaming::{DecodedItem, ImageEvent, ImageEventDecoder};

pub const MSG_TIMED_OUT: &str = "Request timed out.";
pub const MSG_UNAVAILABLE: &str = "Cannot generate right now.";
pub const MSG_UNEXPECTED: &str = "Unexpected data.";
pub const MSG_NO_DATA: &str = "No data received.";
const MSG_UNKNOWN: &str = "Unknown error.";

/// Every image slot of the current story.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageBoard {
    /// Image model used for new requests.
    pub model: String,
    pub images: HashMap<String, GenerativeImage>,
}

impl Default for ImageBoard {
    fn default() -> Self {
        Self {
            model: DEFAULT_IMAGE_MODEL.to_string(),
            images: HashMap::new(),
        }
    }
}

impl ImageBoard {
    pub fn get(&self, prompt: &str) -> Option<&GenerativeImage> {
        self.images.get(prompt)
    }

    /// Whether any prompt is still in flight.
    pub fn has_generating(&self) -> bool {
        self.images.values().any(GenerativeImage::is_generating)
    }

    /// `prompt -> url` for every succeeded slot.
    pub fn generated_urls(&self) -> HashMap<String, String> {
        self.images
            .iter()
            .filter_map(|(prompt, image)| image.url().map(|url| (prompt.clone(), url.to_string())))
            .collect()
    }
}

/// Orchestrates batched image generation for the prompts of a story.
///
/// Cheap to clone; clones share the same board.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use story_pipeline::backend::mock::{MockChunk, MockImageBackend};
/// use story_pipeline::{ImageGenerator, StoryConfig};
///
/// # tokio_test::block_on(async {
/// let backend = Arc::new(MockImageBackend::script(vec![MockChunk::text(
///     "data: {\"ok\":true,\"prompt\":\"a red moon\",\"url\":\"https://cdn.test/moon.png\"}\n\n",
/// )]));
/// let config = StoryConfig::builder()
///     .allowed_image_url_prefix("https://cdn.test/")
///     .build();
/// let images = ImageGenerator::new(backend, &config);
///
/// images.run_generation(vec!["a red moon".to_string()]).await;
/// assert_eq!(
///     images.generated_urls().get("a red moon").map(String::as_str),
///     Some("https://cdn.test/moon.png")
/// );
/// # });
/// ```
#[derive(Clone)]
pub struct ImageGenerator {
    backend: Arc<dyn ImageBackend>,
    allowed_image_url_prefix: Arc<str>,
    timeout: Duration,
    board: Arc<watch::Sender<ImageBoard>>,
    next_request: Arc<AtomicU64>,
    event_handler: Option<Arc<dyn EventHandler>>,
}

impl ImageGenerator {
    pub fn new(backend: Arc<dyn ImageBackend>, config: &StoryConfig) -> Self {
        let (board, _) = watch::channel(ImageBoard::default());
        Self {
            backend,
            allowed_image_url_prefix: Arc::from(config.allowed_image_url_prefix.as_str()),
            timeout: config.image_timeout,
            board: Arc::new(board),
            next_request: Arc::new(AtomicU64::new(0)),
            event_handler: None,
        }
    }

    /// Set the event handler.
    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.event_handler = Some(handler);
        self
    }

    /// Receive every published board.
    pub fn subscribe(&self) -> watch::Receiver<ImageBoard> {
        self.board.subscribe()
    }

    /// Snapshot of the current board.
    pub fn board(&self) -> ImageBoard {
        self.board.borrow().clone()
    }

    /// `prompt -> url` for every generated image.
    pub fn generated_urls(&self) -> HashMap<String, String> {
        self.board.borrow().generated_urls()
    }

    /// Drop every slot and switch to `model` for a new story.
    ///
    /// Requests still in flight can no longer settle anything.
    pub fn reset(&self, model: impl Into<String>) {
        self.board.send_replace(ImageBoard {
            model: model.into(),
            images: HashMap::new(),
        });
    }

    /// Sync the board with the image elements of a freshly parsed document.
    ///
    /// Slots for prompts still present are kept as they are. New prompts get
    /// a `Waiting` slot, or a `Succeeded` one when the element already has
    /// a URL. Prompts no longer present are dropped. Returns the new
    /// prompts that need generation, in document order.
    pub fn track(&self, elements: &[StoryElement]) -> Vec<String> {
        let mut to_generate = Vec::new();
        self.board.send_if_modified(|board| {
            let mut next = HashMap::new();
            let mut added = false;
            for element in elements {
                let StoryElement::Image { prompt, url } = element else {
                    continue;
                };
                if next.contains_key(prompt) {
                    continue;
                }
                let slot = match board.images.remove(prompt) {
                    Some(existing) => existing,
                    None => {
                        added = true;
                        match url {
                            Some(url) => GenerativeImage {
                                prompt: prompt.clone(),
                                state: GenerationState::Succeeded { url: url.clone() },
                                request: 0,
                            },
                            None => {
                                to_generate.push(prompt.clone());
                                GenerativeImage::waiting(prompt.as_str())
                            }
                        }
                    }
                };
                next.insert(prompt.clone(), slot);
            }
            // Leftovers are prompts that vanished from the document.
            let changed = added || !board.images.is_empty();
            board.images = next;
            changed
        });
        to_generate
    }

    /// Generate `prompts` in the background.
    pub fn generate(&self, prompts: Vec<String>) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move { this.run_generation(prompts).await })
    }

    /// Regenerate a single prompt without touching any other slot.
    pub fn regenerate(&self, prompt: impl Into<String>) -> JoinHandle<()> {
        self.generate(vec![prompt.into()])
    }

    /// Issue one batched request for `prompts` and settle each of them.
    ///
    /// Never fails: every outcome ends up on the board.
    #[instrument(skip_all, fields(request = tracing::field::Empty, prompts = prompts.len()))]
    pub async fn run_generation(&self, prompts: Vec<String>) {
        let mut unique: Vec<String> = Vec::new();
        for prompt in prompts {
            if !prompt.trim().is_empty() && !unique.contains(&prompt) {
                unique.push(prompt);
            }
        }
        if unique.is_empty() {
            return;
        }

        let request_id = self.next_request.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::Span::current().record("request", request_id);

        let mut model = String::new();
        self.board.send_modify(|board| {
            model = board.model.clone();
            for prompt in &unique {
                let slot = board
                    .images
                    .entry(prompt.clone())
                    .or_insert_with(|| GenerativeImage::waiting(prompt.as_str()));
                slot.state = GenerationState::Generating;
                slot.request = request_id;
            }
        });
        emit(
            &self.event_handler,
            Event::ImageStart {
                request: request_id,
                prompts: unique.clone(),
            },
        );
        info!(model = %model, "image request started");

        let mut run = Generation {
            owner: self,
            request: request_id,
            pending: unique.clone(),
            armed: None,
        };
        let Some(deadline) = run.next_deadline() else {
            return;
        };

        let request = ImageRequest {
            model,
            prompts: unique,
        };
        let opened = tokio::select! {
            result = self.backend.generate_images(&request) => Some(result),
            _ = sleep_until(deadline) => None,
        };
        let mut stream = match opened {
            Some(Ok(stream)) => stream,
            Some(Err(e)) => {
                warn!(error = %e, "image request failed");
                run.fail_all(MSG_UNAVAILABLE);
                return;
            }
            None => {
                warn!("image request timed out before responding");
                run.fail_all(MSG_TIMED_OUT);
                return;
            }
        };

        let mut decoder = ImageEventDecoder::new();
        while let Some(next_deadline) = run.next_deadline() {
            tokio::select! {
                item = stream.next() => match item {
                    Some(Ok(bytes)) => {
                        for decoded in decoder.decode(&bytes) {
                            run.apply(decoded);
                        }
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "image stream broke");
                        run.fail_all(MSG_UNAVAILABLE);
                        return;
                    }
                    None => {
                        if let Some(decoded) = decoder.flush() {
                            run.apply(decoded);
                        }
                        if !run.pending.is_empty() {
                            debug!(left = run.pending.len(), "image stream closed early");
                            run.fail_all(MSG_NO_DATA);
                        }
                        return;
                    }
                },
                _ = sleep_until(next_deadline) => run.expire(Instant::now()),
            }
        }
        debug!("image request settled");
    }

    /// Settle `prompt` if `request` still owns it and it is in flight.
    fn settle(&self, request: u64, prompt: &str, state: GenerationState) -> bool {
        let event = match &state {
            GenerationState::Succeeded { url } => Some(Event::ImageGenerated {
                prompt: prompt.to_string(),
                url: url.clone(),
            }),
            GenerationState::Failed { message } => Some(Event::ImageFailed {
                prompt: prompt.to_string(),
                message: message.clone(),
            }),
            GenerationState::Waiting | GenerationState::Generating => None,
        };
        let applied = self.board.send_if_modified(|board| match board.images.get_mut(prompt) {
            Some(slot) if slot.request == request && slot.is_generating() => {
                slot.state = state;
                true
            }
            _ => false,
        });
        if applied {
            if let Some(event) = event {
                emit(&self.event_handler, event);
            }
        } else {
            debug!(request, prompt, "result discarded, slot already settled or taken over");
        }
        applied
    }

    /// Follow a story writer: reset on every new session and generate
    /// images for new prompts as they appear in the text.
    pub fn follow(&self, mut story: watch::Receiver<StoryState>) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut session = None;
            loop {
                let (id, elements, model) = {
                    let state = story.borrow_and_update();
                    (
                        state.session,
                        state.elements.clone(),
                        state.request.as_ref().map(|r| r.image_model.clone()),
                    )
                };
                if session != Some(id) {
                    session = Some(id);
                    this.reset(model.unwrap_or_else(|| DEFAULT_IMAGE_MODEL.to_string()));
                }
                let prompts = this.track(&elements);
                if !prompts.is_empty() {
                    this.generate(prompts);
                }
                if story.changed().await.is_err() {
                    break;
                }
            }
        })
    }
}

impl std::fmt::Debug for ImageGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageGenerator")
            .field("backend", &self.backend.name())
            .field("allowed_image_url_prefix", &self.allowed_image_url_prefix)
            .field("timeout", &self.timeout)
            .field("has_event_handler", &self.event_handler.is_some())
            .finish()
    }
}

/// Bookkeeping for one in-flight request.
struct Generation<'a> {
    owner: &'a ImageGenerator,
    request: u64,
    /// Prompts not settled yet, in request order.
    pending: Vec<String>,
    /// The prompt whose timer is running, with its deadline.
    armed: Option<(String, Instant)>,
}

impl Generation<'_> {
    /// Deadline of the first pending prompt, arming its timer if it was
    /// not running yet.
    fn next_deadline(&mut self) -> Option<Instant> {
        let head = self.pending.first()?;
        if let Some((prompt, deadline)) = &self.armed {
            if prompt == head {
                return Some(*deadline);
            }
        }
        let deadline = Instant::now() + self.owner.timeout;
        self.armed = Some((head.clone(), deadline));
        Some(deadline)
    }

    fn settle(&mut self, prompt: &str, state: GenerationState) {
        match self.pending.iter().position(|p| p == prompt) {
            Some(index) => {
                self.pending.remove(index);
                self.owner.settle(self.request, prompt, state);
            }
            None => debug!(prompt, "result for a prompt that is not pending"),
        }
    }

    fn fail(&mut self, prompt: &str, message: &str) {
        self.settle(
            prompt,
            GenerationState::Failed {
                message: message.to_string(),
            },
        );
    }

    /// Fail `prompt` if given, otherwise every pending prompt.
    fn fail_target(&mut self, prompt: Option<&str>, message: &str) {
        match prompt {
            Some(prompt) => self.fail(prompt, message),
            None => self.fail_all(message),
        }
    }

    fn fail_all(&mut self, message: &str) {
        for prompt in self.pending.clone() {
            self.fail(&prompt, message);
        }
    }

    /// Fail the armed prompt if its deadline has passed.
    fn expire(&mut self, now: Instant) {
        let Some((prompt, deadline)) = self.armed.clone() else {
            return;
        };
        if deadline <= now && self.pending.contains(&prompt) {
            warn!(prompt = %prompt, "image timed out");
            self.fail(&prompt, MSG_TIMED_OUT);
        }
    }

    fn apply(&mut self, decoded: DecodedItem) {
        match decoded {
            DecodedItem::Result(event) => self.apply_result(event),
            DecodedItem::Rejected { event, raw } => {
                let message = event.message.clone().unwrap_or(raw);
                warn!(prompt = ?event.prompt, message = %message, "image request rejected");
                self.fail_target(event.prompt.as_deref(), &message);
            }
            DecodedItem::Malformed { raw, prompt } => {
                warn!(raw = %raw, "unexpected image event");
                self.fail_target(prompt.as_deref(), MSG_UNEXPECTED);
            }
        }
    }

    fn apply_result(&mut self, event: ImageEvent) {
        let Some(prompt) = event.prompt.as_deref() else {
            let message = event.message.as_deref().unwrap_or(MSG_UNKNOWN);
            self.fail_all(message);
            return;
        };

        match event.success_url() {
            Some(url) if is_allowed_image_url(url, &self.owner.allowed_image_url_prefix) => {
                self.settle(
                    prompt,
                    GenerationState::Succeeded {
                        url: url.to_string(),
                    },
                );
            }
            Some(url) => {
                warn!(prompt, url, "image URL outside the allowed prefix");
                self.settle(prompt, GenerationState::Waiting);
            }
            None => {
                let message = event.message.as_deref().unwrap_or(MSG_UNKNOWN);
                self.fail(prompt, message);
            }
        }
    }
}
