//! Story stream consumer.
//!
//! A [`StoryWriter`] publishes one [`StoryState`] through a
//! [`tokio::sync::watch`] channel. Each prompt submission starts a new
//! [`StorySession`] that streams text from the [`TextBackend`], re-parses
//! the whole buffer after every chunk and republishes.
//!
//! Only the newest session may publish. Every write goes through
//! `send_if_modified` and is dropped unless the published state still
//! carries the writing session's id, so chunks from a superseded stream
//! never reach observers.

use std::sync::{Arc, Mutex};

use futures::StreamExt;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::backend::{StoryRequest, TextBackend};
use crate::config::StoryConfig;
use crate::error::Result;
use crate::events::{emit, Event, EventHandler};
use crate::parser;
use crate::story::StoryDocument;
use crate::streaming::{likely_json, Utf8Carry};
use crate::StoryError;

/// The observable state of the current story.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoryState {
    /// Id of the session that owns this state. `0` before the first session.
    pub session: u64,
    /// The request that started the session.
    pub request: Option<StoryRequest>,
    /// Raw text received so far.
    pub content: String,
    /// `content`, parsed.
    pub elements: StoryDocument,
    pub is_generating: bool,
    pub error: Option<String>,
}

/// Owner of the published story state.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use story_pipeline::backend::{MockTextBackend, StoryRequest};
/// use story_pipeline::{StoryConfig, StoryWriter, StoryElement};
///
/// # tokio_test::block_on(async {
/// let backend = Arc::new(MockTextBackend::chunks(["# The Moon\n", "It was red."]));
/// let writer = StoryWriter::new(backend, &StoryConfig::default());
///
/// let session = writer.begin(StoryRequest::new("gpt-3.5-turbo", "a red moon"));
/// session.run().await.unwrap();
///
/// let state = writer.state();
/// assert!(!state.is_generating);
/// assert_eq!(state.elements[0], StoryElement::title("The Moon"));
/// # });
/// ```
pub struct StoryWriter {
    backend: Arc<dyn TextBackend>,
    allowed_image_url_prefix: Arc<str>,
    state: Arc<watch::Sender<StoryState>>,
    current: Mutex<Option<JoinHandle<()>>>,
    event_handler: Option<Arc<dyn EventHandler>>,
}

impl StoryWriter {
    pub fn new(backend: Arc<dyn TextBackend>, config: &StoryConfig) -> Self {
        let (state, _) = watch::channel(StoryState::default());
        Self {
            backend,
            allowed_image_url_prefix: Arc::from(config.allowed_image_url_prefix.as_str()),
            state: Arc::new(state),
            current: Mutex::new(None),
            event_handler: None,
        }
    }

    /// Set the event handler.
    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.event_handler = Some(handler);
        self
    }

    /// Receive every published state.
    pub fn subscribe(&self) -> watch::Receiver<StoryState> {
        self.state.subscribe()
    }

    /// Snapshot of the current state.
    pub fn state(&self) -> StoryState {
        self.state.borrow().clone()
    }

    /// Start a new session and publish its reset state.
    ///
    /// The reset happens here, before any I/O, so observers never see the
    /// previous story's content once a new prompt is submitted. From this
    /// point on every older session is superseded.
    pub fn begin(&self, request: StoryRequest) -> StorySession {
        let mut id = 0;
        self.state.send_modify(|state| {
            id = state.session + 1;
            *state = StoryState {
                session: id,
                request: Some(request.clone()),
                is_generating: true,
                ..StoryState::default()
            };
        });
        info!(session = id, model = %request.model, "story session started");

        StorySession {
            id,
            request,
            backend: Arc::clone(&self.backend),
            allowed_image_url_prefix: Arc::clone(&self.allowed_image_url_prefix),
            state: Arc::clone(&self.state),
            event_handler: self.event_handler.clone(),
        }
    }

    /// Start a new session and run it on the tokio runtime.
    ///
    /// The previous session's task is aborted. Returns the new session id.
    pub fn submit(&self, request: StoryRequest) -> u64 {
        let session = self.begin(request);
        let id = session.id();
        let handle = tokio::spawn(async move {
            if let Err(e) = session.run().await {
                debug!(session = id, error = %e, "session ended early");
            }
        });
        if let Ok(mut current) = self.current.lock() {
            if let Some(previous) = current.replace(handle) {
                previous.abort();
            }
        }
        id
    }
}

impl std::fmt::Debug for StoryWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoryWriter")
            .field("backend", &self.backend.name())
            .field("allowed_image_url_prefix", &self.allowed_image_url_prefix)
            .field("session", &self.state.borrow().session)
            .field("has_event_handler", &self.event_handler.is_some())
            .finish()
    }
}

/// One streaming run, created by [`StoryWriter::begin`].
pub struct StorySession {
    id: u64,
    request: StoryRequest,
    backend: Arc<dyn TextBackend>,
    allowed_image_url_prefix: Arc<str>,
    state: Arc<watch::Sender<StoryState>>,
    event_handler: Option<Arc<dyn EventHandler>>,
}

impl StorySession {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Stream the story to completion.
    ///
    /// Collaborator failures end up in the published `error` field and
    /// still return `Ok`. Returns [`StoryError::Superseded`] as soon as a
    /// newer session has taken over; nothing is published after that.
    #[instrument(skip(self), fields(session = self.id, model = %self.request.model))]
    pub async fn run(self) -> Result<()> {
        emit(
            &self.event_handler,
            Event::SessionStart {
                session: self.id,
                model: self.request.model.clone(),
                prompt: self.request.prompt.clone(),
            },
        );

        let mut stream = match self.backend.stream_story(&self.request).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "story request failed");
                return self.finish(Some(e.user_message()));
            }
        };

        let mut buffer = String::new();
        let mut text = Utf8Carry::default();
        let mut first = true;

        while let Some(item) = stream.next().await {
            let bytes = match item {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(error = %e, received = buffer.len(), "story stream broke");
                    return self.finish(Some(e.user_message()));
                }
            };
            let chunk = text.push(&bytes);
            if chunk.is_empty() {
                continue;
            }

            let error = if first { error_envelope(&chunk) } else { None };
            if let Some(ref message) = error {
                warn!(message = %message, "first chunk looks like an error envelope");
            }
            first = false;

            buffer.push_str(&chunk);
            emit(
                &self.event_handler,
                Event::Chunk {
                    session: self.id,
                    chunk,
                },
            );
            self.publish_content(&buffer, error)?;
        }

        if let Some(rest) = text.finish() {
            buffer.push_str(&rest);
            let keep_error = self.state.borrow().error.clone();
            self.publish_content(&buffer, keep_error)?;
        }

        debug!(received = buffer.len(), "story stream complete");
        let error = self.state.borrow().error.clone();
        self.finish(error)
    }

    /// Publish `update` if this session still owns the state.
    fn publish(&self, update: impl FnOnce(&mut StoryState)) -> Result<()> {
        let id = self.id;
        let applied = self.state.send_if_modified(|state| {
            if state.session != id {
                return false;
            }
            update(state);
            true
        });
        if applied {
            Ok(())
        } else {
            debug!(session = id, "superseded, dropping update");
            Err(StoryError::Superseded)
        }
    }

    fn publish_content(&self, buffer: &str, error: Option<String>) -> Result<()> {
        let elements = parser::parse(buffer, &self.allowed_image_url_prefix);
        self.publish(|state| {
            state.content = buffer.to_string();
            state.elements = elements;
            state.is_generating = true;
            state.error = error;
        })
    }

    fn finish(&self, error: Option<String>) -> Result<()> {
        self.publish(|state| {
            state.is_generating = false;
            state.error = error.clone();
        })?;
        emit(
            &self.event_handler,
            Event::SessionEnd {
                session: self.id,
                error,
            },
        );
        Ok(())
    }
}

impl std::fmt::Debug for StorySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorySession")
            .field("id", &self.id)
            .field("request", &self.request)
            .field("backend", &self.backend.name())
            .finish()
    }
}

/// `message` of a first chunk shaped like `{"message": ...}`.
///
/// The chunk is still story text as far as the buffer is concerned; the
/// collaborator cannot tell the two apart.
fn error_envelope(chunk: &str) -> Option<String> {
    let trimmed = chunk.trim();
    if !likely_json(trimmed) {
        return None;
    }
    let value: Value = serde_json::from_str(trimmed).ok()?;
    value
        .get("message")
        .and_then(Value::as_str)
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::{MockChunk, MockReply};
    use crate::backend::MockTextBackend;
    use crate::events::testing::Recorder;
    use crate::story::StoryElement;
    use std::time::Duration;

    const CDN: &str = "https://cdn.test/";

    fn writer(backend: MockTextBackend) -> StoryWriter {
        let config = StoryConfig::builder().allowed_image_url_prefix(CDN).build();
        StoryWriter::new(Arc::new(backend), &config)
    }

    fn request(prompt: &str) -> StoryRequest {
        StoryRequest::new("gpt-3.5-turbo", prompt)
    }

    #[tokio::test]
    async fn test_stream_to_completion() {
        let writer = writer(MockTextBackend::chunks([
            "# The Red Moon\nOnce upon",
            " a time.\n![a red moon](",
            ")\nThe end.",
        ]));
        writer.begin(request("moon")).run().await.unwrap();

        let state = writer.state();
        assert!(!state.is_generating);
        assert!(state.error.is_none());
        assert_eq!(state.content, "# The Red Moon\nOnce upon a time.\n![a red moon]()\nThe end.");
        assert_eq!(
            state.elements.elements(),
            &[
                StoryElement::title("The Red Moon"),
                StoryElement::paragraph("Once upon a time."),
                StoryElement::image("a red moon", None),
                StoryElement::paragraph("The end."),
            ]
        );
        assert_eq!(state.request.map(|r| r.prompt), Some("moon".to_string()));
    }

    #[tokio::test]
    async fn test_begin_resets_before_io() {
        let writer = writer(MockTextBackend::chunks(["first story"]));
        writer.begin(request("one")).run().await.unwrap();
        assert_eq!(writer.state().content, "first story");

        let session = writer.begin(request("two"));
        let state = writer.state();
        assert_eq!(state.session, session.id());
        assert!(state.is_generating);
        assert!(state.content.is_empty());
        assert!(state.elements.is_empty());
        assert!(state.error.is_none());
    }

    #[tokio::test]
    async fn test_publishes_after_every_chunk() {
        let writer = writer(MockTextBackend::chunks(["# T", "itle\n", "Body"]));
        let mut rx = writer.subscribe();
        let session = writer.begin(request("x"));
        rx.borrow_and_update();

        let observer = tokio::spawn(async move {
            let mut seen = Vec::new();
            while rx.changed().await.is_ok() {
                let state = rx.borrow_and_update().clone();
                let done = !state.is_generating;
                seen.push(state);
                if done {
                    break;
                }
            }
            seen
        });
        session.run().await.unwrap();
        let seen = observer.await.unwrap();

        let last = seen.last().unwrap();
        assert_eq!(
            last.elements.elements(),
            &[StoryElement::title("Title"), StoryElement::paragraph("Body")]
        );
        assert!(seen[..seen.len() - 1].iter().all(|s| s.is_generating));
    }

    #[tokio::test]
    async fn test_first_chunk_error_envelope() {
        let writer = writer(MockTextBackend::chunks([r#"{"message":"Writing is not available now."}"#]));
        writer.begin(request("x")).run().await.unwrap();

        let state = writer.state();
        assert_eq!(state.error.as_deref(), Some("Writing is not available now."));
        assert!(!state.is_generating);
        // The raw chunk is kept as content.
        assert_eq!(state.content, r#"{"message":"Writing is not available now."}"#);
    }

    #[tokio::test]
    async fn test_error_envelope_cleared_by_later_text() {
        let writer = writer(MockTextBackend::chunks([r#"{"message":"odd"}"#, "\nActual story."]));
        writer.begin(request("x")).run().await.unwrap();
        let state = writer.state();
        assert!(state.error.is_none());
        assert!(state.content.ends_with("Actual story."));
    }

    #[tokio::test]
    async fn test_json_without_message_is_text() {
        let writer = writer(MockTextBackend::chunks([r#"{"mood":"happy"}"#]));
        writer.begin(request("x")).run().await.unwrap();
        let state = writer.state();
        assert!(state.error.is_none());
        assert_eq!(state.elements.len(), 1);
    }

    #[tokio::test]
    async fn test_non_success_status() {
        let writer = writer(MockTextBackend::status(429, "Too many requests."));
        writer.begin(request("x")).run().await.unwrap();
        let state = writer.state();
        assert_eq!(state.error.as_deref(), Some("Too many requests."));
        assert!(!state.is_generating);
        assert!(state.content.is_empty());
    }

    #[tokio::test]
    async fn test_network_failure_before_first_chunk() {
        let writer = writer(MockTextBackend::new(vec![MockReply::Refused(
            "connection refused".into(),
        )]));
        writer.begin(request("x")).run().await.unwrap();
        let state = writer.state();
        assert_eq!(state.error.as_deref(), Some("connection refused"));
        assert!(!state.is_generating);
        assert!(state.content.is_empty());
    }

    #[tokio::test]
    async fn test_mid_stream_failure_keeps_content() {
        let writer = writer(MockTextBackend::new(vec![MockReply::Stream(vec![
            MockChunk::text("# Title\nPart one."),
            MockChunk::Fail("connection reset".into()),
        ])]));
        writer.begin(request("x")).run().await.unwrap();
        let state = writer.state();
        assert_eq!(state.error.as_deref(), Some("connection reset"));
        assert!(!state.is_generating);
        assert_eq!(state.content, "# Title\nPart one.");
    }

    #[tokio::test]
    async fn test_split_utf8_sequence() {
        let bytes = "日本".as_bytes();
        let writer = writer(MockTextBackend::new(vec![MockReply::Stream(vec![
            MockChunk::Data(bytes[..2].to_vec()),
            MockChunk::Data(bytes[2..].to_vec()),
        ])]));
        writer.begin(request("x")).run().await.unwrap();
        assert_eq!(writer.state().content, "日本");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_session_never_publishes() {
        let backend = MockTextBackend::new(vec![
            MockReply::Stream(vec![
                MockChunk::text("old start"),
                MockChunk::Delay(Duration::from_secs(5)),
                MockChunk::text(" old late chunk"),
            ]),
            MockReply::Stream(vec![MockChunk::text("new story")]),
        ]);
        let writer = writer(backend);

        let old = writer.begin(request("old"));
        let old_task = tokio::spawn(old.run());
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(writer.state().content, "old start");

        writer.begin(request("new")).run().await.unwrap();
        assert_eq!(writer.state().content, "new story");

        let result = old_task.await.unwrap();
        assert!(matches!(result, Err(StoryError::Superseded)));
        let state = writer.state();
        assert_eq!(state.content, "new story");
        assert!(!state.is_generating);
        assert_eq!(state.request.map(|r| r.prompt), Some("new".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_supersedes_previous() {
        let backend = MockTextBackend::new(vec![
            MockReply::Stream(vec![MockChunk::text("old"), MockChunk::Hang]),
            MockReply::Stream(vec![
                MockChunk::Delay(Duration::from_millis(10)),
                MockChunk::text("new"),
            ]),
        ]);
        let writer = writer(backend);
        let mut rx = writer.subscribe();

        let first = writer.submit(request("old"));
        tokio::time::sleep(Duration::from_millis(1)).await;
        let second = writer.submit(request("new"));
        assert_eq!(second, first + 1);

        loop {
            rx.changed().await.unwrap();
            let state = rx.borrow_and_update().clone();
            assert_eq!(state.session, second);
            assert_ne!(state.content, "old");
            if !state.is_generating {
                assert_eq!(state.content, "new");
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_events_emitted() {
        let recorder = Arc::new(Recorder::default());
        let writer = writer(MockTextBackend::chunks(["a", "b"]))
            .with_event_handler(Arc::clone(&recorder) as Arc<dyn EventHandler>);
        let session = writer.begin(request("y"));
        let id = session.id();
        session.run().await.unwrap();

        let events = recorder.events();
        assert_eq!(
            events.first(),
            Some(&Event::SessionStart {
                session: id,
                model: "gpt-3.5-turbo".into(),
                prompt: "y".into()
            })
        );
        let chunks = events
            .iter()
            .filter(|e| matches!(e, Event::Chunk { .. }))
            .count();
        assert_eq!(chunks, 2);
        assert_eq!(
            events.last(),
            Some(&Event::SessionEnd {
                session: id,
                error: None
            })
        );
    }

    #[test]
    fn test_error_envelope_detection() {
        assert_eq!(error_envelope(r#" {"message":"nope"} "#), Some("nope".to_string()));
        assert_eq!(error_envelope(r#"{"message":"nope""#), None);
        assert_eq!(error_envelope("# Title"), None);
        assert_eq!(error_envelope(r#"{not json}"#), None);
    }
}
