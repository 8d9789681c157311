//! Scripted backends for testing without live collaborators.
//!
//! [`MockTextBackend`] and [`MockImageBackend`] replay pre-configured
//! [`MockReply`]s in order, so sessions and the image orchestrator can be
//! tested deterministically (including under paused tokio time).
//!
//! # Example
//!
//! ```
//! use story_pipeline::backend::MockTextBackend;
//!
//! let mock = MockTextBackend::chunks(["# Title\n", "Once upon a time."]);
//! assert_eq!(mock.calls(), 0);
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use futures::StreamExt;

use super::{ChunkStream, ImageBackend, ImageRequest, StoryRequest, TextBackend};
use crate::error::Result;
use crate::StoryError;

/// One step of a scripted response body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockChunk {
    /// Deliver these bytes as one chunk.
    Data(Vec<u8>),
    /// Wait before the next step (honours paused tokio time).
    Delay(Duration),
    /// Break the connection with this message.
    Fail(String),
    /// Keep the connection open forever.
    Hang,
}

impl MockChunk {
    pub fn text(text: impl Into<String>) -> Self {
        MockChunk::Data(text.into().into_bytes())
    }
}

/// How a scripted backend answers one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockReply {
    /// A successful response whose body follows the script.
    Stream(Vec<MockChunk>),
    /// A non-success status with a body.
    Status { status: u16, body: String },
    /// The connection could not be opened.
    Refused(String),
}

impl MockReply {
    fn open(&self) -> Result<ChunkStream> {
        match self {
            MockReply::Stream(chunks) => Ok(script_stream(chunks.clone())),
            MockReply::Status { status, body } => Err(StoryError::HttpError {
                status: *status,
                body: body.clone(),
                retry_after: None,
            }),
            MockReply::Refused(message) => Err(StoryError::Other(message.clone())),
        }
    }
}

fn script_stream(chunks: Vec<MockChunk>) -> ChunkStream {
    stream::unfold(chunks.into_iter(), |mut rest| async move {
        loop {
            match rest.next()? {
                MockChunk::Data(bytes) => return Some((Ok(bytes), rest)),
                MockChunk::Delay(delay) => tokio::time::sleep(delay).await,
                MockChunk::Fail(message) => {
                    return Some((Err(StoryError::Other(message)), Vec::new().into_iter()))
                }
                MockChunk::Hang => futures::future::pending::<()>().await,
            }
        }
    })
    .boxed()
}

/// Replies in order, cycling back to the beginning when exhausted.
#[derive(Debug)]
struct Script {
    replies: Vec<MockReply>,
    index: AtomicUsize,
}

impl Script {
    fn new(replies: Vec<MockReply>) -> Self {
        assert!(!replies.is_empty(), "mock backends require at least one reply");
        Self {
            replies,
            index: AtomicUsize::new(0),
        }
    }

    fn next(&self) -> &MockReply {
        let idx = self.index.fetch_add(1, Ordering::Relaxed) % self.replies.len();
        &self.replies[idx]
    }

    fn calls(&self) -> usize {
        self.index.load(Ordering::Relaxed)
    }
}

/// A text backend that replays scripted replies.
#[derive(Debug)]
pub struct MockTextBackend {
    script: Script,
    requests: Mutex<Vec<StoryRequest>>,
}

impl MockTextBackend {
    pub fn new(replies: Vec<MockReply>) -> Self {
        Self {
            script: Script::new(replies),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Always stream these chunks, with no delay between them.
    pub fn chunks<I, S>(chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(vec![MockReply::Stream(
            chunks.into_iter().map(MockChunk::text).collect(),
        )])
    }

    /// Always answer with a non-success status.
    pub fn status(status: u16, body: impl Into<String>) -> Self {
        Self::new(vec![MockReply::Status {
            status,
            body: body.into(),
        }])
    }

    /// Number of calls made so far.
    pub fn calls(&self) -> usize {
        self.script.calls()
    }

    /// Every request received, in order.
    pub fn requests(&self) -> Vec<StoryRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl TextBackend for MockTextBackend {
    async fn stream_story(&self, request: &StoryRequest) -> Result<ChunkStream> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        self.script.next().open()
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

/// An image backend that replays scripted replies.
#[derive(Debug)]
pub struct MockImageBackend {
    script: Script,
    requests: Mutex<Vec<ImageRequest>>,
}

impl MockImageBackend {
    pub fn new(replies: Vec<MockReply>) -> Self {
        Self {
            script: Script::new(replies),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Always stream these steps.
    pub fn script(chunks: Vec<MockChunk>) -> Self {
        Self::new(vec![MockReply::Stream(chunks)])
    }

    /// Number of calls made so far.
    pub fn calls(&self) -> usize {
        self.script.calls()
    }

    /// Every request received, in order.
    pub fn requests(&self) -> Vec<ImageRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ImageBackend for MockImageBackend {
    async fn generate_images(&self, request: &ImageRequest) -> Result<ChunkStream> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        self.script.next().open()
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn collect(stream: ChunkStream) -> Vec<std::result::Result<String, String>> {
        stream
            .map(|item| {
                item.map(|b| String::from_utf8_lossy(&b).into_owned())
                    .map_err(|e| e.to_string())
            })
            .collect()
            .await
    }

    #[tokio::test]
    async fn test_mock_text_chunks() {
        let mock = MockTextBackend::chunks(["Once ", "upon"]);
        let request = StoryRequest::new("gpt-4", "x");
        let stream = mock.stream_story(&request).await.unwrap();
        assert_eq!(
            collect(stream).await,
            vec![Ok("Once ".to_string()), Ok("upon".to_string())]
        );
        assert_eq!(mock.calls(), 1);
        assert_eq!(mock.requests(), vec![request]);
    }

    #[tokio::test]
    async fn test_mock_status_error() {
        let mock = MockTextBackend::status(403, "Writing is not available now.");
        let result = mock.stream_story(&StoryRequest::new("gpt-4", "x")).await;
        match result {
            Err(StoryError::HttpError { status, body, .. }) => {
                assert_eq!(status, 403);
                assert_eq!(body, "Writing is not available now.");
            }
            _ => panic!("expected HttpError"),
        }
    }

    #[tokio::test]
    async fn test_mock_cycles_replies() {
        let mock = MockImageBackend::new(vec![
            MockReply::Refused("down".into()),
            MockReply::Stream(vec![MockChunk::text("data: {}")]),
        ]);
        let request = ImageRequest {
            model: "m".into(),
            prompts: vec!["a".into()],
        };
        assert!(mock.generate_images(&request).await.is_err());
        assert!(mock.generate_images(&request).await.is_ok());
        assert!(mock.generate_images(&request).await.is_err());
        assert_eq!(mock.requests().len(), 3);
    }

    #[tokio::test]
    async fn test_mock_fail_ends_stream() {
        let mock = MockTextBackend::new(vec![MockReply::Stream(vec![
            MockChunk::text("a"),
            MockChunk::Fail("reset".into()),
            MockChunk::text("never"),
        ])]);
        let stream = mock
            .stream_story(&StoryRequest::new("gpt-4", "x"))
            .await
            .unwrap();
        assert_eq!(collect(stream).await, vec![Ok("a".to_string()), Err("reset".to_string())]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mock_delay_uses_tokio_time() {
        let mock = MockTextBackend::new(vec![MockReply::Stream(vec![
            MockChunk::Delay(Duration::from_secs(30)),
            MockChunk::text("late"),
        ])]);
        let start = tokio::time::Instant::now();
        let stream = mock
            .stream_story(&StoryRequest::new("gpt-4", "x"))
            .await
            .unwrap();
        assert_eq!(collect(stream).await, vec![Ok("late".to_string())]);
        assert!(start.elapsed() >= Duration::from_secs(30));
    }
}
