//! Text backend for OpenAI-compatible chat APIs.
//!
//! [`OpenAiTextBackend`] talks to `/v1/chat/completions` directly instead of
//! going through a story endpoint: it builds the story conversation itself
//! (see [`build_story_messages`]) and turns the SSE deltas back into a plain
//! text chunk stream, so sessions cannot tell the two apart.

use std::collections::VecDeque;

use super::sse::{SseDecoder, SseEvent};
use super::{body_chunks, check_status, ChunkStream, StoryRequest, TextBackend};
use crate::config::StoryConfig;
use crate::error::Result;
use crate::prompt::{build_story_messages, DEFAULT_MAX_INPUT_CHARS};
use crate::StoryError;
use async_trait::async_trait;
use futures::stream;
use futures::StreamExt;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::{debug, instrument};

/// Default completion budget for one story.
pub const DEFAULT_MAX_TOKENS: u32 = 500;

/// Text backend for any OpenAI-compatible API.
///
/// # Example
///
/// ```
/// use story_pipeline::backend::OpenAiTextBackend;
///
/// let backend = OpenAiTextBackend::new(reqwest::Client::new(), "https://api.openai.com")
///     .with_api_key("sk-...")
///     .with_max_tokens(300);
/// assert!(backend.has_api_key());
/// ```
#[derive(Clone)]
pub struct OpenAiTextBackend {
    client: Client,
    base_url: String,
    /// Optional API key. If set, sent as `Authorization: Bearer {key}`.
    api_key: Option<String>,
    max_tokens: u32,
    max_input_chars: usize,
}

impl std::fmt::Debug for OpenAiTextBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiTextBackend")
            .field("base_url", &self.base_url)
            .field(
                "api_key",
                &self.api_key.as_ref().map(|k| {
                    if k.chars().count() > 6 {
                        format!("{}***", k.chars().take(6).collect::<String>())
                    } else {
                        "***".to_string()
                    }
                }),
            )
            .field("max_tokens", &self.max_tokens)
            .field("max_input_chars", &self.max_input_chars)
            .finish()
    }
}

impl OpenAiTextBackend {
    /// Create a backend without authentication.
    pub fn new(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: normalize_base_url(&base_url.into()),
            api_key: None,
            max_tokens: DEFAULT_MAX_TOKENS,
            max_input_chars: DEFAULT_MAX_INPUT_CHARS,
        }
    }

    /// Build from the text endpoint, API key and limits in `config`.
    pub fn from_config(config: &StoryConfig) -> Result<Self> {
        let base_url = config
            .text_endpoint
            .clone()
            .ok_or_else(|| StoryError::InvalidConfig("text endpoint is not set".into()))?;
        let mut backend = Self::new(config.http_client()?, base_url)
            .with_max_tokens(config.max_generate_tokens)
            .with_max_input_chars(config.max_input_chars);
        backend.api_key = config.api_key.clone();
        Ok(backend)
    }

    /// Set the API key for authentication.
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_max_input_chars(mut self, max_input_chars: usize) -> Self {
        self.max_input_chars = max_input_chars;
        self
    }

    /// Returns `true` if an API key has been configured.
    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    fn url(&self) -> String {
        format!("{}/v1/chat/completions", self.base_url)
    }

    fn build_body(&self, request: &StoryRequest) -> Value {
        json!({
            "model": request.model,
            "messages": build_story_messages(&request.prompt, self.max_input_chars),
            "max_tokens": self.max_tokens,
            "stream": true,
        })
    }

    fn build_http_request(&self, body: &Value) -> reqwest::RequestBuilder {
        let mut req = self.client.post(self.url()).json(body);
        if let Some(ref key) = self.api_key {
            req = req.header("Authorization", format!("Bearer {}", key));
        }
        req
    }
}

#[async_trait]
impl TextBackend for OpenAiTextBackend {
    #[instrument(skip_all, fields(model = %request.model))]
    async fn stream_story(&self, request: &StoryRequest) -> Result<ChunkStream> {
        let resp = self
            .build_http_request(&self.build_body(request))
            .send()
            .await?;
        let resp = check_status(resp).await?;
        debug!(status = resp.status().as_u16(), "chat stream opened");
        Ok(text_deltas(body_chunks(resp)))
    }

    fn name(&self) -> &'static str {
        "openai"
    }
}

/// Strip a trailing `/v1` or full endpoint path so it is not appended twice.
fn normalize_base_url(url: &str) -> String {
    let trimmed = url.trim_end_matches('/');
    for suffix in ["/v1/chat/completions", "/v1"] {
        if let Some(stripped) = trimmed.strip_suffix(suffix) {
            return stripped.to_string();
        }
    }
    trimmed.to_string()
}

struct DeltaState {
    body: ChunkStream,
    decoder: SseDecoder,
    ready: VecDeque<Result<Vec<u8>>>,
    finished: bool,
}

impl DeltaState {
    fn push(&mut self, events: impl IntoIterator<Item = SseEvent>) {
        for event in events {
            if self.finished {
                return;
            }
            match event {
                SseEvent::Delta(text) => self.ready.push_back(Ok(text.into_bytes())),
                SseEvent::Error(message) => {
                    self.ready.push_back(Err(StoryError::Other(message)));
                    self.finished = true;
                }
                SseEvent::Done => self.finished = true,
            }
        }
    }
}

/// Re-chunk an SSE body into the text deltas it carries.
fn text_deltas(body: ChunkStream) -> ChunkStream {
    let state = DeltaState {
        body,
        decoder: SseDecoder::new(),
        ready: VecDeque::new(),
        finished: false,
    };
    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.ready.pop_front() {
                return Some((item, state));
            }
            if state.finished {
                return None;
            }
            match state.body.next().await {
                Some(Ok(bytes)) => {
                    let events = state.decoder.decode(&bytes);
                    state.push(events);
                }
                Some(Err(e)) => {
                    state.ready.push_back(Err(e));
                    state.finished = true;
                }
                None => {
                    let tail = state.decoder.flush();
                    state.push(tail);
                    state.finished = true;
                }
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> OpenAiTextBackend {
        OpenAiTextBackend::new(Client::new(), "https://api.openai.com/")
    }

    fn body_of(chunks: &[&str]) -> ChunkStream {
        let items: Vec<Result<Vec<u8>>> = chunks.iter().map(|c| Ok(c.as_bytes().to_vec())).collect();
        stream::iter(items).boxed()
    }

    async fn collect(stream: ChunkStream) -> Vec<std::result::Result<String, String>> {
        stream
            .map(|item| {
                item.map(|b| String::from_utf8_lossy(&b).into_owned())
                    .map_err(|e| e.to_string())
            })
            .collect()
            .await
    }

    #[test]
    fn test_body_carries_story_conversation() {
        let body = backend()
            .with_max_tokens(321)
            .with_max_input_chars(5)
            .build_body(&StoryRequest::new("gpt-4", "a very long prompt"));
        assert_eq!(body["model"], "gpt-4");
        assert_eq!(body["stream"], true);
        assert_eq!(body["max_tokens"], 321);
        let messages = body["messages"].as_array().expect("messages");
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[1]["role"], "assistant");
        assert_eq!(messages[2]["content"], "a ver");
    }

    #[test]
    fn test_url_joins_base() {
        assert_eq!(backend().url(), "https://api.openai.com/v1/chat/completions");
    }

    #[test]
    fn test_normalize_base_url() {
        assert_eq!(normalize_base_url("https://api.openai.com/v1/"), "https://api.openai.com");
        assert_eq!(
            normalize_base_url("https://api.openai.com/v1/chat/completions"),
            "https://api.openai.com"
        );
        assert_eq!(normalize_base_url("http://localhost:8080"), "http://localhost:8080");
    }

    #[test]
    fn test_auth_header() {
        let backend = backend().with_api_key("sk-test123");
        let req = backend
            .build_http_request(&json!({}))
            .build()
            .expect("build request");
        let auth = req.headers().get("Authorization").expect("auth header");
        assert_eq!(auth, "Bearer sk-test123");
    }

    #[test]
    fn test_no_auth() {
        let req = backend()
            .build_http_request(&json!({}))
            .build()
            .expect("build request");
        assert!(req.headers().get("Authorization").is_none());
    }

    #[test]
    fn test_debug_redacts_api_key() {
        let debug_output = format!("{:?}", backend().with_api_key("sk-1234567890abcdef"));
        assert!(!debug_output.contains("1234567890abcdef"));
        assert!(debug_output.contains("sk-123***"));
    }

    #[test]
    fn test_debug_redacts_multibyte_api_key() {
        let debug_output = format!("{:?}", backend().with_api_key("ключ-1234567890"));
        assert!(debug_output.contains("ключ-1***"));
        assert!(!debug_output.contains("234567890"));
    }

    #[tokio::test]
    async fn test_text_deltas_rechunk_sse() {
        let body = body_of(&[
            "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\ndata: {\"choices\":[{\"delta\":{\"content\":\"# Ti\"}}]}\n",
            "\ndata: {\"choices\":[{\"delta\":{\"content\":\"tle\\n\"}}]}\n\ndata: [DONE]\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"ignored\"}}]}\n\n",
        ]);
        assert_eq!(
            collect(text_deltas(body)).await,
            vec![Ok("# Ti".to_string()), Ok("tle\n".to_string())]
        );
    }

    #[tokio::test]
    async fn test_text_deltas_surface_error_payload() {
        let body = body_of(&[
            "data: {\"choices\":[{\"delta\":{\"content\":\"Once\"}}]}\n\n",
            "data: {\"error\":{\"message\":\"overloaded\"}}\n\n",
        ]);
        assert_eq!(
            collect(text_deltas(body)).await,
            vec![Ok("Once".to_string()), Err("overloaded".to_string())]
        );
    }

    #[tokio::test]
    async fn test_text_deltas_flush_without_newline() {
        let body = body_of(&["data: {\"choices\":[{\"delta\":{\"content\":\"end\"}}]}"]);
        assert_eq!(collect(text_deltas(body)).await, vec![Ok("end".to_string())]);
    }
}
