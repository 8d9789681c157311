//! SSE (Server-Sent Events) decoder for OpenAI-compatible chat streams.
//!
//! Handles the `data: ` prefix, `[DONE]` termination, line buffering across
//! TCP chunk boundaries, and empty keep-alive lines.

use serde_json::Value;

use crate::streaming::Utf8Carry;

/// One decoded SSE payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    /// A non-empty `choices[0].delta.content` fragment.
    Delta(String),
    /// An in-band `{"error": {"message": ...}}` payload.
    Error(String),
    /// The `[DONE]` terminator.
    Done,
}

/// Line-buffered SSE decoder.
///
/// # Example
///
/// ```
/// use story_pipeline::backend::sse::{SseDecoder, SseEvent};
///
/// let mut decoder = SseDecoder::new();
/// let data = b"data: {\"choices\":[{\"delta\":{\"content\":\"Hello\"}}]}\n\ndata: [DONE]\n\n";
/// let events = decoder.decode(data);
/// assert_eq!(events, vec![SseEvent::Delta("Hello".into()), SseEvent::Done]);
/// ```
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: String,
    utf8: Utf8Carry,
}

impl SseDecoder {
    /// Create a new empty SSE decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes and return the events of every complete line.
    pub fn decode(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.push_str(&self.utf8.push(chunk));

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            if let Some(event) = Self::decode_line(&line) {
                events.push(event);
            }
        }
        events
    }

    /// Decode whatever is left once the stream ends.
    pub fn flush(&mut self) -> Option<SseEvent> {
        let mut remaining = std::mem::take(&mut self.buffer);
        if let Some(tail) = self.utf8.finish() {
            remaining.push_str(&tail);
        }
        Self::decode_line(&remaining)
    }

    fn decode_line(line: &str) -> Option<SseEvent> {
        let line = line.trim();
        let data = line
            .strip_prefix("data: ")
            .or_else(|| line.strip_prefix("data:"))?
            .trim();

        if data == "[DONE]" {
            return Some(SseEvent::Done);
        }

        let value: Value = serde_json::from_str(data).ok()?;
        if let Some(message) = value
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(Value::as_str)
        {
            return Some(SseEvent::Error(message.to_string()));
        }
        value
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("delta"))
            .and_then(|d| d.get("content"))
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
            .map(|t| SseEvent::Delta(t.to_string()))
    }
}
