//! Chunk reassembly for the image generation event stream.
//!
//! The image collaborator answers with one JSON record per finished prompt,
//! usually prefixed with `data: ` and followed by a blank line. Network reads
//! do not respect record boundaries: one record may span several chunks, and
//! one chunk may carry several records. [`ImageEventDecoder`] turns raw
//! chunks back into [`DecodedItem`]s.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::LazyLock;

/// Per-record marker emitted by the image collaborator.
pub const EVENT_PREFIX: &str = "data: ";

static PROMPT_FIELD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""prompt"\s*:\s*"((?:[^"\\]|\\.)*)""#).expect("Valid prompt field regex")
});

/// One image result record: `{ok, prompt?, url?, message?}`.
///
/// Every field is optional on the wire; the collaborator omits `ok` on
/// success and `prompt` on request-wide failures.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ok: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ImageEvent {
    /// Build an event from any JSON object, ignoring fields of the wrong type.
    pub fn from_value(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        let text = |key: &str| obj.get(key).and_then(Value::as_str).map(str::to_string);
        Some(Self {
            ok: obj.get("ok").and_then(Value::as_bool),
            prompt: text("prompt"),
            url: text("url"),
            message: text("message"),
        })
    }

    /// The generated URL, if this record reports a success.
    ///
    /// A record counts as a success when it carries a non-empty URL and is
    /// not explicitly marked `ok: false`.
    pub fn success_url(&self) -> Option<&str> {
        if self.ok == Some(false) {
            return None;
        }
        self.url.as_deref().filter(|u| !u.is_empty())
    }
}

/// Output of [`ImageEventDecoder::decode`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedItem {
    /// A complete result record (success or per-prompt failure).
    Result(ImageEvent),
    /// A bare payload outside the record framing: the collaborator rejected
    /// the named prompt, or the whole request when no prompt is named.
    Rejected { event: ImageEvent, raw: String },
    /// A presumed-complete record that is not valid JSON. `prompt` is
    /// recovered from the raw text when possible.
    Malformed { raw: String, prompt: Option<String> },
}

impl DecodedItem {
    /// The prompt this item applies to, or `None` for "every outstanding prompt".
    pub fn prompt(&self) -> Option<&str> {
        match self {
            DecodedItem::Result(event) | DecodedItem::Rejected { event, .. } => {
                event.prompt.as_deref()
            }
            DecodedItem::Malformed { prompt, .. } => prompt.as_deref(),
        }
    }
}

/// Buffered decoder for the image event stream.
///
/// Classification of each record follows the collaborator's framing:
///
/// - `data: {...}` is a complete record;
/// - `data: {...` opens a partial record, which later chunks extend until
///   its first JSON value closes;
/// - a bare `{...}` without the marker is read the same way. A success
///   is a result; anything else is a rejection of the named prompt, or of
///   the whole request when no prompt is named;
/// - anything else outside a partial record is treated as a rejection whose
///   message is the raw text.
///
/// Text after a closed record is decoded on its own, and a marker cut off
/// at the end of a read is held back until the next chunk.
///
/// # Example
///
/// ```
/// use story_pipeline::streaming::{DecodedItem, ImageEventDecoder};
///
/// let mut decoder = ImageEventDecoder::new();
/// assert!(decoder.decode(b"data: {\"prompt\":\"a moon\",").is_empty());
///
/// let items = decoder.decode(b"\"url\":\"https://cdn/m.jpg\"}\n\n");
/// match &items[0] {
///     DecodedItem::Result(event) => assert_eq!(event.success_url(), Some("https://cdn/m.jpg")),
///     other => panic!("unexpected {:?}", other),
/// }
/// ```
#[derive(Debug, Default)]
pub struct ImageEventDecoder {
    pending: Option<Partial>,
    /// Start of a `data: ` marker cut off by the end of the last read.
    marker: String,
    utf8: Utf8Carry,
}

#[derive(Debug)]
struct Partial {
    text: String,
    /// Opened by a `data: ` marker.
    framed: bool,
}

enum Parsed {
    Complete(Value, usize),
    Open,
    Broken,
}

impl ImageEventDecoder {
    /// Create a new empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a partial record is buffered.
    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Feed one raw chunk and return every item it completes.
    pub fn decode(&mut self, chunk: &[u8]) -> Vec<DecodedItem> {
        let mut text = std::mem::take(&mut self.marker);
        text.push_str(&self.utf8.push(chunk));
        let mut items = Vec::new();
        self.decode_text(&text, &mut items);
        items
    }

    /// Flush a partial record left over when the stream ends.
    pub fn flush(&mut self) -> Option<DecodedItem> {
        let tail = self.utf8.finish();
        if let (Some(partial), Some(tail)) = (self.pending.as_mut(), tail) {
            partial.text.push_str(&tail);
        }
        let marker = std::mem::take(&mut self.marker);
        match self.abandon() {
            Some(item) => Some(item),
            None if !marker.trim().is_empty() => Some(malformed(marker.trim().to_string())),
            None => None,
        }
    }

    /// Drop the partial record, reporting it as malformed.
    fn abandon(&mut self) -> Option<DecodedItem> {
        let partial = self.pending.take()?;
        let raw = partial.text.trim();
        if raw.is_empty() {
            return None;
        }
        Some(malformed(raw.to_string()))
    }

    fn decode_text(&mut self, text: &str, items: &mut Vec<DecodedItem>) {
        for segment in split_records(text) {
            self.decode_segment(segment, items);
        }
    }

    fn decode_segment(&mut self, segment: &str, items: &mut Vec<DecodedItem>) {
        let trimmed = segment.trim();

        if let Some(body) = trimmed.strip_prefix(EVENT_PREFIX) {
            // A new record starts; an unfinished one can no longer complete.
            if let Some(stale) = self.abandon() {
                items.push(stale);
            }
            let body = body.trim_start();
            if body.starts_with('{') {
                self.open(body, true, items);
            } else {
                items.push(malformed(body.to_string()));
            }
            return;
        }

        if self.pending.is_some() {
            self.extend(segment, items);
            return;
        }

        if trimmed.is_empty() {
            return;
        }

        if trimmed.starts_with('{') {
            self.open(trimmed, false, items);
        } else if EVENT_PREFIX.trim_end().starts_with(trimmed) {
            self.marker = segment.trim_start().to_string();
        } else {
            items.push(DecodedItem::Rejected {
                event: ImageEvent::default(),
                raw: trimmed.to_string(),
            });
        }
    }

    fn open(&mut self, text: &str, framed: bool, items: &mut Vec<DecodedItem>) {
        self.pending = Some(Partial {
            text: String::new(),
            framed,
        });
        self.extend(text, items);
    }

    /// Append `text` to the partial record and emit it once its first JSON
    /// value closes. Whatever follows that value is decoded again.
    fn extend(&mut self, text: &str, items: &mut Vec<DecodedItem>) {
        let Some(partial) = self.pending.as_mut() else {
            return;
        };
        partial.text.push_str(text);

        let parsed = {
            let mut values = serde_json::Deserializer::from_str(&partial.text).into_iter::<Value>();
            match values.next() {
                Some(Ok(value)) => Parsed::Complete(value, values.byte_offset()),
                Some(Err(e)) if e.is_eof() => Parsed::Open,
                // Only give up once the record claims to be closed.
                Some(Err(_)) if partial.text.trim_end().ends_with('}') => Parsed::Broken,
                Some(Err(_)) | None => Parsed::Open,
            }
        };

        match parsed {
            Parsed::Open => {}
            Parsed::Broken => {
                if let Some(item) = self.abandon() {
                    items.push(item);
                }
            }
            Parsed::Complete(value, end) => {
                let Some(partial) = self.pending.take() else {
                    return;
                };
                let raw = partial.text[..end].trim().to_string();
                items.push(if partial.framed {
                    match ImageEvent::from_value(&value) {
                        Some(event) => DecodedItem::Result(event),
                        None => malformed(raw),
                    }
                } else {
                    classify_bare(&value, raw)
                });
                let rest = &partial.text[end..];
                if !rest.trim().is_empty() {
                    self.decode_text(rest, items);
                }
            }
        }
    }
}

/// A bare object outside the record framing.
fn classify_bare(value: &Value, raw: String) -> DecodedItem {
    let event = ImageEvent::from_value(value).unwrap_or_default();
    if event.success_url().is_some() {
        DecodedItem::Result(event)
    } else {
        DecodedItem::Rejected { event, raw }
    }
}

/// Decodes UTF-8 across chunk boundaries.
#[derive(Debug, Default)]
pub(crate) struct Utf8Carry {
    pending: Vec<u8>,
}

impl Utf8Carry {
    /// Text decodable so far; an incomplete trailing sequence is held back.
    pub(crate) fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let valid = match std::str::from_utf8(&self.pending) {
            Ok(_) => self.pending.len(),
            Err(e) if e.error_len().is_none() => e.valid_up_to(),
            Err(_) => self.pending.len(),
        };
        let text = String::from_utf8_lossy(&self.pending[..valid]).into_owned();
        self.pending.drain(..valid);
        text
    }

    /// Whatever was held back, lossily decoded.
    pub(crate) fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Some(rest)
    }
}

/// Starts with `{` and ends with `}`.
pub fn likely_json(text: &str) -> bool {
    text.len() >= 2 && text.starts_with('{') && text.ends_with('}')
}

fn malformed(raw: String) -> DecodedItem {
    let prompt = infer_prompt(&raw);
    DecodedItem::Malformed { raw, prompt }
}

/// Recover the `"prompt"` field from text that failed to parse as JSON.
fn infer_prompt(raw: &str) -> Option<String> {
    let caps = PROMPT_FIELD.captures(raw)?;
    let escaped = caps.get(1)?.as_str();
    serde_json::from_str::<String>(&format!("\"{}\"", escaped)).ok()
}

/// Split a chunk where a `data: ` marker starts a new record.
///
/// A marker only counts as a boundary at the start of the chunk or right
/// after a closing `}`, so prompt text that happens to contain `data: ` is
/// left alone.
fn split_records(text: &str) -> Vec<&str> {
    let mut starts = vec![0];
    let mut search_from = 0;
    while let Some(offset) = text[search_from..].find(EVENT_PREFIX) {
        let pos = search_from + offset;
        if pos > 0 && text[..pos].trim_end().ends_with('}') {
            starts.push(pos);
        }
        search_from = pos + EVENT_PREFIX.len();
    }

    let mut segments = Vec::with_capacity(starts.len());
    for (i, &start) in starts.iter().enumerate() {
        let end = starts.get(i + 1).copied().unwrap_or(text.len());
        segments.push(&text[start..end]);
    }
    segments
}
