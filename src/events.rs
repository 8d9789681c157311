//! Lifecycle events for story sessions and image generation.
//!
//! Provides an optional, non-intrusive way to observe the pipeline. Sessions
//! emit events as text streams in; the image orchestrator emits events as
//! prompts start, succeed and fail. Implement [`EventHandler`] for logging,
//! progress tracking or persisting generated URLs.
//!
//! Published state (see [`StoryWriter::subscribe`](crate::StoryWriter::subscribe)
//! and [`ImageGenerator::subscribe`](crate::ImageGenerator::subscribe)) is the
//! primary interface; events are a side channel.

use std::sync::Arc;

/// Events emitted by sessions and the image orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A story session started and published its reset state.
    SessionStart {
        session: u64,
        model: String,
        prompt: String,
    },
    /// A text chunk was appended to the session buffer.
    Chunk { session: u64, chunk: String },
    /// A session finished. `error` is set when it ended in failure.
    SessionEnd {
        session: u64,
        error: Option<String>,
    },
    /// A batched image request was issued.
    ImageStart { request: u64, prompts: Vec<String> },
    /// A prompt received an allowed image URL.
    ImageGenerated { prompt: String, url: String },
    /// A prompt failed (error payload, timeout, transport failure).
    ImageFailed { prompt: String, message: String },
}

/// Handler for pipeline lifecycle events.
///
/// This is entirely optional -- sessions and the image orchestrator work
/// without an event handler.
///
/// # Example
///
/// ```
/// use story_pipeline::events::{Event, EventHandler};
///
/// struct PrintHandler;
///
/// impl EventHandler for PrintHandler {
///     fn on_event(&self, event: Event) {
///         match event {
///             Event::Chunk { chunk, .. } => print!("{}", chunk),
///             Event::ImageGenerated { prompt, url } => println!("[image] {} -> {}", prompt, url),
///             Event::ImageFailed { prompt, message } => println!("[image] {}: {}", prompt, message),
///             _ => {} // SessionStart, SessionEnd, ImageStart
///         }
///     }
/// }
/// ```
pub trait EventHandler: Send + Sync {
    /// Called for every emitted event.
    fn on_event(&self, event: Event);
}

/// Emit an event if a handler is present. No-op otherwise.
pub(crate) fn emit(handler: &Option<Arc<dyn EventHandler>>, event: Event) {
    if let Some(ref h) = handler {
        h.on_event(event);
    }
}

/// An [`EventHandler`] backed by a closure.
///
/// # Example
///
/// ```
/// use story_pipeline::events::{Event, FnEventHandler};
/// use std::sync::Arc;
///
/// let handler = Arc::new(FnEventHandler(|event: Event| {
///     if let Event::ImageGenerated { prompt, url } = event {
///         println!("{} -> {}", prompt, url);
///     }
/// }));
/// ```
pub struct FnEventHandler<F: Fn(Event) + Send + Sync>(pub F);

impl<F: Fn(Event) + Send + Sync> EventHandler for FnEventHandler<F> {
    fn on_event(&self, event: Event) {
        (self.0)(event);
    }
}


#[cfg(test)]
mod tests {
    use super::testing::Recorder;
    use super::*;

    #[test]
    fn test_emit_without_handler_is_noop() {
        emit(
            &None,
            Event::SessionEnd {
                session: 1,
                error: None,
            },
        );
    }

    #[test]
    fn test_fn_handler_receives_events() {
        let recorder = Arc::new(Recorder::default());
        let sink = Arc::clone(&recorder);
        let handler: Option<Arc<dyn EventHandler>> =
            Some(Arc::new(FnEventHandler(move |e: Event| sink.on_event(e))));
        emit(
            &handler,
            Event::ImageGenerated {
                prompt: "moon".into(),
                url: "https://cdn/m.jpg".into(),
            },
        );
        assert_eq!(
            recorder.events(),
            vec![Event::ImageGenerated {
                prompt: "moon".into(),
                url: "https://cdn/m.jpg".into()
            }]
        );
    }
}
