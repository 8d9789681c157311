//! Chat messages sent to the text model.

use serde::{Deserialize, Serialize};

/// Default cap on user prompt length, in characters.
pub const DEFAULT_MAX_INPUT_CHARS: usize = 200;

/// Fixed opener the assistant "asks" before the user's prompt.
pub const ASSISTANT_OPENER: &str = "What story do you want to generate?";

/// Instructions describing the story format the parser understands.
pub const SYSTEM_MESSAGE: &str = "\
You are a short illustrated story generator. Write a short story based on the message the user gives you.

Start with a markdown level-1 heading '# Title' holding the story's title.

Make the story more lively by inserting text-to-image prompts, at most 10 of them, using markdown image syntax: put the prompt in the alt text and always leave the URL empty.
Prompts must describe the picture objectively. Avoid vague or subjective words such as people's names or street names: 'John' becomes 'A tall man in a white T-shirt', 'Block Street' becomes 'A street lined with tall buildings'.
You may name an image style in a prompt, for example Painterly, Realistic, Monet or Monochrome.

Keep the story under 100 words, not counting image prompts.

Example:
![A space bird with blue feathers and red eyes flying over the moon.]()

Once upon a time, there was a space bird...
[Paragraph 2]
![The space bird flying towards the earth.]()

[Paragraph 3]";

/// The role of a chat message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A single message in a chat conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Build the three-message conversation for a story prompt.
///
/// The user prompt is cut to at most `max_input_chars` characters.
///
/// # Example
///
/// ```
/// use story_pipeline::prompt::{build_story_messages, Role};
///
/// let messages = build_story_messages("a cat who learns to fly", 200);
/// assert_eq!(messages.len(), 3);
/// assert_eq!(messages[0].role, Role::System);
/// assert_eq!(messages[2].content, "a cat who learns to fly");
/// ```
pub fn build_story_messages(prompt: &str, max_input_chars: usize) -> Vec<ChatMessage> {
    vec![
        ChatMessage::new(Role::System, SYSTEM_MESSAGE),
        ChatMessage::new(Role::Assistant, ASSISTANT_OPENER),
        ChatMessage::new(Role::User, truncate_chars(prompt, max_input_chars)),
    ]
}

/// First `max` characters of `text`, never splitting a code point.
pub fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
