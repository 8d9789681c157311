//! Markdown-ish story parser.
//!
//! Only three constructs are recognized:
//!
//! 1. `# TEXT` at the start of a line is a title;
//! 2. `![PROMPT](URL)` anywhere is a prompted image;
//! 3. every other non-blank line is a paragraph.
//!
//! The parser is pure and total. It is re-run over the whole accumulated
//! buffer on every streamed chunk, so it must accept truncated input: a
//! dangling `![...` simply reads as paragraph text until it closes.

use crate::story::{StoryDocument, StoryElement};
use regex::Regex;
use std::sync::LazyLock;

/// `![ALT](URL)`, both groups non-greedy and confined to one line.
static IMAGE_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"!\[(.+?)\]\((.*?)\)").expect("Valid image token regex"));

/// Parse story text into a [`StoryDocument`].
///
/// An image URL is kept only when it is non-empty and starts with
/// `allowed_image_url_prefix`; otherwise the image has no URL. An empty
/// prefix therefore rejects every URL.
///
/// # Example
///
/// ```
/// use story_pipeline::parser::parse;
/// use story_pipeline::StoryElement;
///
/// let doc = parse("# Hello\nWorld", "https://cdn.test/");
/// assert_eq!(
///     doc.elements(),
///     &[StoryElement::title("Hello"), StoryElement::paragraph("World")]
/// );
/// ```
pub fn parse(text: &str, allowed_image_url_prefix: &str) -> StoryDocument {
    if text.is_empty() {
        return StoryDocument::default();
    }

    let mut elements = Vec::new();
    let mut prev_end = 0;

    for caps in IMAGE_TOKEN.captures_iter(text) {
        let Some(whole) = caps.get(0) else {
            continue;
        };
        if whole.start() > prev_end {
            push_text(&mut elements, text[prev_end..whole.start()].trim());
        }

        let prompt = caps.get(1).map_or("", |m| m.as_str());
        let url = caps.get(2).map_or("", |m| m.as_str());
        push_image(&mut elements, prompt, url, allowed_image_url_prefix);

        prev_end = whole.end();
    }

    if prev_end < text.len() {
        push_text(&mut elements, text[prev_end..].trim());
    }

    StoryDocument::new(elements)
}

/// Whether `url` may be attached to an image element.
pub fn is_allowed_image_url(url: &str, allowed_prefix: &str) -> bool {
    !url.is_empty() && !allowed_prefix.is_empty() && url.starts_with(allowed_prefix)
}

fn push_text(elements: &mut Vec<StoryElement>, span: &str) {
    for line in span.split('\n') {
        if let Some(title) = line.strip_prefix("# ") {
            let title = title.trim();
            if !title.is_empty() {
                elements.push(StoryElement::title(title));
            }
        } else {
            let paragraph = line.trim();
            if !paragraph.is_empty() {
                elements.push(StoryElement::paragraph(paragraph));
            }
        }
    }
}

fn push_image(elements: &mut Vec<StoryElement>, prompt: &str, url: &str, allowed_prefix: &str) {
    let prompt = prompt.trim();
    if prompt.is_empty() {
        return;
    }
    let url = is_allowed_image_url(url, allowed_prefix).then(|| url.to_string());
    elements.push(StoryElement::image(prompt, url));
}

#[cfg(test)]
mod tests {
    use super::*;

    const CDN: &str = "https://cdn.test/";

    #[test]
    fn test_empty_input() {
        assert!(parse("", CDN).is_empty());
    }

    #[test]
    fn test_whitespace_only() {
        assert!(parse("  \n\n \t \n", CDN).is_empty());
    }

    #[test]
    fn test_title_extraction() {
        let doc = parse("# Hello\nWorld", CDN);
        assert_eq!(
            doc.elements(),
            &[StoryElement::title("Hello"), StoryElement::paragraph("World")]
        );
    }

    #[test]
    fn test_empty_title_dropped() {
        let doc = parse("#    \nBody", CDN);
        assert_eq!(doc.elements(), &[StoryElement::paragraph("Body")]);
    }

    #[test]
    fn test_hash_without_space_is_paragraph() {
        let doc = parse("#hashtag", CDN);
        assert_eq!(doc.elements(), &[StoryElement::paragraph("#hashtag")]);
    }

    #[test]
    fn test_image_allowed_url() {
        let doc = parse("![a red bird](https://cdn.test/x.jpg)", CDN);
        assert_eq!(
            doc.elements(),
            &[StoryElement::image(
                "a red bird",
                Some("https://cdn.test/x.jpg".into())
            )]
        );
    }

    #[test]
    fn test_image_disallowed_url() {
        let doc = parse("![a red bird](https://cdn.test/x.jpg)", "https://other/");
        assert_eq!(doc.elements(), &[StoryElement::image("a red bird", None)]);
    }

    #[test]
    fn test_image_empty_url() {
        let doc = parse("![a red bird]()", CDN);
        assert_eq!(doc.elements(), &[StoryElement::image("a red bird", None)]);
    }

    #[test]
    fn test_image_blank_prompt_skipped() {
        let doc = parse("before ![   ](https://cdn.test/x.jpg) after", CDN);
        assert_eq!(
            doc.elements(),
            &[StoryElement::paragraph("before"), StoryElement::paragraph("after")]
        );
    }

    #[test]
    fn test_image_prompt_trimmed() {
        let doc = parse("![  a moon  ]()", CDN);
        assert_eq!(doc.elements(), &[StoryElement::image("a moon", None)]);
    }

    #[test]
    fn test_three_part_document() {
        let doc = parse(
            "Once upon a time in ...\n![An image of red moon]()\nThe end\n",
            CDN,
        );
        assert_eq!(
            doc.elements(),
            &[
                StoryElement::paragraph("Once upon a time in ..."),
                StoryElement::image("An image of red moon", None),
                StoryElement::paragraph("The end"),
            ]
        );
    }

    #[test]
    fn test_indented_lines() {
        let story = "Once upon a time in ...
        ![An image of red moon]()
        The end
        ";
        let doc = parse(story, CDN);
        assert_eq!(doc.len(), 3);
        assert_eq!(doc[0], StoryElement::paragraph("Once upon a time in ..."));
        assert_eq!(doc[1], StoryElement::image("An image of red moon", None));
        assert_eq!(doc[2], StoryElement::paragraph("The end"));
    }

    #[test]
    fn test_two_images_on_one_line() {
        let doc = parse("![sun]() and ![moon]()", CDN);
        assert_eq!(
            doc.elements(),
            &[
                StoryElement::image("sun", None),
                StoryElement::paragraph("and"),
                StoryElement::image("moon", None),
            ]
        );
    }

    #[test]
    fn test_title_after_image() {
        let doc = parse("![cover]()\n# The Title\nText", CDN);
        assert_eq!(
            doc.elements(),
            &[
                StoryElement::image("cover", None),
                StoryElement::title("The Title"),
                StoryElement::paragraph("Text"),
            ]
        );
    }

    #[test]
    fn test_dangling_image_token_is_paragraph() {
        let doc = parse("Story text\n![A moon over the s", CDN);
        assert_eq!(
            doc.elements(),
            &[
                StoryElement::paragraph("Story text"),
                StoryElement::paragraph("![A moon over the s"),
            ]
        );

        let doc = parse("Story text\n![A moon over the sea](", CDN);
        assert_eq!(doc[1], StoryElement::paragraph("![A moon over the sea]("));

        let doc = parse("Story text\n![A moon over the sea]()", CDN);
        assert_eq!(doc[1], StoryElement::image("A moon over the sea", None));
    }

    #[test]
    fn test_token_does_not_span_lines() {
        let doc = parse("![a\nb]()", CDN);
        assert_eq!(
            doc.elements(),
            &[StoryElement::paragraph("![a"), StoryElement::paragraph("b]()")]
        );
    }

    #[test]
    fn test_crlf_lines() {
        let doc = parse("# Title\r\nBody\r\n", CDN);
        assert_eq!(
            doc.elements(),
            &[StoryElement::title("Title"), StoryElement::paragraph("Body")]
        );
    }

    #[test]
    fn test_parse_is_deterministic() {
        let inputs = [
            "",
            "# T\n![x](https://cdn.test/a.png)\nbody",
            "![unterminated",
            "{\"message\":\"nope\"}",
            "ü ñ 日本 ![图片]()",
        ];
        for input in inputs {
            assert_eq!(parse(input, CDN), parse(input, CDN));
        }
    }

    #[test]
    fn test_malformed_inputs_do_not_panic() {
        let inputs = [
            "![", "![]", "![](", "![]()", "]()", "![a](b", "# ", "#", "\n\n\n", "![a](b)(c)",
            "![[x]](y)", "日本![語](",
        ];
        for input in inputs {
            let _ = parse(input, CDN);
        }
    }

    #[test]
    fn test_empty_prefix_rejects_urls() {
        let doc = parse("![x](https://cdn.test/a.png)", "");
        assert_eq!(doc.elements(), &[StoryElement::image("x", None)]);
    }

    #[test]
    fn test_is_allowed_image_url() {
        assert!(is_allowed_image_url("https://cdn.test/a.png", CDN));
        assert!(!is_allowed_image_url("https://evil/a.png", CDN));
        assert!(!is_allowed_image_url("", CDN));
        assert!(!is_allowed_image_url("https://cdn.test/a.png", ""));
    }
}
