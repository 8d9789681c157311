//! Document reassembly.
//!
//! Turns an element sequence back into the canonical markdown-ish text,
//! folding in image URLs that arrived after the text was parsed.

use crate::story::StoryElement;
use std::collections::HashMap;

/// Serialize elements to story text.
///
/// Image URLs prefer a freshly generated URL (matched by prompt) over the
/// element's own URL, and fall back to an empty string. The result is
/// trimmed of trailing whitespace.
///
/// # Example
///
/// ```
/// use std::collections::HashMap;
/// use story_pipeline::reassembly::serialize;
/// use story_pipeline::StoryElement;
///
/// let elements = vec![
///     StoryElement::title("Moon"),
///     StoryElement::image("a red moon", None),
/// ];
/// let generated = HashMap::from([("a red moon".to_string(), "https://cdn/m.jpg".to_string())]);
/// assert_eq!(serialize(&elements, &generated), "# Moon\n\n![a red moon](https://cdn/m.jpg)");
/// ```
pub fn serialize(elements: &[StoryElement], generated: &HashMap<String, String>) -> String {
    let mut content = String::new();
    for element in elements {
        match element {
            StoryElement::Title { text } => {
                content.push_str("# ");
                content.push_str(text);
                content.push_str("\n\n");
            }
            StoryElement::Paragraph { text } => {
                content.push_str(text);
                content.push_str("\n\n");
            }
            StoryElement::Image { prompt, url } => {
                let target = generated
                    .get(prompt)
                    .map(String::as_str)
                    .or(url.as_deref())
                    .unwrap_or("");
                content.push_str(&format!("![{}]({})\n\n", prompt, target));
            }
        }
    }
    content.trim_end().to_string()
}

/// Return a copy of `elements` with generated URLs filled into image elements.
///
/// Every element sharing a prompt receives the same URL.
pub fn merge_generated(
    elements: &[StoryElement],
    generated: &HashMap<String, String>,
) -> Vec<StoryElement> {
    elements
        .iter()
        .map(|element| match element {
            StoryElement::Image { prompt, url } => StoryElement::Image {
                prompt: prompt.clone(),
                url: generated.get(prompt).cloned().or_else(|| url.clone()),
            },
            StoryElement::Title { .. } | StoryElement::Paragraph { .. } => element.clone(),
        })
        .collect()
}

/// Text of the first title element, if any.
pub fn resolve_title(elements: &[StoryElement]) -> Option<&str> {
    elements.iter().find_map(|element| match element {
        StoryElement::Title { text } => Some(text.as_str()),
        StoryElement::Paragraph { .. } | StoryElement::Image { .. } => None,
    })
}

/// Elements worth sharing: images that never got a URL are dropped.
pub fn shareable(elements: &[StoryElement]) -> Vec<StoryElement> {
    elements
        .iter()
        .filter(|element| match element {
            StoryElement::Image { url, .. } => url.as_deref().is_some_and(|u| !u.is_empty()),
            StoryElement::Title { .. } | StoryElement::Paragraph { .. } => true,
        })
        .cloned()
        .collect()
}

/// URL of the first image that has one; used as the shared story's cover.
pub fn cover(elements: &[StoryElement]) -> Option<&str> {
    elements.iter().find_map(|element| match element {
        StoryElement::Image { url: Some(url), .. } if !url.is_empty() => Some(url.as_str()),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;

    const CDN: &str = "https://cdn.test/";

    fn sample() -> Vec<StoryElement> {
        vec![
            StoryElement::title("The Red Moon"),
            StoryElement::paragraph("Once upon a time."),
            StoryElement::image("a red moon", None),
            StoryElement::paragraph("The end."),
            StoryElement::image("a bird", Some("https://cdn.test/bird.jpg".into())),
        ]
    }

    #[test]
    fn test_serialize_empty() {
        assert_eq!(serialize(&[], &HashMap::new()), "");
    }

    #[test]
    fn test_serialize_layout() {
        let text = serialize(&sample(), &HashMap::new());
        assert_eq!(
            text,
            "# The Red Moon\n\nOnce upon a time.\n\n![a red moon]()\n\nThe end.\n\n![a bird](https://cdn.test/bird.jpg)"
        );
    }

    #[test]
    fn test_serialize_prefers_generated_url() {
        let generated = HashMap::from([
            ("a bird".to_string(), "https://cdn.test/new-bird.jpg".to_string()),
            ("a red moon".to_string(), "https://cdn.test/moon.jpg".to_string()),
        ]);
        let text = serialize(&sample(), &generated);
        assert!(text.contains("![a red moon](https://cdn.test/moon.jpg)"));
        assert!(text.contains("![a bird](https://cdn.test/new-bird.jpg)"));
    }

    #[test]
    fn test_round_trip() {
        let elements = sample();
        let text = serialize(&elements, &HashMap::new());
        assert_eq!(parse(&text, CDN).elements(), elements.as_slice());
    }

    #[test]
    fn test_round_trip_from_raw_text() {
        let raw = "# Title\nA line.\n  Another line.  \n![a moon]()   tail\n";
        let first = parse(raw, CDN);
        let again = parse(&serialize(&first, &HashMap::new()), CDN);
        assert_eq!(first, again);
    }

    #[test]
    fn test_merge_generated_updates_all_sharing_prompt() {
        let elements = vec![
            StoryElement::image("moon", None),
            StoryElement::paragraph("x"),
            StoryElement::image("moon", None),
        ];
        let generated = HashMap::from([("moon".to_string(), "https://cdn.test/m.jpg".to_string())]);
        let merged = merge_generated(&elements, &generated);
        assert_eq!(merged[0], StoryElement::image("moon", Some("https://cdn.test/m.jpg".into())));
        assert_eq!(merged[2], StoryElement::image("moon", Some("https://cdn.test/m.jpg".into())));
        assert_eq!(merged[1], StoryElement::paragraph("x"));
    }

    #[test]
    fn test_resolve_title() {
        assert_eq!(resolve_title(&sample()), Some("The Red Moon"));
        assert_eq!(resolve_title(&[StoryElement::paragraph("no title")]), None);
    }

    #[test]
    fn test_shareable_and_cover() {
        let elements = sample();
        let kept = shareable(&elements);
        assert_eq!(kept.len(), 4);
        assert!(!kept.contains(&StoryElement::image("a red moon", None)));
        assert_eq!(cover(&kept), Some("https://cdn.test/bird.jpg"));
        assert_eq!(cover(&[StoryElement::paragraph("p")]), None);
    }
}
