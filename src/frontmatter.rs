//! Front matter extraction for source templates and data documents.
//!
//! A document may start with a YAML block fenced by `---` lines:
//!
//! ```text
//! ---
//! title: Home
//! tags: [intro]
//! ---
//! <h1>{{ title }}</h1>
//! ```
//!
//! The block becomes structured data (a JSON value so it can flow straight
//! into a template context) and the remainder is the body. A document
//! without a block, or with an empty one, has no data. That is never an
//! error.

use gray_matter::{Matter, engine::YAML};
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FrontMatterError {
    #[error("invalid front matter: {0}")]
    Invalid(#[from] gray_matter::Error),
}

/// A document split into its front matter and body.
#[derive(Debug, Clone, PartialEq)]
pub struct FrontMatter {
    /// Parsed front matter, `None` when the document has none.
    pub data: Option<Value>,
    /// Everything after the closing fence (the whole input when there is no block).
    pub body: String,
}

/// Split `content` into front matter and body.
pub fn parse(content: &str) -> Result<FrontMatter, FrontMatterError> {
    if !opens_with_fence(content) {
        return Ok(FrontMatter {
            data: None,
            body: content.to_string(),
        });
    }
    let matter = Matter::<YAML>::new();
    let parsed = matter.parse::<Value>(content)?;
    let data = parsed.data.filter(|value| !value.is_null());
    let mut body = parsed.content;
    // The line break ending the closing fence belongs to the fence.
    if let Some(rest) = body.strip_prefix("\r\n").or_else(|| body.strip_prefix('\n')) {
        body = rest.to_string();
    }
    Ok(FrontMatter { data, body })
}

/// Whether the first line is exactly a `---` fence.
fn opens_with_fence(content: &str) -> bool {
    content
        .lines()
        .next()
        .is_some_and(|line| line.trim_end() == "---")
}

/// Parse raw bytes, treating invalid UTF-8 as lossy text.
///
/// Data documents are not required to be valid UTF-8 to be enumerable, but
/// only their text is ever exposed.
pub fn parse_bytes(bytes: &[u8]) -> Result<FrontMatter, FrontMatterError> {
    parse(&String::from_utf8_lossy(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_front_matter_and_body() {
        let doc = parse("---\ntitle: Home\ncount: 3\n---\n{{ title }}\n").unwrap();
        let data = doc.data.unwrap();
        assert_eq!(data["title"], "Home");
        assert_eq!(data["count"], 3);
        assert!(doc.body.contains("{{ title }}"));
        assert!(!doc.body.contains("title: Home"));
    }

    #[test]
    fn no_front_matter_is_absent_not_error() {
        let doc = parse("just a body\n").unwrap();
        assert!(doc.data.is_none());
        assert!(doc.body.contains("just a body"));
    }

    #[test]
    fn short_documents_keep_their_body() {
        for text in ["i", "ab", "abc", "abcd", "--"] {
            let doc = parse(text).unwrap();
            assert!(doc.data.is_none(), "{text:?}");
            assert_eq!(doc.body, text);
        }
    }

    #[test]
    fn dashes_inside_first_line_are_not_a_fence() {
        let doc = parse("---- not front matter\ntext").unwrap();
        assert!(doc.data.is_none());
        assert_eq!(doc.body, "---- not front matter\ntext");
    }

    #[test]
    fn empty_document() {
        let doc = parse("").unwrap();
        assert!(doc.data.is_none());
        assert!(doc.body.is_empty());
    }

    #[test]
    fn nested_values_survive() {
        let doc = parse("---\nauthor:\n  name: Ada\n  tags: [a, b]\n---\nbody").unwrap();
        let data = doc.data.unwrap();
        assert_eq!(data["author"]["name"], "Ada");
        assert_eq!(data["author"]["tags"][1], "b");
    }

    #[test]
    fn body_starts_after_the_fence() {
        let doc = parse("---\ntitle: Home\n---\n{% extends \"base.html\" %}").unwrap();
        assert!(doc.body.starts_with("{% extends"));
    }

    #[test]
    fn bytes_are_parsed_lossily() {
        let doc = parse_bytes(b"---\ntitle: Bytes\n---\nok").unwrap();
        assert_eq!(doc.data.unwrap()["title"], "Bytes");
    }
}
