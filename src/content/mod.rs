//! Content extraction
//!
//! Turns a fetched body into title, description, visible text and outgoing
//! links. Extractors are selected by content type through `extractor_for`.

mod html;
mod text;

pub use html::HtmlExtractor;
pub use text::TextExtractor;

use crate::types::OutLink;
use anyhow::Result;
use url::Url;

/// Text, metadata and links extracted from one document
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractedContent {
    pub title: String,
    pub description: String,
    /// Visible text, whitespace collapsed
    pub text: String,
    /// Absolute canonical links in document order, deduplicated
    pub links: Vec<OutLink>,
}

/// Capability shared by all content-type specific extractors
pub trait ContentExtractor: Send + Sync {
    fn extract(&self, raw: &[u8], base: &Url) -> Result<ExtractedContent>;
}

/// Supported content types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    Html,
    Text,
    Unknown,
}

impl ContentType {
    /// Detect content type from a Content-Type header value
    pub fn from_mime(mime: &str) -> Self {
        let mime = mime.to_lowercase();
        if mime.contains("text/html") || mime.contains("application/xhtml") {
            ContentType::Html
        } else if mime.contains("text/plain") {
            ContentType::Text
        } else {
            ContentType::Unknown
        }
    }

    /// Detect content type from the URL path when no header is present
    pub fn from_url(url: &Url) -> Self {
        let path = url.path().to_lowercase();
        if path.ends_with(".txt") || path.ends_with(".md") {
            ContentType::Text
        } else {
            // web pages without an extension are HTML
            ContentType::Html
        }
    }

    pub fn is_supported(&self) -> bool {
        !matches!(self, ContentType::Unknown)
    }
}

/// Pick the extractor for a content type
pub fn extractor_for(content_type: ContentType, max_links: usize) -> Option<Box<dyn ContentExtractor>> {
    match content_type {
        ContentType::Html => Some(Box::new(HtmlExtractor::new(max_links))),
        ContentType::Text => Some(Box::new(TextExtractor)),
        ContentType::Unknown => None,
    }
}

/// Collapse runs of whitespace into single spaces
pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Remove any markup left in a text fragment
pub fn strip_markup(text: &str) -> String {
    if !text.contains('<') {
        return collapse_whitespace(text);
    }
    let fragment = scraper::Html::parse_fragment(text);
    let pieces: Vec<&str> = fragment.root_element().text().collect();
    collapse_whitespace(&pieces.join(" "))
}
