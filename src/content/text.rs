//! Plain text extraction

use super::{collapse_whitespace, ContentExtractor, ExtractedContent};
use anyhow::Result;
use url::Url;

/// Plain text extractor; plain text carries no links
pub struct TextExtractor;

impl TextExtractor {
    /// Markdown header or first substantial line
    fn title(content: &str) -> Option<String> {
        for line in content.lines().take(10) {
            let trimmed = line.trim();
            if let Some(title) = trimmed.strip_prefix("# ") {
                if !title.trim().is_empty() {
                    return Some(title.trim().to_string());
                }
            }
            if trimmed.len() >= 10
                && trimmed.len() <= 200
                && !trimmed.starts_with('#')
                && !trimmed.starts_with("http")
            {
                return Some(trimmed.to_string());
            }
        }
        None
    }
}

impl ContentExtractor for TextExtractor {
    fn extract(&self, raw: &[u8], _base: &Url) -> Result<ExtractedContent> {
        let content = String::from_utf8_lossy(raw);
        if content.trim().is_empty() {
            anyhow::bail!("Empty text document");
        }
        Ok(ExtractedContent {
            title: Self::title(&content).unwrap_or_default(),
            description: String::new(),
            text: collapse_whitespace(&content),
            links: Vec::new(),
        })
    }
}
