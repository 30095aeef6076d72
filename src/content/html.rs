//! HTML extraction with scraper
//!
//! Visible text skips script, style and page chrome (nav, header, footer, aside).

use super::{collapse_whitespace, ContentExtractor, ExtractedContent};
use crate::crawl::{canonicalize_url, has_skipped_extension};
use crate::types::OutLink;
use anyhow::Result;
use scraper::{ElementRef, Html, Selector};
use std::collections::HashSet;
use url::Url;

/// Elements whose text is never part of the page body
const SKIPPED_TAGS: &[&str] = &[
    "script", "style", "noscript", "nav", "footer", "header", "aside", "template", "svg",
];

const MAX_ANCHOR_CHARS: usize = 200;

/// HTML extractor
pub struct HtmlExtractor {
    max_links: usize,
}

impl HtmlExtractor {
    pub fn new(max_links: usize) -> Self {
        Self { max_links }
    }

    fn title(document: &Html) -> String {
        if let Some(title) = Self::first_text(document, "title") {
            return title;
        }
        if let Some(title) = Self::meta_content(document, "og:title") {
            return title;
        }
        Self::first_text(document, "h1").unwrap_or_default()
    }

    fn description(document: &Html) -> String {
        Self::meta_content(document, "description")
            .or_else(|| Self::meta_content(document, "og:description"))
            .unwrap_or_default()
    }

    fn first_text(document: &Html, selector: &str) -> Option<String> {
        let selector = Selector::parse(selector).ok()?;
        document
            .select(&selector)
            .map(|el| collapse_whitespace(&el.text().collect::<Vec<_>>().join(" ")))
            .find(|t| !t.is_empty())
    }

    /// `<meta name=..>` or `<meta property=..>` content
    fn meta_content(document: &Html, name: &str) -> Option<String> {
        for attr in ["name", "property"] {
            let Ok(selector) = Selector::parse(&format!("meta[{}='{}']", attr, name)) else {
                continue;
            };
            let found = document
                .select(&selector)
                .filter_map(|el| el.value().attr("content"))
                .map(collapse_whitespace)
                .find(|c| !c.is_empty());
            if found.is_some() {
                return found;
            }
        }
        None
    }

    fn visible_text(document: &Html) -> String {
        let Ok(body_selector) = Selector::parse("body") else {
            return String::new();
        };
        let root = document
            .select(&body_selector)
            .next()
            .unwrap_or_else(|| document.root_element());

        let mut pieces: Vec<&str> = Vec::new();
        for node in root.descendants() {
            let Some(text) = node.value().as_text() else {
                continue;
            };
            let hidden = node.ancestors().any(|a| {
                a.value()
                    .as_element()
                    .map(|e| SKIPPED_TAGS.contains(&e.name()))
                    .unwrap_or(false)
            });
            if !hidden {
                pieces.push(text);
            }
        }
        collapse_whitespace(&pieces.join(" "))
    }

    fn links(&self, document: &Html, base: &Url) -> Vec<OutLink> {
        let Ok(selector) = Selector::parse("a[href]") else {
            return Vec::new();
        };

        let mut seen = HashSet::new();
        let mut links = Vec::new();
        for element in document.select(&selector) {
            if links.len() >= self.max_links {
                break;
            }
            let Some(link) = Self::resolve_link(&element, base) else {
                continue;
            };
            if seen.insert(link.url.clone()) {
                links.push(link);
            }
        }
        links
    }

    fn resolve_link(element: &ElementRef<'_>, base: &Url) -> Option<OutLink> {
        let href = element.value().attr("href")?.trim();
        let lower = href.to_lowercase();
        if href.is_empty()
            || href.starts_with('#')
            || ["javascript:", "mailto:", "tel:", "data:"]
                .iter()
                .any(|scheme| lower.starts_with(scheme))
        {
            return None;
        }

        let absolute = base.join(href).ok()?;
        let canonical = canonicalize_url(&absolute)?;
        if has_skipped_extension(&canonical) {
            return None;
        }

        let anchor = collapse_whitespace(&element.text().collect::<Vec<_>>().join(" "));
        Some(OutLink {
            url: canonical.to_string(),
            anchor: anchor.chars().take(MAX_ANCHOR_CHARS).collect(),
        })
    }
}

impl ContentExtractor for HtmlExtractor {
    fn extract(&self, raw: &[u8], base: &Url) -> Result<ExtractedContent> {
        if raw.iter().all(|b| b.is_ascii_whitespace()) {
            anyhow::bail!("Empty HTML document");
        }
        let html = String::from_utf8_lossy(raw);
        let document = Html::parse_document(&html);

        Ok(ExtractedContent {
            title: Self::title(&document),
            description: Self::description(&document),
            text: Self::visible_text(&document),
            links: self.links(&document, base),
        })
    }
}
