//! Snippet selection and query-term highlighting
//!
//! The body is split into sentences; the window of consecutive sentences
//! with the most query-term overlap is kept, capped, escaped, and matched
//! words are wrapped in `<mark>` tags.

use crate::index::TermTokenizer;
use std::collections::HashSet;
use unicode_segmentation::UnicodeSegmentation;

const MARK_OPEN: &str = "<mark>";
const MARK_CLOSE: &str = "</mark>";

/// Build a highlighted snippet for `query_terms` (already normalized by
/// `tokenizer`). Falls back to the description when the body has no match.
pub fn build_snippet(
    tokenizer: &dyn TermTokenizer,
    query_terms: &HashSet<String>,
    body: &str,
    description: &str,
    max_chars: usize,
) -> String {
    let best = best_window(tokenizer, query_terms, body, max_chars);
    let text = match best {
        Some(window) => window,
        None if !description.trim().is_empty() => description.trim().to_string(),
        None => split_sentences(body).into_iter().next().unwrap_or_default(),
    };
    highlight(tokenizer, query_terms, &truncate_on_word(&text, max_chars))
}

/// Highest-overlap run of sentences that fits in `max_chars`
fn best_window(
    tokenizer: &dyn TermTokenizer,
    query_terms: &HashSet<String>,
    body: &str,
    max_chars: usize,
) -> Option<String> {
    if query_terms.is_empty() {
        return None;
    }
    let sentences = split_sentences(body);
    let terms: Vec<HashSet<String>> = sentences
        .iter()
        .map(|s| tokenizer.tokenize(s).into_iter().collect())
        .collect();

    let mut best: Option<(usize, usize, usize)> = None; // (overlap, start, end)
    for start in 0..sentences.len() {
        // windows open on a matching sentence
        if !terms[start].iter().any(|t| query_terms.contains(t)) {
            continue;
        }
        let mut matched: HashSet<&String> = HashSet::new();
        let mut chars = 0;
        for end in start..sentences.len() {
            chars += sentences[end].chars().count() + usize::from(end > start);
            if end > start && chars > max_chars {
                break;
            }
            matched.extend(terms[end].iter().filter(|t| query_terms.contains(*t)));
            let overlap = matched.len();
            if overlap > 0 && best.map(|(o, _, _)| overlap > o).unwrap_or(true) {
                best = Some((overlap, start, end));
            }
        }
    }

    best.map(|(_, start, end)| sentences[start..=end].join(" "))
}

/// Split text on sentence-ending punctuation followed by whitespace
fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();

    while let Some(ch) = chars.next() {
        current.push(ch);
        let terminal = matches!(ch, '.' | '!' | '?');
        let boundary = chars.peek().map(|c| c.is_whitespace()).unwrap_or(true);
        if terminal && boundary {
            let trimmed = current.trim();
            if !trimmed.is_empty() {
                sentences.push(trimmed.to_string());
            }
            current.clear();
        }
    }
    let trimmed = current.trim();
    if !trimmed.is_empty() {
        sentences.push(trimmed.to_string());
    }
    sentences
}

/// Cap at `max_chars`, cutting at the last word boundary and adding "..."
fn truncate_on_word(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let budget = max_chars.saturating_sub(3);
    let cut: String = text.chars().take(budget).collect();
    let cut = match cut.rfind(char::is_whitespace) {
        Some(idx) if idx > 0 => cut[..idx].to_string(),
        _ => cut,
    };
    format!("{}...", cut.trim_end())
}

/// Escape markup, then wrap words whose normalized term is a query term
fn highlight(tokenizer: &dyn TermTokenizer, query_terms: &HashSet<String>, text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 32);
    for segment in text.split_word_bounds() {
        let is_word = segment.chars().any(char::is_alphanumeric);
        let hit = is_word
            && tokenizer
                .tokenize(segment)
                .iter()
                .any(|t| query_terms.contains(t));
        if hit {
            out.push_str(MARK_OPEN);
            out.push_str(&escape(segment));
            out.push_str(MARK_CLOSE);
        } else {
            out.push_str(&escape(segment));
        }
    }
    out
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}
