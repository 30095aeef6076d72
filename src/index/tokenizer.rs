//! Term tokenizers
//!
//! `AnalyzerTokenizer` runs the same tantivy analyzer chain that is registered
//! on the inverted index text fields, so indexed terms and query terms agree.

use std::collections::HashSet;
use tantivy::tokenizer::{
    Language, LowerCaser, RemoveLongFilter, SimpleTokenizer, Stemmer, StopWordFilter,
    TextAnalyzer, TokenStream,
};
use unicode_segmentation::UnicodeSegmentation;

/// Name the analyzer is registered under on the index
pub const ANALYZER_NAME: &str = "crawlrank_en";

/// Tokens longer than this are dropped (base64 blobs, minified junk)
const MAX_TOKEN_LEN: usize = 40;

pub const ENGLISH_STOP_WORDS: &[&str] = &[
    "a", "about", "after", "all", "also", "an", "and", "any", "are", "as", "at", "be", "been",
    "but", "by", "can", "could", "did", "do", "does", "for", "from", "had", "has", "have", "he",
    "her", "his", "how", "i", "if", "in", "into", "is", "it", "its", "just", "more", "most",
    "no", "not", "of", "on", "only", "or", "other", "our", "out", "over", "she", "so", "some",
    "such", "than", "that", "the", "their", "them", "then", "there", "these", "they", "this",
    "those", "to", "up", "was", "we", "were", "what", "when", "where", "which", "who", "will",
    "with", "would", "you", "your",
];

/// Turns text into normalized index terms
pub trait TermTokenizer: Send + Sync {
    fn tokenize(&self, text: &str) -> Vec<String>;

    fn name(&self) -> &'static str;
}

/// English analyzer chain: simple tokenizer, long-token removal, lowercasing,
/// stopword removal and optional stemming
pub fn english_analyzer(stemming: bool) -> TextAnalyzer {
    let builder = TextAnalyzer::builder(SimpleTokenizer::default())
        .filter(RemoveLongFilter::limit(MAX_TOKEN_LEN))
        .filter(LowerCaser)
        .filter(StopWordFilter::remove(
            ENGLISH_STOP_WORDS.iter().map(|w| w.to_string()),
        ));
    if stemming {
        builder.filter(Stemmer::new(Language::English)).build()
    } else {
        builder.build()
    }
}

/// Tokenizer backed by a tantivy `TextAnalyzer`
#[derive(Clone)]
pub struct AnalyzerTokenizer {
    analyzer: TextAnalyzer,
    min_len: usize,
}

impl AnalyzerTokenizer {
    pub fn english(stemming: bool, min_len: usize) -> Self {
        Self {
            analyzer: english_analyzer(stemming),
            min_len,
        }
    }

    pub fn analyzer(&self) -> TextAnalyzer {
        self.analyzer.clone()
    }
}

impl TermTokenizer for AnalyzerTokenizer {
    fn tokenize(&self, text: &str) -> Vec<String> {
        // token_stream needs &mut, the shared analyzer stays untouched
        let mut analyzer = self.analyzer.clone();
        let mut stream = analyzer.token_stream(text);
        let mut terms = Vec::new();
        while stream.advance() {
            let token = stream.token();
            if token.text.chars().count() >= self.min_len {
                terms.push(token.text.clone());
            }
        }
        terms
    }

    fn name(&self) -> &'static str {
        "analyzer"
    }
}

/// Unicode word splitter with lowercasing and stopword removal, no stemming
pub struct WordTokenizer {
    stop_words: HashSet<&'static str>,
    min_len: usize,
}

impl WordTokenizer {
    pub fn new(min_len: usize) -> Self {
        Self {
            stop_words: ENGLISH_STOP_WORDS.iter().copied().collect(),
            min_len,
        }
    }
}

impl TermTokenizer for WordTokenizer {
    fn tokenize(&self, text: &str) -> Vec<String> {
        text.unicode_words()
            .map(str::to_lowercase)
            .filter(|w| {
                let len = w.chars().count();
                len >= self.min_len && len <= MAX_TOKEN_LEN && !self.stop_words.contains(w.as_str())
            })
            .collect()
    }

    fn name(&self) -> &'static str {
        "word"
    }
}
