//! Inverted index backed by Tantivy
//!
//! Documents are keyed by page id: an upsert deletes the previous document
//! with that id before adding the new one, and commits so the change is
//! visible to the next query.

use super::tokenizer::{english_analyzer, ANALYZER_NAME};
use crate::types::PageId;
use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use std::path::Path;
use tantivy::{
    collector::{Count, TopDocs},
    directory::MmapDirectory,
    query::QueryParser,
    schema::{
        Field, IndexRecordOption, Schema, TextFieldIndexing, TextOptions, Value, FAST, STORED,
        STRING,
    },
    Index, IndexReader, IndexWriter, ReloadPolicy, TantivyDocument, Term,
};
use tracing::debug;

const TITLE_BOOST: f32 = 3.0;
const DESCRIPTION_BOOST: f32 = 2.0;

/// Document handed to the inverted index
#[derive(Debug, Clone, PartialEq)]
pub struct IndexDocument {
    pub id: PageId,
    pub url: String,
    pub title: String,
    pub description: String,
    pub body: String,
    pub crawled_at: Option<DateTime<Utc>>,
}

/// One scored match
#[derive(Debug, Clone, PartialEq)]
pub struct IndexHit {
    pub id: PageId,
    pub url: String,
    pub title: String,
    pub description: String,
    pub crawled_at: Option<DateTime<Utc>>,
    /// Native BM25 relevance
    pub score: f32,
}

/// Top hits of a query plus the number of documents it matched overall
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryMatches {
    pub hits: Vec<IndexHit>,
    /// Every matching document, not only the returned `hits`
    pub total: usize,
}

/// Full-text engine interface
pub trait InvertedIndex: Send + Sync {
    /// Insert or replace the document keyed by `doc.id`
    fn upsert(&self, doc: &IndexDocument) -> Result<()>;

    /// Best `limit` matches for a free-text query, highest score first,
    /// together with the full match count
    fn query_counted(&self, text: &str, limit: usize) -> Result<QueryMatches>;

    /// Best matches for a free-text query, highest score first
    fn query(&self, text: &str, limit: usize) -> Result<Vec<IndexHit>> {
        Ok(self.query_counted(text, limit)?.hits)
    }

    fn delete(&self, id: &PageId) -> Result<()>;

    /// Number of live documents
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct PageSchema {
    id: Field,
    url: Field,
    title: Field,
    description: Field,
    body: Field,
    crawled_at: Field,
}

pub struct TantivyIndex {
    index: Index,
    reader: IndexReader,
    writer: Mutex<IndexWriter>,
    schema: PageSchema,
}

impl TantivyIndex {
    /// Create an index in memory
    pub fn in_memory(stemming: bool, heap_bytes: usize) -> Result<Self> {
        let (schema, fields) = Self::build_schema();
        let index = Index::create_in_ram(schema);
        Self::from_index(index, fields, stemming, heap_bytes)
    }

    /// Open or create an index on disk
    pub fn open(path: impl AsRef<Path>, stemming: bool, heap_bytes: usize) -> Result<Self> {
        let path = path.as_ref();
        std::fs::create_dir_all(path)
            .with_context(|| format!("Failed to create index directory {:?}", path))?;

        let (schema, fields) = Self::build_schema();
        let dir = MmapDirectory::open(path)
            .with_context(|| format!("Failed to open index directory {:?}", path))?;
        let index = Index::open_or_create(dir, schema).context("Failed to open index")?;
        Self::from_index(index, fields, stemming, heap_bytes)
    }

    fn from_index(index: Index, schema: PageSchema, stemming: bool, heap_bytes: usize) -> Result<Self> {
        index
            .tokenizers()
            .register(ANALYZER_NAME, english_analyzer(stemming));

        let writer = index.writer(heap_bytes).context("Failed to create index writer")?;
        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::OnCommitWithDelay)
            .try_into()
            .context("Failed to create index reader")?;

        Ok(Self {
            index,
            reader,
            writer: Mutex::new(writer),
            schema,
        })
    }

    fn build_schema() -> (Schema, PageSchema) {
        let mut builder = Schema::builder();

        let text = TextOptions::default()
            .set_indexing_options(
                TextFieldIndexing::default()
                    .set_tokenizer(ANALYZER_NAME)
                    .set_index_option(IndexRecordOption::WithFreqsAndPositions),
            )
            .set_stored();
        let body_options = TextOptions::default().set_indexing_options(
            TextFieldIndexing::default()
                .set_tokenizer(ANALYZER_NAME)
                .set_index_option(IndexRecordOption::WithFreqsAndPositions),
        );

        let fields = PageSchema {
            id: builder.add_text_field("id", STRING | STORED),
            url: builder.add_text_field("url", STORED),
            title: builder.add_text_field("title", text.clone()),
            description: builder.add_text_field("description", text),
            body: builder.add_text_field("body", body_options),
            crawled_at: builder.add_i64_field("crawled_at", STORED | FAST),
        };
        (builder.build(), fields)
    }

    fn commit(&self, writer: &mut IndexWriter) -> Result<()> {
        writer.commit().context("Failed to commit index")?;
        self.reader.reload().context("Failed to reload index reader")?;
        Ok(())
    }

    fn text_of(doc: &TantivyDocument, field: Field) -> String {
        doc.get_first(field)
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string()
    }
}

impl InvertedIndex for TantivyIndex {
    fn upsert(&self, doc: &IndexDocument) -> Result<()> {
        let mut document = TantivyDocument::new();
        document.add_text(self.schema.id, doc.id.as_str());
        document.add_text(self.schema.url, &doc.url);
        document.add_text(self.schema.title, &doc.title);
        document.add_text(self.schema.description, &doc.description);
        document.add_text(self.schema.body, &doc.body);
        document.add_i64(
            self.schema.crawled_at,
            doc.crawled_at.map(|t| t.timestamp_millis()).unwrap_or(0),
        );

        let mut writer = self.writer.lock();
        writer.delete_term(Term::from_field_text(self.schema.id, doc.id.as_str()));
        writer
            .add_document(document)
            .with_context(|| format!("Failed to add {} to index", doc.url))?;
        self.commit(&mut writer)
    }

    fn query_counted(&self, text: &str, limit: usize) -> Result<QueryMatches> {
        if text.trim().is_empty() || limit == 0 {
            return Ok(QueryMatches::default());
        }

        let mut parser = QueryParser::for_index(
            &self.index,
            vec![self.schema.title, self.schema.description, self.schema.body],
        );
        parser.set_field_boost(self.schema.title, TITLE_BOOST);
        parser.set_field_boost(self.schema.description, DESCRIPTION_BOOST);

        let query = match parser.parse_query(text) {
            Ok(query) => query,
            Err(e) => {
                debug!("Strict parse of '{}' failed ({}), using lenient parse", text, e);
                parser.parse_query_lenient(text).0
            }
        };

        let searcher = self.reader.searcher();
        let (top_docs, total) = searcher
            .search(&query, &(TopDocs::with_limit(limit), Count))
            .context("Index search failed")?;

        let mut hits = Vec::with_capacity(top_docs.len());
        for (score, address) in top_docs {
            let doc: TantivyDocument = searcher.doc(address).context("Failed to load hit")?;
            let crawled_at = doc
                .get_first(self.schema.crawled_at)
                .and_then(|v| v.as_i64())
                .filter(|ms| *ms > 0)
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single());
            hits.push(IndexHit {
                id: PageId(Self::text_of(&doc, self.schema.id)),
                url: Self::text_of(&doc, self.schema.url),
                title: Self::text_of(&doc, self.schema.title),
                description: Self::text_of(&doc, self.schema.description),
                crawled_at,
                score,
            });
        }

        debug!("Index query '{}': {} of {} hits", text, hits.len(), total);
        Ok(QueryMatches { hits, total })
    }

    fn delete(&self, id: &PageId) -> Result<()> {
        let mut writer = self.writer.lock();
        writer.delete_term(Term::from_field_text(self.schema.id, id.as_str()));
        self.commit(&mut writer)
    }

    fn len(&self) -> usize {
        self.reader.searcher().num_docs() as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index() -> TantivyIndex {
        TantivyIndex::in_memory(true, 20_000_000).unwrap()
    }

    fn doc(url: &str, title: &str, body: &str) -> IndexDocument {
        IndexDocument {
            id: PageId::from_url(url),
            url: url.to_string(),
            title: title.to_string(),
            description: String::new(),
            body: body.to_string(),
            crawled_at: Some(Utc::now()),
        }
    }

    #[test]
    fn test_upsert_and_query() {
        let index = index();
        index
            .upsert(&doc("https://a.com/", "Fox facts", "The quick brown fox jumps over the lazy dog"))
            .unwrap();
        index
            .upsert(&doc("https://b.com/", "Cats", "A fast cat runs across the street"))
            .unwrap();

        let hits = index.query("fox jumping", 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].url, "https://a.com/");
        assert_eq!(hits[0].title, "Fox facts");
        assert!(hits[0].crawled_at.is_some());
        assert!(hits[0].score > 0.0);
    }

    #[test]
    fn test_upsert_replaces_same_id() {
        let index = index();
        index.upsert(&doc("https://a.com/", "Old title", "rust crawler")).unwrap();
        index.upsert(&doc("https://a.com/", "New title", "rust crawler")).unwrap();

        assert_eq!(index.len(), 1);
        let hits = index.query("rust", 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].title, "New title");
    }

    #[test]
    fn test_title_boost_ranks_title_match_first() {
        let index = index();
        index.upsert(&doc("https://body.com/", "Other", "gardening tips and gardening tools")).unwrap();
        index.upsert(&doc("https://title.com/", "Gardening", "tips and tools for the yard")).unwrap();

        let hits = index.query("gardening", 10).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].url, "https://title.com/");
    }

    #[test]
    fn test_delete() {
        let index = index();
        let d = doc("https://a.com/", "Delete me", "ephemeral content");
        index.upsert(&d).unwrap();
        index.delete(&d.id).unwrap();
        assert!(index.is_empty());
        assert!(index.query("ephemeral", 10).unwrap().is_empty());
    }

    #[test]
    fn test_invalid_syntax_falls_back_to_lenient() {
        let index = index();
        index.upsert(&doc("https://a.com/", "Rust", "rust ownership rules")).unwrap();
        let hits = index.query("rust AND (ownership", 10).unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn test_total_counts_matches_beyond_limit() {
        let index = index();
        for i in 0..5 {
            index
                .upsert(&doc(&format!("https://{}.com/", i), "Kayaks", "river kayak trips"))
                .unwrap();
        }
        index.upsert(&doc("https://other.com/", "Boots", "hiking boots")).unwrap();

        let matches = index.query_counted("kayak", 2).unwrap();
        assert_eq!(matches.hits.len(), 2);
        assert_eq!(matches.total, 5);
    }

    #[test]
    fn test_empty_query() {
        let index = index();
        assert!(index.query("   ", 10).unwrap().is_empty());
    }

    #[test]
    fn test_on_disk_index_reopens() {
        let dir = tempfile::TempDir::new().unwrap();
        {
            let index = TantivyIndex::open(dir.path(), true, 20_000_000).unwrap();
            index.upsert(&doc("https://a.com/", "Persisted", "durable words")).unwrap();
        }
        let index = TantivyIndex::open(dir.path(), true, 20_000_000).unwrap();
        assert_eq!(index.len(), 1);
        assert_eq!(index.query("durable", 10).unwrap()[0].title, "Persisted");
    }
}
