//! Integration tests for crawlrank
//!
//! These tests drive the whole pipeline against a local mock web server.

use chrono::{Duration as ChronoDuration, Utc};
use crawlrank::{
    config::Config,
    crawl::canonicalize_str,
    types::{FrontierStatus, OutLink, PageEvent, PageId, PageStatus, RawPage},
    CrawlOptions, Pipeline,
};
use httpmock::prelude::*;
use tempfile::TempDir;

/// Config with politeness delays and back-offs shrunk for tests
fn test_config() -> Config {
    let mut config = Config::default();
    config.crawl.workers = 2;
    config.crawl.politeness_delay_ms = 0;
    config.crawl.min_delay_ms = 0;
    config.crawl.retry_backoff_ms = 10;
    config.crawl.max_depth = 2;
    config.index.writer_heap_bytes = 20_000_000;
    config.queue.poll_interval_ms = 20;
    config
}

fn html_page(title: &str, body: &str) -> String {
    format!(
        "<html><head><title>{}</title></head><body>{}</body></html>",
        title, body
    )
}

async fn mock_html(server: &MockServer, path: &'static str, body: String) {
    server
        .mock_async(move |when, then| {
            when.method(GET).path(path);
            then.status(200)
                .header("content-type", "text/html; charset=utf-8")
                .body(body);
        })
        .await;
}

async fn mock_no_robots(server: &MockServer) {
    server
        .mock_async(|when, then| {
            when.method(GET).path("/robots.txt");
            then.status(404);
        })
        .await;
}

fn canonical(raw: &str) -> String {
    canonicalize_str(raw).unwrap().to_string()
}

fn raw_page(url: &str, title: &str, text: &str, links: &[&str], minutes_ago: i64) -> RawPage {
    RawPage {
        url: url.to_string(),
        http_status: 200,
        content_type: "text/html".to_string(),
        content_length: text.len() as u64,
        title: title.to_string(),
        description: String::new(),
        text: text.to_string(),
        links: links
            .iter()
            .map(|l| OutLink {
                url: l.to_string(),
                anchor: String::new(),
            })
            .collect(),
        fetched_at: Utc::now() - ChronoDuration::minutes(minutes_ago),
        depth: 0,
        attempts: 1,
        job_id: None,
        worker_id: "test".to_string(),
    }
}

/// Crawl a small site, then search it
#[tokio::test]
async fn test_crawl_then_search_end_to_end() {
    let server = MockServer::start_async().await;
    mock_no_robots(&server).await;
    mock_html(
        &server,
        "/",
        html_page(
            "Home",
            r#"<p>Welcome to the garden of languages.</p>
               <a href="/rust">Rust</a> <a href="/cooking">Cooking</a>"#,
        ),
    )
    .await;
    mock_html(
        &server,
        "/rust",
        html_page(
            "Rust Programming",
            r#"<p>Rust is a systems programming language focused on memory safety.</p>
               <a href="/">Home</a>"#,
        ),
    )
    .await;
    mock_html(
        &server,
        "/cooking",
        html_page(
            "Cooking Notes",
            r#"<p>Slow roasted vegetables with olive oil and garlic.</p>
               <a href="/">Home</a> <a href="/rust">Rust</a>"#,
        ),
    )
    .await;

    let pipeline = Pipeline::temporary(test_config()).unwrap();
    let summary = pipeline
        .crawl(&[server.url("/")], CrawlOptions::default())
        .await
        .unwrap();

    assert_eq!(summary.fetched, 3);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.indexed, 3);
    assert!(summary.rank_generation.is_some());

    let stats = pipeline.stats();
    assert_eq!(stats.pages_by_status.get("indexed").copied(), Some(3));
    assert_eq!(stats.indexed_documents, 3);
    assert_eq!(stats.queue_ready, 0);
    assert_eq!(stats.queue_unacked, 0);
    assert!(stats.links >= 4);

    let response = pipeline.search("memory safety", 1, 10).unwrap();
    assert_eq!(response.total, 1);
    assert_eq!(response.results[0].url, canonical(&server.url("/rust")));
    assert_eq!(response.results[0].title, "Rust Programming");
    assert!(response.results[0].snippet.contains("<mark>"));

    let job = pipeline.store().get_job(summary.job_ids[0]).unwrap();
    assert_eq!(job.pages_crawled, 3);
    assert_eq!(job.pages_indexed, 3);
}

/// A robots.txt-disallowed URL is never fetched or indexed
#[tokio::test]
async fn test_robots_disallowed_page_never_indexed() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/robots.txt");
            then.status(200).body("User-agent: *\nDisallow: /private\n");
        })
        .await;
    mock_html(
        &server,
        "/",
        html_page("Public", r#"<p>Open page</p><a href="/private/secret">secret</a>"#),
    )
    .await;
    let private = server
        .mock_async(|when, then| {
            when.method(GET).path("/private/secret");
            then.status(200)
                .header("content-type", "text/html")
                .body(html_page("Secret", "<p>classified material</p>"));
        })
        .await;

    let pipeline = Pipeline::temporary(test_config()).unwrap();
    let summary = pipeline
        .crawl(&[server.url("/")], CrawlOptions::default())
        .await
        .unwrap();

    private.assert_hits_async(0).await;
    assert_eq!(summary.fetched, 1);
    assert_eq!(summary.disallowed, 1);
    assert_eq!(summary.failed, 0);

    let secret_id = PageId::from_url(&canonical(&server.url("/private/secret")));
    assert!(pipeline.store().get_page(&secret_id).is_none());
    assert_eq!(pipeline.search("classified", 1, 10).unwrap().total, 0);

    let report = pipeline
        .crawl_index(&[server.url("/private/secret")])
        .await
        .unwrap();
    assert_eq!(report.failed, 1);
    private.assert_hits_async(0).await;
}

/// Three timeouts mark the page failed; it is never re-enqueued
#[tokio::test]
async fn test_timeouts_mark_page_failed() {
    let server = MockServer::start_async().await;
    mock_no_robots(&server).await;
    let slow = server
        .mock_async(|when, then| {
            when.method(GET).path("/slow");
            then.status(200)
                .header("content-type", "text/html")
                .delay(std::time::Duration::from_millis(1800))
                .body(html_page("Slow", "<p>eventually</p>"));
        })
        .await;

    let mut config = test_config();
    config.crawl.request_timeout_secs = 1;
    config.crawl.max_retries = 3;
    let pipeline = Pipeline::temporary(config).unwrap();

    let url = server.url("/slow");
    let summary = pipeline
        .crawl(&[url.clone()], CrawlOptions::default())
        .await
        .unwrap();

    slow.assert_hits_async(3).await;
    assert_eq!(summary.fetched, 0);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.retried, 2);

    let record = pipeline
        .store()
        .get_page(&PageId::from_url(&canonical(&url)))
        .unwrap();
    assert_eq!(record.status, PageStatus::Failed);
    assert!(record.failure_reason.is_some());
    assert!(pipeline.is_failed(&url));

    assert_eq!(
        pipeline.frontier().status(&canonical(&url)),
        Some(FrontierStatus::Done)
    );
    assert!(!pipeline.frontier().enqueue(&canonical(&url), 1.0, 1).unwrap());

    let job = pipeline.store().get_job(summary.job_ids[0]).unwrap();
    assert_eq!(job.error_count, 1);
    assert_eq!(job.status, crawlrank::types::JobStatus::Failed);
}

/// The synchronous path reports every URL's outcome
#[tokio::test]
async fn test_crawl_index_reports_each_url() {
    let server = MockServer::start_async().await;
    mock_no_robots(&server).await;
    mock_html(
        &server,
        "/good",
        html_page("Good Page", r#"<p>Tantivy powers this index.</p><a href="/other">x</a>"#),
    )
    .await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/gone");
            then.status(404);
        })
        .await;
    let other = server
        .mock_async(|when, then| {
            when.method(GET).path("/other");
            then.status(200).body("never fetched");
        })
        .await;

    let pipeline = Pipeline::temporary(test_config()).unwrap();
    let report = pipeline
        .crawl_index(&[
            server.url("/good"),
            server.url("/gone"),
            "mailto:someone@example.com".to_string(),
        ])
        .await
        .unwrap();

    assert_eq!(report.results.len(), 3);
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.failed, 2);

    let good = &report.results[0];
    assert!(good.success);
    assert_eq!(good.title.as_deref(), Some("Good Page"));
    assert_eq!(
        good.page_id,
        Some(PageId::from_url(&canonical(&server.url("/good"))))
    );

    let gone = &report.results[1];
    assert!(!gone.success);
    assert!(gone.error.as_deref().unwrap().contains("404"));
    assert!(pipeline.is_failed(&server.url("/gone")));

    assert_eq!(report.results[2].error.as_deref(), Some("Invalid URL"));

    // links are stored, not crawled
    other.assert_hits_async(0).await;
    assert_eq!(pipeline.stats().frontier_pending, 0);
    assert_eq!(pipeline.search("tantivy", 1, 10).unwrap().total, 1);
}

/// Replaying the same event leaves one document and unchanged counters
#[tokio::test]
async fn test_replayed_event_is_idempotent() {
    let pipeline = Pipeline::temporary(test_config()).unwrap();
    let page = raw_page(
        "https://example.com/replay",
        "Replay",
        "Idempotent indexing keeps one document per page.",
        &["https://example.com/"],
        5,
    );
    let event = PageEvent::Fetched(page);

    pipeline.indexer().process(&event).unwrap();
    let first = pipeline.stats();
    pipeline.indexer().process(&event).unwrap();
    let second = pipeline.stats();

    assert_eq!(first.indexed_documents, 1);
    assert_eq!(second.indexed_documents, 1);
    assert_eq!(first.links, second.links);
    assert_eq!(pipeline.search("idempotent", 1, 10).unwrap().total, 1);
}

/// A newer fetch replaces the stored title and text
#[tokio::test]
async fn test_latest_fetch_wins() {
    let pipeline = Pipeline::temporary(test_config()).unwrap();
    let url = "https://example.com/news";

    let old = raw_page(url, "Old Headline", "Yesterday the river flooded.", &[], 60);
    let new = raw_page(url, "New Headline", "Today the river receded.", &[], 1);
    pipeline.indexer().process(&PageEvent::Fetched(old)).unwrap();
    pipeline.indexer().process(&PageEvent::Fetched(new)).unwrap();

    let response = pipeline.search("river", 1, 10).unwrap();
    assert_eq!(response.total, 1);
    assert_eq!(response.results[0].title, "New Headline");
    assert_eq!(pipeline.search("flooded", 1, 10).unwrap().total, 0);

    let record = pipeline.store().get_page(&PageId::from_url(url)).unwrap();
    assert_eq!(record.title, "New Headline");
    assert_eq!(record.status, PageStatus::Indexed);
}

/// A repeated query is served from the cache in the same order
#[tokio::test]
async fn test_repeated_search_hits_cache() {
    let pipeline = Pipeline::temporary(test_config()).unwrap();
    for (i, title) in ["Alpha", "Beta", "Gamma"].iter().enumerate() {
        let url = format!("https://example.com/{}", title.to_lowercase());
        let text = format!("Gardening tips {}", "gardening ".repeat(i + 1));
        let page = raw_page(&url, title, &text, &[], i as i64);
        pipeline.indexer().process(&PageEvent::Fetched(page)).unwrap();
    }

    let first = pipeline.search("Gardening", 1, 10).unwrap();
    let second = pipeline.search("  gardening ", 1, 10).unwrap();

    assert!(!first.cached);
    assert!(second.cached);
    assert_eq!(first.total, 3);
    let order = |r: &crawlrank::search::SearchResponse| {
        r.results.iter().map(|x| x.url.clone()).collect::<Vec<_>>()
    };
    assert_eq!(order(&first), order(&second));

    let stats = pipeline.stats();
    assert_eq!(stats.queries, 2);
    assert!(stats.recent_queries.iter().any(|q| q.cache_hit));
}

/// Three pages linking in a cycle share rank equally
#[tokio::test]
async fn test_link_cycle_ranks_evenly() {
    let pipeline = Pipeline::temporary(test_config()).unwrap();
    let a = "https://example.com/a";
    let b = "https://example.com/b";
    let c = "https://example.com/c";
    for (url, next) in [(a, b), (b, c), (c, a)] {
        let page = raw_page(url, url, "A page in a ring of links.", &[next], 0);
        pipeline.indexer().process(&PageEvent::Fetched(page)).unwrap();
    }

    let report = pipeline.rank().await.unwrap();
    assert_eq!(report.summary.pages, 3);
    assert!(report.summary.converged);

    for url in [a, b, c] {
        let score = pipeline
            .store()
            .rank(&PageId::from_url(url))
            .unwrap()
            .score;
        assert!((score - 1.0 / 3.0).abs() < 1e-4, "{} scored {}", url, score);
    }
}

/// Pages, ranks and the index survive a reopen
#[tokio::test]
async fn test_reopen_preserves_state() {
    let temp_dir = TempDir::new().unwrap();
    let server = MockServer::start_async().await;
    mock_no_robots(&server).await;
    mock_html(
        &server,
        "/",
        html_page("Lighthouse", "<p>The lighthouse keeper logs every storm.</p>"),
    )
    .await;

    let mut config = test_config();
    config.node.data_dir = temp_dir.path().to_path_buf();

    {
        let pipeline = Pipeline::open(config.clone()).unwrap();
        let report = pipeline.crawl_index(&[server.url("/")]).await.unwrap();
        assert_eq!(report.succeeded, 1);
        pipeline.rank().await.unwrap();
        pipeline.close().unwrap();
    }

    let pipeline = Pipeline::open(config).unwrap();
    let response = pipeline.search("lighthouse", 1, 10).unwrap();
    assert_eq!(response.total, 1);
    assert!(response.results[0].rank > 0.0);
    assert_eq!(pipeline.stats().ranks.unwrap().pages, 1);
}
