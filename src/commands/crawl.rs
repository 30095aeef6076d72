use anyhow::Result;
use crawlrank::{config::Config, pipeline::CrawlOptions, Pipeline};
use tracing::info;

pub async fn crawl(config: Config, seeds: Vec<String>, max_pages: Option<u64>) -> Result<()> {
    info!("Starting crawl from {} seed(s)", seeds.len());
    let pipeline = Pipeline::open(config)?;

    let summary = pipeline.crawl(&seeds, CrawlOptions { max_pages }).await?;
    pipeline.close()?;

    println!("\nCrawl Complete:");
    println!("===============");
    println!("Pages fetched: {}", summary.fetched);
    println!("Pages failed: {}", summary.failed);
    println!("Retries: {}", summary.retried);
    println!("Disallowed by robots.txt: {}", summary.disallowed);
    println!("Events indexed: {}", summary.indexed);
    if let Some(generation) = summary.rank_generation {
        println!("Rank generation: {}", generation);
    }
    println!("Time: {:.1}s", summary.took_ms as f64 / 1000.0);
    for id in &summary.job_ids {
        println!("Job: {}", id);
    }

    Ok(())
}

pub async fn crawl_index(config: Config, urls: Vec<String>, format: &str) -> Result<()> {
    let pipeline = Pipeline::open(config)?;
    let report = pipeline.crawl_index(&urls).await?;
    pipeline.close()?;

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    for outcome in &report.results {
        if outcome.success {
            println!(
                "[ok]     {} {}",
                outcome.url,
                outcome.title.as_deref().unwrap_or("(untitled)")
            );
        } else {
            println!(
                "[failed] {} {}",
                outcome.url,
                outcome.error.as_deref().unwrap_or("unknown error")
            );
        }
    }
    println!(
        "\n{} succeeded, {} failed in {}ms",
        report.succeeded, report.failed, report.took_ms
    );

    Ok(())
}

pub async fn rank(config: Config, top: usize) -> Result<()> {
    let pipeline = Pipeline::open(config)?;
    let report = pipeline.rank().await?;

    println!("\nPageRank:");
    println!("=========");
    println!("Generation: {}", report.summary.generation);
    println!("Pages: {}", report.summary.pages);
    println!("Edges: {}", report.edges);
    println!(
        "Iterations: {} ({})",
        report.summary.iterations,
        if report.summary.converged { "converged" } else { "hit iteration cap" }
    );
    println!("Final delta: {:.3e}", report.delta);
    println!("Time: {}ms", report.took_ms);

    let top_pages = pipeline.ranking().top_pages(top);
    if !top_pages.is_empty() {
        println!("\nTop pages:");
        for (i, score) in top_pages.iter().enumerate() {
            let url = pipeline
                .store()
                .get_page(&score.page_id)
                .map(|p| p.url)
                .unwrap_or_else(|| score.page_id.to_string());
            println!("  {:>2}. {:.6} {}", i + 1, score.score, url);
        }
    }

    Ok(())
}
