use anyhow::Result;
use crawlrank::{config::Config, types::PageStatus, Pipeline};

pub fn show_stats(config: Config) -> Result<()> {
    let data_dir = config.node.data_dir.clone();
    let pipeline = Pipeline::open(config)?;
    let stats = pipeline.stats();

    println!("\ncrawlrank Statistics:");
    println!("=====================");
    println!("Data directory: {}", data_dir.display());
    println!("Pages: {}", stats.pages);
    for status in [
        PageStatus::Pending,
        PageStatus::Crawled,
        PageStatus::Indexed,
        PageStatus::Failed,
    ] {
        let count = stats.pages_by_status.get(status.as_str()).copied().unwrap_or(0);
        println!("  {}: {}", status, count);
    }
    println!("Links: {}", stats.links);
    println!("Indexed documents: {}", stats.indexed_documents);

    match &stats.ranks {
        Some(ranks) => println!(
            "Ranks: generation {} over {} pages ({} iterations, computed {})",
            ranks.generation,
            ranks.pages,
            ranks.iterations,
            ranks.computed_at.format("%Y-%m-%d %H:%M:%S")
        ),
        None => println!("Ranks: not computed"),
    }

    println!("\nFrontier:");
    println!("  Pending: {}", stats.frontier_pending);
    println!("  In flight: {}", stats.frontier_inflight);
    println!("  Delayed: {}", stats.frontier_delayed);
    println!("  Seen URLs (estimate): {}", stats.dedup_estimate);
    println!("  Bloom fill: {:.2}%", stats.dedup_fill_ratio * 100.0);

    println!("\nHand-off queue:");
    println!("  Ready: {}", stats.queue_ready);
    println!("  Unacked: {}", stats.queue_unacked);
    println!("  Dead letters: {}", stats.dead_letters);

    println!("\nQueries served: {}", stats.queries);
    for entry in &stats.recent_queries {
        println!(
            "  {} \"{}\" {} results {}ms{}",
            entry.logged_at.format("%H:%M:%S"),
            entry.query,
            entry.result_count,
            entry.latency_ms,
            if entry.cache_hit { " (cached)" } else { "" }
        );
    }

    Ok(())
}

pub async fn dead_letters(config: Config) -> Result<()> {
    let pipeline = Pipeline::open(config)?;
    let letters = pipeline.dead_letters().await?;

    if letters.is_empty() {
        println!("No dead letters");
        return Ok(());
    }

    println!("\nDead letters ({}):", letters.len());
    for letter in &letters {
        println!(
            "  #{} after {} deliveries at {}: {}",
            letter.id, letter.deliveries, letter.dead_at, letter.reason
        );
        println!("     {}", crawlrank::util::truncate_str(&letter.payload, 200));
    }

    Ok(())
}
