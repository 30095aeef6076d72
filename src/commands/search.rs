use anyhow::Result;
use crawlrank::{config::Config, util::truncate_str, Pipeline};
use tracing::info;

pub fn search(config: Config, query: &str, page: usize, size: usize, format: &str) -> Result<()> {
    info!("Searching for: {}", query);
    let pipeline = Pipeline::open(config)?;
    let response = pipeline.search(query, page, size)?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&response)?),
        _ => {
            println!(
                "\nSearch Results (page {} of {}, {} matches, {} ranked{}):\n",
                response.page,
                response.total_pages.max(1),
                response.total,
                response.candidates,
                if response.cached { ", cached" } else { "" },
            );
            for (i, result) in response.results.iter().enumerate() {
                let position = (response.page - 1) * response.size + i + 1;
                let title = if result.title.is_empty() {
                    "(untitled)"
                } else {
                    result.title.as_str()
                };
                println!(
                    "{}. [Score: {:.4} | text {:.3} | rank {:.3}] {}",
                    position, result.score, result.relevance, result.rank, title
                );
                println!("   URL: {}", result.url);
                if !result.snippet.is_empty() {
                    println!("   {}", truncate_str(&result.snippet, 300));
                }
                println!();
            }
            if response.has_next {
                println!("More results: --page {}", response.page + 1);
            }
            println!("Took {}ms", response.took_ms);
        }
    }

    Ok(())
}
