//! crawlrank: polite web crawler, full-text index and ranked search

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use crawlrank::config::{Config, LogFormat};
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "crawlrank")]
#[command(about = "Polite web crawler with full-text search and PageRank authority")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "crawlrank.toml")]
    config: PathBuf,

    /// Data directory
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init {
        /// Output directory
        #[arg(default_value = ".")]
        path: PathBuf,
    },

    /// Crawl from seed URLs through the frontier and index what is fetched
    Crawl {
        /// Seed URLs (defaults to `crawl.default_seeds`)
        seeds: Vec<String>,

        /// Maximum crawl depth
        #[arg(short = 'D', long)]
        depth: Option<u32>,

        /// Number of fetcher workers
        #[arg(short, long)]
        workers: Option<usize>,

        /// Stop after this many fetched pages
        #[arg(short, long)]
        max_pages: Option<u64>,

        /// Only follow links on the seed host of each crawl job
        #[arg(short, long)]
        stay_on_domain: bool,
    },

    /// Fetch and index URLs immediately, reporting each outcome
    CrawlIndex {
        #[arg(required = true)]
        urls: Vec<String>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Recompute PageRank over the stored link graph
    Rank {
        /// Show the top pages after recomputing
        #[arg(short, long, default_value = "10")]
        top: usize,
    },

    /// Search the index
    Search {
        /// Search query
        query: String,

        /// Result page (1-based)
        #[arg(short, long, default_value = "1")]
        page: usize,

        /// Results per page
        #[arg(short, long, default_value = "10")]
        size: usize,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show store, frontier, queue and index statistics
    Stats,

    /// List messages the indexers gave up on
    DeadLetters,

    /// Crawl state maintenance
    Admin {
        #[command(subcommand)]
        action: AdminAction,
    },
}

#[derive(Subcommand)]
pub enum AdminAction {
    /// Drop every queued, delayed and in-flight frontier URL
    ClearFrontier,

    /// Reset the URL dedup filter so known URLs can be crawled again
    ClearBloom,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load or create config
    let mut config = if cli.config.exists() {
        Config::load(&cli.config)?
    } else {
        Config::default()
    };

    // Override data dir if specified
    if let Some(data_dir) = cli.data_dir {
        config.node.data_dir = data_dir;
    }

    // Setup logging
    let log_level = match cli.verbose {
        0 => config.logging.level.as_tracing(),
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    match config.logging.format {
        LogFormat::Json => {
            let subscriber = FmtSubscriber::builder()
                .with_max_level(log_level)
                .with_target(false)
                .json()
                .finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
        LogFormat::Text => {
            let subscriber = FmtSubscriber::builder()
                .with_max_level(log_level)
                .with_target(false)
                .finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
    }

    match cli.command {
        Commands::Init { path } => commands::init_config(path),
        Commands::Crawl {
            seeds,
            depth,
            workers,
            max_pages,
            stay_on_domain,
        } => {
            if let Some(depth) = depth {
                config.crawl.max_depth = depth;
            }
            if let Some(workers) = workers {
                config.crawl.workers = workers;
            }
            if stay_on_domain {
                config.crawl.stay_on_domain = true;
            }
            config.validate()?;
            commands::crawl(config, seeds, max_pages).await
        }
        Commands::CrawlIndex { urls, format } => {
            config.validate()?;
            commands::crawl_index(config, urls, &format).await
        }
        Commands::Rank { top } => {
            config.validate()?;
            commands::rank(config, top).await
        }
        Commands::Search {
            query,
            page,
            size,
            format,
        } => {
            config.validate()?;
            commands::search(config, &query, page, size, &format)
        }
        Commands::Stats => {
            config.validate()?;
            commands::show_stats(config)
        }
        Commands::DeadLetters => {
            config.validate()?;
            commands::dead_letters(config).await
        }
        Commands::Admin { action } => {
            config.validate()?;
            commands::handle_admin(config, action)
        }
    }
}
