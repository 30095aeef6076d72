//! Configuration for crawlrank

mod crawl;
mod index;
mod logging;
mod node;
mod search;

pub use crawl::{CrawlConfig, QueueConfig, DEFAULT_SEED_URLS};
pub use index::{IndexConfig, RankingConfig, TokenizerKind};
pub use logging::{LogFormat, LogLevel, LoggingConfig};
pub use node::NodeConfig;
pub use search::{HybridFormula, SearchConfig};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default user agent for page and robots.txt fetches
pub const DEFAULT_USER_AGENT: &str = "MiniSearchBot/1.0 (+https://github.com/crawlrank)";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub crawl: CrawlConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub ranking: RankingConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file and validate it.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file '{}'", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file '{}'", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to TOML (used by `crawlrank init`)
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config")
    }

    /// Validate all configuration fields.
    ///
    /// Collects every error and reports them together.
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        // Crawl
        if self.crawl.workers == 0 {
            errors.push("crawl.workers must be positive".to_string());
        }
        if self.crawl.max_retries == 0 {
            errors.push("crawl.max_retries must be at least 1".to_string());
        }
        if self.crawl.max_inflight_per_host == 0 {
            errors.push("crawl.max_inflight_per_host must be positive".to_string());
        }
        if self.crawl.min_delay_ms > self.crawl.max_delay_ms {
            errors.push(format!(
                "crawl.min_delay_ms ({}) must not exceed crawl.max_delay_ms ({})",
                self.crawl.min_delay_ms, self.crawl.max_delay_ms
            ));
        }
        if self.crawl.lease_timeout_secs == 0 {
            errors.push("crawl.lease_timeout_secs must be positive".to_string());
        }
        if self.crawl.request_timeout_secs == 0 {
            errors.push("crawl.request_timeout_secs must be positive".to_string());
        }
        if self.crawl.bloom_expected_items == 0 {
            errors.push("crawl.bloom_expected_items must be positive".to_string());
        }
        if self.crawl.bloom_false_positive_rate <= 0.0 || self.crawl.bloom_false_positive_rate >= 1.0 {
            errors.push(
                "crawl.bloom_false_positive_rate must be between 0.0 (exclusive) and 1.0 (exclusive)"
                    .to_string(),
            );
        }
        for seed in &self.crawl.default_seeds {
            if url::Url::parse(seed).is_err() {
                errors.push(format!("crawl.default_seeds entry '{}' is not a URL", seed));
            }
        }
        if self.crawl.user_agent.trim().is_empty() {
            errors.push("crawl.user_agent must not be empty".to_string());
        }
        for pattern in self
            .crawl
            .include_patterns
            .iter()
            .chain(&self.crawl.exclude_patterns)
        {
            if let Err(e) = regex::Regex::new(pattern) {
                errors.push(format!("crawl pattern '{}' is invalid: {}", pattern, e));
            }
        }

        // Queue
        if self.queue.max_deliveries == 0 {
            errors.push("queue.max_deliveries must be at least 1".to_string());
        }
        if self.queue.visibility_timeout_secs == 0 {
            errors.push("queue.visibility_timeout_secs must be positive".to_string());
        }
        if self.queue.drain_timeout_secs == 0 {
            errors.push("queue.drain_timeout_secs must be positive".to_string());
        }

        // Index
        if self.index.indexer_workers == 0 {
            errors.push("index.indexer_workers must be positive".to_string());
        }
        if self.index.writer_heap_bytes < 15_000_000 {
            errors.push("index.writer_heap_bytes must be at least 15000000".to_string());
        }

        // Ranking
        if self.ranking.damping <= 0.0 || self.ranking.damping >= 1.0 {
            errors.push("ranking.damping must be between 0.0 (exclusive) and 1.0 (exclusive)".to_string());
        }
        if self.ranking.tolerance <= 0.0 {
            errors.push("ranking.tolerance must be positive".to_string());
        }
        if self.ranking.max_iterations == 0 {
            errors.push("ranking.max_iterations must be positive".to_string());
        }

        // Search
        if self.search.relevance_weight < 0.0 || self.search.authority_weight < 0.0 {
            errors.push("search weights must be non-negative".to_string());
        }
        if self.search.relevance_weight == 0.0 && self.search.authority_weight == 0.0 {
            errors.push("search.relevance_weight and search.authority_weight cannot both be zero".to_string());
        }
        if self.search.missing_rank_floor < 0.0 {
            errors.push("search.missing_rank_floor must be non-negative".to_string());
        }
        if self.search.cache_capacity == 0 {
            errors.push("search.cache_capacity must be positive".to_string());
        }
        if self.search.candidate_limit == 0 {
            errors.push("search.candidate_limit must be positive".to_string());
        }
        if self.search.max_page == 0 || self.search.max_size == 0 {
            errors.push("search.max_page and search.max_size must be positive".to_string());
        }

        // Node
        if self.node.data_dir.as_os_str().is_empty() {
            errors.push("data_dir must not be empty".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            anyhow::bail!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        Config::default()
    }

    fn assert_invalid(cfg: &Config, needle: &str) {
        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains(needle), "expected '{}' in error: {}", needle, err);
    }

    #[test]
    fn default_config_passes_validation() {
        assert!(valid_config().validate().is_ok(), "default config should be valid");
    }

    #[test]
    fn validate_rejects_zero_workers() {
        let mut cfg = valid_config();
        cfg.crawl.workers = 0;
        assert_invalid(&cfg, "crawl.workers");
    }

    #[test]
    fn validate_rejects_damping_out_of_range() {
        let mut cfg = valid_config();
        cfg.ranking.damping = 1.0;
        assert_invalid(&cfg, "ranking.damping");

        cfg.ranking.damping = 0.0;
        assert_invalid(&cfg, "ranking.damping");
    }

    #[test]
    fn validate_rejects_bad_url_pattern() {
        let mut cfg = valid_config();
        cfg.crawl.exclude_patterns = vec!["/private/(".to_string()];
        assert_invalid(&cfg, "crawl pattern");
    }

    #[test]
    fn validate_rejects_bad_bloom_rate() {
        let mut cfg = valid_config();
        cfg.crawl.bloom_false_positive_rate = 1.5;
        assert_invalid(&cfg, "bloom_false_positive_rate");
    }

    #[test]
    fn validate_rejects_inverted_delay_bounds() {
        let mut cfg = valid_config();
        cfg.crawl.min_delay_ms = 10_000;
        cfg.crawl.max_delay_ms = 100;
        assert_invalid(&cfg, "min_delay_ms");
    }

    #[test]
    fn validate_reports_all_errors_together() {
        let mut cfg = valid_config();
        cfg.crawl.workers = 0;
        cfg.queue.max_deliveries = 0;
        cfg.search.cache_capacity = 0;

        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.starts_with("Configuration validation failed:"));
        assert!(err.contains("crawl.workers"));
        assert!(err.contains("queue.max_deliveries"));
        assert!(err.contains("search.cache_capacity"));
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let toml_str = r#"
            [crawl]
            workers = 8
            max_depth = 1

            [search]
            formula = "multiplicative"
            authority_weight = 0.5
        "#;
        let cfg: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.crawl.workers, 8);
        assert_eq!(cfg.crawl.max_depth, 1);
        assert_eq!(cfg.crawl.max_retries, 3);
        assert_eq!(cfg.search.formula, HybridFormula::Multiplicative);
        assert_eq!(cfg.search.authority_weight, 0.5);
        assert_eq!(cfg.ranking.damping, 0.85);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn tokenizer_and_default_seeds_parse() {
        let toml_str = r#"
            [crawl]
            default_seeds = ["https://example.org/"]

            [index]
            tokenizer = "word"
        "#;
        let cfg: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.index.tokenizer, TokenizerKind::Word);
        assert_eq!(cfg.crawl.default_seeds, vec!["https://example.org/".to_string()]);
        assert!(cfg.validate().is_ok());

        let defaults = Config::default();
        assert_eq!(defaults.index.tokenizer, TokenizerKind::Analyzer);
        assert_eq!(defaults.crawl.default_seeds.len(), DEFAULT_SEED_URLS.len());
    }

    #[test]
    fn validate_rejects_bad_default_seed_and_zero_drain_timeout() {
        let mut cfg = valid_config();
        cfg.crawl.default_seeds = vec!["not a url".to_string()];
        cfg.queue.drain_timeout_secs = 0;
        assert_invalid(&cfg, "crawl.default_seeds");
        assert_invalid(&cfg, "queue.drain_timeout_secs");
    }

    #[test]
    fn default_config_round_trips_through_toml() {
        let cfg = valid_config();
        let text = cfg.to_toml().unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.crawl.politeness_delay_ms, cfg.crawl.politeness_delay_ms);
        assert_eq!(parsed.search.cache_ttl_secs, cfg.search.cache_ttl_secs);
    }

    #[test]
    fn load_reports_missing_file() {
        let err = Config::load(Path::new("/nonexistent/crawlrank.toml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
