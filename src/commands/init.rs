use anyhow::{Context, Result};
use crawlrank::config::Config;
use std::path::PathBuf;

pub fn init_config(path: PathBuf) -> Result<()> {
    let mut config = Config::default();
    config.node.data_dir = PathBuf::from(".crawlrank");
    let config_path = path.join("crawlrank.toml");

    if config_path.exists() {
        anyhow::bail!("{} already exists", config_path.display());
    }

    std::fs::create_dir_all(&path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    let content = format!("# crawlrank configuration\n\n{}", config.to_toml()?);
    std::fs::write(&config_path, content)
        .with_context(|| format!("Failed to write {}", config_path.display()))?;

    println!("Created configuration at {}", config_path.display());
    println!("\nNext steps:");
    println!("  crawlrank --config {} crawl https://example.com/", config_path.display());
    println!("  crawlrank --config {} search \"example query\"", config_path.display());

    Ok(())
}
