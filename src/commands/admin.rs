use anyhow::Result;
use crawlrank::{config::Config, Pipeline};
use tracing::info;

use crate::AdminAction;

/// Handle maintenance commands
pub fn handle_admin(config: Config, action: AdminAction) -> Result<()> {
    let pipeline = Pipeline::open(config)?;
    match action {
        AdminAction::ClearFrontier => {
            let dropped = pipeline.clear_frontier()?;
            info!("Cleared frontier");
            println!("Frontier cleared ({} queued URLs dropped)", dropped);
        }
        AdminAction::ClearBloom => {
            let forgotten = pipeline.clear_dedup()?;
            info!("Cleared dedup filter");
            println!(
                "Bloom filter cleared, {} crawled URLs can be discovered again",
                forgotten
            );
        }
    }
    pipeline.close()
}
