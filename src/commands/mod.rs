//! CLI command implementations

mod admin;
mod crawl;
mod init;
mod search;
mod stats;

pub use admin::handle_admin;
pub use crawl::{crawl, crawl_index, rank};
pub use init::init_config;
pub use search::search;
pub use stats::{dead_letters, show_stats};
