use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::cache::DEFAULT_CAPACITY;
use crate::upstream::DEFAULT_MAX_ATTEMPTS;

pub const FEEDER_GATEWAY: &str = "https://alpha-mainnet.starknet.io/feeder_gateway";

/// Index StarkNet state diffs into contracts, classes, proxies and storage writes.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Feeder gateway base url.
    #[arg(long, env = "STARK_INDEXER_GATEWAY", default_value = FEEDER_GATEWAY)]
    pub gateway: String,
    /// Path of the RocksDB database.
    #[arg(long, env = "STARK_INDEXER_DB", default_value = "db")]
    pub db: String,
    #[arg(long, default_value_t = 0)]
    pub start_block: u64,
    #[arg(long, default_value_t = 10_000)]
    pub end_block: u64,
    /// State updates fetched concurrently per batch.
    #[arg(long, default_value_t = 20)]
    pub concurrent_requests: usize,
    /// Attempts per gateway request before giving up.
    #[arg(long, default_value_t = DEFAULT_MAX_ATTEMPTS)]
    pub max_attempts: u32,
    /// Time-to-live of cached entities, in seconds.
    #[arg(long, default_value_t = 600)]
    pub cache_ttl_secs: u64,
    #[arg(long, default_value_t = DEFAULT_CAPACITY)]
    pub cache_capacity: u64,
    /// Seconds a store read for an address without a class is reused.
    #[arg(long, default_value_t = 5)]
    pub address_refresh_secs: u64,
    /// Directory receiving the storage diff `COPY` payloads of every block.
    #[arg(long, env = "STARK_INDEXER_COPY_DIR")]
    pub copy_dir: Option<PathBuf>,
}

impl Config {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn address_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.address_refresh_secs)
    }
}
