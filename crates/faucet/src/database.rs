//! Faucet database: one sled instance holding the queue and the rate limit records

use crate::error::FaucetResult;
use crate::queue::DurableQueue;
use crate::rate_limit::RateLimiter;
use sled::Db;
use tracing::info;

const QUEUE_TREE: &str = "faucet_queue";
const RATE_LIMIT_TREE: &str = "rate_limit";

/// Faucet database
#[derive(Clone)]
pub struct FaucetDatabase {
    db: Db,
}

impl FaucetDatabase {
    /// Create or open faucet database
    pub fn open(path: &str) -> FaucetResult<Self> {
        info!("Opening faucet database at: {}", path);

        let db = sled::Config::default()
            .path(path)
            .cache_capacity(64 * 1024 * 1024) // 64MB cache
            .open()?;

        Ok(Self { db })
    }

    /// Throwaway database removed on drop, for tests and dry runs
    pub fn temporary() -> FaucetResult<Self> {
        let db = sled::Config::default().temporary(true).open()?;
        Ok(Self { db })
    }

    /// Pending recipients
    pub fn queue(&self) -> FaucetResult<DurableQueue> {
        let tree = self.db.open_tree(QUEUE_TREE)?;
        Ok(DurableQueue::new(self.db.clone(), tree))
    }

    /// Per-client request counters
    pub fn rate_limiter(&self) -> FaucetResult<RateLimiter> {
        let tree = self.db.open_tree(RATE_LIMIT_TREE)?;
        Ok(RateLimiter::new(tree))
    }

    /// Flush everything to disk
    pub async fn flush(&self) -> FaucetResult<usize> {
        Ok(self.db.flush_async().await?)
    }
}
