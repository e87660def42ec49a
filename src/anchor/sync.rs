use eyre::{eyre, Result, WrapErr};
use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info};

use super::heights::WatermarkCache;
use super::queue::BlockQueue;
use crate::chain::ChainClient;
use crate::config::AnchorConfig;
use crate::metrics;
use crate::models::{Block, WatermarkName};
use crate::types::{ChainKey, NotifyTaskType};

/// Fetches blocks between the `sync` and `polling` watermarks into the
/// block queue
pub struct BlockSyncTask {
    chain: ChainKey,
    client: Arc<dyn ChainClient>,
    heights: Arc<WatermarkCache>,
    queue: Arc<BlockQueue>,
    /// Shared by every chain's sync task
    fetch_pool: Arc<Semaphore>,
    config: AnchorConfig,
}

impl BlockSyncTask {
    pub fn new(
        chain: ChainKey,
        client: Arc<dyn ChainClient>,
        heights: Arc<WatermarkCache>,
        queue: Arc<BlockQueue>,
        fetch_pool: Arc<Semaphore>,
        config: AnchorConfig,
    ) -> Self {
        Self {
            chain,
            client,
            heights,
            queue,
            fetch_pool,
            config,
        }
    }

    pub async fn process(&self) -> Result<()> {
        let heights = self.heights.heights(&self.chain).await?;
        let sync = heights.sync();
        let polling = heights.polling();
        if sync >= polling {
            return Ok(());
        }

        // Sync may not run further ahead of the slowest consumer than this
        let ceiling = heights.notify(NotifyTaskType::CrossChainMessage)
            + self.config.max_diff_between_sync_and_notify;
        if sync >= ceiling {
            debug!(
                chain = %self.chain,
                sync,
                ceiling,
                "Sync is too far ahead of notify, waiting"
            );
            return Ok(());
        }

        let end = polling
            .min(sync + self.config.sync_batch_size)
            .min(ceiling);

        let mut start = sync + 1;
        while start <= end {
            let batch_end = (start + self.config.sync_async_query_size - 1).min(end);
            let blocks = self.fetch_range(start, batch_end).await?;
            let count = blocks.len();

            self.queue.put_blocks(blocks)?;
            self.heights
                .raise(&self.chain, WatermarkName::Sync, batch_end)
                .await?;
            metrics::record_blocks_synced(&self.chain, count);
            debug!(chain = %self.chain, from = start, to = batch_end, "Blocks queued");

            start = batch_end + 1;
        }

        info!(chain = %self.chain, sync = end, polling, "Sync pass complete");
        Ok(())
    }

    /// Fetch `[start, end]` concurrently. Fails as a whole if any height fails.
    async fn fetch_range(&self, start: u64, end: u64) -> Result<Vec<Block>> {
        let results = join_all((start..=end).map(|h| self.fetch_one(h))).await;
        results
            .into_iter()
            .collect::<Result<Vec<_>>>()
            .wrap_err_with(|| format!("Failed to sync blocks {}..={} of {}", start, end, self.chain))
    }

    async fn fetch_one(&self, height: u64) -> Result<Block> {
        let _permit = self
            .fetch_pool
            .acquire()
            .await
            .wrap_err("Block fetch pool closed")?;

        let block = tokio::time::timeout(
            self.config.block_fetch_timeout(),
            self.client.block_at_height(height),
        )
        .await
        .map_err(|_| eyre!("Timed out fetching block {} of {}", height, self.chain))??;

        if block.height != height || block.chain != self.chain {
            return Err(eyre!(
                "Chain client returned block {} of {} for height {} of {}",
                block.height,
                block.chain,
                height,
                self.chain
            ));
        }
        Ok(block)
    }
}
