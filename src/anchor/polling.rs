use eyre::{Result, WrapErr};
use std::sync::Arc;
use tracing::debug;

use super::heights::WatermarkCache;
use crate::chain::ChainClient;
use crate::models::WatermarkName;
use crate::types::ChainKey;

/// Records the remote chain's current height as the `polling` watermark
pub struct BlockPollingTask {
    chain: ChainKey,
    client: Arc<dyn ChainClient>,
    heights: Arc<WatermarkCache>,
}

impl BlockPollingTask {
    pub fn new(chain: ChainKey, client: Arc<dyn ChainClient>, heights: Arc<WatermarkCache>) -> Self {
        Self {
            chain,
            client,
            heights,
        }
    }

    pub async fn process(&self) -> Result<()> {
        let height = self
            .client
            .last_block_height()
            .await
            .wrap_err_with(|| format!("Failed to query latest height of {}", self.chain))?;

        self.heights
            .raise(&self.chain, WatermarkName::Polling, height)
            .await?;
        debug!(chain = %self.chain, height, "Polled remote height");
        Ok(())
    }
}
