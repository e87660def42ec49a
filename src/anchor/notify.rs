use eyre::{eyre, Result, WrapErr};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

use super::heights::WatermarkCache;
use super::queue::BlockQueue;
use super::worker::BlockWorker;
use crate::chain::ChainClient;
use crate::models::{Block, WatermarkName};
use crate::types::{ChainKey, NotifyTaskType};

/// Runs the registered workers of each task type over synced blocks, in
/// height order, advancing that type's watermark one fully processed
/// height at a time
pub struct BlockNotifyTask {
    chain: ChainKey,
    client: Arc<dyn ChainClient>,
    heights: Arc<WatermarkCache>,
    queue: Arc<BlockQueue>,
    workers: BTreeMap<NotifyTaskType, Vec<Arc<dyn BlockWorker>>>,
    notify_batch_size: u64,
}

impl BlockNotifyTask {
    pub fn new(
        chain: ChainKey,
        client: Arc<dyn ChainClient>,
        heights: Arc<WatermarkCache>,
        queue: Arc<BlockQueue>,
        notify_batch_size: u64,
    ) -> Self {
        Self {
            chain,
            client,
            heights,
            queue,
            workers: BTreeMap::new(),
            notify_batch_size,
        }
    }

    pub fn register(&mut self, task: NotifyTaskType, worker: Arc<dyn BlockWorker>) {
        self.workers.entry(task).or_default().push(worker);
    }

    /// Process every task type. A failing type does not hold back the others.
    pub async fn process(&self) -> Result<()> {
        let mut first_error = None;
        for (task, workers) in &self.workers {
            if let Err(e) = self.process_type(*task, workers).await {
                warn!(chain = %self.chain, task = %task, error = %e, "Notify batch stopped");
                first_error.get_or_insert(e);
            }
        }

        self.prune_queue().await?;

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn process_type(&self, task: NotifyTaskType, workers: &[Arc<dyn BlockWorker>]) -> Result<()> {
        let deployed = self
            .client
            .is_contract_deployed(task)
            .await
            .wrap_err_with(|| format!("Failed to check {} contract on {}", task, self.chain))?;
        if !deployed {
            debug!(chain = %self.chain, task = %task, "Contract not deployed yet, skipping");
            return Ok(());
        }

        let heights = self.heights.heights(&self.chain).await?;
        let current = heights.notify(task);
        let end = heights.sync().min(current + self.notify_batch_size);

        for height in current + 1..=end {
            let block = self.block_at(height).await?;
            for worker in workers {
                let ok = worker.process(&block).await.wrap_err_with(|| {
                    format!(
                        "Worker {} failed at height {} of {}",
                        worker.name(),
                        height,
                        self.chain
                    )
                })?;
                if !ok {
                    return Err(eyre!(
                        "Worker {} did not complete height {} of {}",
                        worker.name(),
                        height,
                        self.chain
                    ));
                }
            }
            self.heights
                .raise(&self.chain, WatermarkName::Notify(task), height)
                .await?;
        }

        if end > current {
            debug!(chain = %self.chain, task = %task, from = current + 1, to = end, "Notified blocks");
        }
        Ok(())
    }

    /// Queued block, or a fresh fetch when the queue no longer holds it
    /// (e.g. after a restart)
    async fn block_at(&self, height: u64) -> Result<Arc<Block>> {
        if let Some(block) = self.queue.get(height) {
            return Ok(block);
        }
        debug!(chain = %self.chain, height, "Block not queued, fetching from chain");
        let block = self
            .client
            .block_at_height(height)
            .await
            .wrap_err_with(|| format!("Block {} of {} unavailable for notify", height, self.chain))?;
        if block.height != height {
            return Err(eyre!(
                "Chain client returned block {} for height {} of {}",
                block.height,
                height,
                self.chain
            ));
        }
        Ok(Arc::new(block))
    }

    /// Blocks every task type has gone past are no longer needed
    async fn prune_queue(&self) -> Result<()> {
        let heights = self.heights.heights(&self.chain).await?;
        if let Some(floor) = self.workers.keys().map(|t| heights.notify(*t)).min() {
            self.queue.prune_through(floor);
        }
        Ok(())
    }
}
