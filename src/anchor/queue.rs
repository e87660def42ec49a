use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::error::RelayerError;
use crate::metrics;
use crate::models::Block;
use crate::types::ChainKey;

/// Bounded, height-indexed hand-off from sync to notify for one chain
pub struct BlockQueue {
    chain: ChainKey,
    capacity: usize,
    blocks: Mutex<BTreeMap<u64, Arc<Block>>>,
}

impl BlockQueue {
    pub fn new(chain: ChainKey, capacity: usize) -> Self {
        Self {
            chain,
            capacity,
            blocks: Mutex::new(BTreeMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<u64, Arc<Block>>> {
        self.blocks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue a batch of blocks. Either all of them fit or none is queued.
    /// Heights already present are replaced.
    pub fn put_blocks(&self, blocks: Vec<Block>) -> Result<(), RelayerError> {
        let mut queue = self.lock();
        let new = blocks.iter().filter(|b| !queue.contains_key(&b.height)).count();
        if queue.len() + new > self.capacity {
            return Err(RelayerError::BlockQueueFull {
                chain: self.chain.clone(),
                capacity: self.capacity,
            });
        }
        for block in blocks {
            queue.insert(block.height, Arc::new(block));
        }
        metrics::set_block_queue_size(&self.chain, queue.len());
        Ok(())
    }

    pub fn get(&self, height: u64) -> Option<Arc<Block>> {
        self.lock().get(&height).cloned()
    }

    /// Drop every block at or below `height`
    pub fn prune_through(&self, height: u64) {
        let mut queue = self.lock();
        *queue = match height.checked_add(1) {
            Some(next) => queue.split_off(&next),
            None => BTreeMap::new(),
        };
        metrics::set_block_queue_size(&self.chain, queue.len());
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
