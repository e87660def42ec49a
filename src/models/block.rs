use chrono::{DateTime, Utc};

use crate::types::ChainKey;

/// A raw authenticated message emitted by the AM contract in one transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrossChainMessage {
    pub tx_id: String,
    /// Position of the message inside its block, unique per block
    pub index_in_block: i32,
    pub raw_am: Vec<u8>,
}

/// A fetched block, immutable once produced by the sync stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub chain: ChainKey,
    pub height: u64,
    pub hash: String,
    pub timestamp: DateTime<Utc>,
    pub messages: Vec<CrossChainMessage>,
}

impl Block {
    pub fn empty(chain: ChainKey, height: u64) -> Self {
        Self {
            chain,
            height,
            hash: String::new(),
            timestamp: DateTime::<Utc>::UNIX_EPOCH,
            messages: Vec::new(),
        }
    }
}
