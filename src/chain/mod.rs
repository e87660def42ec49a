//! Chain client seam
//!
//! Every chain-specific operation the pipeline needs goes through
//! [`ChainClient`]. The relayer ships one adapter, [`HttpChainClient`],
//! which speaks JSON-RPC to a chain plugin sidecar.

use async_trait::async_trait;
use eyre::Result;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::RelayerError;
use crate::models::Block;
use crate::types::{ChainKey, Identity, NotifyTaskType};

pub mod http;

pub use http::HttpChainClient;

/// Outcome of submitting a package to a destination chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitReceipt {
    pub tx_id: String,
    /// False while the transaction is not yet final
    pub confirmed: bool,
    pub success: bool,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    Pending,
    Success,
    Failed,
}

/// Final or interim state of a previously submitted transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxResult {
    pub status: TxStatus,
    pub error_message: Option<String>,
}

#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn last_block_height(&self) -> Result<u64>;

    async fn block_at_height(&self, height: u64) -> Result<Block>;

    async fn is_contract_deployed(&self, task: NotifyTaskType) -> Result<bool>;

    async fn submit_package(&self, package: &[u8]) -> Result<SubmitReceipt>;

    /// Next sequence the receiving contract expects for this session
    async fn query_on_chain_sequence(
        &self,
        sender_domain: &str,
        sender: &Identity,
        receiver_domain: &str,
        receiver: &Identity,
    ) -> Result<i64>;

    async fn query_tx_result(&self, tx_id: &str) -> Result<TxResult>;
}

/// Chain clients keyed by managed chain
#[derive(Clone, Default)]
pub struct ChainClientRegistry {
    clients: HashMap<ChainKey, Arc<dyn ChainClient>>,
}

impl ChainClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, chain: ChainKey, client: Arc<dyn ChainClient>) {
        self.clients.insert(chain, client);
    }

    pub fn get(&self, chain: &ChainKey) -> Result<Arc<dyn ChainClient>, RelayerError> {
        self.clients
            .get(chain)
            .cloned()
            .ok_or_else(|| RelayerError::MissingChainClient(chain.clone()))
    }

    pub fn chains(&self) -> impl Iterator<Item = &ChainKey> {
        self.clients.keys()
    }
}
