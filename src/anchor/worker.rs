use async_trait::async_trait;
use eyre::{Result, WrapErr};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::db::MessagePool;
use crate::metrics;
use crate::models::{AuthMsgWrapper, Block};

/// Something run against every block of one notify task type
#[async_trait]
pub trait BlockWorker: Send + Sync {
    fn name(&self) -> &str;

    /// Returns false (or an error) when the block has to be retried
    async fn process(&self, block: &Block) -> Result<bool>;
}

/// Extracts authenticated messages from a block into the message pool
pub struct CrossChainMessageWorker {
    domain: String,
    am_contract: Option<String>,
    pool: Arc<dyn MessagePool>,
}

impl CrossChainMessageWorker {
    pub fn new(domain: String, am_contract: Option<String>, pool: Arc<dyn MessagePool>) -> Self {
        Self {
            domain,
            am_contract,
            pool,
        }
    }
}

#[async_trait]
impl BlockWorker for CrossChainMessageWorker {
    fn name(&self) -> &str {
        "cross_chain_message"
    }

    async fn process(&self, block: &Block) -> Result<bool> {
        for msg in &block.messages {
            let mut am = match AuthMsgWrapper::from_block_message(block, &self.domain, msg) {
                Ok(am) => am,
                Err(e) => {
                    // Retrying the block would not make it decodable
                    warn!(
                        chain = %block.chain,
                        height = block.height,
                        tx_id = %msg.tx_id,
                        error = %e,
                        "Skipping undecodable authenticated message"
                    );
                    metrics::record_error(&block.chain.to_string(), "am_decode");
                    continue;
                }
            };
            am.source.am_client_contract = self.am_contract.clone();

            let inserted = self.pool.insert_auth_msg(&am).await.wrap_err_with(|| {
                format!(
                    "Failed to store AM from tx {} at height {} of {}",
                    msg.tx_id, block.height, block.chain
                )
            })?;

            match inserted {
                Some(id) => {
                    metrics::record_am_extracted(&block.chain);
                    info!(
                        chain = %block.chain,
                        height = block.height,
                        am_id = id,
                        correlation_id = %am.correlation_id,
                        "Authenticated message extracted"
                    );
                }
                None => debug!(
                    chain = %block.chain,
                    height = block.height,
                    tx_id = %msg.tx_id,
                    "Authenticated message already pooled"
                ),
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryMessagePool;
    use crate::models::CrossChainMessage;
    use crate::test_utils::{raw_am, sdp_body, RECEIVER, SENDER};
    use crate::types::ChainKey;

    fn block_with(raw: Vec<Vec<u8>>) -> Block {
        let mut block = Block::empty(ChainKey::new("eth", "eth-1"), 9);
        block.messages = raw
            .into_iter()
            .enumerate()
            .map(|(i, raw_am)| CrossChainMessage {
                tx_id: format!("0xtx{}", i),
                index_in_block: i as i32,
                raw_am,
            })
            .collect();
        block
    }

    #[tokio::test]
    async fn test_extracts_every_message() {
        let pool = Arc::new(MemoryMessagePool::new());
        let worker = CrossChainMessageWorker::new("eth.dom".to_string(), Some("0xam".to_string()), pool.clone());
        let am = raw_am(SENDER, sdp_body("b.dom", RECEIVER, 0));

        assert!(worker.process(&block_with(vec![am.clone(), am])).await.unwrap());

        let stored = pool.auth_msgs();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].source.domain, "eth.dom");
        assert_eq!(stored[0].source.am_client_contract.as_deref(), Some("0xam"));
        assert_eq!(stored[1].ledger.index_in_block, 1);
    }

    #[tokio::test]
    async fn test_rerun_does_not_duplicate() {
        let pool = Arc::new(MemoryMessagePool::new());
        let worker = CrossChainMessageWorker::new("eth.dom".to_string(), None, pool.clone());
        let block = block_with(vec![raw_am(SENDER, sdp_body("b.dom", RECEIVER, 0))]);

        worker.process(&block).await.unwrap();
        worker.process(&block).await.unwrap();
        assert_eq!(pool.auth_msgs().len(), 1);
    }

    #[tokio::test]
    async fn test_skips_undecodable_message() {
        let pool = Arc::new(MemoryMessagePool::new());
        let worker = CrossChainMessageWorker::new("eth.dom".to_string(), None, pool.clone());
        let block = block_with(vec![vec![0, 1], raw_am(SENDER, sdp_body("b.dom", RECEIVER, 0))]);

        assert!(worker.process(&block).await.unwrap());
        assert_eq!(pool.auth_msgs().len(), 1);
    }
}
