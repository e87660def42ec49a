//! In-process message pool and watermark store
//!
//! Same semantics as the Postgres implementations (dedupe keys, conditional
//! AM updates, monotonic watermark saves) without a database.

use async_trait::async_trait;
use eyre::Result;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use super::{MessagePool, WatermarkStore};
use crate::models::{AnchorProcessHeights, AuthMsgWrapper, SdpMsgWrapper, WatermarkName};
use crate::types::{AuthMsgProcessState, ChainKey, SdpMsgProcessState};

#[derive(Default)]
struct PoolInner {
    next_auth_id: i64,
    next_sdp_id: i64,
    auth_msgs: BTreeMap<i64, AuthMsgWrapper>,
    /// (domain, block height, tx id, index) -> auth message id
    ledger_index: HashMap<LedgerKey, i64>,
    sdp_msgs: BTreeMap<i64, SdpMsgWrapper>,
    sdp_by_auth: HashMap<i64, i64>,
}

#[derive(Default)]
pub struct MemoryMessagePool {
    inner: Mutex<PoolInner>,
}

impl MemoryMessagePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every SDP message, ordered by id
    pub fn sdp_msgs(&self) -> Vec<SdpMsgWrapper> {
        self.lock().sdp_msgs.values().cloned().collect()
    }

    /// Snapshot of every AM, ordered by id
    pub fn auth_msgs(&self) -> Vec<AuthMsgWrapper> {
        self.lock().auth_msgs.values().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

type LedgerKey = (String, u64, String, i32);

fn ledger_key(msg: &AuthMsgWrapper) -> LedgerKey {
    (
        msg.source.domain.clone(),
        msg.ledger.block_height,
        msg.ledger.tx_id.clone(),
        msg.ledger.index_in_block,
    )
}

fn receiver_matches(msg: &SdpMsgWrapper, receiver: &ChainKey) -> bool {
    msg.receiver_product.as_deref() == Some(receiver.product.as_str())
        && msg.receiver_blockchain_id.as_deref() == Some(receiver.blockchain_id.as_str())
}

#[async_trait]
impl MessagePool for MemoryMessagePool {
    async fn insert_auth_msg(&self, msg: &AuthMsgWrapper) -> Result<Option<i64>> {
        let mut inner = self.lock();
        let key = ledger_key(msg);
        if inner.ledger_index.contains_key(&key) {
            return Ok(None);
        }
        inner.next_auth_id += 1;
        let id = inner.next_auth_id;
        let mut stored = msg.clone();
        stored.id = id;
        inner.auth_msgs.insert(id, stored);
        inner.ledger_index.insert(key, id);
        Ok(Some(id))
    }

    async fn get_auth_msg(&self, id: i64) -> Result<Option<AuthMsgWrapper>> {
        Ok(self.lock().auth_msgs.get(&id).cloned())
    }

    async fn find_auth_msg(&self, msg: &AuthMsgWrapper) -> Result<Option<AuthMsgWrapper>> {
        let inner = self.lock();
        let key = ledger_key(msg);
        Ok(inner
            .ledger_index
            .get(&key)
            .and_then(|id| inner.auth_msgs.get(id))
            .cloned())
    }

    async fn peek_pending_auth_msgs(&self, source: &ChainKey, limit: i64) -> Result<Vec<AuthMsgWrapper>> {
        Ok(self
            .lock()
            .auth_msgs
            .values()
            .filter(|m| m.process_state == AuthMsgProcessState::Pending && m.is_local)
            .filter(|m| m.source.chain().as_ref() == Some(source))
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn peek_pending_remote_auth_msgs(&self, limit: i64) -> Result<Vec<AuthMsgWrapper>> {
        Ok(self
            .lock()
            .auth_msgs
            .values()
            .filter(|m| m.process_state == AuthMsgProcessState::Pending && !m.is_local)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn update_auth_msg(&self, msg: &AuthMsgWrapper) -> Result<bool> {
        let mut inner = self.lock();
        match inner.auth_msgs.get_mut(&msg.id) {
            Some(stored) if stored.process_state == AuthMsgProcessState::Pending => {
                stored.source = msg.source.clone();
                stored.process_state = msg.process_state;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn insert_sdp_msg(&self, msg: &SdpMsgWrapper) -> Result<i64> {
        let mut inner = self.lock();
        if let Some(&existing) = inner.sdp_by_auth.get(&msg.auth_msg_id) {
            return Ok(existing);
        }
        inner.next_sdp_id += 1;
        let id = inner.next_sdp_id;
        let mut stored = msg.clone();
        stored.id = id;
        inner.sdp_msgs.insert(id, stored);
        inner.sdp_by_auth.insert(msg.auth_msg_id, id);
        Ok(id)
    }

    async fn peek_sdp_msgs(
        &self,
        receiver: &ChainKey,
        state: SdpMsgProcessState,
        limit: i64,
    ) -> Result<Vec<SdpMsgWrapper>> {
        Ok(self
            .lock()
            .sdp_msgs
            .values()
            .filter(|m| m.process_state == state && receiver_matches(m, receiver))
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn count_sdp_msgs(&self, receiver: &ChainKey, state: SdpMsgProcessState) -> Result<i64> {
        Ok(self
            .lock()
            .sdp_msgs
            .values()
            .filter(|m| m.process_state == state && receiver_matches(m, receiver))
            .count() as i64)
    }

    async fn get_sdp_msg_with_lock(&self, id: i64) -> Result<Option<SdpMsgWrapper>> {
        Ok(self.lock().sdp_msgs.get(&id).cloned())
    }

    async fn update_sdp_msg(&self, msg: &SdpMsgWrapper) -> Result<()> {
        let mut inner = self.lock();
        if let Some(stored) = inner.sdp_msgs.get_mut(&msg.id) {
            *stored = msg.clone();
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryWatermarkStore {
    inner: Mutex<HashMap<(ChainKey, WatermarkName), u64>>,
}

impl MemoryWatermarkStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Height currently persisted, without going through a cache
    pub fn stored(&self, chain: &ChainKey, name: WatermarkName) -> Option<u64> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&(chain.clone(), name))
            .copied()
    }
}

#[async_trait]
impl WatermarkStore for MemoryWatermarkStore {
    async fn load(&self, chain: &ChainKey) -> Result<AnchorProcessHeights> {
        let inner = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut heights = AnchorProcessHeights::new(chain.clone());
        for ((c, name), height) in inner.iter() {
            if c == chain {
                heights.raise(*name, *height);
            }
        }
        Ok(heights)
    }

    async fn save(&self, chain: &ChainKey, name: WatermarkName, height: u64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let entry = inner.entry((chain.clone(), name)).or_insert(height);
        *entry = (*entry).max(height);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{auth_msg, sdp_msg};

    #[tokio::test]
    async fn test_auth_msg_dedupes_on_ledger_position() {
        let pool = MemoryMessagePool::new();
        let msg = auth_msg(&ChainKey::new("eth", "eth-1"), 10, 0);

        assert_eq!(pool.insert_auth_msg(&msg).await.unwrap(), Some(1));
        let mut again = msg.clone();
        again.correlation_id = "other".to_string();
        assert_eq!(pool.insert_auth_msg(&again).await.unwrap(), None);
        assert_eq!(pool.auth_msgs().len(), 1);
    }

    #[tokio::test]
    async fn test_update_auth_msg_only_from_pending() {
        let pool = MemoryMessagePool::new();
        let chain = ChainKey::new("eth", "eth-1");
        let id = pool.insert_auth_msg(&auth_msg(&chain, 1, 0)).await.unwrap().unwrap();
        let mut msg = pool.get_auth_msg(id).await.unwrap().unwrap();

        msg.process_state = AuthMsgProcessState::Proved;
        assert!(pool.update_auth_msg(&msg).await.unwrap());
        msg.process_state = AuthMsgProcessState::Rejected;
        assert!(!pool.update_auth_msg(&msg).await.unwrap());
        assert!(pool.peek_pending_auth_msgs(&chain, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remote_msgs_found_by_ledger_and_peeked_apart() {
        let pool = MemoryMessagePool::new();
        let chain = ChainKey::new("eth", "eth-1");
        pool.insert_auth_msg(&auth_msg(&chain, 1, 0)).await.unwrap();
        let mut remote = auth_msg(&chain, 2, 0);
        remote.is_local = false;
        let remote_id = pool.insert_auth_msg(&remote).await.unwrap().unwrap();

        let found = pool.find_auth_msg(&remote).await.unwrap().unwrap();
        assert_eq!(found.id, remote_id);
        assert!(pool.find_auth_msg(&auth_msg(&chain, 3, 0)).await.unwrap().is_none());

        let local: Vec<i64> = pool
            .peek_pending_auth_msgs(&chain, 10)
            .await
            .unwrap()
            .iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(local, vec![1]);
        let remote: Vec<i64> = pool
            .peek_pending_remote_auth_msgs(10)
            .await
            .unwrap()
            .iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(remote, vec![remote_id]);
    }

    #[tokio::test]
    async fn test_sdp_msg_dedupes_on_auth_msg() {
        let pool = MemoryMessagePool::new();
        let dest = ChainKey::new("eth", "eth-1");
        let msg = sdp_msg(7, 3, &dest);

        let first = pool.insert_sdp_msg(&msg).await.unwrap();
        let second = pool.insert_sdp_msg(&msg).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(pool.count_sdp_msgs(&dest, SdpMsgProcessState::Pending).await.unwrap(), 1);
        assert_eq!(
            pool.count_sdp_msgs(&ChainKey::new("eth", "other"), SdpMsgProcessState::Pending)
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_watermark_store_keeps_highest() {
        let store = MemoryWatermarkStore::new();
        let chain = ChainKey::new("eth", "eth-1");
        store.save(&chain, WatermarkName::Sync, 20).await.unwrap();
        store.save(&chain, WatermarkName::Sync, 15).await.unwrap();
        let heights = store.load(&chain).await.unwrap();
        assert_eq!(heights.sync(), 20);
        assert_eq!(heights.polling(), 0);
    }
}
