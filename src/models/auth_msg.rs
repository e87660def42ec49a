use chrono::{DateTime, Utc};
use rand::RngCore;

use crate::codec::AuthMessage;
use crate::error::CodecError;
use crate::models::block::{Block, CrossChainMessage};
use crate::types::{AuthMsgProcessState, ChainKey, Identity, TrustLevel, UpperProtocol};

/// Where an AM came from. Product, blockchain and contract are optional
/// because messages forwarded by peers may only carry the domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MsgSource {
    pub product: Option<String>,
    pub blockchain_id: Option<String>,
    pub domain: String,
    pub am_client_contract: Option<String>,
}

impl MsgSource {
    pub fn chain(&self) -> Option<ChainKey> {
        match (&self.product, &self.blockchain_id) {
            (Some(p), Some(b)) => Some(ChainKey::new(p.clone(), b.clone())),
            _ => None,
        }
    }
}

/// Ledger provenance of an AM
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerInfo {
    pub block_height: u64,
    pub block_hash: String,
    pub block_timestamp: DateTime<Utc>,
    pub tx_id: String,
    pub index_in_block: i32,
    pub capture_time: DateTime<Utc>,
}

/// One authenticated message in the pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthMsgWrapper {
    /// Zero until the row is inserted
    pub id: i64,
    pub source: MsgSource,
    pub correlation_id: String,
    pub version: u32,
    pub sender: Identity,
    pub protocol: UpperProtocol,
    pub trust_level: TrustLevel,
    pub payload: Vec<u8>,
    pub ledger: LedgerInfo,
    /// Extracted from a managed chain rather than received from a peer relayer
    pub is_local: bool,
    pub process_state: AuthMsgProcessState,
}

impl AuthMsgWrapper {
    /// Build a pending wrapper from a raw message found in `block`
    pub fn from_block_message(
        block: &Block,
        domain: &str,
        msg: &CrossChainMessage,
    ) -> Result<Self, CodecError> {
        let am = AuthMessage::decode(&msg.raw_am)?;
        Ok(Self {
            id: 0,
            source: MsgSource {
                product: Some(block.chain.product.clone()),
                blockchain_id: Some(block.chain.blockchain_id.clone()),
                domain: domain.to_string(),
                am_client_contract: None,
            },
            correlation_id: new_correlation_id(),
            version: am.version,
            sender: am.sender,
            protocol: am.protocol,
            trust_level: am.trust_level,
            payload: am.payload,
            ledger: LedgerInfo {
                block_height: block.height,
                block_hash: block.hash.clone(),
                block_timestamp: block.timestamp,
                tx_id: msg.tx_id.clone(),
                index_in_block: msg.index_in_block,
                capture_time: Utc::now(),
            },
            is_local: true,
            process_state: AuthMsgProcessState::Pending,
        })
    }

    /// Pending wrapper for an AM a peer relayer forwarded. Only the sender
    /// domain is known; the chain behind it belongs to the peer.
    pub fn from_remote(domain: &str, am: AuthMessage, ledger: LedgerInfo) -> Self {
        Self {
            id: 0,
            source: MsgSource {
                product: None,
                blockchain_id: None,
                domain: domain.to_string(),
                am_client_contract: None,
            },
            correlation_id: new_correlation_id(),
            version: am.version,
            sender: am.sender,
            protocol: am.protocol,
            trust_level: am.trust_level,
            payload: am.payload,
            ledger,
            is_local: false,
            process_state: AuthMsgProcessState::Pending,
        }
    }

    /// Re-encode the AM envelope for forwarding or submission
    pub fn to_auth_message(&self) -> AuthMessage {
        AuthMessage {
            version: self.version,
            sender: self.sender,
            protocol: self.protocol,
            trust_level: self.trust_level,
            payload: self.payload.clone(),
        }
    }
}

/// Fresh random id used to correlate log lines of one message across stages
pub fn new_correlation_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::AM_VERSION;

    #[test]
    fn test_from_block_message() {
        let am = AuthMessage {
            version: AM_VERSION,
            sender: Identity([3u8; 32]),
            protocol: UpperProtocol::Sdp,
            trust_level: TrustLevel::Positive,
            payload: vec![1, 2, 3],
        };
        let mut block = Block::empty(ChainKey::new("eth", "eth-1"), 42);
        block.hash = "0xabc".to_string();
        let msg = CrossChainMessage {
            tx_id: "0xtx".to_string(),
            index_in_block: 2,
            raw_am: am.encode(),
        };

        let wrapper = AuthMsgWrapper::from_block_message(&block, "eth.domain", &msg).unwrap();
        assert_eq!(wrapper.process_state, AuthMsgProcessState::Pending);
        assert_eq!(wrapper.ledger.block_height, 42);
        assert_eq!(wrapper.ledger.index_in_block, 2);
        assert_eq!(wrapper.source.chain(), Some(ChainKey::new("eth", "eth-1")));
        assert_eq!(wrapper.correlation_id.len(), 32);
        assert_eq!(wrapper.to_auth_message(), am);
    }

    #[test]
    fn test_correlation_ids_are_fresh() {
        assert_ne!(new_correlation_id(), new_correlation_id());
    }
}
