use crate::codec::{SdpMessage, UNORDERED_SEQUENCE};
use crate::models::auth_msg::AuthMsgWrapper;
use crate::types::{ChainKey, Identity, SdpMsgProcessState};

const UNORDERED_PREFIX: &str = "UNORDERED-";

/// A decoded SDP message on its way to the destination chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpMsgWrapper {
    /// Zero until the row is inserted
    pub id: i64,
    pub auth_msg_id: i64,
    pub version: u32,
    /// `UNORDERED_SEQUENCE` for unordered messages
    pub sequence: i64,
    pub sender_domain: String,
    pub sender: Identity,
    pub sender_product: Option<String>,
    pub sender_blockchain_id: Option<String>,
    pub receiver_domain: String,
    pub receiver: Identity,
    pub receiver_product: Option<String>,
    pub receiver_blockchain_id: Option<String>,
    pub receiver_contract: Option<String>,
    pub payload: Vec<u8>,
    pub process_state: SdpMsgProcessState,
    pub tx_hash: Option<String>,
    pub tx_success: Option<bool>,
    pub fail_reason: Option<String>,
}

impl SdpMsgWrapper {
    /// Pending wrapper for `sdp` carried by `am`; receiver chain unresolved
    pub fn new(am: &AuthMsgWrapper, sdp: SdpMessage) -> Self {
        Self {
            id: 0,
            auth_msg_id: am.id,
            version: sdp.version,
            sequence: sdp.sequence,
            sender_domain: am.source.domain.clone(),
            sender: am.sender,
            sender_product: am.source.product.clone(),
            sender_blockchain_id: am.source.blockchain_id.clone(),
            receiver_domain: sdp.receiver_domain,
            receiver: sdp.receiver,
            receiver_product: None,
            receiver_blockchain_id: None,
            receiver_contract: None,
            payload: sdp.message,
            process_state: SdpMsgProcessState::Pending,
            tx_hash: None,
            tx_success: None,
            fail_reason: None,
        }
    }

    pub fn is_unordered(&self) -> bool {
        self.sequence == UNORDERED_SEQUENCE
    }

    /// Ordering scope: `senderDomain.senderId:receiverDomain.receiverId`
    pub fn session_key(&self) -> String {
        let key = format!(
            "{}.{}:{}.{}",
            self.sender_domain,
            self.sender.to_hex(),
            self.receiver_domain,
            self.receiver.to_hex()
        );
        if self.is_unordered() {
            format!("{}{}", UNORDERED_PREFIX, key)
        } else {
            key
        }
    }

    /// Destination chain, once resolved as locally served
    pub fn receiver_chain(&self) -> Option<ChainKey> {
        match (&self.receiver_product, &self.receiver_blockchain_id) {
            (Some(p), Some(b)) => Some(ChainKey::new(p.clone(), b.clone())),
            _ => None,
        }
    }

    pub fn is_self_call(&self) -> bool {
        self.sender_domain == self.receiver_domain && self.sender == self.receiver
    }

    /// Re-encode the SDP body
    pub fn to_sdp_message(&self) -> SdpMessage {
        SdpMessage {
            version: self.version,
            receiver_domain: self.receiver_domain.clone(),
            receiver: self.receiver,
            sequence: self.sequence,
            message: self.payload.clone(),
        }
    }

    pub fn set_terminal(&mut self, state: SdpMsgProcessState, reason: &str) {
        self.process_state = state;
        self.fail_reason = Some(reason.to_string());
    }
}

/// True for session keys built from unordered messages
pub fn is_unordered_session(key: &str) -> bool {
    key.starts_with(UNORDERED_PREFIX)
}
