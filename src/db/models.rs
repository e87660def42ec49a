//! Row types for the message pool tables and their conversion to the
//! in-memory wrappers. State columns are plain VARCHAR, parsed here.

use chrono::{DateTime, Utc};
use sqlx::FromRow;

use crate::error::RelayerError;
use crate::models::{AuthMsgWrapper, LedgerInfo, MsgSource, SdpMsgWrapper};
use crate::types::{AuthMsgProcessState, Identity, SdpMsgProcessState, TrustLevel, UpperProtocol};

#[derive(Debug, Clone, FromRow)]
pub struct AuthMsgRow {
    pub id: i64,
    pub product: Option<String>,
    pub blockchain_id: Option<String>,
    pub domain: String,
    pub am_client_contract: Option<String>,
    pub correlation_id: String,
    pub version: i32,
    pub msg_sender: Vec<u8>,
    pub protocol_type: i32,
    pub trust_level: i16,
    pub payload: Vec<u8>,
    pub block_height: i64,
    pub block_hash: String,
    pub block_timestamp: DateTime<Utc>,
    pub tx_id: String,
    pub index_in_block: i32,
    pub capture_time: DateTime<Utc>,
    pub is_local: bool,
    pub process_state: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct SdpMsgRow {
    pub id: i64,
    pub auth_msg_id: i64,
    pub version: i32,
    pub msg_sequence: i64,
    pub sender_domain: String,
    pub sender_id: Vec<u8>,
    pub sender_product: Option<String>,
    pub sender_blockchain_id: Option<String>,
    pub receiver_domain: String,
    pub receiver_id: Vec<u8>,
    pub receiver_product: Option<String>,
    pub receiver_blockchain_id: Option<String>,
    pub receiver_contract: Option<String>,
    pub payload: Vec<u8>,
    pub process_state: String,
    pub tx_hash: Option<String>,
    pub tx_success: Option<bool>,
    pub fail_reason: Option<String>,
}

fn unexpected(entity: &'static str, id: i64, state: impl Into<String>) -> RelayerError {
    RelayerError::UnexpectedState {
        entity,
        id,
        state: state.into(),
    }
}

fn identity(entity: &'static str, id: i64, raw: &[u8]) -> Result<Identity, RelayerError> {
    Identity::from_slice(raw).ok_or_else(|| unexpected(entity, id, format!("identity of {} bytes", raw.len())))
}

impl TryFrom<AuthMsgRow> for AuthMsgWrapper {
    type Error = RelayerError;

    fn try_from(row: AuthMsgRow) -> Result<Self, Self::Error> {
        let process_state = AuthMsgProcessState::parse(&row.process_state)
            .ok_or_else(|| unexpected("auth message", row.id, &row.process_state))?;
        let trust_level = TrustLevel::from_u8(row.trust_level as u8)
            .ok_or_else(|| unexpected("auth message", row.id, format!("trust level {}", row.trust_level)))?;

        Ok(AuthMsgWrapper {
            id: row.id,
            source: MsgSource {
                product: row.product,
                blockchain_id: row.blockchain_id,
                domain: row.domain,
                am_client_contract: row.am_client_contract,
            },
            correlation_id: row.correlation_id,
            version: row.version as u32,
            sender: identity("auth message", row.id, &row.msg_sender)?,
            protocol: UpperProtocol::from_u32(row.protocol_type as u32),
            trust_level,
            payload: row.payload,
            ledger: LedgerInfo {
                block_height: row.block_height as u64,
                block_hash: row.block_hash,
                block_timestamp: row.block_timestamp,
                tx_id: row.tx_id,
                index_in_block: row.index_in_block,
                capture_time: row.capture_time,
            },
            is_local: row.is_local,
            process_state,
        })
    }
}

impl TryFrom<SdpMsgRow> for SdpMsgWrapper {
    type Error = RelayerError;

    fn try_from(row: SdpMsgRow) -> Result<Self, Self::Error> {
        let process_state = SdpMsgProcessState::parse(&row.process_state)
            .ok_or_else(|| unexpected("sdp message", row.id, &row.process_state))?;

        Ok(SdpMsgWrapper {
            id: row.id,
            auth_msg_id: row.auth_msg_id,
            version: row.version as u32,
            sequence: row.msg_sequence,
            sender_domain: row.sender_domain,
            sender: identity("sdp message", row.id, &row.sender_id)?,
            sender_product: row.sender_product,
            sender_blockchain_id: row.sender_blockchain_id,
            receiver_domain: row.receiver_domain,
            receiver: identity("sdp message", row.id, &row.receiver_id)?,
            receiver_product: row.receiver_product,
            receiver_blockchain_id: row.receiver_blockchain_id,
            receiver_contract: row.receiver_contract,
            payload: row.payload,
            process_state,
            tx_hash: row.tx_hash,
            tx_success: row.tx_success,
            fail_reason: row.fail_reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sdp_row(state: &str) -> SdpMsgRow {
        SdpMsgRow {
            id: 9,
            auth_msg_id: 3,
            version: 1,
            msg_sequence: 5,
            sender_domain: "a".to_string(),
            sender_id: vec![1u8; 32],
            sender_product: None,
            sender_blockchain_id: None,
            receiver_domain: "b".to_string(),
            receiver_id: vec![2u8; 32],
            receiver_product: Some("eth".to_string()),
            receiver_blockchain_id: Some("eth-1".to_string()),
            receiver_contract: None,
            payload: vec![],
            process_state: state.to_string(),
            tx_hash: None,
            tx_success: None,
            fail_reason: None,
        }
    }

    #[test]
    fn test_sdp_row_converts() {
        let msg = SdpMsgWrapper::try_from(sdp_row("TX_PENDING")).unwrap();
        assert_eq!(msg.process_state, SdpMsgProcessState::TxPending);
        assert_eq!(msg.sequence, 5);
    }

    #[test]
    fn test_unknown_state_is_contract_violation() {
        let err = SdpMsgWrapper::try_from(sdp_row("ARCHIVED")).unwrap_err();
        match err {
            RelayerError::UnexpectedState { entity, id, state } => {
                assert_eq!(entity, "sdp message");
                assert_eq!(id, 9);
                assert_eq!(state, "ARCHIVED");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_short_identity_rejected() {
        let mut row = sdp_row("PENDING");
        row.receiver_id = vec![0u8; 20];
        assert!(SdpMsgWrapper::try_from(row).is_err());
    }
}
