//! Common types shared across the anchor, processor and committer stages
//!
//! Process states are stored as VARCHAR and parsed back at the storage
//! boundary, so an unknown value surfaces as a typed error instead of a
//! decode failure deep inside sqlx.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies one managed blockchain: plugin product plus blockchain id
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChainKey {
    pub product: String,
    pub blockchain_id: String,
}

impl ChainKey {
    pub fn new(product: impl Into<String>, blockchain_id: impl Into<String>) -> Self {
        Self {
            product: product.into(),
            blockchain_id: blockchain_id.into(),
        }
    }
}

impl fmt::Display for ChainKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.product, self.blockchain_id)
    }
}

/// 32-byte cross-chain identity of a contract or account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identity(pub [u8; 32]);

impl Identity {
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    pub fn from_hex(s: &str) -> eyre::Result<Self> {
        let raw = hex::decode(s.trim_start_matches("0x"))?;
        Self::from_slice(&raw).ok_or_else(|| eyre::eyre!("identity must be 32 bytes, got {}", raw.len()))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Lifecycle of an extracted authenticated message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuthMsgProcessState {
    Pending,
    Proved,
    Rejected,
}

impl AuthMsgProcessState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMsgProcessState::Pending => "PENDING",
            AuthMsgProcessState::Proved => "PROVED",
            AuthMsgProcessState::Rejected => "REJECTED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(AuthMsgProcessState::Pending),
            "PROVED" => Some(AuthMsgProcessState::Proved),
            "REJECTED" => Some(AuthMsgProcessState::Rejected),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, AuthMsgProcessState::Pending)
    }
}

impl fmt::Display for AuthMsgProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a decoded SDP message on its way to the destination chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SdpMsgProcessState {
    Pending,
    MsgIllegal,
    MsgRejected,
    TxPending,
    TxSuccess,
    TxFailed,
}

impl SdpMsgProcessState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SdpMsgProcessState::Pending => "PENDING",
            SdpMsgProcessState::MsgIllegal => "MSG_ILLEGAL",
            SdpMsgProcessState::MsgRejected => "MSG_REJECTED",
            SdpMsgProcessState::TxPending => "TX_PENDING",
            SdpMsgProcessState::TxSuccess => "TX_SUCCESS",
            SdpMsgProcessState::TxFailed => "TX_FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(SdpMsgProcessState::Pending),
            "MSG_ILLEGAL" => Some(SdpMsgProcessState::MsgIllegal),
            "MSG_REJECTED" => Some(SdpMsgProcessState::MsgRejected),
            "TX_PENDING" => Some(SdpMsgProcessState::TxPending),
            "TX_SUCCESS" => Some(SdpMsgProcessState::TxSuccess),
            "TX_FAILED" => Some(SdpMsgProcessState::TxFailed),
            _ => None,
        }
    }
}

impl fmt::Display for SdpMsgProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Upper-layer protocol carried inside an AM payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UpperProtocol {
    Sdp,
    Other(u32),
}

impl UpperProtocol {
    pub fn from_u32(v: u32) -> Self {
        match v {
            0 => UpperProtocol::Sdp,
            other => UpperProtocol::Other(other),
        }
    }

    pub fn to_u32(&self) -> u32 {
        match self {
            UpperProtocol::Sdp => 0,
            UpperProtocol::Other(v) => *v,
        }
    }
}

/// Trust level the source chain attaches to an AM
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrustLevel {
    Zero,
    Positive,
    Negative,
}

impl TrustLevel {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(TrustLevel::Zero),
            1 => Some(TrustLevel::Positive),
            2 => Some(TrustLevel::Negative),
            _ => None,
        }
    }

    pub fn to_u8(&self) -> u8 {
        match self {
            TrustLevel::Zero => 0,
            TrustLevel::Positive => 1,
            TrustLevel::Negative => 2,
        }
    }
}

/// Contract kinds a notify worker can be registered for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum NotifyTaskType {
    /// Authenticated-message contract events
    CrossChainMessage,
}

impl NotifyTaskType {
    pub const ALL: [NotifyTaskType; 1] = [NotifyTaskType::CrossChainMessage];

    pub fn as_str(&self) -> &'static str {
        match self {
            NotifyTaskType::CrossChainMessage => "ccmsg",
        }
    }
}

impl fmt::Display for NotifyTaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
