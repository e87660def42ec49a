//! Typed errors for conditions callers need to tell apart
//!
//! Everything else travels as `eyre::Report` with context attached via
//! `WrapErr`, the same way the rest of the relayer reports failures.

use thiserror::Error;

use crate::types::ChainKey;

#[derive(Error, Debug)]
pub enum RelayerError {
    /// A row carried a state value this relayer does not know how to handle
    #[error("{entity} {id} is in unexpected state '{state}'")]
    UnexpectedState {
        entity: &'static str,
        id: i64,
        state: String,
    },

    #[error("upper protocol {0} is not supported")]
    UnsupportedProtocol(u32),

    #[error("no chain client registered for {0}")]
    MissingChainClient(ChainKey),

    #[error("block queue for {chain} is full (capacity {capacity})")]
    BlockQueueFull { chain: ChainKey, capacity: usize },

    #[error("timed out waiting for cluster lock '{0}'")]
    LockTimeout(String),

    #[error("message {0} not found")]
    MessageNotFound(i64),
}

/// Errors raised while decoding AM envelopes and SDP bodies
#[derive(Error, Debug, PartialEq, Eq)]
pub enum CodecError {
    #[error("buffer too short: need {needed} bytes at offset {offset}, have {len}")]
    Truncated {
        offset: usize,
        needed: usize,
        len: usize,
    },

    #[error("unsupported {what} version {version}")]
    UnsupportedVersion { what: &'static str, version: u32 },

    #[error("unknown trust level {0}")]
    UnknownTrustLevel(u8),

    #[error("receiver domain is not valid utf-8")]
    InvalidDomain,

    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),
}
