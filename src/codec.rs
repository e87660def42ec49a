//! Wire codec for authenticated messages and SDP bodies
//!
//! Both formats are big-endian and length-prefixed:
//!
//! ```text
//! AM:  version:u32 | sender:32 | protocol:u32 | trust:u8 | len:u32 | payload
//! SDP: version:u32 | len:u32 | receiver_domain | receiver:32 | sequence:u32 | len:u32 | message
//! PKG: len:u32 | sender_domain | AM
//! ```
//!
//! An SDP sequence of `u32::MAX` on the wire means "unordered" and maps to
//! [`UNORDERED_SEQUENCE`] in memory.

use crate::error::CodecError;
use crate::types::{Identity, TrustLevel, UpperProtocol};

pub const AM_VERSION: u32 = 2;
pub const SDP_VERSION: u32 = 1;

/// In-memory sentinel for SDP messages without ordering constraints
pub const UNORDERED_SEQUENCE: i64 = -1;

const WIRE_UNORDERED: u32 = u32::MAX;

/// Decoded authenticated-message envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthMessage {
    pub version: u32,
    pub sender: Identity,
    pub protocol: UpperProtocol,
    pub trust_level: TrustLevel,
    pub payload: Vec<u8>,
}

impl AuthMessage {
    pub fn decode(raw: &[u8]) -> Result<Self, CodecError> {
        let mut r = Reader::new(raw);
        let version = r.u32()?;
        if version != AM_VERSION {
            return Err(CodecError::UnsupportedVersion {
                what: "AM",
                version,
            });
        }
        let sender = r.identity()?;
        let protocol = UpperProtocol::from_u32(r.u32()?);
        let trust = r.u8()?;
        let trust_level = TrustLevel::from_u8(trust).ok_or(CodecError::UnknownTrustLevel(trust))?;
        let payload = r.prefixed()?.to_vec();
        r.finish()?;

        Ok(Self {
            version,
            sender,
            protocol,
            trust_level,
            payload,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(45 + self.payload.len());
        out.extend_from_slice(&self.version.to_be_bytes());
        out.extend_from_slice(&self.sender.0);
        out.extend_from_slice(&self.protocol.to_u32().to_be_bytes());
        out.push(self.trust_level.to_u8());
        put_prefixed(&mut out, &self.payload);
        out
    }
}

/// Decoded SDP body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpMessage {
    pub version: u32,
    pub receiver_domain: String,
    pub receiver: Identity,
    /// `UNORDERED_SEQUENCE` when the sender asked for unordered delivery
    pub sequence: i64,
    pub message: Vec<u8>,
}

impl SdpMessage {
    pub fn decode(raw: &[u8]) -> Result<Self, CodecError> {
        let mut r = Reader::new(raw);
        let version = r.u32()?;
        if version != SDP_VERSION {
            return Err(CodecError::UnsupportedVersion {
                what: "SDP",
                version,
            });
        }
        let receiver_domain = std::str::from_utf8(r.prefixed()?)
            .map_err(|_| CodecError::InvalidDomain)?
            .to_string();
        let receiver = r.identity()?;
        let sequence = match r.u32()? {
            WIRE_UNORDERED => UNORDERED_SEQUENCE,
            seq => seq as i64,
        };
        let message = r.prefixed()?.to_vec();
        r.finish()?;

        Ok(Self {
            version,
            receiver_domain,
            receiver,
            sequence,
            message,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(48 + self.receiver_domain.len() + self.message.len());
        out.extend_from_slice(&self.version.to_be_bytes());
        put_prefixed(&mut out, self.receiver_domain.as_bytes());
        out.extend_from_slice(&self.receiver.0);
        let seq = if self.sequence < 0 {
            WIRE_UNORDERED
        } else {
            self.sequence as u32
        };
        out.extend_from_slice(&seq.to_be_bytes());
        put_prefixed(&mut out, &self.message);
        out
    }

    pub fn is_unordered(&self) -> bool {
        self.sequence == UNORDERED_SEQUENCE
    }
}

/// What gets submitted to a destination chain: the sender domain the AM was
/// anchored under, followed by the AM envelope itself
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitPackage {
    pub sender_domain: String,
    pub am: AuthMessage,
}

impl CommitPackage {
    pub fn decode(raw: &[u8]) -> Result<Self, CodecError> {
        let mut r = Reader::new(raw);
        let sender_domain = std::str::from_utf8(r.prefixed()?)
            .map_err(|_| CodecError::InvalidDomain)?
            .to_string();
        let am = AuthMessage::decode(&raw[r.pos..])?;
        Ok(Self { sender_domain, am })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        put_prefixed(&mut out, self.sender_domain.as_bytes());
        out.extend_from_slice(&self.am.encode());
        out
    }
}

fn put_prefixed(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(bytes);
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.buf.len() - self.pos < n {
            return Err(CodecError::Truncated {
                offset: self.pos,
                needed: n,
                len: self.buf.len(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, CodecError> {
        let mut b = [0u8; 4];
        b.copy_from_slice(self.take(4)?);
        Ok(u32::from_be_bytes(b))
    }

    fn identity(&mut self) -> Result<Identity, CodecError> {
        let mut b = [0u8; 32];
        b.copy_from_slice(self.take(32)?);
        Ok(Identity(b))
    }

    fn prefixed(&mut self) -> Result<&'a [u8], CodecError> {
        let len = self.u32()? as usize;
        self.take(len)
    }

    fn finish(&self) -> Result<(), CodecError> {
        match self.buf.len() - self.pos {
            0 => Ok(()),
            n => Err(CodecError::TrailingBytes(n)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_sdp(sequence: i64) -> SdpMessage {
        SdpMessage {
            version: SDP_VERSION,
            receiver_domain: "chainb.domain".to_string(),
            receiver: Identity([7u8; 32]),
            sequence,
            message: b"hello".to_vec(),
        }
    }

    #[test]
    fn test_am_carries_sdp_payload() {
        let sdp = sample_sdp(3);
        let am = AuthMessage {
            version: AM_VERSION,
            sender: Identity([1u8; 32]),
            protocol: UpperProtocol::Sdp,
            trust_level: TrustLevel::Zero,
            payload: sdp.encode(),
        };

        let decoded = AuthMessage::decode(&am.encode()).unwrap();
        assert_eq!(decoded.protocol, UpperProtocol::Sdp);
        assert_eq!(SdpMessage::decode(&decoded.payload).unwrap(), sdp);
    }

    #[test]
    fn test_unordered_sentinel_on_wire() {
        let raw = sample_sdp(UNORDERED_SEQUENCE).encode();
        // version(4) + len(4) + domain(13) + receiver(32)
        assert_eq!(&raw[53..57], &[0xff, 0xff, 0xff, 0xff]);
        assert!(SdpMessage::decode(&raw).unwrap().is_unordered());
    }

    #[test]
    fn test_truncated_am_rejected() {
        let err = AuthMessage::decode(&[0, 0, 0, 2, 1, 2]).unwrap_err();
        assert!(matches!(err, CodecError::Truncated { offset: 4, .. }));
    }

    #[test]
    fn test_unknown_trust_level_rejected() {
        let mut raw = AuthMessage {
            version: AM_VERSION,
            sender: Identity([0u8; 32]),
            protocol: UpperProtocol::Sdp,
            trust_level: TrustLevel::Zero,
            payload: vec![],
        }
        .encode();
        raw[40] = 9;
        assert_eq!(
            AuthMessage::decode(&raw).unwrap_err(),
            CodecError::UnknownTrustLevel(9)
        );
    }

    #[test]
    fn test_sdp_wrong_version_and_trailing_bytes() {
        let mut raw = sample_sdp(1).encode();
        raw.push(0);
        assert_eq!(
            SdpMessage::decode(&raw).unwrap_err(),
            CodecError::TrailingBytes(1)
        );

        raw[3] = 9;
        assert!(matches!(
            SdpMessage::decode(&raw).unwrap_err(),
            CodecError::UnsupportedVersion { what: "SDP", version: 9 }
        ));
    }

    #[test]
    fn test_commit_package_keeps_sender_domain() {
        let am = AuthMessage {
            version: AM_VERSION,
            sender: Identity([4u8; 32]),
            protocol: UpperProtocol::Sdp,
            trust_level: TrustLevel::Zero,
            payload: sample_sdp(3).encode(),
        };
        let pkg = CommitPackage {
            sender_domain: "a.dom".to_string(),
            am: am.clone(),
        };
        let decoded = CommitPackage::decode(&pkg.encode()).unwrap();
        assert_eq!(decoded.sender_domain, "a.dom");
        assert_eq!(SdpMessage::decode(&decoded.am.payload).unwrap().sequence, 3);
        assert!(CommitPackage::decode(&am.encode()[..3]).is_err());
    }

    #[test]
    fn test_empty_receiver_domain_decodes() {
        let mut sdp = sample_sdp(0);
        sdp.receiver_domain = String::new();
        let decoded = SdpMessage::decode(&sdp.encode()).unwrap();
        assert!(decoded.receiver_domain.is_empty());
    }
}
