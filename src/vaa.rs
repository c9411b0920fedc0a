//! Signed message envelope as propagated by the guardian network.
//!
//! Only the fields the relayer needs are decoded; guardian signatures are
//! skipped, not verified.

use std::fmt;

use alloy::primitives::{B256, Bytes};
use serde::{Deserialize, Serialize};

use crate::chain::ChainId;

const HEADER_LEN: usize = 6;
const SIGNATURE_LEN: usize = 66;
const BODY_FIXED_LEN: usize = 51;

/// Unique identity of a signed message and the key of its relay record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId {
    pub emitter_chain: ChainId,
    pub emitter_address: B256,
    pub sequence: u64,
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.emitter_chain, self.emitter_address, self.sequence
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VaaError {
    #[error("signed message truncated: need {needed} bytes, got {actual}")]
    Truncated { needed: usize, actual: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedMessage {
    pub version: u8,
    pub guardian_set_index: u32,
    pub timestamp: u32,
    pub nonce: u32,
    pub id: MessageId,
    pub consistency_level: u8,
    pub payload: Bytes,
    /// The full envelope, forwarded verbatim to `redeemTokens`.
    pub raw: Bytes,
}

impl SignedMessage {
    pub fn parse(raw: &[u8]) -> Result<Self, VaaError> {
        let truncated = |needed| VaaError::Truncated {
            needed,
            actual: raw.len(),
        };

        if raw.len() < HEADER_LEN {
            return Err(truncated(HEADER_LEN));
        }

        let signatures = usize::from(raw[5]);
        let body = HEADER_LEN + signatures * SIGNATURE_LEN;
        if raw.len() < body + BODY_FIXED_LEN {
            return Err(truncated(body + BODY_FIXED_LEN));
        }

        let be_u32 = |at: usize| u32::from_be_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]]);

        let mut sequence = [0u8; 8];
        sequence.copy_from_slice(&raw[body + 42..body + 50]);

        Ok(Self {
            version: raw[0],
            guardian_set_index: be_u32(1),
            timestamp: be_u32(body),
            nonce: be_u32(body + 4),
            id: MessageId {
                emitter_chain: ChainId(u16::from_be_bytes([raw[body + 8], raw[body + 9]])),
                emitter_address: B256::from_slice(&raw[body + 10..body + 42]),
                sequence: u64::from_be_bytes(sequence),
            },
            consistency_level: raw[body + 50],
            payload: Bytes::copy_from_slice(&raw[body + BODY_FIXED_LEN..]),
            raw: Bytes::copy_from_slice(raw),
        })
    }
}
