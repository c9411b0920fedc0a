//! Wire codec for transfer messages and their relay sub-payload.
//!
//! Transfer payload layout (big-endian integers):
//!
//! | offset | size | field          |
//! |--------|------|----------------|
//! | 0      | 1    | version        |
//! | 1      | 32   | burn token     |
//! | 33     | 32   | amount         |
//! | 65     | 4    | source domain  |
//! | 69     | 4    | target domain  |
//! | 73     | 8    | nonce          |
//! | 81     | 32   | sender         |
//! | 113    | 32   | mint recipient |
//! | 145    | 2    | payload length |
//! | 147    | n    | payload        |
//!
//! Relay payload: payload id (1), fee amount (32), to-native amount (32),
//! recipient wallet (32).

use alloy::primitives::{Address, B256, Bytes, U256};
use tracing::trace;

use crate::chain::ChainId;
use crate::domain::DomainRegistry;

const VERSION_INDEX: usize = 0;
const TOKEN_INDEX: usize = 1;
const AMOUNT_INDEX: usize = 33;
const SOURCE_DOMAIN_INDEX: usize = 65;
const TARGET_DOMAIN_INDEX: usize = 69;
const NONCE_INDEX: usize = 73;
const SENDER_INDEX: usize = 81;
const MINT_RECIPIENT_INDEX: usize = 113;
const PAYLOAD_LEN_INDEX: usize = 145;
pub(crate) const TRANSFER_HEADER_LEN: usize = 147;

const PAYLOAD_ID_INDEX: usize = 0;
const FEE_INDEX: usize = 1;
const TO_NATIVE_INDEX: usize = 33;
const RECIPIENT_INDEX: usize = 65;
pub(crate) const RELAY_PAYLOAD_LEN: usize = 97;

/// The only relay payload id this relayer understands: transfer with relay.
pub const TRANSFER_WITH_RELAY: u8 = 1;

/// Every variant is terminal: malformed bytes never become valid on retry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("{what} truncated: need {needed} bytes, got {actual}")]
    Truncated {
        what: &'static str,
        needed: usize,
        actual: usize,
    },
    #[error("unknown token-bridge domain {0}")]
    UnknownDomain(u32),
    #[error("unsupported relay payload id {0}")]
    UnsupportedPayloadId(u8),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferPayload {
    pub version: u8,
    pub burn_token: B256,
    pub amount: U256,
    pub source_domain: u32,
    pub target_domain: u32,
    pub source_chain: ChainId,
    pub target_chain: ChainId,
    pub nonce: u64,
    pub sender: Address,
    pub mint_recipient: Address,
    pub payload: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayPayload {
    pub payload_id: u8,
    pub fee_amount: U256,
    pub to_native_amount: U256,
    pub recipient_wallet: Address,
}

fn word(bytes: &[u8], at: usize) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes[at..at + 32]);
    out
}

fn be_u32(bytes: &[u8], at: usize) -> u32 {
    let mut out = [0u8; 4];
    out.copy_from_slice(&bytes[at..at + 4]);
    u32::from_be_bytes(out)
}

/// Chain-native address from a 32-byte word. Every supported chain is
/// EVM, so this is the low 20 bytes.
fn evm_address(word: [u8; 32]) -> Address {
    Address::from_word(B256::from(word))
}

fn ensure_len(what: &'static str, bytes: &[u8], needed: usize) -> Result<(), DecodeError> {
    if bytes.len() < needed {
        return Err(DecodeError::Truncated {
            what,
            needed,
            actual: bytes.len(),
        });
    }
    Ok(())
}

pub fn decode_transfer_payload(
    bytes: &[u8],
    domains: &DomainRegistry,
) -> Result<TransferPayload, DecodeError> {
    ensure_len("transfer payload", bytes, TRANSFER_HEADER_LEN)?;

    let source_domain = be_u32(bytes, SOURCE_DOMAIN_INDEX);
    let target_domain = be_u32(bytes, TARGET_DOMAIN_INDEX);

    let source_chain = domains
        .domain_to_chain(source_domain)
        .ok_or(DecodeError::UnknownDomain(source_domain))?;
    let target_chain = domains
        .domain_to_chain(target_domain)
        .ok_or(DecodeError::UnknownDomain(target_domain))?;

    let mut nonce = [0u8; 8];
    nonce.copy_from_slice(&bytes[NONCE_INDEX..NONCE_INDEX + 8]);

    let payload_len = usize::from(u16::from_be_bytes([
        bytes[PAYLOAD_LEN_INDEX],
        bytes[PAYLOAD_LEN_INDEX + 1],
    ]));
    ensure_len(
        "transfer payload",
        bytes,
        TRANSFER_HEADER_LEN + payload_len,
    )?;

    Ok(TransferPayload {
        version: bytes[VERSION_INDEX],
        burn_token: B256::from(word(bytes, TOKEN_INDEX)),
        amount: U256::from_be_bytes(word(bytes, AMOUNT_INDEX)),
        source_domain,
        target_domain,
        source_chain,
        target_chain,
        nonce: u64::from_be_bytes(nonce),
        sender: evm_address(word(bytes, SENDER_INDEX)),
        mint_recipient: evm_address(word(bytes, MINT_RECIPIENT_INDEX)),
        payload: Bytes::copy_from_slice(
            &bytes[TRANSFER_HEADER_LEN..TRANSFER_HEADER_LEN + payload_len],
        ),
    })
}

pub fn decode_relay_payload(
    bytes: &[u8],
    target_chain: ChainId,
) -> Result<RelayPayload, DecodeError> {
    ensure_len("relay payload", bytes, PAYLOAD_ID_INDEX + 1)?;

    let payload_id = bytes[PAYLOAD_ID_INDEX];
    if payload_id != TRANSFER_WITH_RELAY {
        return Err(DecodeError::UnsupportedPayloadId(payload_id));
    }

    ensure_len("relay payload", bytes, RELAY_PAYLOAD_LEN)?;

    let recipient_wallet = evm_address(word(bytes, RECIPIENT_INDEX));
    trace!(%target_chain, %recipient_wallet, "Decoded relay recipient");

    Ok(RelayPayload {
        payload_id,
        fee_amount: U256::from_be_bytes(word(bytes, FEE_INDEX)),
        to_native_amount: U256::from_be_bytes(word(bytes, TO_NATIVE_INDEX)),
        recipient_wallet,
    })
}

impl TransferPayload {
    /// Encodes with the embedded payload's length as the length field.
    /// Payloads longer than `u16::MAX` are truncated to fit.
    pub fn encode(&self) -> Vec<u8> {
        let payload_len = u16::try_from(self.payload.len()).unwrap_or(u16::MAX);

        let mut out = Vec::with_capacity(TRANSFER_HEADER_LEN + usize::from(payload_len));
        out.push(self.version);
        out.extend_from_slice(self.burn_token.as_slice());
        out.extend_from_slice(&self.amount.to_be_bytes::<32>());
        out.extend_from_slice(&self.source_domain.to_be_bytes());
        out.extend_from_slice(&self.target_domain.to_be_bytes());
        out.extend_from_slice(&self.nonce.to_be_bytes());
        out.extend_from_slice(self.sender.into_word().as_slice());
        out.extend_from_slice(self.mint_recipient.into_word().as_slice());
        out.extend_from_slice(&payload_len.to_be_bytes());
        out.extend_from_slice(&self.payload[..usize::from(payload_len)]);
        out
    }
}

impl RelayPayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(RELAY_PAYLOAD_LEN);
        out.push(self.payload_id);
        out.extend_from_slice(&self.fee_amount.to_be_bytes::<32>());
        out.extend_from_slice(&self.to_native_amount.to_be_bytes::<32>());
        out.extend_from_slice(self.recipient_wallet.into_word().as_slice());
        out
    }
}
