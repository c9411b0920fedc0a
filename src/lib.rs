//! USDC relayer for transfers that pair a guardian-signed message with a
//! burn/mint token bridge attestation.
//!
//! A [`job::JobHost`] routes each observed signed message to the
//! [`redeem::Redeemer`], which decodes the transfer, resolves the
//! destination token and native swap quote, waits for the attestation and
//! submits the redemption with a leased signer. Every message is tracked
//! as a [`relay::Relay`] record in SQLite.

pub mod attestation;
mod bindings;
pub mod chain;
pub mod cli;
pub mod config;
pub mod domain;
pub mod gateway;
pub mod guardian;
pub mod job;
pub mod metrics;
pub mod payload;
pub mod redeem;
pub mod relay;
pub mod signer;
pub mod vaa;

pub use config::setup_tracing;

#[cfg(test)]
pub(crate) mod test_utils;
