//! EVM chain interaction abstraction.
//!
//! This crate provides two traits for interacting with EVM chains:
//!
//! - [`Evm`] — read-only chain access with revert-decoded view calls
//!   and receipt lookups. [`ReadOnlyEvm`] wraps any provider.
//!
//! - [`Wallet`] — a signing identity that submits payable contract
//!   calls. Submission is split in two: [`Wallet::send`] returns once
//!   the transaction has its first confirmation, and
//!   [`Wallet::wait_for_confirmations`] waits for finality and reports
//!   gas. Callers persist the hash in between.
//!
//! Revert decoding is built into both paths so consumers can match on
//! human-readable reasons (e.g. "already consumed").

use std::sync::Arc;

use alloy::primitives::{Address, Bytes, TxHash, U256};
use alloy::providers::Provider;
use alloy::rpc::types::TransactionReceipt;
use async_trait::async_trait;

pub mod error_decoding;

#[cfg(feature = "local-signer")]
pub mod local;

/// Errors that can occur during EVM operations.
#[derive(Debug, thiserror::Error)]
pub enum EvmError {
    #[error("transaction error: {0}")]
    Transaction(#[from] alloy::providers::PendingTransactionError),
    #[error("transport error: {0}")]
    Transport(#[from] alloy::transports::TransportError),
    #[error("contract error: {0}")]
    Contract(#[from] alloy::contract::Error),
    #[error("execution reverted: {reason}")]
    DecodedRevert { reason: String },
    #[error("transaction reverted: {tx_hash}")]
    Reverted { tx_hash: TxHash },
    #[error("invalid private key: {0}")]
    InvalidPrivateKey(#[from] alloy::signers::k256::ecdsa::Error),
}

impl EvmError {
    /// Decoded revert reason, when the failure was a contract revert
    /// whose reason could be recovered.
    pub fn revert_reason(&self) -> Option<&str> {
        match self {
            Self::DecodedRevert { reason } => Some(reason),
            _ => None,
        }
    }
}

/// Gas accounting for a confirmed transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxSummary {
    pub tx_hash: TxHash,
    pub gas_used: u64,
    pub effective_gas_price: u128,
}

impl From<&TransactionReceipt> for TxSummary {
    fn from(receipt: &TransactionReceipt) -> Self {
        Self {
            tx_hash: receipt.transaction_hash,
            gas_used: receipt.gas_used,
            effective_gas_price: receipt.effective_gas_price,
        }
    }
}

/// Read-only EVM chain access with error-decoded view calls.
///
/// Implementations only need to supply the provider; `call` and
/// `transaction_receipt` have default implementations.
#[async_trait]
pub trait Evm: Send + Sync + 'static {
    /// The provider type used for chain access.
    type Provider: Provider + Clone + Send + Sync;

    /// Returns the underlying provider for direct chain queries.
    fn provider(&self) -> &Self::Provider;

    /// Execute a view call with automatic revert decoding.
    async fn call(&self, contract: Address, calldata: Bytes) -> Result<Bytes, EvmError> {
        let tx = alloy::rpc::types::TransactionRequest::default()
            .to(contract)
            .input(calldata.into());

        self.provider()
            .call(tx)
            .await
            .map_err(error_decoding::decode_transport_error)
    }

    /// Fetch a mined transaction's receipt, `None` if the node does not
    /// know the hash.
    async fn transaction_receipt(
        &self,
        tx_hash: TxHash,
    ) -> Result<Option<TransactionReceipt>, EvmError> {
        Ok(self.provider().get_transaction_receipt(tx_hash).await?)
    }
}

/// [`Evm`] over a plain provider, used for source-chain reads where no
/// signing identity is involved.
#[derive(Debug, Clone)]
pub struct ReadOnlyEvm<P> {
    provider: P,
}

impl<P> ReadOnlyEvm<P> {
    pub const fn new(provider: P) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl<P> Evm for ReadOnlyEvm<P>
where
    P: Provider + Clone + Send + Sync + 'static,
{
    type Provider = P;

    fn provider(&self) -> &P {
        &self.provider
    }
}

/// Signing wallet on an EVM chain.
///
/// The trait is object safe so that a pool of wallets for one chain can
/// hold `Arc<dyn Wallet>` regardless of how each key is managed.
#[async_trait]
pub trait Wallet: Send + Sync + 'static {
    /// Returns the address this wallet signs transactions from.
    fn address(&self) -> Address;

    /// Submit a signed contract call carrying `value` wei and wait for
    /// its first confirmation.
    ///
    /// - `contract` — target contract address
    /// - `calldata` — ABI-encoded function call
    /// - `note` — human-readable operation description, used for logging
    ///
    /// A revert during gas estimation surfaces as
    /// [`EvmError::DecodedRevert`] when the reason can be decoded.
    async fn send(
        &self,
        contract: Address,
        calldata: Bytes,
        value: U256,
        note: &str,
    ) -> Result<TxHash, EvmError>;

    /// Wait until `tx_hash` has `confirmations` confirmations and report
    /// its gas usage.
    async fn wait_for_confirmations(
        &self,
        tx_hash: TxHash,
        confirmations: u64,
    ) -> Result<TxSummary, EvmError>;
}

#[async_trait]
impl<T: Evm> Evm for Arc<T> {
    type Provider = T::Provider;

    fn provider(&self) -> &Self::Provider {
        (**self).provider()
    }

    async fn call(&self, contract: Address, calldata: Bytes) -> Result<Bytes, EvmError> {
        (**self).call(contract, calldata).await
    }

    async fn transaction_receipt(
        &self,
        tx_hash: TxHash,
    ) -> Result<Option<TransactionReceipt>, EvmError> {
        (**self).transaction_receipt(tx_hash).await
    }
}
