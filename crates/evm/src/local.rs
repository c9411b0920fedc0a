//! Local private-key signer.
//!
//! `RawPrivateKeyWallet` wraps an alloy provider with an embedded
//! `EthereumWallet` and submits transactions directly through it.

use alloy::network::EthereumWallet;
use alloy::primitives::{Address, B256, Bytes, TxHash, U256};
use alloy::providers::{PendingTransactionBuilder, Provider, ProviderBuilder, WalletProvider};
use alloy::signers::local::PrivateKeySigner;
use async_trait::async_trait;
use tracing::{debug, info};
use url::Url;

use crate::error_decoding::decode_transport_error;
use crate::{Evm, EvmError, TxSummary, Wallet};

/// Local wallet that signs and submits transactions directly.
///
/// Wraps a provider that includes a wallet filler (e.g., built with
/// `ProviderBuilder::new().wallet(wallet).connect_http(...)`). The wallet
/// address is derived from the provider's default signer.
pub struct RawPrivateKeyWallet<P> {
    provider: P,
}

impl<P> RawPrivateKeyWallet<P> {
    pub const fn new(provider: P) -> Self {
        Self { provider }
    }
}

/// Builds an HTTP-backed wallet for `rpc_url` signing with `private_key`.
pub fn connect_http(
    rpc_url: Url,
    private_key: &B256,
) -> Result<RawPrivateKeyWallet<impl Provider + WalletProvider + Clone + 'static>, EvmError> {
    let signer = PrivateKeySigner::from_bytes(private_key)?;
    let provider = ProviderBuilder::new()
        .wallet(EthereumWallet::from(signer))
        .connect_http(rpc_url);

    Ok(RawPrivateKeyWallet::new(provider))
}

#[async_trait]
impl<P> Evm for RawPrivateKeyWallet<P>
where
    P: Provider + WalletProvider + Clone + Send + Sync + 'static,
{
    type Provider = P;

    fn provider(&self) -> &P {
        &self.provider
    }
}

#[async_trait]
impl<P> Wallet for RawPrivateKeyWallet<P>
where
    P: Provider + WalletProvider + Clone + Send + Sync + 'static,
{
    fn address(&self) -> Address {
        self.provider.default_signer_address()
    }

    async fn send(
        &self,
        contract: Address,
        calldata: Bytes,
        value: U256,
        note: &str,
    ) -> Result<TxHash, EvmError> {
        info!(%contract, %value, note, "Submitting contract call");

        let tx = alloy::rpc::types::TransactionRequest::default()
            .to(contract)
            .value(value)
            .input(calldata.into());

        let pending = self
            .provider
            .send_transaction(tx)
            .await
            .map_err(decode_transport_error)?;

        info!(tx_hash = %pending.tx_hash(), note, "Transaction submitted");

        let receipt = pending
            .with_required_confirmations(1)
            .get_receipt()
            .await?;

        if !receipt.status() {
            return Err(EvmError::Reverted {
                tx_hash: receipt.transaction_hash,
            });
        }

        Ok(receipt.transaction_hash)
    }

    async fn wait_for_confirmations(
        &self,
        tx_hash: TxHash,
        confirmations: u64,
    ) -> Result<TxSummary, EvmError> {
        debug!(%tx_hash, confirmations, "Waiting for confirmations");

        let receipt = PendingTransactionBuilder::new(self.provider.root().clone(), tx_hash)
            .with_required_confirmations(confirmations)
            .get_receipt()
            .await?;

        if !receipt.status() {
            return Err(EvmError::Reverted { tx_hash });
        }

        info!(%tx_hash, gas_used = receipt.gas_used, "Transaction final");

        Ok(TxSummary::from(&receipt))
    }
}
