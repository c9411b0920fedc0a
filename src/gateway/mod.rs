//! Per-chain read access used by the redemption pipeline.
//!
//! [`ChainGateway`] is the seam between the orchestrator and the chains:
//! token address resolution on the destination's integration contract,
//! native swap quoting on the destination relayer, and source transaction
//! lookup. [`EvmGateway`] implements it over one [`Evm`] per chain.

#[cfg(test)]
pub(crate) mod mock;

use std::collections::HashMap;

use alloy::primitives::{Address, B256, Bytes, Log, TxHash, U256};
use alloy::sol_types::{SolCall, SolEvent};
use async_trait::async_trait;
use cctp_relayer_evm::{Evm, EvmError};
use tracing::debug;

use crate::bindings::{ICircleIntegration, ICircleRelayer, IMessageTransmitter};
use crate::chain::{ChainId, SupportedChains, UnsupportedChain};

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error(transparent)]
    Unsupported(#[from] UnsupportedChain),
    #[error("no provider configured for chain {0}")]
    NoProvider(ChainId),
    #[error(transparent)]
    Evm(#[from] EvmError),
    #[error("ABI decoding failed: {0}")]
    AbiDecode(#[from] alloy::sol_types::Error),
    #[error("receipt for {tx_hash} not found on chain {chain}")]
    ReceiptNotFound { chain: ChainId, tx_hash: TxHash },
}

/// The parts of a source-chain transaction the pipeline consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceTransaction {
    pub from: Address,
    pub logs: Vec<Log>,
}

#[async_trait]
pub trait ChainGateway: Send + Sync {
    /// Destination-chain address of the token burned on the source domain.
    async fn fetch_local_token_address(
        &self,
        target_chain: ChainId,
        source_domain: u32,
        source_token: B256,
    ) -> Result<Address, GatewayError>;

    /// Native wei the destination relayer would currently pay for
    /// `to_native_amount` of `token`.
    async fn calculate_native_swap_amount_out(
        &self,
        target_chain: ChainId,
        token: Address,
        to_native_amount: U256,
    ) -> Result<U256, GatewayError>;

    async fn source_transaction(
        &self,
        source_chain: ChainId,
        tx_hash: TxHash,
    ) -> Result<SourceTransaction, GatewayError>;
}

/// Message bytes of the first `MessageSent` emitted by `transmitter`.
pub fn find_message_sent(logs: &[Log], transmitter: Address) -> Option<Bytes> {
    logs.iter()
        .filter(|log| log.address == transmitter)
        .find_map(|log| IMessageTransmitter::MessageSent::decode_log(log).ok())
        .map(|event| event.data.message)
}

pub fn redeem_tokens_calldata(
    signed_message: Bytes,
    bridge_message: Bytes,
    attestation: Bytes,
) -> Bytes {
    ICircleRelayer::redeemTokensCall {
        redeemParams: ICircleRelayer::RedeemParameters {
            encodedWormholeMessage: signed_message,
            circleBridgeMessage: bridge_message,
            circleAttestation: attestation,
        },
    }
    .abi_encode()
    .into()
}

pub struct EvmGateway<E> {
    chains: SupportedChains,
    evms: HashMap<ChainId, E>,
}

impl<E: Evm> EvmGateway<E> {
    pub fn new(chains: SupportedChains, evms: HashMap<ChainId, E>) -> Self {
        Self { chains, evms }
    }

    fn evm(&self, chain: ChainId) -> Result<&E, GatewayError> {
        self.evms.get(&chain).ok_or(GatewayError::NoProvider(chain))
    }
}

#[async_trait]
impl<E: Evm> ChainGateway for EvmGateway<E> {
    async fn fetch_local_token_address(
        &self,
        target_chain: ChainId,
        source_domain: u32,
        source_token: B256,
    ) -> Result<Address, GatewayError> {
        let integration = self.chains.get(target_chain)?.circle_integration;
        let calldata = ICircleIntegration::fetchLocalTokenAddressCall {
            sourceDomain: source_domain,
            sourceToken: source_token,
        }
        .abi_encode();

        let output = self
            .evm(target_chain)?
            .call(integration, calldata.into())
            .await?;
        let local =
            ICircleIntegration::fetchLocalTokenAddressCall::abi_decode_returns(&output)?;

        Ok(Address::from_word(local))
    }

    async fn calculate_native_swap_amount_out(
        &self,
        target_chain: ChainId,
        token: Address,
        to_native_amount: U256,
    ) -> Result<U256, GatewayError> {
        let relayer = self.chains.get(target_chain)?.relayer;
        let calldata = ICircleRelayer::calculateNativeSwapAmountOutCall {
            token,
            toNativeAmount: to_native_amount,
        }
        .abi_encode();

        let output = self.evm(target_chain)?.call(relayer, calldata.into()).await?;

        Ok(ICircleRelayer::calculateNativeSwapAmountOutCall::abi_decode_returns(&output)?)
    }

    async fn source_transaction(
        &self,
        source_chain: ChainId,
        tx_hash: TxHash,
    ) -> Result<SourceTransaction, GatewayError> {
        let receipt = self
            .evm(source_chain)?
            .transaction_receipt(tx_hash)
            .await?
            .ok_or(GatewayError::ReceiptNotFound {
                chain: source_chain,
                tx_hash,
            })?;

        let logs: Vec<Log> = receipt
            .inner
            .logs()
            .iter()
            .map(|log| log.inner.clone())
            .collect();
        debug!(%tx_hash, logs = logs.len(), "Fetched source receipt");

        Ok(SourceTransaction {
            from: receipt.from,
            logs,
        })
    }
}
