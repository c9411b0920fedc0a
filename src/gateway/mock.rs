//! Mock chain gateway and wallet for testing the redemption pipeline.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use alloy::primitives::{Address, B256, Bytes, TxHash, U256};
use async_trait::async_trait;
use cctp_relayer_evm::{EvmError, TxSummary, Wallet};

use super::{ChainGateway, GatewayError, SourceTransaction};
use crate::chain::ChainId;

/// Mock implementation of [`ChainGateway`].
///
/// Returns fixed answers, counts calls and keeps the arguments of the
/// latest lookup and quote. Quoting can be made to fail with a transport
/// error.
pub(crate) struct MockGateway {
    local_token: Address,
    quote: U256,
    source: SourceTransaction,
    fail_quote: AtomicBool,
    token_lookups: AtomicUsize,
    quotes: AtomicUsize,
    source_lookups: AtomicUsize,
    last_token_lookup: Mutex<Option<(ChainId, u32, B256)>>,
    last_quote: Mutex<Option<(ChainId, Address, U256)>>,
}

impl MockGateway {
    pub(crate) fn new(local_token: Address, quote: U256, source: SourceTransaction) -> Self {
        Self {
            local_token,
            quote,
            source,
            fail_quote: AtomicBool::new(false),
            token_lookups: AtomicUsize::new(0),
            quotes: AtomicUsize::new(0),
            source_lookups: AtomicUsize::new(0),
            last_token_lookup: Mutex::new(None),
            last_quote: Mutex::new(None),
        }
    }

    pub(crate) fn failing_quotes(self) -> Self {
        self.fail_quote.store(true, Ordering::SeqCst);
        self
    }

    pub(crate) fn token_lookups(&self) -> usize {
        self.token_lookups.load(Ordering::SeqCst)
    }

    pub(crate) fn quotes(&self) -> usize {
        self.quotes.load(Ordering::SeqCst)
    }

    pub(crate) fn source_lookups(&self) -> usize {
        self.source_lookups.load(Ordering::SeqCst)
    }

    /// `(target_chain, source_domain, source_token)` of the latest lookup.
    pub(crate) fn last_token_lookup(&self) -> Option<(ChainId, u32, B256)> {
        *self.last_token_lookup.lock().unwrap()
    }

    /// `(target_chain, token, to_native_amount)` of the latest quote.
    pub(crate) fn last_quote(&self) -> Option<(ChainId, Address, U256)> {
        *self.last_quote.lock().unwrap()
    }
}

#[async_trait]
impl ChainGateway for MockGateway {
    async fn fetch_local_token_address(
        &self,
        target_chain: ChainId,
        source_domain: u32,
        source_token: B256,
    ) -> Result<Address, GatewayError> {
        self.token_lookups.fetch_add(1, Ordering::SeqCst);
        *self.last_token_lookup.lock().unwrap() = Some((target_chain, source_domain, source_token));
        Ok(self.local_token)
    }

    async fn calculate_native_swap_amount_out(
        &self,
        target_chain: ChainId,
        token: Address,
        to_native_amount: U256,
    ) -> Result<U256, GatewayError> {
        self.quotes.fetch_add(1, Ordering::SeqCst);
        *self.last_quote.lock().unwrap() = Some((target_chain, token, to_native_amount));

        if self.fail_quote.load(Ordering::SeqCst) {
            return Err(GatewayError::Evm(EvmError::Transport(
                alloy::transports::TransportError::local_usage_str("connection refused"),
            )));
        }

        Ok(self.quote)
    }

    async fn source_transaction(
        &self,
        _source_chain: ChainId,
        _tx_hash: TxHash,
    ) -> Result<SourceTransaction, GatewayError> {
        self.source_lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self.source.clone())
    }
}

/// Parameters captured from the last `send` call.
#[derive(Debug, Clone)]
pub(crate) struct SendCall {
    pub(crate) contract: Address,
    pub(crate) calldata: Bytes,
    pub(crate) value: U256,
}

/// Redemptions already executed on a mock destination chain. Shared
/// between wallets so a second redemption of the same message reverts
/// like the real contract does.
#[derive(Default)]
pub(crate) struct MockChainState {
    consumed: Mutex<HashSet<Bytes>>,
}

/// Mock implementation of [`Wallet`].
pub(crate) struct MockWallet {
    address: Address,
    tx_hash: TxHash,
    chain: Arc<MockChainState>,
    should_fail: AtomicBool,
    fail_confirmations: AtomicBool,
    sends: AtomicUsize,
    waits: AtomicUsize,
    last_call: Mutex<Option<SendCall>>,
}

pub(crate) const MOCK_GAS_USED: u64 = 250_000;
pub(crate) const MOCK_GAS_PRICE: u128 = 2_000_000_000;

impl MockWallet {
    pub(crate) fn new(address: Address, tx_hash: TxHash, chain: Arc<MockChainState>) -> Self {
        Self {
            address,
            tx_hash,
            chain,
            should_fail: AtomicBool::new(false),
            fail_confirmations: AtomicBool::new(false),
            sends: AtomicUsize::new(0),
            waits: AtomicUsize::new(0),
            last_call: Mutex::new(None),
        }
    }

    /// Creates a wallet whose transactions revert with an unrelated reason.
    pub(crate) fn failing(address: Address, tx_hash: TxHash) -> Self {
        let wallet = Self::new(address, tx_hash, Arc::default());
        wallet.should_fail.store(true, Ordering::SeqCst);
        wallet
    }

    /// Transactions are sent but never reach finality.
    pub(crate) fn failing_confirmations(self) -> Self {
        self.fail_confirmations.store(true, Ordering::SeqCst);
        self
    }

    pub(crate) fn sends(&self) -> usize {
        self.sends.load(Ordering::SeqCst)
    }

    pub(crate) fn waits(&self) -> usize {
        self.waits.load(Ordering::SeqCst)
    }

    pub(crate) fn last_call(&self) -> Option<SendCall> {
        self.last_call.lock().unwrap().clone()
    }
}

#[async_trait]
impl Wallet for MockWallet {
    fn address(&self) -> Address {
        self.address
    }

    async fn send(
        &self,
        contract: Address,
        calldata: Bytes,
        value: U256,
        _note: &str,
    ) -> Result<TxHash, EvmError> {
        self.sends.fetch_add(1, Ordering::SeqCst);

        *self.last_call.lock().unwrap() = Some(SendCall {
            contract,
            calldata: calldata.clone(),
            value,
        });

        if self.should_fail.load(Ordering::SeqCst) {
            return Err(EvmError::DecodedRevert {
                reason: "revert: insufficient fee".to_owned(),
            });
        }

        if !self.chain.consumed.lock().unwrap().insert(calldata) {
            return Err(EvmError::DecodedRevert {
                reason: "revert: message already consumed".to_owned(),
            });
        }

        Ok(self.tx_hash)
    }

    async fn wait_for_confirmations(
        &self,
        tx_hash: TxHash,
        _confirmations: u64,
    ) -> Result<TxSummary, EvmError> {
        self.waits.fetch_add(1, Ordering::SeqCst);

        if self.fail_confirmations.load(Ordering::SeqCst) {
            return Err(EvmError::Transport(
                alloy::transports::TransportError::local_usage_str("confirmation timed out"),
            ));
        }

        Ok(TxSummary {
            tx_hash,
            gas_used: MOCK_GAS_USED,
            effective_gas_price: MOCK_GAS_PRICE,
        })
    }
}

#[cfg(test)]
mod tests {
    use alloy::primitives::{address, b256};

    use super::*;

    const TX: TxHash = b256!("0x1111111111111111111111111111111111111111111111111111111111111111");

    #[tokio::test]
    async fn second_redemption_of_same_calldata_reverts() {
        let chain = Arc::new(MockChainState::default());
        let first = MockWallet::new(Address::repeat_byte(1), TX, chain.clone());
        let second = MockWallet::new(Address::repeat_byte(2), TX, chain);
        let target = address!("0x774a70bbd03327c21460b60f25b677d9e46ab458");

        first
            .send(target, Bytes::from_static(b"redeem"), U256::ZERO, "redeem")
            .await
            .unwrap();
        let err = second
            .send(target, Bytes::from_static(b"redeem"), U256::ZERO, "redeem")
            .await
            .unwrap_err();

        assert!(err.to_string().contains("already consumed"), "got {err}");
        assert_eq!(first.sends(), 1);
        assert_eq!(second.sends(), 1);
    }

    #[tokio::test]
    async fn failing_wallet_records_call() {
        let wallet = MockWallet::failing(Address::ZERO, TX);

        let result = wallet
            .send(Address::ZERO, Bytes::from_static(b"x"), U256::from(5), "redeem")
            .await;

        assert!(result.is_err());
        assert_eq!(wallet.last_call().unwrap().value, U256::from(5));
    }
}
