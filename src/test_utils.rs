//! Shared test fixtures: database setup, a mock attester and a builder
//! for deliveries carrying relay transfers.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use alloy::primitives::{Address, B256, Bytes, TxHash, U256, b256};
use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::attestation::{AttestationError, Attester};
use crate::chain::ChainId;
use crate::chain::tests::testnet_chains;
use crate::job::Delivery;
use crate::payload::tests::{sample_relay_payload, sample_transfer};
use crate::payload::{RelayPayload, TransferPayload};
use crate::vaa::tests::build_vaa;
use crate::vaa::{MessageId, SignedMessage};

pub(crate) const SOURCE_TX: TxHash =
    b256!("0x5050505050505050505050505050505050505050505050505050505050505050");

/// Creates an in-memory SQLite database with all migrations applied.
pub(crate) async fn setup_test_db() -> SqlitePool {
    let pool = SqlitePool::connect(":memory:").await.unwrap();
    sqlx::migrate!().run(&pool).await.unwrap();
    pool
}

/// Mock implementation of [`Attester`].
///
/// Returns a fixed attestation and records the hashes it was asked for.
/// A pending attester never resolves, like an attestation that is never
/// issued.
pub(crate) struct MockAttester {
    attestation: Bytes,
    pending: AtomicBool,
    calls: AtomicUsize,
    last_hash: Mutex<Option<B256>>,
}

impl MockAttester {
    pub(crate) fn new(attestation: Bytes) -> Self {
        Self {
            attestation,
            pending: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
            last_hash: Mutex::new(None),
        }
    }

    pub(crate) fn pending() -> Self {
        let attester = Self::new(Bytes::new());
        attester.pending.store(true, Ordering::SeqCst);
        attester
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn last_hash(&self) -> Option<B256> {
        *self.last_hash.lock().unwrap()
    }
}

#[async_trait]
impl Attester for MockAttester {
    async fn get_attestation(
        &self,
        message_hash: B256,
        _source_chain: ChainId,
    ) -> Result<Bytes, AttestationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_hash.lock().unwrap() = Some(message_hash);

        if self.pending.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }

        Ok(self.attestation.clone())
    }
}

/// Builder for deliveries of a 6.9 USDC transfer from Ethereum to
/// Avalanche on the testnet deployment, sent and minted through the
/// configured relayer contracts.
pub(crate) struct DeliveryBuilder {
    id: MessageId,
    transfer: TransferPayload,
    relay: RelayPayload,
    source_tx_hash: TxHash,
}

impl Default for DeliveryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DeliveryBuilder {
    pub(crate) fn new() -> Self {
        let chains = testnet_chains();
        let source = chains.get(ChainId::ETHEREUM).unwrap();
        let target = chains.get(ChainId::AVALANCHE).unwrap();

        Self {
            id: MessageId {
                emitter_chain: ChainId::ETHEREUM,
                emitter_address: source.circle_integration.into_word(),
                sequence: 1,
            },
            transfer: sample_transfer(source.relayer, target.relayer),
            relay: sample_relay_payload(),
            source_tx_hash: SOURCE_TX,
        }
    }

    #[must_use]
    pub(crate) fn with_sequence(mut self, sequence: u64) -> Self {
        self.id.sequence = sequence;
        self
    }

    #[must_use]
    pub(crate) fn with_emitter(mut self, emitter: B256) -> Self {
        self.id.emitter_address = emitter;
        self
    }

    #[must_use]
    pub(crate) fn with_sender(mut self, sender: Address) -> Self {
        self.transfer.sender = sender;
        self
    }

    #[must_use]
    pub(crate) fn with_mint_recipient(mut self, recipient: Address) -> Self {
        self.transfer.mint_recipient = recipient;
        self
    }

    #[must_use]
    pub(crate) fn with_source_domain(mut self, domain: u32) -> Self {
        self.transfer.source_domain = domain;
        self
    }

    #[must_use]
    pub(crate) fn with_payload_id(mut self, payload_id: u8) -> Self {
        self.relay.payload_id = payload_id;
        self
    }

    #[must_use]
    pub(crate) fn with_amount(mut self, amount: U256) -> Self {
        self.transfer.amount = amount;
        self
    }

    pub(crate) fn build(mut self) -> Delivery {
        self.transfer.payload = Bytes::from(self.relay.encode());
        let raw = build_vaa(self.id, 1, &self.transfer.encode());

        Delivery {
            message: SignedMessage::parse(&raw).unwrap(),
            source_tx_hash: self.source_tx_hash,
        }
    }
}
