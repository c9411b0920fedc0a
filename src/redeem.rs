//! Redemption orchestrator.
//!
//! Takes one delivered message through validate, quote, attest and
//! submit, and records every outcome on the message's relay record.
//! Intermediate results are re-derived from the message bytes on every
//! attempt; only the record's status is consulted to skip messages that
//! are already redeemed.

use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::{Address, Bytes, TxHash, U256, keccak256};
use async_trait::async_trait;
use cctp_relayer_evm::EvmError;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::attestation::{AttestationError, Attester};
use crate::chain::{ChainId, SupportedChains, UnsupportedChain};
use crate::domain::DomainRegistry;
use crate::gateway::{ChainGateway, GatewayError, find_message_sent, redeem_tokens_calldata};
use crate::job::{Attempt, Delivery, JobOutcome, MessageHandler};
use crate::metrics::RedeemMetrics;
use crate::payload::{DecodeError, decode_relay_payload, decode_transfer_payload};
use crate::relay::{
    NATIVE_DECIMALS, Relay, RelayStatus, RelayStoreError, SqliteRelayStore, USDC_DECIMALS,
    format_units,
};
use crate::signer::{SignerError, SignerPool};

const SYMBOL: &str = "USDC";
const SUBMISSION_ERROR_CODE: i64 = 1;
const ALREADY_REDEEMED_REASONS: [&str; 2] = ["already consumed", "already processed"];

#[derive(Debug, thiserror::Error)]
pub enum RedeemError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Unsupported(#[from] UnsupportedChain),
    #[error("mint recipient {actual} is not the relayer {expected} on chain {chain}")]
    MintRecipientMismatch {
        chain: ChainId,
        expected: Address,
        actual: Address,
    },
    #[error("no MessageSent log from {transmitter} in {tx_hash} on chain {chain}")]
    MissingMessageSent {
        chain: ChainId,
        tx_hash: TxHash,
        transmitter: Address,
    },
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error("attestation not available within {0:?}")]
    AttestationDeadline(Duration),
    #[error(transparent)]
    Attestation(#[from] AttestationError),
    #[error(transparent)]
    Signer(#[from] SignerError),
    #[error("redeem transaction failed: {0}")]
    Submission(EvmError),
    #[error("redeem transaction {tx_hash} not confirmed: {source}")]
    Confirmation { tx_hash: TxHash, source: EvmError },
    #[error(transparent)]
    Store(#[from] RelayStoreError),
}

impl RedeemError {
    /// Whether retrying the same message can succeed.
    pub const fn is_recoverable(&self) -> bool {
        match self {
            Self::Decode(_)
            | Self::Unsupported(_)
            | Self::MintRecipientMismatch { .. }
            | Self::MissingMessageSent { .. }
            | Self::Gateway(GatewayError::Unsupported(_)) => false,
            Self::Gateway(_)
            | Self::AttestationDeadline(_)
            | Self::Attestation(_)
            | Self::Signer(_)
            | Self::Submission(_)
            | Self::Confirmation { .. }
            | Self::Store(_) => true,
        }
    }

    pub const fn code(&self) -> Option<i64> {
        match self {
            Self::Submission(_) | Self::Confirmation { .. } => Some(SUBMISSION_ERROR_CODE),
            _ => None,
        }
    }
}

fn is_already_redeemed(err: &EvmError) -> bool {
    let message = err
        .revert_reason()
        .map_or_else(|| err.to_string(), str::to_owned)
        .to_lowercase();

    ALREADY_REDEEMED_REASONS
        .iter()
        .any(|reason| message.contains(reason))
}

#[derive(Debug, Clone)]
pub struct RedeemerConfig {
    pub signer_timeout: Duration,
    pub attestation_deadline: Duration,
    pub final_confirmations: u64,
}

impl Default for RedeemerConfig {
    fn default() -> Self {
        Self {
            signer_timeout: Duration::from_secs(30),
            attestation_deadline: Duration::from_secs(30 * 60),
            final_confirmations: 1,
        }
    }
}

/// Everything gathered before submission.
struct Redemption {
    target_chain: ChainId,
    relayer: Address,
    bridge_message: Bytes,
    attestation: Bytes,
    native_out: U256,
}

pub struct Redeemer {
    chains: SupportedChains,
    domains: DomainRegistry,
    gateway: Arc<dyn ChainGateway>,
    attester: Arc<dyn Attester>,
    signers: SignerPool,
    store: SqliteRelayStore,
    config: RedeemerConfig,
    metrics: RedeemMetrics,
}

impl Redeemer {
    pub fn new(
        chains: SupportedChains,
        domains: DomainRegistry,
        gateway: Arc<dyn ChainGateway>,
        attester: Arc<dyn Attester>,
        signers: SignerPool,
        store: SqliteRelayStore,
        config: RedeemerConfig,
    ) -> Self {
        Self {
            chains,
            domains,
            gateway,
            attester,
            signers,
            store,
            config,
            metrics: RedeemMetrics::global(),
        }
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: RedeemMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Whether the message was sent through this relayer network: the
    /// transfer decodes and its sender is the source chain's relayer.
    pub fn pre_filter(&self, delivery: &Delivery) -> bool {
        let transfer = match decode_transfer_payload(&delivery.message.payload, &self.domains) {
            Ok(transfer) => transfer,
            Err(err) => {
                debug!(key = %delivery.id(), "Filtered undecodable transfer: {err}");
                return false;
            }
        };

        let Ok(source) = self.chains.get(transfer.source_chain) else {
            debug!(key = %delivery.id(), chain = %transfer.source_chain, "Filtered unsupported source chain");
            return false;
        };

        if transfer.sender != source.relayer {
            debug!(
                key = %delivery.id(),
                sender = %transfer.sender,
                relayer = %source.relayer,
                "Filtered transfer from foreign sender"
            );
            return false;
        }

        true
    }

    /// Processes one delivery and records the outcome.
    #[tracing::instrument(skip_all, fields(key = %delivery.id(), %attempt), level = tracing::Level::INFO)]
    pub async fn process(&self, delivery: &Delivery, attempt: Attempt) -> Result<(), RedeemError> {
        let started = Instant::now();
        let mut relay = self.find_or_create(delivery, attempt).await?;

        if relay.status == RelayStatus::Redeemed {
            info!(to_tx_hash = ?relay.to_tx_hash, "Already redeemed, skipping");
            return Ok(());
        }

        relay.status = RelayStatus::Active;
        relay.attempts = attempt.number;
        relay.max_attempts = attempt.max;
        self.store.save(&relay).await?;

        let result = self.redeem(delivery, &mut relay).await;

        if let Err(err) = &result {
            if !err.is_recoverable() || attempt.is_last() {
                warn!("Relay failed: {err}");
                relay.mark_failed(err.to_string(), err.code());
            } else {
                warn!("Relay will be retried: {err}");
                relay.mark_retrying(attempt.number);
                relay.error_message = Some(err.to_string());
                relay.error_code = err.code();
            }
        }

        self.metrics.record(&relay, started.elapsed());

        match (result, self.store.save(&relay).await) {
            (Err(err), Err(save_err)) => {
                warn!("Failed to record relay outcome: {save_err}");
                Err(err)
            }
            (result, saved) => {
                saved?;
                result
            }
        }
    }

    async fn find_or_create(
        &self,
        delivery: &Delivery,
        attempt: Attempt,
    ) -> Result<Relay, RedeemError> {
        if let Some(relay) = self.store.find_by_key(&delivery.id()).await? {
            return Ok(relay);
        }

        let relay = Relay::new(
            delivery.id(),
            delivery.message.raw.clone(),
            Some(delivery.source_tx_hash),
            RelayStatus::Active,
            attempt.max,
        );

        Ok(self.store.create(&relay).await?)
    }

    async fn redeem(&self, delivery: &Delivery, relay: &mut Relay) -> Result<(), RedeemError> {
        let redemption = self.prepare(delivery, relay).await?;
        self.submit(delivery, redemption, relay).await
    }

    /// Validate, quote and attest. Holds no signer.
    async fn prepare(
        &self,
        delivery: &Delivery,
        relay: &mut Relay,
    ) -> Result<Redemption, RedeemError> {
        let transfer = decode_transfer_payload(&delivery.message.payload, &self.domains)?;
        let relay_payload = decode_relay_payload(&transfer.payload, transfer.target_chain)?;

        let target_chain = transfer.target_chain;
        relay.to_chain = Some(target_chain);
        let target = self.chains.get(target_chain)?;
        let source = self.chains.get(transfer.source_chain)?;

        if transfer.mint_recipient != target.relayer {
            return Err(RedeemError::MintRecipientMismatch {
                chain: target_chain,
                expected: target.relayer,
                actual: transfer.mint_recipient,
            });
        }

        let token = self
            .gateway
            .fetch_local_token_address(target_chain, transfer.source_domain, transfer.burn_token)
            .await?;
        let native_out = self
            .gateway
            .calculate_native_swap_amount_out(target_chain, token, relay_payload.to_native_amount)
            .await?;
        debug!(%token, %native_out, "Quoted native swap");

        let source_tx = self
            .gateway
            .source_transaction(transfer.source_chain, delivery.source_tx_hash)
            .await?;
        let bridge_message = find_message_sent(&source_tx.logs, source.message_transmitter)
            .ok_or(RedeemError::MissingMessageSent {
                chain: transfer.source_chain,
                tx_hash: delivery.source_tx_hash,
                transmitter: source.message_transmitter,
            })?;

        let message_hash = keccak256(&bridge_message);
        debug!(%message_hash, "Waiting for attestation");
        let attestation = tokio::time::timeout(
            self.config.attestation_deadline,
            self.attester
                .get_attestation(message_hash, transfer.source_chain),
        )
        .await
        .map_err(|_| RedeemError::AttestationDeadline(self.config.attestation_deadline))??;

        relay.symbol = Some(SYMBOL.to_owned());
        relay.sender_wallet = Some(source_tx.from);
        relay.recipient_wallet = Some(relay_payload.recipient_wallet);
        relay.amount_transferred = format_units(transfer.amount, USDC_DECIMALS);
        relay.amount_to_swap = format_units(relay_payload.to_native_amount, USDC_DECIMALS);
        relay.fee_amount = format_units(relay_payload.fee_amount, USDC_DECIMALS);
        relay.native_asset_estimated = format_units(native_out, NATIVE_DECIMALS);
        relay.native_asset_received = relay.native_asset_estimated;

        Ok(Redemption {
            target_chain,
            relayer: target.relayer,
            bridge_message,
            attestation,
            native_out,
        })
    }

    /// Broadcasts `redeemTokens` from one leased signer and waits for
    /// finality. The lease is released on every return path.
    async fn submit(
        &self,
        delivery: &Delivery,
        redemption: Redemption,
        relay: &mut Relay,
    ) -> Result<(), RedeemError> {
        let lease = self
            .signers
            .acquire(redemption.target_chain, self.config.signer_timeout)
            .await?;
        relay.metrics.waiting_for_wallet_ms = Some(millis(lease.waited()));

        let calldata = redeem_tokens_calldata(
            delivery.message.raw.clone(),
            redemption.bridge_message,
            redemption.attestation,
        );

        let started = Instant::now();
        let sent = lease
            .wallet()
            .send(
                redemption.relayer,
                calldata,
                redemption.native_out,
                "redeemTokens",
            )
            .await;

        let tx_hash = match sent {
            Ok(tx_hash) => tx_hash,
            Err(err) if is_already_redeemed(&err) => {
                info!("Message already redeemed on chain: {err}");
                relay.mark_redeemed(None);
                return Ok(());
            }
            Err(err) => return Err(RedeemError::Submission(err)),
        };

        info!(%tx_hash, signer = %lease.wallet().address(), "Redeem transaction sent");
        relay.to_tx_hash = Some(tx_hash);
        if let Err(err) = self.store.save(relay).await {
            warn!(%tx_hash, "Failed to record sent transaction hash: {err}");
        }

        let summary = lease
            .wallet()
            .wait_for_confirmations(tx_hash, self.config.final_confirmations)
            .await
            .map_err(|source| RedeemError::Confirmation { tx_hash, source })?;

        relay.metrics.waiting_for_tx_ms = Some(millis(started.elapsed()));
        relay.apply_receipt(&summary);
        relay.mark_redeemed(Some(summary.tx_hash));
        info!(
            tx_hash = %summary.tx_hash,
            gas_used = summary.gas_used,
            "Redeemed"
        );

        Ok(())
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[async_trait]
impl MessageHandler for Redeemer {
    fn filter(&self, delivery: &Delivery) -> bool {
        self.pre_filter(delivery)
    }

    async fn handle(&self, delivery: &Delivery, attempt: Attempt) -> JobOutcome {
        match self.process(delivery, attempt).await {
            Ok(()) => JobOutcome::Success,
            Err(err) if err.is_recoverable() => JobOutcome::Retryable(err.to_string()),
            Err(err) => JobOutcome::Unrecoverable(err.to_string()),
        }
    }
}
