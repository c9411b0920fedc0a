//! Relay record: the persisted lifecycle of one observed message.

mod store;

pub use store::{RelayStoreError, SqliteRelayStore};

use std::fmt;
use std::str::FromStr;

use alloy::primitives::{Address, B256, Bytes, TxHash, U256};
use cctp_relayer_evm::TxSummary;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

use crate::chain::ChainId;
use crate::vaa::MessageId;

pub const USDC_DECIMALS: u32 = 6;
pub const NATIVE_DECIMALS: u32 = 18;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayStatus {
    Waiting,
    #[serde(rename = "inprogress")]
    Active,
    Redeemed,
    Failed,
}

impl RelayStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Active => "inprogress",
            Self::Redeemed => "redeemed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for RelayStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("unknown relay status: {0}")]
pub struct UnknownRelayStatus(String);

impl FromStr for RelayStatus {
    type Err = UnknownRelayStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(Self::Waiting),
            "inprogress" => Ok(Self::Active),
            "redeemed" => Ok(Self::Redeemed),
            "failed" => Ok(Self::Failed),
            other => Err(UnknownRelayStatus(other.to_owned())),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RelayMetrics {
    pub waiting_for_wallet_ms: Option<u64>,
    pub waiting_for_tx_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Relay {
    pub id: Option<i64>,
    pub emitter_chain: ChainId,
    pub emitter_address: B256,
    pub sequence: u64,
    pub vaa: Bytes,
    pub status: RelayStatus,
    pub to_chain: Option<ChainId>,
    pub from_tx_hash: Option<TxHash>,
    pub to_tx_hash: Option<TxHash>,
    pub sender_wallet: Option<Address>,
    pub recipient_wallet: Option<Address>,
    pub symbol: Option<String>,
    pub amount_transferred: Option<Decimal>,
    pub amount_to_swap: Option<Decimal>,
    pub native_asset_estimated: Option<Decimal>,
    pub native_asset_received: Option<Decimal>,
    pub fee_amount: Option<Decimal>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub gas_used: Option<u64>,
    pub gas_price: Option<Decimal>,
    pub relay_cost: Option<Decimal>,
    pub error_message: Option<String>,
    pub error_code: Option<i64>,
    pub metrics: RelayMetrics,
    pub received_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
}

impl Relay {
    pub fn new(
        message: MessageId,
        vaa: Bytes,
        from_tx_hash: Option<TxHash>,
        status: RelayStatus,
        max_attempts: u32,
    ) -> Self {
        Self {
            id: None,
            emitter_chain: message.emitter_chain,
            emitter_address: message.emitter_address,
            sequence: message.sequence,
            vaa,
            status,
            to_chain: None,
            from_tx_hash,
            to_tx_hash: None,
            sender_wallet: None,
            recipient_wallet: None,
            symbol: None,
            amount_transferred: None,
            amount_to_swap: None,
            native_asset_estimated: None,
            native_asset_received: None,
            fee_amount: None,
            attempts: 0,
            max_attempts,
            gas_used: None,
            gas_price: None,
            relay_cost: None,
            error_message: None,
            error_code: None,
            metrics: RelayMetrics::default(),
            received_at: Utc::now(),
            completed_at: None,
            failed_at: None,
        }
    }

    pub const fn message_id(&self) -> MessageId {
        MessageId {
            emitter_chain: self.emitter_chain,
            emitter_address: self.emitter_address,
            sequence: self.sequence,
        }
    }

    pub fn mark_redeemed(&mut self, to_tx_hash: Option<TxHash>) {
        self.status = RelayStatus::Redeemed;
        if to_tx_hash.is_some() {
            self.to_tx_hash = to_tx_hash;
        }
        self.completed_at = Some(Utc::now());
        self.failed_at = None;
        self.error_message = None;
        self.error_code = None;
    }

    pub const fn mark_retrying(&mut self, attempts: u32) {
        self.status = RelayStatus::Waiting;
        self.attempts = attempts;
    }

    pub fn mark_failed(&mut self, reason: impl Into<String>, code: Option<i64>) {
        self.status = RelayStatus::Failed;
        self.failed_at = Some(Utc::now());
        self.error_message = Some(reason.into());
        self.error_code = code;
    }

    /// Gas economics of the redemption transaction.
    pub fn apply_receipt(&mut self, summary: &TxSummary) {
        self.gas_used = Some(summary.gas_used);
        self.gas_price = format_units(U256::from(summary.effective_gas_price), NATIVE_DECIMALS);
        self.relay_cost = self
            .gas_price
            .and_then(|price| price.checked_mul(Decimal::from(summary.gas_used)))
            .map(|cost| cost.normalize());
    }
}

/// Converts an integer amount in the smallest unit to a decimal with
/// `decimals` fractional digits. `None` if it does not fit a `Decimal`.
pub fn format_units(amount: U256, decimals: u32) -> Option<Decimal> {
    let amount = i128::try_from(amount).ok()?;
    Decimal::try_from_i128_with_scale(amount, decimals)
        .ok()
        .map(|value| value.normalize())
}

#[cfg(test)]
mod tests {
    use alloy::primitives::b256;
    use rust_decimal_macros::dec;

    use super::*;

    fn message() -> MessageId {
        MessageId {
            emitter_chain: ChainId::ETHEREUM,
            emitter_address: B256::repeat_byte(0x0a),
            sequence: 5,
        }
    }

    #[test]
    fn status_strings_round_trip() {
        for status in [
            RelayStatus::Waiting,
            RelayStatus::Active,
            RelayStatus::Redeemed,
            RelayStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<RelayStatus>().unwrap(), status);
        }
        assert_eq!(RelayStatus::Active.to_string(), "inprogress");
        assert!("done".parse::<RelayStatus>().is_err());
    }

    #[test]
    fn usdc_amounts_use_six_decimals() {
        assert_eq!(
            format_units(U256::from(6_900_000u64), USDC_DECIMALS),
            Some(dec!(6.9))
        );
        assert_eq!(
            format_units(U256::from(500_000u64), USDC_DECIMALS),
            Some(dec!(0.5))
        );
        assert_eq!(format_units(U256::ZERO, USDC_DECIMALS), Some(dec!(0)));
    }

    #[test]
    fn oversized_amount_does_not_fit() {
        assert_eq!(format_units(U256::MAX, NATIVE_DECIMALS), None);
    }

    #[test]
    fn mark_redeemed_clears_error_and_keeps_existing_hash() {
        let first = b256!("0x1111111111111111111111111111111111111111111111111111111111111111");
        let mut relay = Relay::new(message(), Bytes::new(), None, RelayStatus::Active, 3);
        relay.to_tx_hash = Some(first);
        relay.error_message = Some("boom".to_owned());
        relay.error_code = Some(1);

        relay.mark_redeemed(None);

        assert_eq!(relay.status, RelayStatus::Redeemed);
        assert_eq!(relay.to_tx_hash, Some(first));
        assert!(relay.completed_at.is_some());
        assert_eq!(relay.error_message, None);
        assert_eq!(relay.error_code, None);
    }

    #[test]
    fn redeeming_a_failed_relay_clears_failure_time() {
        let mut relay = Relay::new(message(), Bytes::new(), None, RelayStatus::Active, 3);
        relay.mark_failed("attestation not available", None);
        assert!(relay.failed_at.is_some());

        relay.mark_redeemed(None);

        assert_eq!(relay.status, RelayStatus::Redeemed);
        assert_eq!(relay.failed_at, None);
        assert!(relay.completed_at.is_some());
    }

    #[test]
    fn mark_failed_records_reason() {
        let mut relay = Relay::new(message(), Bytes::new(), None, RelayStatus::Active, 3);

        relay.mark_failed("execution reverted", Some(1));

        assert_eq!(relay.status, RelayStatus::Failed);
        assert_eq!(relay.error_message.as_deref(), Some("execution reverted"));
        assert_eq!(relay.error_code, Some(1));
        assert!(relay.failed_at.is_some());
    }

    #[test]
    fn mark_retrying_sets_waiting_and_attempts() {
        let mut relay = Relay::new(message(), Bytes::new(), None, RelayStatus::Active, 3);

        relay.mark_retrying(2);

        assert_eq!(relay.status, RelayStatus::Waiting);
        assert_eq!(relay.attempts, 2);
    }

    #[test]
    fn receipt_sets_gas_economics() {
        let mut relay = Relay::new(message(), Bytes::new(), None, RelayStatus::Active, 3);

        relay.apply_receipt(&TxSummary {
            tx_hash: TxHash::ZERO,
            gas_used: 200_000,
            effective_gas_price: 25_000_000_000,
        });

        assert_eq!(relay.gas_used, Some(200_000));
        assert_eq!(relay.gas_price, Some(dec!(0.000000025)));
        assert_eq!(relay.relay_cost, Some(dec!(0.005)));
    }
}
