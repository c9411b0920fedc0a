use std::num::TryFromIntError;
use std::str::FromStr;

use alloy::primitives::{Address, B256, Bytes, TxHash};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use super::{Relay, RelayMetrics, RelayStatus};
use crate::chain::ChainId;
use crate::vaa::MessageId;

#[derive(Debug, thiserror::Error)]
pub enum RelayStoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("integer out of range: {0}")]
    IntConversion(#[from] TryFromIntError),
    #[error("column {column} holds unparseable value {value:?}")]
    Corrupt { column: &'static str, value: String },
    #[error("relay {0} vanished after insert")]
    Missing(MessageId),
}

const COLUMNS: &str = "id, emitter_chain, emitter_address, sequence, vaa, status, to_chain, \
    from_tx_hash, to_tx_hash, sender_wallet, recipient_wallet, symbol, amount_transferred, \
    amount_to_swap, native_asset_estimated, native_asset_received, fee_amount, attempts, \
    max_attempts, gas_used, gas_price, relay_cost, error_message, error_code, \
    waiting_for_wallet_ms, waiting_for_tx_ms, received_at, completed_at, failed_at";

/// Relay records keyed by message identity.
///
/// The unique index on the key makes [`SqliteRelayStore::create`] safe
/// under concurrent callers: exactly one row exists per message.
#[derive(Debug, Clone)]
pub struct SqliteRelayStore {
    pool: SqlitePool,
}

impl SqliteRelayStore {
    pub const fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn find_by_key(&self, key: &MessageId) -> Result<Option<Relay>, RelayStoreError> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM relays \
             WHERE emitter_chain = ? AND emitter_address = ? AND sequence = ?"
        ))
        .bind(i64::from(key.emitter_chain.0))
        .bind(format!("{:#x}", key.emitter_address))
        .bind(i64::try_from(key.sequence)?)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(relay_from_row).transpose()
    }

    /// Most recent relay whose source transaction is `tx_hash`.
    pub async fn find_by_source_tx(&self, tx_hash: TxHash) -> Result<Option<Relay>, RelayStoreError> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM relays WHERE from_tx_hash = ? ORDER BY id DESC LIMIT 1"
        ))
        .bind(format!("{tx_hash:#x}"))
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(relay_from_row).transpose()
    }

    pub async fn list_by_status(
        &self,
        status: RelayStatus,
        limit: u32,
    ) -> Result<Vec<Relay>, RelayStoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM relays WHERE status = ? ORDER BY id DESC LIMIT ?"
        ))
        .bind(status.as_str())
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(relay_from_row).collect()
    }

    /// Inserts `relay` unless a record with the same key exists, and
    /// returns whichever record is stored.
    pub async fn create(&self, relay: &Relay) -> Result<Relay, RelayStoreError> {
        let key = relay.message_id();

        let inserted = sqlx::query(
            "INSERT INTO relays (
                emitter_chain, emitter_address, sequence, vaa, status, from_tx_hash,
                attempts, max_attempts, received_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (emitter_chain, emitter_address, sequence) DO NOTHING",
        )
        .bind(i64::from(relay.emitter_chain.0))
        .bind(format!("{:#x}", relay.emitter_address))
        .bind(i64::try_from(relay.sequence)?)
        .bind(relay.vaa.to_vec())
        .bind(relay.status.as_str())
        .bind(relay.from_tx_hash.map(|hash| format!("{hash:#x}")))
        .bind(i64::from(relay.attempts))
        .bind(i64::from(relay.max_attempts))
        .bind(relay.received_at)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if inserted == 0 {
            debug!(%key, "Relay already recorded");
        }

        self.find_by_key(&key)
            .await?
            .ok_or(RelayStoreError::Missing(key))
    }

    /// Writes every mutable field of `relay`. Returns `false` when the
    /// write was skipped because the stored record is already redeemed
    /// and `relay` is not.
    ///
    /// A stored destination hash or gas figure is never overwritten with
    /// `NULL`.
    pub async fn save(&self, relay: &Relay) -> Result<bool, RelayStoreError> {
        let status = relay.status.as_str();

        let updated = sqlx::query(
            "UPDATE relays SET
                status = ?,
                to_chain = COALESCE(?, to_chain),
                from_tx_hash = COALESCE(?, from_tx_hash),
                to_tx_hash = COALESCE(?, to_tx_hash),
                sender_wallet = COALESCE(?, sender_wallet),
                recipient_wallet = COALESCE(?, recipient_wallet),
                symbol = COALESCE(?, symbol),
                amount_transferred = COALESCE(?, amount_transferred),
                amount_to_swap = COALESCE(?, amount_to_swap),
                native_asset_estimated = COALESCE(?, native_asset_estimated),
                native_asset_received = COALESCE(?, native_asset_received),
                fee_amount = COALESCE(?, fee_amount),
                attempts = ?,
                max_attempts = ?,
                gas_used = COALESCE(?, gas_used),
                gas_price = COALESCE(?, gas_price),
                relay_cost = COALESCE(?, relay_cost),
                error_message = ?,
                error_code = ?,
                waiting_for_wallet_ms = COALESCE(?, waiting_for_wallet_ms),
                waiting_for_tx_ms = COALESCE(?, waiting_for_tx_ms),
                completed_at = COALESCE(?, completed_at),
                failed_at = ?
            WHERE emitter_chain = ? AND emitter_address = ? AND sequence = ?
              AND (status != 'redeemed' OR ? = 'redeemed')",
        )
        .bind(status)
        .bind(relay.to_chain.map(|chain| i64::from(chain.0)))
        .bind(relay.from_tx_hash.map(|hash| format!("{hash:#x}")))
        .bind(relay.to_tx_hash.map(|hash| format!("{hash:#x}")))
        .bind(relay.sender_wallet.map(|wallet| format!("{wallet:#x}")))
        .bind(relay.recipient_wallet.map(|wallet| format!("{wallet:#x}")))
        .bind(relay.symbol.as_deref())
        .bind(relay.amount_transferred.map(|amount| amount.to_string()))
        .bind(relay.amount_to_swap.map(|amount| amount.to_string()))
        .bind(relay.native_asset_estimated.map(|amount| amount.to_string()))
        .bind(relay.native_asset_received.map(|amount| amount.to_string()))
        .bind(relay.fee_amount.map(|amount| amount.to_string()))
        .bind(i64::from(relay.attempts))
        .bind(i64::from(relay.max_attempts))
        .bind(relay.gas_used.map(i64::try_from).transpose()?)
        .bind(relay.gas_price.map(|price| price.to_string()))
        .bind(relay.relay_cost.map(|cost| cost.to_string()))
        .bind(relay.error_message.as_deref())
        .bind(relay.error_code)
        .bind(relay.metrics.waiting_for_wallet_ms.map(i64::try_from).transpose()?)
        .bind(relay.metrics.waiting_for_tx_ms.map(i64::try_from).transpose()?)
        .bind(relay.completed_at)
        .bind(relay.failed_at)
        .bind(i64::from(relay.emitter_chain.0))
        .bind(format!("{:#x}", relay.emitter_address))
        .bind(i64::try_from(relay.sequence)?)
        .bind(status)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            debug!(key = %relay.message_id(), %status, "Skipped stale relay save");
        }

        Ok(updated > 0)
    }
}

fn parse_column<T: FromStr>(
    row: &SqliteRow,
    column: &'static str,
) -> Result<Option<T>, RelayStoreError> {
    let Some(raw) = row.try_get::<Option<String>, _>(column)? else {
        return Ok(None);
    };

    raw.parse()
        .map(Some)
        .map_err(|_| RelayStoreError::Corrupt { column, value: raw })
}

fn required_column<T: FromStr>(
    row: &SqliteRow,
    column: &'static str,
) -> Result<T, RelayStoreError> {
    parse_column(row, column)?.ok_or(RelayStoreError::Corrupt {
        column,
        value: "NULL".to_owned(),
    })
}

fn optional_u64(row: &SqliteRow, column: &str) -> Result<Option<u64>, RelayStoreError> {
    Ok(row
        .try_get::<Option<i64>, _>(column)?
        .map(u64::try_from)
        .transpose()?)
}

fn relay_from_row(row: &SqliteRow) -> Result<Relay, RelayStoreError> {
    let emitter_chain = ChainId(u16::try_from(row.try_get::<i64, _>("emitter_chain")?)?);
    let to_chain = row
        .try_get::<Option<i64>, _>("to_chain")?
        .map(u16::try_from)
        .transpose()?
        .map(ChainId);

    Ok(Relay {
        id: row.try_get("id")?,
        emitter_chain,
        emitter_address: required_column::<B256>(row, "emitter_address")?,
        sequence: u64::try_from(row.try_get::<i64, _>("sequence")?)?,
        vaa: Bytes::from(row.try_get::<Vec<u8>, _>("vaa")?),
        status: required_column(row, "status")?,
        to_chain,
        from_tx_hash: parse_column::<TxHash>(row, "from_tx_hash")?,
        to_tx_hash: parse_column::<TxHash>(row, "to_tx_hash")?,
        sender_wallet: parse_column::<Address>(row, "sender_wallet")?,
        recipient_wallet: parse_column::<Address>(row, "recipient_wallet")?,
        symbol: row.try_get("symbol")?,
        amount_transferred: parse_column::<Decimal>(row, "amount_transferred")?,
        amount_to_swap: parse_column::<Decimal>(row, "amount_to_swap")?,
        native_asset_estimated: parse_column::<Decimal>(row, "native_asset_estimated")?,
        native_asset_received: parse_column::<Decimal>(row, "native_asset_received")?,
        fee_amount: parse_column::<Decimal>(row, "fee_amount")?,
        attempts: u32::try_from(row.try_get::<i64, _>("attempts")?)?,
        max_attempts: u32::try_from(row.try_get::<i64, _>("max_attempts")?)?,
        gas_used: optional_u64(row, "gas_used")?,
        gas_price: parse_column::<Decimal>(row, "gas_price")?,
        relay_cost: parse_column::<Decimal>(row, "relay_cost")?,
        error_message: row.try_get("error_message")?,
        error_code: row.try_get("error_code")?,
        metrics: RelayMetrics {
            waiting_for_wallet_ms: optional_u64(row, "waiting_for_wallet_ms")?,
            waiting_for_tx_ms: optional_u64(row, "waiting_for_tx_ms")?,
        },
        received_at: row.try_get::<DateTime<Utc>, _>("received_at")?,
        completed_at: row.try_get("completed_at")?,
        failed_at: row.try_get("failed_at")?,
    })
}
