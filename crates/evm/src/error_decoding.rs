//! Contract error decoding utilities.
//!
//! Recovers Solidity revert reasons (`Error(string)` and `Panic(uint256)`)
//! from RPC error payloads so callers can tell a revert apart from a
//! transport failure.

use alloy::sol_types::decode_revert_reason;
use alloy::transports::TransportError;
use tracing::debug;

use crate::EvmError;

/// Returns the revert reason carried by an RPC error, if any.
///
/// Prefers ABI-decoded revert data. Nodes that omit the data but put the
/// reason in the error message ("execution reverted: ...") fall back to
/// that message.
pub fn revert_reason(err: &TransportError) -> Option<String> {
    let payload = err.as_error_resp()?;

    if let Some(revert_data) = payload.as_revert_data() {
        if let Some(reason) = decode_revert_reason(&revert_data) {
            return Some(reason);
        }
        debug!("Failed to decode revert data");
    }

    payload
        .message
        .contains("revert")
        .then(|| payload.message.to_string())
}

/// Converts an RPC error into an [`EvmError`], decoding reverts.
pub fn decode_transport_error(err: TransportError) -> EvmError {
    match revert_reason(&err) {
        Some(reason) => EvmError::DecodedRevert { reason },
        None => EvmError::Transport(err),
    }
}
