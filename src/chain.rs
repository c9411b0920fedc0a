//! Chains this deployment relays for and their contract addresses.

use std::collections::BTreeMap;
use std::fmt;

use alloy::primitives::{Address, B256};
use serde::{Deserialize, Serialize};

/// Chain identifier in the messaging network's id space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChainId(pub u16);

impl ChainId {
    pub const ETHEREUM: Self = Self(2);
    pub const AVALANCHE: Self = Self(6);
    pub const ARBITRUM: Self = Self(23);
    pub const OPTIMISM: Self = Self(24);
    pub const BASE: Self = Self(30);
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Contracts the relayer talks to on one chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainContracts {
    /// Token bridge contract that emits `MessageSent` on burn.
    pub message_transmitter: Address,
    /// Relayer contract: sender of relayed transfers on the source chain,
    /// mint recipient and `redeemTokens` target on the destination chain.
    pub relayer: Address,
    /// Origin contract whose emitted messages carry transfers. Also
    /// answers `fetchLocalTokenAddress`.
    pub circle_integration: Address,
    pub native_symbol: String,
}

#[derive(Debug, thiserror::Error)]
#[error("chain {0} is not supported by this deployment")]
pub struct UnsupportedChain(pub ChainId);

/// Immutable chain -> contracts table built once at startup.
#[derive(Debug, Clone, Default)]
pub struct SupportedChains {
    chains: BTreeMap<ChainId, ChainContracts>,
}

impl SupportedChains {
    pub fn new(chains: impl IntoIterator<Item = (ChainId, ChainContracts)>) -> Self {
        Self {
            chains: chains.into_iter().collect(),
        }
    }

    pub fn get(&self, chain: ChainId) -> Result<&ChainContracts, UnsupportedChain> {
        self.chains.get(&chain).ok_or(UnsupportedChain(chain))
    }

    pub fn contains(&self, chain: ChainId) -> bool {
        self.chains.contains_key(&chain)
    }

    pub fn ids(&self) -> impl Iterator<Item = ChainId> + '_ {
        self.chains.keys().copied()
    }

    /// Routing key under which messages from `chain` are delivered: the
    /// origin contract left-padded to 32 bytes.
    pub fn emitter(&self, chain: ChainId) -> Result<B256, UnsupportedChain> {
        Ok(self.get(chain)?.circle_integration.into_word())
    }
}
