//! Bidirectional mapping between token-bridge domains and messaging
//! chain ids.

use std::collections::HashMap;

use crate::chain::ChainId;

/// Token-bridge domains of the chains this relayer knows about.
const CCTP_DOMAINS: [(u32, ChainId); 5] = [
    (0, ChainId::ETHEREUM),
    (1, ChainId::AVALANCHE),
    (2, ChainId::OPTIMISM),
    (3, ChainId::ARBITRUM),
    (6, ChainId::BASE),
];

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DomainRegistryError {
    #[error("domain {0} mapped more than once")]
    DuplicateDomain(u32),
    #[error("chain {0} mapped more than once")]
    DuplicateChain(ChainId),
}

/// Standard token-bridge domain of `chain`, if it has one.
pub fn cctp_domain(chain: ChainId) -> Option<u32> {
    CCTP_DOMAINS
        .iter()
        .find_map(|&(domain, known)| (known == chain).then_some(domain))
}

/// Read-only after construction.
#[derive(Debug, Clone, Default)]
pub struct DomainRegistry {
    to_chain: HashMap<u32, ChainId>,
    to_domain: HashMap<ChainId, u32>,
}

impl DomainRegistry {
    pub fn new(
        entries: impl IntoIterator<Item = (u32, ChainId)>,
    ) -> Result<Self, DomainRegistryError> {
        let mut registry = Self::default();

        for (domain, chain) in entries {
            if registry.to_chain.insert(domain, chain).is_some() {
                return Err(DomainRegistryError::DuplicateDomain(domain));
            }
            if registry.to_domain.insert(chain, domain).is_some() {
                return Err(DomainRegistryError::DuplicateChain(chain));
            }
        }

        Ok(registry)
    }

    pub fn domain_to_chain(&self, domain: u32) -> Option<ChainId> {
        self.to_chain.get(&domain).copied()
    }

    pub fn chain_to_domain(&self, chain: ChainId) -> Option<u32> {
        self.to_domain.get(&chain).copied()
    }
}
