//! Pool of signing wallets per destination chain.
//!
//! A lease holds exactly one wallet. Dropping the lease returns the
//! wallet to the pool, so every exit path of a submission releases it.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cctp_relayer_evm::Wallet;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::debug;

use crate::chain::ChainId;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SignerError {
    #[error("no signers configured for chain {0}")]
    NoSigners(ChainId),
    #[error("timed out after {timeout:?} waiting for a signer on chain {chain}")]
    Timeout { chain: ChainId, timeout: Duration },
}

struct ChainSigners {
    permits: Arc<Semaphore>,
    free: Arc<Mutex<Vec<Arc<dyn Wallet>>>>,
}

#[derive(Default)]
pub struct SignerPool {
    chains: HashMap<ChainId, ChainSigners>,
}

impl SignerPool {
    pub fn new(wallets: impl IntoIterator<Item = (ChainId, Vec<Arc<dyn Wallet>>)>) -> Self {
        let chains = wallets
            .into_iter()
            .filter(|(_, wallets)| !wallets.is_empty())
            .map(|(chain, wallets)| {
                let signers = ChainSigners {
                    permits: Arc::new(Semaphore::new(wallets.len())),
                    free: Arc::new(Mutex::new(wallets)),
                };
                (chain, signers)
            })
            .collect();

        Self { chains }
    }

    /// Number of wallets currently free on `chain`.
    pub fn available(&self, chain: ChainId) -> usize {
        self.chains
            .get(&chain)
            .map_or(0, |signers| signers.permits.available_permits())
    }

    /// Waits up to `timeout` for a free wallet on `chain`.
    pub async fn acquire(
        &self,
        chain: ChainId,
        timeout: Duration,
    ) -> Result<SignerLease, SignerError> {
        let signers = self
            .chains
            .get(&chain)
            .ok_or(SignerError::NoSigners(chain))?;

        let started = Instant::now();

        let permit = tokio::time::timeout(timeout, signers.permits.clone().acquire_owned())
            .await
            .map_err(|_| SignerError::Timeout { chain, timeout })?
            .map_err(|_| SignerError::NoSigners(chain))?;

        // A held permit guarantees a free wallet.
        let wallet = signers
            .free
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .pop()
            .ok_or(SignerError::NoSigners(chain))?;

        let waited = started.elapsed();
        debug!(%chain, signer = %wallet.address(), ?waited, "Acquired signer");

        Ok(SignerLease {
            wallet,
            free: signers.free.clone(),
            waited,
            _permit: permit,
        })
    }
}

pub struct SignerLease {
    wallet: Arc<dyn Wallet>,
    free: Arc<Mutex<Vec<Arc<dyn Wallet>>>>,
    waited: Duration,
    _permit: OwnedSemaphorePermit,
}

impl SignerLease {
    pub fn wallet(&self) -> &dyn Wallet {
        self.wallet.as_ref()
    }

    /// Time spent waiting for this signer.
    pub const fn waited(&self) -> Duration {
        self.waited
    }
}

impl fmt::Debug for SignerLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignerLease")
            .field("signer", &self.wallet.address())
            .field("waited", &self.waited)
            .finish()
    }
}

impl Drop for SignerLease {
    fn drop(&mut self) {
        debug!(signer = %self.wallet.address(), "Released signer");
        // The permit is released after this body runs, so the wallet is
        // back in the free list before a waiter can claim it.
        self.free
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(self.wallet.clone());
    }
}

#[cfg(test)]
mod tests {
    use alloy::primitives::{Address, TxHash};

    use super::*;
    use crate::gateway::mock::MockWallet;

    fn wallet(byte: u8) -> Arc<dyn Wallet> {
        Arc::new(MockWallet::new(
            Address::repeat_byte(byte),
            TxHash::repeat_byte(byte),
            Arc::default(),
        ))
    }

    fn pool(wallets: Vec<Arc<dyn Wallet>>) -> SignerPool {
        SignerPool::new([(ChainId::AVALANCHE, wallets)])
    }

    #[tokio::test]
    async fn lease_returns_wallet_on_drop() {
        let pool = pool(vec![wallet(1)]);

        let lease = pool
            .acquire(ChainId::AVALANCHE, Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(lease.wallet().address(), Address::repeat_byte(1));
        assert_eq!(pool.available(ChainId::AVALANCHE), 0);

        drop(lease);

        assert_eq!(pool.available(ChainId::AVALANCHE), 1);
        let again = pool
            .acquire(ChainId::AVALANCHE, Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(again.wallet().address(), Address::repeat_byte(1));
    }

    #[tokio::test]
    async fn exhausted_pool_times_out() {
        let pool = pool(vec![wallet(1)]);
        let _held = pool
            .acquire(ChainId::AVALANCHE, Duration::from_millis(50))
            .await
            .unwrap();

        let err = pool
            .acquire(ChainId::AVALANCHE, Duration::from_millis(20))
            .await
            .unwrap_err();

        assert_eq!(
            err,
            SignerError::Timeout {
                chain: ChainId::AVALANCHE,
                timeout: Duration::from_millis(20),
            }
        );
    }

    #[tokio::test]
    async fn waiter_gets_wallet_once_released() {
        let pool = Arc::new(pool(vec![wallet(7)]));
        let held = pool
            .acquire(ChainId::AVALANCHE, Duration::from_millis(50))
            .await
            .unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move {
                pool.acquire(ChainId::AVALANCHE, Duration::from_secs(2))
                    .await
                    .map(|lease| (lease.wallet().address(), lease.waited()))
            })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        drop(held);

        let (address, waited) = waiter.await.unwrap().unwrap();
        assert_eq!(address, Address::repeat_byte(7));
        assert!(waited >= Duration::from_millis(20), "waited {waited:?}");
    }

    #[tokio::test]
    async fn distinct_wallets_are_leased_concurrently() {
        let pool = pool(vec![wallet(1), wallet(2)]);

        let first = pool
            .acquire(ChainId::AVALANCHE, Duration::from_millis(50))
            .await
            .unwrap();
        let second = pool
            .acquire(ChainId::AVALANCHE, Duration::from_millis(50))
            .await
            .unwrap();

        assert_ne!(first.wallet().address(), second.wallet().address());
    }

    #[tokio::test]
    async fn lease_released_when_holder_errors() {
        let pool = pool(vec![wallet(1)]);

        let failing: Result<(), &str> = async {
            let _lease = pool
                .acquire(ChainId::AVALANCHE, Duration::from_millis(50))
                .await
                .unwrap();
            Err("submission failed")
        }
        .await;

        assert!(failing.is_err());
        assert_eq!(pool.available(ChainId::AVALANCHE), 1);
    }

    #[tokio::test]
    async fn unknown_chain_has_no_signers() {
        let pool = pool(vec![wallet(1)]);

        let err = pool
            .acquire(ChainId::BASE, Duration::from_millis(10))
            .await
            .unwrap_err();

        assert_eq!(err, SignerError::NoSigners(ChainId::BASE));
    }
}
