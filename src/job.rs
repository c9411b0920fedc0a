//! In-process job host: routes deliveries to handlers and retries them.
//!
//! Each delivery is routed by its emitter (chain, address) to one
//! registered [`MessageHandler`]. The host records the message as
//! waiting, then invokes the handler until it succeeds, reports an
//! unrecoverable failure or spends the attempt budget. Retries follow a
//! jittered exponential backoff.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use alloy::primitives::{B256, TxHash};
use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use futures_util::stream::{Stream, StreamExt};
use tracing::{debug, error, info, warn};

use crate::chain::ChainId;
use crate::relay::{Relay, RelayStatus, RelayStoreError, SqliteRelayStore};
use crate::vaa::{MessageId, SignedMessage};

/// Result of one handler invocation, inspected by the host instead of
/// error types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Success,
    Retryable(String),
    Unrecoverable(String),
}

/// A signed message together with the source transaction that emitted it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub message: SignedMessage,
    pub source_tx_hash: TxHash,
}

impl Delivery {
    pub const fn id(&self) -> MessageId {
        self.message.id
    }
}

/// Position of an invocation within the attempt budget. `number` starts
/// at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attempt {
    pub number: u32,
    pub max: u32,
}

impl Attempt {
    pub const fn is_last(self) -> bool {
        self.number >= self.max
    }
}

impl fmt::Display for Attempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.number, self.max)
    }
}

#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// `false` drops the delivery without recording it.
    fn filter(&self, delivery: &Delivery) -> bool;

    async fn handle(&self, delivery: &Delivery, attempt: Attempt) -> JobOutcome;
}

/// A handler invocation that did not succeed.
#[derive(Debug)]
enum AttemptFailure {
    Retryable { attempt: Attempt, reason: String },
    Unrecoverable { attempt: Attempt, reason: String },
}

impl AttemptFailure {
    const fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct RoutingKey {
    chain: ChainId,
    emitter: B256,
}

/// What finally happened to one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// No handler is registered for the emitter.
    Unrouted,
    Filtered,
    Completed { attempts: u32 },
    Unrecoverable { attempts: u32, reason: String },
    Exhausted { attempts: u32, reason: String },
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub completed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub errors: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error(transparent)]
    Store(#[from] RelayStoreError),
    #[error("max attempts must be at least 1")]
    NoAttempts,
}

#[derive(Debug, Clone)]
pub struct JobHostConfig {
    pub concurrency: usize,
    pub max_attempts: u32,
    pub min_retry_delay: Duration,
    pub max_retry_delay: Duration,
}

impl Default for JobHostConfig {
    fn default() -> Self {
        Self {
            concurrency: 3,
            max_attempts: 3,
            min_retry_delay: Duration::from_secs(1),
            max_retry_delay: Duration::from_secs(60),
        }
    }
}

pub struct JobHost {
    handlers: HashMap<RoutingKey, Arc<dyn MessageHandler>>,
    store: SqliteRelayStore,
    config: JobHostConfig,
}

impl JobHost {
    pub fn new(store: SqliteRelayStore, config: JobHostConfig) -> Result<Self, JobError> {
        if config.max_attempts == 0 {
            return Err(JobError::NoAttempts);
        }

        Ok(Self {
            handlers: HashMap::new(),
            store,
            config,
        })
    }

    pub fn register(&mut self, chain: ChainId, emitter: B256, handler: Arc<dyn MessageHandler>) {
        info!(%chain, %emitter, "Registered message handler");
        self.handlers
            .insert(RoutingKey { chain, emitter }, handler);
    }

    /// Delays between attempts. One fewer than the attempt budget.
    fn retry_policy(&self) -> ExponentialBuilder {
        let retries =
            usize::try_from(self.config.max_attempts.saturating_sub(1)).unwrap_or(usize::MAX);

        ExponentialBuilder::default()
            .with_min_delay(self.config.min_retry_delay)
            .with_max_delay(self.config.max_retry_delay)
            .with_max_times(retries)
            .with_jitter()
    }

    /// Runs one delivery through its handler with retries.
    #[tracing::instrument(skip_all, fields(key = %delivery.id()), level = tracing::Level::INFO)]
    pub async fn submit(&self, delivery: Delivery) -> Result<Disposition, JobError> {
        let key = delivery.id();
        let routing = RoutingKey {
            chain: key.emitter_chain,
            emitter: key.emitter_address,
        };

        let Some(handler) = self.handlers.get(&routing) else {
            debug!("No handler registered for emitter");
            return Ok(Disposition::Unrouted);
        };

        if !handler.filter(&delivery) {
            debug!("Delivery filtered");
            return Ok(Disposition::Filtered);
        }

        self.store
            .create(&Relay::new(
                key,
                delivery.message.raw.clone(),
                Some(delivery.source_tx_hash),
                RelayStatus::Waiting,
                self.config.max_attempts,
            ))
            .await?;

        let max = self.config.max_attempts;
        let invocations = AtomicU32::new(0);
        let (invocations, delivery) = (&invocations, &delivery);

        let outcome = (|| async move {
            let attempt = Attempt {
                number: invocations.fetch_add(1, Ordering::SeqCst) + 1,
                max,
            };

            match handler.handle(delivery, attempt).await {
                JobOutcome::Success => Ok(attempt),
                JobOutcome::Retryable(reason) => Err(AttemptFailure::Retryable { attempt, reason }),
                JobOutcome::Unrecoverable(reason) => {
                    Err(AttemptFailure::Unrecoverable { attempt, reason })
                }
            }
        })
        .retry(self.retry_policy())
        .when(AttemptFailure::is_retryable)
        .notify(|failure, delay| {
            if let AttemptFailure::Retryable { attempt, reason } = failure {
                warn!(%attempt, %reason, ?delay, "Delivery failed, retrying");
            }
        })
        .await;

        let disposition = match outcome {
            Ok(attempt) => {
                info!(%attempt, "Delivery completed");
                Disposition::Completed {
                    attempts: attempt.number,
                }
            }
            Err(AttemptFailure::Unrecoverable { attempt, reason }) => {
                error!(%attempt, %reason, "Delivery failed permanently");
                Disposition::Unrecoverable {
                    attempts: attempt.number,
                    reason,
                }
            }
            Err(AttemptFailure::Retryable { attempt, reason }) => {
                error!(%attempt, %reason, "Delivery exhausted its attempts");
                Disposition::Exhausted {
                    attempts: attempt.number,
                    reason,
                }
            }
        };

        Ok(disposition)
    }

    /// Re-delivers a message regardless of its recorded status; handlers
    /// short-circuit messages that are already redeemed.
    pub async fn reprocess(&self, delivery: Delivery) -> Result<Disposition, JobError> {
        info!(key = %delivery.id(), "Reprocessing message");
        self.submit(delivery).await
    }

    /// Processes a stream of deliveries with bounded concurrency.
    pub async fn run<S>(&self, deliveries: S) -> RunSummary
    where
        S: Stream<Item = Delivery>,
    {
        let concurrency = self.config.concurrency.max(1);

        deliveries
            .map(|delivery| self.submit(delivery))
            .buffer_unordered(concurrency)
            .fold(RunSummary::default(), |mut summary, result| async move {
                match result {
                    Ok(Disposition::Completed { .. }) => summary.completed += 1,
                    Ok(Disposition::Unrouted | Disposition::Filtered) => summary.skipped += 1,
                    Ok(Disposition::Unrecoverable { .. } | Disposition::Exhausted { .. }) => {
                        summary.failed += 1;
                    }
                    Err(err) => {
                        error!("Delivery errored: {err}");
                        summary.errors += 1;
                    }
                }
                summary
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use alloy::primitives::Address;
    use tracing_test::traced_test;

    use super::*;
    use crate::test_utils::{DeliveryBuilder, setup_test_db};

    /// Handler that replays a scripted list of outcomes, then succeeds.
    struct ScriptedHandler {
        accept: bool,
        script: Mutex<Vec<JobOutcome>>,
        calls: AtomicUsize,
        attempts: Mutex<Vec<Attempt>>,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl ScriptedHandler {
        fn new(script: Vec<JobOutcome>) -> Self {
            Self {
                accept: true,
                script: Mutex::new(script.into_iter().rev().collect()),
                calls: AtomicUsize::new(0),
                attempts: Mutex::new(Vec::new()),
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }

        fn rejecting() -> Self {
            Self {
                accept: false,
                ..Self::new(vec![])
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl MessageHandler for ScriptedHandler {
        fn filter(&self, _delivery: &Delivery) -> bool {
            self.accept
        }

        async fn handle(&self, _delivery: &Delivery, attempt: Attempt) -> JobOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.attempts.lock().unwrap().push(attempt);

            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            self.script
                .lock()
                .unwrap()
                .pop()
                .unwrap_or(JobOutcome::Success)
        }
    }

    fn fast_config(max_attempts: u32) -> JobHostConfig {
        JobHostConfig {
            concurrency: 3,
            max_attempts,
            min_retry_delay: Duration::from_millis(1),
            max_retry_delay: Duration::from_millis(5),
        }
    }

    async fn host_with(handler: Arc<ScriptedHandler>, max_attempts: u32) -> (JobHost, SqliteRelayStore) {
        let store = SqliteRelayStore::new(setup_test_db().await);
        let mut host = JobHost::new(store.clone(), fast_config(max_attempts)).unwrap();
        let delivery = DeliveryBuilder::new().build();
        host.register(
            delivery.id().emitter_chain,
            delivery.id().emitter_address,
            handler,
        );
        (host, store)
    }

    #[tokio::test]
    async fn zero_attempts_is_rejected() {
        let store = SqliteRelayStore::new(setup_test_db().await);

        assert!(matches!(
            JobHost::new(store, fast_config(0)),
            Err(JobError::NoAttempts)
        ));
    }

    #[tokio::test]
    async fn success_on_first_attempt_records_waiting_relay() {
        let handler = Arc::new(ScriptedHandler::new(vec![]));
        let (host, store) = host_with(handler.clone(), 3).await;
        let delivery = DeliveryBuilder::new().build();

        let disposition = host.submit(delivery.clone()).await.unwrap();

        assert_eq!(disposition, Disposition::Completed { attempts: 1 });
        assert_eq!(handler.calls(), 1);
        let relay = store.find_by_key(&delivery.id()).await.unwrap().unwrap();
        assert_eq!(relay.from_tx_hash, Some(delivery.source_tx_hash));
        assert_eq!(relay.vaa, delivery.message.raw);
        assert_eq!(relay.max_attempts, 3);
    }

    #[tokio::test]
    #[traced_test]
    async fn retryable_outcomes_are_retried_with_attempt_numbers() {
        let handler = Arc::new(ScriptedHandler::new(vec![
            JobOutcome::Retryable("rpc down".into()),
            JobOutcome::Retryable("rpc down".into()),
        ]));
        let (host, _store) = host_with(handler.clone(), 3).await;

        let disposition = host.submit(DeliveryBuilder::new().build()).await.unwrap();

        assert_eq!(disposition, Disposition::Completed { attempts: 3 });
        let attempts = handler.attempts.lock().unwrap().clone();
        assert_eq!(
            attempts,
            vec![
                Attempt { number: 1, max: 3 },
                Attempt { number: 2, max: 3 },
                Attempt { number: 3, max: 3 },
            ]
        );
        assert!(logs_contain("Delivery failed, retrying"));
        assert!(logs_contain("attempt=2/3"));
    }

    #[tokio::test]
    async fn single_attempt_budget_exhausts_without_retrying() {
        let handler = Arc::new(ScriptedHandler::new(vec![JobOutcome::Retryable(
            "rpc down".into(),
        )]));
        let (host, _store) = host_with(handler.clone(), 1).await;

        let disposition = host.submit(DeliveryBuilder::new().build()).await.unwrap();

        assert_eq!(
            disposition,
            Disposition::Exhausted {
                attempts: 1,
                reason: "rpc down".into()
            }
        );
        assert_eq!(handler.calls(), 1);
    }

    #[tokio::test]
    async fn retries_stop_at_max_attempts() {
        let handler = Arc::new(ScriptedHandler::new(vec![
            JobOutcome::Retryable("timeout".into());
            5
        ]));
        let (host, _store) = host_with(handler.clone(), 2).await;

        let disposition = host.submit(DeliveryBuilder::new().build()).await.unwrap();

        assert_eq!(
            disposition,
            Disposition::Exhausted {
                attempts: 2,
                reason: "timeout".into()
            }
        );
        assert_eq!(handler.calls(), 2);
    }

    #[tokio::test]
    async fn unrecoverable_outcome_is_never_retried() {
        let handler = Arc::new(ScriptedHandler::new(vec![JobOutcome::Unrecoverable(
            "bad payload".into(),
        )]));
        let (host, _store) = host_with(handler.clone(), 5).await;

        let disposition = host.submit(DeliveryBuilder::new().build()).await.unwrap();

        assert_eq!(
            disposition,
            Disposition::Unrecoverable {
                attempts: 1,
                reason: "bad payload".into()
            }
        );
        assert_eq!(handler.calls(), 1);
    }

    #[tokio::test]
    async fn filtered_delivery_is_not_recorded() {
        let handler = Arc::new(ScriptedHandler::rejecting());
        let (host, store) = host_with(handler.clone(), 3).await;
        let delivery = DeliveryBuilder::new().build();

        let disposition = host.submit(delivery.clone()).await.unwrap();

        assert_eq!(disposition, Disposition::Filtered);
        assert_eq!(handler.calls(), 0);
        assert!(store.find_by_key(&delivery.id()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unknown_emitter_is_unrouted() {
        let handler = Arc::new(ScriptedHandler::new(vec![]));
        let (host, _store) = host_with(handler.clone(), 3).await;
        let delivery = DeliveryBuilder::new()
            .with_emitter(Address::repeat_byte(0x99).into_word())
            .build();

        assert_eq!(host.submit(delivery).await.unwrap(), Disposition::Unrouted);
        assert_eq!(handler.calls(), 0);
    }

    #[tokio::test]
    async fn duplicate_submission_keeps_one_record() {
        let handler = Arc::new(ScriptedHandler::new(vec![]));
        let (host, store) = host_with(handler.clone(), 3).await;
        let delivery = DeliveryBuilder::new().build();

        host.submit(delivery.clone()).await.unwrap();
        host.reprocess(delivery).await.unwrap();

        assert_eq!(handler.calls(), 2);
        let waiting = store.list_by_status(RelayStatus::Waiting, 10).await.unwrap();
        assert_eq!(waiting.len(), 1);
    }

    #[tokio::test]
    async fn run_bounds_concurrency() {
        let handler = Arc::new(ScriptedHandler::new(vec![]));
        let (host, _store) = host_with(handler.clone(), 3).await;
        let deliveries: Vec<_> = (1..=8)
            .map(|sequence| DeliveryBuilder::new().with_sequence(sequence).build())
            .collect();

        let summary = host.run(futures_util::stream::iter(deliveries)).await;

        assert_eq!(
            summary,
            RunSummary {
                completed: 8,
                ..RunSummary::default()
            }
        );
        assert!(handler.peak.load(Ordering::SeqCst) <= 3);
        assert!(handler.peak.load(Ordering::SeqCst) >= 2);
    }
}
