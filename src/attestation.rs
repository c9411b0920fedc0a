//! Attestation service client.
//!
//! Polls `GET {base}/attestations/{message_hash}` until the burn message
//! is attested. The poll interval starts at a chain-dependent value and
//! halves on every iteration down to a floor, so an attestation that is
//! already available is picked up quickly while slow-finality chains are
//! not hammered. Rate limiting switches to a long fixed cooldown.
//!
//! The interval sequence never ends, so [`Attester::get_attestation`]
//! only returns once an attestation exists. Callers bound it with their
//! own deadline.

use std::collections::HashMap;
use std::time::Duration;

use alloy::primitives::{B256, Bytes};
use async_trait::async_trait;
use backon::Retryable;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, info, warn};
use url::Url;

use crate::chain::ChainId;

/// Source of attestations for burn messages.
#[async_trait]
pub trait Attester: Send + Sync {
    /// Suspends until the attestation for `message_hash` is available.
    async fn get_attestation(
        &self,
        message_hash: B256,
        source_chain: ChainId,
    ) -> Result<Bytes, AttestationError>;
}

/// Outcome of a single poll that did not yield an attestation.
#[derive(Debug, thiserror::Error)]
pub enum AttestationError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid hex encoding: {0}")]
    HexDecode(#[from] alloy::hex::FromHexError),
    #[error("attestation pending: {status}")]
    Pending { status: String },
    #[error("attestation not yet observed")]
    NotFound,
    #[error("attestation service rate limited")]
    RateLimited,
    #[error("unexpected HTTP status {status}")]
    UnexpectedStatus { status: u16 },
    #[error("attestation response missing required field: {field}")]
    MissingField { field: &'static str },
}

#[derive(Debug, Clone)]
pub struct AttestationPolicy {
    pub default_initial_timeout: Duration,
    pub initial_timeouts: HashMap<ChainId, Duration>,
    pub floor: Duration,
    pub rate_limit_cooldown: Duration,
    pub request_timeout: Duration,
}

impl Default for AttestationPolicy {
    fn default() -> Self {
        Self {
            default_initial_timeout: Duration::from_millis(8_000),
            initial_timeouts: HashMap::from([(ChainId::ETHEREUM, Duration::from_millis(20_000))]),
            floor: Duration::from_millis(900),
            rate_limit_cooldown: Duration::from_secs(5 * 60),
            request_timeout: Duration::from_millis(1_200),
        }
    }
}

impl AttestationPolicy {
    pub fn initial_timeout(&self, chain: ChainId) -> Duration {
        self.initial_timeouts
            .get(&chain)
            .copied()
            .unwrap_or(self.default_initial_timeout)
    }

    /// Poll intervals for `chain`: the initial timeout, halved each step,
    /// never below the floor.
    pub fn intervals(
        &self,
        chain: ChainId,
    ) -> impl Iterator<Item = Duration> + Send + Sync + Unpin + use<> {
        let floor = self.floor;
        std::iter::successors(Some(self.initial_timeout(chain).max(floor)), move |previous| {
            Some((*previous / 2).max(floor))
        })
    }
}

#[derive(Deserialize, Debug)]
struct AttestationResponse {
    status: String,
    attestation: Option<String>,
}

pub struct AttestationClient {
    http_client: reqwest::Client,
    base_url: Url,
    policy: AttestationPolicy,
}

impl AttestationClient {
    pub fn new(base_url: Url, policy: AttestationPolicy) -> Result<Self, reqwest::Error> {
        let http_client = reqwest::Client::builder()
            .timeout(policy.request_timeout)
            .build()?;

        Ok(Self {
            http_client,
            base_url,
            policy,
        })
    }

    fn attestation_url(&self, message_hash: B256) -> String {
        format!(
            "{}/attestations/{message_hash}",
            self.base_url.as_str().trim_end_matches('/')
        )
    }

    async fn poll_once(&self, url: &str) -> Result<Bytes, AttestationError> {
        let response = self.http_client.get(url).send().await?;

        match response.status() {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => return Err(AttestationError::NotFound),
            StatusCode::TOO_MANY_REQUESTS => return Err(AttestationError::RateLimited),
            status => {
                return Err(AttestationError::UnexpectedStatus {
                    status: status.as_u16(),
                });
            }
        }

        let body: AttestationResponse = response.json().await?;

        if body.status != "complete" {
            return Err(AttestationError::Pending {
                status: body.status,
            });
        }

        let attestation = body.attestation.ok_or(AttestationError::MissingField {
            field: "attestation",
        })?;

        Ok(Bytes::from(alloy::hex::decode(attestation)?))
    }
}

#[async_trait]
impl Attester for AttestationClient {
    #[tracing::instrument(skip(self), level = tracing::Level::DEBUG)]
    async fn get_attestation(
        &self,
        message_hash: B256,
        source_chain: ChainId,
    ) -> Result<Bytes, AttestationError> {
        let url = self.attestation_url(message_hash);
        info!(%url, "Polling attestation API");

        let cooldown = self.policy.rate_limit_cooldown;

        let attestation = (|| self.poll_once(&url))
            .retry(self.policy.intervals(source_chain))
            .adjust(|err, interval| match err {
                AttestationError::RateLimited => Some(cooldown),
                _ => interval,
            })
            .notify(|err, delay| match err {
                AttestationError::Pending { status } => {
                    debug!(%status, ?delay, "Attestation pending, retrying");
                }
                AttestationError::NotFound => {
                    debug!(?delay, "Attestation not observed yet, retrying");
                }
                AttestationError::RateLimited => {
                    warn!(cooldown = ?delay, "Attestation API rate limited, cooling down");
                }
                err => warn!(?err, ?delay, "Attestation error, retrying"),
            })
            .await?;

        info!("Attestation complete");
        Ok(attestation)
    }
}
