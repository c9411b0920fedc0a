//! Client for the guardian network's public message index, used to fetch
//! a signed message and its source transaction when reprocessing.

use alloy::primitives::TxHash;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::debug;
use url::Url;

use crate::job::Delivery;
use crate::vaa::{MessageId, SignedMessage, VaaError};

#[derive(Debug, thiserror::Error)]
pub enum GuardianError {
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("message {0} not found")]
    NotFound(MessageId),
    #[error("API error (status {status}): {message}")]
    Api { status: StatusCode, message: String },
    #[error("invalid base64 message: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("invalid source transaction hash {0:?}")]
    TxHash(String),
    #[error(transparent)]
    Vaa(#[from] VaaError),
    #[error("fetched message is {actual}, requested {requested}")]
    WrongMessage {
        requested: MessageId,
        actual: MessageId,
    },
}

#[derive(Deserialize)]
struct VaaResponse {
    data: VaaData,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct VaaData {
    vaa: String,
    tx_hash: String,
}

pub struct GuardianApi {
    client: reqwest::Client,
    base_url: Url,
}

impl GuardianApi {
    pub fn new(base_url: Url) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
        }
    }

    fn vaa_url(&self, id: &MessageId) -> String {
        format!(
            "{}/api/v1/vaas/{}/{}/{}",
            self.base_url.as_str().trim_end_matches('/'),
            id.emitter_chain,
            alloy::hex::encode(id.emitter_address),
            id.sequence
        )
    }

    /// Fetches the signed message `id` together with its source
    /// transaction hash.
    pub async fn fetch(&self, id: MessageId) -> Result<Delivery, GuardianError> {
        let url = self.vaa_url(&id);
        debug!(%url, "Fetching signed message");

        let response = self.client.get(&url).send().await?;

        match response.status() {
            status if status.is_success() => {}
            StatusCode::NOT_FOUND => return Err(GuardianError::NotFound(id)),
            status => {
                let message = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "Unknown error".to_string());
                return Err(GuardianError::Api { status, message });
            }
        }

        let body: VaaResponse = response.json().await?;
        let raw = STANDARD.decode(body.data.vaa)?;
        let message = SignedMessage::parse(&raw)?;

        if message.id != id {
            return Err(GuardianError::WrongMessage {
                requested: id,
                actual: message.id,
            });
        }

        let source_tx_hash = body
            .data
            .tx_hash
            .parse::<TxHash>()
            .map_err(|_| GuardianError::TxHash(body.data.tx_hash.clone()))?;

        Ok(Delivery {
            message,
            source_tx_hash,
        })
    }
}
