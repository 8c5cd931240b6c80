use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use starknet_api::hash::StarkFelt;

use crate::felt::felt_hex;
use crate::state_update::StateUpdate;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 20;
const MAX_BACKOFF: Duration = Duration::from_secs(60);

#[derive(thiserror::Error, Debug)]
pub enum UpstreamError {
    #[error("send fail: {0}")]
    Request(#[from] reqwest::Error),
    #[error("code status: {0}")]
    Status(u16),
    #[error("max attempts")]
    MaxAttempts,
    #[error("serialisation: {0}")]
    Decode(String),
}

/// Source of class definitions for classes seen for the first time.
#[async_trait]
pub trait ClassSource: Send + Sync {
    /// Raw JSON of the class ABI, `None` when the class has none.
    async fn class_abi(&self, hash: &StarkFelt) -> Result<Option<Vec<u8>>, UpstreamError>;
}

#[derive(Deserialize, Debug)]
struct ClassDefinition {
    #[serde(default)]
    abi: Option<serde_json::Value>,
}

/// Client of the sequencer feeder gateway.
pub struct FeederGateway {
    client: reqwest::Client,
    base_url: String,
    max_attempts: u32,
    backoff: Duration,
}

impl FeederGateway {
    pub fn new(base_url: impl Into<String>, max_attempts: u32) -> Self {
        FeederGateway {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            max_attempts,
            backoff: Duration::from_secs(1),
        }
    }

    /// Base delay of the exponential backoff between attempts.
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub async fn state_update(&self, block_number: u64) -> Result<StateUpdate, UpstreamError> {
        let url = format!(
            "{}/get_state_update?blockNumber={}",
            self.base_url, block_number
        );
        self.get_json(&url).await
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, UpstreamError> {
        let mut attempts = 0;

        while attempts <= self.max_attempts {
            let response = self.client.get(url).send().await?;
            let status = response.status();

            match status {
                reqwest::StatusCode::OK => {
                    return response
                        .json::<T>()
                        .await
                        .map_err(|e| UpstreamError::Decode(e.to_string()));
                }
                reqwest::StatusCode::TOO_MANY_REQUESTS => {
                    log::info!("Too many requests, waiting...");
                }
                status if status.is_server_error() => {
                    log::info!("code status: {status}, waiting...");
                }
                status => return Err(UpstreamError::Status(status.as_u16())),
            }

            let wait_time = self
                .backoff
                .saturating_mul(2u32.saturating_pow(attempts))
                .min(MAX_BACKOFF);
            tokio::time::sleep(wait_time).await;
            attempts += 1;
        }
        Err(UpstreamError::MaxAttempts)
    }
}

#[async_trait]
impl ClassSource for FeederGateway {
    async fn class_abi(&self, hash: &StarkFelt) -> Result<Option<Vec<u8>>, UpstreamError> {
        let url = format!(
            "{}/get_class_by_hash?classHash=0x{}",
            self.base_url,
            felt_hex(hash)
        );
        let definition: ClassDefinition = self.get_json(&url).await?;

        // Sierra classes carry the ABI as a JSON string, legacy ones as an array.
        match definition.abi {
            None | Some(serde_json::Value::Null) => Ok(None),
            Some(serde_json::Value::String(abi)) => Ok(Some(abi.into_bytes())),
            Some(abi) => serde_json::to_vec(&abi)
                .map(Some)
                .map_err(|e| UpstreamError::Decode(e.to_string())),
        }
    }
}
