//! HTTP client for the dead drop.
//!
//! Drop, list, and fetch retry up to 4 times with exponential backoff capped
//! at 30 seconds, then surface the final failure. Confirm is best-effort: a
//! blob that outlives its confirm is collected by the dead drop's TTL sweep.

use anyhow::{bail, Context, Result};
use std::time::Duration;

use crate::crypto::{seal, SealedPayload, KEY_LEN};
use crate::relay::{Channel, ConversationDrop, DropReceipt, PickupList};

const MAX_ATTEMPTS: u32 = 4;
const MAX_BACKOFF: Duration = Duration::from_secs(30);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Client for one dead drop, authenticated by bearer token.
pub struct RelayClient {
    base_url: String,
    token: String,
    http: reqwest::Client,
}

impl RelayClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Result<Self> {
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            http: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .context("failed to build HTTP client")?,
        })
    }

    /// Seal a conversation payload and drop it on the `conversations` channel.
    pub async fn drop_conversation(
        &self,
        key: &[u8; KEY_LEN],
        payload: &ConversationDrop,
    ) -> Result<DropReceipt> {
        let plaintext = serde_json::to_vec(payload)?;
        let sealed = seal(&plaintext, key)?;
        self.drop_blob(Channel::Conversations, serde_json::to_vec(&sealed)?)
            .await
    }

    /// POST an opaque body to `/drop/<channel>`.
    pub async fn drop_blob(&self, channel: Channel, body: Vec<u8>) -> Result<DropReceipt> {
        let url = format!("{}/drop/{channel}", self.base_url);
        let response = self
            .request_with_retry(|| {
                self.http
                    .post(&url)
                    .bearer_auth(&self.token)
                    .header("Content-Type", "application/octet-stream")
                    .body(body.clone())
            })
            .await?;
        Ok(response.json().await?)
    }

    /// GET `/pickup/<channel>` — enumerate waiting blobs.
    pub async fn list(&self, channel: Channel) -> Result<PickupList> {
        let url = format!("{}/pickup/{channel}", self.base_url);
        let response = self
            .request_with_retry(|| self.http.get(&url).bearer_auth(&self.token))
            .await?;
        Ok(response.json().await?)
    }

    /// GET `/pickup/<channel>/<id>` — the raw sealed bytes.
    pub async fn fetch(&self, channel: Channel, id: &str) -> Result<Vec<u8>> {
        let url = format!("{}/pickup/{channel}/{id}", self.base_url);
        let response = self
            .request_with_retry(|| self.http.get(&url).bearer_auth(&self.token))
            .await?;
        Ok(response.bytes().await?.to_vec())
    }

    /// DELETE `/confirm/<channel>/<id>`. Best-effort: failures are logged and
    /// swallowed.
    pub async fn confirm(&self, channel: Channel, id: &str) {
        let url = format!("{}/confirm/{channel}/{id}", self.base_url);
        let result = self
            .http
            .delete(&url)
            .bearer_auth(&self.token)
            .send()
            .await;
        match result {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => {
                tracing::warn!(%channel, id, status = %response.status(), "confirm failed");
            }
            Err(e) => {
                tracing::warn!(%channel, id, error = %e, "confirm failed");
            }
        }
    }

    async fn request_with_retry(
        &self,
        build: impl Fn() -> reqwest::RequestBuilder,
    ) -> Result<reqwest::Response> {
        let mut attempt = 1;
        loop {
            let outcome = build().send().await;
            match outcome {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => {
                    let status = response.status();
                    let body = response.text().await.unwrap_or_default();
                    if attempt >= MAX_ATTEMPTS {
                        bail!("relay request failed with {status}: {body}");
                    }
                    tracing::warn!(attempt, %status, "relay request failed, retrying");
                }
                Err(e) => {
                    if attempt >= MAX_ATTEMPTS {
                        return Err(e).context("relay request failed");
                    }
                    tracing::warn!(attempt, error = %e, "relay request errored, retrying");
                }
            }

            let delay = Duration::from_secs(1 << (attempt - 1)).min(MAX_BACKOFF);
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

/// Parse fetched bytes as a sealed envelope.
pub fn parse_sealed(bytes: &[u8]) -> Result<SealedPayload> {
    serde_json::from_slice(bytes).context("blob is not a sealed envelope")
}
