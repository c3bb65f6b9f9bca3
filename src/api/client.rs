//! Inter-node HTTP client.
//!
//! Thin reqwest wrapper with the cluster's retry policy: transport failures
//! and 5xx responses retry with exponential backoff plus jitter, everything
//! else surfaces immediately. Peer error envelopes are decoded back into
//! typed errors so a forwarded failure looks the same as a local one.

use crate::config::Config;
use crate::error::{DocError, ErrorEnvelope, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;

#[derive(Clone)]
pub struct HttpClient {
    inner: reqwest::Client,
    timeout: Duration,
    max_retries: usize,
    backoff_ms: u64,
}

impl HttpClient {
    pub fn new(config: &Config) -> Self {
        Self {
            inner: reqwest::Client::new(),
            timeout: Duration::from_millis(config.request_timeout_ms),
            max_retries: config.max_retries,
            backoff_ms: config.retry_backoff_ms,
        }
    }

    pub async fn post_json<T: Serialize, R: DeserializeOwned>(
        &self,
        url: &str,
        payload: &T,
    ) -> Result<R> {
        let mut delay_ms = self.backoff_ms.max(1);
        let mut attempt = 0;

        loop {
            let response = self
                .inner
                .post(url)
                .json(payload)
                .timeout(self.timeout)
                .send()
                .await;

            match response {
                Ok(resp) if resp.status().is_success() => {
                    return Ok(resp.json::<R>().await?);
                }
                Ok(resp) if resp.status().is_server_error() && attempt < self.max_retries => {
                    tracing::debug!(
                        "Peer returned {} for {}, retrying in {} ms",
                        resp.status(),
                        url,
                        delay_ms
                    );
                }
                Ok(resp) => {
                    return Err(decode_error(resp).await);
                }
                Err(e) if attempt < self.max_retries => {
                    tracing::debug!("Request to {} failed ({}), retrying in {} ms", url, e, delay_ms);
                }
                Err(e) => return Err(DocError::Network(e.to_string())),
            }

            let jitter = rand::random::<u64>() % 50;
            tokio::time::sleep(Duration::from_millis(delay_ms + jitter)).await;
            delay_ms = (delay_ms * 2).min(2000);
            attempt += 1;
        }
    }
}

async fn decode_error(resp: reqwest::Response) -> DocError {
    let status = resp.status();
    match resp.json::<ErrorEnvelope>().await {
        Ok(envelope) => envelope.into_error(),
        Err(_) => DocError::Network(format!("peer returned {status}")),
    }
}
