//! HTTP client for the optional remote accelerator service.
//!
//! The accelerator is untrusted and optional: absence or failure never
//! surfaces to the engine's own callers, it only makes lookups slower.

use crate::card_store::CardRecord;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::time::Duration;

/// Fast remote lookup tier. `Ok(None)` is a structural miss; `Err` means the
/// tier is unavailable and the resolver should fall through.
#[async_trait]
pub trait AcceleratorTier: Send + Sync {
    /// Lightweight reachability probe with a short timeout.
    async fn probe(&self) -> Result<()>;

    async fn find_by_name(&self, name: &str, language: &str) -> Result<Option<CardRecord>>;

    async fn find_by_set_number(
        &self,
        set_code: &str,
        collector_number: &str,
        language: &str,
    ) -> Result<Option<CardRecord>>;
}

/// reqwest-backed accelerator client.
pub struct AcceleratorClient {
    client: reqwest::Client,
    base_url: String,
    probe_timeout: Duration,
    request_timeout: Duration,
}

impl AcceleratorClient {
    pub fn new(base_url: String, probe_timeout: Duration, request_timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .build()
            .expect("Failed to create HTTP client");

        let base_url = base_url.trim_end_matches('/').to_string();

        Self {
            client,
            base_url,
            probe_timeout,
            request_timeout,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn get_card(&self, url: String, query: &[(&str, &str)]) -> Result<Option<CardRecord>> {
        let response = self
            .client
            .get(&url)
            .query(query)
            .timeout(self.request_timeout)
            .send()
            .await
            .context("Failed to reach accelerator service")?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            anyhow::bail!("Accelerator returned status {}", response.status());
        }

        let card = response
            .json::<CardRecord>()
            .await
            .context("Failed to parse accelerator response")?;
        Ok(Some(card))
    }
}

#[async_trait]
impl AcceleratorTier for AcceleratorClient {
    async fn probe(&self) -> Result<()> {
        let url = format!("{}/health", self.base_url);
        let response = self
            .client
            .get(&url)
            .timeout(self.probe_timeout)
            .send()
            .await
            .context("Failed to reach accelerator health endpoint")?;

        if response.status().is_success() {
            Ok(())
        } else {
            anyhow::bail!(
                "Accelerator health check failed with status: {}",
                response.status()
            )
        }
    }

    async fn find_by_name(&self, name: &str, language: &str) -> Result<Option<CardRecord>> {
        let url = format!("{}/card/search", self.base_url);
        self.get_card(url, &[("name", name), ("lang", language)])
            .await
    }

    async fn find_by_set_number(
        &self,
        set_code: &str,
        collector_number: &str,
        language: &str,
    ) -> Result<Option<CardRecord>> {
        let url = format!(
            "{}/card/{}/{}/{}",
            self.base_url, set_code, collector_number, language
        );
        self.get_card(url, &[]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trailing_slash_removal() {
        let client = AcceleratorClient::new(
            "http://localhost:8080/".to_string(),
            Duration::from_secs(2),
            Duration::from_secs(10),
        );
        assert_eq!(client.base_url(), "http://localhost:8080");
    }
}
