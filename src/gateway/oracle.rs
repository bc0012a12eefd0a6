//! HTTP yield oracle client.

use super::traits::YieldOracle;
use super::types::{YieldOpportunity, YieldRequest, YieldResponse};
use crate::config::OracleConfig;
use crate::ledger::VaultInfo;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::{debug, instrument};

/// Yield oracle reached over HTTP.
#[derive(Debug, Clone)]
pub struct HttpYieldOracle {
    client: Client,
    base_url: String,
    chain: String,
}

impl HttpYieldOracle {
    pub fn new(config: &OracleConfig, chain: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            chain: chain.to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl YieldOracle for HttpYieldOracle {
    #[instrument(skip(self), fields(vault = %vault.address))]
    async fn get_yield(&self, vault: &VaultInfo) -> Result<Option<YieldOpportunity>> {
        let url = format!("{}/yield", self.base_url);
        let request = YieldRequest {
            chain: self.chain.clone(),
            pool_address: vault.address,
            lp_token_address: vault.address,
            input_token: vault.asset,
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .context("Failed to send yield request")?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            debug!("Oracle has no data for vault");
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Yield oracle error {}: {}", status, body);
        }

        let data: YieldResponse = response
            .json()
            .await
            .context("Failed to parse yield response")?;

        Ok(data.summarize().map(|(apy, apr)| YieldOpportunity {
            vault: vault.address,
            asset: vault.asset,
            apy,
            apr,
            timestamp: Utc::now(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::Address;
    use rust_decimal_macros::dec;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn vault() -> VaultInfo {
        VaultInfo {
            address: Address::repeat_byte(0x0a),
            asset: Address::repeat_byte(0x01),
        }
    }

    fn oracle(uri: String) -> HttpYieldOracle {
        HttpYieldOracle::new(
            &OracleConfig {
                base_url: uri,
                timeout_secs: 5,
            },
            "base",
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_get_yield_from_series() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/yield"))
            .and(body_partial_json(serde_json::json!({"chain": "base"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [{"apy": 3.0}, {"apy": 5.0}]
            })))
            .mount(&mock_server)
            .await;

        let reading = oracle(mock_server.uri())
            .get_yield(&vault())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(reading.apy, dec!(4));
        assert_eq!(reading.vault, vault().address);
    }

    #[tokio::test]
    async fn test_not_found_is_no_opportunity() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/yield"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&mock_server)
            .await;

        let reading = oracle(mock_server.uri()).get_yield(&vault()).await.unwrap();
        assert!(reading.is_none());
    }

    #[tokio::test]
    async fn test_server_error_is_reported() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/yield"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&mock_server)
            .await;

        let result = oracle(mock_server.uri()).get_yield(&vault()).await;
        assert!(result.unwrap_err().to_string().contains("503"));
    }
}
