//! HTTP swap gateway client.

use super::traits::SwapGateway;
use super::types::{SwapQuote, SwapRequest, SwapRequestBody, SwapResponse};
use crate::config::SwapConfig;
use alloy_primitives::U256;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, instrument};

/// Swap gateway reached over HTTP. Any non-2xx response fails the quote.
#[derive(Debug, Clone)]
pub struct HttpSwapGateway {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    chain: String,
}

impl HttpSwapGateway {
    pub fn new(config: &SwapConfig, chain: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone().filter(|k| !k.is_empty()),
            chain: chain.to_string(),
        })
    }
}

#[async_trait]
impl SwapGateway for HttpSwapGateway {
    #[instrument(skip(self), fields(input = %request.input_token, output = %request.output_token))]
    async fn quote(&self, request: &SwapRequest) -> Result<SwapQuote> {
        let url = format!("{}/swap", self.base_url);
        let body = SwapRequestBody::new(&self.chain, request);

        let mut builder = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.header("x-api-key", key);
        }

        let response = builder
            .send()
            .await
            .context("Failed to send swap request")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Swap gateway error {}: {}", status, body);
        }

        let data: SwapResponse = response
            .json()
            .await
            .context("Failed to parse swap response")?;

        let amount_out = data
            .amount_out
            .as_deref()
            .map(|s| s.parse::<U256>())
            .transpose()
            .context("Invalid amountOut in swap response")?;

        debug!(router = %data.router, calldata_len = data.calldata.len(), "Swap quote received");

        Ok(SwapQuote {
            router: data.router,
            calldata: data.calldata,
            amount_out,
        })
    }
}
