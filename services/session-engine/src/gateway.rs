//! Execution gateway client
//!
//! HTTP client for the external signer/DEX gateway used in live mode. The
//! gateway owns keys and routing; this client only maps the engine's
//! collaborator traits onto its REST API.

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::amount::{from_lamports, to_lamports};
use crate::error::{EngineError, Result};
use crate::types::TokenType;
use crate::venue::{
    ChainClient, ProvisionedWallet, SwapReceipt, SwapRequest, TokenValidator, TokenVerdict,
    TradingVenue, WalletProvisioner,
};

/// Which call failed; decides how a 4xx is classified
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallKind {
    Read,
    Trade,
    Validation,
}

/// Client for the execution gateway
pub struct GatewayClient {
    client: Client,
    base_url: String,
}

impl GatewayClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn decode<T: DeserializeOwned>(response: Response, kind: CallKind) -> Result<T> {
        let status = response.status();
        if status.is_success() {
            return Ok(response.json().await?);
        }

        let text = response.text().await.unwrap_or_default();
        Err(classify_status(status, &text, kind))
    }
}

/// Map a non-success gateway status onto the engine taxonomy
fn classify_status(status: StatusCode, body: &str, kind: CallKind) -> EngineError {
    let message = format!("gateway returned {} - {}", status, body);

    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        return EngineError::TransientInfra(message);
    }

    match kind {
        CallKind::Validation => EngineError::Validation(message),
        CallKind::Trade | CallKind::Read => EngineError::PersistentTrade(message),
    }
}

/// Balances and transfers travel as whole lamports
#[derive(Debug, Deserialize)]
struct BalanceResponse {
    lamports: u64,
}

#[derive(Debug, Serialize)]
struct TransferRequest<'a> {
    from: &'a str,
    to: &'a str,
    lamports: u64,
}

#[derive(Debug, Deserialize)]
struct SignatureResponse {
    signature: String,
}

#[async_trait]
impl WalletProvisioner for GatewayClient {
    async fn provision(&self) -> Result<ProvisionedWallet> {
        let url = format!("{}/v1/wallets", self.base_url);
        let response = self.client.post(&url).send().await?;
        let wallet: ProvisionedWallet = Self::decode(response, CallKind::Read).await?;
        debug!("Gateway provisioned wallet {}", wallet.address);
        Ok(wallet)
    }
}

#[async_trait]
impl ChainClient for GatewayClient {
    async fn get_balance(&self, address: &str) -> Result<Decimal> {
        let url = format!("{}/v1/wallets/{}/balance", self.base_url, address);
        let response = self.client.get(&url).send().await?;
        let body: BalanceResponse = Self::decode(response, CallKind::Read).await?;
        Ok(from_lamports(body.lamports))
    }

    async fn transfer(&self, from: &str, to: &str, amount: Decimal) -> Result<String> {
        let lamports = to_lamports(amount)?;
        let url = format!("{}/v1/transfers", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&TransferRequest { from, to, lamports })
            .send()
            .await?;
        let body: SignatureResponse = Self::decode(response, CallKind::Trade).await?;
        Ok(body.signature)
    }
}

#[async_trait]
impl TradingVenue for GatewayClient {
    async fn submit_swap(&self, request: &SwapRequest) -> Result<SwapReceipt> {
        let url = format!("{}/v1/swaps", self.base_url);
        let response = self.client.post(&url).json(request).send().await?;
        Self::decode(response, CallKind::Trade).await
    }
}

#[async_trait]
impl TokenValidator for GatewayClient {
    async fn validate(&self, token_address: &str, token_type: TokenType) -> Result<TokenVerdict> {
        let url = format!("{}/v1/tokens/{}/validate", self.base_url, token_address);
        let response = self
            .client
            .get(&url)
            .query(&[("token_type", token_type)])
            .send()
            .await?;
        Self::decode(response, CallKind::Validation).await
    }
}
