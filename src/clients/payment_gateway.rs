use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::config::GatewayConfig;
use crate::errors::ServiceError;

/// Line item forwarded to the gateway's hosted checkout page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayLineItem {
    pub name: String,
    pub quantity: i32,
    /// Unit price in the gateway's smallest currency unit
    pub unit_amount: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    /// Our order number, echoed back in webhook notifications
    pub reference: String,
    /// Order total in the gateway's smallest currency unit
    pub amount: i64,
    pub currency: String,
    pub buyer_name: String,
    pub buyer_email: String,
    pub line_items: Vec<GatewayLineItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewaySession {
    pub session_id: String,
    pub redirect_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewaySessionStatus {
    pub session_id: String,
    pub status: String,
}

/// Boundary to the external payment gateway. Services depend on this trait;
/// the HTTP implementation below is swapped for a recording stub in tests.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_session(
        &self,
        request: &CreateSessionRequest,
    ) -> Result<GatewaySession, ServiceError>;

    /// One-shot status poll, used as a fallback when no webhook has arrived.
    async fn fetch_status(&self, session_id: &str) -> Result<GatewaySessionStatus, ServiceError>;
}

pub struct HttpPaymentGateway {
    client: Client,
    base_url: String,
    api_key: String,
}

impl HttpPaymentGateway {
    pub fn new(cfg: &GatewayConfig) -> Result<Self, ServiceError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.request_timeout_secs))
            .build()
            .map_err(|e| ServiceError::InternalError(format!("HTTP client build failed: {e}")))?;
        Ok(Self {
            client,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            api_key: cfg.api_key.clone(),
        })
    }
}

#[async_trait]
impl PaymentGateway for HttpPaymentGateway {
    async fn create_session(
        &self,
        request: &CreateSessionRequest,
    ) -> Result<GatewaySession, ServiceError> {
        let url = format!("{}/v1/checkout/sessions", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .await
            .map_err(|e| ServiceError::PaymentGateway(format!("session create failed: {e}")))?;

        if !response.status().is_success() {
            return Err(ServiceError::PaymentGateway(format!(
                "session create returned {}",
                response.status()
            )));
        }

        response
            .json()
            .await
            .map_err(|e| ServiceError::PaymentGateway(format!("invalid session response: {e}")))
    }

    async fn fetch_status(&self, session_id: &str) -> Result<GatewaySessionStatus, ServiceError> {
        let url = format!("{}/v1/checkout/sessions/{}", self.base_url, session_id);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| ServiceError::PaymentGateway(format!("status poll failed: {e}")))?;

        if !response.status().is_success() {
            return Err(ServiceError::PaymentGateway(format!(
                "status poll returned {}",
                response.status()
            )));
        }

        response
            .json()
            .await
            .map_err(|e| ServiceError::PaymentGateway(format!("invalid status response: {e}")))
    }
}
