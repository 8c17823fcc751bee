use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::config::BillingConfig;
use crate::errors::ServiceError;

/// Buyer identity on a billing document: company plus tax id when provided,
/// otherwise the personal name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentBuyer {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub company_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tax_id: Option<String>,
    pub email: String,
    pub address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentLine {
    pub description: String,
    pub quantity: i32,
    pub unit_price: Decimal,
    pub line_total: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueDocumentRequest {
    pub order_number: String,
    /// Partition scope this document covers (`full`, `accessories`, `clothing`)
    pub scope: String,
    pub buyer: DocumentBuyer,
    pub lines: Vec<DocumentLine>,
    pub shipping: Decimal,
    pub discount: Decimal,
    pub total: Decimal,
    pub currency: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssuedDocument {
    pub document_ref: String,
}

/// Boundary to the external billing document service.
#[async_trait]
pub trait BillingProvider: Send + Sync {
    async fn issue_document(
        &self,
        request: &IssueDocumentRequest,
    ) -> Result<IssuedDocument, ServiceError>;
}

pub struct HttpBillingProvider {
    client: Client,
    base_url: String,
    api_key: String,
}

impl HttpBillingProvider {
    pub fn new(cfg: &BillingConfig) -> Result<Self, ServiceError> {
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
impl BillingProvider for HttpBillingProvider {
    async fn issue_document(
        &self,
        request: &IssueDocumentRequest,
    ) -> Result<IssuedDocument, ServiceError> {
        let url = format!("{}/v1/documents", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .await
            .map_err(|e| ServiceError::BillingProvider(format!("issue request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(ServiceError::BillingProvider(format!(
                "issue request returned {}",
                response.status()
            )));
        }

        response
            .json()
            .await
            .map_err(|e| ServiceError::BillingProvider(format!("invalid document response: {e}")))
    }
}
