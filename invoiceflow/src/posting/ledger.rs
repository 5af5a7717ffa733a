//! External ledger client.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::config::PostingConfig;

#[derive(Debug, Error)]
pub enum LedgerError {
    /// Throttling, server errors or the network itself. Retry with backoff.
    #[error("transient ledger failure: {0}")]
    Transient(String),
    /// The ledger understood the request and said no. Retrying the same
    /// payload will not change its mind.
    #[error("ledger rejected posting: {0}")]
    Rejected(String),
}

/// Whether a response status is worth retrying: throttling and any 5xx.
/// 501 and the other 4xx are deliberate answers, not outages.
fn is_retryable_status(status: reqwest::StatusCode) -> bool {
    status == reqwest::StatusCode::TOO_MANY_REQUESTS
        || (status.is_server_error()
            && status != reqwest::StatusCode::NOT_IMPLEMENTED)
}

/// The slice of an invoice the ledger cares about. The amount serializes
/// as a decimal string, never a float.
#[derive(Clone, Debug, Serialize)]
pub struct LedgerPosting {
    pub id: Uuid,
    pub vendor: Option<String>,
    pub invoice_number: Option<String>,
    pub amount: Decimal,
}

#[derive(Clone, Debug, Deserialize)]
pub struct LedgerReceipt {
    pub reference: String,
}

#[async_trait]
pub trait LedgerClient: Send + Sync {
    async fn post_invoice(
        &self,
        posting: &LedgerPosting,
    ) -> Result<LedgerReceipt, LedgerError>;
}

pub struct HttpLedgerClient {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpLedgerClient {
    pub fn new(config: &PostingConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(
                config.request_timeout_secs,
            ))
            .build()?;
        Ok(Self {
            client,
            base_url: config.ledger_url.trim_end_matches('/').to_string(),
            token: config.ledger_token.clone(),
        })
    }
}

#[async_trait]
impl LedgerClient for HttpLedgerClient {
    async fn post_invoice(
        &self,
        posting: &LedgerPosting,
    ) -> Result<LedgerReceipt, LedgerError> {
        let response = self
            .client
            .post(format!("{}/invoices", self.base_url))
            .bearer_auth(&self.token)
            .json(posting)
            .send()
            .await
            .map_err(|err| LedgerError::Transient(err.to_string()))?;

        let status = response.status();
        if is_retryable_status(status) {
            return Err(LedgerError::Transient(format!("ledger: {status}")));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LedgerError::Rejected(format!(
                "ledger: {status}: {body}"
            )));
        }

        response
            .json()
            .await
            .map_err(|err| LedgerError::Rejected(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    #[test]
    fn throttling_and_every_server_error_are_retryable() {
        for code in [429u16, 500, 502, 503, 504, 505, 507, 599] {
            let status = StatusCode::from_u16(code).unwrap();
            assert!(is_retryable_status(status), "{code} should be retried");
        }
    }

    #[test]
    fn deliberate_answers_are_terminal() {
        for code in [200u16, 201, 400, 401, 403, 404, 409, 422, 501] {
            let status = StatusCode::from_u16(code).unwrap();
            assert!(
                !is_retryable_status(status),
                "{code} should not be retried"
            );
        }
    }
}
