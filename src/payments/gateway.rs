use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::config;

/// key: payment-gateway -> provider client seam
///
/// Status as reported by the provider. `Unknown` covers provider statuses the
/// core has no mapping for; it is never treated as terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayStatus {
    Pending,
    Approved,
    Rejected,
    Unknown,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    /// Timeouts and 5xx. Safe to retry; never changes ledger state.
    #[error("transient gateway error: {0}")]
    Transient(String),
    /// The provider rejected the request itself (4xx).
    #[error("gateway refused request: {0}")]
    Request(String),
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        GatewayError::Transient(err.to_string())
    }
}

/// Freshly created payment intent plus the presentation payload the front
/// end renders (PIX copy-paste code, QR image, fallback ticket link).
#[derive(Debug, Clone)]
pub struct PaymentIntent {
    pub intent_id: String,
    pub status: GatewayStatus,
    pub qr_code: String,
    pub qr_code_base64: String,
    pub ticket_url: String,
    pub expires_at: DateTime<Utc>,
}

#[async_trait]
pub trait GatewayClient: Send + Sync {
    async fn create_intent(
        &self,
        amount_cents: i64,
        payer_ref: &str,
        description: &str,
    ) -> Result<PaymentIntent, GatewayError>;

    /// Authoritative current status of an intent. Webhook payloads are only
    /// triggers; this call is the source of truth.
    async fn get_status(&self, intent_id: &str) -> Result<GatewayStatus, GatewayError>;
}

/// PIX-style HTTP client against a Mercado Pago shaped API.
pub struct PixGatewayClient {
    http: reqwest::Client,
    base_url: String,
    access_token: String,
    intent_ttl: Duration,
}

impl PixGatewayClient {
    pub fn new(base_url: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            access_token: access_token.into(),
            intent_ttl: Duration::minutes(*config::INTENT_TTL_MINUTES),
        }
    }

    pub fn from_env() -> Self {
        Self::new(
            config::GATEWAY_BASE_URL.clone(),
            config::GATEWAY_ACCESS_TOKEN.clone(),
        )
    }

    fn map_status(raw: &str) -> GatewayStatus {
        match raw {
            "approved" => GatewayStatus::Approved,
            "rejected" | "cancelled" => GatewayStatus::Rejected,
            "pending" | "in_process" | "authorized" => GatewayStatus::Pending,
            _ => GatewayStatus::Unknown,
        }
    }
}

#[async_trait]
impl GatewayClient for PixGatewayClient {
    async fn create_intent(
        &self,
        amount_cents: i64,
        payer_ref: &str,
        description: &str,
    ) -> Result<PaymentIntent, GatewayError> {
        let expires_at = Utc::now() + self.intent_ttl;
        let body = json!({
            "transaction_amount": amount_cents as f64 / 100.0,
            "payment_method_id": "pix",
            "payer": { "email": payer_ref },
            "description": description,
            "external_reference": format!("accessd_{}", Utc::now().timestamp()),
            "date_of_expiration": expires_at.to_rfc3339(),
        });

        let response = self
            .http
            .post(format!("{}/v1/payments", self.base_url))
            .bearer_auth(&self.access_token)
            .header("X-Idempotency-Key", Uuid::new_v4().to_string())
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if status.is_server_error() {
            return Err(GatewayError::Transient(format!(
                "intent creation returned {status}"
            )));
        }
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(GatewayError::Request(format!("{status}: {detail}")));
        }

        let data: Value = response.json().await?;
        let intent_id = match data.get("id") {
            Some(Value::String(id)) => id.clone(),
            Some(Value::Number(id)) => id.to_string(),
            _ => {
                return Err(GatewayError::Request(
                    "intent response missing id".to_string(),
                ))
            }
        };
        let reported = data.get("status").and_then(Value::as_str).unwrap_or("");
        let tx = data
            .pointer("/point_of_interaction/transaction_data")
            .cloned()
            .unwrap_or(Value::Null);
        let field = |key: &str| {
            tx.get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };

        Ok(PaymentIntent {
            intent_id,
            status: Self::map_status(reported),
            qr_code: field("qr_code"),
            qr_code_base64: field("qr_code_base64"),
            ticket_url: field("ticket_url"),
            expires_at,
        })
    }

    async fn get_status(&self, intent_id: &str) -> Result<GatewayStatus, GatewayError> {
        let response = self
            .http
            .get(format!("{}/v1/payments/{intent_id}", self.base_url))
            .bearer_auth(&self.access_token)
            .send()
            .await?;

        let status = response.status();
        if status.is_server_error() {
            return Err(GatewayError::Transient(format!(
                "status query returned {status}"
            )));
        }
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(GatewayStatus::Unknown);
        }
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(GatewayError::Request(format!("{status}: {detail}")));
        }

        let data: Value = response.json().await?;
        let reported = data.get("status").and_then(Value::as_str).unwrap_or("");
        Ok(Self::map_status(reported))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_status_mapping() {
        assert_eq!(
            PixGatewayClient::map_status("approved"),
            GatewayStatus::Approved
        );
        assert_eq!(
            PixGatewayClient::map_status("cancelled"),
            GatewayStatus::Rejected
        );
        assert_eq!(
            PixGatewayClient::map_status("in_process"),
            GatewayStatus::Pending
        );
        assert_eq!(
            PixGatewayClient::map_status("charged_back"),
            GatewayStatus::Unknown
        );
    }
}
