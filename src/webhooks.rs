use axum::{
    extract::Extension,
    http::{HeaderMap, StatusCode},
    Json,
};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;
use tracing::{info, warn};

use crate::config;
use crate::payments::{ReconciliationHandle, ReconciliationJob};

type HmacSha256 = Hmac<Sha256>;

/// key: webhooks-gateway -> trigger-only intake
///
/// Gateway notifications are at-least-once, unordered, and possibly spoofed.
/// The handler never reads a status out of the payload; it only extracts the
/// intent id and enqueues a reconciliation signal.
#[derive(Debug, Deserialize)]
pub struct GatewayWebhookRequest {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

pub async fn gateway_webhook(
    Extension(reconciliation): Extension<ReconciliationHandle>,
    headers: HeaderMap,
    Json(payload): Json<GatewayWebhookRequest>,
) -> Result<StatusCode, StatusCode> {
    let payment_id = payload.data.get("id").and_then(value_as_id);

    if let Some(secret) = config::GATEWAY_WEBHOOK_SECRET.as_deref() {
        let signature = headers
            .get("x-signature")
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        let request_id = headers
            .get("x-request-id")
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        let id = payment_id.as_deref().unwrap_or_default();
        if !verify_signature(secret, signature, request_id, id) {
            warn!(%request_id, "webhook signature verification failed");
            return Err(StatusCode::UNAUTHORIZED);
        }
    }

    match payload.kind.as_str() {
        "payment" => {
            let Some(payment_id) = payment_id else {
                return Err(StatusCode::BAD_REQUEST);
            };
            reconciliation
                .dispatch(ReconciliationJob::PaymentSignal { payment_id })
                .await
                .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
            Ok(StatusCode::ACCEPTED)
        }
        other => {
            // Plan/subscription notifications and anything newer are
            // acknowledged so the gateway stops redelivering.
            info!(kind = other, "ignoring unhandled webhook type");
            Ok(StatusCode::ACCEPTED)
        }
    }
}

fn value_as_id(value: &Value) -> Option<String> {
    match value {
        Value::String(id) => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

/// Verifies the gateway's `ts=...,v1=...` signature header against the
/// documented manifest `id:<id>;request-id:<rid>;ts:<ts>;`.
pub fn verify_signature(secret: &str, signature: &str, request_id: &str, data_id: &str) -> bool {
    let mut ts = None;
    let mut v1 = None;
    for part in signature.split(',') {
        match part.trim().split_once('=') {
            Some(("ts", value)) => ts = Some(value.trim()),
            Some(("v1", value)) => v1 = Some(value.trim()),
            _ => {}
        }
    }
    let (Some(ts), Some(v1)) = (ts, v1) else {
        return false;
    };

    let manifest = format!("id:{data_id};request-id:{request_id};ts:{ts};");
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(manifest.as_bytes());
    let expected = hex::encode(mac.finalize().into_bytes());
    // Case-insensitive hex compare; providers differ on digest casing.
    expected.eq_ignore_ascii_case(v1)
}
