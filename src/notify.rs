use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;

use crate::config;
use crate::payments::models::{PaymentRecord, PlanKind};

/// key: notification-sink -> outbound delivery seam
///
/// One message to one user. Implementations must bound their own latency;
/// callers treat any error as a failed delivery and move on.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, user_id: i64, text: &str) -> Result<()>;
}

/// Bot-API style HTTP sink (`POST {base}/sendMessage`).
pub struct HttpNotificationSink {
    http: reqwest::Client,
    base_url: String,
}

impl HttpNotificationSink {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(*config::DELIVERY_TIMEOUT_SECS))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl NotificationSink for HttpNotificationSink {
    async fn deliver(&self, user_id: i64, text: &str) -> Result<()> {
        let response = self
            .http
            .post(format!("{}/sendMessage", self.base_url))
            .json(&json!({
                "chat_id": user_id,
                "text": text,
                "disable_web_page_preview": true,
            }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(anyhow!("sink returned {}", response.status()));
        }
        Ok(())
    }
}

/// Sink used when no outbound endpoint is configured (local development);
/// logs instead of delivering.
pub struct NullNotificationSink;

#[async_trait]
impl NotificationSink for NullNotificationSink {
    async fn deliver(&self, user_id: i64, text: &str) -> Result<()> {
        tracing::debug!(%user_id, text, "notification dropped, no sink configured");
        Ok(())
    }
}

/// Operational notification fan-out: messages to the affected user plus the
/// operator group when one is configured. Delivery failures are logged and
/// swallowed; notifications never fail the operation that triggered them.
#[derive(Clone)]
pub struct Notifier {
    sink: Arc<dyn NotificationSink>,
    ops_chat_id: Option<i64>,
}

impl Notifier {
    pub fn new(sink: Arc<dyn NotificationSink>, ops_chat_id: Option<i64>) -> Self {
        Self { sink, ops_chat_id }
    }

    pub fn sink(&self) -> Arc<dyn NotificationSink> {
        self.sink.clone()
    }

    async fn send(&self, user_id: i64, text: &str) {
        if let Err(err) = self.sink.deliver(user_id, text).await {
            tracing::warn!(?err, %user_id, "notification delivery failed");
        }
    }

    async fn send_ops(&self, text: &str) {
        if let Some(chat_id) = self.ops_chat_id {
            self.send(chat_id, text).await;
        }
    }

    pub async fn payment_created(&self, record: &PaymentRecord) {
        self.send(
            record.user_id,
            &format!(
                "Payment of {} created for the {}. Pay within {} minutes to activate premium.",
                format_amount(record.amount_cents),
                record.plan.display_name(),
                (record.expires_at - record.created_at).num_minutes(),
            ),
        )
        .await;
        self.send_ops(&format!(
            "New payment {} ({}, {}) generated for user {}.",
            record.payment_id,
            record.plan.as_str(),
            format_amount(record.amount_cents),
            record.user_id,
        ))
        .await;
    }

    pub async fn payment_approved(
        &self,
        user_id: i64,
        payment_id: &str,
        plan: PlanKind,
        expires_at: DateTime<Utc>,
    ) {
        self.send(
            user_id,
            &format!(
                "Payment approved! Your {} is active until {}.",
                plan.display_name(),
                expires_at.format("%Y-%m-%d %H:%M UTC"),
            ),
        )
        .await;
        self.send_ops(&format!(
            "Payment {} approved: user {} now premium until {}.",
            payment_id,
            user_id,
            expires_at.format("%Y-%m-%d %H:%M UTC"),
        ))
        .await;
    }

    pub async fn payment_failed(&self, user_id: i64, payment_id: &str, reason: &str) {
        self.send(
            user_id,
            &format!("Payment {payment_id} was not completed ({reason}). You can try again."),
        )
        .await;
        self.send_ops(&format!(
            "Payment {payment_id} for user {user_id} failed: {reason}."
        ))
        .await;
    }

    pub async fn trial_created(&self, user_id: i64, pool_member: &str, expires_at: DateTime<Utc>) {
        self.send_ops(&format!(
            "Trial lease on {} issued to user {} (expires {}).",
            pool_member,
            user_id,
            expires_at.format("%Y-%m-%d %H:%M UTC"),
        ))
        .await;
    }

    pub async fn premium_expiring(&self, user_id: i64, expires_at: DateTime<Utc>) {
        self.send(
            user_id,
            &format!(
                "Your premium access expires on {}. Renew to keep unlimited leases.",
                expires_at.format("%Y-%m-%d %H:%M UTC"),
            ),
        )
        .await;
    }
}

fn format_amount(amount_cents: i64) -> String {
    format!("R$ {}.{:02}", amount_cents / 100, amount_cents % 100)
}
