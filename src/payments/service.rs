use std::sync::Arc;

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::info;

use crate::notify::Notifier;
use crate::sessions::{DialogState, SessionStore};

use super::gateway::{GatewayClient, GatewayError};
use super::ledger::PaymentLedger;
use super::models::{PaymentRecord, PaymentStatus, PlanKind};
use super::reconciliation::{ReconcileError, ReconcileOutcome, ReconciliationService};

#[derive(Debug, Error)]
pub enum PurchaseError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[derive(Debug, Clone)]
pub struct CheckResult {
    pub outcome: ReconcileOutcome,
    pub record: PaymentRecord,
}

/// key: payment-service -> purchase initiation and the user poll path
#[derive(Clone)]
pub struct PaymentService {
    ledger: Arc<dyn PaymentLedger>,
    gateway: Arc<dyn GatewayClient>,
    reconciliation: ReconciliationService,
    sessions: Arc<SessionStore>,
    notifier: Notifier,
}

impl PaymentService {
    pub fn new(
        ledger: Arc<dyn PaymentLedger>,
        gateway: Arc<dyn GatewayClient>,
        reconciliation: ReconciliationService,
        sessions: Arc<SessionStore>,
        notifier: Notifier,
    ) -> Self {
        Self {
            ledger,
            gateway,
            reconciliation,
            sessions,
            notifier,
        }
    }

    /// Creates a gateway intent and its ledger record. If the user already
    /// has a live pending intent it is returned instead of stacking a second
    /// charge.
    pub async fn initiate(
        &self,
        user_id: i64,
        plan: PlanKind,
        payer_ref: &str,
        now: DateTime<Utc>,
    ) -> Result<PaymentRecord, PurchaseError> {
        if let Some(existing) = self.ledger.pending_for_user(user_id).await? {
            if existing.expires_at > now {
                self.sessions.set(
                    user_id,
                    DialogState::AwaitingPayment {
                        payment_id: existing.payment_id.clone(),
                    },
                    now,
                );
                return Ok(existing);
            }
        }

        let intent = self
            .gateway
            .create_intent(
                plan.amount_cents(),
                payer_ref,
                &format!("{} - premium access", plan.display_name()),
            )
            .await?;

        let record = PaymentRecord {
            payment_id: intent.intent_id.clone(),
            user_id,
            plan,
            amount_cents: plan.amount_cents(),
            status: PaymentStatus::Pending,
            created_at: now,
            paid_at: None,
            expires_at: intent.expires_at,
            qr_code: intent.qr_code,
            qr_code_base64: intent.qr_code_base64,
            ticket_url: intent.ticket_url,
        };

        // The record must exist before any reconciliation attempt can
        // reference it; webhooks for this intent may arrive immediately.
        self.ledger.create(record.clone()).await?;
        self.sessions.set(
            user_id,
            DialogState::AwaitingPayment {
                payment_id: record.payment_id.clone(),
            },
            now,
        );
        info!(
            payment_id = %record.payment_id,
            %user_id,
            plan = plan.as_str(),
            "payment intent created"
        );
        self.notifier.payment_created(&record).await;
        Ok(record)
    }

    /// User-triggered poll. Runs the same reconciliation algorithm as the
    /// webhook worker, inline, so the caller sees the resolved state.
    pub async fn check(
        &self,
        payment_id: &str,
        now: DateTime<Utc>,
    ) -> Result<CheckResult, ReconcileError> {
        let outcome = self.reconciliation.reconcile(payment_id, now).await?;
        let record = self
            .ledger
            .get(payment_id)
            .await?
            .ok_or_else(|| ReconcileError::Internal(anyhow!("ledger lost record {payment_id}")))?;

        if record.status.is_terminal() {
            if let Some(DialogState::AwaitingPayment { payment_id: held }) =
                self.sessions.get(record.user_id, now)
            {
                if held == record.payment_id {
                    self.sessions.clear(record.user_id);
                }
            }
        }

        Ok(CheckResult { outcome, record })
    }
}
