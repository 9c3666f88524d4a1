use std::sync::Arc;

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::mpsc::{channel, Sender};
use tracing::{error, info, warn};

use crate::entitlements::EntitlementStore;
use crate::notify::Notifier;

use super::gateway::{GatewayClient, GatewayError, GatewayStatus};
use super::ledger::PaymentLedger;
use super::models::PaymentStatus;

/// key: reconciliation -> exactly-once settlement of gateway signals
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// The intent was never created here. Logged and acknowledged so the
    /// gateway stops redelivering; no state changes.
    #[error("unknown payment intent {0}")]
    InvalidIntent(String),
    /// Gateway query failed; the whole attempt is safe to retry.
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// This caller won the guard and applied the business effects.
    Applied(PaymentStatus),
    /// Another path settled the intent first; nothing was done.
    AlreadySettled(PaymentStatus),
    /// Gateway still reports a non-terminal status; caller may retry later.
    StillPending,
}

/// Converts an external status signal into at most one application of
/// business effects. Both trigger paths (webhook worker, user poll) call the
/// same `reconcile`; the ledger guard makes the race benign.
#[derive(Clone)]
pub struct ReconciliationService {
    ledger: Arc<dyn PaymentLedger>,
    entitlements: Arc<dyn EntitlementStore>,
    gateway: Arc<dyn GatewayClient>,
    notifier: Notifier,
}

impl ReconciliationService {
    pub fn new(
        ledger: Arc<dyn PaymentLedger>,
        entitlements: Arc<dyn EntitlementStore>,
        gateway: Arc<dyn GatewayClient>,
        notifier: Notifier,
    ) -> Self {
        Self {
            ledger,
            entitlements,
            gateway,
            notifier,
        }
    }

    pub async fn reconcile(
        &self,
        payment_id: &str,
        now: DateTime<Utc>,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let record = self
            .ledger
            .get(payment_id)
            .await?
            .ok_or_else(|| ReconcileError::InvalidIntent(payment_id.to_string()))?;

        if record.status.is_terminal() {
            return Ok(ReconcileOutcome::AlreadySettled(record.status));
        }

        // The reported status is only ever a hint to look; the gateway answer
        // here is authoritative.
        let status = self.gateway.get_status(payment_id).await?;

        match status {
            GatewayStatus::Approved => {
                if !self
                    .ledger
                    .transition(payment_id, PaymentStatus::Approved, Some(now))
                    .await?
                {
                    let settled = self
                        .ledger
                        .get(payment_id)
                        .await?
                        .map(|r| r.status)
                        .unwrap_or(PaymentStatus::Approved);
                    return Ok(ReconcileOutcome::AlreadySettled(settled));
                }

                let expires_at = self
                    .entitlements
                    .extend_premium(record.user_id, record.plan.duration(), now)
                    .await
                    .map_err(|err| {
                        anyhow!("entitlement extension failed for {payment_id}: {err}")
                    })?;
                info!(
                    %payment_id,
                    user_id = record.user_id,
                    plan = record.plan.as_str(),
                    %expires_at,
                    "payment approved, entitlement extended"
                );
                self.notifier
                    .payment_approved(record.user_id, payment_id, record.plan, expires_at)
                    .await;
                Ok(ReconcileOutcome::Applied(PaymentStatus::Approved))
            }
            GatewayStatus::Rejected => {
                if !self
                    .ledger
                    .transition(payment_id, PaymentStatus::Rejected, None)
                    .await?
                {
                    let settled = self
                        .ledger
                        .get(payment_id)
                        .await?
                        .map(|r| r.status)
                        .unwrap_or(PaymentStatus::Rejected);
                    return Ok(ReconcileOutcome::AlreadySettled(settled));
                }
                info!(%payment_id, user_id = record.user_id, "payment rejected by gateway");
                self.notifier
                    .payment_failed(record.user_id, payment_id, "rejected by gateway")
                    .await;
                Ok(ReconcileOutcome::Applied(PaymentStatus::Rejected))
            }
            GatewayStatus::Pending | GatewayStatus::Unknown => Ok(ReconcileOutcome::StillPending),
        }
    }
}

#[derive(Debug)]
pub enum ReconciliationJob {
    PaymentSignal { payment_id: String },
}

/// Enqueue interface handed to the webhook handlers.
#[derive(Clone)]
pub struct ReconciliationHandle {
    sender: Sender<ReconciliationJob>,
}

impl ReconciliationHandle {
    pub async fn dispatch(&self, job: ReconciliationJob) -> anyhow::Result<()> {
        self.sender
            .send(job)
            .await
            .map_err(|err| anyhow!("failed to enqueue reconciliation job: {err}"))
    }
}

/// Bounded-channel worker consuming webhook signals. The channel is the
/// backpressure point: webhook handlers block on a full queue instead of
/// spawning unbounded work.
pub fn start_reconciliation_worker(service: ReconciliationService) -> ReconciliationHandle {
    let (tx, mut rx) = channel(64);
    tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            match job {
                ReconciliationJob::PaymentSignal { payment_id } => {
                    match service.reconcile(&payment_id, Utc::now()).await {
                        Ok(ReconcileOutcome::Applied(status)) => {
                            info!(%payment_id, status = status.as_str(), "reconciliation applied");
                        }
                        Ok(ReconcileOutcome::AlreadySettled(status)) => {
                            info!(
                                %payment_id,
                                status = status.as_str(),
                                "reconciliation skipped, intent already settled"
                            );
                        }
                        Ok(ReconcileOutcome::StillPending) => {}
                        Err(ReconcileError::InvalidIntent(id)) => {
                            warn!(payment_id = %id, "webhook referenced unknown intent");
                        }
                        Err(ReconcileError::Gateway(err)) => {
                            // The gateway's own webhook retry is the retry
                            // mechanism for this path.
                            warn!(?err, %payment_id, "gateway query failed during reconciliation");
                        }
                        Err(ReconcileError::Internal(err)) => {
                            error!(?err, %payment_id, "reconciliation attempt failed");
                        }
                    }
                }
            }
        }
    });

    ReconciliationHandle { sender: tx }
}
