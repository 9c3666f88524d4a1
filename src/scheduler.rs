use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use tokio::time::{self, Duration as TokioDuration};
use tracing::{info, warn};

use crate::config;
use crate::entitlements::EntitlementStore;
use crate::notify::Notifier;
use crate::payments::PaymentLedger;

/// key: scheduler -> periodic ledger reaping + expiry reminders
pub fn spawn(
    ledger: Arc<dyn PaymentLedger>,
    entitlements: Arc<dyn EntitlementStore>,
    notifier: Notifier,
) {
    let interval = TokioDuration::from_secs(*config::REAPER_INTERVAL_SECS);
    let reminder_window = Duration::days(*config::PREMIUM_REMINDER_DAYS);

    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        loop {
            ticker.tick().await;
            if let Err(err) = process_tick(
                ledger.as_ref(),
                entitlements.as_ref(),
                &notifier,
                Utc::now(),
                reminder_window,
            )
            .await
            {
                warn!(?err, "scheduler tick failed");
            }
        }
    });
}

/// One tick: expire stale pending intents, then remind soon-to-lapse premium
/// users. Each reminder is claimed through a conditional mark so a tick
/// storm sends it once.
pub async fn process_tick(
    ledger: &dyn PaymentLedger,
    entitlements: &dyn EntitlementStore,
    notifier: &Notifier,
    now: DateTime<Utc>,
    reminder_window: Duration,
) -> Result<()> {
    let reaped = ledger.reap_expired(now).await?;
    if reaped > 0 {
        info!(reaped, "expired stale payment intents");
    }

    let expiring = entitlements.expiring_within(now, now + reminder_window).await?;
    for entitlement in expiring {
        let Some(expires_at) = entitlement.expires_at else {
            continue;
        };
        if entitlements
            .mark_reminded(entitlement.user_id, expires_at)
            .await?
        {
            notifier
                .premium_expiring(entitlement.user_id, expires_at)
                .await;
        }
    }

    Ok(())
}
