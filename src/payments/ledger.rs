use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sqlx::{PgPool, Row};

use super::models::{PaymentRecord, PaymentStatus, PlanKind};

/// key: payment-ledger -> durable intent records + idempotence guard
///
/// `transition` is the single serialization point of the whole payment flow:
/// it succeeds exactly once per intent, no matter how many webhook
/// redeliveries and manual polls race for it.
#[async_trait]
pub trait PaymentLedger: Send + Sync {
    async fn create(&self, record: PaymentRecord) -> Result<()>;

    /// Conditional `pending -> terminal` write. Returns true only for the
    /// caller that actually moved the record; a lost race is `Ok(false)`,
    /// never an error.
    async fn transition(
        &self,
        payment_id: &str,
        new_status: PaymentStatus,
        paid_at: Option<DateTime<Utc>>,
    ) -> Result<bool>;

    async fn get(&self, payment_id: &str) -> Result<Option<PaymentRecord>>;

    /// Expires stale pending intents. Rows are never deleted; the ledger is
    /// the audit trail.
    async fn reap_expired(&self, now: DateTime<Utc>) -> Result<u64>;

    /// Most recent pending intent for a user, if any.
    async fn pending_for_user(&self, user_id: i64) -> Result<Option<PaymentRecord>>;
}

/// Postgres-backed ledger.
#[derive(Clone)]
pub struct PgPaymentLedger {
    pool: PgPool,
}

impl PgPaymentLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn record_from_row(row: &sqlx::postgres::PgRow) -> Result<PaymentRecord> {
    let status: String = row.get("status");
    let plan: String = row.get("plan");
    Ok(PaymentRecord {
        payment_id: row.get("payment_id"),
        user_id: row.get("user_id"),
        plan: PlanKind::parse(&plan).ok_or_else(|| anyhow!("unknown plan kind: {plan}"))?,
        amount_cents: row.get("amount_cents"),
        status: PaymentStatus::parse(&status)
            .ok_or_else(|| anyhow!("unknown payment status: {status}"))?,
        created_at: row.get("created_at"),
        paid_at: row.get("paid_at"),
        expires_at: row.get("expires_at"),
        qr_code: row.get("qr_code"),
        qr_code_base64: row.get("qr_code_base64"),
        ticket_url: row.get("ticket_url"),
    })
}

#[async_trait]
impl PaymentLedger for PgPaymentLedger {
    async fn create(&self, record: PaymentRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO payments (
                payment_id,
                user_id,
                plan,
                amount_cents,
                status,
                created_at,
                paid_at,
                expires_at,
                qr_code,
                qr_code_base64,
                ticket_url
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(&record.payment_id)
        .bind(record.user_id)
        .bind(record.plan.as_str())
        .bind(record.amount_cents)
        .bind(record.status.as_str())
        .bind(record.created_at)
        .bind(record.paid_at)
        .bind(record.expires_at)
        .bind(&record.qr_code)
        .bind(&record.qr_code_base64)
        .bind(&record.ticket_url)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn transition(
        &self,
        payment_id: &str,
        new_status: PaymentStatus,
        paid_at: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE payments
            SET status = $2, paid_at = $3
            WHERE payment_id = $1 AND status = 'pending'
            "#,
        )
        .bind(payment_id)
        .bind(new_status.as_str())
        .bind(paid_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn get(&self, payment_id: &str) -> Result<Option<PaymentRecord>> {
        let row = sqlx::query("SELECT * FROM payments WHERE payment_id = $1")
            .bind(payment_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn reap_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE payments SET status = 'expired' WHERE status = 'pending' AND expires_at <= $1",
        )
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn pending_for_user(&self, user_id: i64) -> Result<Option<PaymentRecord>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM payments
            WHERE user_id = $1 AND status = 'pending'
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(record_from_row).transpose()
    }
}

/// In-memory ledger for tests and local runs. The dashmap entry lock makes
/// `transition` a true compare-and-set.
#[derive(Default)]
pub struct MemoryPaymentLedger {
    records: DashMap<String, PaymentRecord>,
}

impl MemoryPaymentLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PaymentLedger for MemoryPaymentLedger {
    async fn create(&self, record: PaymentRecord) -> Result<()> {
        self.records.insert(record.payment_id.clone(), record);
        Ok(())
    }

    async fn transition(
        &self,
        payment_id: &str,
        new_status: PaymentStatus,
        paid_at: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        match self.records.get_mut(payment_id) {
            Some(mut entry) if entry.status == PaymentStatus::Pending => {
                entry.status = new_status;
                entry.paid_at = paid_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get(&self, payment_id: &str) -> Result<Option<PaymentRecord>> {
        Ok(self.records.get(payment_id).map(|entry| entry.clone()))
    }

    async fn reap_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut reaped = 0;
        for mut entry in self.records.iter_mut() {
            if entry.status == PaymentStatus::Pending && entry.expires_at <= now {
                entry.status = PaymentStatus::Expired;
                reaped += 1;
            }
        }
        Ok(reaped)
    }

    async fn pending_for_user(&self, user_id: i64) -> Result<Option<PaymentRecord>> {
        let mut latest: Option<PaymentRecord> = None;
        for entry in self.records.iter() {
            if entry.user_id == user_id && entry.status == PaymentStatus::Pending {
                match &latest {
                    Some(current) if current.created_at >= entry.created_at => {}
                    _ => latest = Some(entry.clone()),
                }
            }
        }
        Ok(latest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record(id: &str, user_id: i64, created_at: DateTime<Utc>) -> PaymentRecord {
        PaymentRecord {
            payment_id: id.to_string(),
            user_id,
            plan: PlanKind::Weekly,
            amount_cents: PlanKind::Weekly.amount_cents(),
            status: PaymentStatus::Pending,
            created_at,
            paid_at: None,
            expires_at: created_at + Duration::minutes(30),
            qr_code: String::new(),
            qr_code_base64: String::new(),
            ticket_url: String::new(),
        }
    }

    #[tokio::test]
    async fn transition_succeeds_once() {
        let ledger = MemoryPaymentLedger::new();
        let now = Utc::now();
        ledger.create(record("p-1", 7, now)).await.unwrap();

        assert!(ledger
            .transition("p-1", PaymentStatus::Approved, Some(now))
            .await
            .unwrap());
        assert!(!ledger
            .transition("p-1", PaymentStatus::Approved, Some(now))
            .await
            .unwrap());
        // Terminal records do not regress either.
        assert!(!ledger
            .transition("p-1", PaymentStatus::Rejected, None)
            .await
            .unwrap());

        let stored = ledger.get("p-1").await.unwrap().unwrap();
        assert_eq!(stored.status, PaymentStatus::Approved);
        assert_eq!(stored.paid_at, Some(now));
    }

    #[tokio::test]
    async fn transition_on_unknown_intent_is_a_noop() {
        let ledger = MemoryPaymentLedger::new();
        assert!(!ledger
            .transition("missing", PaymentStatus::Approved, None)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn reaper_expires_only_stale_pending() {
        let ledger = MemoryPaymentLedger::new();
        let now = Utc::now();
        ledger
            .create(record("stale", 1, now - Duration::hours(1)))
            .await
            .unwrap();
        ledger.create(record("fresh", 2, now)).await.unwrap();
        ledger
            .create(record("done", 3, now - Duration::hours(1)))
            .await
            .unwrap();
        ledger
            .transition("done", PaymentStatus::Approved, Some(now))
            .await
            .unwrap();

        let reaped = ledger.reap_expired(now).await.unwrap();
        assert_eq!(reaped, 1);
        assert_eq!(
            ledger.get("stale").await.unwrap().unwrap().status,
            PaymentStatus::Expired
        );
        assert_eq!(
            ledger.get("fresh").await.unwrap().unwrap().status,
            PaymentStatus::Pending
        );
        assert_eq!(
            ledger.get("done").await.unwrap().unwrap().status,
            PaymentStatus::Approved
        );
    }

    #[tokio::test]
    async fn pending_for_user_returns_most_recent() {
        let ledger = MemoryPaymentLedger::new();
        let now = Utc::now();
        ledger
            .create(record("old", 9, now - Duration::minutes(10)))
            .await
            .unwrap();
        ledger.create(record("new", 9, now)).await.unwrap();
        ledger.create(record("other", 8, now)).await.unwrap();

        let found = ledger.pending_for_user(9).await.unwrap().unwrap();
        assert_eq!(found.payment_id, "new");
        assert!(ledger.pending_for_user(42).await.unwrap().is_none());
    }
}
