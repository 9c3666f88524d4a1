use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};

/// key: entitlements -> per-user access tier with expiry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Free,
    Premium,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Premium => "premium",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "free" => Some(Tier::Free),
            "premium" => Some(Tier::Premium),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entitlement {
    pub user_id: i64,
    pub tier: Tier,
    pub expires_at: Option<DateTime<Utc>>,
    /// Expiry value the last expiring-soon reminder was sent for. Guards the
    /// reminder against firing on every scheduler tick.
    pub reminded_for: Option<DateTime<Utc>>,
}

impl Entitlement {
    pub fn free(user_id: i64) -> Self {
        Self {
            user_id,
            tier: Tier::Free,
            expires_at: None,
            reminded_for: None,
        }
    }

    /// Time-of-check evaluation; entitlement state is never trusted beyond a
    /// single decision.
    pub fn is_premium(&self, now: DateTime<Utc>) -> bool {
        self.tier == Tier::Premium
            && self.expires_at.map(|at| at > now).unwrap_or(false)
    }
}

#[async_trait]
pub trait EntitlementStore: Send + Sync {
    async fn get(&self, user_id: i64) -> Result<Option<Entitlement>>;

    /// Extends premium by `duration`, anchored at `max(current_expiry, now)`
    /// so back-to-back purchases extend instead of stacking from purchase
    /// time. Single atomic upsert; returns the new expiry.
    async fn extend_premium(
        &self,
        user_id: i64,
        duration: Duration,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>>;

    /// Premium entitlements expiring inside `(now, until]` that have not yet
    /// been reminded for their current expiry.
    async fn expiring_within(
        &self,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<Entitlement>>;

    /// Conditional reminder mark; true only for the caller that claimed it.
    async fn mark_reminded(&self, user_id: i64, expires_at: DateTime<Utc>) -> Result<bool>;
}

#[derive(Clone)]
pub struct PgEntitlementStore {
    pool: PgPool,
}

impl PgEntitlementStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn entitlement_from_row(row: &sqlx::postgres::PgRow) -> Result<Entitlement> {
    let tier: String = row.get("tier");
    Ok(Entitlement {
        user_id: row.get("user_id"),
        tier: Tier::parse(&tier).ok_or_else(|| anyhow::anyhow!("unknown tier: {tier}"))?,
        expires_at: row.get("expires_at"),
        reminded_for: row.get("reminded_for"),
    })
}

#[async_trait]
impl EntitlementStore for PgEntitlementStore {
    async fn get(&self, user_id: i64) -> Result<Option<Entitlement>> {
        let row = sqlx::query("SELECT * FROM entitlements WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(entitlement_from_row).transpose()
    }

    async fn extend_premium(
        &self,
        user_id: i64,
        duration: Duration,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>> {
        let seconds = duration.num_seconds() as f64;
        let expires_at: DateTime<Utc> = sqlx::query_scalar(
            r#"
            INSERT INTO entitlements (user_id, tier, expires_at)
            VALUES ($1, 'premium', $2 + make_interval(secs => $3))
            ON CONFLICT (user_id)
            DO UPDATE SET
                tier = 'premium',
                expires_at = GREATEST(COALESCE(entitlements.expires_at, $2), $2)
                    + make_interval(secs => $3)
            RETURNING expires_at
            "#,
        )
        .bind(user_id)
        .bind(now)
        .bind(seconds)
        .fetch_one(&self.pool)
        .await?;
        Ok(expires_at)
    }

    async fn expiring_within(
        &self,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<Entitlement>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM entitlements
            WHERE tier = 'premium'
              AND expires_at > $1
              AND expires_at <= $2
              AND (reminded_for IS NULL OR reminded_for <> expires_at)
            "#,
        )
        .bind(now)
        .bind(until)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(entitlement_from_row).collect()
    }

    async fn mark_reminded(&self, user_id: i64, expires_at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE entitlements
            SET reminded_for = $2
            WHERE user_id = $1
              AND (reminded_for IS NULL OR reminded_for <> $2)
            "#,
        )
        .bind(user_id)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

#[derive(Default)]
pub struct MemoryEntitlementStore {
    entries: DashMap<i64, Entitlement>,
}

impl MemoryEntitlementStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EntitlementStore for MemoryEntitlementStore {
    async fn get(&self, user_id: i64) -> Result<Option<Entitlement>> {
        Ok(self.entries.get(&user_id).map(|entry| entry.clone()))
    }

    async fn extend_premium(
        &self,
        user_id: i64,
        duration: Duration,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>> {
        let mut entry = self
            .entries
            .entry(user_id)
            .or_insert_with(|| Entitlement::free(user_id));
        let anchor = entry.expires_at.map(|at| at.max(now)).unwrap_or(now);
        let expires_at = anchor + duration;
        entry.tier = Tier::Premium;
        entry.expires_at = Some(expires_at);
        Ok(expires_at)
    }

    async fn expiring_within(
        &self,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<Entitlement>> {
        Ok(self
            .entries
            .iter()
            .filter(|entry| {
                entry.tier == Tier::Premium
                    && entry
                        .expires_at
                        .map(|at| at > now && at <= until && entry.reminded_for != Some(at))
                        .unwrap_or(false)
            })
            .map(|entry| entry.clone())
            .collect())
    }

    async fn mark_reminded(&self, user_id: i64, expires_at: DateTime<Utc>) -> Result<bool> {
        match self.entries.get_mut(&user_id) {
            Some(mut entry) if entry.reminded_for != Some(expires_at) => {
                entry.reminded_for = Some(expires_at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
