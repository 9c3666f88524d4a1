use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use rand::distributions::Alphanumeric;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config;
use crate::entitlements::EntitlementStore;
use crate::notify::Notifier;

/// key: leases -> fair-use grants over the provisioned pool

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceLease {
    pub id: Uuid,
    pub user_id: i64,
    pub pool_member_id: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub active: bool,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Error)]
pub enum LeaseError {
    #[error("cooldown active, {remaining_secs}s remaining")]
    CooldownActive { remaining_secs: i64 },
    #[error("no pool members available")]
    PoolExhausted,
    /// The lease was recorded and then invalidated; the cooldown window was
    /// not consumed and the caller may retry.
    #[error("provisioning failed: {0}")]
    Provisioning(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[async_trait]
pub trait LeaseStore: Send + Sync {
    async fn record(&self, lease: ResourceLease) -> Result<()>;

    /// `issued_at` of the most recent active lease; invalidated leases do not
    /// count against the cooldown.
    async fn latest_active_issued_at(&self, user_id: i64) -> Result<Option<DateTime<Utc>>>;

    /// Flips `active` off. True only if the lease was still active.
    async fn invalidate(&self, lease_id: Uuid) -> Result<bool>;

    async fn active_count(&self, now: DateTime<Utc>) -> Result<i64>;
}

#[derive(Clone)]
pub struct PgLeaseStore {
    pool: PgPool,
}

impl PgLeaseStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LeaseStore for PgLeaseStore {
    async fn record(&self, lease: ResourceLease) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO resource_leases (
                id, user_id, pool_member_id, issued_at, expires_at, active, username, password
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(lease.id)
        .bind(lease.user_id)
        .bind(&lease.pool_member_id)
        .bind(lease.issued_at)
        .bind(lease.expires_at)
        .bind(lease.active)
        .bind(&lease.username)
        .bind(&lease.password)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn latest_active_issued_at(&self, user_id: i64) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx::query(
            r#"
            SELECT issued_at FROM resource_leases
            WHERE user_id = $1 AND active
            ORDER BY issued_at DESC
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| row.get("issued_at")))
    }

    async fn invalidate(&self, lease_id: Uuid) -> Result<bool> {
        let result = sqlx::query("UPDATE resource_leases SET active = FALSE WHERE id = $1 AND active")
            .bind(lease_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn active_count(&self, now: DateTime<Utc>) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM resource_leases WHERE active AND expires_at > $1",
        )
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}

#[derive(Default)]
pub struct MemoryLeaseStore {
    leases: DashMap<Uuid, ResourceLease>,
}

impl MemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn record(&self, lease: ResourceLease) -> Result<()> {
        self.leases.insert(lease.id, lease);
        Ok(())
    }

    async fn latest_active_issued_at(&self, user_id: i64) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .leases
            .iter()
            .filter(|lease| lease.user_id == user_id && lease.active)
            .map(|lease| lease.issued_at)
            .max())
    }

    async fn invalidate(&self, lease_id: Uuid) -> Result<bool> {
        match self.leases.get_mut(&lease_id) {
            Some(mut lease) if lease.active => {
                lease.active = false;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn active_count(&self, now: DateTime<Utc>) -> Result<i64> {
        Ok(self
            .leases
            .iter()
            .filter(|lease| lease.active && lease.expires_at > now)
            .count() as i64)
    }
}

/// One provisionable host in the shared pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolMember {
    pub id: String,
    pub name: String,
    pub host: String,
    #[serde(default = "default_available")]
    pub available: bool,
}

fn default_available() -> bool {
    true
}

/// In-process registry of pool members; availability flips come from the
/// admin surface (out of scope here) or operator config.
#[derive(Default)]
pub struct PoolRegistry {
    members: DashMap<String, PoolMember>,
}

impl PoolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let members: Vec<PoolMember> = serde_json::from_str(raw)?;
        let registry = Self::new();
        for member in members {
            registry.upsert(member);
        }
        Ok(registry)
    }

    pub fn upsert(&self, member: PoolMember) {
        self.members.insert(member.id.clone(), member);
    }

    pub fn set_available(&self, id: &str, available: bool) {
        if let Some(mut member) = self.members.get_mut(id) {
            member.available = available;
        }
    }

    /// Uniform random draw over the currently available subset.
    pub fn choose_available(&self) -> Option<PoolMember> {
        let available: Vec<PoolMember> = self
            .members
            .iter()
            .filter(|member| member.available)
            .map(|member| member.clone())
            .collect();
        available.choose(&mut rand::thread_rng()).cloned()
    }

    pub fn available_count(&self) -> usize {
        self.members.iter().filter(|member| member.available).count()
    }
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    /// `ssh` + 4 random digits, 8 random alphanumerics.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let suffix: String = (0..4).map(|_| rng.gen_range(0..10).to_string()).collect();
        let password: String = (&mut rng)
            .sample_iter(&Alphanumeric)
            .take(8)
            .map(char::from)
            .collect();
        Self {
            username: format!("ssh{suffix}"),
            password,
        }
    }
}

#[derive(Debug, Error)]
#[error("provisioning failed: {0}")]
pub struct ProvisionError(pub String);

/// Remote-side account creation. The manager only decides whether a lease is
/// granted; how the pool member is driven lives behind this seam.
#[async_trait]
pub trait ProvisioningClient: Send + Sync {
    async fn provision(
        &self,
        member: &PoolMember,
        credentials: &Credentials,
        ttl: Duration,
    ) -> Result<(), ProvisionError>;
}

/// Posts provisioning requests to a node agent.
pub struct HttpProvisioner {
    http: reqwest::Client,
    agent_url: String,
}

impl HttpProvisioner {
    pub fn new(agent_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(*config::DELIVERY_TIMEOUT_SECS))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            agent_url: agent_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl ProvisioningClient for HttpProvisioner {
    async fn provision(
        &self,
        member: &PoolMember,
        credentials: &Credentials,
        ttl: Duration,
    ) -> Result<(), ProvisionError> {
        let response = self
            .http
            .post(format!("{}/provision", self.agent_url))
            .json(&json!({
                "host": member.host,
                "username": credentials.username,
                "password": credentials.password,
                "ttl_seconds": ttl.num_seconds(),
            }))
            .send()
            .await
            .map_err(|err| ProvisionError(err.to_string()))?;
        if !response.status().is_success() {
            return Err(ProvisionError(format!(
                "agent returned {} for {}",
                response.status(),
                member.id
            )));
        }
        Ok(())
    }
}

/// Provisioner used when no agent is configured (local development); logs
/// and reports success so the lease flow stays exercisable.
pub struct NullProvisioner;

#[async_trait]
impl ProvisioningClient for NullProvisioner {
    async fn provision(
        &self,
        member: &PoolMember,
        credentials: &Credentials,
        ttl: Duration,
    ) -> Result<(), ProvisionError> {
        tracing::debug!(
            pool_member = %member.id,
            username = %credentials.username,
            ttl_seconds = ttl.num_seconds(),
            "provisioning skipped, no agent configured"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LeasePolicy {
    pub cooldown: Duration,
    pub trial_ttl: Duration,
    pub premium_ttl: Duration,
}

impl LeasePolicy {
    pub fn from_env() -> Self {
        Self {
            cooldown: Duration::hours(*config::FREE_COOLDOWN_HOURS),
            trial_ttl: Duration::hours(*config::TRIAL_LEASE_HOURS),
            premium_ttl: Duration::hours(*config::PREMIUM_LEASE_TTL_HOURS),
        }
    }
}

/// Decides lease eligibility and records grants. Provisioning happens only
/// after the lease is durably recorded; a provisioning failure invalidates
/// the lease so the user's cooldown window is not silently consumed.
pub struct ResourceLeaseManager {
    entitlements: Arc<dyn EntitlementStore>,
    store: Arc<dyn LeaseStore>,
    pool: Arc<PoolRegistry>,
    provisioner: Arc<dyn ProvisioningClient>,
    notifier: Notifier,
    policy: LeasePolicy,
    user_locks: DashMap<i64, Arc<Mutex<()>>>,
}

impl ResourceLeaseManager {
    pub fn new(
        entitlements: Arc<dyn EntitlementStore>,
        store: Arc<dyn LeaseStore>,
        pool: Arc<PoolRegistry>,
        provisioner: Arc<dyn ProvisioningClient>,
        notifier: Notifier,
        policy: LeasePolicy,
    ) -> Self {
        Self {
            entitlements,
            store,
            pool,
            provisioner,
            notifier,
            policy,
            user_locks: DashMap::new(),
        }
    }

    fn user_lock(&self, user_id: i64) -> Arc<Mutex<()>> {
        self.user_locks
            .entry(user_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub async fn try_acquire(
        &self,
        user_id: i64,
        now: DateTime<Utc>,
    ) -> Result<ResourceLease, LeaseError> {
        // Serialize per user so two concurrent requests cannot both pass the
        // cooldown check before either records a lease.
        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;

        let premium = self
            .entitlements
            .get(user_id)
            .await?
            .map(|entitlement| entitlement.is_premium(now))
            .unwrap_or(false);

        if !premium {
            if let Some(issued_at) = self.store.latest_active_issued_at(user_id).await? {
                let elapsed = now - issued_at;
                if elapsed < self.policy.cooldown {
                    return Err(LeaseError::CooldownActive {
                        remaining_secs: (self.policy.cooldown - elapsed).num_seconds(),
                    });
                }
            }
        }

        let member = self
            .pool
            .choose_available()
            .ok_or(LeaseError::PoolExhausted)?;

        let ttl = if premium {
            self.policy.premium_ttl
        } else {
            self.policy.trial_ttl
        };
        let credentials = Credentials::generate();
        let lease = ResourceLease {
            id: Uuid::new_v4(),
            user_id,
            pool_member_id: member.id.clone(),
            issued_at: now,
            expires_at: now + ttl,
            active: true,
            username: credentials.username.clone(),
            password: credentials.password.clone(),
        };

        // Record first, provision second.
        self.store.record(lease.clone()).await?;

        if let Err(err) = self
            .provisioner
            .provision(&member, &credentials, ttl)
            .await
        {
            tracing::warn!(
                ?err,
                %user_id,
                lease_id = %lease.id,
                pool_member = %member.id,
                "provisioning failed, invalidating lease"
            );
            self.store.invalidate(lease.id).await?;
            return Err(LeaseError::Provisioning(err.to_string()));
        }

        tracing::info!(
            %user_id,
            lease_id = %lease.id,
            pool_member = %member.id,
            premium,
            "lease granted"
        );
        if !premium {
            self.notifier
                .trial_created(user_id, &member.id, lease.expires_at)
                .await;
        }
        Ok(lease)
    }

    pub async fn active_count(&self, now: DateTime<Utc>) -> Result<i64> {
        self.store.active_count(now).await
    }

    pub fn pool(&self) -> Arc<PoolRegistry> {
        self.pool.clone()
    }
}
