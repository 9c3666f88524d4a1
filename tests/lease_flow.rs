use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration, Utc};

use accessd::entitlements::{EntitlementStore, MemoryEntitlementStore};
use accessd::leases::{
    Credentials, LeaseError, LeasePolicy, LeaseStore, MemoryLeaseStore, PoolMember, PoolRegistry,
    ProvisionError, ProvisioningClient, ResourceLeaseManager,
};
use accessd::notify::{NotificationSink, Notifier};

/// Provisioner that can be flipped into failure mode and counts calls.
#[derive(Default)]
struct FlakyProvisioner {
    fail: AtomicBool,
    calls: AtomicUsize,
}

#[async_trait]
impl ProvisioningClient for FlakyProvisioner {
    async fn provision(
        &self,
        member: &PoolMember,
        _credentials: &Credentials,
        _ttl: Duration,
    ) -> Result<(), ProvisionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(ProvisionError(format!("agent unreachable for {}", member.id)));
        }
        Ok(())
    }
}

struct DroppingSink;

#[async_trait]
impl NotificationSink for DroppingSink {
    async fn deliver(&self, _user_id: i64, _text: &str) -> Result<()> {
        Ok(())
    }
}

fn policy() -> LeasePolicy {
    LeasePolicy {
        cooldown: Duration::hours(24),
        trial_ttl: Duration::hours(6),
        premium_ttl: Duration::hours(720),
    }
}

fn pool_of(count: usize) -> Arc<PoolRegistry> {
    let registry = PoolRegistry::new();
    for index in 0..count {
        registry.upsert(PoolMember {
            id: format!("node-{index}"),
            name: format!("Node {index}"),
            host: format!("10.0.0.{index}"),
            available: true,
        });
    }
    Arc::new(registry)
}

struct Harness {
    entitlements: Arc<MemoryEntitlementStore>,
    store: Arc<MemoryLeaseStore>,
    provisioner: Arc<FlakyProvisioner>,
    manager: Arc<ResourceLeaseManager>,
}

fn harness(pool_size: usize) -> Harness {
    let entitlements = Arc::new(MemoryEntitlementStore::new());
    let store = Arc::new(MemoryLeaseStore::new());
    let provisioner = Arc::new(FlakyProvisioner::default());
    let manager = Arc::new(ResourceLeaseManager::new(
        entitlements.clone(),
        store.clone(),
        pool_of(pool_size),
        provisioner.clone(),
        Notifier::new(Arc::new(DroppingSink), None),
        policy(),
    ));
    Harness {
        entitlements,
        store,
        provisioner,
        manager,
    }
}

#[tokio::test]
async fn free_user_gets_a_trial_lease_then_hits_the_cooldown() {
    let h = harness(2);
    let t0 = Utc::now();

    let lease = h.manager.try_acquire(1, t0).await.unwrap();
    assert!(lease.active);
    assert_eq!(lease.expires_at, t0 + Duration::hours(6));
    assert!(lease.username.starts_with("ssh"));

    // One second short of the window is still a denial.
    let denied = h
        .manager
        .try_acquire(1, t0 + Duration::hours(24) - Duration::seconds(1))
        .await;
    match denied {
        Err(LeaseError::CooldownActive { remaining_secs }) => assert_eq!(remaining_secs, 1),
        other => panic!("expected cooldown denial, got {other:?}"),
    }

    // At the full window the next grant goes through.
    let second = h
        .manager
        .try_acquire(1, t0 + Duration::hours(24))
        .await
        .unwrap();
    assert_ne!(second.id, lease.id);
}

#[tokio::test]
async fn premium_users_bypass_the_cooldown() {
    let h = harness(3);
    let t0 = Utc::now();
    h.entitlements
        .extend_premium(2, Duration::days(30), t0)
        .await
        .unwrap();

    let first = h.manager.try_acquire(2, t0).await.unwrap();
    let second = h
        .manager
        .try_acquire(2, t0 + Duration::minutes(1))
        .await
        .unwrap();
    assert_eq!(first.expires_at, t0 + Duration::hours(720));
    assert_ne!(first.id, second.id);
}

#[tokio::test]
async fn lapsed_premium_is_treated_as_free() {
    let h = harness(2);
    let t0 = Utc::now();
    h.entitlements
        .extend_premium(3, Duration::days(1), t0)
        .await
        .unwrap();

    // Well past expiry: trial TTL applies and so does the cooldown.
    let later = t0 + Duration::days(5);
    let lease = h.manager.try_acquire(3, later).await.unwrap();
    assert_eq!(lease.expires_at, later + Duration::hours(6));
    assert!(matches!(
        h.manager.try_acquire(3, later + Duration::hours(1)).await,
        Err(LeaseError::CooldownActive { .. })
    ));
}

#[tokio::test]
async fn empty_pool_denies_everyone() {
    let h = harness(0);
    let t0 = Utc::now();
    h.entitlements
        .extend_premium(4, Duration::days(30), t0)
        .await
        .unwrap();

    assert!(matches!(
        h.manager.try_acquire(4, t0).await,
        Err(LeaseError::PoolExhausted)
    ));
    assert!(matches!(
        h.manager.try_acquire(5, t0).await,
        Err(LeaseError::PoolExhausted)
    ));
    assert_eq!(h.provisioner.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn provisioning_failure_invalidates_the_lease_and_keeps_the_cooldown_unconsumed() {
    let h = harness(1);
    let t0 = Utc::now();
    h.provisioner.fail.store(true, Ordering::SeqCst);

    assert!(matches!(
        h.manager.try_acquire(6, t0).await,
        Err(LeaseError::Provisioning(_))
    ));
    // The failed grant left no active lease behind.
    assert!(h.store.latest_active_issued_at(6).await.unwrap().is_none());
    assert_eq!(h.manager.active_count(t0).await.unwrap(), 0);

    // An immediate retry succeeds once the agent recovers.
    h.provisioner.fail.store(false, Ordering::SeqCst);
    let lease = h
        .manager
        .try_acquire(6, t0 + Duration::seconds(5))
        .await
        .unwrap();
    assert!(lease.active);
    assert_eq!(h.manager.active_count(t0).await.unwrap(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_requests_from_one_free_user_yield_one_lease() {
    let h = harness(4);
    let t0 = Utc::now();

    let mut handles = Vec::new();
    for _ in 0..4 {
        let manager = h.manager.clone();
        handles.push(tokio::spawn(async move { manager.try_acquire(8, t0).await }));
    }

    let mut granted = 0;
    let mut denied = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => granted += 1,
            Err(LeaseError::CooldownActive { .. }) => denied += 1,
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }
    assert_eq!(granted, 1);
    assert_eq!(denied, 3);
    assert_eq!(h.provisioner.calls.load(Ordering::SeqCst), 1);
}
