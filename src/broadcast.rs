use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use tokio::sync::watch;
use tokio::time::{sleep, timeout};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config;
use crate::directory::UserDirectory;
use crate::notify::NotificationSink;

/// key: broadcast -> resumable bulk delivery with partial-failure accounting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastJob {
    pub job_id: Uuid,
    pub message: String,
    /// Recipient snapshot captured at creation. The directory may grow
    /// afterward; the snapshot stays authoritative.
    pub recipients: Vec<i64>,
    pub total_recipients: i64,
    pub sent_count: i64,
    pub failed_count: i64,
    pub completed: bool,
    pub created_at: DateTime<Utc>,
}

impl BroadcastJob {
    /// Index of the next unattempted recipient in the snapshot.
    pub fn offset(&self) -> usize {
        (self.sent_count + self.failed_count) as usize
    }
}

#[async_trait::async_trait]
pub trait BroadcastStore: Send + Sync {
    async fn create(&self, job: BroadcastJob) -> Result<()>;
    async fn get(&self, job_id: Uuid) -> Result<Option<BroadcastJob>>;
    /// Persists the running counters; called after every delivery attempt so
    /// a crash loses at most one in-flight send.
    async fn update_counts(&self, job_id: Uuid, sent: i64, failed: i64) -> Result<()>;
    async fn mark_completed(&self, job_id: Uuid) -> Result<()>;
    async fn recent(&self, limit: i64) -> Result<Vec<BroadcastJob>>;
}

#[derive(Clone)]
pub struct PgBroadcastStore {
    pool: PgPool,
}

impl PgBroadcastStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn job_from_row(row: &sqlx::postgres::PgRow) -> Result<BroadcastJob> {
    let recipients: serde_json::Value = row.get("recipients");
    Ok(BroadcastJob {
        job_id: row.get("job_id"),
        message: row.get("message"),
        recipients: serde_json::from_value(recipients)?,
        total_recipients: row.get("total_recipients"),
        sent_count: row.get("sent_count"),
        failed_count: row.get("failed_count"),
        completed: row.get("completed"),
        created_at: row.get("created_at"),
    })
}

#[async_trait::async_trait]
impl BroadcastStore for PgBroadcastStore {
    async fn create(&self, job: BroadcastJob) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO broadcast_jobs (
                job_id, message, recipients, total_recipients,
                sent_count, failed_count, completed, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(job.job_id)
        .bind(&job.message)
        .bind(serde_json::to_value(&job.recipients)?)
        .bind(job.total_recipients)
        .bind(job.sent_count)
        .bind(job.failed_count)
        .bind(job.completed)
        .bind(job.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<BroadcastJob>> {
        let row = sqlx::query("SELECT * FROM broadcast_jobs WHERE job_id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn update_counts(&self, job_id: Uuid, sent: i64, failed: i64) -> Result<()> {
        sqlx::query(
            "UPDATE broadcast_jobs SET sent_count = $2, failed_count = $3 WHERE job_id = $1",
        )
        .bind(job_id)
        .bind(sent)
        .bind(failed)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_completed(&self, job_id: Uuid) -> Result<()> {
        sqlx::query("UPDATE broadcast_jobs SET completed = TRUE WHERE job_id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn recent(&self, limit: i64) -> Result<Vec<BroadcastJob>> {
        let rows = sqlx::query("SELECT * FROM broadcast_jobs ORDER BY created_at DESC LIMIT $1")
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(job_from_row).collect()
    }
}

#[derive(Default)]
pub struct MemoryBroadcastStore {
    jobs: DashMap<Uuid, BroadcastJob>,
}

impl MemoryBroadcastStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl BroadcastStore for MemoryBroadcastStore {
    async fn create(&self, job: BroadcastJob) -> Result<()> {
        self.jobs.insert(job.job_id, job);
        Ok(())
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<BroadcastJob>> {
        Ok(self.jobs.get(&job_id).map(|job| job.clone()))
    }

    async fn update_counts(&self, job_id: Uuid, sent: i64, failed: i64) -> Result<()> {
        let mut job = self
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| anyhow!("unknown broadcast job {job_id}"))?;
        job.sent_count = sent;
        job.failed_count = failed;
        Ok(())
    }

    async fn mark_completed(&self, job_id: Uuid) -> Result<()> {
        let mut job = self
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| anyhow!("unknown broadcast job {job_id}"))?;
        job.completed = true;
        Ok(())
    }

    async fn recent(&self, limit: i64) -> Result<Vec<BroadcastJob>> {
        let mut jobs: Vec<BroadcastJob> = self.jobs.iter().map(|job| job.clone()).collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs.truncate(limit as usize);
        Ok(jobs)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BroadcastPacing {
    pub delay: std::time::Duration,
    pub delivery_timeout: std::time::Duration,
}

impl BroadcastPacing {
    pub fn from_env() -> Self {
        Self {
            delay: std::time::Duration::from_millis(*config::BROADCAST_DELAY_MS),
            delivery_timeout: std::time::Duration::from_secs(*config::DELIVERY_TIMEOUT_SECS),
        }
    }
}

/// Walks a job's recipient snapshot as a single long-lived task, one job at a
/// time per `job_id`. Failures are per-recipient and never abort the run; a
/// cancel observed between sends stops cleanly with counts intact.
pub struct BroadcastDispatcher {
    store: Arc<dyn BroadcastStore>,
    directory: Arc<dyn UserDirectory>,
    sink: Arc<dyn NotificationSink>,
    pacing: BroadcastPacing,
    running: DashMap<Uuid, watch::Sender<bool>>,
}

impl BroadcastDispatcher {
    pub fn new(
        store: Arc<dyn BroadcastStore>,
        directory: Arc<dyn UserDirectory>,
        sink: Arc<dyn NotificationSink>,
        pacing: BroadcastPacing,
    ) -> Self {
        Self {
            store,
            directory,
            sink,
            pacing,
            running: DashMap::new(),
        }
    }

    /// Snapshots the directory, records the job, and spawns the runner.
    pub async fn start(self: &Arc<Self>, message: String, now: DateTime<Utc>) -> Result<Uuid> {
        let recipients = self.directory.all_user_ids().await?;
        let job = BroadcastJob {
            job_id: Uuid::new_v4(),
            message,
            total_recipients: recipients.len() as i64,
            recipients,
            sent_count: 0,
            failed_count: 0,
            completed: false,
            created_at: now,
        };
        let job_id = job.job_id;
        self.store.create(job.clone()).await?;
        self.spawn_runner(job);
        Ok(job_id)
    }

    /// Continues an interrupted job from its persisted offset. Recipients
    /// already attempted are never re-sent.
    pub async fn resume(self: &Arc<Self>, job_id: Uuid) -> Result<BroadcastJob> {
        let job = self
            .store
            .get(job_id)
            .await?
            .ok_or_else(|| anyhow!("unknown broadcast job {job_id}"))?;
        if !job.completed && !self.running.contains_key(&job_id) {
            self.spawn_runner(job.clone());
        }
        Ok(job)
    }

    pub async fn status(&self, job_id: Uuid) -> Result<Option<BroadcastJob>> {
        self.store.get(job_id).await
    }

    pub async fn recent(&self, limit: i64) -> Result<Vec<BroadcastJob>> {
        self.store.recent(limit).await
    }

    /// Signals the runner to stop at the next checkpoint. Returns false if
    /// the job is not currently running.
    pub fn cancel(&self, job_id: Uuid) -> bool {
        match self.running.get(&job_id) {
            Some(sender) => sender.send(true).is_ok(),
            None => false,
        }
    }

    pub fn is_running(&self, job_id: Uuid) -> bool {
        self.running.contains_key(&job_id)
    }

    fn spawn_runner(self: &Arc<Self>, job: BroadcastJob) {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        self.running.insert(job.job_id, cancel_tx);
        let dispatcher = self.clone();
        tokio::spawn(async move {
            dispatcher.run(job, cancel_rx).await;
        });
    }

    async fn run(self: Arc<Self>, job: BroadcastJob, cancel_rx: watch::Receiver<bool>) {
        let job_id = job.job_id;
        let mut sent = job.sent_count;
        let mut failed = job.failed_count;
        let mut index = job.offset();

        while index < job.recipients.len() {
            if *cancel_rx.borrow() {
                info!(%job_id, sent, failed, "broadcast cancelled at checkpoint");
                self.running.remove(&job_id);
                return;
            }

            let user_id = job.recipients[index];
            match timeout(
                self.pacing.delivery_timeout,
                self.sink.deliver(user_id, &job.message),
            )
            .await
            {
                Ok(Ok(())) => sent += 1,
                Ok(Err(err)) => {
                    failed += 1;
                    warn!(?err, %user_id, %job_id, "broadcast delivery failed");
                }
                Err(_) => {
                    failed += 1;
                    warn!(%user_id, %job_id, "broadcast delivery timed out");
                }
            }

            // Checkpoint before the pacing delay; a crash from here on loses
            // nothing.
            if let Err(err) = self.store.update_counts(job_id, sent, failed).await {
                warn!(?err, %job_id, "failed to checkpoint broadcast counters, stopping");
                self.running.remove(&job_id);
                return;
            }

            index += 1;
            if index < job.recipients.len() {
                sleep(self.pacing.delay).await;
            }
        }

        if let Err(err) = self.store.mark_completed(job_id).await {
            warn!(?err, %job_id, "failed to mark broadcast completed");
        } else {
            info!(%job_id, sent, failed, total = job.total_recipients, "broadcast completed");
        }
        self.running.remove(&job_id);
    }
}
