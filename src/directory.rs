use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};

/// key: directory -> registered user set
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub user_id: i64,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// The full user set consumed by broadcast snapshots and operator stats.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn upsert(&self, user: User) -> Result<()>;

    /// Every known user id in stable registration order.
    async fn all_user_ids(&self) -> Result<Vec<i64>>;

    async fn count(&self) -> Result<i64>;
}

#[derive(Clone)]
pub struct PgUserDirectory {
    pool: PgPool,
}

impl PgUserDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserDirectory for PgUserDirectory {
    async fn upsert(&self, user: User) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO users (user_id, username, first_name, created_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (user_id)
            DO UPDATE SET username = EXCLUDED.username, first_name = EXCLUDED.first_name
            "#,
        )
        .bind(user.user_id)
        .bind(&user.username)
        .bind(&user.first_name)
        .bind(user.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn all_user_ids(&self) -> Result<Vec<i64>> {
        let rows = sqlx::query("SELECT user_id FROM users ORDER BY created_at, user_id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|row| row.get("user_id")).collect())
    }

    async fn count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

#[derive(Default)]
pub struct MemoryUserDirectory {
    users: DashMap<i64, User>,
}

impl MemoryUserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_users(ids: impl IntoIterator<Item = i64>) -> Self {
        let directory = Self::new();
        let now = Utc::now();
        for user_id in ids {
            directory.users.insert(
                user_id,
                User {
                    user_id,
                    username: None,
                    first_name: None,
                    created_at: now,
                },
            );
        }
        directory
    }
}

#[async_trait]
impl UserDirectory for MemoryUserDirectory {
    async fn upsert(&self, user: User) -> Result<()> {
        self.users.insert(user.user_id, user);
        Ok(())
    }

    async fn all_user_ids(&self) -> Result<Vec<i64>> {
        let mut users: Vec<(DateTime<Utc>, i64)> = self
            .users
            .iter()
            .map(|user| (user.created_at, user.user_id))
            .collect();
        users.sort();
        Ok(users.into_iter().map(|(_, id)| id).collect())
    }

    async fn count(&self) -> Result<i64> {
        Ok(self.users.len() as i64)
    }
}
