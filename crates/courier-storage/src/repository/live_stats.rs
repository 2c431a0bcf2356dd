//! Per-minute message counters

use crate::db::{db_err, DatabasePool};
use async_trait::async_trait;
use chrono::{DateTime, DurationRound, Utc};
use courier_common::types::{Scope, ServerId};
use courier_common::Result;

/// Start of the minute containing `at`
pub fn minute_bucket(at: DateTime<Utc>) -> DateTime<Utc> {
    at.duration_trunc(chrono::Duration::minutes(1)).unwrap_or(at)
}

/// Live statistics trait
#[async_trait]
pub trait LiveStats: Send + Sync {
    /// Count one message for the current minute
    async fn increment(&self, server_id: ServerId, scope: Scope) -> Result<()>;

    /// Messages counted over the last `minutes` minutes for the given scopes
    async fn total(&self, server_id: ServerId, minutes: i64, scopes: &[Scope]) -> Result<i64>;
}

/// PostgreSQL live statistics implementation
pub struct DbLiveStats {
    pool: DatabasePool,
}

impl DbLiveStats {
    /// Create a new repository
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LiveStats for DbLiveStats {
    async fn increment(&self, server_id: ServerId, scope: Scope) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO live_stats (server_id, scope, minute, count)
            VALUES ($1, $2, $3, 1)
            ON CONFLICT (server_id, scope, minute) DO UPDATE SET
                count = live_stats.count + 1
            "#,
        )
        .bind(server_id)
        .bind(scope.to_string())
        .bind(minute_bucket(Utc::now()))
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn total(&self, server_id: ServerId, minutes: i64, scopes: &[Scope]) -> Result<i64> {
        let scopes: Vec<String> = scopes.iter().map(Scope::to_string).collect();
        let since = minute_bucket(Utc::now()) - chrono::Duration::minutes(minutes);

        let total: (Option<i64>,) = sqlx::query_as(
            r#"
            SELECT SUM(count)::BIGINT FROM live_stats
            WHERE server_id = $1 AND scope = ANY($2) AND minute > $3
            "#,
        )
        .bind(server_id)
        .bind(&scopes)
        .bind(since)
        .fetch_one(self.pool.pool())
        .await
        .map_err(db_err)?;

        Ok(total.0.unwrap_or(0))
    }
}
