//! Queued message repository
//!
//! A queued message is in exactly one of three states: leased by one worker
//! (`locked_at` set), waiting (unleased, possibly with a `retry_after`), or
//! deleted. Leases are taken with a single conditional `UPDATE` so two
//! workers can never both succeed.

use crate::db::{db_err, DatabasePool};
use crate::models::{EnqueueMessage, QueuedMessage};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_common::types::{IpAddressId, QueuedMessageId, ServerId};
use courier_common::Result;
use uuid::Uuid;

/// Queue store trait
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Get a queued message by ID
    async fn get(&self, id: QueuedMessageId) -> Result<Option<QueuedMessage>>;

    /// Add a message to the queue
    async fn enqueue(&self, input: EnqueueMessage) -> Result<QueuedMessage>;

    /// Take the lease if the row is unleased and ready. Returns false when
    /// another worker holds it or it is not due yet.
    async fn try_lease(&self, id: QueuedMessageId, locker: &str) -> Result<bool>;

    /// Unleased, ready rows sharing the batch key, server and egress address
    async fn find_eligible_siblings(
        &self,
        batch_key: &str,
        server_id: ServerId,
        ip_address_id: Option<IpAddressId>,
        limit: i64,
    ) -> Result<Vec<QueuedMessageId>>;

    /// Set the earliest time of the next attempt
    async fn set_retry_after(&self, id: QueuedMessageId, at: DateTime<Utc>) -> Result<()>;

    /// Remove the row, ending its life in the queue
    async fn delete_lease(&self, id: QueuedMessageId) -> Result<()>;

    /// Count one more attempt
    async fn increment_attempts(&self, id: QueuedMessageId) -> Result<()>;

    /// Release the lease without touching retry state
    async fn unlock(&self, id: QueuedMessageId) -> Result<()>;

    /// Release the lease, count the attempt and push the retry time out
    async fn reschedule(&self, id: QueuedMessageId, retry_after: DateTime<Utc>) -> Result<()> {
        self.increment_attempts(id).await?;
        self.set_retry_after(id, retry_after).await?;
        self.unlock(id).await
    }

    /// Change the egress address
    async fn assign_ip_address(
        &self,
        id: QueuedMessageId,
        ip_address_id: Option<IpAddressId>,
    ) -> Result<()>;

    /// Unleased rows whose retry time has passed, oldest first
    async fn find_ready(&self, limit: i64) -> Result<Vec<QueuedMessageId>>;

    /// Release leases taken before `locked_before`. Returns the number released.
    async fn release_stale_locks(&self, locked_before: DateTime<Utc>) -> Result<u64>;
}

/// PostgreSQL queue store implementation
pub struct DbQueueStore {
    pool: DatabasePool,
}

impl DbQueueStore {
    /// Create a new repository
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl QueueStore for DbQueueStore {
    async fn get(&self, id: QueuedMessageId) -> Result<Option<QueuedMessage>> {
        sqlx::query_as::<_, QueuedMessage>("SELECT * FROM queued_messages WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(db_err)
    }

    async fn enqueue(&self, input: EnqueueMessage) -> Result<QueuedMessage> {
        sqlx::query_as::<_, QueuedMessage>(
            r#"
            INSERT INTO queued_messages (
                id, message_id, server_id, domain, route_id, ip_address_id,
                batch_key, manual
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING *
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(input.message_id)
        .bind(input.server_id)
        .bind(&input.domain)
        .bind(input.route_id)
        .bind(input.ip_address_id)
        .bind(&input.batch_key)
        .bind(input.manual)
        .fetch_one(self.pool.pool())
        .await
        .map_err(db_err)
    }

    async fn try_lease(&self, id: QueuedMessageId, locker: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE queued_messages
            SET locked_by = $2, locked_at = NOW(), updated_at = NOW()
            WHERE id = $1
              AND locked_at IS NULL
              AND locked_by IS NULL
              AND (retry_after IS NULL OR retry_after <= NOW())
            "#,
        )
        .bind(id)
        .bind(locker)
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() == 1)
    }

    async fn find_eligible_siblings(
        &self,
        batch_key: &str,
        server_id: ServerId,
        ip_address_id: Option<IpAddressId>,
        limit: i64,
    ) -> Result<Vec<QueuedMessageId>> {
        let rows: Vec<(QueuedMessageId,)> = sqlx::query_as(
            r#"
            SELECT id FROM queued_messages
            WHERE batch_key = $1
              AND server_id = $2
              AND ip_address_id IS NOT DISTINCT FROM $3
              AND locked_at IS NULL
              AND (retry_after IS NULL OR retry_after <= NOW())
            ORDER BY created_at ASC
            LIMIT $4
            "#,
        )
        .bind(batch_key)
        .bind(server_id)
        .bind(ip_address_id)
        .bind(limit)
        .fetch_all(self.pool.pool())
        .await
        .map_err(db_err)?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn set_retry_after(&self, id: QueuedMessageId, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE queued_messages SET retry_after = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(at)
            .execute(self.pool.pool())
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn delete_lease(&self, id: QueuedMessageId) -> Result<()> {
        sqlx::query("DELETE FROM queued_messages WHERE id = $1")
            .bind(id)
            .execute(self.pool.pool())
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn increment_attempts(&self, id: QueuedMessageId) -> Result<()> {
        sqlx::query(
            "UPDATE queued_messages SET attempts = attempts + 1, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn unlock(&self, id: QueuedMessageId) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE queued_messages
            SET locked_by = NULL, locked_at = NULL, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn reschedule(&self, id: QueuedMessageId, retry_after: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE queued_messages
            SET locked_by = NULL,
                locked_at = NULL,
                retry_after = $2,
                attempts = attempts + 1,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(retry_after)
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn assign_ip_address(
        &self,
        id: QueuedMessageId,
        ip_address_id: Option<IpAddressId>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE queued_messages SET ip_address_id = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(ip_address_id)
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn find_ready(&self, limit: i64) -> Result<Vec<QueuedMessageId>> {
        let rows: Vec<(QueuedMessageId,)> = sqlx::query_as(
            r#"
            SELECT id FROM queued_messages
            WHERE locked_at IS NULL
              AND (retry_after IS NULL OR retry_after <= NOW())
            ORDER BY COALESCE(retry_after, created_at) ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(self.pool.pool())
        .await
        .map_err(db_err)?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn release_stale_locks(&self, locked_before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE queued_messages
            SET locked_by = NULL, locked_at = NULL, updated_at = NOW()
            WHERE locked_at IS NOT NULL AND locked_at < $1
            "#,
        )
        .bind(locked_before)
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected())
    }
}
