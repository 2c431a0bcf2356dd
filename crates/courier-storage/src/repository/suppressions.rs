//! Suppression list repository

use crate::db::{db_err, DatabasePool};
use crate::models::SuppressionEntry;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use courier_common::types::{ServerId, SuppressionType};
use courier_common::Result;
use uuid::Uuid;

/// Addresses are compared case-insensitively
pub fn normalize_address(address: &str) -> String {
    address.trim().to_ascii_lowercase()
}

/// Suppression list trait
#[async_trait]
pub trait SuppressionList: Send + Sync {
    /// Add or refresh an entry. A `None` reason keeps the stored one, a
    /// `None` ttl uses the configured retention. Returns true once the
    /// address is suppressed.
    async fn add(
        &self,
        server_id: ServerId,
        suppression_type: SuppressionType,
        address: &str,
        reason: Option<&str>,
        ttl: Option<Duration>,
    ) -> Result<bool>;

    /// The entry for an address, only while it has not expired
    async fn get(
        &self,
        server_id: ServerId,
        suppression_type: SuppressionType,
        address: &str,
    ) -> Result<Option<SuppressionEntry>>;

    /// Remove an entry. Returns true if one existed.
    async fn remove(
        &self,
        server_id: ServerId,
        suppression_type: SuppressionType,
        address: &str,
    ) -> Result<bool>;

    /// Delete expired entries across all servers. Returns the number removed.
    async fn prune(&self) -> Result<u64>;
}

/// PostgreSQL suppression list implementation
pub struct DbSuppressionList {
    pool: DatabasePool,
    default_ttl: Duration,
}

impl DbSuppressionList {
    /// Create a new repository keeping entries for `removal_days` by default
    pub fn new(pool: DatabasePool, removal_days: i64) -> Self {
        Self {
            pool,
            default_ttl: Duration::days(removal_days),
        }
    }
}

#[async_trait]
impl SuppressionList for DbSuppressionList {
    async fn add(
        &self,
        server_id: ServerId,
        suppression_type: SuppressionType,
        address: &str,
        reason: Option<&str>,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        let keep_until = Utc::now() + ttl.unwrap_or(self.default_ttl);

        let result = sqlx::query(
            r#"
            INSERT INTO suppressions (id, server_id, suppression_type, address, reason, keep_until)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (server_id, suppression_type, address) DO UPDATE SET
                reason = COALESCE(EXCLUDED.reason, suppressions.reason),
                keep_until = EXCLUDED.keep_until,
                timestamp = NOW()
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(server_id)
        .bind(suppression_type.to_string())
        .bind(normalize_address(address))
        .bind(reason)
        .bind(keep_until)
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn get(
        &self,
        server_id: ServerId,
        suppression_type: SuppressionType,
        address: &str,
    ) -> Result<Option<SuppressionEntry>> {
        sqlx::query_as::<_, SuppressionEntry>(
            r#"
            SELECT * FROM suppressions
            WHERE server_id = $1 AND suppression_type = $2 AND address = $3
              AND keep_until > NOW()
            "#,
        )
        .bind(server_id)
        .bind(suppression_type.to_string())
        .bind(normalize_address(address))
        .fetch_optional(self.pool.pool())
        .await
        .map_err(db_err)
    }

    async fn remove(
        &self,
        server_id: ServerId,
        suppression_type: SuppressionType,
        address: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM suppressions WHERE server_id = $1 AND suppression_type = $2 AND address = $3",
        )
        .bind(server_id)
        .bind(suppression_type.to_string())
        .bind(normalize_address(address))
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn prune(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM suppressions WHERE keep_until <= NOW()")
            .execute(self.pool.pool())
            .await
            .map_err(db_err)?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_address() {
        assert_eq!(normalize_address(" User@Example.COM "), "user@example.com");
    }
}
