//! Server repository

use crate::db::{db_err, DatabasePool};
use crate::models::{IpAddress, SendLimitState, Server};
use async_trait::async_trait;
use courier_common::types::{IpAddressId, ServerId};
use courier_common::Result;

/// Server repository trait
#[async_trait]
pub trait ServerStore: Send + Sync {
    /// Get a server by ID
    async fn get(&self, id: ServerId) -> Result<Option<Server>>;

    /// Write the send-limit approaching/exceeded timestamps
    async fn set_send_limit_state(&self, id: ServerId, state: SendLimitState) -> Result<()>;

    /// Pick an egress address from the server's IP pool, `None` without a pool
    async fn allocate_ip_address(&self, id: ServerId) -> Result<Option<IpAddressId>>;

    /// Get an egress address by ID
    async fn get_ip_address(&self, id: IpAddressId) -> Result<Option<IpAddress>>;
}

/// PostgreSQL server repository implementation
pub struct DbServerStore {
    pool: DatabasePool,
}

impl DbServerStore {
    /// Create a new repository
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ServerStore for DbServerStore {
    async fn get(&self, id: ServerId) -> Result<Option<Server>> {
        sqlx::query_as::<_, Server>("SELECT * FROM servers WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(db_err)
    }

    async fn set_send_limit_state(&self, id: ServerId, state: SendLimitState) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE servers
            SET send_limit_approaching_at = $2, send_limit_exceeded_at = $3
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(state.approaching_at)
        .bind(state.exceeded_at)
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn allocate_ip_address(&self, id: ServerId) -> Result<Option<IpAddressId>> {
        let row: Option<(IpAddressId,)> = sqlx::query_as(
            r#"
            SELECT ip.id FROM ip_addresses ip
            JOIN servers s ON s.ip_pool_id = ip.ip_pool_id
            WHERE s.id = $1
            ORDER BY random()
            LIMIT 1
            "#,
        )
        .bind(id)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(db_err)?;

        Ok(row.map(|(ip_id,)| ip_id))
    }

    async fn get_ip_address(&self, id: IpAddressId) -> Result<Option<IpAddress>> {
        sqlx::query_as::<_, IpAddress>("SELECT * FROM ip_addresses WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(db_err)
    }
}
