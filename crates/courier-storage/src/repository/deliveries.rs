//! Delivery ledger
//!
//! Deliveries are append-only. Recording one also copies its status onto the
//! message in the same transaction, so a message's status always matches its
//! latest delivery.

use crate::db::{db_err, DatabasePool};
use crate::models::{Delivery, NewDelivery};
use async_trait::async_trait;
use courier_common::types::{DeliveryStatus, MessageId};
use courier_common::Result;
use uuid::Uuid;

/// Delivery ledger trait
#[async_trait]
pub trait DeliveryLedger: Send + Sync {
    /// Append a delivery and update the message status
    async fn record(&self, message_id: MessageId, delivery: NewDelivery) -> Result<Delivery>;

    /// Deliveries for a message, oldest first
    async fn list(&self, message_id: MessageId) -> Result<Vec<Delivery>>;
}

/// PostgreSQL delivery ledger implementation
pub struct DbDeliveryLedger {
    pool: DatabasePool,
}

impl DbDeliveryLedger {
    /// Create a new repository
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeliveryLedger for DbDeliveryLedger {
    async fn record(&self, message_id: MessageId, delivery: NewDelivery) -> Result<Delivery> {
        let mut tx = self.pool.pool().begin().await.map_err(db_err)?;

        let recorded = sqlx::query_as::<_, Delivery>(
            r#"
            INSERT INTO deliveries (
                id, message_id, status, details, output, sent_with_ssl, log_id, time
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING *
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(message_id)
        .bind(delivery.status.as_str())
        .bind(&delivery.details)
        .bind(&delivery.output)
        .bind(delivery.sent_with_ssl)
        .bind(&delivery.log_id)
        .bind(delivery.time)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;

        let held = delivery.status == DeliveryStatus::Held;
        sqlx::query(
            r#"
            UPDATE messages
            SET status = $2, last_delivery_attempt = $3, held = $4, hold_expiry = $5
            WHERE id = $1
            "#,
        )
        .bind(message_id)
        .bind(delivery.status.as_str())
        .bind(recorded.timestamp)
        .bind(held)
        .bind(if held { delivery.hold_expiry } else { None })
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(recorded)
    }

    async fn list(&self, message_id: MessageId) -> Result<Vec<Delivery>> {
        sqlx::query_as::<_, Delivery>(
            "SELECT * FROM deliveries WHERE message_id = $1 ORDER BY timestamp ASC, id ASC",
        )
        .bind(message_id)
        .fetch_all(self.pool.pool())
        .await
        .map_err(db_err)
    }
}
