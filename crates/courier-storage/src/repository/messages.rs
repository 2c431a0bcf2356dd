//! Message repository

use crate::db::{db_err, DatabasePool};
use crate::models::{CreateMessage, InspectionUpdate, Message, SpamCheck};
use crate::repository::generate_token;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_common::types::{DomainId, MessageId, ServerId};
use courier_common::Result;
use uuid::Uuid;

/// Message repository trait
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Create a new message in `Pending` status
    async fn create(&self, input: CreateMessage) -> Result<Message>;

    /// Get a message by ID
    async fn get(&self, id: MessageId) -> Result<Option<Message>>;

    /// Outgoing messages of a server carrying any of the given tokens
    async fn find_by_tokens(&self, server_id: ServerId, tokens: &[String]) -> Result<Vec<Message>>;

    /// Point a bounce at the message it reports on
    async fn link_bounce(
        &self,
        id: MessageId,
        bounce_for_id: MessageId,
        domain_id: Option<DomainId>,
    ) -> Result<()>;

    /// Store inspection results and mark the message inspected
    async fn mark_inspected(&self, id: MessageId, update: &InspectionUpdate) -> Result<()>;

    /// Scanner rules recorded for a message
    async fn spam_checks(&self, id: MessageId) -> Result<Vec<SpamCheck>>;

    /// Flag the message as spam or not
    async fn set_spam(&self, id: MessageId, spam: bool) -> Result<()>;

    /// Set the message tag
    async fn set_tag(&self, id: MessageId, tag: &str) -> Result<()>;

    /// Mark content as parsed for tracking
    async fn set_parsed(&self, id: MessageId) -> Result<()>;

    /// Point the message at its raw content
    async fn set_raw_path(&self, id: MessageId, raw_path: &str, size: i64) -> Result<()>;

    /// Hard-failed messages to a recipient since a point in time
    async fn count_recent_hard_fails(
        &self,
        server_id: ServerId,
        rcpt_to: &str,
        since: DateTime<Utc>,
    ) -> Result<i64>;
}

/// PostgreSQL message repository implementation
pub struct DbMessageStore {
    pool: DatabasePool,
}

impl DbMessageStore {
    /// Create a new repository
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MessageStore for DbMessageStore {
    async fn create(&self, input: CreateMessage) -> Result<Message> {
        sqlx::query_as::<_, Message>(
            r#"
            INSERT INTO messages (
                id, server_id, scope, mail_from, rcpt_to, raw_path, status,
                route_id, endpoint_type, endpoint_id, credential_id, domain_id,
                bounce, bounce_for_id, token, subject, message_id_header, size
            ) VALUES (
                $1, $2, $3, $4, $5, $6, 'Pending', $7, $8, $9, $10, $11,
                $12, $13, $14, $15, $16, $17
            )
            RETURNING *
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(input.server_id)
        .bind(input.scope.to_string())
        .bind(&input.mail_from)
        .bind(&input.rcpt_to)
        .bind(&input.raw_path)
        .bind(input.route_id)
        .bind(&input.endpoint_type)
        .bind(input.endpoint_id)
        .bind(input.credential_id)
        .bind(input.domain_id)
        .bind(input.bounce)
        .bind(input.bounce_for_id)
        .bind(generate_token())
        .bind(&input.subject)
        .bind(&input.message_id_header)
        .bind(input.size)
        .fetch_one(self.pool.pool())
        .await
        .map_err(db_err)
    }

    async fn get(&self, id: MessageId) -> Result<Option<Message>> {
        sqlx::query_as::<_, Message>("SELECT * FROM messages WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(db_err)
    }

    async fn find_by_tokens(&self, server_id: ServerId, tokens: &[String]) -> Result<Vec<Message>> {
        if tokens.is_empty() {
            return Ok(Vec::new());
        }

        sqlx::query_as::<_, Message>(
            r#"
            SELECT * FROM messages
            WHERE server_id = $1 AND scope = 'outgoing' AND token = ANY($2)
            ORDER BY timestamp ASC
            "#,
        )
        .bind(server_id)
        .bind(tokens)
        .fetch_all(self.pool.pool())
        .await
        .map_err(db_err)
    }

    async fn link_bounce(
        &self,
        id: MessageId,
        bounce_for_id: MessageId,
        domain_id: Option<DomainId>,
    ) -> Result<()> {
        sqlx::query("UPDATE messages SET bounce_for_id = $2, domain_id = $3 WHERE id = $1")
            .bind(id)
            .bind(bounce_for_id)
            .bind(domain_id)
            .execute(self.pool.pool())
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn mark_inspected(&self, id: MessageId, update: &InspectionUpdate) -> Result<()> {
        let mut tx = self.pool.pool().begin().await.map_err(db_err)?;

        sqlx::query(
            r#"
            UPDATE messages
            SET inspected = TRUE, spam_score = $2, threat = $3, threat_details = $4
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(update.spam_score)
        .bind(update.threat)
        .bind(&update.threat_details)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        sqlx::query("DELETE FROM spam_checks WHERE message_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        for check in &update.checks {
            sqlx::query(
                r#"
                INSERT INTO spam_checks (id, message_id, code, score, description)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(id)
            .bind(&check.code)
            .bind(check.score)
            .bind(&check.description)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn spam_checks(&self, id: MessageId) -> Result<Vec<SpamCheck>> {
        sqlx::query_as::<_, SpamCheck>(
            "SELECT code, score, description FROM spam_checks WHERE message_id = $1 ORDER BY score DESC",
        )
        .bind(id)
        .fetch_all(self.pool.pool())
        .await
        .map_err(db_err)
    }

    async fn set_spam(&self, id: MessageId, spam: bool) -> Result<()> {
        sqlx::query("UPDATE messages SET spam = $2 WHERE id = $1")
            .bind(id)
            .bind(spam)
            .execute(self.pool.pool())
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn set_tag(&self, id: MessageId, tag: &str) -> Result<()> {
        sqlx::query("UPDATE messages SET tag = $2 WHERE id = $1")
            .bind(id)
            .bind(tag)
            .execute(self.pool.pool())
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn set_parsed(&self, id: MessageId) -> Result<()> {
        sqlx::query("UPDATE messages SET parsed = TRUE WHERE id = $1")
            .bind(id)
            .execute(self.pool.pool())
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn set_raw_path(&self, id: MessageId, raw_path: &str, size: i64) -> Result<()> {
        sqlx::query("UPDATE messages SET raw_path = $2, size = $3 WHERE id = $1")
            .bind(id)
            .bind(raw_path)
            .bind(size)
            .execute(self.pool.pool())
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn count_recent_hard_fails(
        &self,
        server_id: ServerId,
        rcpt_to: &str,
        since: DateTime<Utc>,
    ) -> Result<i64> {
        let count: (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM messages
            WHERE server_id = $1 AND rcpt_to = $2 AND status = 'HardFail' AND timestamp > $3
            "#,
        )
        .bind(server_id)
        .bind(rcpt_to)
        .bind(since)
        .fetch_one(self.pool.pool())
        .await
        .map_err(db_err)?;

        Ok(count.0)
    }
}
