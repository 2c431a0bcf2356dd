//! In-memory store
//!
//! Implements every repository trait plus [`FileStorage`] over plain maps
//! behind one `RwLock`. Used by the pipeline tests and by tooling that needs
//! the pipeline without a database. Individual operations can be made to
//! fail with [`MemoryStore::fail_operation`] to exercise error paths.

use crate::file::FileStorage;
use crate::models::{
    Credential, CreateMessage, Delivery, Domain, EnqueueMessage, Endpoint, EndpointKind,
    InspectionUpdate, IpAddress, Message, NewDelivery, QueuedMessage, Route, SendLimitState,
    Server, SpamCheck, SuppressionEntry,
};
use crate::repository::suppressions::normalize_address;
use crate::repository::{
    generate_token, live_stats::minute_bucket, DeliveryLedger, LiveStats, MessageStore,
    QueueStore, RouteStore, ServerStore, SuppressionList,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use courier_common::types::{
    CredentialId, DeliveryStatus, DomainId, EndpointId, IpAddressId, MessageId, QueuedMessageId,
    RouteId, Scope, ServerId, SuppressionType,
};
use courier_common::{Error, Result};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use uuid::Uuid;

#[derive(Default)]
struct Tables {
    queued: HashMap<QueuedMessageId, QueuedMessage>,
    messages: HashMap<MessageId, Message>,
    spam_checks: HashMap<MessageId, Vec<SpamCheck>>,
    deliveries: Vec<Delivery>,
    suppressions: HashMap<(ServerId, String, String), SuppressionEntry>,
    servers: HashMap<ServerId, Server>,
    ip_addresses: HashMap<IpAddressId, IpAddress>,
    routes: HashMap<RouteId, Route>,
    endpoints: HashMap<EndpointId, Endpoint>,
    credentials: HashMap<CredentialId, Credential>,
    domains: HashMap<DomainId, Domain>,
    live_stats: HashMap<(ServerId, Scope, DateTime<Utc>), i64>,
    files: HashMap<String, Vec<u8>>,
    failing: HashSet<String>,
}

/// In-memory implementation of all storage traits
#[derive(Clone)]
pub struct MemoryStore {
    tables: Arc<RwLock<Tables>>,
    suppression_ttl: Duration,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty store keeping suppressions for 30 days by default
    pub fn new() -> Self {
        Self::with_suppression_days(30)
    }

    /// Create an empty store with a custom suppression retention
    pub fn with_suppression_days(days: i64) -> Self {
        Self {
            tables: Arc::new(RwLock::new(Tables::default())),
            suppression_ttl: Duration::days(days),
        }
    }

    fn tables(&self) -> RwLockReadGuard<'_, Tables> {
        self.tables.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn tables_mut(&self) -> RwLockWriteGuard<'_, Tables> {
        self.tables.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn check(&self, operation: &str) -> Result<()> {
        if self.tables().failing.contains(operation) {
            return Err(Error::Database(format!("{} failed", operation)));
        }
        Ok(())
    }

    /// Make every later call of the named trait method fail
    pub fn fail_operation(&self, operation: &str) {
        self.tables_mut().failing.insert(operation.to_string());
    }

    /// Undo [`MemoryStore::fail_operation`]
    pub fn restore_operation(&self, operation: &str) {
        self.tables_mut().failing.remove(operation);
    }

    pub fn insert_server(&self, server: Server) {
        self.tables_mut().servers.insert(server.id, server);
    }

    pub fn update_server(&self, id: ServerId, f: impl FnOnce(&mut Server)) {
        if let Some(server) = self.tables_mut().servers.get_mut(&id) {
            f(server);
        }
    }

    pub fn server(&self, id: ServerId) -> Option<Server> {
        self.tables().servers.get(&id).cloned()
    }

    pub fn insert_ip_address(&self, ip: IpAddress) {
        self.tables_mut().ip_addresses.insert(ip.id, ip);
    }

    pub fn insert_route(&self, route: Route) {
        self.tables_mut().routes.insert(route.id, route);
    }

    pub fn insert_endpoint(&self, endpoint: Endpoint) {
        self.tables_mut().endpoints.insert(endpoint.id(), endpoint);
    }

    pub fn endpoint(&self, id: EndpointId) -> Option<Endpoint> {
        self.tables().endpoints.get(&id).cloned()
    }

    pub fn insert_credential(&self, credential: Credential) {
        self.tables_mut().credentials.insert(credential.id, credential);
    }

    pub fn insert_domain(&self, domain: Domain) {
        self.tables_mut().domains.insert(domain.id, domain);
    }

    pub fn insert_message(&self, message: Message) {
        self.tables_mut().messages.insert(message.id, message);
    }

    pub fn update_message(&self, id: MessageId, f: impl FnOnce(&mut Message)) {
        if let Some(message) = self.tables_mut().messages.get_mut(&id) {
            f(message);
        }
    }

    pub fn remove_message(&self, id: MessageId) {
        self.tables_mut().messages.remove(&id);
    }

    pub fn message(&self, id: MessageId) -> Option<Message> {
        self.tables().messages.get(&id).cloned()
    }

    /// All messages, oldest first
    pub fn messages(&self) -> Vec<Message> {
        let mut messages: Vec<Message> = self.tables().messages.values().cloned().collect();
        messages.sort_by_key(|m| (m.timestamp, m.id));
        messages
    }

    pub fn insert_queued(&self, queued: QueuedMessage) {
        self.tables_mut().queued.insert(queued.id, queued);
    }

    pub fn update_queued(&self, id: QueuedMessageId, f: impl FnOnce(&mut QueuedMessage)) {
        if let Some(queued) = self.tables_mut().queued.get_mut(&id) {
            f(queued);
        }
    }

    pub fn queued(&self, id: QueuedMessageId) -> Option<QueuedMessage> {
        self.tables().queued.get(&id).cloned()
    }

    pub fn queued_len(&self) -> usize {
        self.tables().queued.len()
    }

    /// Deliveries of a message, oldest first
    pub fn deliveries(&self, message_id: MessageId) -> Vec<Delivery> {
        self.tables()
            .deliveries
            .iter()
            .filter(|d| d.message_id == message_id)
            .cloned()
            .collect()
    }

    /// Suppression rows for a server, expired ones included
    pub fn suppression_rows(&self, server_id: ServerId) -> Vec<SuppressionEntry> {
        self.tables()
            .suppressions
            .values()
            .filter(|entry| entry.server_id == server_id)
            .cloned()
            .collect()
    }

    pub fn insert_suppression(&self, entry: SuppressionEntry) {
        let key = (
            entry.server_id,
            entry.suppression_type.clone(),
            normalize_address(&entry.address),
        );
        self.tables_mut().suppressions.insert(key, entry);
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.tables().files.get(path).cloned()
    }

    pub fn remove_file(&self, path: &str) {
        self.tables_mut().files.remove(path);
    }
}

#[async_trait]
impl QueueStore for MemoryStore {
    async fn get(&self, id: QueuedMessageId) -> Result<Option<QueuedMessage>> {
        self.check("queue.get")?;
        Ok(self.tables().queued.get(&id).cloned())
    }

    async fn enqueue(&self, input: EnqueueMessage) -> Result<QueuedMessage> {
        self.check("enqueue")?;
        let now = Utc::now();
        let queued = QueuedMessage {
            id: Uuid::now_v7(),
            message_id: input.message_id,
            server_id: input.server_id,
            domain: input.domain,
            route_id: input.route_id,
            ip_address_id: input.ip_address_id,
            batch_key: input.batch_key,
            locked_by: None,
            locked_at: None,
            retry_after: None,
            attempts: 0,
            manual: input.manual,
            created_at: now,
            updated_at: now,
        };
        self.tables_mut().queued.insert(queued.id, queued.clone());
        Ok(queued)
    }

    async fn try_lease(&self, id: QueuedMessageId, locker: &str) -> Result<bool> {
        self.check("try_lease")?;
        let now = Utc::now();
        let mut tables = self.tables_mut();
        match tables.queued.get_mut(&id) {
            Some(queued) if queued.locked_by.is_none() && queued.is_eligible(now) => {
                queued.locked_by = Some(locker.to_string());
                queued.locked_at = Some(now);
                queued.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn find_eligible_siblings(
        &self,
        batch_key: &str,
        server_id: ServerId,
        ip_address_id: Option<IpAddressId>,
        limit: i64,
    ) -> Result<Vec<QueuedMessageId>> {
        self.check("find_eligible_siblings")?;
        let now = Utc::now();
        let tables = self.tables();
        let mut siblings: Vec<&QueuedMessage> = tables
            .queued
            .values()
            .filter(|q| {
                q.batch_key.as_deref() == Some(batch_key)
                    && q.server_id == server_id
                    && q.ip_address_id == ip_address_id
                    && q.is_eligible(now)
            })
            .collect();
        siblings.sort_by_key(|q| (q.created_at, q.id));
        Ok(siblings
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|q| q.id)
            .collect())
    }

    async fn set_retry_after(&self, id: QueuedMessageId, at: DateTime<Utc>) -> Result<()> {
        self.check("set_retry_after")?;
        if let Some(queued) = self.tables_mut().queued.get_mut(&id) {
            queued.retry_after = Some(at);
            queued.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn delete_lease(&self, id: QueuedMessageId) -> Result<()> {
        self.check("delete_lease")?;
        self.tables_mut().queued.remove(&id);
        Ok(())
    }

    async fn increment_attempts(&self, id: QueuedMessageId) -> Result<()> {
        self.check("increment_attempts")?;
        if let Some(queued) = self.tables_mut().queued.get_mut(&id) {
            queued.attempts += 1;
            queued.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn unlock(&self, id: QueuedMessageId) -> Result<()> {
        self.check("unlock")?;
        if let Some(queued) = self.tables_mut().queued.get_mut(&id) {
            queued.locked_by = None;
            queued.locked_at = None;
            queued.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn assign_ip_address(
        &self,
        id: QueuedMessageId,
        ip_address_id: Option<IpAddressId>,
    ) -> Result<()> {
        self.check("assign_ip_address")?;
        if let Some(queued) = self.tables_mut().queued.get_mut(&id) {
            queued.ip_address_id = ip_address_id;
        }
        Ok(())
    }

    async fn find_ready(&self, limit: i64) -> Result<Vec<QueuedMessageId>> {
        self.check("find_ready")?;
        let now = Utc::now();
        let tables = self.tables();
        let mut ready: Vec<&QueuedMessage> =
            tables.queued.values().filter(|q| q.is_eligible(now)).collect();
        ready.sort_by_key(|q| (q.retry_after.unwrap_or(q.created_at), q.id));
        Ok(ready
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|q| q.id)
            .collect())
    }

    async fn release_stale_locks(&self, locked_before: DateTime<Utc>) -> Result<u64> {
        self.check("release_stale_locks")?;
        let mut released = 0;
        for queued in self.tables_mut().queued.values_mut() {
            if queued.locked_at.is_some_and(|at| at < locked_before) {
                queued.locked_by = None;
                queued.locked_at = None;
                released += 1;
            }
        }
        Ok(released)
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn create(&self, input: CreateMessage) -> Result<Message> {
        self.check("create_message")?;
        let message = Message {
            id: Uuid::now_v7(),
            server_id: input.server_id,
            scope: input.scope.to_string(),
            mail_from: input.mail_from,
            rcpt_to: input.rcpt_to,
            raw_path: input.raw_path,
            status: DeliveryStatus::Pending.to_string(),
            inspected: false,
            spam: false,
            spam_score: 0.0,
            threat: false,
            threat_details: None,
            route_id: input.route_id,
            endpoint_type: input.endpoint_type,
            endpoint_id: input.endpoint_id,
            credential_id: input.credential_id,
            domain_id: input.domain_id,
            bounce: input.bounce,
            bounce_for_id: input.bounce_for_id,
            token: generate_token(),
            tag: None,
            parsed: false,
            held: false,
            hold_expiry: None,
            last_delivery_attempt: None,
            subject: input.subject,
            message_id_header: input.message_id_header,
            size: input.size,
            timestamp: Utc::now(),
        };
        self.tables_mut().messages.insert(message.id, message.clone());
        Ok(message)
    }

    async fn get(&self, id: MessageId) -> Result<Option<Message>> {
        self.check("message.get")?;
        Ok(self.tables().messages.get(&id).cloned())
    }

    async fn find_by_tokens(&self, server_id: ServerId, tokens: &[String]) -> Result<Vec<Message>> {
        self.check("find_by_tokens")?;
        let tables = self.tables();
        let mut found: Vec<Message> = tables
            .messages
            .values()
            .filter(|m| {
                m.server_id == server_id
                    && m.scope_enum() == Some(Scope::Outgoing)
                    && tokens.contains(&m.token)
            })
            .cloned()
            .collect();
        found.sort_by_key(|m| (m.timestamp, m.id));
        Ok(found)
    }

    async fn link_bounce(
        &self,
        id: MessageId,
        bounce_for_id: MessageId,
        domain_id: Option<DomainId>,
    ) -> Result<()> {
        self.check("link_bounce")?;
        if let Some(message) = self.tables_mut().messages.get_mut(&id) {
            message.bounce_for_id = Some(bounce_for_id);
            message.domain_id = domain_id;
        }
        Ok(())
    }

    async fn mark_inspected(&self, id: MessageId, update: &InspectionUpdate) -> Result<()> {
        self.check("mark_inspected")?;
        let mut tables = self.tables_mut();
        if let Some(message) = tables.messages.get_mut(&id) {
            message.inspected = true;
            message.spam_score = update.spam_score;
            message.threat = update.threat;
            message.threat_details = update.threat_details.clone();
        }
        tables.spam_checks.insert(id, update.checks.clone());
        Ok(())
    }

    async fn spam_checks(&self, id: MessageId) -> Result<Vec<SpamCheck>> {
        self.check("spam_checks")?;
        Ok(self.tables().spam_checks.get(&id).cloned().unwrap_or_default())
    }

    async fn set_spam(&self, id: MessageId, spam: bool) -> Result<()> {
        self.check("set_spam")?;
        self.update_message(id, |m| m.spam = spam);
        Ok(())
    }

    async fn set_tag(&self, id: MessageId, tag: &str) -> Result<()> {
        self.check("set_tag")?;
        self.update_message(id, |m| m.tag = Some(tag.to_string()));
        Ok(())
    }

    async fn set_parsed(&self, id: MessageId) -> Result<()> {
        self.check("set_parsed")?;
        self.update_message(id, |m| m.parsed = true);
        Ok(())
    }

    async fn set_raw_path(&self, id: MessageId, raw_path: &str, size: i64) -> Result<()> {
        self.check("set_raw_path")?;
        self.update_message(id, |m| {
            m.raw_path = Some(raw_path.to_string());
            m.size = size;
        });
        Ok(())
    }

    async fn count_recent_hard_fails(
        &self,
        server_id: ServerId,
        rcpt_to: &str,
        since: DateTime<Utc>,
    ) -> Result<i64> {
        self.check("count_recent_hard_fails")?;
        let count = self
            .tables()
            .messages
            .values()
            .filter(|m| {
                m.server_id == server_id
                    && m.rcpt_to == rcpt_to
                    && m.status_enum() == Some(DeliveryStatus::HardFail)
                    && m.timestamp > since
            })
            .count();
        Ok(count as i64)
    }
}

#[async_trait]
impl DeliveryLedger for MemoryStore {
    async fn record(&self, message_id: MessageId, delivery: NewDelivery) -> Result<Delivery> {
        self.check("record")?;
        let mut tables = self.tables_mut();
        let Some(message) = tables.messages.get_mut(&message_id) else {
            return Err(Error::NotFound(format!("Message {}", message_id)));
        };

        let recorded = Delivery {
            id: Uuid::now_v7(),
            message_id,
            status: delivery.status.to_string(),
            details: delivery.details,
            output: delivery.output,
            sent_with_ssl: delivery.sent_with_ssl,
            log_id: delivery.log_id,
            time: delivery.time,
            timestamp: Utc::now(),
        };

        let held = delivery.status == DeliveryStatus::Held;
        message.status = delivery.status.to_string();
        message.last_delivery_attempt = Some(recorded.timestamp);
        message.held = held;
        message.hold_expiry = if held { delivery.hold_expiry } else { None };

        tables.deliveries.push(recorded.clone());
        Ok(recorded)
    }

    async fn list(&self, message_id: MessageId) -> Result<Vec<Delivery>> {
        self.check("list_deliveries")?;
        Ok(self.deliveries(message_id))
    }
}

#[async_trait]
impl SuppressionList for MemoryStore {
    async fn add(
        &self,
        server_id: ServerId,
        suppression_type: SuppressionType,
        address: &str,
        reason: Option<&str>,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        self.check("suppression.add")?;
        let now = Utc::now();
        let address = normalize_address(address);
        let keep_until = now + ttl.unwrap_or(self.suppression_ttl);
        let key = (server_id, suppression_type.to_string(), address.clone());

        let mut tables = self.tables_mut();
        let entry = tables
            .suppressions
            .entry(key)
            .or_insert_with(|| SuppressionEntry {
                id: Uuid::new_v4(),
                server_id,
                suppression_type: suppression_type.to_string(),
                address,
                reason: None,
                timestamp: now,
                keep_until,
            });
        if let Some(reason) = reason {
            entry.reason = Some(reason.to_string());
        }
        entry.timestamp = now;
        entry.keep_until = keep_until;
        Ok(true)
    }

    async fn get(
        &self,
        server_id: ServerId,
        suppression_type: SuppressionType,
        address: &str,
    ) -> Result<Option<SuppressionEntry>> {
        self.check("suppression.get")?;
        let key = (server_id, suppression_type.to_string(), normalize_address(address));
        let now = Utc::now();
        Ok(self
            .tables()
            .suppressions
            .get(&key)
            .filter(|entry| entry.is_active(now))
            .cloned())
    }

    async fn remove(
        &self,
        server_id: ServerId,
        suppression_type: SuppressionType,
        address: &str,
    ) -> Result<bool> {
        self.check("suppression.remove")?;
        let key = (server_id, suppression_type.to_string(), normalize_address(address));
        Ok(self.tables_mut().suppressions.remove(&key).is_some())
    }

    async fn prune(&self) -> Result<u64> {
        self.check("suppression.prune")?;
        let now = Utc::now();
        let mut tables = self.tables_mut();
        let before = tables.suppressions.len();
        tables.suppressions.retain(|_, entry| entry.is_active(now));
        Ok((before - tables.suppressions.len()) as u64)
    }
}

#[async_trait]
impl ServerStore for MemoryStore {
    async fn get(&self, id: ServerId) -> Result<Option<Server>> {
        self.check("server.get")?;
        Ok(self.server(id))
    }

    async fn set_send_limit_state(&self, id: ServerId, state: SendLimitState) -> Result<()> {
        self.check("set_send_limit_state")?;
        self.update_server(id, |server| {
            server.send_limit_approaching_at = state.approaching_at;
            server.send_limit_exceeded_at = state.exceeded_at;
        });
        Ok(())
    }

    async fn allocate_ip_address(&self, id: ServerId) -> Result<Option<IpAddressId>> {
        self.check("allocate_ip_address")?;
        let tables = self.tables();
        let Some(pool_id) = tables.servers.get(&id).and_then(|s| s.ip_pool_id) else {
            return Ok(None);
        };
        let mut candidates: Vec<&IpAddress> = tables
            .ip_addresses
            .values()
            .filter(|ip| ip.ip_pool_id == pool_id)
            .collect();
        candidates.sort_by_key(|ip| (ip.priority, ip.id));
        Ok(candidates.first().map(|ip| ip.id))
    }

    async fn get_ip_address(&self, id: IpAddressId) -> Result<Option<IpAddress>> {
        self.check("get_ip_address")?;
        Ok(self.tables().ip_addresses.get(&id).cloned())
    }
}

#[async_trait]
impl RouteStore for MemoryStore {
    async fn get_route(&self, id: RouteId) -> Result<Option<Route>> {
        self.check("get_route")?;
        Ok(self.tables().routes.get(&id).cloned())
    }

    async fn get_endpoint(&self, endpoint_type: &str, id: EndpointId) -> Result<Option<Endpoint>> {
        self.check("get_endpoint")?;
        let Some(kind) = EndpointKind::from_type_str(endpoint_type) else {
            return Ok(None);
        };
        Ok(self
            .tables()
            .endpoints
            .get(&id)
            .filter(|endpoint| endpoint.kind() == kind)
            .cloned())
    }

    async fn mark_endpoint_used(&self, endpoint: &Endpoint) -> Result<()> {
        self.check("mark_endpoint_used")?;
        let now = Some(Utc::now());
        if let Some(stored) = self.tables_mut().endpoints.get_mut(&endpoint.id()) {
            match stored {
                Endpoint::Smtp(e) => e.last_used_at = now,
                Endpoint::Http(e) => e.last_used_at = now,
                Endpoint::Address(e) => e.last_used_at = now,
            }
        }
        Ok(())
    }

    async fn get_credential(&self, id: CredentialId) -> Result<Option<Credential>> {
        self.check("get_credential")?;
        Ok(self.tables().credentials.get(&id).cloned())
    }

    async fn get_domain(&self, id: DomainId) -> Result<Option<Domain>> {
        self.check("get_domain")?;
        Ok(self.tables().domains.get(&id).cloned())
    }
}

#[async_trait]
impl LiveStats for MemoryStore {
    async fn increment(&self, server_id: ServerId, scope: Scope) -> Result<()> {
        self.check("live_stats.increment")?;
        let minute = minute_bucket(Utc::now());
        *self
            .tables_mut()
            .live_stats
            .entry((server_id, scope, minute))
            .or_insert(0) += 1;
        Ok(())
    }

    async fn total(&self, server_id: ServerId, minutes: i64, scopes: &[Scope]) -> Result<i64> {
        self.check("live_stats.total")?;
        let since = minute_bucket(Utc::now()) - Duration::minutes(minutes);
        Ok(self
            .tables()
            .live_stats
            .iter()
            .filter(|((server, scope, minute), _)| {
                *server == server_id && scopes.contains(scope) && *minute > since
            })
            .map(|(_, count)| *count)
            .sum())
    }
}

#[async_trait]
impl FileStorage for MemoryStore {
    async fn store(&self, path: &str, data: &[u8]) -> Result<String> {
        self.check("file.store")?;
        self.tables_mut().files.insert(path.to_string(), data.to_vec());
        Ok(path.to_string())
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        self.check("file.read")?;
        self.tables()
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("File {}", path)))
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.check("file.delete")?;
        self.tables_mut().files.remove(path);
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        self.check("file.exists")?;
        Ok(self.tables().files.contains_key(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn enqueue_input(server_id: ServerId, batch_key: &str) -> EnqueueMessage {
        EnqueueMessage {
            message_id: Uuid::new_v4(),
            server_id,
            domain: Some("example.org".to_string()),
            route_id: None,
            ip_address_id: None,
            batch_key: Some(batch_key.to_string()),
            manual: false,
        }
    }

    #[tokio::test]
    async fn test_lease_is_exclusive() {
        let store = MemoryStore::new();
        let queued = store.enqueue(enqueue_input(Uuid::new_v4(), "k")).await.unwrap();

        assert!(store.try_lease(queued.id, "worker-a").await.unwrap());
        assert!(!store.try_lease(queued.id, "worker-b").await.unwrap());

        let row = QueueStore::get(&store, queued.id).await.unwrap().unwrap();
        assert_eq!(row.locked_by.as_deref(), Some("worker-a"));
    }

    #[tokio::test]
    async fn test_lease_refused_before_retry_time() {
        let store = MemoryStore::new();
        let queued = store.enqueue(enqueue_input(Uuid::new_v4(), "k")).await.unwrap();
        store
            .set_retry_after(queued.id, Utc::now() + Duration::minutes(5))
            .await
            .unwrap();

        assert!(!store.try_lease(queued.id, "worker-a").await.unwrap());
    }

    #[tokio::test]
    async fn test_reschedule_counts_attempt_and_unlocks() {
        let store = MemoryStore::new();
        let queued = store.enqueue(enqueue_input(Uuid::new_v4(), "k")).await.unwrap();
        store.try_lease(queued.id, "worker-a").await.unwrap();

        let at = Utc::now() + Duration::minutes(5);
        store.reschedule(queued.id, at).await.unwrap();

        let row = store.queued(queued.id).unwrap();
        assert_eq!(row.attempts, 1);
        assert_eq!(row.retry_after, Some(at));
        assert!(!row.is_locked());
    }

    #[tokio::test]
    async fn test_siblings_match_key_server_and_address() {
        let store = MemoryStore::new();
        let server_id = Uuid::new_v4();
        let a = store.enqueue(enqueue_input(server_id, "outgoing-example.org")).await.unwrap();
        let b = store.enqueue(enqueue_input(server_id, "outgoing-example.org")).await.unwrap();
        store.enqueue(enqueue_input(server_id, "outgoing-other.org")).await.unwrap();
        store
            .enqueue(enqueue_input(Uuid::new_v4(), "outgoing-example.org"))
            .await
            .unwrap();

        store.try_lease(a.id, "worker-a").await.unwrap();
        let siblings = store
            .find_eligible_siblings("outgoing-example.org", server_id, None, 100)
            .await
            .unwrap();
        assert_eq!(siblings, vec![b.id]);
    }

    #[tokio::test]
    async fn test_suppression_add_refreshes_single_row() {
        let store = MemoryStore::new();
        let server_id = Uuid::new_v4();

        store
            .add(server_id, SuppressionType::Recipient, "a@example.org", Some("too many hard fails"), None)
            .await
            .unwrap();
        store
            .add(server_id, SuppressionType::Recipient, "A@example.org", None, None)
            .await
            .unwrap();

        let rows = store.suppression_rows(server_id);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].reason.as_deref(), Some("too many hard fails"));
    }

    #[tokio::test]
    async fn test_expired_suppression_is_invisible_until_pruned() {
        let store = MemoryStore::new();
        let server_id = Uuid::new_v4();
        store
            .add(
                server_id,
                SuppressionType::Recipient,
                "a@example.org",
                Some("test"),
                Some(Duration::seconds(-1)),
            )
            .await
            .unwrap();

        assert!(SuppressionList::get(&store, server_id, SuppressionType::Recipient, "a@example.org")
            .await
            .unwrap()
            .is_none());
        assert_eq!(store.suppression_rows(server_id).len(), 1);

        assert_eq!(store.prune().await.unwrap(), 1);
        assert!(store.suppression_rows(server_id).is_empty());
    }

    #[tokio::test]
    async fn test_record_updates_message_status() {
        let store = MemoryStore::new();
        let message = store
            .create(CreateMessage {
                server_id: Uuid::new_v4(),
                scope: Scope::Outgoing,
                mail_from: "a@example.com".to_string(),
                rcpt_to: "b@example.org".to_string(),
                raw_path: None,
                route_id: None,
                endpoint_type: None,
                endpoint_id: None,
                credential_id: None,
                domain_id: None,
                bounce: false,
                bounce_for_id: None,
                subject: None,
                message_id_header: None,
                size: 0,
            })
            .await
            .unwrap();

        let expiry = Utc::now() + Duration::days(7);
        let mut held = NewDelivery::new(DeliveryStatus::Held).with_details("held");
        held.hold_expiry = Some(expiry);
        store.record(message.id, held).await.unwrap();

        let updated = store.message(message.id).unwrap();
        assert_eq!(updated.status, "Held");
        assert!(updated.held);
        assert_eq!(updated.hold_expiry, Some(expiry));

        store
            .record(message.id, NewDelivery::new(DeliveryStatus::Sent))
            .await
            .unwrap();
        let updated = store.message(message.id).unwrap();
        assert_eq!(updated.status, "Sent");
        assert!(!updated.held);
        assert_eq!(updated.hold_expiry, None);
        assert_eq!(store.deliveries(message.id).len(), 2);
    }

    #[tokio::test]
    async fn test_live_stats_totals() {
        let store = MemoryStore::new();
        let server_id = Uuid::new_v4();
        store.increment(server_id, Scope::Outgoing).await.unwrap();
        store.increment(server_id, Scope::Outgoing).await.unwrap();
        store.increment(server_id, Scope::Incoming).await.unwrap();

        assert_eq!(store.total(server_id, 60, &[Scope::Outgoing]).await.unwrap(), 2);
        assert_eq!(
            store
                .total(server_id, 60, &[Scope::Incoming, Scope::Outgoing])
                .await
                .unwrap(),
            3
        );
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let store = MemoryStore::new();
        store.fail_operation("find_ready");
        assert!(store.find_ready(10).await.is_err());
        store.restore_operation("find_ready");
        assert!(store.find_ready(10).await.unwrap().is_empty());
    }
}
