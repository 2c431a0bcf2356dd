//! Shared fixtures for the pipeline tests

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use courier_common::config::DeliveryConfig;
use courier_common::types::Scope;
use courier_common::Result;
use courier_core::inspection::MessageInspector;
use courier_core::sender::{Outbound, Retry, SenderKey};
use courier_core::{Dequeuer, Metrics, SendResult, SendStatus, Sender, SenderFactory, SenderTarget, Stores};
use courier_storage::models::{
    CreateMessage, Domain, EnqueueMessage, Message, QueuedMessage, Server,
};
use courier_storage::{MemoryStore, MessageStorage, MessageStore, QueueStore};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

pub const RAW: &[u8] =
    b"From: sender@example.com\r\nTo: rcpt@example.org\r\nSubject: Hello\r\n\r\nHello there.\r\n";

/// One message handed to a scripted sender
#[derive(Debug, Clone)]
pub struct SentMessage {
    pub key: SenderKey,
    pub message_id: Uuid,
    pub rcpt_to: String,
    pub raw: Vec<u8>,
    pub return_path_domain: String,
}

#[derive(Default)]
pub struct Script {
    results: Mutex<VecDeque<SendResult>>,
    panic_next: Mutex<bool>,
    sent: Mutex<Vec<SentMessage>>,
    built: Mutex<usize>,
    finished: Mutex<usize>,
}

/// Sender factory whose senders replay queued results, `Sent` once the
/// script runs out
#[derive(Clone, Default)]
pub struct ScriptedFactory {
    script: Arc<Script>,
}

impl ScriptedFactory {
    pub fn push(&self, result: SendResult) {
        self.script.results.lock().unwrap().push_back(result);
    }

    pub fn panic_next(&self) {
        *self.script.panic_next.lock().unwrap() = true;
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.script.sent.lock().unwrap().clone()
    }

    pub fn built(&self) -> usize {
        *self.script.built.lock().unwrap()
    }

    pub fn finished(&self) -> usize {
        *self.script.finished.lock().unwrap()
    }
}

struct ScriptedSender {
    key: SenderKey,
    script: Arc<Script>,
}

#[async_trait]
impl Sender for ScriptedSender {
    async fn start(&mut self) {}

    async fn send_message(&mut self, outbound: &Outbound<'_>) -> SendResult {
        let panic = std::mem::take(&mut *self.script.panic_next.lock().unwrap());
        if panic {
            panic!("sender exploded");
        }

        self.script.sent.lock().unwrap().push(SentMessage {
            key: self.key.clone(),
            message_id: outbound.message.id,
            rcpt_to: outbound.message.rcpt_to.clone(),
            raw: outbound.raw.to_vec(),
            return_path_domain: outbound.return_path_domain.to_string(),
        });

        let scripted = self.script.results.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| sent("250 OK"))
    }

    async fn finish(&mut self) -> Result<()> {
        *self.script.finished.lock().unwrap() += 1;
        Ok(())
    }
}

impl SenderFactory for ScriptedFactory {
    fn build(&self, target: &SenderTarget) -> Box<dyn Sender> {
        *self.script.built.lock().unwrap() += 1;
        Box::new(ScriptedSender {
            key: target.key(),
            script: self.script.clone(),
        })
    }
}

pub fn sent(output: &str) -> SendResult {
    let mut result = SendResult::new(SendStatus::Sent);
    result.details = Some("Message for rcpt@example.org accepted".to_string());
    result.output = Some(output.to_string());
    result
}

pub fn soft_fail(retry: Retry) -> SendResult {
    let mut result = SendResult::new(SendStatus::SoftFail);
    result.details = Some("Temporary SMTP delivery error".to_string());
    result.output = Some("421 try again later".to_string());
    result.retry = retry;
    result
}

pub fn hard_fail() -> SendResult {
    let mut result = SendResult::new(SendStatus::HardFail);
    result.details = Some("Permanent SMTP delivery error".to_string());
    result.output = Some("550 no such user".to_string());
    result
}

pub fn server() -> Server {
    Server {
        id: Uuid::new_v4(),
        name: "Main".to_string(),
        token: "srvtoken".to_string(),
        mode: "Live".to_string(),
        suspended_at: None,
        suspension_reason: None,
        spam_threshold: 5.0,
        spam_failure_threshold: 20.0,
        outbound_spam_threshold: None,
        send_limit: None,
        send_limit_approaching_at: None,
        send_limit_exceeded_at: None,
        postmaster_address: None,
        domains_not_to_click_track: Vec::new(),
        ip_pool_id: None,
        created_at: Utc::now(),
    }
}

pub struct Fixture {
    pub store: MemoryStore,
    pub server: Server,
    pub domain: Domain,
    pub senders: ScriptedFactory,
    pub metrics: Metrics,
    pub config: DeliveryConfig,
    pub inspector: MessageInspector,
}

impl Fixture {
    pub fn new() -> Self {
        let store = MemoryStore::new();
        let server = server();
        let domain = Domain {
            id: Uuid::new_v4(),
            server_id: server.id,
            name: "example.com".to_string(),
            return_path_status: None,
            return_path_domain: None,
        };
        store.insert_server(server.clone());
        store.insert_domain(domain.clone());

        Self {
            store,
            server,
            domain,
            senders: ScriptedFactory::default(),
            metrics: Metrics::new().unwrap(),
            config: DeliveryConfig::default(),
            inspector: MessageInspector::disabled(),
        }
    }

    pub fn dequeuer(&self) -> Dequeuer {
        Dequeuer::new(
            Stores::from_memory(&self.store),
            self.config.clone(),
            Arc::new(self.senders.clone()),
            self.inspector.clone(),
            self.metrics.clone(),
            "test-worker",
        )
    }

    /// Store and queue a message built from `input`
    pub async fn queue(&self, input: CreateMessage, raw: &[u8]) -> (Message, QueuedMessage) {
        let message = MessageStore::create(&self.store, input).await.unwrap();
        let files = MessageStorage::new(Arc::new(self.store.clone()));
        let path = files
            .store_raw(&message.server_id, &message.id, raw)
            .await
            .unwrap();
        MessageStore::set_raw_path(&self.store, message.id, &path, raw.len() as i64)
            .await
            .unwrap();
        let message = self.store.message(message.id).unwrap();

        let queued = QueueStore::enqueue(
            &self.store,
            EnqueueMessage {
                message_id: message.id,
                server_id: message.server_id,
                domain: message.recipient_domain(),
                route_id: message.route_id,
                ip_address_id: None,
                batch_key: message.batch_key(),
                manual: false,
            },
        )
        .await
        .unwrap();
        (message, queued)
    }

    pub fn outgoing(&self, rcpt_to: &str) -> CreateMessage {
        CreateMessage {
            server_id: self.server.id,
            scope: Scope::Outgoing,
            mail_from: "sender@example.com".to_string(),
            rcpt_to: rcpt_to.to_string(),
            raw_path: None,
            route_id: None,
            endpoint_type: None,
            endpoint_id: None,
            credential_id: None,
            domain_id: Some(self.domain.id),
            bounce: false,
            bounce_for_id: None,
            subject: Some("Hello".to_string()),
            message_id_header: None,
            size: 0,
        }
    }

    pub fn incoming(&self, rcpt_to: &str) -> CreateMessage {
        CreateMessage {
            scope: Scope::Incoming,
            mail_from: "someone@remote.example".to_string(),
            domain_id: None,
            ..self.outgoing(rcpt_to)
        }
    }

    pub async fn queue_outgoing(&self, rcpt_to: &str) -> (Message, QueuedMessage) {
        self.queue(self.outgoing(rcpt_to), RAW).await
    }

    /// Statuses of a message's deliveries, oldest first
    pub fn statuses(&self, message_id: Uuid) -> Vec<String> {
        self.store
            .deliveries(message_id)
            .into_iter()
            .map(|d| d.status)
            .collect()
    }

    pub fn last_details(&self, message_id: Uuid) -> String {
        self.store
            .deliveries(message_id)
            .pop()
            .and_then(|d| d.details)
            .unwrap_or_default()
    }
}
