//! Database models

use chrono::{DateTime, Utc};
use courier_common::types::{
    CredentialId, DeliveryId, DeliveryStatus, DomainId, EndpointId, IpAddressId, IpPoolId,
    MessageId, QueuedMessageId, RouteId, RouteMode, Scope, ServerId, ServerMode, SpamMode,
    SuppressionType,
};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Entry in the delivery queue
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub id: QueuedMessageId,
    pub message_id: MessageId,
    pub server_id: ServerId,
    pub domain: Option<String>,
    pub route_id: Option<RouteId>,
    pub ip_address_id: Option<IpAddressId>,
    pub batch_key: Option<String>,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub retry_after: Option<DateTime<Utc>>,
    pub attempts: i32,
    pub manual: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl QueuedMessage {
    /// Whether a worker currently holds the lease
    pub fn is_locked(&self) -> bool {
        self.locked_at.is_some()
    }

    /// Whether the retry time has been reached
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.retry_after.map_or(true, |at| at <= now)
    }

    /// Unleased and ready
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        !self.is_locked() && self.is_ready(now)
    }
}

/// Input for enqueueing a message
#[derive(Debug, Clone)]
pub struct EnqueueMessage {
    pub message_id: MessageId,
    pub server_id: ServerId,
    pub domain: Option<String>,
    pub route_id: Option<RouteId>,
    pub ip_address_id: Option<IpAddressId>,
    pub batch_key: Option<String>,
    pub manual: bool,
}

/// Stored message
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub server_id: ServerId,
    pub scope: String,
    pub mail_from: String,
    pub rcpt_to: String,
    pub raw_path: Option<String>,
    pub status: String,
    pub inspected: bool,
    pub spam: bool,
    pub spam_score: f64,
    pub threat: bool,
    pub threat_details: Option<String>,
    pub route_id: Option<RouteId>,
    pub endpoint_type: Option<String>,
    pub endpoint_id: Option<EndpointId>,
    pub credential_id: Option<CredentialId>,
    pub domain_id: Option<DomainId>,
    pub bounce: bool,
    pub bounce_for_id: Option<MessageId>,
    pub token: String,
    pub tag: Option<String>,
    pub parsed: bool,
    pub held: bool,
    pub hold_expiry: Option<DateTime<Utc>>,
    pub last_delivery_attempt: Option<DateTime<Utc>>,
    pub subject: Option<String>,
    pub message_id_header: Option<String>,
    pub size: i64,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Parsed scope, `None` for values this build does not know
    pub fn scope_enum(&self) -> Option<Scope> {
        self.scope.parse().ok()
    }

    /// Parsed status
    pub fn status_enum(&self) -> Option<DeliveryStatus> {
        self.status.parse().ok()
    }

    /// Domain part of the recipient address
    pub fn recipient_domain(&self) -> Option<String> {
        courier_common::types::EmailAddress::domain_of(&self.rcpt_to)
    }

    /// Bounces go back to the envelope sender, unless this is itself a
    /// bounce or has no sender
    pub fn is_bounceable(&self) -> bool {
        !self.bounce && !self.mail_from.trim().is_empty()
    }

    /// Key grouping queued messages that can share one sender
    pub fn batch_key(&self) -> Option<String> {
        match self.scope_enum()? {
            Scope::Outgoing => self
                .recipient_domain()
                .map(|domain| format!("outgoing-{}", domain)),
            Scope::Incoming => {
                let route_id = self.route_id?;
                let endpoint_id = self.endpoint_id?;
                let endpoint_type = self.endpoint_type.as_deref()?;
                Some(format!(
                    "incoming-rt:{}-ep:{}-{}",
                    route_id, endpoint_id, endpoint_type
                ))
            }
        }
    }
}

/// Input for creating a message
#[derive(Debug, Clone)]
pub struct CreateMessage {
    pub server_id: ServerId,
    pub scope: Scope,
    pub mail_from: String,
    pub rcpt_to: String,
    pub raw_path: Option<String>,
    pub route_id: Option<RouteId>,
    pub endpoint_type: Option<String>,
    pub endpoint_id: Option<EndpointId>,
    pub credential_id: Option<CredentialId>,
    pub domain_id: Option<DomainId>,
    pub bounce: bool,
    pub bounce_for_id: Option<MessageId>,
    pub subject: Option<String>,
    pub message_id_header: Option<String>,
    pub size: i64,
}

/// Inspection outcome written back onto a message
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InspectionUpdate {
    pub spam_score: f64,
    pub threat: bool,
    pub threat_details: Option<String>,
    pub checks: Vec<SpamCheck>,
}

/// Individual scanner rule that fired
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct SpamCheck {
    pub code: String,
    pub score: f64,
    pub description: Option<String>,
}

/// Immutable record of a delivery attempt
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct Delivery {
    pub id: DeliveryId,
    pub message_id: MessageId,
    pub status: String,
    pub details: Option<String>,
    pub output: Option<String>,
    pub sent_with_ssl: bool,
    pub log_id: Option<String>,
    pub time: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

impl Delivery {
    pub fn status_enum(&self) -> Option<DeliveryStatus> {
        self.status.parse().ok()
    }
}

/// Delivery about to be appended to the ledger
#[derive(Debug, Clone, PartialEq)]
pub struct NewDelivery {
    pub status: DeliveryStatus,
    pub details: Option<String>,
    pub output: Option<String>,
    pub sent_with_ssl: bool,
    pub log_id: Option<String>,
    pub time: Option<f64>,
    /// Set on the message when the status is `Held`
    pub hold_expiry: Option<DateTime<Utc>>,
}

impl NewDelivery {
    pub fn new(status: DeliveryStatus) -> Self {
        Self {
            status,
            details: None,
            output: None,
            sent_with_ssl: false,
            log_id: None,
            time: None,
            hold_expiry: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = Some(output.into());
        self
    }

    /// Append a sentence to the details
    pub fn append_details(&mut self, extra: &str) {
        let mut details = self.details.take().unwrap_or_default();
        if !details.is_empty() {
            if !details.ends_with('.') {
                details.push('.');
            }
            details.push(' ');
        }
        details.push_str(extra);
        self.details = Some(details);
    }
}

/// Suppression list entry
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct SuppressionEntry {
    pub id: uuid::Uuid,
    pub server_id: ServerId,
    pub suppression_type: String,
    pub address: String,
    pub reason: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub keep_until: DateTime<Utc>,
}

impl SuppressionEntry {
    pub fn suppression_type_enum(&self) -> Option<SuppressionType> {
        self.suppression_type.parse().ok()
    }

    /// Suppressed until `keep_until` passes
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.keep_until > now
    }
}

/// Mail server (account)
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct Server {
    pub id: ServerId,
    pub name: String,
    pub token: String,
    pub mode: String,
    pub suspended_at: Option<DateTime<Utc>>,
    pub suspension_reason: Option<String>,
    pub spam_threshold: f64,
    pub spam_failure_threshold: f64,
    pub outbound_spam_threshold: Option<f64>,
    pub send_limit: Option<i32>,
    pub send_limit_approaching_at: Option<DateTime<Utc>>,
    pub send_limit_exceeded_at: Option<DateTime<Utc>>,
    pub postmaster_address: Option<String>,
    pub domains_not_to_click_track: Vec<String>,
    pub ip_pool_id: Option<IpPoolId>,
    pub created_at: DateTime<Utc>,
}

impl Server {
    pub fn is_suspended(&self) -> bool {
        self.suspended_at.is_some()
    }

    pub fn mode_enum(&self) -> ServerMode {
        self.mode.parse().unwrap_or(ServerMode::Live)
    }
}

/// Send-limit flags to write back to a server
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SendLimitState {
    pub approaching_at: Option<DateTime<Utc>>,
    pub exceeded_at: Option<DateTime<Utc>>,
}

/// Incoming route
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct Route {
    pub id: RouteId,
    pub server_id: ServerId,
    pub name: String,
    pub mode: String,
    pub spam_mode: String,
    pub endpoint_type: Option<String>,
    pub endpoint_id: Option<EndpointId>,
    pub description: Option<String>,
}

impl Route {
    pub fn mode_enum(&self) -> Option<RouteMode> {
        self.mode.parse().ok()
    }

    pub fn spam_mode_enum(&self) -> SpamMode {
        self.spam_mode.parse().unwrap_or(SpamMode::Mark)
    }
}

/// Stored names of the endpoint kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EndpointKind {
    Smtp,
    Http,
    Address,
}

impl EndpointKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointKind::Smtp => "SMTPEndpoint",
            EndpointKind::Http => "HTTPEndpoint",
            EndpointKind::Address => "AddressEndpoint",
        }
    }

    pub fn from_type_str(s: &str) -> Option<Self> {
        match s {
            "SMTPEndpoint" => Some(EndpointKind::Smtp),
            "HTTPEndpoint" => Some(EndpointKind::Http),
            "AddressEndpoint" => Some(EndpointKind::Address),
            _ => None,
        }
    }
}

/// SMTP relay endpoint
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct SmtpEndpoint {
    pub id: EndpointId,
    pub server_id: ServerId,
    pub name: String,
    pub hostname: String,
    pub port: Option<i32>,
    pub ssl_mode: String,
    pub last_used_at: Option<DateTime<Utc>>,
}

/// HTTP webhook endpoint
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct HttpEndpoint {
    pub id: EndpointId,
    pub server_id: ServerId,
    pub name: String,
    pub url: String,
    pub encoding: String,
    pub format: String,
    pub strip_replies: bool,
    pub include_attachments: bool,
    pub timeout: Option<i32>,
    pub last_used_at: Option<DateTime<Utc>>,
}

/// Forward-to-address endpoint
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct AddressEndpoint {
    pub id: EndpointId,
    pub server_id: ServerId,
    pub address: String,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl AddressEndpoint {
    pub fn domain(&self) -> Option<String> {
        courier_common::types::EmailAddress::domain_of(&self.address)
    }
}

/// Destination of incoming mail
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Endpoint {
    Smtp(SmtpEndpoint),
    Http(HttpEndpoint),
    Address(AddressEndpoint),
}

impl Endpoint {
    pub fn id(&self) -> EndpointId {
        match self {
            Endpoint::Smtp(e) => e.id,
            Endpoint::Http(e) => e.id,
            Endpoint::Address(e) => e.id,
        }
    }

    pub fn kind(&self) -> EndpointKind {
        match self {
            Endpoint::Smtp(_) => EndpointKind::Smtp,
            Endpoint::Http(_) => EndpointKind::Http,
            Endpoint::Address(_) => EndpointKind::Address,
        }
    }
}

/// SMTP credential
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct Credential {
    pub id: CredentialId,
    pub server_id: ServerId,
    pub name: String,
    pub hold: bool,
}

/// Sending domain
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct Domain {
    pub id: DomainId,
    pub server_id: ServerId,
    pub name: String,
    pub return_path_status: Option<String>,
    pub return_path_domain: Option<String>,
}

impl Domain {
    /// The domain's own return path once verified, else the installation default
    pub fn effective_return_path_domain<'a>(&'a self, default: &'a str) -> &'a str {
        match (self.return_path_status.as_deref(), self.return_path_domain.as_deref()) {
            (Some("OK"), Some(domain)) if !domain.is_empty() => domain,
            _ => default,
        }
    }
}

/// Egress address
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct IpAddress {
    pub id: IpAddressId,
    pub ip_pool_id: IpPoolId,
    pub ipv4: String,
    pub ipv6: Option<String>,
    pub hostname: String,
    pub priority: i32,
}
