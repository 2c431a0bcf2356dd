//! Message senders
//!
//! A sender transmits a message to one destination and reports a
//! structured [`SendResult`]. Senders are built per dequeue run by a
//! [`SenderFactory`] and reused for every message of a batch that targets
//! the same destination.

pub mod http;
pub mod smtp;

pub use http::HttpSender;
pub use smtp::{SmtpSender, SmtpServerSpec, SslMode};

use async_trait::async_trait;
use courier_common::config::{HttpSenderConfig, SmtpClientConfig};
use courier_common::types::{DeliveryStatus, EndpointId, IpAddressId};
use courier_common::Result;
use courier_storage::models::{HttpEndpoint, IpAddress, Message, NewDelivery, Server};
use std::time::Duration;

/// Transmission outcome class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    Sent,
    SoftFail,
    HardFail,
}

impl SendStatus {
    pub fn delivery_status(&self) -> DeliveryStatus {
        match self {
            SendStatus::Sent => DeliveryStatus::Sent,
            SendStatus::SoftFail => DeliveryStatus::SoftFail,
            SendStatus::HardFail => DeliveryStatus::HardFail,
        }
    }
}

/// Whether and when the message should be tried again
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retry {
    No,
    /// Retry using the queue's backoff
    Yes,
    /// Retry after this many seconds
    After(u64),
}

impl Retry {
    pub fn is_requested(&self) -> bool {
        !matches!(self, Retry::No)
    }

    /// Delay requested by the sender, if any
    pub fn delay(&self) -> Option<Duration> {
        match self {
            Retry::After(secs) => Some(Duration::from_secs(*secs)),
            _ => None,
        }
    }
}

/// Result of one transmission attempt
#[derive(Debug, Clone, PartialEq)]
pub struct SendResult {
    pub status: SendStatus,
    pub retry: Retry,
    pub details: Option<String>,
    pub output: Option<String>,
    pub secure: bool,
    pub log_id: Option<String>,
    /// Seconds spent sending, rounded to two decimals
    pub time: Option<f64>,
    /// The destination could not be reached at all
    pub connect_error: bool,
    /// Hard failures that must not produce a bounce
    pub suppress_bounce: bool,
}

impl SendResult {
    pub fn new(status: SendStatus) -> Self {
        Self {
            status,
            retry: Retry::No,
            details: None,
            output: None,
            secure: false,
            log_id: None,
            time: None,
            connect_error: false,
            suppress_bounce: false,
        }
    }

    /// Delivery row describing this result
    pub fn to_delivery(&self) -> NewDelivery {
        NewDelivery {
            status: self.status.delivery_status(),
            details: self.details.clone(),
            output: self
                .output
                .as_deref()
                .map(str::trim)
                .map(str::to_string),
            sent_with_ssl: self.secure,
            log_id: self.log_id.clone(),
            time: self.time,
            hold_expiry: None,
        }
    }
}

/// Seconds elapsed, rounded to two decimal places
pub(crate) fn elapsed_secs(start: std::time::Instant) -> f64 {
    (start.elapsed().as_secs_f64() * 100.0).round() / 100.0
}

/// Eight character identifier tying log lines to a delivery
pub(crate) fn generate_log_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string().to_uppercase();
    id.truncate(8);
    id
}

/// Everything a sender needs to know about the message being sent
#[derive(Debug, Clone, Copy)]
pub struct Outbound<'a> {
    pub message: &'a Message,
    pub server: &'a Server,
    pub raw: &'a [u8],
    /// Domain used for the envelope sender
    pub return_path_domain: &'a str,
}

/// Message transmitter
#[async_trait]
pub trait Sender: Send + Sync {
    /// Prepare the sender, for SMTP this opens the connection
    async fn start(&mut self);

    /// Transmit one message. Failures are reported in the result.
    async fn send_message(&mut self, outbound: &Outbound<'_>) -> SendResult;

    /// Release any open connection
    async fn finish(&mut self) -> Result<()>;
}

/// Destination of a send
#[derive(Debug, Clone)]
pub enum SenderTarget {
    /// SMTP delivery to a domain, optionally forced to specific servers
    /// and with an overridden recipient
    Smtp {
        domain: String,
        ip_address: Option<IpAddress>,
        servers: Option<Vec<SmtpServerSpec>>,
        rcpt_to: Option<String>,
    },
    /// HTTP delivery to an endpoint
    Http(HttpEndpoint),
}

/// Identity of a target, used to share senders within a batch
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SenderKey {
    Smtp {
        domain: String,
        ip_address_id: Option<IpAddressId>,
        servers: Option<Vec<SmtpServerSpec>>,
        rcpt_to: Option<String>,
    },
    Http(EndpointId),
}

impl SenderTarget {
    pub fn key(&self) -> SenderKey {
        match self {
            SenderTarget::Smtp {
                domain,
                ip_address,
                servers,
                rcpt_to,
            } => SenderKey::Smtp {
                domain: domain.to_lowercase(),
                ip_address_id: ip_address.as_ref().map(|ip| ip.id),
                servers: servers.clone(),
                rcpt_to: rcpt_to.clone(),
            },
            SenderTarget::Http(endpoint) => SenderKey::Http(endpoint.id),
        }
    }
}

/// Builds senders for targets
pub trait SenderFactory: Send + Sync {
    fn build(&self, target: &SenderTarget) -> Box<dyn Sender>;
}

/// Factory for the real network senders
#[derive(Clone)]
pub struct NetworkSenderFactory {
    smtp: SmtpClientConfig,
    use_resent_sender_header: bool,
    http: HttpSenderConfig,
    http_client: reqwest::Client,
}

impl NetworkSenderFactory {
    pub fn new(
        smtp: SmtpClientConfig,
        use_resent_sender_header: bool,
        http: HttpSenderConfig,
    ) -> Self {
        Self {
            smtp,
            use_resent_sender_header,
            http,
            http_client: reqwest::Client::new(),
        }
    }
}

impl SenderFactory for NetworkSenderFactory {
    fn build(&self, target: &SenderTarget) -> Box<dyn Sender> {
        match target {
            SenderTarget::Smtp {
                domain,
                ip_address,
                servers,
                rcpt_to,
            } => Box::new(
                SmtpSender::new(domain.clone(), self.smtp.clone())
                    .with_source_ip(ip_address.clone())
                    .with_servers(servers.clone())
                    .with_rcpt_to(rcpt_to.clone())
                    .with_resent_sender(self.use_resent_sender_header),
            ),
            SenderTarget::Http(endpoint) => Box::new(HttpSender::new(
                endpoint.clone(),
                self.http_client.clone(),
                self.http.clone(),
            )),
        }
    }
}
