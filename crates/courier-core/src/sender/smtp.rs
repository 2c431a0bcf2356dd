//! SMTP sender
//!
//! Delivers to a domain's mail exchangers, to the configured relays, or to
//! servers forced by an SMTP endpoint. The first server that accepts a
//! connection is used for every message sent through this sender.

use super::{elapsed_secs, generate_log_id, Outbound, Retry, SendResult, SendStatus, Sender};
use async_trait::async_trait;
use courier_common::config::SmtpClientConfig;
use courier_common::Result;
use courier_storage::models::{IpAddress, SmtpEndpoint};
use lettre::address::Envelope;
use lettre::transport::smtp::client::{AsyncSmtpConnection, TlsParameters};
use lettre::transport::smtp::extension::ClientId;
use lettre::Address;
use regex::Regex;
use std::fmt;
use std::net::IpAddr;
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// How to negotiate TLS with a server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SslMode {
    /// STARTTLS when offered
    Auto,
    /// STARTTLS is required
    StartTls,
    /// TLS from the first byte
    Tls,
    None,
}

impl SslMode {
    /// Parse the stored endpoint value, unknown values fall back to `Auto`
    pub fn parse(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "starttls" => SslMode::StartTls,
            "tls" => SslMode::Tls,
            "none" => SslMode::None,
            _ => SslMode::Auto,
        }
    }
}

/// A server to deliver to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SmtpServerSpec {
    pub hostname: String,
    pub port: Option<u16>,
    pub ssl_mode: SslMode,
}

impl SmtpServerSpec {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            port: None,
            ssl_mode: SslMode::Auto,
        }
    }

    pub fn from_endpoint(endpoint: &SmtpEndpoint) -> Self {
        Self {
            hostname: endpoint.hostname.clone(),
            port: endpoint.port.and_then(|p| u16::try_from(p).ok()),
            ssl_mode: SslMode::parse(&endpoint.ssl_mode),
        }
    }

    /// Parse a relay given as `host` or `host:port`
    pub fn parse_relay(relay: &str) -> Option<Self> {
        let relay = relay.trim();
        if relay.is_empty() {
            return None;
        }
        match relay.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() => {
                let port = port.parse::<u16>().ok()?;
                Some(Self {
                    hostname: host.to_string(),
                    port: Some(port),
                    ssl_mode: SslMode::Auto,
                })
            }
            _ => Some(Self::new(relay)),
        }
    }
}

/// An open session with one server
struct Connection {
    hostname: String,
    port: u16,
    session: AsyncSmtpConnection,
}

impl Connection {
    fn secure(&self) -> bool {
        self.session.is_encrypted()
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.hostname, self.port)
    }
}

/// SMTP sender bound to one destination domain
pub struct SmtpSender {
    domain: String,
    config: SmtpClientConfig,
    source_ip: Option<IpAddress>,
    servers: Option<Vec<SmtpServerSpec>>,
    rcpt_to: Option<String>,
    use_resent_sender: bool,
    log_id: String,
    attempted_hosts: Vec<String>,
    connection_errors: Vec<String>,
    current: Option<Connection>,
}

impl SmtpSender {
    pub fn new(domain: impl Into<String>, config: SmtpClientConfig) -> Self {
        Self {
            domain: domain.into(),
            config,
            source_ip: None,
            servers: None,
            rcpt_to: None,
            use_resent_sender: false,
            log_id: generate_log_id(),
            attempted_hosts: Vec::new(),
            connection_errors: Vec::new(),
            current: None,
        }
    }

    /// Egress address connections are bound to
    pub fn with_source_ip(mut self, ip: Option<IpAddress>) -> Self {
        self.source_ip = ip;
        self
    }

    /// Deliver only to these servers, skipping relays and MX lookup
    pub fn with_servers(mut self, servers: Option<Vec<SmtpServerSpec>>) -> Self {
        self.servers = servers;
        self
    }

    /// Send to this address instead of the message's recipient
    pub fn with_rcpt_to(mut self, rcpt_to: Option<String>) -> Self {
        self.rcpt_to = rcpt_to;
        self
    }

    /// Prepend a `Resent-Sender` header carrying the envelope sender
    pub fn with_resent_sender(mut self, enabled: bool) -> Self {
        self.use_resent_sender = enabled;
        self
    }

    fn relays(&self) -> Option<Vec<SmtpServerSpec>> {
        let relays: Vec<SmtpServerSpec> = self
            .config
            .relays
            .iter()
            .filter_map(|r| SmtpServerSpec::parse_relay(r))
            .collect();
        if relays.is_empty() {
            None
        } else {
            Some(relays)
        }
    }

    async fn candidate_servers(&self) -> Vec<SmtpServerSpec> {
        if let Some(servers) = &self.servers {
            return servers.clone();
        }
        if let Some(relays) = self.relays() {
            return relays;
        }
        resolve_mx(&self.domain)
            .await
            .into_iter()
            .map(SmtpServerSpec::new)
            .collect()
    }

    /// Name announced in EHLO: the egress address's hostname, then the
    /// configured name
    fn hello_name(&self) -> ClientId {
        self.source_ip
            .as_ref()
            .map(|ip| ip.hostname.trim())
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .or_else(|| self.config.helo_hostname.clone())
            .map(ClientId::Domain)
            .unwrap_or_default()
    }

    /// Local addresses to bind, IPv6 first. `[None]` without an egress address.
    fn local_addresses(&self) -> Vec<Option<IpAddr>> {
        let Some(ip) = &self.source_ip else {
            return vec![None];
        };
        let addresses: Vec<Option<IpAddr>> = [ip.ipv6.as_deref(), Some(ip.ipv4.as_str())]
            .into_iter()
            .flatten()
            .filter_map(|addr| addr.trim().parse::<IpAddr>().ok())
            .map(Some)
            .collect();
        if addresses.is_empty() {
            warn!(log_id = %self.log_id, "Egress address {} is not a valid IP, using the default route", ip.ipv4);
            vec![None]
        } else {
            addresses
        }
    }

    async fn open_session(
        &self,
        server: &SmtpServerSpec,
        port: u16,
        local_address: Option<IpAddr>,
        hello: &ClientId,
    ) -> std::result::Result<AsyncSmtpConnection, lettre::transport::smtp::Error> {
        let timeout = Some(Duration::from_secs(self.config.timeout_secs));
        let address = (server.hostname.as_str(), port);

        let wrapper = match server.ssl_mode {
            SslMode::Tls => Some(TlsParameters::new(server.hostname.clone())?),
            _ => None,
        };
        let mut session =
            AsyncSmtpConnection::connect_tokio1(address, timeout, hello, wrapper, local_address)
                .await?;

        match server.ssl_mode {
            SslMode::StartTls => {
                session
                    .starttls(TlsParameters::new(server.hostname.clone())?, hello)
                    .await?;
            }
            SslMode::Auto if session.can_starttls() => {
                let upgraded = match TlsParameters::new(server.hostname.clone()) {
                    Ok(params) => session.starttls(params, hello).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = upgraded {
                    warn!(
                        log_id = %self.log_id,
                        "STARTTLS with {}:{} failed, retrying without TLS ({})",
                        server.hostname, port, e
                    );
                    session.abort().await;
                    session = AsyncSmtpConnection::connect_tokio1(
                        address,
                        timeout,
                        hello,
                        None,
                        local_address,
                    )
                    .await?;
                }
            }
            _ => {}
        }

        Ok(session)
    }

    async fn connect(&mut self, server: &SmtpServerSpec) -> bool {
        if !self.attempted_hosts.contains(&server.hostname) {
            self.attempted_hosts.push(server.hostname.clone());
        }

        let port = server.port.unwrap_or(self.config.port);
        let hello = self.hello_name();

        for local_address in self.local_addresses() {
            match self.open_session(server, port, local_address, &hello).await {
                Ok(session) => {
                    info!(
                        log_id = %self.log_id,
                        "Connected to {}:{} from {}",
                        server.hostname,
                        port,
                        local_address.map_or_else(|| "default address".to_string(), |a| a.to_string())
                    );
                    self.current = Some(Connection {
                        hostname: server.hostname.clone(),
                        port,
                        session,
                    });
                    return true;
                }
                Err(e) => {
                    let message = e.to_string();
                    error!(log_id = %self.log_id, "Cannot connect to {}:{} ({})", server.hostname, port, message);
                    if !self.connection_errors.contains(&message) {
                        self.connection_errors.push(message);
                    }
                }
            }
        }
        false
    }

    fn result(&self, status: SendStatus, started: Option<Instant>) -> SendResult {
        let mut result = SendResult::new(status);
        result.log_id = Some(self.log_id.clone());
        result.secure = self.current.as_ref().map_or(false, Connection::secure);
        result.time = started.map(elapsed_secs);
        result
    }

    fn no_servers_result(&self) -> SendResult {
        let mut result = self.result(SendStatus::SoftFail, None);
        result.retry = Retry::Yes;
        result.connect_error = true;
        let mut details = format!("No SMTP servers were available for {}.", self.domain);
        if self.attempted_hosts.is_empty() {
            details.push_str(" No hosts to try.");
        } else {
            details.push_str(&format!(" Tried {}.", to_sentence(&self.attempted_hosts)));
        }
        result.details = Some(details);
        result.output = Some(self.connection_errors.join(", "));
        result
    }
}

#[async_trait]
impl Sender for SmtpSender {
    async fn start(&mut self) {
        for server in self.candidate_servers().await {
            if self.connect(&server).await {
                return;
            }
        }

        warn!(log_id = %self.log_id, "No SMTP servers available for {}", self.domain);
    }

    async fn send_message(&mut self, outbound: &Outbound<'_>) -> SendResult {
        let Some(endpoint) = self.current.as_ref().map(Connection::to_string) else {
            return self.no_servers_result();
        };

        let mail_from = mail_from_for(outbound);
        let rcpt_to = self
            .rcpt_to
            .clone()
            .unwrap_or_else(|| outbound.message.rcpt_to.clone());

        let mut raw = Vec::with_capacity(outbound.raw.len() + 64);
        if self.use_resent_sender {
            raw.extend_from_slice(format!("Resent-Sender: {}\r\n", mail_from).as_bytes());
        }
        raw.extend_from_slice(outbound.raw);

        let envelope = match build_envelope(&mail_from, &rcpt_to) {
            Ok(envelope) => envelope,
            Err(message) => {
                let mut result = self.result(SendStatus::HardFail, None);
                result.details = Some(format!(
                    "Permanent SMTP delivery error when sending to {}",
                    endpoint
                ));
                result.output = Some(message);
                return result;
            }
        };

        info!(
            log_id = %self.log_id,
            "Sending message {}::{} to {}",
            outbound.server.id, outbound.message.id, rcpt_to
        );

        let started = Instant::now();
        let sent = match self.current.as_mut() {
            Some(connection) => connection.session.send(&envelope, &raw).await,
            None => return self.no_servers_result(),
        };

        match sent {
            Ok(response) => {
                info!(log_id = %self.log_id, "Accepted by {} for {}", endpoint, rcpt_to);
                let lines: Vec<String> = response.message().map(|line| line.to_string()).collect();
                let mut result = self.result(SendStatus::Sent, Some(started));
                result.details = Some(format!("Message for {} accepted by {}", rcpt_to, endpoint));
                result.output = Some(format!("{} {}", response.code(), lines.join(" ")));
                result
            }
            Err(e) if e.is_transient() => {
                error!(log_id = %self.log_id, "Temporary failure from {}: {}", endpoint, e);
                let output = e.to_string();
                let mut result = self.result(SendStatus::SoftFail, Some(started));
                result.details = Some(format!(
                    "Temporary SMTP delivery error when sending to {}",
                    endpoint
                ));
                result.retry = retry_hint(&output);
                result.output = Some(output);
                result
            }
            Err(e) if e.is_permanent() => {
                error!(log_id = %self.log_id, "Permanent failure from {}: {}", endpoint, e);
                let mut result = self.result(SendStatus::HardFail, Some(started));
                result.details = Some(format!(
                    "Permanent SMTP delivery error when sending to {}",
                    endpoint
                ));
                result.output = Some(e.to_string());
                result
            }
            Err(e) => {
                error!(log_id = %self.log_id, "Error sending to {}: {}", endpoint, e);
                let mut result = self.result(SendStatus::SoftFail, Some(started));
                result.retry = Retry::Yes;
                result.details = Some(format!(
                    "An error occurred while sending the message to {}",
                    endpoint
                ));
                result.output = Some(e.to_string());
                result
            }
        }
    }

    async fn finish(&mut self) -> Result<()> {
        if let Some(mut connection) = self.current.take() {
            debug!(log_id = %self.log_id, "Closing session with {}", connection);
            if let Err(e) = connection.session.quit().await {
                debug!(log_id = %self.log_id, "QUIT to {} failed: {}", connection, e);
                connection.session.abort().await;
            }
        }
        Ok(())
    }
}

/// Envelope sender: empty for bounces, else the server token at the
/// return path domain
pub fn mail_from_for(outbound: &Outbound<'_>) -> String {
    if outbound.message.bounce {
        String::new()
    } else {
        format!("{}@{}", outbound.server.token, outbound.return_path_domain)
    }
}

fn build_envelope(mail_from: &str, rcpt_to: &str) -> std::result::Result<Envelope, String> {
    let from = if mail_from.is_empty() {
        None
    } else {
        Some(
            mail_from
                .parse::<Address>()
                .map_err(|e| format!("Invalid MAIL FROM {}: {}", mail_from, e))?,
        )
    };
    let to = rcpt_to
        .trim()
        .parse::<Address>()
        .map_err(|e| format!("Invalid RCPT TO {}: {}", rcpt_to, e))?;
    Envelope::new(from, vec![to]).map_err(|e| e.to_string())
}

fn seconds_hint() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d+) seconds").expect("valid retry pattern"))
}

fn minutes_hint() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d+) minutes").expect("valid retry pattern"))
}

/// Retry delay suggested by a temporary failure message
pub fn retry_hint(message: &str) -> Retry {
    if let Some(secs) = seconds_hint()
        .captures(message)
        .and_then(|c| c[1].parse::<u64>().ok())
    {
        return Retry::After(secs + 10);
    }
    if let Some(mins) = minutes_hint()
        .captures(message)
        .and_then(|c| c[1].parse::<u64>().ok())
    {
        return Retry::After(mins * 60 + 10);
    }
    Retry::Yes
}

/// "a", "a and b", "a, b, and c"
fn to_sentence(items: &[String]) -> String {
    match items {
        [] => String::new(),
        [one] => one.clone(),
        [a, b] => format!("{} and {}", a, b),
        [rest @ .., last] => format!("{}, and {}", rest.join(", "), last),
    }
}

/// Mail exchangers for a domain by preference, or the domain itself
pub async fn resolve_mx(domain: &str) -> Vec<String> {
    use trust_dns_resolver::config::*;
    use trust_dns_resolver::TokioAsyncResolver;

    let resolver = TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default());

    match resolver.mx_lookup(domain).await {
        Ok(mx) => {
            let mut hosts: Vec<(u16, String)> = mx
                .iter()
                .map(|r| {
                    (
                        r.preference(),
                        r.exchange().to_string().trim_end_matches('.').to_string(),
                    )
                })
                .collect();

            hosts.sort_by_key(|(pref, _)| *pref);

            if hosts.is_empty() {
                vec![domain.to_string()]
            } else {
                hosts.into_iter().map(|(_, host)| host).collect()
            }
        }
        Err(e) => {
            warn!("No MX records for {}, falling back to the domain: {}", domain, e);
            vec![domain.to_string()]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use courier_storage::models::{Message, Server};
    use pretty_assertions::assert_eq;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;
    use uuid::Uuid;

    /// Accepts one SMTP session on loopback, returning the client's address
    /// and every command line it sent
    async fn smtp_server() -> (u16, JoinHandle<(IpAddr, Vec<String>)>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            let (read, mut write) = stream.into_split();
            let mut lines = BufReader::new(read).lines();
            write.write_all(b"220 mx.test ESMTP\r\n").await.unwrap();

            let mut commands = Vec::new();
            let mut in_data = false;
            while let Some(line) = lines.next_line().await.unwrap() {
                if in_data {
                    if line == "." {
                        in_data = false;
                        write.write_all(b"250 2.0.0 queued as 42\r\n").await.unwrap();
                    }
                    continue;
                }
                commands.push(line.clone());
                let verb = line.split_whitespace().next().unwrap_or("").to_ascii_uppercase();
                let reply: &[u8] = match verb.as_str() {
                    "EHLO" => b"250-mx.test\r\n250 8BITMIME\r\n",
                    "DATA" => {
                        in_data = true;
                        b"354 go ahead\r\n"
                    }
                    "QUIT" => {
                        write.write_all(b"221 bye\r\n").await.unwrap();
                        break;
                    }
                    _ => b"250 OK\r\n",
                };
                write.write_all(reply).await.unwrap();
            }
            (peer.ip(), commands)
        });
        (port, handle)
    }

    fn egress(ipv4: &str, ipv6: Option<&str>) -> IpAddress {
        IpAddress {
            id: Uuid::new_v4(),
            ip_pool_id: Uuid::new_v4(),
            ipv4: ipv4.to_string(),
            ipv6: ipv6.map(str::to_string),
            hostname: "out1.courier.test".to_string(),
            priority: 100,
        }
    }

    fn server() -> Server {
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

    fn message(bounce: bool) -> Message {
        Message {
            id: Uuid::new_v4(),
            server_id: Uuid::new_v4(),
            scope: "outgoing".to_string(),
            mail_from: "app@example.com".to_string(),
            rcpt_to: "user@example.org".to_string(),
            raw_path: None,
            status: "Pending".to_string(),
            inspected: false,
            spam: false,
            spam_score: 0.0,
            threat: false,
            threat_details: None,
            route_id: None,
            endpoint_type: None,
            endpoint_id: None,
            credential_id: None,
            domain_id: None,
            bounce,
            bounce_for_id: None,
            token: "msgtoken".to_string(),
            tag: None,
            parsed: false,
            held: false,
            hold_expiry: None,
            last_delivery_attempt: None,
            subject: None,
            message_id_header: None,
            size: 0,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_retry_hint() {
        assert_eq!(retry_hint("451 try again in 30 seconds"), Retry::After(40));
        assert_eq!(retry_hint("421 greylisted for 5 minutes"), Retry::After(310));
        assert_eq!(retry_hint("421 busy"), Retry::Yes);
    }

    #[test]
    fn test_mail_from() {
        let server = server();
        let normal = message(false);
        let bounce = message(true);
        let outbound = Outbound {
            message: &normal,
            server: &server,
            raw: b"",
            return_path_domain: "rp.example.net",
        };
        assert_eq!(mail_from_for(&outbound), "srvtoken@rp.example.net");

        let outbound = Outbound {
            message: &bounce,
            ..outbound
        };
        assert_eq!(mail_from_for(&outbound), "");
    }

    #[test]
    fn test_parse_relay() {
        assert_eq!(
            SmtpServerSpec::parse_relay("relay.example.net:2525"),
            Some(SmtpServerSpec {
                hostname: "relay.example.net".to_string(),
                port: Some(2525),
                ssl_mode: SslMode::Auto,
            })
        );
        assert_eq!(
            SmtpServerSpec::parse_relay("relay.example.net"),
            Some(SmtpServerSpec::new("relay.example.net"))
        );
        assert_eq!(SmtpServerSpec::parse_relay("  "), None);
        assert_eq!(SmtpServerSpec::parse_relay("relay:notaport"), None);
    }

    #[test]
    fn test_ssl_mode_parse() {
        assert_eq!(SslMode::parse("STARTTLS"), SslMode::StartTls);
        assert_eq!(SslMode::parse("TLS"), SslMode::Tls);
        assert_eq!(SslMode::parse("None"), SslMode::None);
        assert_eq!(SslMode::parse("Auto"), SslMode::Auto);
        assert_eq!(SslMode::parse("weird"), SslMode::Auto);
    }

    #[test]
    fn test_to_sentence() {
        let hosts = |v: &[&str]| v.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        assert_eq!(to_sentence(&hosts(&["a"])), "a");
        assert_eq!(to_sentence(&hosts(&["a", "b"])), "a and b");
        assert_eq!(to_sentence(&hosts(&["a", "b", "c"])), "a, b, and c");
    }

    #[test]
    fn test_envelope_for_bounce_has_no_sender() {
        let envelope = build_envelope("", "user@example.org").unwrap();
        assert!(envelope.from().is_none());
        assert!(build_envelope("", "not an address").is_err());
    }

    #[tokio::test]
    async fn test_unreachable_servers_give_connect_error() {
        let config = SmtpClientConfig {
            timeout_secs: 2,
            ..SmtpClientConfig::default()
        };
        let mut sender = SmtpSender::new("example.org", config).with_servers(Some(vec![
            SmtpServerSpec {
                hostname: "127.0.0.1".to_string(),
                port: Some(1),
                ssl_mode: SslMode::None,
            },
        ]));
        sender.start().await;

        let server = server();
        let msg = message(false);
        let outbound = Outbound {
            message: &msg,
            server: &server,
            raw: b"Subject: hi\r\n\r\nbody",
            return_path_domain: "rp.example.net",
        };
        let result = sender.send_message(&outbound).await;

        assert_eq!(result.status, SendStatus::SoftFail);
        assert_eq!(result.retry, Retry::Yes);
        assert!(result.connect_error);
        assert_eq!(
            result.details.as_deref(),
            Some("No SMTP servers were available for example.org. Tried 127.0.0.1.")
        );
        assert!(!result.output.unwrap_or_default().is_empty());
        sender.finish().await.unwrap();
    }

    #[tokio::test]
    async fn test_session_is_bound_to_egress_address() {
        let (port, server_handle) = smtp_server().await;
        let mut sender = SmtpSender::new("example.org", SmtpClientConfig::default())
            .with_source_ip(Some(egress("127.0.0.1", None)))
            .with_servers(Some(vec![SmtpServerSpec {
                hostname: "127.0.0.1".to_string(),
                port: Some(port),
                ssl_mode: SslMode::Auto,
            }]));
        sender.start().await;

        let server = server();
        let msg = message(false);
        let outbound = Outbound {
            message: &msg,
            server: &server,
            raw: b"Subject: hi\r\n\r\nbody\r\n",
            return_path_domain: "rp.example.net",
        };
        let result = sender.send_message(&outbound).await;
        sender.finish().await.unwrap();

        assert_eq!(result.status, SendStatus::Sent);
        assert!(!result.secure);
        assert!(result.output.unwrap().starts_with("250"));
        assert_eq!(
            result.details.as_deref(),
            Some(format!("Message for user@example.org accepted by 127.0.0.1:{}", port).as_str())
        );

        let (peer, commands) = server_handle.await.unwrap();
        assert_eq!(peer, "127.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(commands.first().map(String::as_str), Some("EHLO out1.courier.test"));
        assert!(commands.iter().any(|c| c.starts_with("MAIL FROM:<srvtoken@rp.example.net>")));
        assert!(commands.iter().any(|c| c.starts_with("RCPT TO:<user@example.org>")));
        assert_eq!(commands.last().map(String::as_str), Some("QUIT"));
    }

    #[test]
    fn test_local_addresses_prefer_ipv6() {
        let sender = SmtpSender::new("example.org", SmtpClientConfig::default())
            .with_source_ip(Some(egress("192.0.2.10", Some("2001:db8::10"))));
        assert_eq!(
            sender.local_addresses(),
            vec![
                Some("2001:db8::10".parse::<IpAddr>().unwrap()),
                Some("192.0.2.10".parse::<IpAddr>().unwrap()),
            ]
        );

        let invalid = SmtpSender::new("example.org", SmtpClientConfig::default())
            .with_source_ip(Some(egress("not-an-ip", None)));
        assert_eq!(invalid.local_addresses(), vec![None]);

        let unbound = SmtpSender::new("example.org", SmtpClientConfig::default());
        assert_eq!(unbound.local_addresses(), vec![None]);
    }

    #[test]
    fn test_hello_name_prefers_egress_hostname() {
        let config = SmtpClientConfig {
            helo_hostname: Some("courier.test".to_string()),
            ..SmtpClientConfig::default()
        };
        let bound = SmtpSender::new("example.org", config.clone())
            .with_source_ip(Some(egress("127.0.0.1", None)));
        assert_eq!(bound.hello_name(), ClientId::Domain("out1.courier.test".to_string()));

        let unbound = SmtpSender::new("example.org", config);
        assert_eq!(unbound.hello_name(), ClientId::Domain("courier.test".to_string()));
    }
}
