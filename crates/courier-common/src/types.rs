//! Common types for Courier

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for mail servers (accounts)
pub type ServerId = Uuid;

/// Unique identifier for messages
pub type MessageId = Uuid;

/// Unique identifier for queued messages
pub type QueuedMessageId = Uuid;

/// Unique identifier for deliveries
pub type DeliveryId = Uuid;

/// Unique identifier for routes
pub type RouteId = Uuid;

/// Unique identifier for endpoints
pub type EndpointId = Uuid;

/// Unique identifier for credentials
pub type CredentialId = Uuid;

/// Unique identifier for domains
pub type DomainId = Uuid;

/// Unique identifier for egress IP addresses
pub type IpAddressId = Uuid;

/// Unique identifier for IP pools
pub type IpPoolId = Uuid;

/// Timestamp wrapper
pub type Timestamp = DateTime<Utc>;

/// Email address
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EmailAddress {
    pub local: String,
    pub domain: String,
}

impl EmailAddress {
    /// Create a new email address
    pub fn new(local: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            local: local.into(),
            domain: domain.into(),
        }
    }

    /// Parse an email address from a string
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim().trim_start_matches('<').trim_end_matches('>');
        let (local, domain) = s.rsplit_once('@')?;
        if local.is_empty() || domain.is_empty() {
            return None;
        }
        Some(Self::new(local, domain))
    }

    /// Domain part of a raw address, if it has one
    pub fn domain_of(s: &str) -> Option<String> {
        Self::parse(s).map(|a| a.domain.to_ascii_lowercase())
    }
}

impl std::fmt::Display for EmailAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.local, self.domain)
    }
}

impl std::str::FromStr for EmailAddress {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| crate::Error::Validation("Invalid email address".to_string()))
    }
}

/// Direction of a message through the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Incoming,
    Outgoing,
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Scope::Incoming => write!(f, "incoming"),
            Scope::Outgoing => write!(f, "outgoing"),
        }
    }
}

impl std::str::FromStr for Scope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "incoming" => Ok(Scope::Incoming),
            "outgoing" => Ok(Scope::Outgoing),
            _ => Err(format!("Invalid scope: {}", s)),
        }
    }
}

/// Status of a delivery attempt, mirrored onto the message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeliveryStatus {
    Pending,
    Sent,
    SoftFail,
    HardFail,
    Bounced,
    Held,
    Processed,
    HoldCancelled,
    Error,
}

impl DeliveryStatus {
    /// All statuses, in declaration order
    pub const ALL: [DeliveryStatus; 9] = [
        DeliveryStatus::Pending,
        DeliveryStatus::Sent,
        DeliveryStatus::SoftFail,
        DeliveryStatus::HardFail,
        DeliveryStatus::Bounced,
        DeliveryStatus::Held,
        DeliveryStatus::Processed,
        DeliveryStatus::HoldCancelled,
        DeliveryStatus::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "Pending",
            DeliveryStatus::Sent => "Sent",
            DeliveryStatus::SoftFail => "SoftFail",
            DeliveryStatus::HardFail => "HardFail",
            DeliveryStatus::Bounced => "Bounced",
            DeliveryStatus::Held => "Held",
            DeliveryStatus::Processed => "Processed",
            DeliveryStatus::HoldCancelled => "HoldCancelled",
            DeliveryStatus::Error => "Error",
        }
    }

    /// Whether a message in this status has left the queue for good
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeliveryStatus::Sent
                | DeliveryStatus::HardFail
                | DeliveryStatus::Bounced
                | DeliveryStatus::Held
                | DeliveryStatus::Processed
                | DeliveryStatus::HoldCancelled
        )
    }
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DeliveryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DeliveryStatus::ALL
            .iter()
            .find(|status| status.as_str() == s)
            .copied()
            .ok_or_else(|| format!("Invalid delivery status: {}", s))
    }
}

/// Operating mode of a mail server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerMode {
    Live,
    Development,
}

impl std::fmt::Display for ServerMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerMode::Live => write!(f, "Live"),
            ServerMode::Development => write!(f, "Development"),
        }
    }
}

impl std::str::FromStr for ServerMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Live" => Ok(ServerMode::Live),
            "Development" => Ok(ServerMode::Development),
            _ => Err(format!("Invalid server mode: {}", s)),
        }
    }
}

/// What a route does with mail it receives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RouteMode {
    Endpoint,
    Accept,
    Hold,
    Bounce,
    Reject,
}

impl std::fmt::Display for RouteMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RouteMode::Endpoint => write!(f, "Endpoint"),
            RouteMode::Accept => write!(f, "Accept"),
            RouteMode::Hold => write!(f, "Hold"),
            RouteMode::Bounce => write!(f, "Bounce"),
            RouteMode::Reject => write!(f, "Reject"),
        }
    }
}

impl std::str::FromStr for RouteMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Endpoint" => Ok(RouteMode::Endpoint),
            "Accept" => Ok(RouteMode::Accept),
            "Hold" => Ok(RouteMode::Hold),
            "Bounce" => Ok(RouteMode::Bounce),
            "Reject" => Ok(RouteMode::Reject),
            _ => Err(format!("Invalid route mode: {}", s)),
        }
    }
}

/// How a route treats messages marked as spam
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpamMode {
    Mark,
    Quarantine,
    Fail,
}

impl std::fmt::Display for SpamMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SpamMode::Mark => write!(f, "Mark"),
            SpamMode::Quarantine => write!(f, "Quarantine"),
            SpamMode::Fail => write!(f, "Fail"),
        }
    }
}

impl std::str::FromStr for SpamMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Mark" => Ok(SpamMode::Mark),
            "Quarantine" => Ok(SpamMode::Quarantine),
            "Fail" => Ok(SpamMode::Fail),
            _ => Err(format!("Invalid spam mode: {}", s)),
        }
    }
}

/// Kind of suppression list entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SuppressionType {
    Recipient,
}

impl std::fmt::Display for SuppressionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SuppressionType::Recipient => write!(f, "recipient"),
        }
    }
}

impl std::str::FromStr for SuppressionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "recipient" => Ok(SuppressionType::Recipient),
            _ => Err(format!("Invalid suppression type: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_email_address_parse() {
        let email = EmailAddress::parse("user@example.com").unwrap();
        assert_eq!(email.local, "user");
        assert_eq!(email.domain, "example.com");
        assert_eq!(email.to_string(), "user@example.com");

        let bracketed = EmailAddress::parse("<user@Example.COM>").unwrap();
        assert_eq!(bracketed.domain, "Example.COM");
        assert_eq!(
            EmailAddress::domain_of("<user@Example.COM>").as_deref(),
            Some("example.com")
        );
    }

    #[test]
    fn test_email_address_invalid() {
        assert!(EmailAddress::parse("invalid").is_none());
        assert!(EmailAddress::parse("@example.com").is_none());
        assert!(EmailAddress::parse("user@").is_none());
    }

    #[test]
    fn test_delivery_status_round_trip_names() {
        for status in DeliveryStatus::ALL {
            assert_eq!(status.as_str().parse::<DeliveryStatus>(), Ok(status));
        }
        assert!("Exploded".parse::<DeliveryStatus>().is_err());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(DeliveryStatus::Sent.is_terminal());
        assert!(DeliveryStatus::Held.is_terminal());
        assert!(!DeliveryStatus::SoftFail.is_terminal());
        assert!(!DeliveryStatus::Error.is_terminal());
        assert!(!DeliveryStatus::Pending.is_terminal());
    }

    #[test]
    fn test_scope_parse() {
        assert_eq!("incoming".parse::<Scope>(), Ok(Scope::Incoming));
        assert_eq!(Scope::Outgoing.to_string(), "outgoing");
        assert!("sideways".parse::<Scope>().is_err());
    }
}
