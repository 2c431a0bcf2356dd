//! Content inspection
//!
//! Inspectors scan a raw message and report the spam rules that fired.
//! [`MessageInspector`] runs every configured inspector and folds their
//! findings into one [`InspectionUpdate`]. A failing inspector never
//! fails the scan, it leaves an `ERROR` check behind instead.

pub mod rspamd;

pub use rspamd::RspamdInspector;

use async_trait::async_trait;
use courier_common::types::Scope;
use courier_common::{Error, Result};
use courier_storage::models::{InspectionUpdate, Message, SpamCheck};
use std::sync::Arc;
use tracing::{debug, warn};

/// Findings of a single inspector
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Findings {
    pub checks: Vec<SpamCheck>,
    pub threat: bool,
    pub threat_details: Option<String>,
}

/// Content scanner
#[async_trait]
pub trait Inspector: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    async fn inspect(&self, message: &Message, raw: &[u8], scope: Scope) -> Result<Findings>;
}

/// Runs all configured inspectors
#[derive(Clone, Default)]
pub struct MessageInspector {
    inspectors: Vec<Arc<dyn Inspector>>,
}

impl MessageInspector {
    pub fn new(inspectors: Vec<Arc<dyn Inspector>>) -> Self {
        Self { inspectors }
    }

    /// Inspector set without any scanners; every message scores zero
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.inspectors.is_empty()
    }

    /// Scan a message with every inspector
    pub async fn scan(&self, message: &Message, raw: &[u8], scope: Scope) -> InspectionUpdate {
        let mut update = InspectionUpdate::default();
        let mut threats = Vec::new();

        for inspector in &self.inspectors {
            match inspector.inspect(message, raw, scope).await {
                Ok(findings) => {
                    update.checks.extend(findings.checks);
                    if findings.threat {
                        update.threat = true;
                        if let Some(details) = findings.threat_details {
                            threats.push(details);
                        }
                    }
                }
                Err(e) => {
                    warn!("{} inspection of message {} failed: {}", inspector.name(), message.id, e);
                    let description = match e {
                        Error::Inspection(msg) => msg,
                        other => other.to_string(),
                    };
                    update.checks.push(SpamCheck {
                        code: "ERROR".to_string(),
                        score: 0.0,
                        description: Some(description),
                    });
                }
            }
        }

        update.spam_score = update.checks.iter().map(|c| c.score).sum();
        if !threats.is_empty() {
            update.threat_details = Some(threats.join(", "));
        }

        debug!(
            "Inspected message {}: score {:.2}, {} checks",
            message.id,
            update.spam_score,
            update.checks.len()
        );
        update
    }
}
