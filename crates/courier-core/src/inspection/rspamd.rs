//! rspamd integration for spam scanning
//!
//! Posts the raw message to rspamd's `/checkv2` endpoint and turns every
//! symbol that carries a description into a spam check.
//! See: https://rspamd.com/doc/architecture/protocol.html

use super::{Findings, Inspector};
use async_trait::async_trait;
use courier_common::config::RspamdConfig;
use courier_common::types::Scope;
use courier_common::{Error, Result};
use courier_storage::models::{Message, SpamCheck};
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, error, info};

/// Raw rspamd API response
#[derive(Debug, Deserialize)]
struct RspamdApiResponse {
    #[serde(default)]
    symbols: Option<HashMap<String, RspamdApiSymbol>>,
}

#[derive(Debug, Deserialize)]
struct RspamdApiSymbol {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    score: f64,
    description: Option<String>,
}

/// rspamd inspector
pub struct RspamdInspector {
    config: RspamdConfig,
    client: Client,
}

impl RspamdInspector {
    pub fn new(config: RspamdConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .expect("Failed to create HTTP client");

        Self { config, client }
    }

    async fn request(&self, message: &Message, raw: &[u8], scope: Scope) -> Result<reqwest::Response> {
        let url = format!("{}/checkv2", self.config.url.trim_end_matches('/'));
        debug!("Checking message {} with rspamd at {}", message.id, url);

        let mut request = self
            .client
            .post(&url)
            .body(raw.to_vec())
            .header(reqwest::header::USER_AGENT, "Courier")
            .header("Deliver-To", &message.rcpt_to)
            .header("From", &message.mail_from)
            .header("Rcpt", &message.rcpt_to)
            .header("Queue-Id", &message.token);

        if let Some(ref password) = self.config.password {
            request = request.header("Password", password);
        }

        // An empty Ip makes rspamd treat the message as outbound
        if scope == Scope::Outgoing {
            request = request.header("User", "").header("Ip", "");
        }

        let response = request.send().await.map_err(|e| {
            error!("Error talking to rspamd: {}", e);
            let kind = if e.is_timeout() {
                "timeout"
            } else if e.is_connect() {
                "connection error"
            } else {
                "request error"
            };
            Error::Inspection(format!("Error when scanning with rspamd ({})", kind))
        })?;

        if response.status() != reqwest::StatusCode::OK {
            info!("Got {} status from rspamd, wanted 200", response.status().as_u16());
            return Err(Error::Inspection(format!(
                "Error when scanning with rspamd (got {})",
                response.status().as_u16()
            )));
        }

        Ok(response)
    }
}

#[async_trait]
impl Inspector for RspamdInspector {
    fn name(&self) -> &'static str {
        "rspamd"
    }

    async fn inspect(&self, message: &Message, raw: &[u8], scope: Scope) -> Result<Findings> {
        let response = self.request(message, raw, scope).await?;
        let api: RspamdApiResponse = response.json().await.map_err(|e| {
            error!("Failed to parse rspamd response: {}", e);
            Error::Inspection("Error when scanning with rspamd (invalid response)".to_string())
        })?;

        let mut checks: Vec<SpamCheck> = api
            .symbols
            .unwrap_or_default()
            .into_iter()
            .filter(|(_, symbol)| {
                symbol
                    .description
                    .as_deref()
                    .map_or(false, |d| !d.trim().is_empty())
            })
            .map(|(key, symbol)| SpamCheck {
                code: symbol.name.unwrap_or(key),
                score: symbol.score,
                description: symbol.description,
            })
            .collect();
        checks.sort_by(|a, b| a.code.cmp(&b.code));

        Ok(Findings {
            checks,
            ..Findings::default()
        })
    }
}
