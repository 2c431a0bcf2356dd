//! HTTP sender
//!
//! Posts incoming messages to a webhook endpoint, either as a JSON body or
//! as form fields, in one of two payload formats:
//!
//! - `Hash`: parsed message fields (addresses, bodies, attachments)
//! - `RawMessage`: the base64 encoded raw message
//!
//! Requests are signed with HMAC-SHA256 when a signing secret is set.

use super::{elapsed_secs, generate_log_id, Outbound, Retry, SendResult, SendStatus, Sender};
use crate::headers::last_header;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use courier_common::config::HttpSenderConfig;
use courier_common::Result;
use courier_storage::models::HttpEndpoint;
use hmac::{Hmac, Mac};
use mail_parser::{MessageParser, MimeHeaders, PartType};
use regex::{Captures, Regex};
use serde_json::{json, Map, Value};
use sha2::Sha256;
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the request signature
pub const SIGNATURE_HEADER: &str = "X-Courier-Signature";

/// Maximum number of response body characters kept as delivery output
const OUTPUT_LIMIT: usize = 500;

/// HTTP sender bound to one endpoint
pub struct HttpSender {
    endpoint: HttpEndpoint,
    client: reqwest::Client,
    config: HttpSenderConfig,
    log_id: String,
}

impl HttpSender {
    pub fn new(endpoint: HttpEndpoint, client: reqwest::Client, config: HttpSenderConfig) -> Self {
        Self {
            endpoint,
            client,
            config,
            log_id: generate_log_id(),
        }
    }

    fn timeout(&self) -> Duration {
        let secs = self
            .endpoint
            .timeout
            .and_then(|t| u64::try_from(t).ok())
            .filter(|t| *t > 0)
            .unwrap_or(self.config.default_timeout_secs);
        Duration::from_secs(secs)
    }

    fn is_form(&self) -> bool {
        self.endpoint.encoding.eq_ignore_ascii_case("FormData")
    }

    fn build_request(&self, outbound: &Outbound<'_>) -> std::result::Result<reqwest::Request, reqwest::Error> {
        let payload = parameters(&self.endpoint, outbound, self.is_form());
        let builder = self
            .client
            .post(&self.endpoint.url)
            .timeout(self.timeout())
            .header(reqwest::header::USER_AGENT, "Courier");

        let builder = match payload {
            Payload::Json(value) => builder.json(&value),
            Payload::Form(fields) => builder.form(&fields),
        };

        let mut request = builder.build()?;

        if let Some(secret) = &self.config.signing_secret {
            let body = request
                .body()
                .and_then(|b| b.as_bytes())
                .unwrap_or_default();
            if let Some(signature) = sign(secret, body) {
                if let Ok(value) = reqwest::header::HeaderValue::from_str(&signature) {
                    request.headers_mut().insert(SIGNATURE_HEADER, value);
                }
            }
        }

        Ok(request)
    }
}

#[async_trait]
impl Sender for HttpSender {
    async fn start(&mut self) {}

    async fn send_message(&mut self, outbound: &Outbound<'_>) -> SendResult {
        let started = Instant::now();
        let url = self.endpoint.url.clone();
        let mut result = SendResult::new(SendStatus::HardFail);
        result.log_id = Some(self.log_id.clone());
        result.secure = url.to_ascii_lowercase().starts_with("https://");

        info!(log_id = %self.log_id, "Sending request to {}", url);

        let response = match self.build_request(outbound) {
            Ok(request) => self.client.execute(request).await,
            Err(e) => Err(e),
        };

        let (code, body) = match response {
            Ok(response) => {
                let code = i32::from(response.status().as_u16());
                let body = response.text().await.unwrap_or_default();
                (code, body)
            }
            Err(e) => {
                warn!(log_id = %self.log_id, "Request to {} failed: {}", url, e);
                (-1, e.to_string())
            }
        };

        info!(log_id = %self.log_id, "  -> Received: {}", code);
        debug!(log_id = %self.log_id, "  -> Body: {}", truncate(&body, 255));

        result.details = Some(format!("Received a {} from {}", code, url));
        result.output = Some(truncate(&body, OUTPUT_LIMIT).trim().to_string());
        apply_status(&mut result, code);
        result.time = Some(elapsed_secs(started));
        result
    }

    async fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Map an HTTP status (or -1 for transport errors) onto the result
fn apply_status(result: &mut SendResult, code: i32) {
    match code {
        200..=299 => result.status = SendStatus::Sent,
        500..=599 => {
            result.status = SendStatus::SoftFail;
            result.retry = Retry::Yes;
        }
        c if c < 0 => {
            result.status = SendStatus::SoftFail;
            result.retry = Retry::Yes;
            result.connect_error = true;
        }
        429 => {
            result.status = SendStatus::HardFail;
            result.suppress_bounce = true;
        }
        _ => result.status = SendStatus::HardFail,
    }
}

fn truncate(text: &str, limit: usize) -> String {
    text.chars().take(limit).collect()
}

/// `sha256=<hex hmac>` over the request body
pub fn sign(secret: &str, body: &[u8]) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(body);
    Some(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

/// Request body in its chosen encoding
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Json(Value),
    Form(Vec<(String, String)>),
}

/// Build the request payload for an endpoint
pub fn parameters(endpoint: &HttpEndpoint, outbound: &Outbound<'_>, flat: bool) -> Payload {
    let mut fields = if endpoint.format.eq_ignore_ascii_case("RawMessage") {
        raw_message_fields(outbound)
    } else {
        hash_fields(endpoint, outbound)
    };

    let attachments = if endpoint.include_attachments && !endpoint.format.eq_ignore_ascii_case("RawMessage") {
        attachments(outbound.raw)
    } else {
        Vec::new()
    };

    if !flat {
        if endpoint.include_attachments && !endpoint.format.eq_ignore_ascii_case("RawMessage") {
            let list: Vec<Value> = attachments
                .iter()
                .map(|a| {
                    json!({
                        "filename": a.filename,
                        "content_type": a.content_type,
                        "size": a.size,
                        "data": a.data,
                    })
                })
                .collect();
            fields.insert("attachments".to_string(), Value::Array(list));
        }
        return Payload::Json(Value::Object(fields));
    }

    let mut form: Vec<(String, String)> = fields
        .into_iter()
        .map(|(key, value)| (key, form_value(value)))
        .collect();
    for (i, a) in attachments.into_iter().enumerate() {
        form.push((format!("attachments[{}][filename]", i), a.filename.unwrap_or_default()));
        form.push((format!("attachments[{}][content_type]", i), a.content_type));
        form.push((format!("attachments[{}][size]", i), a.size.to_string()));
        form.push((format!("attachments[{}][data]", i), a.data));
    }
    Payload::Form(form)
}

fn form_value(value: Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s,
        other => other.to_string(),
    }
}

fn raw_message_fields(outbound: &Outbound<'_>) -> Map<String, Value> {
    let message = outbound.message;
    let mut fields = Map::new();
    fields.insert("id".into(), json!(message.id));
    fields.insert("rcpt_to".into(), json!(message.rcpt_to));
    fields.insert("mail_from".into(), json!(message.mail_from));
    fields.insert("message".into(), json!(STANDARD.encode(outbound.raw)));
    fields.insert("base64".into(), json!(true));
    fields.insert("size".into(), json!(message.size));
    fields
}

fn spam_status(outbound: &Outbound<'_>) -> &'static str {
    if !outbound.message.inspected {
        "NotChecked"
    } else if outbound.message.spam {
        "Spam"
    } else {
        "NotSpam"
    }
}

fn hash_fields(endpoint: &HttpEndpoint, outbound: &Outbound<'_>) -> Map<String, Value> {
    let message = outbound.message;
    let raw = outbound.raw;
    let parsed = MessageParser::default().parse(raw);

    let html_body = parsed.as_ref().and_then(|p| {
        p.html_part(0).and_then(|part| match &part.body {
            PartType::Html(html) => Some(html.to_string()),
            _ => None,
        })
    });
    let plain_body = parsed.as_ref().and_then(|p| {
        p.text_part(0).and_then(|part| match &part.body {
            PartType::Text(text) => Some(text.to_string()),
            _ => None,
        })
    });
    let subject = message
        .subject
        .clone()
        .or_else(|| parsed.as_ref().and_then(|p| p.subject().map(str::to_string)));
    let attachment_quantity = parsed.as_ref().map_or(0, |p| p.attachment_count());
    let timestamp = message.timestamp.timestamp_millis() as f64 / 1000.0;

    let mut fields = Map::new();
    fields.insert("id".into(), json!(message.id));
    fields.insert("rcpt_to".into(), json!(message.rcpt_to));
    fields.insert("mail_from".into(), json!(message.mail_from));
    fields.insert("token".into(), json!(message.token));
    fields.insert("subject".into(), json!(subject));
    fields.insert("message_id".into(), json!(message.message_id_header));
    fields.insert("timestamp".into(), json!(timestamp));
    fields.insert("size".into(), json!(message.size));
    fields.insert("spam_status".into(), json!(spam_status(outbound)));
    fields.insert("bounce".into(), json!(message.bounce));
    fields.insert("received_with_ssl".into(), Value::Null);
    fields.insert("to".into(), json!(last_header(raw, "to")));
    fields.insert("cc".into(), json!(last_header(raw, "cc")));
    fields.insert("from".into(), json!(last_header(raw, "from")));
    fields.insert("date".into(), json!(last_header(raw, "date")));
    fields.insert("in_reply_to".into(), json!(last_header(raw, "in-reply-to")));
    fields.insert("references".into(), json!(last_header(raw, "references")));
    fields.insert("html_body".into(), json!(html_body));
    fields.insert("attachment_quantity".into(), json!(attachment_quantity));
    fields.insert("auto_submitted".into(), json!(last_header(raw, "auto-submitted")));
    fields.insert("reply_to".into(), json!(last_header(raw, "reply-to")));

    if endpoint.strip_replies {
        let (plain, replies) = match plain_body {
            Some(text) => {
                let (plain, replies) = separate_replies(&text);
                (Some(plain), replies)
            }
            None => (None, None),
        };
        fields.insert("plain_body".into(), json!(plain));
        fields.insert("replies_from_plain_body".into(), json!(replies));
    } else {
        fields.insert("plain_body".into(), json!(plain_body));
    }

    fields
}

/// Attachment as sent to an endpoint
#[derive(Debug, Clone, PartialEq)]
pub struct AttachmentPayload {
    pub filename: Option<String>,
    pub content_type: String,
    pub size: usize,
    /// Base64 encoded contents
    pub data: String,
}

fn attachments(raw: &[u8]) -> Vec<AttachmentPayload> {
    let Some(parsed) = MessageParser::default().parse(raw) else {
        return Vec::new();
    };

    parsed
        .attachments()
        .map(|part| {
            let content_type = part
                .content_type()
                .map(|ct| match ct.subtype() {
                    Some(sub) => format!("{}/{}", ct.ctype(), sub),
                    None => ct.ctype().to_string(),
                })
                .unwrap_or_else(|| "application/octet-stream".to_string());
            let contents = part.contents();
            AttachmentPayload {
                filename: part.attachment_name().map(str::to_string),
                content_type,
                size: contents.len(),
                data: STANDARD.encode(contents),
            }
        })
        .collect()
}

fn reply_rules() -> &'static [Regex] {
    static RULES: OnceLock<Vec<Regex>> = OnceLock::new();
    RULES.get_or_init(|| {
        [
            r"(?ms)^-{2,10} $.*",
            r"(?ms)^>*\s*----- ?Original Message ?-----.*",
            r"(?ms)^>*\s*From:[^\r\n]*[\r\n]+Sent:.*",
            r"(?ms)^>*\s*From:[^\r\n]*[\r\n]+Date:.*",
            r"(?ms)^>*\s*-----Urspr.ngliche Nachricht----- .*",
            r"(?m)^>*\s*Le[^\r\n]{10,200}a .crit ?:\s*$.*",
            r"(?ms)^>*\s*__________________.*",
            r"(?ms)^>*\s*On.{10,200}wrote:\s*$.*",
            r"(?ms)^>*\s*Sent from my.*",
            r"(?ms)^>*\s*=== Please reply above this line ===.*",
            r"(?m)(^>.*\n?){10,}",
        ]
        .iter()
        .filter_map(|pattern| Regex::new(pattern).ok())
        .collect()
    })
}

/// Split a plain text body into the new text and the quoted replies
pub fn separate_replies(text: &str) -> (String, Option<String>) {
    let mut text = text.replace('\r', "");
    let mut stripped = String::new();

    for rule in reply_rules() {
        text = rule
            .replace_all(&text, |caps: &Captures| {
                stripped = format!("{}\n{}", &caps[0], stripped);
                String::new()
            })
            .into_owned();
    }

    let stripped = stripped.trim().to_string();
    let replies = if stripped.is_empty() {
        None
    } else {
        Some(stripped)
    };
    (text.trim().to_string(), replies)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use courier_storage::models::{Message, Server};
    use pretty_assertions::assert_eq;
    use uuid::Uuid;
    use wiremock::matchers::{header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const RAW: &[u8] = b"From: Sender <sender@example.com>\r\nTo: rcpt@example.org\r\nSubject: Hello\r\nMessage-ID: <abc@example.com>\r\nContent-Type: text/plain\r\n\r\nHi there\r\n";

    fn endpoint(url: String, encoding: &str, format: &str) -> HttpEndpoint {
        HttpEndpoint {
            id: Uuid::new_v4(),
            server_id: Uuid::new_v4(),
            name: "Webhook".to_string(),
            url,
            encoding: encoding.to_string(),
            format: format.to_string(),
            strip_replies: false,
            include_attachments: true,
            timeout: None,
            last_used_at: None,
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

    fn message() -> Message {
        Message {
            id: Uuid::new_v4(),
            server_id: Uuid::new_v4(),
            scope: "incoming".to_string(),
            mail_from: "sender@example.com".to_string(),
            rcpt_to: "rcpt@example.org".to_string(),
            raw_path: None,
            status: "Pending".to_string(),
            inspected: true,
            spam: false,
            spam_score: 0.0,
            threat: false,
            threat_details: None,
            route_id: None,
            endpoint_type: None,
            endpoint_id: None,
            credential_id: None,
            domain_id: None,
            bounce: false,
            bounce_for_id: None,
            token: "msgtoken".to_string(),
            tag: None,
            parsed: false,
            held: false,
            hold_expiry: None,
            last_delivery_attempt: None,
            subject: Some("Hello".to_string()),
            message_id_header: Some("abc@example.com".to_string()),
            size: RAW.len() as i64,
            timestamp: Utc::now(),
        }
    }

    async fn send_to(server: &MockServer, status: u16, body: &str) -> SendResult {
        Mock::given(method("POST"))
            .and(path("/hook"))
            .respond_with(ResponseTemplate::new(status).set_body_string(body))
            .mount(server)
            .await;

        let endpoint = endpoint(format!("{}/hook", server.uri()), "BodyAsJSON", "Hash");
        let mut sender = HttpSender::new(endpoint, reqwest::Client::new(), HttpSenderConfig::default());
        let srv = self::server();
        let msg = message();
        let outbound = Outbound {
            message: &msg,
            server: &srv,
            raw: RAW,
            return_path_domain: "rp.example.net",
        };
        sender.start().await;
        sender.send_message(&outbound).await
    }

    #[tokio::test]
    async fn test_success_is_sent() {
        let server = MockServer::start().await;
        let result = send_to(&server, 200, "  ok  ").await;

        assert_eq!(result.status, SendStatus::Sent);
        assert_eq!(result.retry, Retry::No);
        assert_eq!(
            result.details,
            Some(format!("Received a 200 from {}/hook", server.uri()))
        );
        assert_eq!(result.output.as_deref(), Some("ok"));
        assert!(!result.secure);
        assert_eq!(result.log_id.as_ref().map(|id| id.len()), Some(8));
    }

    #[tokio::test]
    async fn test_server_error_soft_fails() {
        let server = MockServer::start().await;
        let result = send_to(&server, 503, "down").await;
        assert_eq!(result.status, SendStatus::SoftFail);
        assert_eq!(result.retry, Retry::Yes);
        assert!(!result.connect_error);
    }

    #[tokio::test]
    async fn test_rate_limit_hard_fails_without_bounce() {
        let server = MockServer::start().await;
        let result = send_to(&server, 429, "slow down").await;
        assert_eq!(result.status, SendStatus::HardFail);
        assert!(result.suppress_bounce);
    }

    #[tokio::test]
    async fn test_client_error_hard_fails() {
        let server = MockServer::start().await;
        let result = send_to(&server, 404, "").await;
        assert_eq!(result.status, SendStatus::HardFail);
        assert!(!result.suppress_bounce);
        assert_eq!(result.retry, Retry::No);
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_connect_error() {
        let endpoint = endpoint("http://127.0.0.1:1/hook".to_string(), "BodyAsJSON", "Hash");
        let mut sender = HttpSender::new(endpoint, reqwest::Client::new(), HttpSenderConfig::default());
        let srv = server();
        let msg = message();
        let outbound = Outbound {
            message: &msg,
            server: &srv,
            raw: RAW,
            return_path_domain: "rp.example.net",
        };
        let result = sender.send_message(&outbound).await;

        assert_eq!(result.status, SendStatus::SoftFail);
        assert!(result.connect_error);
        assert_eq!(
            result.details.as_deref(),
            Some("Received a -1 from http://127.0.0.1:1/hook")
        );
    }

    #[tokio::test]
    async fn test_signed_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(header_exists(SIGNATURE_HEADER))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let endpoint = endpoint(format!("{}/hook", server.uri()), "FormData", "RawMessage");
        let config = HttpSenderConfig {
            signing_secret: Some("secret".to_string()),
            ..HttpSenderConfig::default()
        };
        let mut sender = HttpSender::new(endpoint, reqwest::Client::new(), config);
        let srv = self::server();
        let msg = message();
        let outbound = Outbound {
            message: &msg,
            server: &srv,
            raw: RAW,
            return_path_domain: "rp.example.net",
        };
        let result = sender.send_message(&outbound).await;
        assert_eq!(result.status, SendStatus::Sent);
    }

    #[test]
    fn test_hash_payload() {
        let endpoint = endpoint("http://example.net".to_string(), "BodyAsJSON", "Hash");
        let srv = server();
        let msg = message();
        let outbound = Outbound {
            message: &msg,
            server: &srv,
            raw: RAW,
            return_path_domain: "rp.example.net",
        };

        let Payload::Json(value) = parameters(&endpoint, &outbound, false) else {
            panic!("expected a JSON payload");
        };
        assert_eq!(value["rcpt_to"], json!("rcpt@example.org"));
        assert_eq!(value["subject"], json!("Hello"));
        assert_eq!(value["spam_status"], json!("NotSpam"));
        assert_eq!(value["to"], json!("rcpt@example.org"));
        assert_eq!(value["from"], json!("Sender <sender@example.com>"));
        assert_eq!(value["attachment_quantity"], json!(0));
        assert_eq!(value["attachments"], json!([]));
        assert!(value["plain_body"].as_str().unwrap().contains("Hi there"));
        assert_eq!(value["html_body"], Value::Null);
    }

    #[test]
    fn test_raw_message_form_payload() {
        let endpoint = endpoint("http://example.net".to_string(), "FormData", "RawMessage");
        let srv = server();
        let msg = message();
        let outbound = Outbound {
            message: &msg,
            server: &srv,
            raw: RAW,
            return_path_domain: "rp.example.net",
        };

        let Payload::Form(fields) = parameters(&endpoint, &outbound, true) else {
            panic!("expected form fields");
        };
        let get = |key: &str| {
            fields
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.clone())
        };
        assert_eq!(get("base64").as_deref(), Some("true"));
        assert_eq!(get("message"), Some(STANDARD.encode(RAW)));
        assert_eq!(get("rcpt_to").as_deref(), Some("rcpt@example.org"));
    }

    #[test]
    fn test_separate_replies() {
        let text = "Thanks, that works.\r\n\r\nOn Mon, 1 Jan 2024 at 10:00, Someone <a@b.c> wrote:\r\n> Does it work?\r\n";
        let (plain, replies) = separate_replies(text);
        assert_eq!(plain, "Thanks, that works.");
        assert!(replies.unwrap().starts_with("On Mon, 1 Jan 2024"));

        let (plain, replies) = separate_replies("Just text");
        assert_eq!(plain, "Just text");
        assert_eq!(replies, None);
    }

    #[test]
    fn test_sign() {
        let signature = sign("secret", b"body").unwrap();
        assert!(signature.starts_with("sha256="));
        assert_eq!(signature.len(), "sha256=".len() + 64);
    }
}
