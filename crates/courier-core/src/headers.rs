//! Raw message header helpers
//!
//! Messages are kept as raw RFC 5322 bytes. The pipeline only ever adds
//! headers to the top of a message, so these helpers work on the raw
//! header block directly rather than re-serializing a parsed message.

use regex::Regex;
use std::sync::OnceLock;

/// Header carrying the message token on outgoing mail
pub const MSG_ID_HEADER: &str = "X-Courier-MsgID";

/// Header a client sets to tag an outgoing message
pub const TAG_HEADER: &str = "X-Courier-Tag";

fn msg_id_line() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?im)^X-Courier-MsgID:").expect("valid header pattern"))
}

fn msg_id_token() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)X-Courier-MsgID:\s*([a-z0-9]+)").expect("valid token pattern")
    })
}

/// Byte offset where the header block ends (the blank line is excluded)
fn header_block_end(raw: &[u8]) -> usize {
    let crlf = raw.windows(4).position(|w| w == b"\r\n\r\n");
    let lf = raw.windows(2).position(|w| w == b"\n\n");
    match (crlf, lf) {
        (Some(a), Some(b)) => a.min(b),
        (Some(a), None) => a,
        (None, Some(b)) => b,
        (None, None) => raw.len(),
    }
}

/// The raw header block as text
pub fn raw_headers(raw: &[u8]) -> String {
    String::from_utf8_lossy(&raw[..header_block_end(raw)]).into_owned()
}

/// Unfolded values of every occurrence of a header, in message order
pub fn header_values(raw: &[u8], name: &str) -> Vec<String> {
    let block = raw_headers(raw);
    let mut values = Vec::new();
    let mut current: Option<(String, String)> = None;

    for line in block.split('\n') {
        let line = line.trim_end_matches('\r');
        if line.starts_with(' ') || line.starts_with('\t') {
            if let Some((_, value)) = current.as_mut() {
                value.push(' ');
                value.push_str(line.trim());
            }
            continue;
        }

        if let Some((field, value)) = current.take() {
            if field.eq_ignore_ascii_case(name) {
                values.push(value);
            }
        }

        if let Some((field, value)) = line.split_once(':') {
            current = Some((field.trim().to_string(), value.trim().to_string()));
        }
    }

    if let Some((field, value)) = current {
        if field.eq_ignore_ascii_case(name) {
            values.push(value);
        }
    }

    values
}

/// Value of the last occurrence of a header
pub fn last_header(raw: &[u8], name: &str) -> Option<String> {
    header_values(raw, name).pop()
}

/// Put new header lines on top of the message
pub fn prepend_headers(raw: &[u8], headers: &[String]) -> Vec<u8> {
    if headers.is_empty() {
        return raw.to_vec();
    }
    let top = headers.join("\r\n");
    let mut out = Vec::with_capacity(top.len() + 2 + raw.len());
    out.extend_from_slice(top.as_bytes());
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(raw);
    out
}

/// Whether the token header has already been added
pub fn has_outgoing_headers(raw: &[u8]) -> bool {
    msg_id_line().is_match(&raw_headers(raw))
}

/// Header lines added to outgoing mail
pub fn outgoing_headers(token: &str) -> Vec<String> {
    vec![format!("{}: {}", MSG_ID_HEADER, token)]
}

/// Message tokens referenced anywhere in a message, typically the copy
/// of the original mail a remote server attaches to a bounce
pub fn original_message_tokens(raw: &[u8]) -> Vec<String> {
    let text = String::from_utf8_lossy(raw);
    let mut tokens: Vec<String> = Vec::new();
    for caps in msg_id_token().captures_iter(&text) {
        let token = caps[1].to_string();
        if !tokens.contains(&token) {
            tokens.push(token);
        }
    }
    tokens
}

/// Headers describing the inspection outcome of an incoming message
pub fn spam_headers(spam: bool, threshold: f64, score: f64, threat: bool) -> Vec<String> {
    vec![
        format!("X-Courier-Spam: {}", yes_no(spam)),
        format!("X-Courier-Spam-Threshold: {}", format_score(threshold)),
        format!("X-Courier-Spam-Score: {}", format_score(score)),
        format!("X-Courier-Threat: {}", yes_no(threat)),
    ]
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}

/// Scores always carry a decimal part ("5.0", "3.25")
pub fn format_score(score: f64) -> String {
    if score.fract() == 0.0 && score.is_finite() {
        format!("{:.1}", score)
    } else {
        score.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const RAW: &[u8] = b"From: a@example.com\r\nTo: b@example.org,\r\n c@example.org\r\nX-Courier-Tag: first\r\nx-courier-tag: second\r\nSubject: Hi\r\n\r\nX-Courier-Tag: body\r\n";

    #[test]
    fn test_header_values_unfold_and_ignore_body() {
        assert_eq!(
            header_values(RAW, "to"),
            vec!["b@example.org, c@example.org".to_string()]
        );
        assert_eq!(
            header_values(RAW, TAG_HEADER),
            vec!["first".to_string(), "second".to_string()]
        );
        assert_eq!(last_header(RAW, "x-courier-tag").as_deref(), Some("second"));
        assert_eq!(last_header(RAW, "cc"), None);
    }

    #[test]
    fn test_prepend_headers() {
        let raw = prepend_headers(b"Subject: Hi\r\n\r\nBody", &outgoing_headers("abc123"));
        assert_eq!(raw, b"X-Courier-MsgID: abc123\r\nSubject: Hi\r\n\r\nBody".to_vec());
        assert!(has_outgoing_headers(&raw));
        assert!(!has_outgoing_headers(b"Subject: Hi\r\n\r\nX-Courier-MsgID: abc\r\n"));
    }

    #[test]
    fn test_original_message_tokens() {
        let bounce = b"Subject: Undelivered\r\n\r\nSorry.\r\n\r\nX-Courier-MsgID: AbC123\r\nx-courier-msgid:def456\r\nX-Courier-MsgID: AbC123\r\n";
        assert_eq!(
            original_message_tokens(bounce),
            vec!["AbC123".to_string(), "def456".to_string()]
        );
        assert!(original_message_tokens(b"Subject: none\r\n\r\n").is_empty());
    }

    #[test]
    fn test_spam_headers() {
        assert_eq!(
            spam_headers(true, 5.0, 7.25, false),
            vec![
                "X-Courier-Spam: yes".to_string(),
                "X-Courier-Spam-Threshold: 5.0".to_string(),
                "X-Courier-Spam-Score: 7.25".to_string(),
                "X-Courier-Threat: no".to_string(),
            ]
        );
    }
}
