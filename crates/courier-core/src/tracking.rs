//! Click and open tracking for outgoing HTML mail
//!
//! Links in HTML bodies are pointed at the tracking host and an invisible
//! image is added for open tracking. Bodies sent with a base64 or
//! quoted-printable transfer encoding are left untouched, as rewriting
//! them would mean re-encoding the MIME tree.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use regex::{Captures, Regex};
use std::sync::OnceLock;

fn href_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r#"href=(['"])(?P<url>(?P<protocol>https?)://(?P<domain>[A-Za-z0-9\-.:]+)(?P<path>/[A-Za-z0-9./+?&\-_%=~:;()\[\]#]*)?)['"]"#,
        )
        .expect("valid link pattern")
    })
}

fn notrack_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(https?)\+notrack://").expect("valid notrack pattern"))
}

fn encoded_part_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?im)^content-transfer-encoding:\s*(base64|quoted-printable)")
            .expect("valid encoding pattern")
    })
}

/// Outcome of a tracking pass
#[derive(Debug, Clone, PartialEq)]
pub struct TrackingResult {
    /// Rewritten message, `None` when nothing changed
    pub raw: Option<Vec<u8>>,
    pub tracked_links: usize,
    pub tracked_images: usize,
}

/// Rewrites message bodies for click and open tracking
#[derive(Debug, Clone)]
pub struct LinkTracker {
    base_url: String,
}

impl LinkTracker {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Rewrite a raw message. `server_token` and `message_token` identify
    /// the message in tracking URLs; links to `excluded_domains` are kept.
    pub fn rewrite(
        &self,
        raw: &[u8],
        server_token: &str,
        message_token: &str,
        excluded_domains: &[String],
    ) -> TrackingResult {
        let untouched = TrackingResult {
            raw: None,
            tracked_links: 0,
            tracked_images: 0,
        };

        let Ok(text) = std::str::from_utf8(raw) else {
            return untouched;
        };
        if encoded_part_pattern().is_match(text) {
            return untouched;
        }
        let Some(split) = text.find("\r\n\r\n").map(|i| i + 4).or_else(|| text.find("\n\n").map(|i| i + 2)) else {
            return untouched;
        };
        let (head, body) = text.split_at(split);

        let mut tracked_links = 0;
        let rewritten = href_pattern().replace_all(body, |caps: &Captures| {
            let domain = &caps["domain"];
            if excluded_domains.iter().any(|d| d.eq_ignore_ascii_case(domain)) {
                return caps[0].to_string();
            }
            tracked_links += 1;
            let url = caps["url"].replace("&amp;", "&");
            format!(
                "href='{}/{}/{}'",
                self.base_url,
                server_token,
                URL_SAFE_NO_PAD.encode(url.as_bytes())
            )
        });
        let unwrapped = notrack_pattern().replace_all(&rewritten, "$1://");
        let mut body = unwrapped.into_owned();

        let mut tracked_images = 0;
        if let Some(pos) = body.rfind("</body>") {
            body.insert_str(pos, &self.tracking_image(server_token, message_token));
            tracked_images += 1;
        }

        if tracked_links == 0 && tracked_images == 0 && body == text[split..] {
            return untouched;
        }

        let mut out = String::with_capacity(head.len() + body.len());
        out.push_str(head);
        out.push_str(&body);
        TrackingResult {
            raw: Some(out.into_bytes()),
            tracked_links,
            tracked_images,
        }
    }

    fn tracking_image(&self, server_token: &str, message_token: &str) -> String {
        format!(
            "<p class='ampimg' style='display:none;visibility:none;margin:0;padding:0;line-height:0;'><img src='{}/img/{}/{}' alt=''></p>",
            self.base_url, server_token, message_token
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const HTML: &str = "Content-Type: text/html\r\n\r\n<html><body><a href=\"https://example.com/a?b=1&amp;c=2\">x</a> <a href='https://skip.example/'>y</a></body></html>";

    #[test]
    fn test_rewrites_links_and_adds_image() {
        let tracker = LinkTracker::new("https://track.example.net/");
        let result = tracker.rewrite(HTML.as_bytes(), "srv", "tok", &["skip.example".to_string()]);

        assert_eq!(result.tracked_links, 1);
        assert_eq!(result.tracked_images, 1);
        let raw = String::from_utf8(result.raw.unwrap()).unwrap();
        let encoded = URL_SAFE_NO_PAD.encode("https://example.com/a?b=1&c=2");
        assert!(raw.contains(&format!("href='https://track.example.net/srv/{}'", encoded)));
        assert!(raw.contains("href='https://skip.example/'"));
        assert!(raw.contains("img src='https://track.example.net/img/srv/tok'"));
        assert!(raw.starts_with("Content-Type: text/html\r\n\r\n"));
    }

    #[test]
    fn test_encoded_bodies_are_untouched() {
        let raw = b"Content-Type: text/html\r\nContent-Transfer-Encoding: base64\r\n\r\nPGh0bWw+";
        let result = LinkTracker::new("https://t.example").rewrite(raw, "srv", "tok", &[]);
        assert_eq!(result.raw, None);
    }

    #[test]
    fn test_plain_text_without_links_is_untouched() {
        let raw = b"Content-Type: text/plain\r\n\r\nHello there";
        let result = LinkTracker::new("https://t.example").rewrite(raw, "srv", "tok", &[]);
        assert_eq!(result.raw, None);
        assert_eq!(result.tracked_links, 0);
    }
}
