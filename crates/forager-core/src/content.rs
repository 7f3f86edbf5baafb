//! Fetch results and content-type detection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Broad classification of a response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    Html,
    Json,
    Xml,
    Unknown,
}

impl ContentKind {
    /// Classify from a `Content-Type` header value, falling back to sniffing
    /// the body when the header is missing or unrecognised.
    pub fn detect(header: Option<&str>, body: &[u8]) -> Self {
        if let Some(value) = header {
            let mime = value
                .split(';')
                .next()
                .unwrap_or("")
                .trim()
                .to_ascii_lowercase();
            if mime == "text/html" || mime == "application/xhtml+xml" {
                return ContentKind::Html;
            }
            if mime == "application/json" || mime.ends_with("+json") {
                return ContentKind::Json;
            }
            if mime == "application/xml" || mime == "text/xml" || mime.ends_with("+xml") {
                return ContentKind::Xml;
            }
        }
        Self::sniff(body)
    }

    /// Guess the kind from the first non-whitespace bytes of the body.
    fn sniff(body: &[u8]) -> Self {
        let head = String::from_utf8_lossy(&body[..body.len().min(512)]);
        let head = head.trim_start();
        let lower = head.to_ascii_lowercase();
        if head.starts_with('{') || head.starts_with('[') {
            ContentKind::Json
        } else if lower.starts_with("<?xml") {
            ContentKind::Xml
        } else if head.starts_with('<') {
            // Bare markup without an XML declaration: assume HTML.
            ContentKind::Html
        } else {
            ContentKind::Unknown
        }
    }
}

/// The outcome of one successful fetch: the raw body plus response metadata.
///
/// Created by the fetcher and never mutated afterwards; parse and extract
/// stages only read it. Serializable so disk-backed caches can persist it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchResult {
    /// URL as requested.
    pub url: String,
    /// URL after redirects.
    pub final_url: String,
    pub status_code: u16,
    pub content: Vec<u8>,
    pub content_type: ContentKind,
    pub fetched_at: DateTime<Utc>,
    /// True when served from the response cache without network I/O.
    pub from_cache: bool,
}

impl FetchResult {
    /// The body decoded as UTF-8, lossily.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.content).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_beats_sniffing() {
        let kind = ContentKind::detect(Some("text/html; charset=utf-8"), b"{\"a\": 1}");
        assert_eq!(kind, ContentKind::Html);
    }

    #[test]
    fn json_suffix_mime_types_detected() {
        assert_eq!(
            ContentKind::detect(Some("application/hal+json"), b""),
            ContentKind::Json
        );
        assert_eq!(
            ContentKind::detect(Some("application/json"), b""),
            ContentKind::Json
        );
    }

    #[test]
    fn xml_mime_types_detected() {
        assert_eq!(
            ContentKind::detect(Some("application/rss+xml"), b""),
            ContentKind::Xml
        );
        assert_eq!(
            ContentKind::detect(Some("text/xml; charset=utf-8"), b""),
            ContentKind::Xml
        );
    }

    #[test]
    fn sniffs_json_body() {
        assert_eq!(
            ContentKind::detect(None, b"  {\"items\": []}"),
            ContentKind::Json
        );
        assert_eq!(ContentKind::detect(None, b"[1, 2, 3]"), ContentKind::Json);
    }

    #[test]
    fn sniffs_xml_declaration() {
        assert_eq!(
            ContentKind::detect(None, b"<?xml version=\"1.0\"?><rss></rss>"),
            ContentKind::Xml
        );
    }

    #[test]
    fn sniffs_html_markup() {
        assert_eq!(
            ContentKind::detect(None, b"<!DOCTYPE html><html></html>"),
            ContentKind::Html
        );
        assert_eq!(
            ContentKind::detect(None, b"<div>fragment</div>"),
            ContentKind::Html
        );
    }

    #[test]
    fn unrecognised_header_falls_back_to_sniffing() {
        assert_eq!(
            ContentKind::detect(Some("application/octet-stream"), b"{\"a\": 1}"),
            ContentKind::Json
        );
    }

    #[test]
    fn plain_text_is_unknown() {
        assert_eq!(ContentKind::detect(None, b"hello world"), ContentKind::Unknown);
        assert_eq!(ContentKind::detect(None, b""), ContentKind::Unknown);
    }

    #[test]
    fn text_decodes_body() {
        let result = FetchResult {
            url: "https://example.com".into(),
            final_url: "https://example.com".into(),
            status_code: 200,
            content: b"hello".to_vec(),
            content_type: ContentKind::Html,
            fetched_at: Utc::now(),
            from_cache: false,
        };
        assert_eq!(result.text(), "hello");
    }
}
