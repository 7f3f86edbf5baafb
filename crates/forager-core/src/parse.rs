//! Turn a fetched body into something rules can run against.
//!
//! HTML stays raw (the extraction engine parses it per evaluation because
//! the parsed DOM is not `Send`); JSON and XML become `serde_json::Value`
//! so JSONPath rules work uniformly over both.

use serde_json::{Map, Value};

use crate::content::{ContentKind, FetchResult};
use crate::error::ScrapeError;

/// A fetched body, decoded according to its detected kind.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedContent {
    Html(String),
    Json(Value),
    Xml(Value),
    Text(String),
}

impl ParsedContent {
    pub fn from_fetch(fetch: &FetchResult) -> Result<Self, ScrapeError> {
        let text = fetch.text();
        match fetch.content_type {
            ContentKind::Html => Ok(ParsedContent::Html(text)),
            ContentKind::Json => {
                let value = serde_json::from_str(&text)
                    .map_err(|e| ScrapeError::Parse(format!("invalid JSON: {e}")))?;
                Ok(ParsedContent::Json(value))
            }
            ContentKind::Xml => Ok(ParsedContent::Xml(xml_to_value(&text)?)),
            ContentKind::Unknown => Ok(ParsedContent::Text(text)),
        }
    }

    /// The document as plain text, for NLP rules.
    pub fn plain_text(&self) -> String {
        match self {
            ParsedContent::Html(raw) => html_plain_text(raw),
            ParsedContent::Json(value) | ParsedContent::Xml(value) => value.to_string(),
            ParsedContent::Text(text) => text.clone(),
        }
    }
}

/// Visible text of an HTML document with whitespace collapsed.
pub(crate) fn html_plain_text(raw: &str) -> String {
    let doc = scraper::Html::parse_document(raw);
    let words: Vec<&str> = doc
        .root_element()
        .text()
        .flat_map(|chunk| chunk.split_whitespace())
        .collect();
    words.join(" ")
}

/// One XML element while its subtree is still being read.
#[derive(Default)]
struct PendingElement {
    attrs: Map<String, Value>,
    children: Vec<(String, Value)>,
    text: String,
}

impl PendingElement {
    /// Collapse into a JSON value: attributes become `@name` keys, repeated
    /// child elements fold into arrays, text-only elements become strings.
    fn finish(self) -> Value {
        let trimmed = self.text.trim();
        if self.attrs.is_empty() && self.children.is_empty() {
            return if trimmed.is_empty() {
                Value::Null
            } else {
                Value::String(trimmed.to_string())
            };
        }

        let mut map = self.attrs;
        for (name, value) in self.children {
            match map.get_mut(&name) {
                None => {
                    map.insert(name, value);
                }
                Some(Value::Array(items)) => items.push(value),
                Some(existing) => {
                    let first = existing.take();
                    *existing = Value::Array(vec![first, value]);
                }
            }
        }
        if !trimmed.is_empty() {
            map.insert("#text".to_string(), Value::String(trimmed.to_string()));
        }
        Value::Object(map)
    }
}

/// Parse an XML document into a JSON value.
pub(crate) fn xml_to_value(raw: &str) -> Result<Value, ScrapeError> {
    use quick_xml::events::Event;

    let mut reader = quick_xml::Reader::from_str(raw);
    // (element name, element being built); index 0 is a synthetic root
    // holder so the document element attaches like any other child.
    let mut stack: Vec<(String, PendingElement)> = vec![(String::new(), PendingElement::default())];

    loop {
        match reader.read_event() {
            Ok(Event::Start(start)) => {
                let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
                let mut element = PendingElement::default();
                for attr in start.attributes() {
                    let attr =
                        attr.map_err(|e| ScrapeError::Parse(format!("invalid XML: {e}")))?;
                    let key = format!("@{}", String::from_utf8_lossy(attr.key.as_ref()));
                    let value = attr
                        .unescape_value()
                        .map_err(|e| ScrapeError::Parse(format!("invalid XML: {e}")))?;
                    element.attrs.insert(key, Value::String(value.into_owned()));
                }
                stack.push((name, element));
            }
            Ok(Event::Empty(start)) => {
                let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
                let mut element = PendingElement::default();
                for attr in start.attributes() {
                    let attr =
                        attr.map_err(|e| ScrapeError::Parse(format!("invalid XML: {e}")))?;
                    let key = format!("@{}", String::from_utf8_lossy(attr.key.as_ref()));
                    let value = attr
                        .unescape_value()
                        .map_err(|e| ScrapeError::Parse(format!("invalid XML: {e}")))?;
                    element.attrs.insert(key, Value::String(value.into_owned()));
                }
                let value = element.finish();
                if let Some((_, parent)) = stack.last_mut() {
                    parent.children.push((name, value));
                }
            }
            Ok(Event::End(_)) => {
                let Some((name, element)) = stack.pop() else {
                    return Err(ScrapeError::Parse("invalid XML: unbalanced end tag".into()));
                };
                if stack.is_empty() {
                    return Err(ScrapeError::Parse("invalid XML: unbalanced end tag".into()));
                }
                let value = element.finish();
                if let Some((_, parent)) = stack.last_mut() {
                    parent.children.push((name, value));
                }
            }
            Ok(Event::Text(text)) => {
                let unescaped = text
                    .unescape()
                    .map_err(|e| ScrapeError::Parse(format!("invalid XML: {e}")))?;
                if let Some((_, element)) = stack.last_mut() {
                    element.text.push_str(&unescaped);
                }
            }
            Ok(Event::CData(cdata)) => {
                if let Some((_, element)) = stack.last_mut() {
                    element
                        .text
                        .push_str(&String::from_utf8_lossy(&cdata.into_inner()));
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(ScrapeError::Parse(format!("invalid XML: {e}"))),
        }
    }

    if stack.len() != 1 {
        return Err(ScrapeError::Parse("invalid XML: unclosed element".into()));
    }
    let (_, root) = stack.remove(0);
    let mut map = Map::new();
    for (name, value) in root.children {
        map.insert(name, value);
    }
    Ok(Value::Object(map))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn fetch_with(kind: ContentKind, body: &str) -> FetchResult {
        FetchResult {
            url: "https://example.com".to_string(),
            final_url: "https://example.com".to_string(),
            status_code: 200,
            content: body.as_bytes().to_vec(),
            content_type: kind,
            fetched_at: Utc::now(),
            from_cache: false,
        }
    }

    #[test]
    fn html_stays_raw() {
        let parsed = ParsedContent::from_fetch(&fetch_with(
            ContentKind::Html,
            "<html><body><h1>Hi</h1></body></html>",
        ))
        .unwrap();
        match parsed {
            ParsedContent::Html(raw) => assert!(raw.contains("<h1>Hi</h1>")),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn json_bodies_decode() {
        let parsed =
            ParsedContent::from_fetch(&fetch_with(ContentKind::Json, r#"{"a": [1, 2]}"#)).unwrap();
        assert_eq!(parsed, ParsedContent::Json(json!({"a": [1, 2]})));
    }

    #[test]
    fn invalid_json_is_a_parse_error() {
        let err = ParsedContent::from_fetch(&fetch_with(ContentKind::Json, "{not json"))
            .unwrap_err();
        assert!(matches!(err, ScrapeError::Parse(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn xml_maps_attributes_and_text() {
        let value = xml_to_value(
            r#"<product id="42"><name>Widget</name><stock/></product>"#,
        )
        .unwrap();
        assert_eq!(
            value,
            json!({
                "product": {
                    "@id": "42",
                    "name": "Widget",
                    "stock": null
                }
            })
        );
    }

    #[test]
    fn repeated_xml_elements_become_arrays() {
        let value = xml_to_value(
            "<list><item>a</item><item>b</item><item>c</item></list>",
        )
        .unwrap();
        assert_eq!(value, json!({"list": {"item": ["a", "b", "c"]}}));
    }

    #[test]
    fn mixed_text_lands_under_a_text_key() {
        let value =
            xml_to_value(r#"<p lang="en">hello</p>"#).unwrap();
        assert_eq!(value, json!({"p": {"@lang": "en", "#text": "hello"}}));
    }

    #[test]
    fn cdata_is_preserved_as_text() {
        let value = xml_to_value("<doc><![CDATA[<raw> & stuff]]></doc>").unwrap();
        assert_eq!(value, json!({"doc": "<raw> & stuff"}));
    }

    #[test]
    fn malformed_xml_is_a_parse_error() {
        let err = xml_to_value("<a><b></a>").unwrap_err();
        assert!(matches!(err, ScrapeError::Parse(_)));
        let err = xml_to_value("<a>").unwrap_err();
        assert!(matches!(err, ScrapeError::Parse(_)));
    }

    #[test]
    fn plain_text_strips_html_markup() {
        let parsed = ParsedContent::Html(
            "<html><body><h1>Title</h1>\n  <p>Some   body text.</p></body></html>".to_string(),
        );
        assert_eq!(parsed.plain_text(), "Title Some body text.");
    }
}
