//! Dotted-path queries over JSON values.
//!
//! Supported syntax: an optional `$` root, dot-separated keys, `[n]` index
//! and `[*]` wildcard suffixes, and `*` as a key wildcard. A key applied to
//! an array fans out over its elements, so `items.name` reads `name` from
//! every object in `items` without an explicit `[*]`.

use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Key(String),
    Index(usize),
    Wildcard,
}

/// A parsed JSONPath-style query.
#[derive(Debug, Clone)]
pub struct JsonPath {
    segments: Vec<Segment>,
}

impl JsonPath {
    pub fn parse(expr: &str) -> Result<Self, String> {
        let trimmed = expr.trim();
        let body = trimmed
            .strip_prefix("$.")
            .or_else(|| trimmed.strip_prefix('$'))
            .unwrap_or(trimmed);
        if body.is_empty() {
            return Err("empty path".to_string());
        }

        let mut segments = Vec::new();
        for part in body.split('.') {
            if part.is_empty() {
                return Err(format!("empty segment in '{expr}'"));
            }
            let (head, mut rest) = match part.find('[') {
                Some(pos) => (&part[..pos], &part[pos..]),
                None => (part, ""),
            };
            if !head.is_empty() {
                if head == "*" {
                    segments.push(Segment::Wildcard);
                } else {
                    segments.push(Segment::Key(head.to_string()));
                }
            } else if rest.is_empty() {
                return Err(format!("empty segment in '{expr}'"));
            }
            while !rest.is_empty() {
                let Some(close) = rest.find(']') else {
                    return Err(format!("unclosed '[' in '{expr}'"));
                };
                let inside = &rest[1..close];
                if inside == "*" {
                    segments.push(Segment::Wildcard);
                } else {
                    let index: usize = inside
                        .parse()
                        .map_err(|_| format!("bad index '{inside}' in '{expr}'"))?;
                    segments.push(Segment::Index(index));
                }
                rest = &rest[close + 1..];
                if !rest.is_empty() && !rest.starts_with('[') {
                    return Err(format!("unexpected '{rest}' after ']' in '{expr}'"));
                }
            }
        }
        Ok(Self { segments })
    }

    /// All values the path reaches inside `root`, in document order.
    pub fn select<'a>(&self, root: &'a Value) -> Vec<&'a Value> {
        let mut frontier = vec![root];
        for segment in &self.segments {
            let mut next = Vec::new();
            for value in frontier {
                match segment {
                    Segment::Key(key) => match value {
                        Value::Object(map) => {
                            if let Some(v) = map.get(key) {
                                next.push(v);
                            }
                        }
                        // Implicit fan-out over array elements.
                        Value::Array(items) => {
                            for item in items {
                                if let Value::Object(map) = item
                                    && let Some(v) = map.get(key)
                                {
                                    next.push(v);
                                }
                            }
                        }
                        _ => {}
                    },
                    Segment::Index(index) => {
                        if let Value::Array(items) = value
                            && let Some(v) = items.get(*index)
                        {
                            next.push(v);
                        }
                    }
                    Segment::Wildcard => match value {
                        Value::Array(items) => next.extend(items.iter()),
                        Value::Object(map) => next.extend(map.values()),
                        _ => {}
                    },
                }
            }
            frontier = next;
            if frontier.is_empty() {
                break;
            }
        }
        frontier
    }
}
