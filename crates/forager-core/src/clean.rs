//! Post-extraction cleanup of field values.

use std::collections::HashSet;

use regex::Regex;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::error::ScrapeError;

/// What [`Cleaner`] does to extracted values.
#[derive(Debug, Clone)]
pub struct CleanConfig {
    /// Collapse runs of whitespace in strings to single spaces.
    pub normalize_whitespace: bool,
    /// Drop repeated values from arrays, keeping first occurrences.
    pub dedup_sequences: bool,
    /// Regexes removed from every string value.
    pub unwanted_patterns: Vec<String>,
}

impl Default for CleanConfig {
    fn default() -> Self {
        Self {
            normalize_whitespace: true,
            dedup_sequences: true,
            unwanted_patterns: Vec::new(),
        }
    }
}

impl CleanConfig {
    pub fn with_normalize_whitespace(mut self, enabled: bool) -> Self {
        self.normalize_whitespace = enabled;
        self
    }

    pub fn with_dedup_sequences(mut self, enabled: bool) -> Self {
        self.dedup_sequences = enabled;
        self
    }

    pub fn with_unwanted_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.unwanted_patterns.push(pattern.into());
        self
    }
}

/// Normalizes extracted output in place. Strings get whitespace and
/// pattern cleanup, arrays get deduplicated, nested structures are walked
/// recursively. Non-string scalars pass through untouched.
#[derive(Debug, Clone)]
pub struct Cleaner {
    config: CleanConfig,
    patterns: Vec<Regex>,
}

impl Default for Cleaner {
    fn default() -> Self {
        Self {
            config: CleanConfig::default(),
            patterns: Vec::new(),
        }
    }
}

impl Cleaner {
    pub fn new(config: CleanConfig) -> Result<Self, ScrapeError> {
        let patterns = config
            .unwanted_patterns
            .iter()
            .map(|pattern| {
                Regex::new(pattern).map_err(|e| {
                    ScrapeError::Config(format!("invalid unwanted pattern '{pattern}': {e}"))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { config, patterns })
    }

    pub fn clean(&self, fields: &mut Map<String, Value>) {
        for value in fields.values_mut() {
            self.clean_value(value);
        }
    }

    fn clean_value(&self, value: &mut Value) {
        match value {
            Value::String(s) => {
                let cleaned = self.clean_string(s);
                *s = cleaned;
            }
            Value::Array(items) => {
                for item in items.iter_mut() {
                    self.clean_value(item);
                }
                if self.config.dedup_sequences {
                    let mut seen = HashSet::new();
                    items.retain(|item| seen.insert(value_digest(item)));
                }
            }
            Value::Object(map) => {
                for nested in map.values_mut() {
                    self.clean_value(nested);
                }
            }
            _ => {}
        }
    }

    fn clean_string(&self, input: &str) -> String {
        let mut out = input.to_string();
        for pattern in &self.patterns {
            out = pattern.replace_all(&out, "").into_owned();
        }
        if self.config.normalize_whitespace {
            let words: Vec<&str> = out.split_whitespace().collect();
            out = words.join(" ");
        }
        out
    }
}

fn value_digest(value: &Value) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(value.to_string().as_bytes());
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other:?}"),
        }
    }

    #[test]
    fn whitespace_collapses() {
        let cleaner = Cleaner::default();
        let mut out = fields(json!({"title": "  Widget \n\t Pro  "}));
        cleaner.clean(&mut out);
        assert_eq!(out["title"], json!("Widget Pro"));
    }

    #[test]
    fn unwanted_patterns_are_removed() {
        let cleaner = Cleaner::new(
            CleanConfig::default().with_unwanted_pattern(r"(?i)sponsored:?\s*"),
        )
        .unwrap();
        let mut out = fields(json!({"title": "Sponsored: Widget Pro"}));
        cleaner.clean(&mut out);
        assert_eq!(out["title"], json!("Widget Pro"));
    }

    #[test]
    fn arrays_deduplicate_keeping_first_occurrence() {
        let cleaner = Cleaner::default();
        let mut out = fields(json!({"tags": ["new", "sale", "new", "popular", "sale"]}));
        cleaner.clean(&mut out);
        assert_eq!(out["tags"], json!(["new", "sale", "popular"]));
    }

    #[test]
    fn dedup_can_be_disabled() {
        let cleaner = Cleaner::new(CleanConfig::default().with_dedup_sequences(false)).unwrap();
        let mut out = fields(json!({"tags": ["a", "a"]}));
        cleaner.clean(&mut out);
        assert_eq!(out["tags"], json!(["a", "a"]));
    }

    #[test]
    fn nested_structures_are_walked() {
        let cleaner = Cleaner::default();
        let mut out = fields(json!({
            "product": {
                "name": "Widget   Pro",
                "variants": [{"sku": " W-1 "}, {"sku": " W-1 "}]
            }
        }));
        cleaner.clean(&mut out);
        assert_eq!(
            out["product"],
            json!({"name": "Widget Pro", "variants": [{"sku": "W-1"}]})
        );
    }

    #[test]
    fn non_string_scalars_pass_through() {
        let cleaner = Cleaner::default();
        let mut out = fields(json!({"count": 3, "ratio": 0.5, "ok": true, "none": null}));
        cleaner.clean(&mut out);
        assert_eq!(
            Value::Object(out),
            json!({"count": 3, "ratio": 0.5, "ok": true, "none": null})
        );
    }

    #[test]
    fn invalid_pattern_is_a_config_error() {
        let err = Cleaner::new(CleanConfig::default().with_unwanted_pattern("(unclosed"))
            .unwrap_err();
        assert!(matches!(err, ScrapeError::Config(_)));
    }
}
