//! Rule evaluation against parsed content.
//!
//! Fields are isolated: one rule failing to match or process leaves the
//! other fields intact, records the failure and sets the field to null.
//! Group members degrade the same way, under `field.member` names.
//! Malformed rules (unparseable selector or regex) are a different story:
//! they are caller defects, so the whole call fails before anything runs.
//!
//! The HTML DOM is parsed and consumed inside a synchronous scope because
//! `scraper::Html` cannot cross an await point. NLP rules collect what
//! they need there and run against the analyzer afterwards.

use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde_json::{Map, Value};

use crate::error::ScrapeError;
use crate::parse::ParsedContent;
use crate::rules::{Rule, RuleKind, RuleSet, SelectorKind};
use crate::select::xpath::XPathValue;
use crate::select::{JsonPath, XPathExpr};
use crate::traits::{NullAnalyzer, TextAnalyzer};

/// One field that could not be extracted, and why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldFailure {
    pub field: String,
    pub message: String,
}

/// Extraction output: a value per field plus the failures that degraded.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extracted {
    pub fields: Map<String, Value>,
    pub failures: Vec<FieldFailure>,
}

impl Extracted {
    fn fail(&mut self, field: &str, message: String) {
        tracing::debug!(field, error = %message, "Field extraction failed");
        self.fields.insert(field.to_string(), Value::Null);
        self.failures.push(FieldFailure {
            field: field.to_string(),
            message,
        });
    }

    fn set_member(&mut self, field: &str, member: &str, value: Value) {
        if let Some(Value::Object(object)) = self.fields.get_mut(field) {
            object.insert(member.to_string(), value);
        }
    }

    fn fail_member(&mut self, field: &str, member: &str, message: String) {
        tracing::debug!(field, member, error = %message, "Field extraction failed");
        self.set_member(field, member, Value::Null);
        self.failures.push(FieldFailure {
            field: format!("{field}.{member}"),
            message,
        });
    }
}

enum CompiledSelector {
    Css(Selector),
    XPath(XPathExpr),
    JsonPath(JsonPath),
}

struct CompiledRule {
    selector: Option<CompiledSelector>,
    regex: Option<Regex>,
    /// Compiled members, in name order, for group rules.
    children: Vec<CompiledRule>,
}

/// Where an analyzer result lands once it arrives.
enum NlpTarget {
    Field(String),
    Member(String, String),
}

type PendingNlp = (NlpTarget, crate::rules::NlpTask, Option<String>);

/// Evaluates rule sets against parsed content.
#[derive(Debug, Clone, Default)]
pub struct RuleEngine<A: TextAnalyzer = NullAnalyzer> {
    analyzer: A,
}

impl RuleEngine<NullAnalyzer> {
    pub fn new() -> Self {
        Self {
            analyzer: NullAnalyzer,
        }
    }
}

impl<A: TextAnalyzer> RuleEngine<A> {
    /// Engine with an analyzer backing `nlp` rules.
    pub fn with_analyzer<B: TextAnalyzer>(self, analyzer: B) -> RuleEngine<B> {
        RuleEngine { analyzer }
    }

    /// Run every rule against the content.
    ///
    /// Returns `Err` only for malformed rules; match failures, content-kind
    /// mismatches, processor errors and analyzer errors degrade their own
    /// field. Running the same rules twice over the same content gives the
    /// same output.
    pub async fn extract(
        &self,
        content: &ParsedContent,
        rules: &RuleSet,
    ) -> Result<Extracted, ScrapeError> {
        let compiled = compile_rules(rules)?;
        let (mut extracted, pending, doc_text) = evaluate_sync(content, rules, &compiled);

        if !pending.is_empty() {
            let text = doc_text.unwrap_or_default();
            for (target, task, entity_type) in pending {
                let result = self
                    .analyzer
                    .analyze(&text, task, entity_type.as_deref())
                    .await;
                match (target, result) {
                    (NlpTarget::Field(field), Ok(value)) => {
                        extracted.fields.insert(field, value);
                    }
                    (NlpTarget::Field(field), Err(message)) => extracted.fail(&field, message),
                    (NlpTarget::Member(field, member), Ok(value)) => {
                        extracted.set_member(&field, &member, value);
                    }
                    (NlpTarget::Member(field, member), Err(message)) => {
                        extracted.fail_member(&field, &member, message);
                    }
                }
            }
        }
        Ok(extracted)
    }
}

fn compile_rules(rules: &RuleSet) -> Result<Vec<CompiledRule>, ScrapeError> {
    rules
        .iter()
        .map(|(field, rule)| compile_rule(field, rule, true))
        .collect()
}

fn compile_rule(
    field: &str,
    rule: &Rule,
    groups_allowed: bool,
) -> Result<CompiledRule, ScrapeError> {
    let selector = match &rule.kind {
        RuleKind::Selector { selector, kind, .. } => Some(match kind {
            SelectorKind::Css => {
                CompiledSelector::Css(Selector::parse(selector).map_err(|e| {
                    ScrapeError::InvalidRule {
                        field: field.to_string(),
                        message: format!("invalid css selector '{selector}': {e}"),
                    }
                })?)
            }
            SelectorKind::XPath => {
                CompiledSelector::XPath(XPathExpr::parse(selector).map_err(|message| {
                    ScrapeError::InvalidRule {
                        field: field.to_string(),
                        message: format!("invalid xpath '{selector}': {message}"),
                    }
                })?)
            }
            SelectorKind::JsonPath => {
                CompiledSelector::JsonPath(JsonPath::parse(selector).map_err(|message| {
                    ScrapeError::InvalidRule {
                        field: field.to_string(),
                        message: format!("invalid jsonpath '{selector}': {message}"),
                    }
                })?)
            }
        }),
        RuleKind::Nlp { .. } => None,
        RuleKind::Group(children) => {
            if !groups_allowed {
                return Err(ScrapeError::InvalidRule {
                    field: field.to_string(),
                    message: "group rules cannot nest".to_string(),
                });
            }
            if rule.regex.is_some() || rule.multiple || rule.processor.is_some() {
                return Err(ScrapeError::InvalidRule {
                    field: field.to_string(),
                    message: "group rules take no regex, multiple or processor".to_string(),
                });
            }
            let children = children
                .iter()
                .map(|(member, child)| compile_rule(&format!("{field}.{member}"), child, false))
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(CompiledRule {
                selector: None,
                regex: None,
                children,
            });
        }
    };
    let regex = rule
        .regex
        .as_deref()
        .map(|pattern| {
            Regex::new(pattern).map_err(|e| ScrapeError::InvalidRule {
                field: field.to_string(),
                message: format!("invalid regex '{pattern}': {e}"),
            })
        })
        .transpose()?;
    Ok(CompiledRule {
        selector,
        regex,
        children: Vec::new(),
    })
}

/// Selector evaluation happens entirely here so the engine's future stays
/// `Send` despite the non-`Send` DOM.
fn evaluate_sync(
    content: &ParsedContent,
    rules: &RuleSet,
    compiled: &[CompiledRule],
) -> (Extracted, Vec<PendingNlp>, Option<String>) {
    let dom = match content {
        ParsedContent::Html(raw) => Some(Html::parse_document(raw)),
        _ => None,
    };

    let mut extracted = Extracted::default();
    let mut pending = Vec::new();

    for ((field, rule), compiled) in rules.iter().zip(compiled) {
        let attribute = match &rule.kind {
            RuleKind::Nlp { task, entity_type } => {
                pending.push((
                    NlpTarget::Field(field.to_string()),
                    *task,
                    entity_type.clone(),
                ));
                continue;
            }
            RuleKind::Group(children) => {
                evaluate_group(
                    content,
                    dom.as_ref(),
                    field,
                    children,
                    compiled,
                    &mut extracted,
                    &mut pending,
                );
                continue;
            }
            RuleKind::Selector { attribute, .. } => attribute.as_deref(),
        };

        let selected = match &compiled.selector {
            Some(selector) => selector_values(content, dom.as_ref(), selector, attribute),
            None => continue,
        };

        match selected.and_then(|values| apply_post(rule, compiled.regex.as_ref(), values)) {
            Ok(value) => {
                extracted.fields.insert(field.to_string(), value);
            }
            Err(message) => extracted.fail(field, message),
        }
    }

    let doc_text = (!pending.is_empty()).then(|| content.plain_text());
    (extracted, pending, doc_text)
}

/// Group members run like top-level rules against the same content and
/// land under one object. Each member degrades independently.
fn evaluate_group(
    content: &ParsedContent,
    dom: Option<&Html>,
    field: &str,
    children: &RuleSet,
    compiled: &CompiledRule,
    extracted: &mut Extracted,
    pending: &mut Vec<PendingNlp>,
) {
    extracted
        .fields
        .insert(field.to_string(), Value::Object(Map::new()));

    for ((member, rule), compiled) in children.iter().zip(&compiled.children) {
        let attribute = match &rule.kind {
            RuleKind::Nlp { task, entity_type } => {
                // Null until the analyzer pass fills it in.
                extracted.set_member(field, member, Value::Null);
                pending.push((
                    NlpTarget::Member(field.to_string(), member.to_string()),
                    *task,
                    entity_type.clone(),
                ));
                continue;
            }
            // Rejected at compile time.
            RuleKind::Group(_) => continue,
            RuleKind::Selector { attribute, .. } => attribute.as_deref(),
        };

        let selected = match &compiled.selector {
            Some(selector) => selector_values(content, dom, selector, attribute),
            None => continue,
        };

        match selected.and_then(|values| apply_post(rule, compiled.regex.as_ref(), values)) {
            Ok(value) => extracted.set_member(field, member, value),
            Err(message) => extracted.fail_member(field, member, message),
        }
    }
}

fn selector_values(
    content: &ParsedContent,
    dom: Option<&Html>,
    selector: &CompiledSelector,
    attribute: Option<&str>,
) -> Result<Vec<Value>, String> {
    match selector {
        CompiledSelector::Css(selector) => match dom {
            Some(dom) => Ok(css_values(dom, selector, attribute)),
            None => Err("css selector requires HTML content".to_string()),
        },
        CompiledSelector::XPath(expr) => match dom {
            Some(dom) => Ok(xpath_values(dom, expr, attribute)),
            None => Err("xpath selector requires HTML content".to_string()),
        },
        CompiledSelector::JsonPath(path) => match content {
            ParsedContent::Json(value) | ParsedContent::Xml(value) => {
                Ok(path.select(value).into_iter().cloned().collect())
            }
            _ => Err("jsonpath selector requires JSON or XML content".to_string()),
        },
    }
}

/// Matched element text with whitespace collapsed.
fn element_text(el: &ElementRef<'_>) -> String {
    let words: Vec<&str> = el.text().flat_map(str::split_whitespace).collect();
    words.join(" ")
}

fn css_values(dom: &Html, selector: &Selector, attribute: Option<&str>) -> Vec<Value> {
    dom.select(selector)
        .filter_map(|el| match attribute {
            // Elements without the attribute are skipped, not nulled.
            Some(attr) => el
                .value()
                .attr(attr)
                .map(|value| Value::String(value.to_string())),
            None => Some(Value::String(element_text(&el))),
        })
        .collect()
}

fn xpath_values(dom: &Html, expr: &XPathExpr, attribute: Option<&str>) -> Vec<Value> {
    expr.select(dom)
        .into_iter()
        .filter_map(|value| match value {
            XPathValue::Element(el) => match attribute {
                Some(attr) => el
                    .value()
                    .attr(attr)
                    .map(|value| Value::String(value.to_string())),
                None => Some(Value::String(element_text(&el))),
            },
            XPathValue::Text(text) => Some(Value::String(text)),
        })
        .collect()
}

/// First capture group if the pattern defines one, whole match otherwise.
fn apply_regex(re: &Regex, input: &str) -> Option<String> {
    let caps = re.captures(input)?;
    match caps.get(1) {
        Some(group) => Some(group.as_str().to_string()),
        None => caps.get(0).map(|m| m.as_str().to_string()),
    }
}

/// Shared tail of every selector rule: cardinality, regex, processor.
fn apply_post(rule: &Rule, regex: Option<&Regex>, mut values: Vec<Value>) -> Result<Value, String> {
    if !rule.multiple {
        values.truncate(1);
    }

    if let Some(re) = regex {
        values = values
            .into_iter()
            .filter_map(|value| match value {
                Value::String(s) => apply_regex(re, &s).map(Value::String),
                other => Some(other),
            })
            .collect();
    }

    if let Some(processor) = &rule.processor {
        values = values
            .into_iter()
            .map(|value| processor(value).map_err(|message| format!("processor failed: {message}")))
            .collect::<Result<Vec<_>, _>>()?;
    }

    if rule.multiple {
        Ok(Value::Array(values))
    } else {
        Ok(values.into_iter().next().unwrap_or(Value::Null))
    }
}
