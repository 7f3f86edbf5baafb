//! Declarative extraction rules.
//!
//! A [`RuleSet`] maps output field names to [`Rule`]s. Each rule selects
//! values out of fetched content (CSS, XPath or JSONPath), optionally
//! narrows them with a regex, and optionally post-processes each value.
//! NLP rules delegate the whole document to a text analyzer instead, and
//! group rules bundle named child rules into one object-valued field.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

/// Selector language for a [`RuleKind::Selector`] rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectorKind {
    Css,
    XPath,
    JsonPath,
}

impl fmt::Display for SelectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectorKind::Css => write!(f, "css"),
            SelectorKind::XPath => write!(f, "xpath"),
            SelectorKind::JsonPath => write!(f, "jsonpath"),
        }
    }
}

/// Analysis requested from the configured text analyzer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NlpTask {
    /// Named entity recognition.
    Ner,
    Keywords,
    Sentiment,
    Summary,
}

impl fmt::Display for NlpTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NlpTask::Ner => write!(f, "ner"),
            NlpTask::Keywords => write!(f, "keywords"),
            NlpTask::Sentiment => write!(f, "sentiment"),
            NlpTask::Summary => write!(f, "summary"),
        }
    }
}

/// Post-processing hook applied to each selected value. An `Err` fails the
/// field (not the whole extraction) with the returned message.
pub type Processor = Arc<dyn Fn(Value) -> Result<Value, String> + Send + Sync>;

#[derive(Debug, Clone)]
pub enum RuleKind {
    Selector {
        selector: String,
        kind: SelectorKind,
        /// Read this attribute off matched elements instead of their text.
        attribute: Option<String>,
    },
    Nlp {
        task: NlpTask,
        entity_type: Option<String>,
    },
    /// Named child rules whose results form one object.
    Group(RuleSet),
}

/// One field's extraction recipe.
#[derive(Clone)]
pub struct Rule {
    pub kind: RuleKind,
    /// Applied to each string value; the first capture group wins, falling
    /// back to the whole match. Non-matching values are discarded.
    pub regex: Option<String>,
    /// Collect every match (ordered) instead of just the first.
    pub multiple: bool,
    pub processor: Option<Processor>,
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rule")
            .field("kind", &self.kind)
            .field("regex", &self.regex)
            .field("multiple", &self.multiple)
            .field("processor", &self.processor.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

impl Rule {
    fn selector(selector: impl Into<String>, kind: SelectorKind) -> Self {
        Self {
            kind: RuleKind::Selector {
                selector: selector.into(),
                kind,
                attribute: None,
            },
            regex: None,
            multiple: false,
            processor: None,
        }
    }

    pub fn css(selector: impl Into<String>) -> Self {
        Self::selector(selector, SelectorKind::Css)
    }

    pub fn xpath(selector: impl Into<String>) -> Self {
        Self::selector(selector, SelectorKind::XPath)
    }

    pub fn jsonpath(selector: impl Into<String>) -> Self {
        Self::selector(selector, SelectorKind::JsonPath)
    }

    pub fn nlp(task: NlpTask) -> Self {
        Self {
            kind: RuleKind::Nlp {
                task,
                entity_type: None,
            },
            regex: None,
            multiple: false,
            processor: None,
        }
    }

    /// An object-valued rule: each named child is evaluated against the
    /// same content and lands under its name. Groups do not nest and take
    /// no regex, `multiple` or processor of their own.
    pub fn group(fields: RuleSet) -> Self {
        Self {
            kind: RuleKind::Group(fields),
            regex: None,
            multiple: false,
            processor: None,
        }
    }

    /// Read an attribute instead of element text. Ignored for NLP rules.
    pub fn with_attribute(mut self, attribute: impl Into<String>) -> Self {
        if let RuleKind::Selector { attribute: slot, .. } = &mut self.kind {
            *slot = Some(attribute.into());
        }
        self
    }

    /// Narrow entity extraction to one entity type. Ignored for selector rules.
    pub fn with_entity_type(mut self, entity_type: impl Into<String>) -> Self {
        if let RuleKind::Nlp { entity_type: slot, .. } = &mut self.kind {
            *slot = Some(entity_type.into());
        }
        self
    }

    pub fn with_regex(mut self, pattern: impl Into<String>) -> Self {
        self.regex = Some(pattern.into());
        self
    }

    pub fn multiple(mut self, multiple: bool) -> Self {
        self.multiple = multiple;
        self
    }

    pub fn with_processor<F>(mut self, processor: F) -> Self
    where
        F: Fn(Value) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.processor = Some(Arc::new(processor));
        self
    }
}

/// Named rules evaluated together against one document.
///
/// Fields iterate in name order, so extraction output and failure lists
/// are deterministic.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: BTreeMap<String, Rule>,
}

impl RuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, field: impl Into<String>, rule: Rule) -> Self {
        self.add(field, rule);
        self
    }

    pub fn add(&mut self, field: impl Into<String>, rule: Rule) {
        self.rules.insert(field.into(), rule);
    }

    pub fn get(&self, field: &str) -> Option<&Rule> {
        self.rules.get(field)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Rule)> {
        self.rules.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
