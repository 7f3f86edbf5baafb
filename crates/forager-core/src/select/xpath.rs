//! A small XPath dialect evaluated over the HTML DOM.
//!
//! Supported syntax:
//!
//! - `//name` (descendant axis) and `/name` (child axis) steps, `*` as a
//!   name wildcard. Expressions without a leading slash search descendants
//!   from the root, so `p` behaves like `//p`.
//! - Predicates per step: `[@attr]`, `[@attr='value']` (single or double
//!   quotes) and 1-based positions like `[2]`. Positions apply per parent
//!   context, so `//ul/li[1]` takes the first `li` of every `ul`.
//! - A final `/@attr` step yields attribute values, a final `/text()` step
//!   yields the concatenated direct text of each matched element.
//!
//! Anything else (functions, other axes, unions) is rejected at parse time
//! so misspelled expressions fail the rule instead of silently matching
//! nothing.

use std::collections::HashSet;

use ego_tree::{NodeId, NodeRef};
use scraper::{ElementRef, Html, Node};

#[derive(Debug, Clone, PartialEq, Eq)]
enum NameTest {
    Any,
    Name(String),
}

impl NameTest {
    fn matches(&self, el: &ElementRef<'_>) -> bool {
        match self {
            NameTest::Any => true,
            NameTest::Name(name) => el.value().name() == name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Predicate {
    HasAttr(String),
    AttrEquals(String, String),
    Position(usize),
}

#[derive(Debug, Clone)]
struct Step {
    descendant: bool,
    test: NameTest,
    predicates: Vec<Predicate>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Output {
    Node,
    Attr(String),
    Text,
}

/// A matched value: an element for plain steps, a string for `@attr` and
/// `text()` outputs.
#[derive(Debug, Clone)]
pub enum XPathValue<'a> {
    Element(ElementRef<'a>),
    Text(String),
}

/// A parsed XPath expression.
#[derive(Debug, Clone)]
pub struct XPathExpr {
    steps: Vec<Step>,
    output: Output,
}

fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | ':'))
}

/// Split an expression into (descendant-axis, token) pairs at top-level
/// slashes, respecting brackets and quotes.
fn split_steps(expr: &str) -> Result<Vec<(bool, String)>, String> {
    let mut rest = expr;
    let mut axis = if let Some(stripped) = rest.strip_prefix("//") {
        rest = stripped;
        true
    } else if let Some(stripped) = rest.strip_prefix('/') {
        rest = stripped;
        false
    } else {
        // Relative expressions search the whole tree.
        true
    };

    let mut steps = Vec::new();
    loop {
        let mut depth = 0usize;
        let mut quote: Option<char> = None;
        let mut split_at = None;
        for (pos, c) in rest.char_indices() {
            match (c, quote) {
                (q, Some(open)) if q == open => quote = None,
                (_, Some(_)) => {}
                ('\'' | '"', None) => quote = Some(c),
                ('[', None) => depth += 1,
                (']', None) => {
                    depth = depth
                        .checked_sub(1)
                        .ok_or_else(|| format!("unbalanced ']' in '{expr}'"))?;
                }
                ('/', None) if depth == 0 => {
                    split_at = Some(pos);
                    break;
                }
                _ => {}
            }
        }
        if split_at.is_none() {
            if quote.is_some() {
                return Err(format!("unclosed quote in '{expr}'"));
            }
            if depth != 0 {
                return Err(format!("unclosed '[' in '{expr}'"));
            }
        }

        match split_at {
            Some(pos) => {
                let token = &rest[..pos];
                if token.is_empty() {
                    return Err(format!("empty step in '{expr}'"));
                }
                steps.push((axis, token.to_string()));
                rest = &rest[pos + 1..];
                if let Some(stripped) = rest.strip_prefix('/') {
                    rest = stripped;
                    axis = true;
                } else {
                    axis = false;
                }
                if rest.is_empty() {
                    return Err(format!("trailing slash in '{expr}'"));
                }
            }
            None => {
                if rest.is_empty() {
                    return Err(format!("empty step in '{expr}'"));
                }
                steps.push((axis, rest.to_string()));
                return Ok(steps);
            }
        }
    }
}

fn unquote(raw: &str) -> Option<&str> {
    let bytes = raw.as_bytes();
    if bytes.len() >= 2
        && (bytes[0] == b'\'' || bytes[0] == b'"')
        && bytes[bytes.len() - 1] == bytes[0]
    {
        Some(&raw[1..raw.len() - 1])
    } else {
        None
    }
}

fn parse_predicate(inside: &str, expr: &str) -> Result<Predicate, String> {
    let inside = inside.trim();
    if let Some(attr) = inside.strip_prefix('@') {
        return match attr.find('=') {
            Some(eq) => {
                let name = attr[..eq].trim();
                if !valid_name(name) {
                    return Err(format!("invalid attribute name '@{name}' in '{expr}'"));
                }
                let value = unquote(attr[eq + 1..].trim())
                    .ok_or_else(|| format!("attribute value must be quoted in '{expr}'"))?;
                Ok(Predicate::AttrEquals(name.to_string(), value.to_string()))
            }
            None => {
                let name = attr.trim();
                if !valid_name(name) {
                    return Err(format!("invalid attribute name '@{name}' in '{expr}'"));
                }
                Ok(Predicate::HasAttr(name.to_string()))
            }
        };
    }
    if !inside.is_empty() && inside.chars().all(|c| c.is_ascii_digit()) {
        let position: usize = inside
            .parse()
            .map_err(|_| format!("bad position '[{inside}]' in '{expr}'"))?;
        if position == 0 {
            return Err(format!("positions are 1-based in '{expr}'"));
        }
        return Ok(Predicate::Position(position));
    }
    Err(format!("unsupported predicate '[{inside}]' in '{expr}'"))
}

fn parse_step(descendant: bool, token: &str, expr: &str) -> Result<Step, String> {
    let (head, mut rest) = match token.find('[') {
        Some(pos) => (&token[..pos], &token[pos..]),
        None => (token, ""),
    };
    let test = if head == "*" {
        NameTest::Any
    } else if valid_name(head) {
        NameTest::Name(head.to_ascii_lowercase())
    } else {
        return Err(format!("invalid element name '{head}' in '{expr}'"));
    };

    let mut predicates = Vec::new();
    while !rest.is_empty() {
        let mut depth = 0usize;
        let mut quote: Option<char> = None;
        let mut close = None;
        for (pos, c) in rest.char_indices() {
            match (c, quote) {
                (q, Some(open)) if q == open => quote = None,
                (_, Some(_)) => {}
                ('\'' | '"', None) => quote = Some(c),
                ('[', None) => depth += 1,
                (']', None) => {
                    depth -= 1;
                    if depth == 0 {
                        close = Some(pos);
                        break;
                    }
                }
                _ => {}
            }
        }
        let close = close.ok_or_else(|| format!("unclosed '[' in '{expr}'"))?;
        predicates.push(parse_predicate(&rest[1..close], expr)?);
        rest = &rest[close + 1..];
        if !rest.is_empty() && !rest.starts_with('[') {
            return Err(format!("unexpected '{rest}' after predicate in '{expr}'"));
        }
    }

    Ok(Step {
        descendant,
        test,
        predicates,
    })
}

impl XPathExpr {
    pub fn parse(expr: &str) -> Result<Self, String> {
        let trimmed = expr.trim();
        if trimmed.is_empty() {
            return Err("empty expression".to_string());
        }

        let tokens = split_steps(trimmed)?;
        let mut steps = Vec::new();
        let mut output = Output::Node;
        let last = tokens.len() - 1;
        for (idx, (descendant, token)) in tokens.into_iter().enumerate() {
            if token == "text()" {
                if idx != last {
                    return Err(format!("text() must be the final step in '{expr}'"));
                }
                output = Output::Text;
            } else if let Some(attr) = token.strip_prefix('@') {
                if idx != last {
                    return Err(format!("@{attr} must be the final step in '{expr}'"));
                }
                if !valid_name(attr) {
                    return Err(format!("invalid attribute name '@{attr}' in '{expr}'"));
                }
                output = Output::Attr(attr.to_string());
            } else {
                steps.push(parse_step(descendant, &token, expr)?);
            }
        }
        if steps.is_empty() {
            return Err(format!("expected an element step in '{expr}'"));
        }
        Ok(Self { steps, output })
    }

    /// Evaluate against a parsed document. Results come back in document
    /// order with duplicates removed.
    pub fn select<'a>(&self, doc: &'a Html) -> Vec<XPathValue<'a>> {
        let mut context: Vec<ElementRef<'a>> = Vec::new();
        for (idx, step) in self.steps.iter().enumerate() {
            let mut next = Vec::new();
            let mut seen: HashSet<NodeId> = HashSet::new();
            if idx == 0 {
                collect_step(doc.tree.root(), step, &mut next, &mut seen);
            } else {
                for el in &context {
                    collect_step(**el, step, &mut next, &mut seen);
                }
            }
            context = next;
            if context.is_empty() {
                return Vec::new();
            }
        }

        match &self.output {
            Output::Node => context.into_iter().map(XPathValue::Element).collect(),
            Output::Attr(name) => context
                .iter()
                .filter_map(|el| el.value().attr(name))
                .map(|value| XPathValue::Text(value.to_string()))
                .collect(),
            Output::Text => context
                .iter()
                .map(direct_text)
                .filter(|text| !text.is_empty())
                .map(XPathValue::Text)
                .collect(),
        }
    }
}

/// Candidates for one step under one context node, with the step's
/// predicates applied. Position predicates count within this context node
/// only.
fn collect_step<'a>(
    base: NodeRef<'a, Node>,
    step: &Step,
    out: &mut Vec<ElementRef<'a>>,
    seen: &mut HashSet<NodeId>,
) {
    let mut matched: Vec<ElementRef<'a>> = if step.descendant {
        base.descendants()
            .skip(1)
            .filter_map(ElementRef::wrap)
            .filter(|el| step.test.matches(el))
            .collect()
    } else {
        base.children()
            .filter_map(ElementRef::wrap)
            .filter(|el| step.test.matches(el))
            .collect()
    };

    for predicate in &step.predicates {
        match predicate {
            Predicate::HasAttr(name) => {
                matched.retain(|el| el.value().attr(name).is_some());
            }
            Predicate::AttrEquals(name, value) => {
                matched.retain(|el| el.value().attr(name) == Some(value.as_str()));
            }
            Predicate::Position(position) => {
                matched = matched.into_iter().skip(position - 1).take(1).collect();
            }
        }
    }

    for el in matched {
        if seen.insert(el.id()) {
            out.push(el);
        }
    }
}

/// Direct child text of an element, trimmed and space-joined.
fn direct_text(el: &ElementRef<'_>) -> String {
    let mut out = String::new();
    for child in el.children() {
        if let Some(text) = child.value().as_text() {
            let trimmed = text.trim();
            if !trimmed.is_empty() {
                if !out.is_empty() {
                    out.push(' ');
                }
                out.push_str(trimmed);
            }
        }
    }
    out
}
