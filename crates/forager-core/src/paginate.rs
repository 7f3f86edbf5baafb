//! Lazy traversal of paginated listings.
//!
//! A [`Paginator`] fetches a page, extracts it, then evaluates a next-page
//! rule against the same content to find where to go. It stops when the
//! rule finds nothing, when the next URL was already visited (a cycle), or
//! when the page limit is reached. A page failure is yielded once and ends
//! the traversal; so does a malformed next-page rule. Pages are never
//! reordered or skipped.

use std::collections::HashSet;

use crate::content::FetchResult;
use crate::error::ScrapeError;
use crate::extract::{Extracted, RuleEngine};
use crate::fetch::FetchOptions;
use crate::parse::ParsedContent;
use crate::rules::{Rule, RuleSet};
use crate::traits::{Fetcher, NullAnalyzer, TextAnalyzer};

/// Field name the next-page rule is evaluated under.
const NEXT_FIELD: &str = "__next_page";

/// One fetched and extracted page.
#[derive(Debug, Clone)]
pub struct Page {
    pub fetch: FetchResult,
    pub extracted: Extracted,
}

/// Pull-based page iterator. Nothing is fetched until [`next`] is called,
/// and each call fetches at most one page.
///
/// [`next`]: Paginator::next
pub struct Paginator<F: Fetcher, A: TextAnalyzer = NullAnalyzer> {
    fetcher: F,
    engine: RuleEngine<A>,
    rules: RuleSet,
    next_page_rule: Rule,
    options: FetchOptions,
    limit: usize,
    next_url: Option<String>,
    visited: HashSet<String>,
    yielded: usize,
    done: bool,
}

impl<F: Fetcher, A: TextAnalyzer> Paginator<F, A> {
    pub fn new(
        fetcher: F,
        engine: RuleEngine<A>,
        start_url: impl Into<String>,
        rules: RuleSet,
        next_page_rule: Rule,
        limit: usize,
    ) -> Self {
        Self {
            fetcher,
            engine,
            rules,
            next_page_rule,
            options: FetchOptions::default(),
            limit,
            next_url: Some(start_url.into()),
            visited: HashSet::new(),
            yielded: 0,
            done: false,
        }
    }

    pub fn with_options(mut self, options: FetchOptions) -> Self {
        self.options = options;
        self
    }

    /// Fetch and extract the next page.
    ///
    /// `Some(Err(_))` is yielded exactly once; afterwards the paginator is
    /// exhausted. `None` means done, and stays `None`.
    pub async fn next(&mut self) -> Option<Result<Page, ScrapeError>> {
        if self.done || self.yielded >= self.limit {
            self.done = true;
            return None;
        }
        let url = self.next_url.take()?;
        self.visited.insert(url.clone());

        let fetch = match self.fetcher.fetch(&url, &self.options).await {
            Ok(fetch) => fetch,
            Err(e) => {
                self.done = true;
                return Some(Err(e));
            }
        };
        let parsed = match ParsedContent::from_fetch(&fetch) {
            Ok(parsed) => parsed,
            Err(e) => {
                self.done = true;
                return Some(Err(e));
            }
        };
        let extracted = match self.engine.extract(&parsed, &self.rules).await {
            Ok(extracted) => extracted,
            Err(e) => {
                self.done = true;
                return Some(Err(e));
            }
        };

        if let Err(e) = self.advance(&parsed, &fetch.final_url).await {
            self.done = true;
            return Some(Err(e));
        }
        self.yielded += 1;
        Some(Ok(Page { fetch, extracted }))
    }

    /// Drain the paginator, failing on the first page error.
    pub async fn collect_pages(mut self) -> Result<Vec<Page>, ScrapeError> {
        let mut pages = Vec::new();
        while let Some(page) = self.next().await {
            pages.push(page?);
        }
        Ok(pages)
    }

    /// Evaluate the next-page rule against the page just extracted and
    /// decide where the following call goes. A malformed rule is a caller
    /// defect and fails the traversal; a rule that finds nothing ends it.
    async fn advance(&mut self, parsed: &ParsedContent, base: &str) -> Result<(), ScrapeError> {
        let link_rules = RuleSet::new().with(NEXT_FIELD, self.next_page_rule.clone());
        let out = self.engine.extract(parsed, &link_rules).await?;
        let href = out
            .fields
            .get(NEXT_FIELD)
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        let Some(href) = href else {
            self.next_url = None;
            return Ok(());
        };

        match resolve_url(base, &href) {
            Some(next) if self.visited.contains(&next) => {
                let err = ScrapeError::PaginationCycle { url: next };
                tracing::debug!(error = %err, "Stopping pagination");
                self.next_url = None;
            }
            Some(next) => self.next_url = Some(next),
            None => {
                tracing::debug!(%href, "Next-page link did not resolve");
                self.next_url = None;
            }
        }
        Ok(())
    }
}

/// Resolve an href against the page URL it came from.
fn resolve_url(base: &str, href: &str) -> Option<String> {
    match url::Url::parse(base) {
        Ok(base) => base.join(href).ok().map(|u| u.to_string()),
        Err(_) => url::Url::parse(href).ok().map(|u| u.to_string()),
    }
}
