//! Resilient fetching and rule-driven extraction for web scraping.
//!
//! The crate is organized around three layers:
//!
//! - the fetch path ([`FetchClient`]): response caching, per-domain rate
//!   limiting, proxy rotation with health tracking, bounded retries and
//!   credential refresh, all behind the [`Fetcher`] trait;
//! - extraction ([`RuleEngine`]): declarative [`RuleSet`]s of CSS, XPath,
//!   JSONPath and NLP rules evaluated against fetched content, with
//!   per-field failure isolation;
//! - orchestration ([`Pipeline`] and [`Paginator`]): configurable step
//!   sequences over shared run contexts, and lazy traversal of paginated
//!   listings.
//!
//! Transport is abstracted behind [`HttpTransport`]; a reqwest-backed
//! implementation lives in the companion client crate.

pub mod backoff;
pub mod cache;
pub mod clean;
pub mod content;
pub mod error;
pub mod extract;
pub mod fetch;
pub mod paginate;
pub mod parse;
pub mod pipeline;
pub mod proxy;
pub mod ratelimit;
pub mod rules;
pub mod select;
pub mod testutil;
pub mod traits;

pub use backoff::BackoffConfig;
pub use cache::{cache_key, DiskCache, MemoryCache, NullCache, ResponseCache};
pub use clean::{CleanConfig, Cleaner};
pub use content::{ContentKind, FetchResult};
pub use error::ScrapeError;
pub use extract::{Extracted, FieldFailure, RuleEngine};
pub use fetch::{FetchClient, FetchConfig, FetchOptions};
pub use paginate::{Page, Paginator};
pub use parse::ParsedContent;
pub use pipeline::{Pipeline, PipelineContext, PipelineStep, Plugin, StepError};
pub use proxy::{ProxyConfig, ProxyLease, ProxyManager, ProxyStatus};
pub use ratelimit::{domain_key, RateLimitConfig, RateLimiter};
pub use rules::{NlpTask, Processor, Rule, RuleKind, RuleSet, SelectorKind};
pub use traits::{
    CredentialProvider, Fetcher, HttpTransport, NoCredentials, NullAnalyzer, TextAnalyzer,
    TransportRequest, TransportResponse,
};
