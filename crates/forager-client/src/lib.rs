//! Wire-level companions to `forager-core`.
//!
//! The core crate is transport-agnostic; this crate supplies the pieces
//! that actually touch the network: a reqwest-backed [`HttpTransport`]
//! with proxy routing and user-agent rotation, plus credential providers
//! for authenticated targets.
//!
//! ```no_run
//! use forager_client::ReqwestTransport;
//! use forager_core::{FetchClient, FetchConfig, Pipeline, Rule, RuleEngine, RuleSet};
//!
//! # async fn run() -> Result<(), forager_core::ScrapeError> {
//! let transport = ReqwestTransport::new()?;
//! let client = FetchClient::new(transport, FetchConfig::default());
//! let pipeline = Pipeline::standard(client, RuleEngine::new());
//!
//! let rules = RuleSet::new().with("title", Rule::css("h1"));
//! let context = pipeline.run("https://example.com", rules).await;
//! println!("{:?}", context.extracted);
//! # Ok(())
//! # }
//! ```
//!
//! [`HttpTransport`]: forager_core::traits::HttpTransport

pub mod credentials;
pub mod transport;

pub use credentials::{RefreshingCredentials, StaticCredentials, TokenSource};
pub use transport::ReqwestTransport;
