use std::time::Duration;

use thiserror::Error;

/// Error taxonomy for the fetch-and-extract pipeline.
#[derive(Error, Debug)]
pub enum ScrapeError {
    /// Connection, DNS, or TLS failure.
    #[error("Network error: {0}")]
    Network(String),

    /// A single request attempt timed out.
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// Non-success HTTP status that is not worth retrying on its own.
    #[error("HTTP {status} from {url}")]
    HttpStatus { status: u16, url: String },

    /// Domain window is full and the caller opted out of waiting.
    #[error("Rate limited, retry in {0:?}")]
    RateLimited(Duration),

    /// The proxy pool has no usable endpoint right now.
    #[error("No healthy proxy available")]
    NoHealthyProxy,

    /// Malformed or unsupported selector/pattern. A caller defect, never retried.
    #[error("Invalid rule '{field}': {message}")]
    InvalidRule { field: String, message: String },

    /// One field failed to extract. Sibling fields are unaffected.
    #[error("Extraction failed for field '{field}': {message}")]
    Extraction { field: String, message: String },

    /// A plugin step failed. Captured in the run context, never fatal.
    #[error("Plugin '{name}' failed: {message}")]
    Plugin { name: String, message: String },

    /// The next-page rule produced a URL that was already visited.
    #[error("Pagination cycle at {url}")]
    PaginationCycle { url: String },

    /// Cache backend failure. Corrupt entries are treated as misses instead.
    #[error("Cache error: {0}")]
    Cache(String),

    /// Response body could not be decoded as its detected content type.
    #[error("Parse error: {0}")]
    Parse(String),

    /// Invalid configuration supplied by the caller.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// The operation was cancelled by the caller.
    #[error("Operation cancelled")]
    Cancelled,

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ScrapeError {
    /// Returns true if this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            ScrapeError::Network(_)
            | ScrapeError::Timeout(_)
            | ScrapeError::RateLimited(_)
            | ScrapeError::NoHealthyProxy => true,
            ScrapeError::HttpStatus { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}
