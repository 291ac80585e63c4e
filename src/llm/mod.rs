// =============================================================================
// LLM subsystem — provider pool, call protocol, structured JSON plumbing
// =============================================================================

pub mod client;
pub mod json_guard;
pub mod manager;
pub mod prompts;
pub mod provider;

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Outcome taxonomy for LLM calls. The manager loop switches on these
/// instead of using exceptions as control flow: rate limits carry their
/// parsed reset instant, model errors are fatal for the provider, and
/// everything else cools down for five minutes.
#[derive(Debug, Clone, Error)]
pub enum LlmError {
    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        /// Parsed reset instant, when the provider told us one.
        reset_at: Option<DateTime<Utc>>,
    },

    /// Model/endpoint error (404, unknown model, missing dependency). The
    /// provider is marked UNAVAILABLE with no automatic recovery.
    #[error("model error: {0}")]
    Model(String),

    #[error("request timed out after {0} s")]
    Timeout(u64),

    #[error("http error: {0}")]
    Http(String),

    /// The response arrived but could not be parsed into the expected shape.
    #[error("parse error: {0}")]
    Parse(String),

    /// Every provider in the pool failed; the message lists each provider's
    /// last error.
    #[error("all LLM providers failed:\n{summary}")]
    AllProvidersFailed { summary: String },
}

impl LlmError {
    /// True when the error is a rate limit; agents propagate these instead
    /// of substituting defaults so the manager's fallback path can run.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }
}
