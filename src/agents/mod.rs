// =============================================================================
// Agent contract — uniform interface for all graph nodes
// =============================================================================
//
// An agent owns a stable name, a system prompt (from the prompt store with a
// built-in fallback), and one operation: take the current DecisionState and
// return a partial update covering only the fields it may write, plus at
// most one new explanation entry.
//
// Failure discipline: every analysis agent defines an instrument-aware
// default output. LLM failures other than rate limits degrade to that
// default with low confidence and a fallback explanation; rate limits
// propagate so the manager's fallback path can run.
// =============================================================================

pub mod debate;
pub mod execution;
pub mod fundamental;
pub mod macro_analysis;
pub mod portfolio;
pub mod risk;
pub mod sentiment;
pub mod technical;

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

use crate::config::EngineConfig;
use crate::instrument::InstrumentProfile;
use crate::llm::json_guard;
use crate::llm::manager::{ChatRequest, ProviderManager};
use crate::llm::prompts::PromptStore;
use crate::llm::LlmError;
use crate::state::{DecisionState, StateUpdate, INCOMPLETE_JSON_KEY};

/// Errors an agent surfaces to the graph. Anything else is absorbed into
/// the agent's default output.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The LLM pool is rate limited end to end; the run must not paper over
    /// this with defaults.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Unrecoverable framework-level failure.
    #[error("{0}")]
    Fatal(String),
}

/// A graph node.
#[async_trait]
pub trait Agent: Send + Sync {
    fn name(&self) -> &'static str;

    /// Produce this agent's partial update. `cohort` identifies the
    /// parallel group so the provider manager can diversify assignments.
    async fn process(
        &self,
        state: &DecisionState,
        cohort: Option<&str>,
    ) -> Result<StateUpdate, AgentError>;
}

// ---------------------------------------------------------------------------
// Shared context
// ---------------------------------------------------------------------------

/// Dependencies shared by LLM-backed agents. Injected at construction; no
/// globals.
#[derive(Clone)]
pub struct AgentContext {
    pub manager: Arc<ProviderManager>,
    pub prompts: Arc<PromptStore>,
    pub profile: Arc<InstrumentProfile>,
    pub config: Arc<EngineConfig>,
}

/// Result of a gated structured call.
pub struct StructuredOutcome {
    /// Parsed object; carries the incomplete marker when the gate failed.
    pub output: Map<String, Value>,
    pub complete: bool,
}

impl AgentContext {
    /// True when the error means "the pool is rate limited" rather than a
    /// provider being broken.
    pub fn is_rate_limit_surface(error: &LlmError) -> bool {
        match error {
            LlmError::RateLimited { .. } => true,
            LlmError::AllProvidersFailed { summary } => {
                summary.to_lowercase().contains("rate limit")
            }
            _ => false,
        }
    }

    /// Plain text call using the agent's stored system prompt.
    pub async fn chat(
        &self,
        agent: &str,
        cohort: Option<&str>,
        user_message: String,
        temperature: Option<f64>,
    ) -> Result<String, LlmError> {
        let request = ChatRequest {
            agent: agent.to_string(),
            cohort: cohort.map(str::to_string),
            system_prompt: self.prompts.get(agent),
            user_message,
            temperature: temperature.unwrap_or(self.config.llm.temperature),
            max_tokens: self.config.llm.max_tokens,
        };
        self.manager.chat(&request).await
    }

    /// Structured call with the JSON completeness gate.
    ///
    /// After parsing, the raw response must be brace-balanced and carry at
    /// least the configured fraction of expected keys. A truncated or
    /// incomplete response is retried once with a doubled output budget
    /// (when the feature flag allows), then marked with `__incomplete_json`
    /// so finalization can raise the `analysis_incomplete` alert. Callers
    /// backfill their defaults when `complete` is false.
    pub async fn structured_call(
        &self,
        agent: &str,
        cohort: Option<&str>,
        user_message: String,
        expected: &[(&str, &str)],
    ) -> Result<StructuredOutcome, LlmError> {
        let expected_keys: Vec<&str> = expected.iter().map(|(k, _)| *k).collect();
        let min_fraction = self.config.llm.min_key_fraction;

        let request = ChatRequest {
            agent: agent.to_string(),
            cohort: cohort.map(str::to_string),
            system_prompt: self.prompts.get(agent),
            user_message,
            temperature: self.config.llm.temperature,
            max_tokens: self.config.llm.max_tokens,
        };

        // First attempt. A Parse error means the response was truncated or
        // never contained an object; that path retries like an incomplete
        // response. Everything else propagates.
        let mut salvaged: Option<Value> = None;
        match self.manager.structured(&request, expected).await {
            Ok(response) => {
                if json_guard::is_complete(
                    &response.raw,
                    &response.value,
                    &expected_keys,
                    min_fraction,
                ) {
                    if let Value::Object(map) = response.value {
                        return Ok(StructuredOutcome {
                            output: map,
                            complete: true,
                        });
                    }
                }
                salvaged = Some(response.value);
            }
            Err(LlmError::Parse(_)) => {}
            Err(other) => return Err(other),
        }

        // One retry with a larger output budget, then give up and mark.
        if self.config.features.json_validation_retry {
            warn!(agent, "structured response incomplete; retrying with scaled max tokens");
            let mut retry = request.clone();
            retry.max_tokens =
                json_guard::scaled_max_tokens(expected.len(), request.max_tokens).saturating_mul(2);
            match self.manager.structured(&retry, expected).await {
                Ok(second) => {
                    if json_guard::is_complete(
                        &second.raw,
                        &second.value,
                        &expected_keys,
                        min_fraction,
                    ) {
                        if let Value::Object(map) = second.value {
                            return Ok(StructuredOutcome {
                                output: map,
                                complete: true,
                            });
                        }
                    }
                    salvaged = Some(second.value);
                }
                Err(LlmError::Parse(_)) => {}
                Err(other) => return Err(other),
            }
        }

        let mut map = match salvaged {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };
        map.insert(INCOMPLETE_JSON_KEY.to_string(), Value::Bool(true));
        Ok(StructuredOutcome {
            output: map,
            complete: false,
        })
    }
}

// ---------------------------------------------------------------------------
// Small shared helpers
// ---------------------------------------------------------------------------

/// Read a numeric field from an agent output map, tolerating strings and
/// nulls the way LLM output arrives.
pub fn num_field(map: &Map<String, Value>, key: &str, default: f64) -> f64 {
    match map.get(key) {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(default),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(default),
        _ => default,
    }
}

/// Read a string field with a default.
pub fn str_field<'a>(map: &'a Map<String, Value>, key: &str, default: &'a str) -> &'a str {
    map.get(key).and_then(Value::as_str).unwrap_or(default)
}

/// Clamp a probability-like value into [0, 1].
pub fn clamp01(v: f64) -> f64 {
    v.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn num_field_tolerates_llm_shapes() {
        let mut map = Map::new();
        map.insert("a".to_string(), serde_json::json!(0.7));
        map.insert("b".to_string(), serde_json::json!("0.25"));
        map.insert("c".to_string(), Value::Null);

        assert_eq!(num_field(&map, "a", 0.0), 0.7);
        assert_eq!(num_field(&map, "b", 0.0), 0.25);
        assert_eq!(num_field(&map, "c", 0.5), 0.5);
        assert_eq!(num_field(&map, "missing", 0.5), 0.5);
    }

    #[test]
    fn rate_limit_surface_detection() {
        assert!(AgentContext::is_rate_limit_surface(&LlmError::RateLimited {
            message: "429".to_string(),
            reset_at: None,
        }));
        assert!(AgentContext::is_rate_limit_surface(
            &LlmError::AllProvidersFailed {
                summary: "alpha: rate limited: 429 (rate_limited)".to_string(),
            }
        ));
        assert!(!AgentContext::is_rate_limit_surface(&LlmError::Http(
            "500".to_string()
        )));
    }
}
