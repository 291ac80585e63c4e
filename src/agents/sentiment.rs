// =============================================================================
// Sentiment Analysis Agent
// =============================================================================

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::warn;

use crate::agents::{num_field, str_field, Agent, AgentContext, AgentError};
use crate::state::{DecisionState, StateUpdate};

pub struct SentimentAgent {
    ctx: AgentContext,
}

impl SentimentAgent {
    pub fn new(ctx: AgentContext) -> Self {
        Self { ctx }
    }
}

/// Neutral fallback when the LLM is unavailable.
fn default_output() -> Map<String, Value> {
    let mut out = Map::new();
    out.insert("retail_sentiment".to_string(), Value::from(0.0));
    out.insert("institutional_sentiment".to_string(), Value::from(0.0));
    out.insert("sentiment_divergence".to_string(), Value::from("NONE"));
    out.insert("options_flow_signal".to_string(), Value::from("NEUTRAL"));
    out.insert("fear_greed_index".to_string(), Value::from(50.0));
    out.insert("confidence_score".to_string(), Value::from(0.5));
    out
}

#[async_trait]
impl Agent for SentimentAgent {
    fn name(&self) -> &'static str {
        "sentiment"
    }

    async fn process(
        &self,
        state: &DecisionState,
        cohort: Option<&str>,
    ) -> Result<StateUpdate, AgentError> {
        let mut update = StateUpdate::default();

        let headlines = if state.latest_news.is_empty() {
            "No recent news available".to_string()
        } else {
            state
                .latest_news
                .iter()
                .take(20)
                .map(|item| format!("- {}", item.title))
                .collect::<Vec<_>>()
                .join("\n")
        };

        let prompt = format!(
            "Latest News Headlines:\n{headlines}\n\n\
             Aggregate Sentiment Score: {:.2} (range: -1 to +1)\n\n\
             Analyze the market sentiment and provide your assessment.",
            state.sentiment_score,
        );

        let expected = [
            ("retail_sentiment", "float (-1 to +1)"),
            ("institutional_sentiment", "float (-1 to +1)"),
            (
                "sentiment_divergence",
                "string (NONE/RETAIL_BULLISH/INSTITUTIONAL_BULLISH/EXTREME_FEAR/EXTREME_GREED)",
            ),
            ("options_flow_signal", "string (BULLISH/BEARISH/NEUTRAL)"),
            ("fear_greed_index", "float (0-100)"),
            ("confidence_score", "float (0-1)"),
        ];

        match self
            .ctx
            .structured_call(self.name(), cohort, prompt, &expected)
            .await
        {
            Ok(outcome) => {
                let mut output = outcome.output;
                if !outcome.complete {
                    // Truncated response: keep what arrived, fill the rest
                    // with neutral defaults (the incomplete marker stays).
                    for (k, v) in default_output() {
                        output.entry(k).or_insert(v);
                    }
                }
                // Sentiment scores live in [-1, +1].
                for key in ["retail_sentiment", "institutional_sentiment"] {
                    let v = num_field(&output, key, 0.0).clamp(-1.0, 1.0);
                    output.insert(key.to_string(), Value::from(v));
                }

                let explanation = format!(
                    "Sentiment analysis: retail {:.2}, institutional {:.2}, divergence: {}",
                    num_field(&output, "retail_sentiment", 0.0),
                    num_field(&output, "institutional_sentiment", 0.0),
                    str_field(&output, "sentiment_divergence", "NONE"),
                );
                update.push_explanation(self.name(), explanation);
                update.sentiment = Some(output);
            }
            Err(e) if AgentContext::is_rate_limit_surface(&e) => {
                return Err(AgentError::RateLimited(e.to_string()));
            }
            Err(e) => {
                warn!(error = %e, "sentiment analysis failed (using defaults)");
                update.push_explanation(
                    self.name(),
                    "Sentiment analysis: retail 0.00, institutional 0.00, divergence: NONE \
                     (default - LLM unavailable)",
                );
                update.sentiment = Some(default_output());
            }
        }

        Ok(update)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_neutral() {
        let out = default_output();
        assert_eq!(num_field(&out, "retail_sentiment", 1.0), 0.0);
        assert_eq!(num_field(&out, "fear_greed_index", 0.0), 50.0);
        assert_eq!(str_field(&out, "options_flow_signal", ""), "NEUTRAL");
    }
}
