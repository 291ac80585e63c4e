// =============================================================================
// Fundamental Analysis Agent
// =============================================================================
//
// Judges asset strength from recent news and macro context. The prompt and
// the fallback defaults dispatch on the instrument profile (crypto assets
// get regulatory/adoption framing, listed instruments get policy/health
// framing) — never on symbol substrings.
// =============================================================================

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::warn;

use crate::agents::{clamp01, num_field, str_field, Agent, AgentContext, AgentError};
use crate::state::{DecisionState, StateUpdate};

pub struct FundamentalAgent {
    ctx: AgentContext,
}

impl FundamentalAgent {
    pub fn new(ctx: AgentContext) -> Self {
        Self { ctx }
    }

    fn default_output(&self) -> Map<String, Value> {
        default_output(self.ctx.profile.kind.is_crypto())
    }

    fn build_prompt(&self, state: &DecisionState) -> String {
        let name = &self.ctx.profile.symbol;
        let news_summary = if state.latest_news.is_empty() {
            "No recent news available".to_string()
        } else {
            state
                .latest_news
                .iter()
                .take(10)
                .map(|item| format!("- {} (sentiment: {:.2})", item.title, item.sentiment))
                .collect::<Vec<_>>()
                .join("\n")
        };

        if self.ctx.profile.kind.is_crypto() {
            format!(
                "Latest News for {name}:\n{news_summary}\n\n\
                 Market Context for {name} (Cryptocurrency):\n\
                 - Regulatory Environment: Analyze recent regulatory news and policy changes\n\
                 - Adoption Trends: Institutional adoption, ETF flows, mainstream acceptance\n\
                 - Market Structure: Exchange flows, funding conditions, market sentiment\n\n\
                 Analyze the fundamental strength of {name} as a cryptocurrency asset.\n\
                 Focus on regulatory clarity, adoption, network health, and liquidity."
            )
        } else {
            format!(
                "Latest News for {name}:\n{news_summary}\n\n\
                 Market Context:\n\
                 - Policy Rate: {}\n\
                 - Market Health Indicator: {}\n\n\
                 Analyze the fundamental strength of {name} and provide your assessment.\n\
                 Use a 15-minute to 1-day trading horizon and focus on factors that directly \
                 impact near-term price moves in {name}.",
                state
                    .policy_rate
                    .map(|r| r.to_string())
                    .unwrap_or_else(|| "Unknown".to_string()),
                state
                    .health_indicator
                    .map(|r| r.to_string())
                    .unwrap_or_else(|| "Unknown".to_string()),
            )
        }
    }
}

#[async_trait]
impl Agent for FundamentalAgent {
    fn name(&self) -> &'static str {
        "fundamental"
    }

    async fn process(
        &self,
        state: &DecisionState,
        cohort: Option<&str>,
    ) -> Result<StateUpdate, AgentError> {
        let mut update = StateUpdate::default();
        let prompt = self.build_prompt(state);

        let expected = [
            ("asset_strength", "STRONG | MODERATE | WEAK"),
            ("market_health_trend", "IMPROVING | STABLE | DETERIORATING"),
            ("policy_impact", "POSITIVE | NEUTRAL | NEGATIVE"),
            ("bullish_probability", "float (0-1)"),
            ("bearish_probability", "float (0-1)"),
            ("key_risk_factors", "array of strings"),
            ("key_catalysts", "array of strings"),
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
                    for (k, v) in self.default_output() {
                        output.entry(k).or_insert(v);
                    }
                }
                // Probabilities must land in [0, 1] whatever the model sent.
                let bull = clamp01(num_field(&output, "bullish_probability", 0.5));
                let bear = clamp01(num_field(&output, "bearish_probability", 0.5));
                output.insert("bullish_probability".to_string(), Value::from(bull));
                output.insert("bearish_probability".to_string(), Value::from(bear));

                let explanation = format!(
                    "Fundamental analysis: {} strength, bullish prob {:.2}, bearish prob {:.2}",
                    str_field(&output, "asset_strength", "UNKNOWN"),
                    bull,
                    bear,
                );
                update.push_explanation(self.name(), explanation);
                update.fundamental = Some(output);
            }
            Err(e) if AgentContext::is_rate_limit_surface(&e) => {
                return Err(AgentError::RateLimited(e.to_string()));
            }
            Err(e) => {
                warn!(error = %e, "fundamental analysis failed (using defaults)");
                let output = self.default_output();
                update.push_explanation(
                    self.name(),
                    "Fundamental analysis: MODERATE strength, bullish prob 0.50, bearish prob 0.50 \
                     (default - LLM unavailable)",
                );
                update.fundamental = Some(output);
            }
        }

        Ok(update)
    }
}

/// Instrument-aware fallback output used when the LLM is unavailable.
fn default_output(is_crypto: bool) -> Map<String, Value> {
    let mut out = Map::new();
    out.insert("asset_strength".to_string(), Value::from("MODERATE"));
    out.insert("market_health_trend".to_string(), Value::from("STABLE"));
    out.insert("policy_impact".to_string(), Value::from("NEUTRAL"));
    if is_crypto {
        out.insert("regulatory_impact".to_string(), Value::from("NEUTRAL"));
        out.insert("adoption_trend".to_string(), Value::from("STABLE"));
    }
    out.insert("bullish_probability".to_string(), Value::from(0.5));
    out.insert("bearish_probability".to_string(), Value::from(0.5));
    out.insert("key_risk_factors".to_string(), Value::Array(Vec::new()));
    out.insert("key_catalysts".to_string(), Value::Array(Vec::new()));
    out.insert("confidence_score".to_string(), Value::from(0.5));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_keep_probabilities_balanced() {
        // The fallback must keep the graph HOLD-biased when the LLM is down.
        let out = default_output(false);
        assert_eq!(num_field(&out, "bullish_probability", 0.0), 0.5);
        assert_eq!(num_field(&out, "bearish_probability", 0.0), 0.5);
        assert!(!out.contains_key("regulatory_impact"));
    }

    #[test]
    fn crypto_defaults_carry_crypto_keys() {
        let out = default_output(true);
        assert_eq!(str_field(&out, "regulatory_impact", ""), "NEUTRAL");
        assert_eq!(str_field(&out, "adoption_trend", ""), "STABLE");
    }
}
