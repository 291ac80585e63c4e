// =============================================================================
// Macro Analysis Agent — regime detection from the macro inputs
// =============================================================================
//
// Crypto instruments are judged against global monetary policy and dollar
// strength; listed instruments against the local policy cycle and market
// health. Dispatch is on the instrument profile.
// =============================================================================

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::warn;

use crate::agents::{num_field, str_field, Agent, AgentContext, AgentError};
use crate::state::{DecisionState, StateUpdate};

pub struct MacroAgent {
    ctx: AgentContext,
}

impl MacroAgent {
    pub fn new(ctx: AgentContext) -> Self {
        Self { ctx }
    }
}

/// Instrument-aware fallback output.
fn default_output(is_crypto: bool) -> Map<String, Value> {
    let mut out = Map::new();
    out.insert("macro_regime".to_string(), Value::from("MIXED"));
    out.insert("policy_cycle".to_string(), Value::from("NEUTRAL"));
    out.insert("rate_cut_probability".to_string(), Value::from(0.5));
    out.insert("rate_hike_probability".to_string(), Value::from(0.5));
    out.insert("liquidity_condition".to_string(), Value::from("NORMAL"));
    if is_crypto {
        out.insert("dollar_strength".to_string(), Value::from("NEUTRAL"));
    } else {
        out.insert("health_concern_level".to_string(), Value::from("MEDIUM"));
    }
    out.insert("sector_headwind_score".to_string(), Value::from(0.0));
    out.insert("confidence_score".to_string(), Value::from(0.5));
    out
}

#[async_trait]
impl Agent for MacroAgent {
    fn name(&self) -> &'static str {
        "macro"
    }

    async fn process(
        &self,
        state: &DecisionState,
        cohort: Option<&str>,
    ) -> Result<StateUpdate, AgentError> {
        let mut update = StateUpdate::default();
        let is_crypto = self.ctx.profile.kind.is_crypto();
        let name = &self.ctx.profile.symbol;

        let rate = state
            .policy_rate
            .map(|r| r.to_string())
            .unwrap_or_else(|| "Unknown".to_string());
        let inflation = state
            .inflation_rate
            .map(|r| r.to_string())
            .unwrap_or_else(|| "Unknown".to_string());
        let health = state
            .health_indicator
            .map(|r| r.to_string())
            .unwrap_or_else(|| "Unknown".to_string());

        let (prompt, expected): (String, Vec<(&str, &str)>) = if is_crypto {
            (
                format!(
                    "Macro Economic Context for {name} (Cryptocurrency):\n\
                     - Global Interest Rates: {rate} (use as proxy for global rates)\n\
                     - Inflation Rate: {inflation}\n\
                     - Dollar Strength (DXY): Analyze impact of USD strength on crypto\n\
                     - Risk-On/Risk-Off Sentiment: Market risk appetite\n\
                     - Liquidity Conditions: Global liquidity and funding conditions\n\n\
                     Analyze the macro regime and its impact on {name} as a cryptocurrency.\n\
                     Focus on the global policy cycle, dollar correlation, risk regime shifts, \
                     and the inflation hedge narrative."
                ),
                vec![
                    ("macro_regime", "string (RISK_ON/RISK_OFF/MIXED)"),
                    ("policy_cycle", "string (TIGHTENING/EASING/NEUTRAL)"),
                    ("rate_cut_probability", "float (0-1)"),
                    ("rate_hike_probability", "float (0-1)"),
                    ("liquidity_condition", "string (EASY/NORMAL/TIGHT)"),
                    ("dollar_strength", "string (STRONG/NEUTRAL/WEAK)"),
                    (
                        "sector_headwind_score",
                        "float (-1 to +1) - negative = headwind, positive = tailwind",
                    ),
                    ("confidence_score", "float (0-1)"),
                ],
            )
        } else {
            (
                format!(
                    "Macro Economic Context:\n\
                     - Interest Rate: {rate}\n\
                     - Inflation Rate: {inflation}\n\
                     - Market Health Indicator: {health}\n\n\
                     Analyze the macro regime and its impact on {name}."
                ),
                vec![
                    ("macro_regime", "string (GROWTH/INFLATION/STRESS/MIXED)"),
                    ("policy_cycle", "string (TIGHTENING/EASING/NEUTRAL)"),
                    ("rate_cut_probability", "float (0-1)"),
                    ("rate_hike_probability", "float (0-1)"),
                    ("health_concern_level", "string (LOW/MEDIUM/HIGH)"),
                    ("liquidity_condition", "string (EASY/NORMAL/TIGHT)"),
                    ("sector_headwind_score", "float (-1 to +1)"),
                    ("confidence_score", "float (0-1)"),
                ],
            )
        };

        match self
            .ctx
            .structured_call(self.name(), cohort, prompt, &expected)
            .await
        {
            Ok(outcome) => {
                let mut output = outcome.output;
                if !outcome.complete {
                    for (k, v) in default_output(is_crypto) {
                        output.entry(k).or_insert(v);
                    }
                }
                let headwind =
                    num_field(&output, "sector_headwind_score", 0.0).clamp(-1.0, 1.0);
                output.insert("sector_headwind_score".to_string(), Value::from(headwind));

                let explanation = format!(
                    "Macro analysis: {} regime, {} policy cycle, headwind score {:.2}",
                    str_field(&output, "macro_regime", "UNKNOWN"),
                    str_field(&output, "policy_cycle", "UNKNOWN"),
                    headwind,
                );
                update.push_explanation(self.name(), explanation);
                update.macro_analysis = Some(output);
            }
            Err(e) if AgentContext::is_rate_limit_surface(&e) => {
                return Err(AgentError::RateLimited(e.to_string()));
            }
            Err(e) => {
                warn!(error = %e, "macro analysis failed (using defaults)");
                update.push_explanation(
                    self.name(),
                    "Macro analysis: MIXED regime (default - LLM unavailable), policy cycle: \
                     NEUTRAL, headwind score: 0.00",
                );
                update.macro_analysis = Some(default_output(is_crypto));
            }
        }

        Ok(update)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crypto_defaults_track_dollar_strength() {
        let out = default_output(true);
        assert_eq!(str_field(&out, "dollar_strength", ""), "NEUTRAL");
        assert!(!out.contains_key("health_concern_level"));
        assert_eq!(num_field(&out, "sector_headwind_score", 1.0), 0.0);
    }

    #[test]
    fn listed_defaults_track_market_health() {
        let out = default_output(false);
        assert_eq!(str_field(&out, "health_concern_level", ""), "MEDIUM");
        assert!(!out.contains_key("dollar_strength"));
    }
}
