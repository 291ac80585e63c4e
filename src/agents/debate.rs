// =============================================================================
// Bull / Bear Researcher Agents — the debate stage
// =============================================================================
//
// Both researchers read all four analysis slots and build the strongest
// one-sided case they can; the portfolio manager weighs the two conviction
// scores against each other. The two agents run in parallel as the "debate"
// cohort.
// =============================================================================

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use crate::agents::{clamp01, num_field, str_field, Agent, AgentContext, AgentError};
use crate::state::{DecisionState, StateUpdate};

/// Which side of the debate an instance argues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebateSide {
    Bull,
    Bear,
}

pub struct ResearcherAgent {
    ctx: AgentContext,
    side: DebateSide,
}

impl ResearcherAgent {
    pub fn bull(ctx: AgentContext) -> Self {
        Self {
            ctx,
            side: DebateSide::Bull,
        }
    }

    pub fn bear(ctx: AgentContext) -> Self {
        Self {
            ctx,
            side: DebateSide::Bear,
        }
    }

    fn build_prompt(&self, state: &DecisionState) -> String {
        let fundamental = &state.fundamental;
        let technical = &state.technical;
        let sentiment = &state.sentiment;
        let macro_a = &state.macro_analysis;

        let current_price = state.current_price;
        let (target, stop_loss, case_line) = match self.side {
            DebateSide::Bull => (
                current_price * 1.03,
                current_price * 0.985,
                "Build the strongest BULL CASE for why the price should go UP from here.",
            ),
            DebateSide::Bear => (
                current_price * 0.97,
                current_price * 1.015,
                "Build the strongest BEAR CASE for why the price should go DOWN from here.",
            ),
        };

        format!(
            "Given the analysis from all agents:\n\n\
             Fundamental Analysis:\n\
             - Asset Strength: {}\n\
             - Bullish Probability: {:.2}\n\
             - Bearish Probability: {:.2}\n\n\
             Technical Analysis:\n\
             - Trend: {} ({:.0}% strength)\n\
             - RSI Status: {}\n\
             - Support Level: {}\n\
             - Resistance Level: {}\n\n\
             Sentiment Analysis:\n\
             - Retail Sentiment: {:.2}\n\
             - Institutional Sentiment: {:.2}\n\n\
             Macro Analysis:\n\
             - Macro Regime: {}\n\
             - Policy Cycle: {}\n\
             - Sector Headwind Score: {:.2}\n\n\
             Current Price: {current_price}\n\
             Target: {target:.2}\n\
             Stop Loss: {stop_loss:.2}\n\n\
             {case_line}",
            str_field(fundamental, "asset_strength", "UNKNOWN"),
            num_field(fundamental, "bullish_probability", 0.5),
            num_field(fundamental, "bearish_probability", 0.5),
            str_field(technical, "trend_direction", "UNKNOWN"),
            num_field(technical, "trend_strength", 0.0),
            str_field(technical, "rsi_status", "NEUTRAL"),
            technical
                .get("support_level")
                .cloned()
                .unwrap_or(Value::Null),
            technical
                .get("resistance_level")
                .cloned()
                .unwrap_or(Value::Null),
            num_field(sentiment, "retail_sentiment", 0.0),
            num_field(sentiment, "institutional_sentiment", 0.0),
            str_field(macro_a, "macro_regime", "UNKNOWN"),
            str_field(macro_a, "policy_cycle", "UNKNOWN"),
            num_field(macro_a, "sector_headwind_score", 0.0),
        )
    }
}

#[async_trait]
impl Agent for ResearcherAgent {
    fn name(&self) -> &'static str {
        match self.side {
            DebateSide::Bull => "bull",
            DebateSide::Bear => "bear",
        }
    }

    async fn process(
        &self,
        state: &DecisionState,
        cohort: Option<&str>,
    ) -> Result<StateUpdate, AgentError> {
        let mut update = StateUpdate::default();
        let prompt = self.build_prompt(state);

        let (thesis_key, probability_key) = match self.side {
            DebateSide::Bull => ("bull_thesis", "upside_probability"),
            DebateSide::Bear => ("bear_thesis", "downside_probability"),
        };

        let expected = [
            (thesis_key, "string"),
            ("key_drivers", "array of strings"),
            (probability_key, "float (0-1)"),
            ("key_risks", "array of strings"),
            ("conviction_score", "float (0-1)"),
        ];

        match self
            .ctx
            .structured_call(self.name(), cohort, prompt, &expected)
            .await
        {
            Ok(outcome) => {
                let thesis = str_field(&outcome.output, thesis_key, "").to_string();
                let conviction = clamp01(num_field(&outcome.output, "conviction_score", 0.5));
                let probability = clamp01(num_field(&outcome.output, probability_key, 0.5));

                let explanation = format!(
                    "{} thesis: {conviction:.2} conviction, {probability_key}: {probability:.2}",
                    self.name()
                );
                update.push_explanation(self.name(), explanation);

                match self.side {
                    DebateSide::Bull => {
                        update.bull_thesis = Some(thesis);
                        update.bull_confidence = Some(conviction);
                    }
                    DebateSide::Bear => {
                        update.bear_thesis = Some(thesis);
                        update.bear_confidence = Some(conviction);
                    }
                }
            }
            Err(e) if AgentContext::is_rate_limit_surface(&e) => {
                return Err(AgentError::RateLimited(e.to_string()));
            }
            Err(e) => {
                warn!(side = self.name(), error = %e, "research failed (using defaults)");
                let thesis = "Analysis unavailable - using default neutral stance".to_string();
                update.push_explanation(
                    self.name(),
                    format!(
                        "{} thesis: 0.50 conviction (default - LLM unavailable)",
                        self.name()
                    ),
                );
                match self.side {
                    DebateSide::Bull => {
                        update.bull_thesis = Some(thesis);
                        update.bull_confidence = Some(0.5);
                    }
                    DebateSide::Bear => {
                        update.bear_thesis = Some(thesis);
                        update.bear_confidence = Some(0.5);
                    }
                }
            }
        }

        Ok(update)
    }
}
