// =============================================================================
// Technical Analysis Agent — indicators first, LLM for pattern judgment
// =============================================================================
//
// Deterministic indicators (RSI, ATR, support/resistance, SMA trend) are
// computed locally and always win over LLM output for overlapping keys; the
// LLM contributes only the pattern-recognition layer that cannot be
// computed programmatically.
// =============================================================================

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::warn;

use crate::agents::{Agent, AgentContext, AgentError};
use crate::indicators::atr::{calculate_atr, calculate_atr_pct};
use crate::indicators::rsi::latest_rsi;
use crate::indicators::{sma, support_resistance};
use crate::market::Candle;
use crate::state::{DecisionState, StateUpdate};

pub struct TechnicalAgent {
    ctx: AgentContext,
}

impl TechnicalAgent {
    pub fn new(ctx: AgentContext) -> Self {
        Self { ctx }
    }

    /// Compute the deterministic indicator block from OHLC data.
    fn calculate_indicators(candles: &[Candle], current_price: f64) -> Map<String, Value> {
        let mut out = Map::new();
        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();

        if let Some(rsi) = latest_rsi(&closes, 14) {
            out.insert("rsi".to_string(), Value::from(rsi));
            let status = if rsi < 30.0 {
                "OVERSOLD"
            } else if rsi > 70.0 {
                "OVERBOUGHT"
            } else {
                "NEUTRAL"
            };
            out.insert("rsi_status".to_string(), Value::from(status));
        }

        if let Some(atr) = calculate_atr(candles, 14) {
            out.insert("atr".to_string(), Value::from(atr));
        }
        if let Some(atr_pct) = calculate_atr_pct(candles, 14) {
            let level = if atr_pct > 2.0 {
                "HIGH"
            } else if atr_pct < 1.0 {
                "LOW"
            } else {
                "MEDIUM"
            };
            out.insert("volatility_level".to_string(), Value::from(level));
        }

        if let Some((support, resistance)) = support_resistance(candles, 20) {
            out.insert("support_level".to_string(), Value::from(support));
            out.insert("resistance_level".to_string(), Value::from(resistance));
        }

        // Trend from SMA20 vs SMA50 alignment.
        let sma_20 = sma(&closes, 20);
        let sma_50 = sma(&closes, 50).or(sma_20);
        match (sma_20, sma_50) {
            (Some(s20), Some(s50)) if current_price > s20 && s20 > s50 => {
                out.insert("trend_direction".to_string(), Value::from("UP"));
                let strength = (((current_price - s20) / s20 * 100.0) * 2.0).min(100.0);
                out.insert("trend_strength".to_string(), Value::from(strength));
            }
            (Some(s20), Some(s50)) if current_price < s20 && s20 < s50 => {
                out.insert("trend_direction".to_string(), Value::from("DOWN"));
                let strength = (((s20 - current_price) / current_price * 100.0) * 2.0).min(100.0);
                out.insert("trend_strength".to_string(), Value::from(strength));
            }
            _ => {
                out.insert("trend_direction".to_string(), Value::from("SIDEWAYS"));
                out.insert("trend_strength".to_string(), Value::from(30.0));
            }
        }

        out
    }
}

#[async_trait]
impl Agent for TechnicalAgent {
    fn name(&self) -> &'static str {
        "technical"
    }

    async fn process(
        &self,
        state: &DecisionState,
        cohort: Option<&str>,
    ) -> Result<StateUpdate, AgentError> {
        let mut update = StateUpdate::default();
        let candles = state.analysis_candles();

        if candles.is_empty() {
            let mut output = Map::new();
            output.insert("error".to_string(), Value::from("INSUFFICIENT_DATA"));
            output.insert("confidence_score".to_string(), Value::from(0.0));
            update.technical = Some(output);
            update.push_explanation(self.name(), "No OHLC data available");
            return Ok(update);
        }

        let current_price = if state.current_price > 0.0 {
            state.current_price
        } else {
            candles.last().map(|c| c.close).unwrap_or(0.0)
        };

        let mut output = Self::calculate_indicators(candles, current_price);

        let prompt = format!(
            "Current Price: {current_price}\n\
             OHLC data: {} candles\n\
             Technical Indicators:\n\
             - RSI: {}\n\
             - ATR: {}\n\
             - Support Level: {}\n\
             - Resistance Level: {}\n\
             - Trend: {} ({}% strength)\n\n\
             Analyze the chart patterns and provide your assessment.",
            candles.len(),
            output.get("rsi").cloned().unwrap_or(Value::Null),
            output.get("atr").cloned().unwrap_or(Value::Null),
            output.get("support_level").cloned().unwrap_or(Value::Null),
            output.get("resistance_level").cloned().unwrap_or(Value::Null),
            output
                .get("trend_direction")
                .and_then(Value::as_str)
                .unwrap_or("UNKNOWN"),
            output
                .get("trend_strength")
                .and_then(Value::as_f64)
                .unwrap_or(0.0),
        );

        let expected = [
            ("reversal_pattern", "string or null"),
            ("continuation_pattern", "string or null"),
            ("candlestick_pattern", "string or null"),
            ("volume_confirmation", "boolean"),
            ("divergence_detected", "boolean"),
            ("divergence_type", "string"),
            ("confidence_score", "float (0-1)"),
        ];

        match self
            .ctx
            .structured_call(self.name(), cohort, prompt, &expected)
            .await
        {
            Ok(outcome) => {
                // Pattern keys only; computed indicators are authoritative.
                for (key, value) in outcome.output {
                    output.entry(key).or_insert(value);
                }
            }
            Err(e) if AgentContext::is_rate_limit_surface(&e) => {
                return Err(AgentError::RateLimited(e.to_string()));
            }
            Err(e) => {
                warn!(error = %e, "pattern recognition failed; using calculated indicators only");
                output
                    .entry("confidence_score".to_string())
                    .or_insert(Value::from(0.7));
            }
        }

        let explanation = format!(
            "Technical analysis: {} trend, RSI {}, confidence {:.2}",
            output
                .get("trend_direction")
                .and_then(Value::as_str)
                .unwrap_or("UNKNOWN"),
            output
                .get("rsi_status")
                .and_then(Value::as_str)
                .unwrap_or("NEUTRAL"),
            output
                .get("confidence_score")
                .and_then(Value::as_f64)
                .unwrap_or(0.0),
        );
        update.push_explanation(self.name(), explanation);
        update.technical = Some(output);
        Ok(update)
    }
}
