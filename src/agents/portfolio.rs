// =============================================================================
// Portfolio Manager Agent — final decision maker
// =============================================================================
//
// Synthesis pipeline:
//   1. Weighted bullish/bearish scores over the four analyses + debate
//      (technical 30%, fundamental 25%, sentiment 15%, macro 15%, debate 15%).
//   2. Trend signal from the score gap.
//   3. Volatility-adaptive thresholds produce a tiered signal with a size
//      modifier.
//   4. Base/bull/bear scenario paths for the next 15-60 minutes.
//   5. Execution gate on BUY: an LLM veto head (EXECUTE/REDUCE/HOLD, default
//      EXECUTE on parse failure) followed by a deterministic backstop.
//
// The full output object lands both in the explanation stream and in
// `decision_audit_trail["portfolio_manager_output"]` so it survives
// downstream state copies.
// =============================================================================

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::agents::{num_field, str_field, Agent, AgentContext, AgentError};
use crate::state::{DecisionState, StateUpdate};
use crate::types::{Signal, SignalStrength, TrendSignal};

/// Minimum score gap before the trend signal leaves NEUTRAL.
const TREND_THRESHOLD: f64 = 0.15;

/// Backstop limits applied after the LLM veto.
const BEAR_PROB_BACKSTOP: f64 = 0.45;
const MIN_BULL_UPSIDE: f64 = 0.0025; // 0.25%

pub struct PortfolioManagerAgent {
    ctx: AgentContext,
}

impl PortfolioManagerAgent {
    pub fn new(ctx: AgentContext) -> Self {
        Self { ctx }
    }
}

// ---------------------------------------------------------------------------
// Scoring (pure, unit-tested)
// ---------------------------------------------------------------------------

/// Weighted bullish/bearish scores over all prior slots.
pub fn compute_scores(state: &DecisionState) -> (f64, f64) {
    let mut bullish: f64 = 0.0;
    let mut bearish: f64 = 0.0;

    // Technical (30%): trend direction scaled by strength.
    let trend = str_field(&state.technical, "trend_direction", "SIDEWAYS");
    let strength = num_field(&state.technical, "trend_strength", 50.0) / 100.0;
    match trend {
        "UP" => bullish += 0.30 * strength,
        "DOWN" => bearish += 0.30 * strength,
        _ => {}
    }

    // Fundamental (25%).
    bullish += 0.25 * num_field(&state.fundamental, "bullish_probability", 0.5);
    bearish += 0.25 * num_field(&state.fundamental, "bearish_probability", 0.5);

    // Sentiment (15%): signed retail sentiment.
    let retail = num_field(&state.sentiment, "retail_sentiment", 0.0);
    if retail > 0.0 {
        bullish += 0.15 * retail;
    } else {
        bearish += 0.15 * retail.abs();
    }

    // Macro (15%): signed headwind score.
    let headwind = num_field(&state.macro_analysis, "sector_headwind_score", 0.0);
    if headwind > 0.0 {
        bullish += 0.15 * headwind;
    } else {
        bearish += 0.15 * headwind.abs();
    }

    // Debate (15%).
    bullish += 0.15 * state.bull_confidence;
    bearish += 0.15 * state.bear_confidence;

    (bullish, bearish)
}

/// Trend signal from the score gap.
pub fn trend_from_scores(bullish: f64, bearish: f64) -> TrendSignal {
    if bullish - bearish > TREND_THRESHOLD {
        TrendSignal::Bullish
    } else if bearish - bullish > TREND_THRESHOLD {
        TrendSignal::Bearish
    } else {
        TrendSignal::Neutral
    }
}

/// Volatility factor from recent ATR relative to price: high volatility
/// raises thresholds (more conservative), low volatility lowers them.
pub fn volatility_factor(atr: Option<f64>, current_price: f64) -> f64 {
    match atr {
        Some(atr) if current_price > 0.0 => {
            let atr_pct = atr / current_price * 100.0;
            if atr_pct > 2.0 {
                1.15
            } else if atr_pct < 0.5 {
                0.9
            } else {
                1.0
            }
        }
        _ => 1.0,
    }
}

/// A tiered decision before gating.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TieredDecision {
    pub signal: Signal,
    pub strength: SignalStrength,
    /// Applied to the risk recommendation's position size.
    pub size_multiplier: f64,
}

/// Tiered signal generation with volatility-adaptive thresholds.
pub fn decide(bullish: f64, bearish: f64, volatility_factor: f64) -> TieredDecision {
    let strong = 0.70 * volatility_factor;
    let moderate = 0.60 * volatility_factor;
    let weak = 0.55 * volatility_factor;
    let opposite = 0.35 / volatility_factor;

    if bullish > strong && bearish < opposite {
        TieredDecision {
            signal: Signal::Buy,
            strength: SignalStrength::StrongBuy,
            size_multiplier: 1.0,
        }
    } else if bullish > moderate && bearish < (1.0 - moderate) {
        TieredDecision {
            signal: Signal::Buy,
            strength: SignalStrength::Buy,
            size_multiplier: 1.0,
        }
    } else if bullish > weak && bearish < (1.0 - weak) {
        TieredDecision {
            signal: Signal::Buy,
            strength: SignalStrength::WeakBuy,
            size_multiplier: 0.7,
        }
    } else if bearish > strong && bullish < opposite {
        TieredDecision {
            signal: Signal::Sell,
            strength: SignalStrength::StrongSell,
            size_multiplier: 1.0,
        }
    } else if bearish > moderate && bullish < (1.0 - moderate) {
        TieredDecision {
            signal: Signal::Sell,
            strength: SignalStrength::Sell,
            size_multiplier: 1.0,
        }
    } else if bearish > weak && bullish < (1.0 - weak) {
        TieredDecision {
            signal: Signal::Sell,
            strength: SignalStrength::WeakSell,
            size_multiplier: 0.7,
        }
    } else {
        TieredDecision {
            signal: Signal::Hold,
            strength: SignalStrength::Neutral,
            size_multiplier: 0.0,
        }
    }
}

// ---------------------------------------------------------------------------
// Scenario paths (pure, unit-tested)
// ---------------------------------------------------------------------------

/// Base/bull/bear forward paths for the next 15-60 minutes.
///
/// Coherence: the bull 15-minute target never sits below the current price
/// and the bear 15-minute target never above it, whatever the support and
/// resistance levels read.
pub fn generate_scenarios(state: &DecisionState) -> Value {
    let price = state.current_price;
    let technical = &state.technical;
    let fundamental = &state.fundamental;

    let support = num_field(technical, "support_level", price * 0.98);
    let resistance = num_field(technical, "resistance_level", price * 1.02);
    let atr = num_field(technical, "atr", price * 0.01);
    let trend = str_field(technical, "trend_direction", "SIDEWAYS");

    let (base_target, base_probability, base_drift) = match trend {
        "UP" => (price * 1.005, 0.5, 1.01),
        "DOWN" => (price * 0.995, 0.5, 0.99),
        _ => (price, 0.6, 1.0),
    };

    let bull_target_15m = resistance.min(price * 1.01).max(price);
    let bull_target_60m = (resistance * 1.005).max(bull_target_15m);
    let bull_probability = (state.bull_confidence * 0.8).clamp(0.0, 1.0);

    let bear_target_15m = support.max(price * 0.99).min(price);
    let bear_target_60m = (support * 0.995).min(bear_target_15m);
    let bear_probability = (state.bear_confidence * 0.8).clamp(0.0, 1.0);

    let catalysts = |key: &str, fallback: [&str; 2]| -> Vec<String> {
        let from_fundamental: Vec<String> = fundamental
            .get(key)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .take(2)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        if from_fundamental.is_empty() {
            fallback.iter().map(|s| s.to_string()).collect()
        } else {
            from_fundamental
        }
    };

    let clip = |text: &str, max: usize| -> String {
        if text.len() <= max {
            text.to_string()
        } else {
            let mut end = max;
            while !text.is_char_boundary(end) {
                end -= 1;
            }
            text[..end].to_string()
        }
    };

    json!({
        "base_case": {
            "scenario": "Base Case",
            "description": format!("Continuation of {trend} trend"),
            "target_15m": base_target,
            "target_60m": base_target * base_drift,
            "probability": base_probability,
            "key_levels": [price, base_target],
            "catalysts": [format!("{trend} technical trend"), "Current momentum"],
        },
        "bull_case": {
            "scenario": "Bull Case",
            "description": if state.bull_thesis.is_empty() {
                "Bullish breakout scenario".to_string()
            } else {
                clip(&state.bull_thesis, 150)
            },
            "target_15m": bull_target_15m,
            "target_60m": bull_target_60m,
            "probability": bull_probability,
            "key_levels": [price, resistance, bull_target_60m],
            "catalysts": catalysts("key_catalysts", ["Bullish momentum", "Positive sentiment"]),
        },
        "bear_case": {
            "scenario": "Bear Case",
            "description": if state.bear_thesis.is_empty() {
                "Bearish breakdown scenario".to_string()
            } else {
                clip(&state.bear_thesis, 150)
            },
            "target_15m": bear_target_15m,
            "target_60m": bear_target_60m,
            "probability": bear_probability,
            "key_levels": [price, support, bear_target_60m],
            "catalysts": catalysts("key_risk_factors", ["Bearish pressure", "Negative sentiment"]),
        },
        "volatility_range": {
            "atr": atr,
            "expected_range_15m": [price - atr * 0.5, price + atr * 0.5],
            "expected_range_60m": [price - atr * 1.5, price + atr * 1.5],
        },
    })
}

// ---------------------------------------------------------------------------
// Execution gate (backstop is pure and unit-tested)
// ---------------------------------------------------------------------------

/// Result of gating a BUY decision.
#[derive(Debug, Clone)]
pub struct GatedDecision {
    pub signal: Signal,
    pub strength: SignalStrength,
    pub position_size: f64,
    pub gating_reasons: Vec<String>,
}

/// Deterministic safety net applied after the LLM veto.
pub fn apply_backstop(
    mut signal: Signal,
    mut strength: SignalStrength,
    mut position_size: f64,
    scenarios: &Value,
    entry_price: f64,
    mut gating_reasons: Vec<String>,
) -> GatedDecision {
    let bear_prob = scenarios["bear_case"]["probability"].as_f64().unwrap_or(0.0);
    if signal == Signal::Buy && bear_prob > BEAR_PROB_BACKSTOP {
        gating_reasons.push(format!(
            "Backstop HOLD: bear_case.probability={bear_prob:.2} > {BEAR_PROB_BACKSTOP:.2}"
        ));
        signal = Signal::Hold;
        strength = SignalStrength::FilteredHold;
        position_size = 0.0;
    }

    if signal == Signal::Buy && entry_price > 0.0 {
        if let Some(bull_target) = scenarios["bull_case"]["target_15m"].as_f64() {
            let upside_pct = (bull_target - entry_price) / entry_price;
            if upside_pct < MIN_BULL_UPSIDE {
                gating_reasons.push(format!(
                    "Backstop HOLD: bull_case 15m upside={upside_pct:.4} < {MIN_BULL_UPSIDE:.4}"
                ));
                signal = Signal::Hold;
                strength = SignalStrength::FilteredHold;
                position_size = 0.0;
            }
        }
    }

    GatedDecision {
        signal,
        strength,
        position_size,
        gating_reasons,
    }
}

impl PortfolioManagerAgent {
    /// LLM veto head: EXECUTE / REDUCE / HOLD with a reason. Defaults to
    /// EXECUTE on any failure so the gate can only tighten, never loosen.
    async fn llm_execution_veto(
        &self,
        scenarios: &Value,
        bullish: f64,
        bearish: f64,
        entry_price: f64,
        environment_bias: &str,
    ) -> (String, String) {
        let prompt = format!(
            "You are the portfolio risk co-pilot. Decide if we should EXECUTE, REDUCE, or HOLD \
             a BUY based on forward scenarios.\n\n\
             Inputs:\n\
             - Environment bias: {environment_bias}\n\
             - Bullish score: {bullish:.2}\n\
             - Bearish score: {bearish:.2}\n\
             - Planned entry price: {entry_price}\n\n\
             Scenario paths:\n\
             BASE: prob={} target15m={} target60m={}\n\
             BULL: prob={} target15m={} target60m={}\n\
             BEAR: prob={} target15m={} target60m={}\n\n\
             Rules of thumb (be concise):\n\
             - If bear prob is high (>0.45) or upside is tiny (<0.25%), prefer HOLD.\n\
             - If upside is modest (0.25%-0.60%) or bear prob is moderate (0.35-0.45), pick REDUCE.\n\
             - Otherwise EXECUTE.",
            scenarios["base_case"]["probability"],
            scenarios["base_case"]["target_15m"],
            scenarios["base_case"]["target_60m"],
            scenarios["bull_case"]["probability"],
            scenarios["bull_case"]["target_15m"],
            scenarios["bull_case"]["target_60m"],
            scenarios["bear_case"]["probability"],
            scenarios["bear_case"]["target_15m"],
            scenarios["bear_case"]["target_60m"],
        );

        let expected = [("decision", "EXECUTE|REDUCE|HOLD"), ("reason", "string")];
        match self
            .ctx
            .structured_call("portfolio_manager", None, prompt, &expected)
            .await
        {
            Ok(outcome) => {
                let decision = str_field(&outcome.output, "decision", "EXECUTE").to_uppercase();
                let reason = str_field(&outcome.output, "reason", "LLM provided").to_string();
                if matches!(decision.as_str(), "EXECUTE" | "REDUCE" | "HOLD") {
                    (decision, reason)
                } else {
                    ("EXECUTE".to_string(), "LLM returned unknown verdict".to_string())
                }
            }
            Err(e) => {
                debug!(error = %e, "LLM veto failed; defaulting to EXECUTE");
                ("EXECUTE".to_string(), "LLM error".to_string())
            }
        }
    }

    /// Executive summary over the whole synthesis; falls back to a compact
    /// line when the LLM is unavailable.
    async fn executive_summary(
        &self,
        state: &DecisionState,
        signal: Signal,
        strength: SignalStrength,
        trend: TrendSignal,
        bullish: f64,
        bearish: f64,
        position_size: f64,
        entry_price: f64,
        stop_loss: f64,
        take_profit: f64,
    ) -> String {
        let fallback = format!(
            "{signal} signal ({strength}) based on {trend} trend. Bullish score: {bullish:.2}, \
             Bearish: {bearish:.2}. Position size: {position_size}."
        );

        let prompt = format!(
            "You are a Portfolio Manager synthesizing multi-agent trading analysis for {}.\n\n\
             Current Price: {entry_price:.2}\n\
             Market Trend: {trend}\n\
             Bullish Score: {bullish:.2} | Bearish Score: {bearish:.2}\n\
             Technical Trend: {} | RSI: {:.1}\n\
             Fundamental Strength: {}\n\
             Retail Sentiment: {:.2}\n\
             Macro Regime: {}\n\
             Decision: {signal} ({strength})\n\
             Position Size: {position_size} | Entry: {entry_price:.2} | Stop: {stop_loss:.2} | \
             Target: {take_profit:.2}\n\n\
             Write a concise, actionable executive summary (3-4 sentences) that states the \
             decision and conviction, highlights the 2-3 most critical driving factors, and \
             gives clear risk/reward context. Professional trader language; be direct.",
            self.ctx.profile.symbol,
            str_field(&state.technical, "trend_direction", "UNKNOWN"),
            num_field(&state.technical, "rsi", 50.0),
            str_field(&state.fundamental, "asset_strength", "UNKNOWN"),
            num_field(&state.sentiment, "retail_sentiment", 0.0),
            str_field(&state.macro_analysis, "macro_regime", "UNKNOWN"),
        );

        match self
            .ctx
            .chat("portfolio_manager", None, prompt, Some(0.7))
            .await
        {
            Ok(text) if text.trim().len() > 20 => {
                let mut text = text.trim().to_string();
                if text.len() > 900 {
                    let mut end = 900;
                    while !text.is_char_boundary(end) {
                        end -= 1;
                    }
                    text = format!("{}...", &text[..end]);
                }
                text
            }
            Ok(_) => fallback,
            Err(e) => {
                warn!(error = %e, "executive summary generation failed");
                fallback
            }
        }
    }

    /// Adaptive strategy block attached to the audit trail: entry/exit
    /// conditions plus rules for reacting to regime shifts mid-window.
    fn adaptive_strategy(
        &self,
        state: &DecisionState,
        signal: Signal,
        strength: SignalStrength,
        bullish: f64,
        bearish: f64,
        position_size: f64,
        entry_price: f64,
        stop_loss: f64,
        take_profit: f64,
    ) -> Value {
        let trend = str_field(&state.technical, "trend_direction", "SIDEWAYS");
        let trend_strength = num_field(&state.technical, "trend_strength", 0.0) / 100.0;
        let macro_regime = str_field(&state.macro_analysis, "macro_regime", "MIXED");

        let mut entry_conditions = Vec::new();
        if signal != Signal::Hold {
            let (near, far) = (entry_price * 0.995, entry_price * 1.005);
            entry_conditions.push(json!({"type": "price_above", "value": near, "timeframe": "1m"}));
            entry_conditions.push(json!({"type": "price_below", "value": far, "timeframe": "1m"}));
            if state.technical.contains_key("rsi") {
                let (lo, hi) = if signal == Signal::Buy { (40, 70) } else { (30, 60) };
                entry_conditions
                    .push(json!({"type": "rsi_between", "min": lo, "max": hi, "timeframe": "5m"}));
            }
            entry_conditions.push(json!({
                "type": "multi_timeframe_confluence",
                "timeframes": ["5m", "15m"],
                "condition": format!("both_trending_{}", trend.to_lowercase()),
            }));
        }

        let timeframe_entry = |use_for: &str| {
            json!({"trend": trend, "strength": trend_strength, "use": use_for})
        };

        json!({
            "strategy_id": format!("adaptive_{}", chrono::Utc::now().format("%Y%m%d_%H%M%S")),
            "type": "ADAPTIVE",
            "market_regime": {
                "current": macro_regime,
                "confidence": (bullish + bearish) / 2.0,
                "trend": trend,
            },
            "multi_timeframe_analysis": {
                "1m": timeframe_entry("ENTRY_TIMING"),
                "5m": timeframe_entry("SHORT_TERM"),
                "15m": timeframe_entry("MEDIUM_TERM"),
            },
            "entry_conditions": entry_conditions,
            "exit_conditions": {
                "stop_loss": stop_loss,
                "take_profit": [take_profit],
                "trailing_stop": false,
            },
            "position_sizing": {
                "base_size": position_size,
                "risk_pct": if entry_price > 0.0 {
                    ((entry_price - stop_loss) / entry_price * 100.0).abs()
                } else {
                    2.0
                },
                "max_positions": 2,
            },
            "adaptive_rules": [
                {
                    "trigger": "regime_transition_detected",
                    "action": "reduce_position_size",
                    "new_size_pct": 0.5,
                },
                {
                    "trigger": "volume_spike",
                    "action": "increase_conviction",
                    "confidence_boost": 0.1,
                },
                {
                    "trigger": "stop_loss_hit",
                    "action": "review_entry_conditions",
                    "update_frequency": "immediate",
                },
            ],
            "agent_reasoning": {
                "bullish_score": bullish,
                "bearish_score": bearish,
                "signal_strength": strength.to_string(),
                "entry_price": entry_price,
            },
        })
    }
}

#[async_trait]
impl Agent for PortfolioManagerAgent {
    fn name(&self) -> &'static str {
        "portfolio_manager"
    }

    async fn process(
        &self,
        state: &DecisionState,
        _cohort: Option<&str>,
    ) -> Result<StateUpdate, AgentError> {
        let mut update = StateUpdate::default();
        let current_price = state.current_price;

        // --- 1. Scores and trend -------------------------------------------
        let (bullish, bearish) = compute_scores(state);
        let trend = trend_from_scores(bullish, bearish);
        let environment_bias = if bullish - bearish > 0.05 {
            "BULLISH"
        } else if bearish - bullish > 0.05 {
            "BEARISH"
        } else {
            "NEUTRAL"
        };

        // --- 2. Tiered decision with adaptive thresholds -------------------
        let atr = state.technical.get("atr").and_then(Value::as_f64);
        let vf = volatility_factor(atr, current_price);
        let tier = decide(bullish, bearish, vf);

        // --- 3. Sizing and levels from the neutral risk slot ---------------
        let risk_rec = if !state.neutral_risk.is_empty() {
            &state.neutral_risk
        } else {
            &state.aggressive_risk
        };
        let base_size = num_field(risk_rec, "position_size", 0.0);
        let mut position_size = (base_size * tier.size_multiplier).floor();
        let mut signal = tier.signal;
        let mut strength = tier.strength;
        let entry_price = current_price;

        let weak = matches!(
            strength,
            SignalStrength::WeakBuy | SignalStrength::WeakSell
        );
        let target_pct = if weak { 0.02 } else { 0.03 };
        let (mut stop_loss, mut take_profit) = match signal {
            Signal::Buy => (
                {
                    let rec = num_field(risk_rec, "stop_loss_price", 0.0);
                    if rec > 0.0 && rec < current_price {
                        rec
                    } else {
                        current_price * 0.985
                    }
                },
                current_price * (1.0 + target_pct),
            ),
            Signal::Sell => (
                current_price * 1.015,
                current_price * (1.0 - target_pct),
            ),
            _ => (current_price, current_price),
        };
        if signal == Signal::Hold {
            position_size = 0.0;
        }

        // --- 4. Scenario paths ---------------------------------------------
        let scenarios = generate_scenarios(state);

        // --- 5. Execution gate (LLM veto, then deterministic backstop) -----
        let mut gating_reasons = Vec::new();
        if signal == Signal::Buy {
            let (decision, reason) = self
                .llm_execution_veto(&scenarios, bullish, bearish, entry_price, environment_bias)
                .await;
            match decision.as_str() {
                "HOLD" => {
                    gating_reasons.push(format!("LLM veto -> HOLD: {reason}"));
                    signal = Signal::Hold;
                    strength = SignalStrength::FilteredHold;
                    position_size = 0.0;
                }
                "REDUCE" => {
                    gating_reasons.push(format!("LLM veto -> REDUCE: {reason}"));
                    position_size = (position_size * 0.5).floor();
                }
                _ => {}
            }

            let gated = apply_backstop(
                signal,
                strength,
                position_size,
                &scenarios,
                entry_price,
                gating_reasons,
            );
            signal = gated.signal;
            strength = gated.strength;
            position_size = gated.position_size;
            gating_reasons = gated.gating_reasons;
        }

        // An executable signal without size is not executable.
        if signal != Signal::Hold && position_size <= 0.0 {
            gating_reasons.push("no position size available".to_string());
            signal = Signal::Hold;
            strength = SignalStrength::FilteredHold;
        }

        if signal == Signal::Hold {
            position_size = 0.0;
            stop_loss = current_price;
            take_profit = current_price;
        }

        // --- 6. Output object, audit trail, explanation --------------------
        let adaptive = self.adaptive_strategy(
            state,
            signal,
            strength,
            bullish,
            bearish,
            position_size,
            entry_price,
            stop_loss,
            take_profit,
        );

        let summary = self
            .executive_summary(
                state,
                signal,
                strength,
                trend,
                bullish,
                bearish,
                position_size,
                entry_price,
                stop_loss,
                take_profit,
            )
            .await;

        let mut output = Map::new();
        output.insert("signal".to_string(), json!(signal));
        output.insert("trend_signal".to_string(), json!(trend));
        output.insert("signal_strength".to_string(), json!(strength));
        output.insert("adaptive_strategy".to_string(), adaptive);
        output.insert("scenario_paths".to_string(), scenarios);
        output.insert("gating_reasons".to_string(), json!(gating_reasons));
        output.insert("bullish_score".to_string(), json!(bullish));
        output.insert("bearish_score".to_string(), json!(bearish));
        output.insert("environment_bias".to_string(), json!(environment_bias));
        output.insert("time_horizon".to_string(), json!("INTRADAY_15M"));
        output.insert("position_size".to_string(), json!(position_size));
        output.insert("entry_price".to_string(), json!(entry_price));
        output.insert("stop_loss".to_string(), json!(stop_loss));
        output.insert("take_profit".to_string(), json!(take_profit));
        output.insert("risk_recommendation_used".to_string(), json!("neutral"));
        output.insert("volatility_factor".to_string(), json!(vf));
        output.insert("executive_summary".to_string(), json!(summary));

        update.audit_trail.insert(
            "portfolio_manager_output".to_string(),
            Value::Object(output),
        );
        update
            .audit_trail
            .insert("executive_summary".to_string(), json!(summary));

        let explanation = format!(
            "Portfolio decision: {signal} ({strength}), trend {trend}, bullish_score={bullish:.2}, \
             bearish_score={bearish:.2}, size={position_size}, volatility_factor={vf:.2}"
        );
        update.push_explanation(self.name(), explanation);

        info!(
            signal = %signal,
            strength = %strength,
            trend = %trend,
            bullish = format!("{bullish:.3}"),
            bearish = format!("{bearish:.3}"),
            position_size,
            "portfolio decision made"
        );

        update.final_signal = Some(signal);
        update.trend_signal = Some(trend);
        update.position_size = Some(position_size);
        update.entry_price = Some(entry_price);
        update.stop_loss = Some(stop_loss);
        update.take_profit = Some(take_profit);

        Ok(update)
    }
}
