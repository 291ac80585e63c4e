// =============================================================================
// Strategy Planner — predictive rule generation on the Strategic tick
// =============================================================================
//
// Builds a market-context prompt (price, OHLC, RSI(5), support/resistance,
// derivatives data), asks the provider manager for a structured rule set
// mixing CURRENT and FUTURE scenarios, validates each rule, and publishes
// the bundle to the key-value cache with a TTL equal to its remaining
// validity. The rule engine picks it up from there; the planner never talks
// to the broker.
// =============================================================================

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::agents::AgentContext;
use crate::cache::{self, KeyValueCache, RULE_BUNDLE_KEY};
use crate::indicators::{rsi::latest_rsi, support_resistance};
use crate::market::{DerivativesFeed, MarketDataFeed, Timeframe};
use crate::rules::{Condition, Rule, RuleBundle};
use crate::types::{Scenario, TradeDirection};

/// Extra validity granted beyond the strategic cadence.
const VALIDITY_SLACK_MINUTES: i64 = 5;

pub struct StrategyPlanner {
    ctx: AgentContext,
    market: Arc<dyn MarketDataFeed>,
    derivatives: Option<Arc<dyn DerivativesFeed>>,
    cache: Arc<dyn KeyValueCache>,
    cadence_minutes: u64,
}

impl StrategyPlanner {
    pub fn new(
        ctx: AgentContext,
        market: Arc<dyn MarketDataFeed>,
        derivatives: Option<Arc<dyn DerivativesFeed>>,
        cache: Arc<dyn KeyValueCache>,
        cadence_minutes: u64,
    ) -> Self {
        Self {
            ctx,
            market,
            derivatives,
            cache,
            cadence_minutes,
        }
    }

    /// Generate a fresh rule bundle and publish it to the cache.
    pub async fn generate_rules(&self) -> Option<RuleBundle> {
        let prompt = self.build_prompt().await;

        let expected = [
            ("strategy_id", "string"),
            ("valid_until", "ISO timestamp string"),
            (
                "rules",
                "array of {rule_id, name, scenario_type: CURRENT|FUTURE, direction: BUY|SELL, \
                 instrument, conditions: array of condition objects, position_size: {risk_pct}, \
                 stop_loss: {price_pct}, target: {price_pct}, max_trades}",
            ),
        ];

        let outcome = match self
            .ctx
            .structured_call("strategy_planner", None, prompt, &expected)
            .await
        {
            Ok(outcome) if outcome.complete => outcome,
            Ok(_) => {
                warn!("planner response incomplete; skipping this cycle");
                return None;
            }
            Err(e) => {
                warn!(error = %e, "rule generation failed");
                return None;
            }
        };

        let now = Utc::now();
        let default_validity = Duration::minutes(self.cadence_minutes as i64 + VALIDITY_SLACK_MINUTES);
        let bundle = parse_bundle(&Value::Object(outcome.output), now, default_validity)?;

        // TTL = remaining validity, clamped to zero on clock skew.
        let ttl_seconds = (bundle.valid_until - now).num_seconds().max(0);
        if ttl_seconds == 0 {
            warn!("generated bundle already expired; not publishing");
            return None;
        }

        cache::set_json(
            self.cache.as_ref(),
            RULE_BUNDLE_KEY,
            &bundle,
            std::time::Duration::from_secs(ttl_seconds as u64),
        )
        .await;

        info!(
            strategy_id = %bundle.strategy_id,
            rules = bundle.rules.len(),
            ttl_s = ttl_seconds,
            "rule bundle published"
        );
        Some(bundle)
    }

    async fn build_prompt(&self) -> String {
        let profile = &self.ctx.profile;
        let instrument = &profile.symbol;

        let tick = self.market.latest_tick(instrument).await;
        let current_price = tick.as_ref().map(|t| t.price);

        let candles = self.market.recent_ohlc(instrument, Timeframe::M5, 20).await;
        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        let rsi5 = latest_rsi(&closes, 5);
        let levels = support_resistance(&candles, 10);

        let mut prompt = format!(
            "Current Market Context:\n\n\
             Instrument: {instrument}\n\
             Type: {}\n\
             Currency: {}\n\
             Region: {}\n\
             Current Price: {}\n\n\
             Recent OHLC Data (5-min candles): {} candles\n",
            profile.kind,
            profile.currency,
            profile.region,
            current_price
                .map(|p| p.to_string())
                .unwrap_or_else(|| "N/A".to_string()),
            candles.len(),
        );

        if rsi5.is_some() || levels.is_some() {
            prompt.push_str("\nTechnical Indicators:\n");
            if let Some(rsi) = rsi5 {
                prompt.push_str(&format!("- RSI(5): {rsi:.1}\n"));
            }
            if let Some((support, resistance)) = levels {
                prompt.push_str(&format!("- Support: {support}\n- Resistance: {resistance}\n"));
            }
        }

        if let Some(derivatives) = &self.derivatives {
            if profile.has_futures {
                if let Some(futures) = derivatives.fetch_futures().await {
                    prompt.push_str(&format!(
                        "\nFutures Data:\n- Futures Price: {}\n",
                        futures.get("futures_price").cloned().unwrap_or(Value::Null),
                    ));
                    if let Some(funding) = futures.get("funding_rate").and_then(Value::as_f64) {
                        prompt.push_str(&format!("- Funding Rate: {:.4}%\n", funding * 100.0));
                        if funding < -0.01 {
                            prompt.push_str(
                                "  [SCENARIO] Negative funding rate suggests potential bullish reversal\n",
                            );
                        } else if funding > 0.01 {
                            prompt.push_str(
                                "  [SCENARIO] High positive funding suggests potential bearish reversal\n",
                            );
                        }
                    }
                    if let Some(oi) = futures.get("open_interest") {
                        prompt.push_str(&format!("- Open Interest: {oi}\n"));
                    }

                    // Publish for the dashboard-facing cache key.
                    cache::set_json(
                        self.cache.as_ref(),
                        &cache::futures_key(instrument),
                        &futures,
                        cache::TICK_TTL,
                    )
                    .await;
                }
            }
            if profile.has_options {
                if let Some(chain) = derivatives.fetch_options_chain().await {
                    prompt.push_str(&format!(
                        "\nOptions Chain:\n- Strikes Available: {}\n",
                        chain
                            .get("strikes")
                            .and_then(Value::as_object)
                            .map(|s| s.len())
                            .unwrap_or(0),
                    ));
                }
            }
        }

        prompt.push_str(
            "\n=== PREDICTIVE SCENARIO ANALYSIS ===\n\n\
             Analyze potential FUTURE scenarios based on current data and generate PREPARATORY \
             strategies:\n\
             - IF funding rate becomes extremely negative (< -0.02%): prepare a LONG\n\
             - IF funding rate spikes positive (> 0.02%): prepare a SHORT\n\
             - IF price breaks above resistance: prepare a momentum LONG\n\
             - IF price breaks below support: prepare a momentum SHORT\n\
             - IF open interest or volume spikes: prepare a breakout trade\n\n\
             Generate 3-5 high-probability trading rules:\n\
             - 2-3 for CURRENT conditions\n\
             - 2-3 PREPARATORY rules for FUTURE scenarios (what-if conditions)\n\n\
             Each rule needs a name, direction, instrument, and at least one condition.\n\
             Condition types: price_above, price_below, rsi_above, rsi_below, oi_spike_ce, \
             oi_spike_pe, funding_rate_above, funding_rate_below, volume_spike, \
             premium_acceleration, price_breaks_resistance, price_breaks_support.\n\
             Mark each rule with scenario_type CURRENT or FUTURE.",
        );

        prompt
    }
}

// ---------------------------------------------------------------------------
// Response parsing and validation
// ---------------------------------------------------------------------------

/// Build a RuleBundle from the planner's structured response, dropping
/// invalid rules. Returns `None` when nothing valid remains.
pub fn parse_bundle(
    value: &Value,
    now: DateTime<Utc>,
    default_validity: Duration,
) -> Option<RuleBundle> {
    let obj = value.as_object()?;

    let strategy_id = obj
        .get("strategy_id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| format!("strategy_{}", Uuid::new_v4()));

    let valid_until = obj
        .get("valid_until")
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
        .filter(|t| *t > now)
        .unwrap_or(now + default_validity);

    let raw_rules = obj.get("rules").and_then(Value::as_array)?;
    let rules: Vec<Rule> = raw_rules.iter().filter_map(parse_rule).collect();

    if rules.is_empty() {
        warn!("no valid rules generated");
        return None;
    }

    Some(RuleBundle {
        strategy_id,
        valid_until,
        rules,
    })
}

/// Parse and validate one rule; `None` drops it.
fn parse_rule(value: &Value) -> Option<Rule> {
    let obj = value.as_object()?;

    let name = obj.get("name").and_then(Value::as_str)?.to_string();
    let instrument = obj.get("instrument").and_then(Value::as_str)?.to_string();
    if instrument.is_empty() {
        return None;
    }

    let direction = match obj.get("direction").and_then(Value::as_str) {
        Some("BUY") => TradeDirection::Buy,
        Some("SELL") => TradeDirection::Sell,
        other => {
            warn!(?other, rule = %name, "invalid rule direction");
            return None;
        }
    };

    let conditions: Vec<Condition> = obj
        .get("conditions")
        .and_then(Value::as_array)?
        .iter()
        .filter_map(parse_condition)
        .collect();
    if conditions.is_empty() {
        warn!(rule = %name, "rule has no usable conditions");
        return None;
    }

    let scenario = match obj.get("scenario_type").and_then(Value::as_str) {
        Some("CURRENT") => Some(Scenario::Current),
        Some("FUTURE") => Some(Scenario::Future),
        _ => None,
    };

    let pct = |outer: &str, key: &str, default: f64| -> f64 {
        obj.get(outer)
            .and_then(|v| v.get(key))
            .and_then(Value::as_f64)
            .map(f64::abs)
            .unwrap_or(default)
    };

    Some(Rule {
        rule_id: obj
            .get("rule_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("rule_{}", Uuid::new_v4())),
        name,
        direction,
        instrument,
        conditions,
        risk_pct: pct("position_size", "risk_pct", 0.5),
        stop_loss_pct: pct("stop_loss", "price_pct", 2.0),
        target_pct: pct("target", "price_pct", 5.0),
        max_trades: obj
            .get("max_trades")
            .and_then(Value::as_u64)
            .map(|m| m as u32)
            .unwrap_or(1),
        trades_executed: 0,
        scenario,
    })
}

/// Parse one condition object, normalising the aliases models tend to emit.
fn parse_condition(value: &Value) -> Option<Condition> {
    let mut obj = value.as_object()?.clone();

    // Alias normalisation before the tagged deserialise.
    if let Some(t) = obj.get("type").and_then(Value::as_str) {
        let canonical = match t {
            "rsi_5_above" => Some("rsi_above"),
            "rsi_5_below" => Some("rsi_below"),
            "fut_ltp_above" => Some("price_above"),
            "fut_ltp_below" => Some("price_below"),
            _ => None,
        };
        if let Some(c) = canonical {
            obj.insert("type".to_string(), Value::from(c));
        }
    }

    match serde_json::from_value::<Condition>(Value::Object(obj)) {
        Ok(condition) => Some(condition),
        Err(e) => {
            debug!(error = %e, "dropping unparseable condition");
            None
        }
    }
}
