// =============================================================================
// Rule Engine — sub-second evaluation of planner rules against live ticks
// =============================================================================
//
// The engine keeps a small indicator context fed from each tick: latest
// price per instrument, RSI(5) over a rolling 20-tick price buffer, rolling
// tick volumes, and per-strike open interest with percent change since the
// previous value. The active RuleBundle comes from the key-value cache; its
// absence (TTL expiry included) means "no active rules".
//
// A rule matches only when ALL of its conditions hold. Matching emits a
// trade signal, capped by the rule's max_trades.
//
// Condition formulas chosen where the planner schema leaves room:
//   volume_spike         — latest tick volume vs. the rolling mean of the
//                          previous 20 tick volumes, in percent.
//   premium_acceleration — percent price change over the last 5 ticks.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::{BrokerAdapter, OrderRequest};
use crate::indicators::rsi::latest_rsi;
use crate::market::Tick;
use crate::store::{DecisionStore, TradeRecord};
use crate::types::{Scenario, TradeDirection};

/// Rolling buffer length for tick-level indicators.
const TICK_BUFFER_LEN: usize = 20;

/// Ticks used by the premium-acceleration window.
const ACCELERATION_WINDOW: usize = 5;

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

/// A single machine-evaluable condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    PriceAbove { value: f64 },
    PriceBelow { value: f64 },
    RsiAbove { value: f64 },
    RsiBelow { value: f64 },
    OiSpikeCe { strike: u64, min_pct: f64 },
    OiSpikePe { strike: u64, min_pct: f64 },
    FundingRateAbove { value: f64 },
    FundingRateBelow { value: f64 },
    VolumeSpike { min_pct: f64 },
    PremiumAcceleration { min_pct: f64 },
    PriceBreaksResistance { value: f64 },
    PriceBreaksSupport { value: f64 },
}

/// One planner-generated trading rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub rule_id: String,
    pub name: String,
    pub direction: TradeDirection,
    pub instrument: String,
    pub conditions: Vec<Condition>,
    pub risk_pct: f64,
    pub stop_loss_pct: f64,
    pub target_pct: f64,
    #[serde(default = "default_max_trades")]
    pub max_trades: u32,
    #[serde(default)]
    pub trades_executed: u32,
    #[serde(default)]
    pub scenario: Option<Scenario>,
}

fn default_max_trades() -> u32 {
    1
}

/// A set of rules published together with a validity deadline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleBundle {
    pub strategy_id: String,
    pub valid_until: DateTime<Utc>,
    pub rules: Vec<Rule>,
}

impl RuleBundle {
    pub fn is_current(&self, now: DateTime<Utc>) -> bool {
        self.valid_until > now
    }
}

/// Signal emitted when a rule's conditions all hold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleTradeSignal {
    pub rule_id: String,
    pub rule_name: String,
    pub direction: TradeDirection,
    pub instrument: String,
    pub entry_price: f64,
    pub risk_pct: f64,
    pub stop_loss_pct: f64,
    pub target_pct: f64,
}

// ---------------------------------------------------------------------------
// Indicator context
// ---------------------------------------------------------------------------

/// Live per-instrument indicator state fed from ticks.
#[derive(Debug, Default)]
struct InstrumentContext {
    latest_price: f64,
    prices: VecDeque<f64>,
    volumes: VecDeque<f64>,
    rsi5: Option<f64>,
    funding_rate: Option<f64>,
    /// strike -> (latest OI, percent change since previous value)
    oi_ce: HashMap<u64, (f64, f64)>,
    oi_pe: HashMap<u64, (f64, f64)>,
}

impl InstrumentContext {
    fn push_tick(&mut self, price: f64, volume: Option<f64>) {
        self.latest_price = price;
        self.prices.push_back(price);
        while self.prices.len() > TICK_BUFFER_LEN {
            self.prices.pop_front();
        }
        if let Some(v) = volume {
            self.volumes.push_back(v);
            while self.volumes.len() > TICK_BUFFER_LEN + 1 {
                self.volumes.pop_front();
            }
        }

        if self.prices.len() > 5 {
            let closes: Vec<f64> = self.prices.iter().copied().collect();
            self.rsi5 = latest_rsi(&closes, 5);
        }
    }

    /// Percent change of the latest volume against the rolling mean of the
    /// preceding ones.
    fn volume_spike_pct(&self) -> Option<f64> {
        if self.volumes.len() < 2 {
            return None;
        }
        let latest = *self.volumes.back()?;
        let prior: Vec<f64> = self.volumes.iter().take(self.volumes.len() - 1).copied().collect();
        let mean = prior.iter().sum::<f64>() / prior.len() as f64;
        if mean <= 0.0 {
            return None;
        }
        Some((latest - mean) / mean * 100.0)
    }

    /// Percent price change over the acceleration window.
    fn acceleration_pct(&self) -> Option<f64> {
        if self.prices.len() < ACCELERATION_WINDOW {
            return None;
        }
        let start = self.prices[self.prices.len() - ACCELERATION_WINDOW];
        if start == 0.0 {
            return None;
        }
        Some((self.latest_price - start) / start * 100.0)
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct RuleEngine {
    contexts: HashMap<String, InstrumentContext>,
    /// Trades executed per rule id; survives bundle reloads within the
    /// validity window.
    trade_counts: HashMap<String, u32>,
    broker: Arc<dyn BrokerAdapter>,
    store: Arc<dyn DecisionStore>,
    paper_trading: bool,
    account_value: f64,
}

impl RuleEngine {
    pub fn new(
        broker: Arc<dyn BrokerAdapter>,
        store: Arc<dyn DecisionStore>,
        paper_trading: bool,
        account_value: f64,
    ) -> Self {
        Self {
            contexts: HashMap::new(),
            trade_counts: HashMap::new(),
            broker,
            store,
            paper_trading,
            account_value,
        }
    }

    /// Fold a tick into the indicator context.
    pub fn update_indicators(&mut self, tick: &Tick) {
        let ctx = self.contexts.entry(tick.instrument.clone()).or_default();
        ctx.push_tick(tick.price, tick.volume);
    }

    /// Update the funding rate for an instrument (from the futures feed).
    pub fn update_funding_rate(&mut self, instrument: &str, funding_rate: f64) {
        self.contexts
            .entry(instrument.to_string())
            .or_default()
            .funding_rate = Some(funding_rate);
    }

    /// Update per-strike open interest, tracking the percent change since
    /// the previous value.
    pub fn update_open_interest(&mut self, instrument: &str, strike: u64, ce_oi: Option<f64>, pe_oi: Option<f64>) {
        let ctx = self.contexts.entry(instrument.to_string()).or_default();
        if let Some(oi) = ce_oi {
            let change = match ctx.oi_ce.get(&strike) {
                Some((prev, _)) if *prev > 0.0 => (oi - prev) / prev * 100.0,
                _ => 0.0,
            };
            ctx.oi_ce.insert(strike, (oi, change));
        }
        if let Some(oi) = pe_oi {
            let change = match ctx.oi_pe.get(&strike) {
                Some((prev, _)) if *prev > 0.0 => (oi - prev) / prev * 100.0,
                _ => 0.0,
            };
            ctx.oi_pe.insert(strike, (oi, change));
        }
    }

    /// Evaluate every rule in the bundle against the current context.
    ///
    /// Pure with respect to the context: evaluating the same bundle on the
    /// same context yields the same signals. Rules at their max-trades cap
    /// emit nothing.
    pub fn evaluate(&self, bundle: &RuleBundle, tick: &Tick) -> Vec<RuleTradeSignal> {
        let mut signals = Vec::new();
        for rule in &bundle.rules {
            let executed = self
                .trade_counts
                .get(&rule.rule_id)
                .copied()
                .unwrap_or(rule.trades_executed);
            if executed >= rule.max_trades {
                continue;
            }

            let ctx = match self.contexts.get(&tick.instrument) {
                Some(ctx) => ctx,
                None => continue,
            };

            if rule.conditions.iter().all(|c| self.check(c, ctx)) {
                debug!(rule_id = %rule.rule_id, name = %rule.name, "rule conditions met");
                signals.push(RuleTradeSignal {
                    rule_id: rule.rule_id.clone(),
                    rule_name: rule.name.clone(),
                    direction: rule.direction,
                    instrument: rule.instrument.clone(),
                    entry_price: tick.price,
                    risk_pct: rule.risk_pct,
                    stop_loss_pct: rule.stop_loss_pct,
                    target_pct: rule.target_pct,
                });
            }
        }
        signals
    }

    fn check(&self, condition: &Condition, ctx: &InstrumentContext) -> bool {
        match condition {
            Condition::PriceAbove { value } => ctx.latest_price > *value,
            Condition::PriceBelow { value } => ctx.latest_price < *value,
            Condition::RsiAbove { value } => ctx.rsi5.map(|r| r > *value).unwrap_or(false),
            Condition::RsiBelow { value } => ctx.rsi5.map(|r| r < *value).unwrap_or(false),
            Condition::OiSpikeCe { strike, min_pct } => ctx
                .oi_ce
                .get(strike)
                .map(|(_, change)| *change > *min_pct)
                .unwrap_or(false),
            Condition::OiSpikePe { strike, min_pct } => ctx
                .oi_pe
                .get(strike)
                .map(|(_, change)| *change > *min_pct)
                .unwrap_or(false),
            Condition::FundingRateAbove { value } => {
                ctx.funding_rate.map(|f| f > *value).unwrap_or(false)
            }
            Condition::FundingRateBelow { value } => {
                ctx.funding_rate.map(|f| f < *value).unwrap_or(false)
            }
            Condition::VolumeSpike { min_pct } => ctx
                .volume_spike_pct()
                .map(|pct| pct > *min_pct)
                .unwrap_or(false),
            Condition::PremiumAcceleration { min_pct } => ctx
                .acceleration_pct()
                .map(|pct| pct > *min_pct)
                .unwrap_or(false),
            // Breakout conditions are strict crossings of the given level.
            Condition::PriceBreaksResistance { value } => ctx.latest_price > *value,
            Condition::PriceBreaksSupport { value } => ctx.latest_price < *value,
        }
    }

    /// Instrument-aware sizing: risk a percentage of the account against
    /// the rule's stop distance.
    fn quantity_for(&self, signal: &RuleTradeSignal) -> f64 {
        let risk_amount = self.account_value * (signal.risk_pct / 100.0);
        let stop_per_unit = signal.entry_price * (signal.stop_loss_pct.abs() / 100.0);
        if stop_per_unit > 0.0 {
            (risk_amount / stop_per_unit).floor()
        } else {
            0.0
        }
    }

    /// Execute one emitted signal: size, place, count, persist.
    pub async fn execute(&mut self, signal: &RuleTradeSignal) -> Option<TradeRecord> {
        let quantity = self.quantity_for(signal);
        if quantity <= 0.0 {
            warn!(rule_id = %signal.rule_id, "computed quantity is zero; dropping signal");
            return None;
        }

        let stop_fraction = signal.stop_loss_pct.abs() / 100.0;
        let target_fraction = signal.target_pct.abs() / 100.0;
        let (stop_loss, take_profit) = match signal.direction {
            TradeDirection::Buy => (
                signal.entry_price * (1.0 - stop_fraction),
                signal.entry_price * (1.0 + target_fraction),
            ),
            TradeDirection::Sell => (
                signal.entry_price * (1.0 + stop_fraction),
                signal.entry_price * (1.0 - target_fraction),
            ),
        };

        let request = OrderRequest {
            client_id: Uuid::new_v4().to_string(),
            instrument: signal.instrument.clone(),
            side: signal.direction,
            quantity,
            entry_price: signal.entry_price,
            stop_loss,
            take_profit,
        };

        match self.broker.place_order(request).await {
            Ok(fill) => {
                *self.trade_counts.entry(signal.rule_id.clone()).or_insert(0) += 1;

                let record = TradeRecord {
                    trade_id: format!("RULE_{}", Uuid::new_v4()),
                    order_id: fill.order_id,
                    rule_id: Some(signal.rule_id.clone()),
                    instrument: signal.instrument.clone(),
                    direction: signal.direction,
                    quantity: fill.filled_quantity,
                    entry_price: signal.entry_price,
                    filled_price: fill.filled_price,
                    stop_loss_pct: signal.stop_loss_pct,
                    target_pct: signal.target_pct,
                    timestamp: fill.timestamp,
                    status: fill.status,
                    paper_trading: self.paper_trading,
                };
                self.store.insert_trade(record.clone()).await;

                info!(
                    rule_id = %signal.rule_id,
                    direction = %signal.direction,
                    quantity,
                    price = signal.entry_price,
                    "rule trade executed"
                );
                Some(record)
            }
            Err(e) => {
                warn!(rule_id = %signal.rule_id, error = %e, "rule trade placement failed");
                None
            }
        }
    }

    /// Evaluate and execute in one pass; returns executed trade records.
    pub async fn evaluate_and_execute(
        &mut self,
        bundle: &RuleBundle,
        tick: &Tick,
    ) -> Vec<TradeRecord> {
        self.update_indicators(tick);
        let signals = self.evaluate(bundle, tick);
        let mut records = Vec::new();
        for signal in &signals {
            if let Some(record) = self.execute(signal).await {
                records.push(record);
            }
        }
        records
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::PaperBroker;
    use crate::store::MemoryStore;

    fn tick(price: f64) -> Tick {
        Tick {
            instrument: "BTCUSDT".to_string(),
            price,
            best_bid: None,
            best_ask: None,
            bid_depth: Vec::new(),
            ask_depth: Vec::new(),
            total_buy_qty: 0.0,
            total_sell_qty: 0.0,
            volume: Some(10.0),
            timestamp: Utc::now(),
        }
    }

    fn engine() -> RuleEngine {
        RuleEngine::new(
            Arc::new(PaperBroker::new()),
            Arc::new(MemoryStore::new()),
            true,
            1_000_000.0,
        )
    }

    fn buy_rule(conditions: Vec<Condition>, max_trades: u32) -> Rule {
        Rule {
            rule_id: "r1".to_string(),
            name: "Breakout long".to_string(),
            direction: TradeDirection::Buy,
            instrument: "BTCUSDT".to_string(),
            conditions,
            risk_pct: 0.5,
            stop_loss_pct: 2.0,
            target_pct: 5.0,
            max_trades,
            trades_executed: 0,
            scenario: Some(Scenario::Current),
        }
    }

    fn bundle(rules: Vec<Rule>) -> RuleBundle {
        RuleBundle {
            strategy_id: "s1".to_string(),
            valid_until: Utc::now() + chrono::Duration::minutes(20),
            rules,
        }
    }

    /// Feed ticks that drive RSI(5) up or down deterministically.
    fn feed_prices(engine: &mut RuleEngine, start: f64, step: f64, n: usize) {
        for i in 0..n {
            engine.update_indicators(&tick(start + step * i as f64));
        }
    }

    #[test]
    fn condition_wire_format() {
        let json = r#"{"type": "price_above", "value": 60100.0}"#;
        let c: Condition = serde_json::from_str(json).unwrap();
        assert_eq!(c, Condition::PriceAbove { value: 60100.0 });

        let json = r#"{"type": "oi_spike_ce", "strike": 60200, "min_pct": 15.0}"#;
        let c: Condition = serde_json::from_str(json).unwrap();
        assert_eq!(
            c,
            Condition::OiSpikeCe {
                strike: 60200,
                min_pct: 15.0
            }
        );
    }

    // ---- seed scenario 5: rule hit on tick --------------------------------

    #[tokio::test]
    async fn rule_fires_once_then_respects_max_trades() {
        let mut engine = engine();
        let rules = bundle(vec![buy_rule(
            vec![
                Condition::PriceAbove { value: 60_100.0 },
                Condition::RsiAbove { value: 55.0 },
            ],
            1,
        )]);

        // Warm the buffer with a mild downtrend so RSI sits low.
        feed_prices(&mut engine, 60_100.0, -10.0, 6);

        // Tick 1: price 60,050, RSI below 55 -> no signal.
        let records = engine.evaluate_and_execute(&rules, &tick(60_050.0)).await;
        assert!(records.is_empty(), "no signal while RSI is low");

        // Ticks push the price up; RSI(5) rises above 55.
        feed_prices(&mut engine, 60_080.0, 25.0, 4);

        // Tick 2: price 60,150, RSI high -> one signal, paper order placed.
        let records = engine.evaluate_and_execute(&rules, &tick(60_150.0)).await;
        assert_eq!(records.len(), 1, "exactly one trade on first match");
        assert_eq!(records[0].direction, TradeDirection::Buy);
        assert_eq!(records[0].status, "COMPLETE");
        assert_eq!(engine.trade_counts.get("r1"), Some(&1));

        // Tick 3: conditions still true, but max_trades reached.
        let records = engine.evaluate_and_execute(&rules, &tick(60_200.0)).await;
        assert!(records.is_empty(), "max_trades must cap executions");
        assert_eq!(engine.trade_counts.get("r1"), Some(&1));
    }

    #[test]
    fn evaluation_is_idempotent() {
        let mut engine = engine();
        feed_prices(&mut engine, 60_000.0, 30.0, 10);
        let rules = bundle(vec![buy_rule(
            vec![Condition::PriceAbove { value: 60_100.0 }],
            5,
        )]);

        let t = tick(60_270.0);
        engine.update_indicators(&t);
        let first = engine.evaluate(&rules, &t);
        let second = engine.evaluate(&rules, &t);
        assert_eq!(first, second, "same context must yield the same signals");
        assert_eq!(first.len(), 1);
    }

    #[test]
    fn all_conditions_must_hold() {
        let mut engine = engine();
        feed_prices(&mut engine, 60_000.0, 30.0, 10);
        let rules = bundle(vec![buy_rule(
            vec![
                Condition::PriceAbove { value: 60_100.0 },
                Condition::FundingRateBelow { value: -0.01 },
            ],
            1,
        )]);

        // Funding rate unknown -> condition false -> no signal.
        let t = tick(60_270.0);
        engine.update_indicators(&t);
        assert!(engine.evaluate(&rules, &t).is_empty());

        engine.update_funding_rate("BTCUSDT", -0.02);
        assert_eq!(engine.evaluate(&rules, &t).len(), 1);
    }

    #[test]
    fn oi_spike_tracks_percent_change() {
        let mut engine = engine();
        let t = tick(60_000.0);
        engine.update_indicators(&t);

        let rules = bundle(vec![buy_rule(
            vec![Condition::OiSpikeCe {
                strike: 60_200,
                min_pct: 10.0,
            }],
            1,
        )]);

        // First observation: no baseline, no spike.
        engine.update_open_interest("BTCUSDT", 60_200, Some(1000.0), None);
        assert!(engine.evaluate(&rules, &t).is_empty());

        // +20% -> spike.
        engine.update_open_interest("BTCUSDT", 60_200, Some(1200.0), None);
        assert_eq!(engine.evaluate(&rules, &t).len(), 1);
    }

    #[test]
    fn volume_spike_vs_rolling_mean() {
        let mut engine = engine();
        // 10 ticks of volume 10, then one of 20: +100% vs mean.
        for i in 0..10 {
            let mut t = tick(60_000.0 + i as f64);
            t.volume = Some(10.0);
            engine.update_indicators(&t);
        }
        let mut spike = tick(60_010.0);
        spike.volume = Some(20.0);
        engine.update_indicators(&spike);

        let rules = bundle(vec![buy_rule(vec![Condition::VolumeSpike { min_pct: 50.0 }], 1)]);
        assert_eq!(engine.evaluate(&rules, &spike).len(), 1);

        let strict = bundle(vec![buy_rule(vec![Condition::VolumeSpike { min_pct: 150.0 }], 1)]);
        assert!(engine.evaluate(&strict, &spike).is_empty());
    }

    #[test]
    fn premium_acceleration_window() {
        let mut engine = engine();
        // 1% rise across the 5-tick window.
        for price in [60_000.0, 60_100.0, 60_200.0, 60_400.0, 60_600.0] {
            engine.update_indicators(&tick(price));
        }
        let t = tick(60_600.0);

        let rules = bundle(vec![buy_rule(
            vec![Condition::PremiumAcceleration { min_pct: 0.5 }],
            1,
        )]);
        assert_eq!(engine.evaluate(&rules, &t).len(), 1);
    }

    #[tokio::test]
    async fn sell_rule_brackets_invert() {
        let broker = Arc::new(PaperBroker::new());
        let store = Arc::new(MemoryStore::new());
        let mut engine = RuleEngine::new(
            Arc::clone(&broker) as Arc<dyn BrokerAdapter>,
            Arc::clone(&store) as Arc<dyn DecisionStore>,
            true,
            1_000_000.0,
        );
        feed_prices(&mut engine, 60_400.0, -40.0, 10);

        let mut rule = buy_rule(vec![Condition::PriceBelow { value: 60_100.0 }], 1);
        rule.direction = TradeDirection::Sell;
        let rules = bundle(vec![rule]);

        let t = tick(60_040.0);
        let records = engine.evaluate_and_execute(&rules, &t).await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].direction, TradeDirection::Sell);
        // The paper broker recorded a bracket with stop above entry.
        let fills = broker.fills();
        assert_eq!(fills.len(), 1);
    }

    #[test]
    fn expired_bundle_reads_as_stale() {
        let mut b = bundle(Vec::new());
        b.valid_until = Utc::now() - chrono::Duration::seconds(1);
        assert!(!b.is_current(Utc::now()));
    }
}
