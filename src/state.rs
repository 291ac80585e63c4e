// =============================================================================
// Decision State — the shared record flowing through the orchestration graph
// =============================================================================
//
// Single-writer-per-field discipline: exactly one agent owns each non-list
// field, and agents never mutate the state in place. Each node returns a
// StateUpdate carrying only the fields it is permitted to write; cohort
// partials are merged first (double-writes are a programming error, asserted
// in debug builds) and then folded into the state at the barrier.
//
// `agent_explanations` is append-only with list concatenation, so the fan-in
// reduction is deterministic under any interleaving: field slots are
// disjoint, and the explanation multiset does not depend on merge order.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

use crate::market::{Candle, DepthLevel, NewsItem, Timeframe};
use crate::types::{Signal, TrendSignal};

/// Key agents set inside their output slot when a structured response failed
/// the completeness gate. Finalization collects these into an alert.
pub const INCOMPLETE_JSON_KEY: &str = "__incomplete_json";

// ---------------------------------------------------------------------------
// DecisionState
// ---------------------------------------------------------------------------

/// Shared state for one graph run. Created from the market snapshot, owned by
/// the run, discarded after persistence.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DecisionState {
    // --- Market snapshot (external writer; agents read-only) ----------------
    pub current_price: f64,
    pub current_time: Option<DateTime<Utc>>,
    /// Closed candles per timeframe, oldest first.
    #[serde(default)]
    pub ohlc: HashMap<Timeframe, Vec<Candle>>,
    pub best_bid: Option<f64>,
    pub best_ask: Option<f64>,
    #[serde(default)]
    pub bid_depth: Vec<DepthLevel>,
    #[serde(default)]
    pub ask_depth: Vec<DepthLevel>,
    #[serde(default)]
    pub total_buy_qty: f64,
    #[serde(default)]
    pub total_sell_qty: f64,
    /// Aggregate news sentiment in [-1, +1].
    #[serde(default)]
    pub sentiment_score: f64,
    /// Latest news, ordered by published time descending.
    #[serde(default)]
    pub latest_news: Vec<NewsItem>,

    // --- Macro inputs (external writer) -------------------------------------
    pub policy_rate: Option<f64>,
    pub inflation_rate: Option<f64>,
    pub health_indicator: Option<f64>,

    // --- Per-agent output slots (each written by that agent only) -----------
    #[serde(default)]
    pub technical: Map<String, Value>,
    #[serde(default)]
    pub fundamental: Map<String, Value>,
    #[serde(default)]
    pub sentiment: Map<String, Value>,
    #[serde(default)]
    pub macro_analysis: Map<String, Value>,

    // --- Debate --------------------------------------------------------------
    #[serde(default)]
    pub bull_thesis: String,
    #[serde(default)]
    pub bear_thesis: String,
    /// Conviction scores in [0, 1].
    #[serde(default)]
    pub bull_confidence: f64,
    #[serde(default)]
    pub bear_confidence: f64,

    // --- Risk recommendations ------------------------------------------------
    #[serde(default)]
    pub aggressive_risk: Map<String, Value>,
    #[serde(default)]
    pub conservative_risk: Map<String, Value>,
    #[serde(default)]
    pub neutral_risk: Map<String, Value>,

    // --- Final decision (portfolio manager) ----------------------------------
    #[serde(default)]
    pub final_signal: Signal,
    #[serde(default)]
    pub trend_signal: TrendSignal,
    #[serde(default)]
    pub position_size: f64,
    #[serde(default)]
    pub entry_price: f64,
    #[serde(default)]
    pub stop_loss: f64,
    #[serde(default)]
    pub take_profit: f64,

    // --- Execution result -----------------------------------------------------
    #[serde(default)]
    pub order_id: String,
    #[serde(default)]
    pub filled_price: f64,
    #[serde(default)]
    pub filled_quantity: f64,
    pub execution_timestamp: Option<DateTime<Utc>>,

    // --- Audit ----------------------------------------------------------------
    /// Reasoning from each agent, tagged `[agent]: ...`. Append-only.
    #[serde(default)]
    pub agent_explanations: Vec<String>,
    /// Survives downstream copies; the portfolio manager stores its full
    /// output object under "portfolio_manager_output".
    #[serde(default)]
    pub decision_audit_trail: Map<String, Value>,
}

impl DecisionState {
    /// Candles for a timeframe, preferring 5m and falling back to 1m the way
    /// the analysis agents read the snapshot.
    pub fn analysis_candles(&self) -> &[Candle] {
        match self.ohlc.get(&Timeframe::M5) {
            Some(c) if !c.is_empty() => c,
            _ => self
                .ohlc
                .get(&Timeframe::M1)
                .map(|c| c.as_slice())
                .unwrap_or(&[]),
        }
    }

    /// Fold a (merged) partial update into the state.
    pub fn apply(&mut self, update: StateUpdate) {
        macro_rules! assign {
            ($field:ident) => {
                if let Some(v) = update.$field {
                    self.$field = v;
                }
            };
        }

        assign!(technical);
        assign!(fundamental);
        assign!(sentiment);
        assign!(macro_analysis);
        assign!(bull_thesis);
        assign!(bull_confidence);
        assign!(bear_thesis);
        assign!(bear_confidence);
        assign!(aggressive_risk);
        assign!(conservative_risk);
        assign!(neutral_risk);
        assign!(final_signal);
        assign!(trend_signal);
        assign!(position_size);
        assign!(entry_price);
        assign!(stop_loss);
        assign!(take_profit);
        assign!(order_id);
        assign!(filled_price);
        assign!(filled_quantity);

        if let Some(ts) = update.execution_timestamp {
            self.execution_timestamp = Some(ts);
        }

        for (k, v) in update.audit_trail {
            self.decision_audit_trail.insert(k, v);
        }

        self.agent_explanations.extend(update.explanations);
    }

    /// Names of agents whose output slot carries the incomplete-JSON marker.
    pub fn incomplete_agents(&self) -> Vec<String> {
        let slots: [(&str, &Map<String, Value>); 4] = [
            ("technical", &self.technical),
            ("fundamental", &self.fundamental),
            ("sentiment", &self.sentiment),
            ("macro", &self.macro_analysis),
        ];
        slots
            .iter()
            .filter(|(_, slot)| {
                slot.get(INCOMPLETE_JSON_KEY)
                    .and_then(Value::as_bool)
                    .unwrap_or(false)
            })
            .map(|(name, _)| name.to_string())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// StateUpdate
// ---------------------------------------------------------------------------

/// A partial update returned by one agent: only the fields that agent owns.
#[derive(Debug, Clone, Default)]
pub struct StateUpdate {
    pub technical: Option<Map<String, Value>>,
    pub fundamental: Option<Map<String, Value>>,
    pub sentiment: Option<Map<String, Value>>,
    pub macro_analysis: Option<Map<String, Value>>,
    pub bull_thesis: Option<String>,
    pub bull_confidence: Option<f64>,
    pub bear_thesis: Option<String>,
    pub bear_confidence: Option<f64>,
    pub aggressive_risk: Option<Map<String, Value>>,
    pub conservative_risk: Option<Map<String, Value>>,
    pub neutral_risk: Option<Map<String, Value>>,
    pub final_signal: Option<Signal>,
    pub trend_signal: Option<TrendSignal>,
    pub position_size: Option<f64>,
    pub entry_price: Option<f64>,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub order_id: Option<String>,
    pub filled_price: Option<f64>,
    pub filled_quantity: Option<f64>,
    pub execution_timestamp: Option<DateTime<Utc>>,
    /// Merged by key; key collisions within a cohort are a programming error.
    pub audit_trail: Map<String, Value>,
    /// Concatenated; order within a cohort is unspecified.
    pub explanations: Vec<String>,
}

impl StateUpdate {
    /// Tag and append an explanation entry.
    pub fn push_explanation(&mut self, agent_name: &str, text: impl AsRef<str>) {
        self.explanations
            .push(format!("[{agent_name}]: {}", text.as_ref()));
    }

    /// Combine two partials from the same cohort.
    ///
    /// Non-list fields are disjoint by contract; a double-write asserts in
    /// debug builds (release builds keep the later writer, but that path is
    /// a bug upstream).
    pub fn merge(mut self, other: StateUpdate) -> StateUpdate {
        macro_rules! take {
            ($field:ident) => {
                if other.$field.is_some() {
                    debug_assert!(
                        self.$field.is_none(),
                        concat!("double write of field `", stringify!($field), "` within a cohort"),
                    );
                    self.$field = other.$field;
                }
            };
        }

        take!(technical);
        take!(fundamental);
        take!(sentiment);
        take!(macro_analysis);
        take!(bull_thesis);
        take!(bull_confidence);
        take!(bear_thesis);
        take!(bear_confidence);
        take!(aggressive_risk);
        take!(conservative_risk);
        take!(neutral_risk);
        take!(final_signal);
        take!(trend_signal);
        take!(position_size);
        take!(entry_price);
        take!(stop_loss);
        take!(take_profit);
        take!(order_id);
        take!(filled_price);
        take!(filled_quantity);
        take!(execution_timestamp);

        for (k, v) in other.audit_trail {
            debug_assert!(
                !self.audit_trail.contains_key(&k),
                "double write of audit trail key within a cohort",
            );
            self.audit_trail.insert(k, v);
        }

        self.explanations.extend(other.explanations);
        self
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn slot(key: &str, val: f64) -> Map<String, Value> {
        let mut m = Map::new();
        m.insert(key.to_string(), serde_json::json!(val));
        m
    }

    fn analysis_updates() -> Vec<StateUpdate> {
        let mut technical = StateUpdate::default();
        technical.technical = Some(slot("rsi", 55.0));
        technical.push_explanation("technical", "UP trend");

        let mut fundamental = StateUpdate::default();
        fundamental.fundamental = Some(slot("bullish_probability", 0.6));
        fundamental.push_explanation("fundamental", "strong sector");

        let mut sentiment = StateUpdate::default();
        sentiment.sentiment = Some(slot("retail_sentiment", 0.2));
        sentiment.push_explanation("sentiment", "mildly positive");

        let mut macro_u = StateUpdate::default();
        macro_u.macro_analysis = Some(slot("sector_headwind_score", -0.1));
        macro_u.push_explanation("macro", "mixed regime");

        vec![technical, fundamental, sentiment, macro_u]
    }

    /// Reduced state is field-wise equal for every interleaving of the
    /// analysis cohort; the explanation multiset is interleaving-invariant.
    #[test]
    fn reducer_is_order_independent() {
        let orderings: Vec<Vec<usize>> = vec![
            vec![0, 1, 2, 3],
            vec![3, 2, 1, 0],
            vec![2, 0, 3, 1],
            vec![1, 3, 0, 2],
        ];

        let mut reduced_states = Vec::new();
        for order in orderings {
            let updates = analysis_updates();
            let mut merged = StateUpdate::default();
            for idx in order {
                merged = merged.merge(updates[idx].clone());
            }
            let mut state = DecisionState::default();
            state.apply(merged);
            reduced_states.push(state);
        }

        let first = &reduced_states[0];
        for other in &reduced_states[1..] {
            assert_eq!(first.technical, other.technical);
            assert_eq!(first.fundamental, other.fundamental);
            assert_eq!(first.sentiment, other.sentiment);
            assert_eq!(first.macro_analysis, other.macro_analysis);

            let mut a = first.agent_explanations.clone();
            let mut b = other.agent_explanations.clone();
            a.sort();
            b.sort();
            assert_eq!(a, b, "explanation multiset must match");
        }
        assert_eq!(first.agent_explanations.len(), 4);
    }

    #[test]
    #[should_panic(expected = "double write")]
    #[cfg(debug_assertions)]
    fn double_write_asserts_in_debug() {
        let mut a = StateUpdate::default();
        a.technical = Some(slot("rsi", 50.0));
        let mut b = StateUpdate::default();
        b.technical = Some(slot("rsi", 60.0));
        let _ = a.merge(b);
    }

    #[test]
    fn explanations_concatenate() {
        let mut a = StateUpdate::default();
        a.push_explanation("bull", "thesis A");
        let mut b = StateUpdate::default();
        b.push_explanation("bear", "thesis B");

        let merged = a.merge(b);
        assert_eq!(merged.explanations.len(), 2);
        assert!(merged.explanations[0].starts_with("[bull]:"));
        assert!(merged.explanations[1].starts_with("[bear]:"));
    }

    #[test]
    fn incomplete_agents_reads_marker() {
        let mut state = DecisionState::default();
        state
            .sentiment
            .insert(INCOMPLETE_JSON_KEY.to_string(), Value::Bool(true));
        state.technical.insert("rsi".to_string(), serde_json::json!(50.0));

        assert_eq!(state.incomplete_agents(), vec!["sentiment".to_string()]);
    }

    #[test]
    fn audit_trail_merges_by_key() {
        let mut update = StateUpdate::default();
        update
            .audit_trail
            .insert("portfolio_manager_output".to_string(), serde_json::json!({"signal": "HOLD"}));

        let mut state = DecisionState::default();
        state
            .decision_audit_trail
            .insert("existing".to_string(), Value::Null);
        state.apply(update);

        assert!(state.decision_audit_trail.contains_key("existing"));
        assert!(state
            .decision_audit_trail
            .contains_key("portfolio_manager_output"));
    }

    #[test]
    fn analysis_candles_prefers_5m() {
        let mut state = DecisionState::default();
        let candle = |close: f64| Candle {
            timestamp: Utc::now(),
            open: close,
            high: close,
            low: close,
            close,
            volume: 1.0,
        };
        state.ohlc.insert(Timeframe::M1, vec![candle(1.0)]);
        assert_eq!(state.analysis_candles().len(), 1);
        assert_eq!(state.analysis_candles()[0].close, 1.0);

        state
            .ohlc
            .insert(Timeframe::M5, vec![candle(2.0), candle(3.0)]);
        assert_eq!(state.analysis_candles().len(), 2);
    }
}
