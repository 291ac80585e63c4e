// =============================================================================
// Document store — decisions, trades, alerts, provider usage
// =============================================================================
//
// Every graph run persists one DecisionRecord, HOLD included (status
// "ANALYSIS"); executed rule-engine trades persist TradeRecords. Each write
// is a single-document insert or upsert; no cross-document transactions.
// Downstream readers filter the mixed decisions collection by `status`.
// =============================================================================

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

use crate::alerts::Alert;
use crate::types::{Signal, TradeDirection, TrendSignal};

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Full audit record of one graph run. Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub timestamp: DateTime<Utc>,
    pub instrument: String,
    pub venue: String,
    pub data_source: String,
    /// Provider that served the most recent successful LLM call, if any.
    pub llm_provider: Option<String>,
    pub current_price: f64,
    pub final_signal: Signal,
    pub trend_signal: TrendSignal,
    pub position_size: f64,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    /// Per-agent output slots keyed by agent name.
    pub agent_decisions: Map<String, Value>,
    pub agent_explanations: Vec<String>,
    pub decision_audit_trail: Map<String, Value>,
    /// "ANALYSIS" for decisions that did not execute, otherwise "TRADE".
    pub status: String,
    /// Agents whose structured response was truncated or unparseable.
    pub incomplete_agents: Vec<String>,
}

/// A trade record written by the rule engine or the execution agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub trade_id: String,
    pub order_id: String,
    pub rule_id: Option<String>,
    pub instrument: String,
    pub direction: TradeDirection,
    pub quantity: f64,
    pub entry_price: f64,
    pub filled_price: f64,
    pub stop_loss_pct: f64,
    pub target_pct: f64,
    pub timestamp: DateTime<Utc>,
    pub status: String,
    pub paper_trading: bool,
}

// ---------------------------------------------------------------------------
// Store trait
// ---------------------------------------------------------------------------

/// Persistence gateway for the engine. Single-document writes only.
#[async_trait]
pub trait DecisionStore: Send + Sync {
    async fn insert_decision(&self, record: DecisionRecord);
    async fn insert_trade(&self, record: TradeRecord);
    async fn insert_alert(&self, alert: Alert);
    /// Upsert-style increment of a provider's usage counter.
    async fn increment_provider_usage(&self, provider: &str);
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

/// Process-local store used for paper runs and tests. A production
/// deployment substitutes a document-database gateway behind the same trait.
#[derive(Default)]
pub struct MemoryStore {
    pub decisions: Mutex<Vec<DecisionRecord>>,
    pub trades: Mutex<Vec<TradeRecord>>,
    pub alerts: Mutex<Vec<Alert>>,
    pub provider_usage: Mutex<HashMap<String, u64>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DecisionStore for MemoryStore {
    async fn insert_decision(&self, record: DecisionRecord) {
        self.decisions.lock().push(record);
    }

    async fn insert_trade(&self, record: TradeRecord) {
        self.trades.lock().push(record);
    }

    async fn insert_alert(&self, alert: Alert) {
        self.alerts.lock().push(alert);
    }

    async fn increment_provider_usage(&self, provider: &str) {
        *self
            .provider_usage
            .lock()
            .entry(provider.to_string())
            .or_insert(0) += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::Severity;

    #[tokio::test]
    async fn provider_usage_counts_upsert() {
        let store = MemoryStore::new();
        store.increment_provider_usage("alpha").await;
        store.increment_provider_usage("alpha").await;
        store.increment_provider_usage("beta").await;

        let usage = store.provider_usage.lock();
        assert_eq!(usage.get("alpha"), Some(&2));
        assert_eq!(usage.get("beta"), Some(&1));
    }

    #[tokio::test]
    async fn alert_insert() {
        let store = MemoryStore::new();
        store
            .insert_alert(Alert::new(
                "analysis_incomplete",
                Severity::Warning,
                "sentiment incomplete",
                serde_json::json!({"agents": ["sentiment"]}),
                "graph",
            ))
            .await;
        assert_eq!(store.alerts.lock().len(), 1);
    }
}
