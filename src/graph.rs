// =============================================================================
// Orchestration Graph — fan-out cohorts, barrier joins, shared-state reduce
// =============================================================================
//
// Topology:
//
//   START ──► technical, fundamental, sentiment, macro   (4-way fan-out)
//              │
//              ▼
//          bull, bear                                    (debate, parallel)
//              │
//              ▼
//          aggressive, conservative, neutral risk        (3-way parallel)
//              │
//              ▼
//          portfolio_manager ──► execution ──► END
//
// Cohort members run concurrently; the join is a barrier and their partial
// updates are reduced before any downstream node sees the state. The whole
// run is one future: cancelling it (the scheduler's 5-minute deadline)
// abandons in-flight LLM calls and persists nothing.
// =============================================================================

use futures_util::future::join_all;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};
use uuid::Uuid;

use crate::agents::{Agent, AgentError};
use crate::alerts::{Alert, AlertRouter, Severity};
use crate::instrument::InstrumentProfile;
use crate::llm::manager::ProviderManager;
use crate::state::{DecisionState, StateUpdate};
use crate::store::{DecisionRecord, DecisionStore};
use crate::types::Signal;

pub struct TradingGraph {
    analysis: Vec<Arc<dyn Agent>>,
    debate: Vec<Arc<dyn Agent>>,
    risk: Vec<Arc<dyn Agent>>,
    portfolio: Arc<dyn Agent>,
    execution: Arc<dyn Agent>,
    manager: Arc<ProviderManager>,
    store: Arc<dyn DecisionStore>,
    alerts: AlertRouter,
    profile: Arc<InstrumentProfile>,
}

impl TradingGraph {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        analysis: Vec<Arc<dyn Agent>>,
        debate: Vec<Arc<dyn Agent>>,
        risk: Vec<Arc<dyn Agent>>,
        portfolio: Arc<dyn Agent>,
        execution: Arc<dyn Agent>,
        manager: Arc<ProviderManager>,
        store: Arc<dyn DecisionStore>,
        alerts: AlertRouter,
        profile: Arc<InstrumentProfile>,
    ) -> Self {
        Self {
            analysis,
            debate,
            risk,
            portfolio,
            execution,
            manager,
            store,
            alerts,
            profile,
        }
    }

    /// Execute the full DAG over `state` and persist the decision record.
    pub async fn run(&self, mut state: DecisionState) -> Result<DecisionState, AgentError> {
        let run_id = Uuid::new_v4();
        let run_start = Instant::now();
        info!(%run_id, price = state.current_price, "starting graph run");

        let analysis_cohort = format!("analysis:{run_id}");
        let debate_cohort = format!("debate:{run_id}");
        let risk_cohort = format!("risk:{run_id}");

        let result = self.run_nodes(&mut state, &analysis_cohort, &debate_cohort, &risk_cohort).await;

        // Cohort assignment history is per-run; drop it at the barrier exit.
        for cohort in [&analysis_cohort, &debate_cohort, &risk_cohort] {
            self.manager.clear_cohort(cohort);
        }

        match result {
            Ok(()) => {
                self.finalize(&state).await;
                info!(
                    %run_id,
                    signal = %state.final_signal,
                    total_ms = run_start.elapsed().as_millis() as u64,
                    "graph run complete"
                );
                Ok(state)
            }
            Err(e) => {
                error!(%run_id, error = %e, "graph run failed");
                Err(e)
            }
        }
    }

    async fn run_nodes(
        &self,
        state: &mut DecisionState,
        analysis_cohort: &str,
        debate_cohort: &str,
        risk_cohort: &str,
    ) -> Result<(), AgentError> {
        self.run_cohort(state, &self.analysis, Some(analysis_cohort)).await?;
        self.run_cohort(state, &self.debate, Some(debate_cohort)).await?;
        self.run_cohort(state, &self.risk, Some(risk_cohort)).await?;

        for agent in [&self.portfolio, &self.execution] {
            let update = Self::run_node(agent.as_ref(), state, None).await?;
            state.apply(update);
        }
        Ok(())
    }

    /// Run one parallel cohort to its barrier and reduce the partials.
    async fn run_cohort(
        &self,
        state: &mut DecisionState,
        agents: &[Arc<dyn Agent>],
        cohort: Option<&str>,
    ) -> Result<(), AgentError> {
        let snapshot: &DecisionState = state;
        let futures = agents
            .iter()
            .map(|agent| Self::run_node(agent.as_ref(), snapshot, cohort));
        let results = join_all(futures).await;

        let mut merged = StateUpdate::default();
        for result in results {
            merged = merged.merge(result?);
        }
        state.apply(merged);
        Ok(())
    }

    async fn run_node(
        agent: &dyn Agent,
        state: &DecisionState,
        cohort: Option<&str>,
    ) -> Result<StateUpdate, AgentError> {
        let name = agent.name();
        info!(node = name, "executing {name}");
        let started = Instant::now();

        match agent.process(state, cohort).await {
            Ok(update) => {
                info!(
                    node = name,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "{name} completed"
                );
                Ok(update)
            }
            Err(e) => {
                error!(node = name, error = %e, "{name} failed");
                Err(e)
            }
        }
    }

    /// Persist the decision record (HOLD included) and raise the
    /// incomplete-analysis alert when any agent flagged its slot.
    async fn finalize(&self, state: &DecisionState) {
        let incomplete = state.incomplete_agents();
        if !incomplete.is_empty() {
            self.alerts.send(Alert::new(
                "analysis_incomplete",
                Severity::Warning,
                format!("incomplete agent analyses: {}", incomplete.join(", ")),
                serde_json::json!({ "agents": incomplete }),
                "trading_graph",
            ));
        }

        let status = if state.order_id.is_empty() {
            "ANALYSIS"
        } else {
            "TRADE"
        };

        let mut agent_decisions = serde_json::Map::new();
        agent_decisions.insert(
            "technical".to_string(),
            serde_json::Value::Object(state.technical.clone()),
        );
        agent_decisions.insert(
            "fundamental".to_string(),
            serde_json::Value::Object(state.fundamental.clone()),
        );
        agent_decisions.insert(
            "sentiment".to_string(),
            serde_json::Value::Object(state.sentiment.clone()),
        );
        agent_decisions.insert(
            "macro".to_string(),
            serde_json::Value::Object(state.macro_analysis.clone()),
        );
        agent_decisions.insert(
            "bull".to_string(),
            serde_json::json!({
                "thesis": state.bull_thesis,
                "confidence": state.bull_confidence,
            }),
        );
        agent_decisions.insert(
            "bear".to_string(),
            serde_json::json!({
                "thesis": state.bear_thesis,
                "confidence": state.bear_confidence,
            }),
        );
        agent_decisions.insert(
            "aggressive_risk".to_string(),
            serde_json::Value::Object(state.aggressive_risk.clone()),
        );
        agent_decisions.insert(
            "conservative_risk".to_string(),
            serde_json::Value::Object(state.conservative_risk.clone()),
        );
        agent_decisions.insert(
            "neutral_risk".to_string(),
            serde_json::Value::Object(state.neutral_risk.clone()),
        );
        if let Some(pm) = state.decision_audit_trail.get("portfolio_manager_output") {
            agent_decisions.insert("portfolio_manager".to_string(), pm.clone());
        }

        let record = DecisionRecord {
            timestamp: chrono::Utc::now(),
            instrument: self.profile.symbol.clone(),
            venue: self.profile.venue.clone(),
            data_source: self.profile.data_source.clone(),
            llm_provider: self.manager.current_provider(),
            current_price: state.current_price,
            final_signal: state.final_signal,
            trend_signal: state.trend_signal,
            position_size: state.position_size,
            entry_price: state.entry_price,
            stop_loss: state.stop_loss,
            take_profit: state.take_profit,
            agent_decisions,
            agent_explanations: state.agent_explanations.clone(),
            decision_audit_trail: state.decision_audit_trail.clone(),
            status: status.to_string(),
            incomplete_agents: state.incomplete_agents(),
        };

        self.store.insert_decision(record).await;
        info!(signal = %state.final_signal, status, "decision record persisted");
    }
}

/// Levels invariant: executable signals carry real levels.
pub fn decision_is_well_formed(state: &DecisionState) -> bool {
    match state.final_signal {
        Signal::Buy | Signal::Sell => {
            state.position_size > 0.0
                && state.stop_loss != state.entry_price
                && state.take_profit != state.entry_price
        }
        _ => true,
    }
}
