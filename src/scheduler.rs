// =============================================================================
// Three-Layer Scheduler — Strategic / Tactical / Execution loops
// =============================================================================
//
//   Strategic (default 15 min, instrument-tuned): build the market snapshot,
//     run the orchestration graph under a 5-minute hard deadline, then ask
//     the planner for a fresh rule bundle. Runs once immediately on start.
//   Tactical (default 3 min, first fire after 1 min): cheap validation of
//     the current strategy against live price and volatility. It only logs;
//     it never triggers an early graph run.
//   Execution (~10 Hz): poll the latest tick and the active bundle from the
//     cache and let the rule engine evaluate and execute.
//
// The three loops share no in-process mutable state beyond the cache and
// the store; the RuleBundle in the cache is the canonical Strategic ->
// Execution hand-off. All loops observe the shutdown watch at their sleep
// boundaries.
// =============================================================================

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::cache::{self, KeyValueCache, RULE_BUNDLE_KEY};
use crate::graph::TradingGraph;
use crate::instrument::InstrumentProfile;
use crate::market::{MarketDataFeed, NewsFeed, Tick, Timeframe};
use crate::planner::StrategyPlanner;
use crate::rules::{RuleBundle, RuleEngine};
use crate::state::DecisionState;
use crate::types::Signal;

/// Hard deadline for one strategic graph run.
pub const GRAPH_DEADLINE: Duration = Duration::from_secs(300);

/// Back-off after a strategic failure or timeout.
const STRATEGIC_RETRY_WAIT: Duration = Duration::from_secs(60);

/// Delay before the tactical loop's first validation.
const TACTICAL_WARMUP: Duration = Duration::from_secs(60);

/// Back-off after an execution-loop error.
const EXECUTION_ERROR_WAIT: Duration = Duration::from_secs(1);

/// What the tactical loop validates against.
#[derive(Debug, Clone)]
struct StrategySnapshot {
    strategy_id: String,
    signal: Signal,
    entry_price: f64,
    created_at: DateTime<Utc>,
}

pub struct TradingService {
    graph: Arc<TradingGraph>,
    planner: Arc<StrategyPlanner>,
    rule_engine: tokio::sync::Mutex<RuleEngine>,
    market: Arc<dyn MarketDataFeed>,
    news: Arc<dyn NewsFeed>,
    cache: Arc<dyn KeyValueCache>,
    profile: Arc<InstrumentProfile>,
    last_strategy: RwLock<Option<StrategySnapshot>>,
    strategic_interval: Duration,
    tactical_interval: Duration,
    execution_poll: Duration,
    shutdown: watch::Receiver<bool>,
}

impl TradingService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        graph: Arc<TradingGraph>,
        planner: Arc<StrategyPlanner>,
        rule_engine: RuleEngine,
        market: Arc<dyn MarketDataFeed>,
        news: Arc<dyn NewsFeed>,
        cache: Arc<dyn KeyValueCache>,
        profile: Arc<InstrumentProfile>,
        strategic_minutes: Option<u64>,
        tactical_minutes: u64,
        execution_poll_ms: u64,
        shutdown: watch::Receiver<bool>,
    ) -> Arc<Self> {
        // Instrument profile supplies the cadence unless configured.
        let strategic_minutes = strategic_minutes.unwrap_or(profile.optimal_cadence_minutes);

        info!(
            strategic_min = strategic_minutes,
            tactical_min = tactical_minutes,
            execution_ms = execution_poll_ms,
            "trading service configured"
        );

        Arc::new(Self {
            graph,
            planner,
            rule_engine: tokio::sync::Mutex::new(rule_engine),
            market,
            news,
            cache,
            profile,
            last_strategy: RwLock::new(None),
            strategic_interval: Duration::from_secs(strategic_minutes * 60),
            tactical_interval: Duration::from_secs(tactical_minutes * 60),
            execution_poll: Duration::from_millis(execution_poll_ms.max(10)),
            shutdown,
        })
    }

    /// Run all three layers until shutdown.
    pub async fn run(self: Arc<Self>) {
        let strategic = {
            let service = Arc::clone(&self);
            tokio::spawn(async move { service.strategic_loop().await })
        };
        let tactical = {
            let service = Arc::clone(&self);
            tokio::spawn(async move { service.tactical_loop().await })
        };
        let execution = {
            let service = Arc::clone(&self);
            tokio::spawn(async move { service.execution_loop().await })
        };

        let _ = tokio::join!(strategic, tactical, execution);
        info!("trading service stopped");
    }

    /// Sleep that returns `true` when shutdown was requested instead.
    /// A dropped sender counts as shutdown.
    async fn sleep_or_shutdown(&self, duration: Duration) -> bool {
        let mut shutdown = self.shutdown.clone();
        tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
        }
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    // -------------------------------------------------------------------------
    // Layer 1: Strategic
    // -------------------------------------------------------------------------

    async fn strategic_loop(&self) {
        info!("strategic layer started");

        // First cycle fires immediately.
        loop {
            if self.is_shutting_down() {
                break;
            }

            let completed = self.run_strategic_cycle().await;
            let wait = if completed {
                self.strategic_interval
            } else {
                STRATEGIC_RETRY_WAIT
            };
            if self.sleep_or_shutdown(wait).await {
                break;
            }
        }
        info!("strategic layer stopped");
    }

    /// One strategic cycle: graph under deadline, then the planner.
    ///
    /// Returns false when the cycle was skipped (timeout or error) so the
    /// caller applies the short retry wait.
    pub async fn run_strategic_cycle(&self) -> bool {
        info!("strategic cycle starting");
        let state = self.build_state().await;

        let completed = match tokio::time::timeout(GRAPH_DEADLINE, self.graph.run(state)).await {
            Ok(Ok(final_state)) => {
                *self.last_strategy.write() = Some(StrategySnapshot {
                    strategy_id: format!("graph_{}", Utc::now().format("%Y%m%d_%H%M%S")),
                    signal: final_state.final_signal,
                    entry_price: if final_state.entry_price > 0.0 {
                        final_state.entry_price
                    } else {
                        final_state.current_price
                    },
                    created_at: Utc::now(),
                });
                true
            }
            Ok(Err(e)) => {
                error!(error = %e, "graph run failed; skipping cycle");
                false
            }
            Err(_) => {
                // Deadline expiry cancels the in-flight run; nothing was
                // persisted for it.
                warn!(deadline_s = GRAPH_DEADLINE.as_secs(), "graph run exceeded deadline; cycle skipped");
                false
            }
        };

        if completed {
            if self.planner.generate_rules().await.is_none() {
                warn!("planner produced no rules this cycle");
            }
        }

        completed
    }

    /// Assemble the DecisionState snapshot from the adapters.
    async fn build_state(&self) -> DecisionState {
        let instrument = &self.profile.symbol;
        let mut state = DecisionState::default();
        state.current_time = Some(Utc::now());

        if let Some(tick) = self.market.latest_tick(instrument).await {
            // Hand the tick to the execution layer through the cache, the
            // way an ingestion adapter would.
            cache::set_json(
                self.cache.as_ref(),
                &cache::tick_key(instrument),
                &tick,
                cache::TICK_TTL,
            )
            .await;

            state.current_price = tick.price;
            state.best_bid = tick.best_bid;
            state.best_ask = tick.best_ask;
            state.bid_depth = tick.bid_depth;
            state.ask_depth = tick.ask_depth;
            state.total_buy_qty = tick.total_buy_qty;
            state.total_sell_qty = tick.total_sell_qty;
        }

        for timeframe in [
            Timeframe::M1,
            Timeframe::M5,
            Timeframe::M15,
            Timeframe::H1,
            Timeframe::D1,
        ] {
            let candles = self.market.recent_ohlc(instrument, timeframe, 100).await;
            if !candles.is_empty() {
                state.ohlc.insert(timeframe, candles);
            }
        }

        state.latest_news = self.news.latest_news(instrument, 20).await;
        if let Some(summary) = self.news.sentiment_summary(instrument, 24).await {
            state.sentiment_score = summary.average.clamp(-1.0, 1.0);
        }

        state
    }

    // -------------------------------------------------------------------------
    // Layer 2: Tactical
    // -------------------------------------------------------------------------

    async fn tactical_loop(&self) {
        info!("tactical layer started");
        if self.sleep_or_shutdown(TACTICAL_WARMUP).await {
            return;
        }

        loop {
            if self.is_shutting_down() {
                break;
            }
            if let Err(e) = self.tactical_validation().await {
                error!(error = %e, "tactical validation error");
                if self.sleep_or_shutdown(STRATEGIC_RETRY_WAIT).await {
                    break;
                }
                continue;
            }
            if self.sleep_or_shutdown(self.tactical_interval).await {
                break;
            }
        }
        info!("tactical layer stopped");
    }

    /// Quick validation: strategy validity, price drift, volatility proxy.
    /// Significant change is logged for the next strategic cycle; a new
    /// graph run is never triggered early (avoids over-trading).
    async fn tactical_validation(&self) -> anyhow::Result<()> {
        let snapshot = match self.last_strategy.read().clone() {
            Some(s) => s,
            None => {
                debug!("no current strategy to validate");
                return Ok(());
            }
        };

        let bundle: Option<RuleBundle> =
            cache::get_json(self.cache.as_ref(), RULE_BUNDLE_KEY).await;
        let bundle_current = bundle
            .map(|b| b.is_current(Utc::now()))
            .unwrap_or(false);
        if !bundle_current {
            warn!(
                strategy_id = %snapshot.strategy_id,
                "active rule bundle expired; strategic layer will publish a new one"
            );
            return Ok(());
        }

        let instrument = &self.profile.symbol;
        let tick: Option<Tick> =
            cache::get_json(self.cache.as_ref(), &cache::tick_key(instrument)).await;
        let current_price = match tick {
            Some(t) => t.price,
            None => return Ok(()),
        };

        let price_change_pct = if snapshot.entry_price > 0.0 {
            ((current_price - snapshot.entry_price) / snapshot.entry_price * 100.0).abs()
        } else {
            0.0
        };

        // Volatility proxy from the last 10 one-minute closes.
        let candles = self.market.recent_ohlc(instrument, Timeframe::M1, 10).await;
        let volatility_pct = volatility_proxy(&candles.iter().map(|c| c.close).collect::<Vec<_>>());

        info!(
            signal = %snapshot.signal,
            price = current_price,
            change_pct = format!("{price_change_pct:.2}"),
            "tactical validation"
        );

        let price_threshold = if snapshot.signal == Signal::Hold {
            1.5
        } else {
            2.5
        };

        let mut reasons = Vec::new();
        if price_change_pct > price_threshold {
            reasons.push(format!("price moved {price_change_pct:.2}%"));
        }
        if let Some(v) = volatility_pct {
            if v > 3.0 {
                reasons.push(format!("volatility spike: {v:.2}%"));
            }
        }

        if !reasons.is_empty() {
            warn!(
                strategy_id = %snapshot.strategy_id,
                reasons = %reasons.join(", "),
                "significant market change; next strategic cycle should revisit the strategy"
            );
        }

        Ok(())
    }

    // -------------------------------------------------------------------------
    // Layer 3: Execution
    // -------------------------------------------------------------------------

    async fn execution_loop(&self) {
        info!("execution layer started");

        loop {
            if self.is_shutting_down() {
                break;
            }

            let wait = match self.execution_tick().await {
                Ok(()) => self.execution_poll,
                Err(e) => {
                    error!(error = %e, "execution layer error");
                    EXECUTION_ERROR_WAIT
                }
            };
            if self.sleep_or_shutdown(wait).await {
                break;
            }
        }
        info!("execution layer stopped");
    }

    /// One execution poll: tick + current bundle -> rule engine.
    async fn execution_tick(&self) -> anyhow::Result<()> {
        let instrument = &self.profile.symbol;
        let tick: Option<Tick> =
            cache::get_json(self.cache.as_ref(), &cache::tick_key(instrument)).await;
        let tick = match tick {
            Some(t) => t,
            None => return Ok(()),
        };

        let bundle: Option<RuleBundle> =
            cache::get_json(self.cache.as_ref(), RULE_BUNDLE_KEY).await;
        let bundle = match bundle {
            Some(b) if b.is_current(Utc::now()) => b,
            // Absence or expiry means "no active rules".
            _ => return Ok(()),
        };

        let mut engine = self.rule_engine.lock().await;
        let records = engine.evaluate_and_execute(&bundle, &tick).await;
        if !records.is_empty() {
            info!(trades = records.len(), "execution layer placed trades");
        }
        Ok(())
    }
}

/// Relative standard deviation of closes, in percent.
fn volatility_proxy(closes: &[f64]) -> Option<f64> {
    if closes.len() < 2 {
        return None;
    }
    let mean = closes.iter().sum::<f64>() / closes.len() as f64;
    if mean == 0.0 {
        return None;
    }
    let variance = closes.iter().map(|c| (c - mean).powi(2)).sum::<f64>() / closes.len() as f64;
    Some(variance.sqrt() / mean * 100.0)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{Agent, AgentContext, AgentError};
    use crate::alerts::AlertRouter;
    use crate::broker::PaperBroker;
    use crate::cache::MemoryCache;
    use crate::config::{EngineConfig, ProviderEntry};
    use crate::llm::client::{ChatClient, ChatMessage, ChatResponse};
    use crate::llm::manager::ProviderManager;
    use crate::llm::prompts::PromptStore;
    use crate::llm::provider::ProviderConfig;
    use crate::llm::LlmError;
    use crate::rules::{Condition, Rule, RuleBundle};
    use crate::state::StateUpdate;
    use crate::store::{DecisionStore, MemoryStore};
    use crate::types::TradeDirection;
    use async_trait::async_trait;

    #[test]
    fn volatility_proxy_flat_series_is_zero() {
        let closes = vec![100.0; 10];
        assert_eq!(volatility_proxy(&closes), Some(0.0));
    }

    #[test]
    fn volatility_proxy_detects_spread() {
        let closes = vec![90.0, 110.0, 90.0, 110.0, 90.0, 110.0];
        let v = volatility_proxy(&closes).unwrap();
        assert!(v > 5.0, "expected a large proxy, got {v}");
    }

    #[test]
    fn volatility_proxy_needs_two_points() {
        assert!(volatility_proxy(&[100.0]).is_none());
        assert!(volatility_proxy(&[]).is_none());
    }

    // ---- service harness ---------------------------------------------------

    /// Transport that always answers with a fixed planner bundle.
    struct PlannerOnlyClient;

    #[async_trait]
    impl ChatClient for PlannerOnlyClient {
        async fn chat_completion(
            &self,
            _base_url: &str,
            _api_key: &str,
            _model: &str,
            _messages: &[ChatMessage],
            _max_tokens: u32,
            _temperature: f64,
        ) -> Result<ChatResponse, LlmError> {
            Ok(ChatResponse {
                text: format!(
                    r#"{{"strategy_id": "s1",
                         "valid_until": "{}",
                         "rules": [{{
                             "rule_id": "r1", "name": "breakout",
                             "scenario_type": "CURRENT", "direction": "BUY",
                             "instrument": "BTCUSDT",
                             "conditions": [{{"type": "price_above", "value": 1.0}}],
                             "position_size": {{"risk_pct": 0.5}},
                             "stop_loss": {{"price_pct": 2.0}},
                             "target": {{"price_pct": 5.0}},
                             "max_trades": 1
                         }}]}}"#,
                    (Utc::now() + chrono::Duration::minutes(20)).to_rfc3339()
                ),
                tokens_used: Some(10),
            })
        }
    }

    /// Agent that never finishes within the graph deadline.
    struct HangingAgent;

    #[async_trait]
    impl Agent for HangingAgent {
        fn name(&self) -> &'static str {
            "technical"
        }

        async fn process(
            &self,
            _state: &DecisionState,
            _cohort: Option<&str>,
        ) -> Result<StateUpdate, AgentError> {
            tokio::time::sleep(Duration::from_secs(600)).await;
            Ok(StateUpdate::default())
        }
    }

    /// Agent that completes instantly with an empty update.
    struct InstantAgent(&'static str);

    #[async_trait]
    impl Agent for InstantAgent {
        fn name(&self) -> &'static str {
            self.0
        }

        async fn process(
            &self,
            _state: &DecisionState,
            _cohort: Option<&str>,
        ) -> Result<StateUpdate, AgentError> {
            Ok(StateUpdate::default())
        }
    }

    struct ServiceHarness {
        service: Arc<TradingService>,
        store: Arc<MemoryStore>,
        cache: Arc<MemoryCache>,
        broker: Arc<PaperBroker>,
    }

    fn service_with_analysis(analysis: Vec<Arc<dyn Agent>>) -> ServiceHarness {
        let client: Arc<dyn ChatClient> = Arc::new(PlannerOnlyClient);
        let store = Arc::new(MemoryStore::new());
        let broker = Arc::new(PaperBroker::new());
        let shared_cache = Arc::new(MemoryCache::new());
        let (alerts, _alerts_rx) = AlertRouter::new();

        let mut config = EngineConfig::default();
        config.llm.providers = vec![ProviderEntry {
            name: "alpha".to_string(),
            base_url: "https://alpha.example/v1".to_string(),
            api_keys: vec!["k".to_string()],
            models: vec!["m".to_string()],
            priority: 0,
            rate_limit_per_minute: 200,
            rate_limit_per_day: 100_000,
            daily_token_quota: None,
        }];
        let config = Arc::new(config);

        let providers = config
            .llm
            .providers
            .iter()
            .map(ProviderConfig::from_entry)
            .collect();
        let manager = ProviderManager::new(
            &config.llm,
            config.features.clone(),
            Arc::clone(&client),
            alerts.clone(),
            Arc::clone(&store) as Arc<dyn DecisionStore>,
            providers,
        );

        let profile = Arc::new(InstrumentProfile::detect("BTCUSDT", "BINANCE", "BINANCE"));
        let prompts = Arc::new(PromptStore::new(profile.symbol.clone()));
        let ctx = AgentContext {
            manager: Arc::clone(&manager),
            prompts,
            profile: Arc::clone(&profile),
            config: Arc::clone(&config),
        };

        let market: Arc<crate::market::StaticMarketFeed> =
            Arc::new(crate::market::StaticMarketFeed::new());
        market.set_tick(Tick {
            instrument: "BTCUSDT".to_string(),
            price: 60_000.0,
            best_bid: Some(59_999.0),
            best_ask: Some(60_001.0),
            bid_depth: Vec::new(),
            ask_depth: Vec::new(),
            total_buy_qty: 10.0,
            total_sell_qty: 10.0,
            volume: Some(1.0),
            timestamp: Utc::now(),
        });
        let news = Arc::new(crate::market::StaticNewsFeed::new());

        let graph = Arc::new(TradingGraph::new(
            analysis,
            Vec::new(),
            Vec::new(),
            Arc::new(InstantAgent("portfolio_manager")),
            Arc::new(InstantAgent("execution")),
            Arc::clone(&manager),
            Arc::clone(&store) as Arc<dyn DecisionStore>,
            alerts,
            Arc::clone(&profile),
        ));

        let planner = Arc::new(StrategyPlanner::new(
            ctx,
            Arc::clone(&market) as Arc<dyn MarketDataFeed>,
            None,
            Arc::clone(&shared_cache) as Arc<dyn KeyValueCache>,
            15,
        ));

        let rule_engine = RuleEngine::new(
            Arc::clone(&broker) as Arc<dyn crate::broker::BrokerAdapter>,
            Arc::clone(&store) as Arc<dyn DecisionStore>,
            true,
            1_000_000.0,
        );

        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let service = TradingService::new(
            graph,
            planner,
            rule_engine,
            Arc::clone(&market) as Arc<dyn MarketDataFeed>,
            news,
            Arc::clone(&shared_cache) as Arc<dyn KeyValueCache>,
            profile,
            Some(15),
            3,
            100,
            shutdown_rx,
        );

        ServiceHarness {
            service,
            store,
            cache: shared_cache,
            broker,
        }
    }

    /// A strategic run past the 300 s deadline is cancelled: no decision is
    /// persisted and the cycle reports "skipped" so the retry wait applies.
    #[tokio::test(start_paused = true)]
    async fn strategic_deadline_cancels_run_without_persisting() {
        let h = service_with_analysis(vec![Arc::new(HangingAgent)]);

        let completed = h.service.run_strategic_cycle().await;

        assert!(!completed, "timed-out cycle must report as skipped");
        assert!(
            h.store.decisions.lock().is_empty(),
            "no decision record may be persisted for a cancelled run"
        );
        // No bundle either: the planner only runs after a completed graph.
        let bundle: Option<RuleBundle> =
            cache::get_json(h.cache.as_ref(), RULE_BUNDLE_KEY).await;
        assert!(bundle.is_none());
    }

    /// Happy path: graph completes, decision persists, bundle publishes.
    #[tokio::test(start_paused = true)]
    async fn strategic_cycle_persists_decision_and_publishes_bundle() {
        let h = service_with_analysis(vec![Arc::new(InstantAgent("technical"))]);

        let completed = h.service.run_strategic_cycle().await;

        assert!(completed);
        assert_eq!(h.store.decisions.lock().len(), 1);

        let bundle: Option<RuleBundle> =
            cache::get_json(h.cache.as_ref(), RULE_BUNDLE_KEY).await;
        let bundle = bundle.expect("bundle must be published");
        assert_eq!(bundle.strategy_id, "s1");
        assert_eq!(bundle.rules.len(), 1);
    }

    /// The execution layer reads the cache hand-off and trades through the
    /// rule engine.
    #[tokio::test(start_paused = true)]
    async fn execution_tick_trades_on_active_bundle() {
        let h = service_with_analysis(vec![Arc::new(InstantAgent("technical"))]);

        // Strategic cycle publishes the tick and the bundle.
        assert!(h.service.run_strategic_cycle().await);

        // Rule: price_above 1.0 always matches at 60,000.
        h.service.execution_tick().await.unwrap();

        assert_eq!(h.broker.fills().len(), 1, "rule should have traded once");
        let trades = h.store.trades.lock();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].rule_id.as_deref(), Some("r1"));
        assert_eq!(trades[0].direction, TradeDirection::Buy);

        // Same rule again: max_trades=1 caps it.
        drop(trades);
        h.service.execution_tick().await.unwrap();
        assert_eq!(h.broker.fills().len(), 1);
    }

    /// An expired bundle in the cache reads as "no active rules".
    #[tokio::test(start_paused = true)]
    async fn expired_bundle_is_ignored_by_execution() {
        let h = service_with_analysis(vec![Arc::new(InstantAgent("technical"))]);
        assert!(h.service.run_strategic_cycle().await);

        // Overwrite with an already-expired bundle (clock-skew shape).
        let expired = RuleBundle {
            strategy_id: "old".to_string(),
            valid_until: Utc::now() - chrono::Duration::seconds(1),
            rules: vec![Rule {
                rule_id: "r9".to_string(),
                name: "stale".to_string(),
                direction: TradeDirection::Buy,
                instrument: "BTCUSDT".to_string(),
                conditions: vec![Condition::PriceAbove { value: 1.0 }],
                risk_pct: 0.5,
                stop_loss_pct: 2.0,
                target_pct: 5.0,
                max_trades: 1,
                trades_executed: 0,
                scenario: None,
            }],
        };
        cache::set_json(
            h.cache.as_ref(),
            RULE_BUNDLE_KEY,
            &expired,
            Duration::from_secs(60),
        )
        .await;

        h.service.execution_tick().await.unwrap();
        assert!(h.broker.fills().is_empty(), "expired bundle must not trade");
    }
}
