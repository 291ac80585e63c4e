// =============================================================================
// Quorum Trading Engine — Main Entry Point
// =============================================================================
//
// Wires the LLM provider pool, the nine-agent orchestration graph, the
// strategy planner, the rule engine, and the three-layer scheduler. All
// external collaborators (market data, news, broker, cache, store) are
// injected behind traits; the default wiring runs fully in-process with a
// paper broker so the engine is safe out of the box.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod agents;
mod alerts;
mod broker;
mod cache;
mod config;
mod graph;
mod indicators;
mod instrument;
mod llm;
mod market;
mod planner;
mod rules;
mod scheduler;
mod state;
mod store;
mod types;

use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::agents::debate::ResearcherAgent;
use crate::agents::execution::ExecutionAgent;
use crate::agents::fundamental::FundamentalAgent;
use crate::agents::macro_analysis::MacroAgent;
use crate::agents::portfolio::PortfolioManagerAgent;
use crate::agents::risk::{RiskAgent, RiskProfile};
use crate::agents::sentiment::SentimentAgent;
use crate::agents::technical::TechnicalAgent;
use crate::agents::{Agent, AgentContext};
use crate::alerts::AlertRouter;
use crate::broker::PaperBroker;
use crate::cache::MemoryCache;
use crate::config::EngineConfig;
use crate::graph::TradingGraph;
use crate::instrument::InstrumentProfile;
use crate::llm::client::HttpChatClient;
use crate::llm::manager::ProviderManager;
use crate::llm::prompts::PromptStore;
use crate::llm::provider::ProviderConfig;
use crate::market::{StaticMarketFeed, StaticNewsFeed};
use crate::planner::StrategyPlanner;
use crate::rules::RuleEngine;
use crate::scheduler::TradingService;
use crate::store::{DecisionStore, MemoryStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Quorum Trading Engine starting up");

    let config = EngineConfig::load("engine_config.json").unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        let mut config = EngineConfig::default();
        config.merge_env_keys();
        config
    });
    let config = Arc::new(config);

    // ── 2. Instrument profile ────────────────────────────────────────────
    let profile = Arc::new(InstrumentProfile::detect(
        &config.instrument.symbol,
        &config.instrument.venue,
        &config.instrument.data_source,
    ));

    // ── 3. Shared infrastructure ─────────────────────────────────────────
    let store = Arc::new(MemoryStore::new());
    let shared_cache = Arc::new(MemoryCache::new());
    let (alerts, mut alerts_rx) = AlertRouter::new();

    // Alert drain: persist every routed alert; failures here never touch
    // the trading path.
    {
        let store = Arc::clone(&store);
        tokio::spawn(async move {
            while let Some(alert) = alerts_rx.recv().await {
                store.insert_alert(alert).await;
            }
        });
    }

    // ── 4. LLM provider pool ─────────────────────────────────────────────
    let usable = config.usable_providers();
    if usable.is_empty() {
        warn!("no LLM providers with API keys configured; agents will run on defaults");
    }
    let providers: Vec<ProviderConfig> = usable.iter().map(ProviderConfig::from_entry).collect();

    let manager = ProviderManager::new(
        &config.llm,
        config.features.clone(),
        Arc::new(HttpChatClient::new()),
        alerts.clone(),
        Arc::clone(&store) as Arc<dyn store::DecisionStore>,
        providers,
    );

    // ── 5. Shutdown plumbing ─────────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let health_handle = if config.features.health_monitoring {
        Some(manager.spawn_health_loop(shutdown_rx.clone()))
    } else {
        None
    };

    // ── 6. Agents and graph ──────────────────────────────────────────────
    let prompts = Arc::new(PromptStore::new(profile.symbol.clone()));
    let ctx = AgentContext {
        manager: Arc::clone(&manager),
        prompts,
        profile: Arc::clone(&profile),
        config: Arc::clone(&config),
    };

    let broker = Arc::new(PaperBroker::new());
    if !config.features.paper_trading {
        // A live venue adapter plugs in behind the same trait; the shipped
        // binary refuses to pretend it has one.
        warn!("live trading requested but no venue adapter is wired; staying on paper");
    }

    let analysis: Vec<Arc<dyn Agent>> = vec![
        Arc::new(TechnicalAgent::new(ctx.clone())),
        Arc::new(FundamentalAgent::new(ctx.clone())),
        Arc::new(SentimentAgent::new(ctx.clone())),
        Arc::new(MacroAgent::new(ctx.clone())),
    ];
    let debate: Vec<Arc<dyn Agent>> = vec![
        Arc::new(ResearcherAgent::bull(ctx.clone())),
        Arc::new(ResearcherAgent::bear(ctx.clone())),
    ];
    let risk: Vec<Arc<dyn Agent>> = vec![
        Arc::new(RiskAgent::new(
            RiskProfile::Aggressive,
            config.risk.aggressive.clone(),
            config.risk.account_value,
        )),
        Arc::new(RiskAgent::new(
            RiskProfile::Conservative,
            config.risk.conservative.clone(),
            config.risk.account_value,
        )),
        Arc::new(RiskAgent::new(
            RiskProfile::Neutral,
            config.risk.neutral.clone(),
            config.risk.account_value,
        )),
    ];
    let portfolio: Arc<dyn Agent> = Arc::new(PortfolioManagerAgent::new(ctx.clone()));
    let execution: Arc<dyn Agent> = Arc::new(ExecutionAgent::new(
        Arc::clone(&broker) as Arc<dyn broker::BrokerAdapter>,
        Arc::clone(&store) as Arc<dyn store::DecisionStore>,
        profile.symbol.clone(),
        config.features.paper_trading,
    ));

    let graph = Arc::new(TradingGraph::new(
        analysis,
        debate,
        risk,
        portfolio,
        execution,
        Arc::clone(&manager),
        Arc::clone(&store) as Arc<dyn store::DecisionStore>,
        alerts.clone(),
        Arc::clone(&profile),
    ));

    // ── 7. Market adapters ───────────────────────────────────────────────
    // Ingestion services push into these; the engine only reads.
    let market = Arc::new(StaticMarketFeed::new());
    let news = Arc::new(StaticNewsFeed::new());

    // ── 8. Planner, rule engine, scheduler ───────────────────────────────
    let strategic_minutes = config
        .scheduler
        .strategic_minutes
        .unwrap_or(profile.optimal_cadence_minutes);

    let planner = Arc::new(StrategyPlanner::new(
        ctx,
        Arc::clone(&market) as Arc<dyn market::MarketDataFeed>,
        None, // derivatives adapter is wired per deployment
        Arc::clone(&shared_cache) as Arc<dyn cache::KeyValueCache>,
        strategic_minutes,
    ));

    let rule_engine = RuleEngine::new(
        Arc::clone(&broker) as Arc<dyn broker::BrokerAdapter>,
        Arc::clone(&store) as Arc<dyn store::DecisionStore>,
        config.features.paper_trading,
        config.risk.account_value,
    );

    let service = TradingService::new(
        graph,
        planner,
        rule_engine,
        Arc::clone(&market) as Arc<dyn market::MarketDataFeed>,
        Arc::clone(&news) as Arc<dyn market::NewsFeed>,
        Arc::clone(&shared_cache) as Arc<dyn cache::KeyValueCache>,
        Arc::clone(&profile),
        Some(strategic_minutes),
        config.scheduler.tactical_minutes,
        config.scheduler.execution_poll_ms,
        shutdown_rx,
    );

    info!(
        symbol = %profile.symbol,
        kind = %profile.kind,
        strategic_min = strategic_minutes,
        "all subsystems wired; starting scheduler"
    );

    let service_handle = tokio::spawn(service.run());

    // ── 9. Graceful shutdown on interrupt / terminate ────────────────────
    wait_for_shutdown_signal().await;
    warn!("shutdown signal received; stopping gracefully");
    let _ = shutdown_tx.send(true);

    if let Err(e) = service_handle.await {
        error!(error = %e, "scheduler task join failed");
    }
    if let Some(handle) = health_handle {
        let _ = handle.await;
    }

    if let Err(e) = config.save("engine_config.json") {
        warn!(error = %e, "failed to save engine config on shutdown");
    }

    info!("Quorum Trading Engine shut down complete");
    Ok(())
}

/// Block until SIGINT or SIGTERM.
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
