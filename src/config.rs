// =============================================================================
// Engine Configuration — single startup record with atomic save
// =============================================================================
//
// Every tunable parameter lives here and is read once at startup. All fields
// carry `#[serde(default)]` so that adding new fields never breaks loading an
// older config file. API keys are merged in from the environment at load time
// (primary key plus numbered siblings, e.g. GROQ_API_KEY, GROQ_API_KEY_2 ...)
// so secrets never land in the JSON file.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_symbol() -> String {
    "BTCUSDT".to_string()
}

fn default_venue() -> String {
    "BINANCE".to_string()
}

fn default_data_source() -> String {
    "BINANCE".to_string()
}

fn default_max_concurrency() -> usize {
    3
}

fn default_soft_throttle_factor() -> f64 {
    0.8
}

fn default_health_check_secs() -> u64 {
    60
}

fn default_selection_strategy() -> SelectionStrategy {
    SelectionStrategy::Random
}

fn default_rate_limit_per_minute() -> u32 {
    30
}

fn default_rate_limit_per_day() -> u32 {
    100_000
}

fn default_tactical_minutes() -> u64 {
    3
}

fn default_execution_poll_ms() -> u64 {
    100
}

fn default_account_value() -> f64 {
    1_000_000.0
}

fn default_llm_temperature() -> f64 {
    0.3
}

fn default_max_tokens() -> u32 {
    2000
}

fn default_min_key_fraction() -> f64 {
    0.6
}

// =============================================================================
// Provider selection strategy
// =============================================================================

/// How the provider manager picks among available providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    Random,
    RoundRobin,
    Weighted,
    Hash,
    Single,
}

// =============================================================================
// Sections
// =============================================================================

/// Instrument selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentConfig {
    #[serde(default = "default_symbol")]
    pub symbol: String,

    #[serde(default = "default_venue")]
    pub venue: String,

    #[serde(default = "default_venue")]
    pub exchange: String,

    #[serde(default = "default_data_source")]
    pub data_source: String,

    /// Explicit venue token when symbol lookup is ambiguous.
    #[serde(default)]
    pub token: Option<String>,
}

impl Default for InstrumentConfig {
    fn default() -> Self {
        Self {
            symbol: default_symbol(),
            venue: default_venue(),
            exchange: default_venue(),
            data_source: default_data_source(),
            token: None,
        }
    }
}

/// One configured LLM endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderEntry {
    pub name: String,

    /// Chat-completions base URL (e.g. "https://api.groq.com/openai/v1").
    pub base_url: String,

    /// API keys for round-robin load balancing. Merged with numbered env
    /// siblings at load time; may be empty in the file itself.
    #[serde(default)]
    pub api_keys: Vec<String>,

    /// Models rotated round-robin per provider.
    #[serde(default)]
    pub models: Vec<String>,

    /// Smaller = preferred.
    #[serde(default)]
    pub priority: u32,

    #[serde(default = "default_rate_limit_per_minute")]
    pub rate_limit_per_minute: u32,

    #[serde(default = "default_rate_limit_per_day")]
    pub rate_limit_per_day: u32,

    /// Optional daily token quota; `None` disables quota enforcement for
    /// this provider.
    #[serde(default)]
    pub daily_token_quota: Option<u64>,
}

/// LLM pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub providers: Vec<ProviderEntry>,

    #[serde(default = "default_selection_strategy")]
    pub selection_strategy: SelectionStrategy,

    /// Process-wide cap on concurrent LLM calls.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Fraction of the per-minute budget at which a provider is considered
    /// "warm" and skipped when cooler providers exist.
    #[serde(default = "default_soft_throttle_factor")]
    pub soft_throttle_factor: f64,

    #[serde(default = "default_health_check_secs")]
    pub health_check_interval_secs: u64,

    /// Route every call through one provider (reduces pool churn).
    #[serde(default)]
    pub single_provider_mode: bool,

    #[serde(default)]
    pub primary_provider: Option<String>,

    #[serde(default = "default_llm_temperature")]
    pub temperature: f64,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Minimum fraction of expected keys a structured response must carry
    /// before it is accepted without a retry.
    #[serde(default = "default_min_key_fraction")]
    pub min_key_fraction: f64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            providers: Vec::new(),
            selection_strategy: default_selection_strategy(),
            max_concurrency: default_max_concurrency(),
            soft_throttle_factor: default_soft_throttle_factor(),
            health_check_interval_secs: default_health_check_secs(),
            single_provider_mode: false,
            primary_provider: None,
            temperature: default_llm_temperature(),
            max_tokens: default_max_tokens(),
            min_key_fraction: default_min_key_fraction(),
        }
    }
}

/// Scheduler cadences. The strategic cadence falls back to the instrument
/// profile's optimal frequency when not set explicitly.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub strategic_minutes: Option<u64>,

    #[serde(default = "default_tactical_minutes")]
    pub tactical_minutes: u64,

    #[serde(default = "default_execution_poll_ms")]
    pub execution_poll_ms: u64,
}

/// Per-profile risk parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskProfileParams {
    pub risk_pct: f64,
    pub stop_loss_pct: f64,
    pub leverage: f64,
}

/// Risk section: account value plus the three sizing profiles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    #[serde(default = "default_account_value")]
    pub account_value: f64,

    #[serde(default = "RiskConfig::default_aggressive")]
    pub aggressive: RiskProfileParams,

    #[serde(default = "RiskConfig::default_conservative")]
    pub conservative: RiskProfileParams,

    #[serde(default = "RiskConfig::default_neutral")]
    pub neutral: RiskProfileParams,
}

impl RiskConfig {
    fn default_aggressive() -> RiskProfileParams {
        RiskProfileParams {
            risk_pct: 3.0,
            stop_loss_pct: 2.0,
            leverage: 1.5,
        }
    }

    fn default_conservative() -> RiskProfileParams {
        RiskProfileParams {
            risk_pct: 1.0,
            stop_loss_pct: 1.0,
            leverage: 1.0,
        }
    }

    fn default_neutral() -> RiskProfileParams {
        RiskProfileParams {
            risk_pct: 2.0,
            stop_loss_pct: 1.5,
            leverage: 1.25,
        }
    }
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            account_value: default_account_value(),
            aggressive: Self::default_aggressive(),
            conservative: Self::default_conservative(),
            neutral: Self::default_neutral(),
        }
    }
}

/// Feature flags. All default on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureFlags {
    /// Retry a structured call once with scaled max-tokens when the JSON
    /// completeness gate fails.
    #[serde(default = "default_true")]
    pub json_validation_retry: bool,

    /// Provider circuit breaker (cooldowns + UNAVAILABLE on model errors).
    #[serde(default = "default_true")]
    pub circuit_breaker: bool,

    /// Background provider health loop.
    #[serde(default = "default_true")]
    pub health_monitoring: bool,

    /// Enforce per-provider daily token quotas.
    #[serde(default = "default_true")]
    pub token_quota_enforcement: bool,

    /// Paper broker instead of a live venue adapter.
    #[serde(default = "default_true")]
    pub paper_trading: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            json_validation_retry: true,
            circuit_breaker: true,
            health_monitoring: true,
            token_quota_enforcement: true,
            paper_trading: true,
        }
    }
}

// =============================================================================
// EngineConfig
// =============================================================================

/// Top-level engine configuration. Read once at startup.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EngineConfig {
    #[serde(default)]
    pub instrument: InstrumentConfig,

    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub risk: RiskConfig,

    #[serde(default)]
    pub features: FeatureFlags,
}

impl EngineConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read engine config from {}", path.display()))?;

        let mut config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse engine config from {}", path.display()))?;

        config.merge_env_keys();

        info!(
            path = %path.display(),
            symbol = %config.instrument.symbol,
            providers = config.llm.providers.len(),
            "engine config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename). API keys are redacted first.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let mut redacted = self.clone();
        for p in &mut redacted.llm.providers {
            p.api_keys.clear();
        }

        let content = serde_json::to_string_pretty(&redacted)
            .context("failed to serialise engine config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "engine config saved (atomic)");
        Ok(())
    }

    /// Merge API keys from the environment into each provider entry.
    ///
    /// For a provider named `groq`, reads `GROQ_API_KEY` and the numbered
    /// siblings `GROQ_API_KEY_2` ... `GROQ_API_KEY_9`, stopping at the first
    /// gap. Keys already present in the file are kept ahead of env keys.
    pub fn merge_env_keys(&mut self) {
        for provider in &mut self.llm.providers {
            let base = format!("{}_API_KEY", provider.name.to_uppercase());
            if let Ok(primary) = std::env::var(&base) {
                if !primary.is_empty() && !provider.api_keys.contains(&primary) {
                    provider.api_keys.push(primary);
                }
            }
            for i in 2..10 {
                let name = format!("{base}_{i}");
                match std::env::var(&name) {
                    Ok(key) if !key.is_empty() => {
                        if !provider.api_keys.contains(&key) {
                            provider.api_keys.push(key);
                        }
                    }
                    _ => break,
                }
            }
            if provider.api_keys.is_empty() {
                warn!(provider = %provider.name, "provider has no API keys configured");
            }
        }
    }

    /// Providers that actually have at least one key. Only these join the
    /// runtime pool.
    pub fn usable_providers(&self) -> Vec<ProviderEntry> {
        self.llm
            .providers
            .iter()
            .filter(|p| !p.api_keys.is_empty())
            .cloned()
            .collect()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_uses_defaults() {
        let cfg: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.instrument.symbol, "BTCUSDT");
        assert_eq!(cfg.llm.max_concurrency, 3);
        assert!((cfg.llm.soft_throttle_factor - 0.8).abs() < f64::EPSILON);
        assert_eq!(cfg.llm.health_check_interval_secs, 60);
        assert_eq!(cfg.scheduler.tactical_minutes, 3);
        assert_eq!(cfg.scheduler.execution_poll_ms, 100);
        assert!(cfg.scheduler.strategic_minutes.is_none());
        assert!(cfg.features.circuit_breaker);
        assert!(cfg.features.paper_trading);
    }

    #[test]
    fn risk_profiles_default_sensibly() {
        let cfg = EngineConfig::default();
        assert!((cfg.risk.aggressive.risk_pct - 3.0).abs() < f64::EPSILON);
        assert!((cfg.risk.conservative.stop_loss_pct - 1.0).abs() < f64::EPSILON);
        assert!((cfg.risk.neutral.leverage - 1.25).abs() < f64::EPSILON);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let json = r#"{
            "instrument": { "symbol": "NIFTY BANK", "venue": "NSE", "data_source": "ZERODHA" },
            "llm": { "selection_strategy": "round_robin" }
        }"#;
        let cfg: EngineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.instrument.symbol, "NIFTY BANK");
        assert_eq!(cfg.llm.selection_strategy, SelectionStrategy::RoundRobin);
        assert_eq!(cfg.llm.max_concurrency, 3);
    }

    #[test]
    fn usable_providers_requires_keys() {
        let mut cfg = EngineConfig::default();
        cfg.llm.providers = vec![
            ProviderEntry {
                name: "alpha".to_string(),
                base_url: "https://alpha.example/v1".to_string(),
                api_keys: vec!["k1".to_string()],
                models: vec!["m".to_string()],
                priority: 0,
                rate_limit_per_minute: 30,
                rate_limit_per_day: 1000,
                daily_token_quota: None,
            },
            ProviderEntry {
                name: "beta".to_string(),
                base_url: "https://beta.example/v1".to_string(),
                api_keys: Vec::new(),
                models: vec!["m".to_string()],
                priority: 1,
                rate_limit_per_minute: 30,
                rate_limit_per_day: 1000,
                daily_token_quota: None,
            },
        ];
        let usable = cfg.usable_providers();
        assert_eq!(usable.len(), 1);
        assert_eq!(usable[0].name, "alpha");
    }

    #[test]
    fn save_redacts_keys() {
        let mut cfg = EngineConfig::default();
        cfg.llm.providers = vec![ProviderEntry {
            name: "alpha".to_string(),
            base_url: "https://alpha.example/v1".to_string(),
            api_keys: vec!["supersecret".to_string()],
            models: vec!["m".to_string()],
            priority: 0,
            rate_limit_per_minute: 30,
            rate_limit_per_day: 1000,
            daily_token_quota: None,
        }];

        let dir = std::env::temp_dir().join(format!("quorum-cfg-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("engine_config.json");
        cfg.save(&path).unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        assert!(!written.contains("supersecret"));
        std::fs::remove_dir_all(&dir).ok();
    }
}
