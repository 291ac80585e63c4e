// =============================================================================
// Prompt store — versioned system prompts with per-agent defaults
// =============================================================================
//
// Operators can override any agent's system prompt (and keep several
// versions around); agents always fall back to a built-in default templated
// with the instrument name.
// =============================================================================

use parking_lot::RwLock;
use std::collections::HashMap;

/// Versioned prompt lookup. Highest version wins.
pub struct PromptStore {
    instrument_name: String,
    prompts: RwLock<HashMap<String, Vec<(u32, String)>>>,
}

impl PromptStore {
    pub fn new(instrument_name: impl Into<String>) -> Self {
        Self {
            instrument_name: instrument_name.into(),
            prompts: RwLock::new(HashMap::new()),
        }
    }

    /// Register (or override) a prompt version for an agent.
    pub fn insert(&self, agent: &str, version: u32, prompt: impl Into<String>) {
        let mut prompts = self.prompts.write();
        let versions = prompts.entry(agent.to_string()).or_default();
        versions.retain(|(v, _)| *v != version);
        versions.push((version, prompt.into()));
        versions.sort_by_key(|(v, _)| *v);
    }

    /// The active system prompt for an agent: the highest stored version,
    /// or the built-in default.
    pub fn get(&self, agent: &str) -> String {
        if let Some(versions) = self.prompts.read().get(agent) {
            if let Some((_, prompt)) = versions.last() {
                return prompt.clone();
            }
        }
        self.default_prompt(agent)
    }

    fn default_prompt(&self, agent: &str) -> String {
        let name = &self.instrument_name;
        match agent {
            "technical" => format!(
                "You are the Technical Analysis Agent for a {name} trading system.\n\
                 Your role: Extract chart patterns and momentum signals from market data.\n\
                 Analyze OHLC data and provide structured technical analysis."
            ),
            "fundamental" => format!(
                "You are the Fundamental Analysis Agent for a {name} trading system.\n\
                 Analyze fundamental factors affecting {name} performance."
            ),
            "sentiment" => format!(
                "You are the Sentiment Analysis Agent for a {name} trading system.\n\
                 Analyze market sentiment from news and other available sources."
            ),
            "macro" => format!(
                "You are the Macro Analysis Agent for a {name} trading system.\n\
                 Analyze macro economic conditions and market regime."
            ),
            "bull" => format!(
                "You are the Bull Researcher Agent for {name} trading.\n\
                 Construct the strongest bull case for BUY signals."
            ),
            "bear" => format!(
                "You are the Bear Researcher Agent for {name} trading.\n\
                 Construct the strongest bear case against BUY signals."
            ),
            "portfolio_manager" => format!(
                "You are the Portfolio Manager Agent for a {name} trading system.\n\
                 Your role: Synthesize all agent analyses and make final trading decisions.\n\
                 You receive inputs from technical, fundamental, sentiment, macro, bull/bear \
                 researchers, and risk agents.\n\
                 Make decisions based on consensus, risk management, and market microstructure."
            ),
            "strategy_planner" => format!(
                "You are a Strategy Planner for trading {name}.\n\
                 Your role: Analyze current market conditions AND predict future scenarios to \
                 generate high-probability trading rules as JSON.\n\
                 Generate BOTH rules for immediate conditions and preparatory rules for \
                 potential scenarios. Focus on high-probability setups with clear entry/exit \
                 conditions."
            ),
            name_with_risk if name_with_risk.ends_with("_risk") => {
                let profile = name_with_risk.trim_end_matches("_risk");
                format!(
                    "You are the {profile} Risk Management Agent.\n\
                     Calculate position size, stop-loss, and leverage recommendations based on \
                     a {profile} risk profile."
                )
            }
            "execution" => format!(
                "You are the Execution Agent for a {name} trading system.\n\
                 Your role: Place orders via the broker adapter and track execution."
            ),
            other => format!("You are the {other} agent for a {name} trading system."),
        }
    }
}
