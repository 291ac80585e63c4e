// =============================================================================
// Shared types used across the Quorum trading engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Final trading signal produced by the portfolio manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Signal {
    Buy,
    Sell,
    Hold,
    Adjust,
}

impl Default for Signal {
    fn default() -> Self {
        Self::Hold
    }
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
            Self::Hold => write!(f, "HOLD"),
            Self::Adjust => write!(f, "ADJUST"),
        }
    }
}

/// Overall market direction assessment, independent of the trading signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TrendSignal {
    Bullish,
    Bearish,
    Neutral,
}

impl Default for TrendSignal {
    fn default() -> Self {
        Self::Neutral
    }
}

impl std::fmt::Display for TrendSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bullish => write!(f, "BULLISH"),
            Self::Bearish => write!(f, "BEARISH"),
            Self::Neutral => write!(f, "NEUTRAL"),
        }
    }
}

/// Tiered strength of a signal, used for sizing and reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalStrength {
    StrongBuy,
    Buy,
    WeakBuy,
    StrongSell,
    Sell,
    WeakSell,
    Neutral,
    /// Signal downgraded to HOLD by the execution gate.
    FilteredHold,
}

impl Default for SignalStrength {
    fn default() -> Self {
        Self::Neutral
    }
}

impl std::fmt::Display for SignalStrength {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::StrongBuy => "STRONG_BUY",
            Self::Buy => "BUY",
            Self::WeakBuy => "WEAK_BUY",
            Self::StrongSell => "STRONG_SELL",
            Self::Sell => "SELL",
            Self::WeakSell => "WEAK_SELL",
            Self::Neutral => "NEUTRAL",
            Self::FilteredHold => "FILTERED_HOLD",
        };
        write!(f, "{s}")
    }
}

/// Direction of a rule-engine trade (rules never emit HOLD).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeDirection {
    Buy,
    Sell,
}

impl std::fmt::Display for TradeDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

/// Whether a planner rule targets current conditions or a prepared
/// what-if scenario.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Scenario {
    Current,
    Future,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_serde_uppercase() {
        assert_eq!(serde_json::to_string(&Signal::Buy).unwrap(), "\"BUY\"");
        let s: Signal = serde_json::from_str("\"HOLD\"").unwrap();
        assert_eq!(s, Signal::Hold);
    }

    #[test]
    fn strength_display_matches_serde() {
        let s = serde_json::to_string(&SignalStrength::StrongBuy).unwrap();
        assert_eq!(s, format!("\"{}\"", SignalStrength::StrongBuy));
    }

    #[test]
    fn defaults_are_neutral_hold() {
        assert_eq!(Signal::default(), Signal::Hold);
        assert_eq!(TrendSignal::default(), TrendSignal::Neutral);
        assert_eq!(SignalStrength::default(), SignalStrength::Neutral);
    }
}
