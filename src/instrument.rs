// =============================================================================
// Instrument Profile — maps (symbol, venue, data source) to capabilities
// =============================================================================
//
// Agents and the planner dispatch on the profile, never on symbol substrings.
// The profile is detected once at startup and is immutable for the lifetime
// of the run.
// =============================================================================

use serde::{Deserialize, Serialize};
use tracing::info;

/// Instrument classification tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstrumentKind {
    Spot,
    Futures,
    Options,
    Index,
    CryptoSpot,
    CryptoFutures,
    CryptoOptions,
    Stock,
}

impl InstrumentKind {
    /// True for any of the crypto variants (24/7 venues, funding rates).
    pub fn is_crypto(&self) -> bool {
        matches!(
            self,
            Self::CryptoSpot | Self::CryptoFutures | Self::CryptoOptions
        )
    }
}

impl std::fmt::Display for InstrumentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Spot => "SPOT",
            Self::Futures => "FUTURES",
            Self::Options => "OPTIONS",
            Self::Index => "INDEX",
            Self::CryptoSpot => "CRYPTO_SPOT",
            Self::CryptoFutures => "CRYPTO_FUTURES",
            Self::CryptoOptions => "CRYPTO_OPTIONS",
            Self::Stock => "STOCK",
        };
        write!(f, "{s}")
    }
}

/// Market-hours descriptor: either round-the-clock or a weekly window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MarketHours {
    /// 24/7 venues (crypto).
    Always,
    /// A recurring weekly window in the venue's local timezone.
    Weekly {
        timezone: String,
        open: String,
        close: String,
        days: Vec<String>,
    },
}

impl MarketHours {
    pub fn is_24_7(&self) -> bool {
        matches!(self, Self::Always)
    }
}

/// Full instrument profile. Created at startup; immutable within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentProfile {
    pub symbol: String,
    pub venue: String,
    pub currency: String,
    pub region: String,
    pub kind: InstrumentKind,
    pub has_options: bool,
    pub has_futures: bool,
    pub has_spot: bool,
    pub data_source: String,
    /// Derivative feeds the data source can serve for this instrument.
    pub derivatives: Vec<String>,
    pub market_hours: MarketHours,
    /// Preferred Strategic-layer cadence for this instrument class.
    pub optimal_cadence_minutes: u64,
}

impl InstrumentProfile {
    /// Detect the profile for `(symbol, venue, data_source)`.
    ///
    /// Detection is heuristic but total: unknown combinations fall back to a
    /// 24/7 SPOT profile so the engine always starts.
    pub fn detect(symbol: &str, venue: &str, data_source: &str) -> Self {
        let symbol_u = symbol.to_uppercase();
        let venue_u = venue.to_uppercase();
        let source_u = data_source.to_uppercase();

        let region = detect_region(&venue_u, &source_u);
        let currency = detect_currency(&venue_u, &symbol_u, &source_u);
        let kind = detect_kind(&symbol_u, &venue_u, &source_u);
        let (has_options, has_futures, has_spot) = detect_capabilities(&source_u, kind);
        let market_hours = detect_market_hours(&venue_u, &source_u, kind);
        let optimal_cadence_minutes = optimal_cadence(kind, has_options, has_futures);
        let derivatives = derivatives_list(has_options, has_futures, kind);

        let profile = Self {
            symbol: symbol.to_string(),
            venue: venue.to_string(),
            currency,
            region,
            kind,
            has_options,
            has_futures,
            has_spot,
            data_source: data_source.to_string(),
            derivatives,
            market_hours,
            optimal_cadence_minutes,
        };

        info!(
            symbol = %profile.symbol,
            kind = %profile.kind,
            currency = %profile.currency,
            region = %profile.region,
            options = profile.has_options,
            futures = profile.has_futures,
            cadence_min = profile.optimal_cadence_minutes,
            "instrument profile detected"
        );

        profile
    }
}

// ---------------------------------------------------------------------------
// Detection helpers
// ---------------------------------------------------------------------------

fn detect_region(venue: &str, source: &str) -> String {
    match venue {
        "NSE" | "BSE" | "NFO" | "MCX" => return "INDIA".to_string(),
        "NYSE" | "NASDAQ" | "CME" | "ICE" => return "USA".to_string(),
        "BINANCE" | "COINBASE" => return "GLOBAL".to_string(),
        _ => {}
    }
    match source {
        "ZERODHA" => "INDIA".to_string(),
        "IBKR" | "ALPACA" => "USA".to_string(),
        _ => "GLOBAL".to_string(),
    }
}

fn detect_currency(venue: &str, symbol: &str, source: &str) -> String {
    if matches!(venue, "NSE" | "BSE" | "NFO" | "MCX") || source == "ZERODHA" {
        return "INR".to_string();
    }
    if symbol.ends_with("USDT") || symbol.ends_with("USD") || symbol.contains("-USD") {
        return "USD".to_string();
    }
    if symbol.ends_with("INR") || symbol.contains("-INR") {
        return "INR".to_string();
    }
    "USD".to_string()
}

fn detect_kind(symbol: &str, venue: &str, source: &str) -> InstrumentKind {
    // Options venues first.
    if matches!(venue, "NFO" | "OPRA") {
        return InstrumentKind::Options;
    }

    // Crypto sources.
    if matches!(source, "BINANCE" | "COINBASE" | "CRYPTO") {
        if symbol.contains("PERP") || symbol.contains("FUTURES") {
            return InstrumentKind::CryptoFutures;
        }
        if symbol.ends_with("-C") || symbol.ends_with("-P") {
            return InstrumentKind::CryptoOptions;
        }
        return InstrumentKind::CryptoSpot;
    }

    // Futures venues.
    if matches!(venue, "MCX" | "CME" | "ICE") {
        return InstrumentKind::Futures;
    }

    // Option symbols (CE/PE suffixes on Indian venues, -C/-P elsewhere).
    if symbol.ends_with("CE") || symbol.ends_with("PE") || symbol.ends_with("-C") || symbol.ends_with("-P") {
        return InstrumentKind::Options;
    }

    // Common index names.
    const INDEXES: [&str; 5] = ["NIFTY", "BANKNIFTY", "SPX", "DJI", "NDX"];
    if INDEXES.iter().any(|i| symbol.contains(i)) {
        return InstrumentKind::Index;
    }

    if matches!(venue, "NSE" | "BSE" | "NYSE" | "NASDAQ") {
        return InstrumentKind::Stock;
    }

    InstrumentKind::Spot
}

fn detect_capabilities(source: &str, kind: InstrumentKind) -> (bool, bool, bool) {
    match kind {
        InstrumentKind::Index => (true, true, false),
        InstrumentKind::Options | InstrumentKind::CryptoOptions => (true, false, false),
        InstrumentKind::Futures | InstrumentKind::CryptoFutures => (false, true, false),
        InstrumentKind::Stock => (true, false, true),
        InstrumentKind::CryptoSpot => {
            // Crypto venues usually carry perpetual futures next to spot.
            let futures = matches!(source, "BINANCE" | "COINBASE" | "CRYPTO");
            (false, futures, true)
        }
        InstrumentKind::Spot => (false, false, true),
    }
}

fn detect_market_hours(venue: &str, source: &str, kind: InstrumentKind) -> MarketHours {
    if kind.is_crypto() || matches!(source, "BINANCE" | "COINBASE" | "CRYPTO") {
        return MarketHours::Always;
    }

    let weekdays = || {
        vec![
            "Monday".to_string(),
            "Tuesday".to_string(),
            "Wednesday".to_string(),
            "Thursday".to_string(),
            "Friday".to_string(),
        ]
    };

    if matches!(venue, "NSE" | "BSE" | "NFO" | "MCX") || source == "ZERODHA" {
        return MarketHours::Weekly {
            timezone: "Asia/Kolkata".to_string(),
            open: "09:15:00".to_string(),
            close: "15:30:00".to_string(),
            days: weekdays(),
        };
    }

    if matches!(venue, "NYSE" | "NASDAQ" | "CME" | "ICE") {
        return MarketHours::Weekly {
            timezone: "America/New_York".to_string(),
            open: "09:30:00".to_string(),
            close: "16:00:00".to_string(),
            days: weekdays(),
        };
    }

    MarketHours::Always
}

fn optimal_cadence(kind: InstrumentKind, has_options: bool, has_futures: bool) -> u64 {
    // OI moves slowly; crypto moves fast; stocks can wait.
    if has_options {
        return 15;
    }
    if kind.is_crypto() {
        return 10;
    }
    if has_futures {
        return 15;
    }
    if kind == InstrumentKind::Stock {
        return 30;
    }
    15
}

fn derivatives_list(has_options: bool, has_futures: bool, kind: InstrumentKind) -> Vec<String> {
    let mut derivatives = Vec::new();
    if has_options {
        derivatives.push("options_chain".to_string());
    }
    if has_futures {
        derivatives.push("futures".to_string());
        if kind.is_crypto() {
            derivatives.push("funding_rate".to_string());
            derivatives.push("open_interest".to_string());
        }
    }
    if derivatives.is_empty() {
        derivatives.push("spot".to_string());
    }
    derivatives
}
