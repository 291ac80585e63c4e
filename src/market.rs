// =============================================================================
// Market data interfaces — the engine's view of the outside world
// =============================================================================
//
// The core never talks to an exchange directly. Ingestion adapters (exchange
// WebSockets, REST pollers, news collectors) live outside the engine and are
// consumed through the narrow traits below. Every operation may return "no
// data"; callers must tolerate absence and degrade gracefully.
// =============================================================================

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ---------------------------------------------------------------------------
// Candles
// ---------------------------------------------------------------------------

/// Supported candle timeframes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "1d")]
    D1,
}

impl Timeframe {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::M1 => "1m",
            Self::M5 => "5m",
            Self::M15 => "15m",
            Self::H1 => "1h",
            Self::D1 => "1d",
        }
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single OHLCV candle, oldest-first in any slice the engine handles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

// ---------------------------------------------------------------------------
// Ticks and depth
// ---------------------------------------------------------------------------

/// One level of order-book depth.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepthLevel {
    pub price: f64,
    pub quantity: f64,
}

/// Latest market snapshot for an instrument.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tick {
    pub instrument: String,
    pub price: f64,
    #[serde(default)]
    pub best_bid: Option<f64>,
    #[serde(default)]
    pub best_ask: Option<f64>,
    /// Top-of-book depth, best price first. At most five levels per side.
    #[serde(default)]
    pub bid_depth: Vec<DepthLevel>,
    #[serde(default)]
    pub ask_depth: Vec<DepthLevel>,
    #[serde(default)]
    pub total_buy_qty: f64,
    #[serde(default)]
    pub total_sell_qty: f64,
    #[serde(default)]
    pub volume: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// News
// ---------------------------------------------------------------------------

/// A single news item, scored in [-1, +1] by the sentiment pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewsItem {
    pub title: String,
    #[serde(default)]
    pub body: Option<String>,
    pub source: String,
    pub timestamp: DateTime<Utc>,
    /// Sentiment in [-1, +1]; 0.0 when the scorer had no opinion.
    #[serde(default)]
    pub sentiment: f64,
}

/// Aggregate sentiment over a recent window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentimentSummary {
    pub average: f64,
    pub trend: String,
    pub counts: HashMap<String, u64>,
}

// ---------------------------------------------------------------------------
// Adapter traits
// ---------------------------------------------------------------------------

/// Market-data adapter consumed by the core.
#[async_trait]
pub trait MarketDataFeed: Send + Sync {
    /// Latest tick for the instrument, or `None` when no data has arrived.
    async fn latest_tick(&self, instrument: &str) -> Option<Tick>;

    /// The most recent `n` closed candles, oldest first. Empty when the
    /// adapter has nothing for this timeframe yet.
    async fn recent_ohlc(&self, instrument: &str, timeframe: Timeframe, n: usize) -> Vec<Candle>;
}

/// News / sentiment adapter.
#[async_trait]
pub trait NewsFeed: Send + Sync {
    /// Latest news items ordered by published time, descending.
    async fn latest_news(&self, instrument: &str, limit: usize) -> Vec<NewsItem>;

    async fn sentiment_summary(&self, instrument: &str, window_hours: u64)
        -> Option<SentimentSummary>;
}

/// Derivatives adapter, optional per instrument. Returns `None` when the
/// instrument profile disables the capability.
#[async_trait]
pub trait DerivativesFeed: Send + Sync {
    async fn fetch_options_chain(&self) -> Option<serde_json::Value>;
    async fn fetch_futures(&self) -> Option<serde_json::Value>;
}

// ---------------------------------------------------------------------------
// In-memory implementations (used for paper runs and the test suite)
// ---------------------------------------------------------------------------

/// Static market feed backed by preloaded data. Ingestion services replace
/// this in production; the engine cannot tell the difference.
#[derive(Default)]
pub struct StaticMarketFeed {
    ticks: parking_lot::RwLock<HashMap<String, Tick>>,
    candles: parking_lot::RwLock<HashMap<(String, Timeframe), Vec<Candle>>>,
}

impl StaticMarketFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_tick(&self, tick: Tick) {
        self.ticks.write().insert(tick.instrument.clone(), tick);
    }

    pub fn set_candles(&self, instrument: &str, timeframe: Timeframe, candles: Vec<Candle>) {
        self.candles
            .write()
            .insert((instrument.to_string(), timeframe), candles);
    }
}

#[async_trait]
impl MarketDataFeed for StaticMarketFeed {
    async fn latest_tick(&self, instrument: &str) -> Option<Tick> {
        self.ticks.read().get(instrument).cloned()
    }

    async fn recent_ohlc(&self, instrument: &str, timeframe: Timeframe, n: usize) -> Vec<Candle> {
        let map = self.candles.read();
        match map.get(&(instrument.to_string(), timeframe)) {
            Some(c) => {
                let start = c.len().saturating_sub(n);
                c[start..].to_vec()
            }
            None => Vec::new(),
        }
    }
}

/// News feed over a fixed item list (newest first).
#[derive(Default)]
pub struct StaticNewsFeed {
    items: parking_lot::RwLock<Vec<NewsItem>>,
}

impl StaticNewsFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_items(&self, mut items: Vec<NewsItem>) {
        items.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        *self.items.write() = items;
    }
}

#[async_trait]
impl NewsFeed for StaticNewsFeed {
    async fn latest_news(&self, _instrument: &str, limit: usize) -> Vec<NewsItem> {
        let items = self.items.read();
        items.iter().take(limit).cloned().collect()
    }

    async fn sentiment_summary(
        &self,
        _instrument: &str,
        window_hours: u64,
    ) -> Option<SentimentSummary> {
        let cutoff = Utc::now() - chrono::Duration::hours(window_hours as i64);
        let items = self.items.read();
        let recent: Vec<&NewsItem> = items.iter().filter(|i| i.timestamp >= cutoff).collect();
        if recent.is_empty() {
            return None;
        }
        let average = recent.iter().map(|i| i.sentiment).sum::<f64>() / recent.len() as f64;
        let trend = if average > 0.1 {
            "IMPROVING"
        } else if average < -0.1 {
            "DETERIORATING"
        } else {
            "STABLE"
        };
        let mut counts = HashMap::new();
        counts.insert("total".to_string(), recent.len() as u64);
        counts.insert(
            "positive".to_string(),
            recent.iter().filter(|i| i.sentiment > 0.0).count() as u64,
        );
        counts.insert(
            "negative".to_string(),
            recent.iter().filter(|i| i.sentiment < 0.0).count() as u64,
        );
        Some(SentimentSummary {
            average,
            trend: trend.to_string(),
            counts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tick(price: f64) -> Tick {
        Tick {
            instrument: "BTCUSDT".to_string(),
            price,
            best_bid: Some(price - 0.5),
            best_ask: Some(price + 0.5),
            bid_depth: Vec::new(),
            ask_depth: Vec::new(),
            total_buy_qty: 10.0,
            total_sell_qty: 8.0,
            volume: Some(1.0),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn static_feed_roundtrip() {
        let feed = StaticMarketFeed::new();
        assert!(feed.latest_tick("BTCUSDT").await.is_none());

        feed.set_tick(tick(60000.0));
        let t = feed.latest_tick("BTCUSDT").await.unwrap();
        assert_eq!(t.price, 60000.0);
    }

    #[tokio::test]
    async fn recent_ohlc_returns_tail() {
        let feed = StaticMarketFeed::new();
        let candles: Vec<Candle> = (0..50)
            .map(|i| Candle {
                timestamp: Utc::now(),
                open: 100.0 + i as f64,
                high: 101.0 + i as f64,
                low: 99.0 + i as f64,
                close: 100.5 + i as f64,
                volume: 10.0,
            })
            .collect();
        feed.set_candles("BTCUSDT", Timeframe::M5, candles);

        let tail = feed.recent_ohlc("BTCUSDT", Timeframe::M5, 10).await;
        assert_eq!(tail.len(), 10);
        assert_eq!(tail.last().unwrap().open, 149.0);

        let missing = feed.recent_ohlc("BTCUSDT", Timeframe::H1, 10).await;
        assert!(missing.is_empty());
    }

    #[test]
    fn timeframe_serde_wire_names() {
        assert_eq!(serde_json::to_string(&Timeframe::M15).unwrap(), "\"15m\"");
        let tf: Timeframe = serde_json::from_str("\"1d\"").unwrap();
        assert_eq!(tf, Timeframe::D1);
    }
}
