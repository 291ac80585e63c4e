// =============================================================================
// Provider pool state — per-endpoint accounting and circuit breaking
// =============================================================================
//
// Each ProviderConfig tracks its own keys, models, rate windows, and status.
// All mutation happens under the manager's provider lock; critical sections
// stay short. Cooldown deadlines drive recovery: rate-limited providers come
// back when the parsed reset instant passes, generic errors after a fixed
// five-minute cooldown, and model errors never recover automatically.
// =============================================================================

use chrono::{DateTime, Duration, TimeZone, Utc};
use regex::Regex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::ProviderEntry;
use crate::llm::LlmError;

/// Cooldown applied to generic (non-rate-limit, non-model) failures.
pub const ERROR_COOLDOWN_SECS: i64 = 300;

/// Default rate-limit cooldown when no reset instant could be parsed.
pub const DEFAULT_RATE_LIMIT_COOLDOWN_SECS: i64 = 300;

/// Provider availability state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderStatus {
    Available,
    RateLimited,
    Error,
    Unavailable,
}

impl std::fmt::Display for ProviderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Available => "available",
            Self::RateLimited => "rate_limited",
            Self::Error => "error",
            Self::Unavailable => "unavailable",
        };
        write!(f, "{s}")
    }
}

/// Runtime state for one LLM endpoint.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub name: String,
    pub base_url: String,
    pub api_keys: Vec<String>,
    key_cursor: usize,
    pub models: Vec<String>,
    model_cursor: usize,
    /// Smaller = preferred.
    pub priority: u32,
    pub rate_limit_per_minute: u32,
    pub rate_limit_per_day: u32,
    pub minute_window_start: Option<DateTime<Utc>>,
    pub requests_this_minute: u32,
    pub requests_today: u32,
    pub tokens_today: u64,
    pub daily_token_quota: Option<u64>,
    pub status: ProviderStatus,
    pub last_error: Option<String>,
    /// For rate limits this carries the parsed reset instant; for generic
    /// errors, now + 5 minutes.
    pub cooldown_until: Option<DateTime<Utc>>,
    /// Rolling selection instants for soft throttling.
    pub recent_usage: Vec<DateTime<Utc>>,
}

impl ProviderConfig {
    pub fn from_entry(entry: &ProviderEntry) -> Self {
        Self {
            name: entry.name.clone(),
            base_url: entry.base_url.clone(),
            api_keys: entry.api_keys.clone(),
            key_cursor: 0,
            models: entry.models.clone(),
            model_cursor: 0,
            priority: entry.priority,
            rate_limit_per_minute: entry.rate_limit_per_minute,
            rate_limit_per_day: entry.rate_limit_per_day,
            minute_window_start: None,
            requests_this_minute: 0,
            requests_today: 0,
            tokens_today: 0,
            daily_token_quota: entry.daily_token_quota,
            status: ProviderStatus::Available,
            last_error: None,
            cooldown_until: None,
            recent_usage: Vec::new(),
        }
    }

    // -------------------------------------------------------------------------
    // Rotation
    // -------------------------------------------------------------------------

    /// Round-robin over the key list to fan out load.
    pub fn next_key(&mut self) -> Option<String> {
        if self.api_keys.is_empty() {
            return None;
        }
        let key = self.api_keys[self.key_cursor % self.api_keys.len()].clone();
        self.key_cursor = self.key_cursor.wrapping_add(1);
        Some(key)
    }

    /// Round-robin over the model list.
    pub fn next_model(&mut self) -> Option<String> {
        if self.models.is_empty() {
            return None;
        }
        let model = self.models[self.model_cursor % self.models.len()].clone();
        self.model_cursor = self.model_cursor.wrapping_add(1);
        Some(model)
    }

    /// First configured model without advancing the cursor (health probes).
    pub fn primary_model(&self) -> Option<&str> {
        self.models.first().map(String::as_str)
    }

    // -------------------------------------------------------------------------
    // Rate accounting
    // -------------------------------------------------------------------------

    /// Reset the minute window if it is older than 60 s.
    fn roll_minute_window(&mut self, now: DateTime<Utc>) {
        let stale = match self.minute_window_start {
            Some(start) => (now - start).num_seconds() > 60,
            None => true,
        };
        if stale {
            self.minute_window_start = Some(now);
            self.requests_this_minute = 0;
        }
    }

    /// Record an accepted call: bump minute/day counters and the token
    /// estimate.
    pub fn record_call(&mut self, now: DateTime<Utc>, tokens_used: u64) {
        self.roll_minute_window(now);
        self.requests_this_minute += 1;
        self.requests_today += 1;
        self.tokens_today += tokens_used;
    }

    /// Record a selection instant for soft throttling and trim entries older
    /// than one minute.
    pub fn record_usage(&mut self, now: DateTime<Utc>) {
        let cutoff = now - Duration::seconds(60);
        self.recent_usage.retain(|t| *t >= cutoff);
        self.recent_usage.push(now);
    }

    /// Soft throttle: requests this minute at or beyond
    /// `floor x rate_limit_per_minute`.
    pub fn is_soft_throttled(&mut self, factor: f64, now: DateTime<Utc>) -> bool {
        self.roll_minute_window(now);
        let allowed = ((self.rate_limit_per_minute as f64) * factor).floor().max(1.0) as u32;
        self.requests_this_minute >= allowed
    }

    /// Daily token quota exhausted (only meaningful when quota enforcement
    /// is on).
    pub fn quota_exhausted(&self) -> bool {
        match self.daily_token_quota {
            Some(quota) => self.tokens_today >= quota,
            None => false,
        }
    }

    // -------------------------------------------------------------------------
    // Failure handling and recovery
    // -------------------------------------------------------------------------

    /// Mark the provider after a failed call.
    pub fn mark_failed(&mut self, error: &LlmError, now: DateTime<Utc>) {
        match error {
            LlmError::RateLimited { message, reset_at } => {
                let reset = reset_at
                    .unwrap_or_else(|| now + Duration::seconds(DEFAULT_RATE_LIMIT_COOLDOWN_SECS));
                self.status = ProviderStatus::RateLimited;
                self.last_error = Some(message.clone());
                self.cooldown_until = Some(reset);
                info!(
                    provider = %self.name,
                    reset_at = %reset,
                    "provider rate limited"
                );
            }
            LlmError::Model(message) => {
                self.status = ProviderStatus::Unavailable;
                self.last_error = Some(message.clone());
                self.cooldown_until = None;
                warn!(provider = %self.name, error = %message, "provider model error; no auto-recovery");
            }
            other => {
                self.status = ProviderStatus::Error;
                self.last_error = Some(other.to_string());
                self.cooldown_until = Some(now + Duration::seconds(ERROR_COOLDOWN_SECS));
                warn!(provider = %self.name, error = %other, "provider error; cooling down");
            }
        }
    }

    /// Recovery pass: return to AVAILABLE once the cooldown deadline passes.
    /// Model errors (UNAVAILABLE with no deadline) never auto-recover.
    ///
    /// Returns true when the provider transitioned back to AVAILABLE.
    pub fn try_recover(&mut self, now: DateTime<Utc>) -> bool {
        if self.status == ProviderStatus::Available {
            return false;
        }
        match self.cooldown_until {
            Some(deadline) if now >= deadline => {
                debug!(provider = %self.name, "provider recovered after cooldown");
                self.status = ProviderStatus::Available;
                self.last_error = None;
                self.cooldown_until = None;
                true
            }
            _ => false,
        }
    }
}

// =============================================================================
// Error-text classification
// =============================================================================

/// Classify a raw failure into the outcome taxonomy.
///
/// Interpretation mirrors what providers actually send: HTTP 429 or
/// "rate limit" text marks a rate limit (with a best-effort reset parse);
/// 404 / "No endpoints" / "No module named" / "model" marks a fatal model
/// error.
pub fn classify_failure(status: Option<u16>, body: &str, now: DateTime<Utc>) -> LlmError {
    let lower = body.to_lowercase();

    if status == Some(429) || lower.contains("rate limit") || body.contains("429") {
        return LlmError::RateLimited {
            message: truncate(body, 300),
            reset_at: parse_rate_limit_reset(body, now),
        };
    }

    if status == Some(404)
        || body.contains("No endpoints")
        || body.contains("No module named")
        || lower.contains("model")
    {
        return LlmError::Model(truncate(body, 300));
    }

    LlmError::Http(truncate(body, 300))
}

/// Extract a rate-limit reset instant from the common shapes providers emit.
///
/// Supported:
/// - "try again in 4m36.48s"
/// - "try again in 2 minutes" / "try again in 90 seconds"
/// - `X-RateLimit-Reset` epoch milliseconds
/// - "retry in 30 seconds"
///
/// Returns `None` when nothing matches; callers fall back to the 5-minute
/// default.
pub fn parse_rate_limit_reset(text: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    // "try again in 4m36.48s"
    let m_s = Regex::new(r"(?i)try again in\s+(\d+)m(\d+(?:\.\d+)?)s").unwrap();
    if let Some(caps) = m_s.captures(text) {
        let minutes: i64 = caps[1].parse().ok()?;
        let seconds: f64 = caps[2].parse().ok()?;
        let total = minutes * 60 + seconds.ceil() as i64;
        return Some(now + Duration::seconds(total.max(0)));
    }

    // "try again in 2 minutes" / "try again in 90 s"
    let unit = Regex::new(r"(?i)try again in\s+(\d+(?:\.\d+)?)\s*(m|min|minutes?|s|secs?|seconds?)")
        .unwrap();
    if let Some(caps) = unit.captures(text) {
        let value: f64 = caps[1].parse().ok()?;
        let seconds = if caps[2].to_lowercase().starts_with('m') {
            value * 60.0
        } else {
            value
        };
        return Some(now + Duration::seconds(seconds.ceil().max(0.0) as i64));
    }

    // X-RateLimit-Reset header leaked into the error body (epoch ms).
    let header = Regex::new(r#"X-RateLimit-Reset['":\s]+(\d{10,})"#).unwrap();
    if let Some(caps) = header.captures(text) {
        let epoch_ms: i64 = caps[1].parse().ok()?;
        let reset = Utc.timestamp_millis_opt(epoch_ms).single()?;
        // Clock skew can make the reset read as past; clamp to now.
        return Some(reset.max(now));
    }

    // "retry in 30 seconds" / "retry after 2 minutes"
    let retry = Regex::new(r"(?i)retry.*?(\d+(?:\.\d+)?)\s*(min|minutes?|s|secs?|seconds?)").unwrap();
    if let Some(caps) = retry.captures(text) {
        let value: f64 = caps[1].parse().ok()?;
        let seconds = if caps[2].to_lowercase().starts_with('m') {
            value * 60.0
        } else {
            value
        };
        return Some(now + Duration::seconds(seconds.ceil().max(0.0) as i64));
    }

    None
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        s[..end].to_string()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, keys: usize) -> ProviderEntry {
        ProviderEntry {
            name: name.to_string(),
            base_url: format!("https://{name}.example/v1"),
            api_keys: (0..keys).map(|i| format!("{name}-key-{i}")).collect(),
            models: vec![format!("{name}-large"), format!("{name}-small")],
            priority: 0,
            rate_limit_per_minute: 30,
            rate_limit_per_day: 1000,
            daily_token_quota: None,
        }
    }

    #[test]
    fn key_rotation_is_fair() {
        let mut p = ProviderConfig::from_entry(&entry("alpha", 3));
        let mut counts = std::collections::HashMap::new();
        let n = 10;
        for _ in 0..n {
            let key = p.next_key().unwrap();
            *counts.entry(key).or_insert(0u32) += 1;
        }
        // N=10, K=3 => no key used more than ceil(10/3) + 1 = 5 times.
        let max = counts.values().max().copied().unwrap();
        assert!(max <= 5, "key used {max} times, exceeding fairness bound");
        assert_eq!(counts.len(), 3, "all keys should rotate into use");
    }

    #[test]
    fn model_rotation_round_robin() {
        let mut p = ProviderConfig::from_entry(&entry("alpha", 1));
        assert_eq!(p.next_model().unwrap(), "alpha-large");
        assert_eq!(p.next_model().unwrap(), "alpha-small");
        assert_eq!(p.next_model().unwrap(), "alpha-large");
    }

    #[test]
    fn minute_window_rolls_after_60s() {
        let mut p = ProviderConfig::from_entry(&entry("alpha", 1));
        let t0 = Utc::now();
        p.record_call(t0, 10);
        p.record_call(t0 + Duration::seconds(30), 10);
        assert_eq!(p.requests_this_minute, 2);

        p.record_call(t0 + Duration::seconds(61), 10);
        assert_eq!(p.requests_this_minute, 1, "window should have reset");
        assert_eq!(p.requests_today, 3);
        assert_eq!(p.tokens_today, 30);
    }

    #[test]
    fn soft_throttle_at_floor_of_budget() {
        let mut p = ProviderConfig::from_entry(&entry("alpha", 1));
        let now = Utc::now();
        // floor(30 * 0.8) = 24 calls allowed before throttling.
        for _ in 0..23 {
            p.record_call(now, 1);
        }
        assert!(!p.is_soft_throttled(0.8, now));
        p.record_call(now, 1);
        assert!(p.is_soft_throttled(0.8, now));
    }

    #[test]
    fn rate_limit_marks_with_reset_deadline() {
        let mut p = ProviderConfig::from_entry(&entry("alpha", 1));
        let now = Utc::now();
        let err = LlmError::RateLimited {
            message: "429".to_string(),
            reset_at: Some(now + Duration::seconds(10)),
        };
        p.mark_failed(&err, now);
        assert_eq!(p.status, ProviderStatus::RateLimited);

        // Before the deadline: no recovery.
        assert!(!p.try_recover(now + Duration::seconds(5)));
        assert_eq!(p.status, ProviderStatus::RateLimited);

        // After the deadline: available again.
        assert!(p.try_recover(now + Duration::seconds(11)));
        assert_eq!(p.status, ProviderStatus::Available);
        assert!(p.last_error.is_none());
    }

    #[test]
    fn model_error_never_recovers() {
        let mut p = ProviderConfig::from_entry(&entry("alpha", 1));
        let now = Utc::now();
        p.mark_failed(&LlmError::Model("404 no such model".to_string()), now);
        assert_eq!(p.status, ProviderStatus::Unavailable);
        assert!(!p.try_recover(now + Duration::days(365)));
        assert_eq!(p.status, ProviderStatus::Unavailable);
    }

    #[test]
    fn generic_error_recovers_after_five_minutes() {
        let mut p = ProviderConfig::from_entry(&entry("alpha", 1));
        let now = Utc::now();
        p.mark_failed(&LlmError::Http("500 oops".to_string()), now);
        assert_eq!(p.status, ProviderStatus::Error);
        assert!(!p.try_recover(now + Duration::seconds(299)));
        assert!(p.try_recover(now + Duration::seconds(301)));
    }

    // ---- classification ---------------------------------------------------

    #[test]
    fn classify_429_as_rate_limit() {
        let now = Utc::now();
        let err = classify_failure(Some(429), "Rate limit reached, try again in 2 minutes", now);
        match err {
            LlmError::RateLimited { reset_at, .. } => {
                let reset = reset_at.unwrap();
                let wait = (reset - now).num_seconds();
                assert!((119..=121).contains(&wait), "wait was {wait}");
            }
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }

    #[test]
    fn classify_404_as_model_error() {
        let err = classify_failure(Some(404), "No endpoints found for model x", Utc::now());
        assert!(matches!(err, LlmError::Model(_)));
    }

    #[test]
    fn classify_plain_failure_as_http() {
        let err = classify_failure(Some(500), "internal server error", Utc::now());
        assert!(matches!(err, LlmError::Http(_)));
    }

    // ---- reset parsing ----------------------------------------------------

    #[test]
    fn parse_minutes_seconds_shape() {
        let now = Utc::now();
        let reset = parse_rate_limit_reset("Please try again in 4m36.48s", now).unwrap();
        let wait = (reset - now).num_seconds();
        assert!((276..=278).contains(&wait), "wait was {wait}");
    }

    #[test]
    fn parse_plain_minutes_shape() {
        let now = Utc::now();
        let reset = parse_rate_limit_reset("try again in 2 minutes", now).unwrap();
        assert_eq!((reset - now).num_seconds(), 120);
    }

    #[test]
    fn parse_epoch_header_shape() {
        let now = Utc::now();
        let future_ms = (now + Duration::seconds(90)).timestamp_millis();
        let text = format!("blocked; X-RateLimit-Reset: {future_ms}");
        let reset = parse_rate_limit_reset(&text, now).unwrap();
        let wait = (reset - now).num_seconds();
        assert!((89..=91).contains(&wait), "wait was {wait}");
    }

    #[test]
    fn parse_epoch_header_in_past_clamps_to_now() {
        let now = Utc::now();
        let past_ms = (now - Duration::seconds(90)).timestamp_millis();
        let text = format!("X-RateLimit-Reset: {past_ms}");
        let reset = parse_rate_limit_reset(&text, now).unwrap();
        assert!(reset >= now);
    }

    #[test]
    fn parse_retry_in_seconds_shape() {
        let now = Utc::now();
        let reset = parse_rate_limit_reset("please retry in 30 seconds", now).unwrap();
        assert_eq!((reset - now).num_seconds(), 30);
    }

    #[test]
    fn parse_unknown_shape_returns_none() {
        assert!(parse_rate_limit_reset("quota exceeded", Utc::now()).is_none());
    }
}
