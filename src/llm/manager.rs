// =============================================================================
// LLM Provider Manager — selection, rotation, rate accounting, fallback
// =============================================================================
//
// Callers hand over a prompt and get back model text; they never name a
// provider. The manager owns:
//   - a process-wide semaphore capping concurrent LLM calls,
//   - per-provider key and model round-robin cursors,
//   - minute/day/token accounting and soft throttling,
//   - circuit breaking with parsed rate-limit reset deadlines,
//   - cohort-aware assignment so parallel agents land on distinct providers,
//   - a background health loop probing the pool.
//
// Locking: the provider pool sits behind one mutex with short critical
// sections; the cohort assignment table has its own. The semaphore is always
// acquired outside both locks.
// =============================================================================

use chrono::Utc;
use parking_lot::Mutex;
use rand::distributions::{Distribution, WeightedIndex};
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, info, warn};

use crate::alerts::{Alert, AlertRouter, Severity};
use crate::config::{FeatureFlags, LlmConfig, SelectionStrategy};
use crate::llm::client::{estimate_tokens, ChatClient, ChatMessage, REQUEST_TIMEOUT_SECS};
use crate::llm::json_guard;
use crate::llm::provider::{ProviderConfig, ProviderStatus};
use crate::llm::LlmError;
use crate::store::DecisionStore;

/// A single chat request from an agent.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub agent: String,
    /// Parallel-cohort id; agents in the same cohort prefer distinct
    /// providers.
    pub cohort: Option<String>,
    pub system_prompt: String,
    pub user_message: String,
    pub temperature: f64,
    pub max_tokens: u32,
}

/// Result of a structured call: the parsed object plus the raw text the
/// completeness gate inspects.
#[derive(Debug, Clone)]
pub struct StructuredResponse {
    pub value: serde_json::Value,
    pub raw: String,
}

pub struct ProviderManager {
    pool: Mutex<HashMap<String, ProviderConfig>>,
    client: Arc<dyn ChatClient>,
    semaphore: Semaphore,
    assignments: Mutex<HashMap<String, Vec<String>>>,
    rotation_counter: AtomicUsize,
    strategy: SelectionStrategy,
    single_provider_mode: bool,
    primary_provider: Option<String>,
    soft_throttle_factor: f64,
    health_interval: Duration,
    features: FeatureFlags,
    alerts: AlertRouter,
    store: Arc<dyn DecisionStore>,
    current_provider: Mutex<Option<String>>,
}

impl ProviderManager {
    pub fn new(
        cfg: &LlmConfig,
        features: FeatureFlags,
        client: Arc<dyn ChatClient>,
        alerts: AlertRouter,
        store: Arc<dyn DecisionStore>,
        providers: Vec<ProviderConfig>,
    ) -> Arc<Self> {
        let pool: HashMap<String, ProviderConfig> = providers
            .into_iter()
            .map(|p| (p.name.clone(), p))
            .collect();

        info!(
            providers = pool.len(),
            strategy = ?cfg.selection_strategy,
            max_concurrency = cfg.max_concurrency,
            "provider manager initialised"
        );

        Arc::new(Self {
            pool: Mutex::new(pool),
            client,
            semaphore: Semaphore::new(cfg.max_concurrency.max(1)),
            assignments: Mutex::new(HashMap::new()),
            rotation_counter: AtomicUsize::new(0),
            strategy: cfg.selection_strategy,
            single_provider_mode: cfg.single_provider_mode,
            primary_provider: cfg.primary_provider.clone(),
            soft_throttle_factor: cfg.soft_throttle_factor,
            health_interval: Duration::from_secs(cfg.health_check_interval_secs.max(1)),
            features,
            alerts,
            store,
            current_provider: Mutex::new(None),
        })
    }

    pub fn provider_count(&self) -> usize {
        self.pool.lock().len()
    }

    /// Provider that served the most recent successful call.
    pub fn current_provider(&self) -> Option<String> {
        self.current_provider.lock().clone()
    }

    /// Snapshot of (name, status, requests_this_minute) for diagnostics.
    pub fn pool_snapshot(&self) -> Vec<(String, ProviderStatus, u32)> {
        self.pool
            .lock()
            .values()
            .map(|p| (p.name.clone(), p.status, p.requests_this_minute))
            .collect()
    }

    /// Inject a failure as if a call to `name` had failed (operator tooling
    /// and tests).
    pub fn mark_provider_failed(&self, name: &str, error: &LlmError) {
        self.handle_failure(name, error);
    }

    /// Drop a cohort's assignment history once its barrier has passed.
    pub fn clear_cohort(&self, cohort: &str) {
        self.assignments.lock().remove(cohort);
    }

    /// Assignments recorded for a cohort, in assignment order.
    pub fn cohort_assignments(&self, cohort: &str) -> Vec<String> {
        self.assignments
            .lock()
            .get(cohort)
            .cloned()
            .unwrap_or_default()
    }

    // -------------------------------------------------------------------------
    // Provider selection
    // -------------------------------------------------------------------------

    /// Pick a provider for `agent`, preferring one not already assigned in
    /// `cohort`. Returns `None` when the pool is empty or everything is
    /// down.
    pub fn select_provider(&self, agent: &str, cohort: Option<&str>) -> Option<String> {
        let now = Utc::now();

        // Recovery pass + candidate pool under one short lock.
        let candidates: Vec<(String, u32)> = {
            let mut pool = self.pool.lock();
            for p in pool.values_mut() {
                p.try_recover(now);
            }

            // Single-provider mode pins the configured primary.
            if self.single_provider_mode {
                if let Some(primary) = &self.primary_provider {
                    if let Some(p) = pool.get_mut(primary) {
                        p.try_recover(now);
                        if p.status == ProviderStatus::Available {
                            p.record_usage(now);
                            drop(pool);
                            self.persist_usage(primary);
                            return Some(primary.clone());
                        }
                        warn!(provider = %primary, "primary provider unavailable; falling back to pool");
                    }
                }
            }

            let available: Vec<&mut ProviderConfig> = pool
                .values_mut()
                .filter(|p| p.status == ProviderStatus::Available)
                .filter(|p| !(self.features.token_quota_enforcement && p.quota_exhausted()))
                .collect();

            // Prefer cool providers; fall back to the unfiltered list when
            // the soft throttle would empty the pool.
            let factor = self.soft_throttle_factor;
            let mut cool: Vec<(String, u32)> = Vec::new();
            let mut all: Vec<(String, u32)> = Vec::new();
            for p in available {
                all.push((p.name.clone(), p.priority));
                if !p.is_soft_throttled(factor, now) {
                    cool.push((p.name.clone(), p.priority));
                }
            }
            if cool.is_empty() {
                all
            } else {
                cool
            }
        };

        if candidates.is_empty() {
            warn!(agent, "no available LLM providers");
            return None;
        }

        let mut sorted = candidates;
        sorted.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));

        let chosen = match cohort {
            Some(cohort_id) => self.pick_for_cohort(agent, cohort_id, &sorted),
            None => self.pick_by_strategy(agent, &sorted),
        };

        {
            let mut pool = self.pool.lock();
            if let Some(p) = pool.get_mut(&chosen) {
                p.record_usage(now);
            }
        }
        self.persist_usage(&chosen);

        debug!(agent, provider = %chosen, cohort = ?cohort, "provider assigned");
        Some(chosen)
    }

    /// Within a cohort, pick a provider not already assigned; when the whole
    /// pool is taken, fall back to the configured strategy.
    fn pick_for_cohort(&self, agent: &str, cohort_id: &str, sorted: &[(String, u32)]) -> String {
        let mut assignments = self.assignments.lock();
        let assigned = assignments.entry(cohort_id.to_string()).or_default();

        let unassigned: Vec<&(String, u32)> = sorted
            .iter()
            .filter(|(name, _)| !assigned.contains(name))
            .collect();

        let chosen = if unassigned.is_empty() {
            self.pick_by_strategy(agent, sorted)
        } else {
            // Random among the unassigned spreads load inside the cohort.
            unassigned
                .choose(&mut rand::thread_rng())
                .map(|(name, _)| name.clone())
                .expect("unassigned is non-empty")
        };

        assigned.push(chosen.clone());
        chosen
    }

    fn pick_by_strategy(&self, agent: &str, sorted: &[(String, u32)]) -> String {
        match self.strategy {
            SelectionStrategy::RoundRobin => {
                let idx = self.rotation_counter.fetch_add(1, Ordering::Relaxed);
                sorted[idx % sorted.len()].0.clone()
            }
            SelectionStrategy::Weighted => {
                // Inverse priority weighting: lower priority value, higher
                // weight.
                let weights: Vec<f64> = sorted.iter().map(|(_, p)| 1.0 / (*p as f64 + 1.0)).collect();
                match WeightedIndex::new(&weights) {
                    Ok(dist) => {
                        let idx = dist.sample(&mut rand::thread_rng());
                        sorted[idx].0.clone()
                    }
                    Err(_) => sorted[0].0.clone(),
                }
            }
            SelectionStrategy::Hash => {
                let mut hasher = DefaultHasher::new();
                agent.hash(&mut hasher);
                let idx = (hasher.finish() as usize) % sorted.len();
                sorted[idx].0.clone()
            }
            SelectionStrategy::Single => match &self.primary_provider {
                Some(primary) if sorted.iter().any(|(n, _)| n == primary) => primary.clone(),
                _ => sorted[0].0.clone(),
            },
            SelectionStrategy::Random => sorted
                .choose(&mut rand::thread_rng())
                .map(|(name, _)| name.clone())
                .expect("sorted is non-empty"),
        }
    }

    fn persist_usage(&self, provider: &str) {
        // Best-effort counter upsert; never blocks the call path.
        let store = Arc::clone(&self.store);
        let provider = provider.to_string();
        tokio::spawn(async move {
            store.increment_provider_usage(&provider).await;
        });
    }

    // -------------------------------------------------------------------------
    // Call protocol
    // -------------------------------------------------------------------------

    /// Issue a chat completion with automatic provider fallback.
    pub async fn chat(&self, request: &ChatRequest) -> Result<String, LlmError> {
        let max_attempts = self.provider_count();
        if max_attempts == 0 {
            return Err(LlmError::AllProvidersFailed {
                summary: "no providers configured".to_string(),
            });
        }

        let messages = [
            ChatMessage::system(request.system_prompt.as_str()),
            ChatMessage::user(request.user_message.as_str()),
        ];

        for attempt in 0..max_attempts {
            // Acquire the global cap outside the provider lock, then jitter
            // to desynchronise parallel cohorts.
            let _permit = self
                .semaphore
                .acquire()
                .await
                .map_err(|_| LlmError::Http("semaphore closed".to_string()))?;
            let jitter = rand::thread_rng().gen_range(100..=600);
            tokio::time::sleep(Duration::from_millis(jitter)).await;

            let Some(provider_name) =
                self.select_provider(&request.agent, request.cohort.as_deref())
            else {
                break;
            };

            let Some((base_url, api_key, model)) = self.checkout_endpoint(&provider_name) else {
                self.handle_failure(
                    &provider_name,
                    &LlmError::Model("provider has no keys or models configured".to_string()),
                );
                continue;
            };

            debug!(
                attempt = attempt + 1,
                max_attempts,
                provider = %provider_name,
                model = %model,
                agent = %request.agent,
                "dispatching LLM call"
            );

            let started = std::time::Instant::now();
            let outcome = tokio::time::timeout(
                Duration::from_secs(REQUEST_TIMEOUT_SECS),
                self.client.chat_completion(
                    &base_url,
                    &api_key,
                    &model,
                    &messages,
                    request.max_tokens,
                    request.temperature,
                ),
            )
            .await;

            match outcome {
                Ok(Ok(response)) => {
                    let tokens = response.tokens_used.unwrap_or_else(|| {
                        estimate_tokens(&[
                            request.system_prompt.as_str(),
                            request.user_message.as_str(),
                            response.text.as_str(),
                        ])
                    });
                    {
                        let mut pool = self.pool.lock();
                        if let Some(p) = pool.get_mut(&provider_name) {
                            p.record_call(Utc::now(), tokens);
                        }
                    }
                    *self.current_provider.lock() = Some(provider_name.clone());
                    info!(
                        provider = %provider_name,
                        model = %model,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        tokens_est = tokens,
                        "LLM call succeeded"
                    );
                    return Ok(response.text);
                }
                Ok(Err(error)) => {
                    warn!(provider = %provider_name, error = %error, "LLM call failed; trying next provider");
                    self.handle_failure(&provider_name, &error);
                }
                Err(_elapsed) => {
                    let error = LlmError::Timeout(REQUEST_TIMEOUT_SECS);
                    warn!(provider = %provider_name, "LLM call timed out; trying next provider");
                    self.handle_failure(&provider_name, &error);
                }
            }
        }

        // Broader-pool fallback: one more sweep over everything still
        // standing, soft-throttle and cohort preferences ignored. Cooldowns
        // are still honoured.
        if let Some(text) = self.fallback_sweep(request, &messages).await {
            return Ok(text);
        }

        Err(LlmError::AllProvidersFailed {
            summary: self.error_summary(),
        })
    }

    /// Last-resort pass over every AVAILABLE provider in priority order.
    async fn fallback_sweep(
        &self,
        request: &ChatRequest,
        messages: &[ChatMessage],
    ) -> Option<String> {
        let now = Utc::now();
        let mut names: Vec<(String, u32)> = {
            let mut pool = self.pool.lock();
            pool.values_mut()
                .filter_map(|p| {
                    p.try_recover(now);
                    (p.status == ProviderStatus::Available).then(|| (p.name.clone(), p.priority))
                })
                .collect()
        };
        names.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        if names.is_empty() {
            return None;
        }

        warn!("all primary attempts failed; trying multi-provider fallback");

        for (name, _) in names {
            let _permit = self.semaphore.acquire().await.ok()?;
            let (base_url, api_key, model) = self.checkout_endpoint(&name)?;

            let outcome = tokio::time::timeout(
                Duration::from_secs(REQUEST_TIMEOUT_SECS),
                self.client.chat_completion(
                    &base_url,
                    &api_key,
                    &model,
                    messages,
                    request.max_tokens,
                    request.temperature,
                ),
            )
            .await;

            match outcome {
                Ok(Ok(response)) => {
                    let tokens = response.tokens_used.unwrap_or_else(|| {
                        estimate_tokens(&[
                            request.system_prompt.as_str(),
                            request.user_message.as_str(),
                            response.text.as_str(),
                        ])
                    });
                    {
                        let mut pool = self.pool.lock();
                        if let Some(p) = pool.get_mut(&name) {
                            p.record_call(Utc::now(), tokens);
                        }
                    }
                    *self.current_provider.lock() = Some(name.clone());
                    info!(provider = %name, "multi-provider fallback succeeded");
                    return Some(response.text);
                }
                Ok(Err(error)) => self.handle_failure(&name, &error),
                Err(_) => self.handle_failure(&name, &LlmError::Timeout(REQUEST_TIMEOUT_SECS)),
            }
        }
        None
    }

    /// Issue a structured call: the expected field map is appended to the
    /// user prompt, the response is parsed defensively, and the output
    /// budget is scaled with the schema size.
    pub async fn structured(
        &self,
        request: &ChatRequest,
        expected_fields: &[(&str, &str)],
    ) -> Result<StructuredResponse, LlmError> {
        let schema: serde_json::Map<String, serde_json::Value> = expected_fields
            .iter()
            .map(|(k, v)| (k.to_string(), serde_json::Value::String(v.to_string())))
            .collect();
        let schema_text = serde_json::to_string_pretty(&serde_json::Value::Object(schema))
            .unwrap_or_else(|_| "{}".to_string());

        let mut structured_request = request.clone();
        structured_request.user_message = format!(
            "{}\n\nRespond in JSON format matching this schema: {}",
            request.user_message, schema_text
        );
        structured_request.temperature = 0.1;
        structured_request.max_tokens =
            json_guard::scaled_max_tokens(expected_fields.len(), request.max_tokens);

        let raw = self.chat(&structured_request).await?;
        let value = json_guard::extract_json(&raw)?;
        Ok(StructuredResponse { value, raw })
    }

    // -------------------------------------------------------------------------
    // Failure handling
    // -------------------------------------------------------------------------

    fn handle_failure(&self, provider_name: &str, error: &LlmError) {
        if !self.features.circuit_breaker {
            // Breaker disabled: remember the error but keep the provider in
            // rotation.
            let mut pool = self.pool.lock();
            if let Some(p) = pool.get_mut(provider_name) {
                p.last_error = Some(error.to_string());
            }
            return;
        }

        let reset_at = {
            let mut pool = self.pool.lock();
            match pool.get_mut(provider_name) {
                Some(p) => {
                    p.mark_failed(error, Utc::now());
                    p.cooldown_until
                }
                None => return,
            }
        };

        let (alert_type, severity) = if error.is_rate_limited() {
            ("provider_rate_limited", Severity::Warning)
        } else if matches!(error, LlmError::Model(_)) {
            ("provider_error", Severity::Critical)
        } else {
            ("provider_error", Severity::Warning)
        };

        self.alerts.send(Alert::new(
            alert_type,
            severity,
            format!("provider {provider_name} failed: {error}"),
            serde_json::json!({
                "provider": provider_name,
                "error": error.to_string(),
                "reset_time": reset_at.map(|t| t.to_rfc3339()),
            }),
            "provider_manager",
        ));
    }

    /// Rotate out the next key and model for a provider.
    fn checkout_endpoint(&self, provider_name: &str) -> Option<(String, String, String)> {
        let mut pool = self.pool.lock();
        let p = pool.get_mut(provider_name)?;
        let key = p.next_key()?;
        let model = p.next_model()?;
        Some((p.base_url.clone(), key, model))
    }

    fn error_summary(&self) -> String {
        let pool = self.pool.lock();
        let mut lines: Vec<String> = pool
            .values()
            .filter_map(|p| {
                p.last_error
                    .as_ref()
                    .map(|e| format!("{}: {} ({})", p.name, e, p.status))
            })
            .collect();
        lines.sort();
        if lines.is_empty() {
            "no provider errors recorded".to_string()
        } else {
            lines.join("\n")
        }
    }

    // -------------------------------------------------------------------------
    // Health loop
    // -------------------------------------------------------------------------

    /// Spawn the background health loop. Every tick it runs the recovery
    /// pass for degraded providers and pings AVAILABLE ones with a minimal
    /// completion; ping failures downgrade to ERROR without touching
    /// user-visible counters.
    pub fn spawn_health_loop(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.health_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        manager.health_pass().await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            debug!("health loop shutting down");
                            break;
                        }
                    }
                }
            }
        })
    }

    async fn health_pass(&self) {
        let now = Utc::now();

        // Snapshot ping targets without holding the lock across awaits.
        let targets: Vec<(String, String, String, String)> = {
            let mut pool = self.pool.lock();
            let mut targets = Vec::new();
            for p in pool.values_mut() {
                if p.status != ProviderStatus::Available {
                    p.try_recover(now);
                    continue;
                }
                if let (Some(key), Some(model)) = (p.api_keys.first(), p.primary_model()) {
                    targets.push((
                        p.name.clone(),
                        p.base_url.clone(),
                        key.clone(),
                        model.to_string(),
                    ));
                }
            }
            targets
        };

        let ping = [
            ChatMessage::system("health check"),
            ChatMessage::user("ping"),
        ];

        for (name, base_url, key, model) in targets {
            let outcome = tokio::time::timeout(
                Duration::from_secs(5),
                self.client.chat_completion(&base_url, &key, &model, &ping, 1, 0.0),
            )
            .await;

            let failed = !matches!(outcome, Ok(Ok(_)));
            if failed {
                warn!(provider = %name, "health check failed; marking provider degraded");
                let mut pool = self.pool.lock();
                if let Some(p) = pool.get_mut(&name) {
                    // Counter state stays untouched; only status changes.
                    p.status = ProviderStatus::Error;
                    p.last_error = Some("health check failed".to_string());
                    p.cooldown_until =
                        Some(now + chrono::Duration::seconds(super::provider::ERROR_COOLDOWN_SECS));
                }
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderEntry;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use parking_lot::Mutex as PlMutex;
    use std::collections::HashSet;

    /// Scripted transport: responds with canned text, optionally failing for
    /// chosen providers (matched by base URL marker).
    struct ScriptedClient {
        /// provider-name marker -> error to return
        failures: PlMutex<HashMap<String, LlmError>>,
        /// record of (marker, api_key) per call
        calls: PlMutex<Vec<(String, String)>>,
        response: String,
    }

    impl ScriptedClient {
        fn ok(response: &str) -> Self {
            Self {
                failures: PlMutex::new(HashMap::new()),
                calls: PlMutex::new(Vec::new()),
                response: response.to_string(),
            }
        }

        fn fail_provider(&self, marker: &str, error: LlmError) {
            self.failures.lock().insert(marker.to_string(), error);
        }

        fn providers_called(&self) -> Vec<String> {
            self.calls.lock().iter().map(|(p, _)| p.clone()).collect()
        }

        fn keys_used(&self) -> Vec<String> {
            self.calls.lock().iter().map(|(_, k)| k.clone()).collect()
        }
    }

    #[async_trait]
    impl ChatClient for ScriptedClient {
        async fn chat_completion(
            &self,
            base_url: &str,
            api_key: &str,
            _model: &str,
            _messages: &[ChatMessage],
            _max_tokens: u32,
            _temperature: f64,
        ) -> Result<crate::llm::client::ChatResponse, LlmError> {
            // base_url looks like https://<name>.example/v1
            let marker = base_url
                .trim_start_matches("https://")
                .split('.')
                .next()
                .unwrap_or("")
                .to_string();
            self.calls.lock().push((marker.clone(), api_key.to_string()));
            if let Some(err) = self.failures.lock().get(&marker) {
                return Err(err.clone());
            }
            Ok(crate::llm::client::ChatResponse {
                text: self.response.clone(),
                tokens_used: Some(10),
            })
        }
    }

    fn entry(name: &str, keys: usize, priority: u32) -> ProviderEntry {
        ProviderEntry {
            name: name.to_string(),
            base_url: format!("https://{name}.example/v1"),
            api_keys: (0..keys).map(|i| format!("{name}-key-{i}")).collect(),
            models: vec![format!("{name}-model")],
            priority,
            rate_limit_per_minute: 60,
            rate_limit_per_day: 10_000,
            daily_token_quota: None,
        }
    }

    fn manager_with(
        client: Arc<ScriptedClient>,
        entries: &[ProviderEntry],
        strategy: SelectionStrategy,
    ) -> Arc<ProviderManager> {
        let cfg = LlmConfig {
            selection_strategy: strategy,
            ..LlmConfig::default()
        };
        let (alerts, _rx) = AlertRouter::new();
        let providers = entries.iter().map(ProviderConfig::from_entry).collect();
        ProviderManager::new(
            &cfg,
            FeatureFlags::default(),
            client,
            alerts,
            Arc::new(MemoryStore::new()),
            providers,
        )
    }

    fn request(agent: &str, cohort: Option<&str>) -> ChatRequest {
        ChatRequest {
            agent: agent.to_string(),
            cohort: cohort.map(str::to_string),
            system_prompt: "system".to_string(),
            user_message: "user".to_string(),
            temperature: 0.3,
            max_tokens: 500,
        }
    }

    // ---- cohort diversity --------------------------------------------------

    #[test]
    fn cohort_of_four_gets_four_distinct_providers() {
        let client = Arc::new(ScriptedClient::ok("ok"));
        let entries: Vec<ProviderEntry> =
            ["a", "b", "c", "d"].iter().map(|n| entry(n, 1, 0)).collect();
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let _guard = rt.enter();
        let manager = manager_with(client, &entries, SelectionStrategy::Random);

        let mut assigned = HashSet::new();
        for agent in ["technical", "fundamental", "sentiment", "macro"] {
            let provider = manager.select_provider(agent, Some("analysis")).unwrap();
            assigned.insert(provider);
        }
        assert_eq!(assigned.len(), 4, "each cohort member gets a distinct provider");
        assert_eq!(manager.cohort_assignments("analysis").len(), 4);
    }

    #[test]
    fn exhausted_cohort_falls_back_to_strategy() {
        let client = Arc::new(ScriptedClient::ok("ok"));
        let entries = vec![entry("a", 1, 0), entry("b", 1, 1)];
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let _guard = rt.enter();
        let manager = manager_with(client, &entries, SelectionStrategy::RoundRobin);

        for agent in ["w", "x", "y"] {
            assert!(manager.select_provider(agent, Some("g")).is_some());
        }
        // Third assignment reuses a provider, but the call still succeeds.
        assert_eq!(manager.cohort_assignments("g").len(), 3);
    }

    // ---- rate-limit respect ------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn rate_limited_provider_is_not_dispatched_before_reset() {
        let client = Arc::new(ScriptedClient::ok("ok"));
        let entries = vec![entry("alpha", 1, 0), entry("beta", 1, 1)];
        let manager = manager_with(Arc::clone(&client), &entries, SelectionStrategy::RoundRobin);

        // Mark alpha rate-limited with a reset far in the future.
        manager.mark_provider_failed(
            "alpha",
            &LlmError::RateLimited {
                message: "429".to_string(),
                reset_at: Some(Utc::now() + ChronoDuration::seconds(600)),
            },
        );

        for _ in 0..5 {
            let text = manager.chat(&request("agent", None)).await.unwrap();
            assert_eq!(text, "ok");
        }

        let called = client.providers_called();
        assert!(!called.is_empty());
        assert!(
            called.iter().all(|p| p == "beta"),
            "no call may reach alpha before its reset: {called:?}"
        );
    }

    // ---- fallback ----------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn failed_provider_falls_back_to_next() {
        let client = Arc::new(ScriptedClient::ok("fallback-ok"));
        client.fail_provider("alpha", LlmError::Http("500".to_string()));
        let entries = vec![entry("alpha", 1, 0), entry("beta", 1, 1)];
        let manager = manager_with(Arc::clone(&client), &entries, SelectionStrategy::RoundRobin);

        let text = manager.chat(&request("agent", None)).await.unwrap();
        assert_eq!(text, "fallback-ok");
        assert!(client.providers_called().contains(&"beta".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn all_failing_providers_yield_composite_error() {
        let client = Arc::new(ScriptedClient::ok("unused"));
        client.fail_provider("alpha", LlmError::Http("alpha down".to_string()));
        client.fail_provider("beta", LlmError::Http("beta down".to_string()));
        let entries = vec![entry("alpha", 1, 0), entry("beta", 1, 1)];
        let manager = manager_with(client, &entries, SelectionStrategy::RoundRobin);

        let err = manager.chat(&request("agent", None)).await.unwrap_err();
        match err {
            LlmError::AllProvidersFailed { summary } => {
                assert!(summary.contains("alpha"));
                assert!(summary.contains("beta"));
            }
            other => panic!("expected AllProvidersFailed, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn model_error_marks_provider_unavailable_permanently() {
        let client = Arc::new(ScriptedClient::ok("ok"));
        client.fail_provider("alpha", LlmError::Model("no such model".to_string()));
        let entries = vec![entry("alpha", 1, 0), entry("beta", 1, 1)];
        let manager = manager_with(Arc::clone(&client), &entries, SelectionStrategy::RoundRobin);

        let _ = manager.chat(&request("agent", None)).await.unwrap();

        let snapshot = manager.pool_snapshot();
        let alpha = snapshot.iter().find(|(n, _, _)| n == "alpha").unwrap();
        assert_eq!(alpha.1, ProviderStatus::Unavailable);
    }

    // ---- key rotation ------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn keys_rotate_fairly_across_calls() {
        let client = Arc::new(ScriptedClient::ok("ok"));
        let entries = vec![entry("alpha", 3, 0)];
        let manager = manager_with(Arc::clone(&client), &entries, SelectionStrategy::RoundRobin);

        let n = 9;
        for _ in 0..n {
            manager.chat(&request("agent", None)).await.unwrap();
        }

        let mut counts: HashMap<String, usize> = HashMap::new();
        for key in client.keys_used() {
            *counts.entry(key).or_default() += 1;
        }
        assert_eq!(counts.len(), 3);
        let max = counts.values().max().copied().unwrap();
        // ceil(9/3) + 1 = 4
        assert!(max <= 4, "key fairness bound exceeded: {counts:?}");
    }

    // ---- structured --------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn structured_call_parses_fenced_json() {
        let client = Arc::new(ScriptedClient::ok(
            "```json\n{\"decision\": \"EXECUTE\", \"reason\": \"clear upside\"}\n```",
        ));
        let entries = vec![entry("alpha", 1, 0)];
        let manager = manager_with(client, &entries, SelectionStrategy::RoundRobin);

        let response = manager
            .structured(
                &request("veto", None),
                &[("decision", "EXECUTE|REDUCE|HOLD"), ("reason", "string")],
            )
            .await
            .unwrap();
        assert_eq!(response.value["decision"], "EXECUTE");
        assert!(response.raw.contains("```"));
    }

    #[tokio::test(start_paused = true)]
    async fn current_provider_tracks_last_success() {
        let client = Arc::new(ScriptedClient::ok("ok"));
        let entries = vec![entry("alpha", 1, 0)];
        let manager = manager_with(client, &entries, SelectionStrategy::RoundRobin);

        assert!(manager.current_provider().is_none());
        manager.chat(&request("agent", None)).await.unwrap();
        assert_eq!(manager.current_provider().as_deref(), Some("alpha"));
    }
}
