// =============================================================================
// Key-value cache — the hand-off surface between scheduler layers
// =============================================================================
//
// String-keyed, bytes-valued, per-key TTL. The Strategic layer publishes the
// active RuleBundle here; the Execution layer reads it on every tick and
// treats absence (expiry included) as "no active rules". Ingestion adapters
// publish the latest tick under `price:<INST>:latest` with a 5-minute TTL.
//
// Well-known keys:
//   price:<INST>:latest   — latest tick JSON
//   rule_bundle:active    — current RuleBundle JSON
//   futures:<INST>:latest — latest futures snapshot JSON
// =============================================================================

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Cache key for the latest tick of an instrument.
pub fn tick_key(instrument: &str) -> String {
    format!("price:{instrument}:latest")
}

/// Cache key for the active rule bundle.
pub const RULE_BUNDLE_KEY: &str = "rule_bundle:active";

/// Cache key for the latest futures snapshot of an instrument.
pub fn futures_key(instrument: &str) -> String {
    format!("futures:{instrument}:latest")
}

/// TTL for tick state.
pub const TICK_TTL: Duration = Duration::from_secs(300);

/// String-keyed, bytes-valued cache with per-key TTL.
#[async_trait]
pub trait KeyValueCache: Send + Sync {
    /// Store `value` under `key`, expiring after `ttl`. A zero TTL is a
    /// delete.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration);

    /// Fetch the value if present and unexpired.
    async fn get(&self, key: &str) -> Option<Vec<u8>>;

    async fn delete(&self, key: &str);
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

struct Entry {
    value: Vec<u8>,
    expires_at: Instant,
}

/// Process-local cache. Expiry is enforced lazily on read.
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueCache for MemoryCache {
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) {
        if ttl.is_zero() {
            self.entries.lock().remove(key);
            return;
        }
        self.entries.lock().insert(
            key.to_string(),
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    async fn get(&self, key: &str) -> Option<Vec<u8>> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    async fn delete(&self, key: &str) {
        self.entries.lock().remove(key);
    }
}

/// Serialize a value as JSON and store it.
pub async fn set_json<T: serde::Serialize>(
    cache: &dyn KeyValueCache,
    key: &str,
    value: &T,
    ttl: Duration,
) {
    match serde_json::to_vec(value) {
        Ok(bytes) => cache.set(key, bytes, ttl).await,
        Err(e) => tracing::warn!(key, error = %e, "failed to serialise cache value"),
    }
}

/// Fetch and deserialize a JSON value; decode failures read as absent.
pub async fn get_json<T: serde::de::DeserializeOwned>(
    cache: &dyn KeyValueCache,
    key: &str,
) -> Option<T> {
    let bytes = cache.get(key).await?;
    serde_json::from_slice(&bytes).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_get_roundtrip() {
        let cache = MemoryCache::new();
        cache
            .set("k", b"hello".to_vec(), Duration::from_secs(60))
            .await;
        assert_eq!(cache.get("k").await, Some(b"hello".to_vec()));
    }

    #[tokio::test]
    async fn expired_entry_reads_as_absent() {
        let cache = MemoryCache::new();
        cache.set("k", b"v".to_vec(), Duration::from_millis(10)).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(cache.get("k").await.is_none());
    }

    #[tokio::test]
    async fn zero_ttl_deletes() {
        let cache = MemoryCache::new();
        cache.set("k", b"v".to_vec(), Duration::from_secs(60)).await;
        cache.set("k", b"v2".to_vec(), Duration::ZERO).await;
        assert!(cache.get("k").await.is_none());
    }

    #[tokio::test]
    async fn json_helpers_roundtrip() {
        let cache = MemoryCache::new();
        set_json(&cache, "nums", &vec![1, 2, 3], Duration::from_secs(60)).await;
        let nums: Option<Vec<i32>> = get_json(&cache, "nums").await;
        assert_eq!(nums, Some(vec![1, 2, 3]));
    }

    #[test]
    fn well_known_keys() {
        assert_eq!(tick_key("BTCUSDT"), "price:BTCUSDT:latest");
        assert_eq!(futures_key("BTCUSDT"), "futures:BTCUSDT:latest");
    }
}
