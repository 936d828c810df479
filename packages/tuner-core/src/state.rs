//! TTL key/value state store (§4.B).
//!
//! A single async mutex serializes every operation — the store is
//! deliberately not sharded or lock-free, since accesses are infrequent
//! relative to the audio path and correctness (no reader ever observes a
//! half-written entry) matters more than throughput here. Expiry is judged
//! against [`tokio::time::Instant`] (monotonic), never wall-clock, and is
//! enforced both lazily (on access) and by a periodic background reaper.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// Abstraction for spawning the reaper as a background task, kept distinct
/// from a bare `tokio::spawn` call so the store stays constructible (and its
/// cleanup loop swappable) without pulling in a live Tokio runtime in tests
/// that never call [`StateStore::start_cleanup`].
pub trait TaskSpawner: Send + Sync {
    fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static;
}

/// Tokio-based spawner used by both process roles.
#[derive(Clone)]
pub struct TokioSpawner {
    handle: tokio::runtime::Handle,
}

impl TokioSpawner {
    /// Creates a new `TokioSpawner` with the given runtime handle.
    #[must_use]
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self { handle }
    }

    /// Creates a new `TokioSpawner` using the current runtime's handle.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime context.
    #[must_use]
    pub fn current() -> Self {
        Self {
            handle: tokio::runtime::Handle::current(),
        }
    }
}

impl TaskSpawner for TokioSpawner {
    fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.handle.spawn(future);
    }
}

struct Entry {
    value: Option<String>,
    expires_at: Option<Instant>,
}

struct Inner {
    data: HashMap<String, Entry>,
}

impl Inner {
    fn is_expired(&self, key: &str, now: Instant) -> bool {
        match self.data.get(key) {
            Some(Entry {
                expires_at: Some(exp),
                ..
            }) => now >= *exp,
            _ => false,
        }
    }

    fn remove(&mut self, key: &str) {
        self.data.remove(key);
    }
}

/// In-process TTL-aware key/value store backing the `state` peer (§4.C).
pub struct StateStore {
    inner: Mutex<Inner>,
}

impl StateStore {
    /// Creates an empty store. Call [`StateStore::start_cleanup`] separately
    /// to begin the periodic reaper once a [`TaskSpawner`] is available.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                data: HashMap::new(),
            }),
        })
    }

    /// Returns the value stored at `key`, or `None` if absent or expired.
    pub async fn get(&self, key: &str) -> Option<String> {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        if inner.is_expired(key, now) {
            inner.remove(key);
            return None;
        }
        inner.data.get(key).and_then(|e| e.value.clone())
    }

    /// Sets `key` to `value` (which may itself be `None`/null) with an
    /// optional TTL in milliseconds. `ttl_ms <= 0` or `None` means no expiry,
    /// and clears any TTL a prior `set` had recorded for this key.
    pub async fn set(&self, key: &str, value: Option<String>, ttl_ms: Option<i64>) {
        let mut inner = self.inner.lock().await;
        let expires_at = match ttl_ms {
            Some(ms) if ms > 0 => Some(Instant::now() + Duration::from_millis(ms as u64)),
            _ => None,
        };
        inner
            .data
            .insert(key.to_string(), Entry { value, expires_at });
    }

    /// Removes `key`, returning whether it existed (and was not already expired).
    pub async fn delete(&self, key: &str) -> bool {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        let existed = inner.data.contains_key(key) && !inner.is_expired(key, now);
        inner.remove(key);
        existed
    }

    /// Reports whether `key` is present and not expired, distinguishing a
    /// stored `null` from absence.
    pub async fn exists(&self, key: &str) -> bool {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        if inner.is_expired(key, now) {
            inner.remove(key);
            return false;
        }
        inner.data.contains_key(key)
    }

    /// Starts the 5-second background reaper on the given spawner. Safe to
    /// call at most once; subsequent calls are ignored.
    pub fn start_cleanup<S: TaskSpawner>(self: &Arc<Self>, spawner: &S) {
        let store = Arc::clone(self);
        spawner.spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(5));
            loop {
                interval.tick().await;
                let mut inner = store.inner.lock().await;
                let now = Instant::now();
                let expired: Vec<String> = inner
                    .data
                    .iter()
                    .filter(|(_, e)| matches!(e.expires_at, Some(exp) if now >= exp))
                    .map(|(k, _)| k.clone())
                    .collect();
                for key in expired {
                    inner.remove(&key);
                }
            }
        });
    }
}

#[async_trait::async_trait]
impl crate::state_client::StateClient for StateStore {
    async fn get(&self, key: &str) -> crate::error::TunerResult<Option<String>> {
        Ok(self.get(key).await)
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: Option<String>,
        ttl_ms: Option<i64>,
    ) -> crate::error::TunerResult<()> {
        self.set(key, value, ttl_ms).await;
        Ok(())
    }

    async fn delete(&self, key: &str) -> crate::error::TunerResult<bool> {
        Ok(self.delete(key).await)
    }

    async fn exists(&self, key: &str) -> crate::error::TunerResult<bool> {
        Ok(self.exists(key).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let store = StateStore::new();
        store.set("k", Some("v".to_string()), None).await;
        assert_eq!(store.get("k").await, Some("v".to_string()));
    }

    #[tokio::test]
    async fn missing_key_returns_none() {
        let store = StateStore::new();
        assert_eq!(store.get("missing").await, None);
        assert!(!store.exists("missing").await);
    }

    #[tokio::test]
    async fn null_value_distinguishable_from_absence() {
        let store = StateStore::new();
        store.set("k", None, None).await;
        assert!(store.exists("k").await);
        assert_eq!(store.get("k").await, None);
    }

    #[tokio::test]
    async fn zero_or_negative_ttl_means_no_expiry() {
        let store = StateStore::new();
        store.set("k", Some("v".to_string()), Some(0)).await;
        store.set("k2", Some("v".to_string()), Some(-5)).await;
        assert_eq!(store.get("k").await, Some("v".to_string()));
        assert_eq!(store.get("k2").await, Some("v".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_expires_lazily_on_access() {
        let store = StateStore::new();
        store.set("k", Some("v".to_string()), Some(50)).await;
        assert_eq!(store.get("k").await, Some("v".to_string()));
        tokio::time::advance(Duration::from_millis(60)).await;
        assert_eq!(store.get("k").await, None);
        assert!(!store.exists("k").await);
    }

    #[tokio::test(start_paused = true)]
    async fn setting_without_ttl_clears_prior_expiry() {
        let store = StateStore::new();
        store.set("k", Some("v".to_string()), Some(50)).await;
        store.set("k", Some("v2".to_string()), None).await;
        tokio::time::advance(Duration::from_millis(60)).await;
        assert_eq!(store.get("k").await, Some("v2".to_string()));
    }

    #[tokio::test]
    async fn delete_reports_whether_key_existed() {
        let store = StateStore::new();
        assert!(!store.delete("k").await);
        store.set("k", Some("v".to_string()), None).await;
        assert!(store.delete("k").await);
        assert!(!store.exists("k").await);
    }

    #[tokio::test(start_paused = true)]
    async fn background_reaper_purges_expired_entries() {
        let store = StateStore::new();
        let spawner = TokioSpawner::current();
        store.start_cleanup(&spawner);
        store.set("k", Some("v".to_string()), Some(10)).await;
        tokio::time::advance(Duration::from_secs(6)).await;
        tokio::task::yield_now().await;
        // The reaper should have removed the expired entry directly from the
        // map without needing an access to trigger lazy removal.
        let inner = store.inner.lock().await;
        assert!(!inner.data.contains_key("k"));
    }
}
