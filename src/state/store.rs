//! Shared keyed state with optional expiry.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// One stored value.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct StateEntry {
    pub key: String,
    pub value: Value,
    pub updated_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl StateEntry {
    fn new(key: &str, value: Value, ttl: Option<Duration>) -> Self {
        let now = Utc::now();
        let expires_at = ttl
            .filter(|ttl| !ttl.is_zero())
            .and_then(|ttl| chrono::Duration::from_std(ttl).ok())
            .and_then(|ttl| now.checked_add_signed(ttl));
        Self {
            key: key.to_string(),
            value,
            updated_at: now,
            expires_at,
        }
    }

    /// Check if the entry had expired at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(false, |expires| expires <= now)
    }
}

/// Keyed state shared by every participant of one workflow run.
///
/// Every operation is atomic with respect to all others. Expired entries are
/// logically absent from `get`, `exists` and `list` whether or not they have
/// been purged.
pub trait StateStore: Send + Sync {
    fn get(&self, key: &str) -> Option<Value>;

    /// Overwrite `key`. `None` or a zero `ttl` means no expiry.
    fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<()>;

    /// Remove `key`. Returns whether a live entry existed; absent keys are not an error.
    fn delete(&self, key: &str) -> bool;

    fn exists(&self, key: &str) -> bool;

    /// Live keys starting with `prefix`.
    fn list(&self, prefix: &str) -> BTreeSet<String>;

    /// Remove every entry. Returns how many were removed, counting entries
    /// that had expired but were not yet purged.
    fn clear(&self) -> usize;
}

/// Typed access on top of any [`StateStore`].
pub trait StateStoreExt: StateStore {
    fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        self.get(key)
            .map(serde_json::from_value)
            .transpose()
            .map_err(Error::from)
    }

    fn set_as<T: Serialize>(&self, key: &str, value: &T, ttl: Option<Duration>) -> Result<()> {
        self.set(key, serde_json::to_value(value)?, ttl)
    }
}

impl<S: StateStore + ?Sized> StateStoreExt for S {}

/// In-memory implementation. Data lives as long as the process.
#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    entries: RwLock<HashMap<String, StateEntry>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, StateEntry>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, StateEntry>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Full entry for `key`, if live.
    pub fn entry(&self, key: &str) -> Option<StateEntry> {
        let now = Utc::now();
        self.read()
            .get(key)
            .filter(|e| !e.is_expired_at(now))
            .cloned()
    }

    /// Live keys matching a simple wildcard pattern.
    ///
    /// `foo*` matches a prefix, `*foo` a suffix, anything else a substring.
    pub fn list_matching(&self, pattern: &str) -> BTreeSet<String> {
        let matcher: Box<dyn Fn(&str) -> bool> = if let Some(prefix) = pattern.strip_suffix('*') {
            let prefix = prefix.to_string();
            Box::new(move |k| k.starts_with(&prefix))
        } else if let Some(suffix) = pattern.strip_prefix('*') {
            let suffix = suffix.to_string();
            Box::new(move |k| k.ends_with(&suffix))
        } else {
            let needle = pattern.to_string();
            Box::new(move |k| k.contains(&needle))
        };
        self.live_keys(|k| matcher(k))
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = Utc::now();
        self.read().values().filter(|e| !e.is_expired_at(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Physically remove expired entries. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let mut entries = self.write();
        let before = entries.len();
        entries.retain(|_, e| !e.is_expired_at(now));
        before - entries.len()
    }

    /// Purge expired entries every `interval` until `cancel` fires.
    ///
    /// Only reclaims memory; reads already hide expired entries.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let purged = store.purge_expired();
                        if purged > 0 {
                            tracing::debug!(purged, "Swept expired state entries");
                        }
                    }
                    _ = cancel.cancelled() => {
                        tracing::debug!("State sweeper stopped");
                        break;
                    }
                }
            }
        })
    }

    fn live_keys(&self, keep: impl Fn(&str) -> bool) -> BTreeSet<String> {
        let now = Utc::now();
        self.read()
            .values()
            .filter(|e| !e.is_expired_at(now) && keep(&e.key))
            .map(|e| e.key.clone())
            .collect()
    }
}

impl StateStore for InMemoryStateStore {
    fn get(&self, key: &str) -> Option<Value> {
        let value = self.entry(key).map(|e| e.value);
        if value.is_some() {
            tracing::debug!(key, "State retrieved");
        }
        value
    }

    fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<()> {
        if key.is_empty() {
            return Err(Error::Validation("state key must not be empty".to_string()));
        }
        let entry = StateEntry::new(key, value, ttl);
        self.write().insert(key.to_string(), entry);
        tracing::debug!(key, ?ttl, "State stored");
        Ok(())
    }

    fn delete(&self, key: &str) -> bool {
        let now = Utc::now();
        let removed = self.write().remove(key);
        let existed = removed.map_or(false, |e| !e.is_expired_at(now));
        if existed {
            tracing::debug!(key, "State deleted");
        }
        existed
    }

    fn exists(&self, key: &str) -> bool {
        self.entry(key).is_some()
    }

    fn list(&self, prefix: &str) -> BTreeSet<String> {
        self.live_keys(|k| k.starts_with(prefix))
    }

    fn clear(&self) -> usize {
        let mut entries = self.write();
        let count = entries.len();
        entries.clear();
        tracing::info!(count, "State store cleared");
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::thread::sleep;

    #[test]
    fn test_overwrite_semantics() {
        let store = InMemoryStateStore::new();
        store.set("budget_total", json!(4700), None).unwrap();
        store.set("budget_total", json!(5200), None).unwrap();
        assert_eq!(store.get("budget_total"), Some(json!(5200)));

        // The value's type may change too.
        store.set("budget_total", json!({"amount": 5200, "currency": "EUR"}), None).unwrap();
        assert_eq!(store.get("budget_total").unwrap()["currency"], "EUR");
    }

    #[test]
    fn test_ttl_expiry() {
        let store = InMemoryStateStore::new();
        store.set("k", json!("v"), Some(Duration::from_millis(50))).unwrap();
        store.set("keep", json!(1), None).unwrap();
        assert!(store.exists("k"));

        sleep(Duration::from_millis(80));

        assert_eq!(store.get("k"), None);
        assert!(!store.exists("k"));
        assert!(!store.list("").contains("k"));
        assert!(store.exists("keep"));
        // Still physically present until purged.
        assert_eq!(store.purge_expired(), 1);
    }

    #[test]
    fn test_ttl_reset_on_overwrite() {
        let store = InMemoryStateStore::new();
        store.set("k", json!(1), Some(Duration::from_millis(30))).unwrap();
        store.set("k", json!(2), None).unwrap();
        sleep(Duration::from_millis(50));
        assert_eq!(store.get("k"), Some(json!(2)));
        assert!(store.entry("k").unwrap().expires_at.is_none());
    }

    #[test]
    fn test_zero_ttl_means_no_expiry() {
        let store = InMemoryStateStore::new();
        store.set("k", json!(1), Some(Duration::ZERO)).unwrap();
        assert!(store.entry("k").unwrap().expires_at.is_none());
    }

    #[test]
    fn test_delete_is_idempotent() {
        let store = InMemoryStateStore::new();
        store.set("k", json!(1), None).unwrap();
        assert!(store.delete("k"));
        assert!(!store.delete("k"));
        assert!(!store.delete("never-set"));
        assert!(!store.exists("k"));
    }

    #[test]
    fn test_list_prefix_and_pattern() {
        let store = InMemoryStateStore::new();
        store.set("proposal:abc", json!({}), None).unwrap();
        store.set("proposal:def", json!({}), None).unwrap();
        store.set("optimized_plan:abc", json!({}), None).unwrap();

        let proposals = store.list("proposal:");
        assert_eq!(
            proposals.into_iter().collect::<Vec<_>>(),
            vec!["proposal:abc".to_string(), "proposal:def".to_string()]
        );
        assert_eq!(store.list_matching("*:abc").len(), 2);
        assert_eq!(store.list_matching("optimized*").len(), 1);
        assert_eq!(store.list_matching("def").len(), 1);
    }

    #[test]
    fn test_clear() {
        let store = InMemoryStateStore::new();
        store.set("a", json!(1), None).unwrap();
        store.set("b", json!(2), None).unwrap();
        assert_eq!(store.clear(), 2);
        assert!(store.is_empty());
        assert!(store.list("").is_empty());
    }

    #[test]
    fn test_clear_counts_unpurged_expired_entries() {
        let store = InMemoryStateStore::new();
        store.set("live", json!(1), None).unwrap();
        store.set("stale", json!(2), Some(Duration::from_millis(20))).unwrap();
        sleep(Duration::from_millis(50));

        assert!(!store.exists("stale"));
        assert_eq!(store.clear(), 2);
    }

    #[test]
    fn test_empty_key_rejected() {
        let store = InMemoryStateStore::new();
        assert!(matches!(
            store.set("", json!(1), None),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_typed_access() {
        #[derive(Serialize, Deserialize, Debug, PartialEq)]
        struct Budget {
            total: u32,
            currency: String,
        }

        let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
        let budget = Budget {
            total: 4700,
            currency: "EUR".to_string(),
        };
        store.set_as("budget", &budget, None).unwrap();
        assert_eq!(store.get_as::<Budget>("budget").unwrap(), Some(budget));
        assert_eq!(store.get_as::<Budget>("missing").unwrap(), None);

        store.set("budget", json!("not a budget"), None).unwrap();
        assert!(store.get_as::<Budget>("budget").is_err());
    }

    #[test]
    fn test_concurrent_writers() {
        let store = Arc::new(InMemoryStateStore::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for i in 0..100 {
                        store.set(&format!("t{}:{}", t, i), json!(i), None).unwrap();
                        store.set("shared", json!({"writer": t, "i": i}), None).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.len(), 8 * 100 + 1);
        let shared = store.get("shared").unwrap();
        assert!(shared["writer"].is_u64() && shared["i"].is_u64());
    }

    #[tokio::test]
    async fn test_sweeper_purges() {
        let store = Arc::new(InMemoryStateStore::new());
        store.set("k", json!(1), Some(Duration::from_millis(10))).unwrap();
        let cancel = CancellationToken::new();
        let sweeper = store.spawn_sweeper(Duration::from_millis(20), cancel.clone());

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(store.purge_expired(), 0);

        cancel.cancel();
        sweeper.await.unwrap();
    }
}
