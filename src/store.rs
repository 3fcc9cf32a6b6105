//! The shared key/value store (C1, spec §4.1).
//!
//! A single `Store` backs every `Scope` handle derived from it: scopes
//! share storage and eviction accounting, they just prepend `prefix + ":"`
//! transparently on every operation.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::value::Value;
use lru::LruCache;
use std::num::NonZeroUsize;

#[derive(Clone)]
struct Entry {
    value: Value,
    inserted_at: Instant,
}

/// Invoked synchronously, while holding no store locks, once per evicted
/// entry (spec §4.1: "to prevent deadlock if the callback re-enters the
/// store").
pub type EvictionCallback = Arc<dyn Fn(&str, &Value) + Send + Sync>;

/// Construction-time store options. All independent and optional
/// (spec §4.1 "Configuration").
#[derive(Clone, Default)]
pub struct StoreConfig {
    pub max_entries: Option<usize>,
    pub ttl: Option<Duration>,
    pub on_evict: Option<EvictionCallback>,
}

impl StoreConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_entries(mut self, n: usize) -> Self {
        self.max_entries = Some(n);
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn on_evict<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, &Value) + Send + Sync + 'static,
    {
        self.on_evict = Some(Arc::new(f));
        self
    }
}

enum Backing {
    Bounded(LruCache<String, Entry>),
    Unbounded(HashMap<String, Entry>),
}

struct Inner {
    backing: Backing,
    ttl: Option<Duration>,
    on_evict: Option<EvictionCallback>,
}

impl Inner {
    fn get(&mut self, key: &str) -> (Option<Value>, bool) {
        let expired = if let Some(ttl) = self.ttl {
            let inserted_at = match &self.backing {
                Backing::Bounded(c) => c.peek(key).map(|e| e.inserted_at),
                Backing::Unbounded(m) => m.get(key).map(|e| e.inserted_at),
            };
            matches!(inserted_at, Some(t) if t.elapsed() > ttl)
        } else {
            false
        };

        if expired {
            // Lazy deletion: TTL expiry is silent, never reported through
            // the eviction callback (spec §9 open-question resolution).
            match &mut self.backing {
                Backing::Bounded(c) => {
                    c.pop(key);
                }
                Backing::Unbounded(m) => {
                    m.remove(key);
                }
            }
            return (None, false);
        }

        match &mut self.backing {
            Backing::Bounded(c) => match c.get(key) {
                Some(e) => (Some(e.value.clone()), true),
                None => (None, false),
            },
            Backing::Unbounded(m) => match m.get(key) {
                Some(e) => (Some(e.value.clone()), true),
                None => (None, false),
            },
        }
    }

    /// Inserts, possibly evicting the LRU entry. Returns the evicted
    /// `(key, value)` if any, so the caller can fire the callback without
    /// holding the lock.
    ///
    /// `LruCache::push` returns the replaced entry both when it evicts
    /// the least-recently-used key *and* when `key` itself already
    /// existed (an overwrite, not an eviction) — the returned key is the
    /// same `key` in the overwrite case. Only report an eviction when the
    /// returned key differs from the one just inserted (spec §4.1:
    /// callback fires "exactly once per evicted entry", not on replace).
    fn set(&mut self, key: String, value: Value) -> Option<(String, Value)> {
        let entry = Entry {
            value,
            inserted_at: Instant::now(),
        };
        match &mut self.backing {
            Backing::Bounded(c) => {
                let pushed_key = key.clone();
                c.push(key, entry).and_then(|(k, e)| {
                    if k == pushed_key {
                        None
                    } else {
                        Some((k, e.value))
                    }
                })
            }
            Backing::Unbounded(m) => {
                m.insert(key, entry);
                None
            }
        }
    }

    fn delete(&mut self, key: &str) -> Option<Value> {
        match &mut self.backing {
            Backing::Bounded(c) => c.pop(key).map(|e| e.value),
            Backing::Unbounded(m) => m.remove(key).map(|e| e.value),
        }
    }
}

/// The process-local, in-memory key/value store. Cheap to clone: clones
/// share the same backing map (spec §4.1, "Scope").
#[derive(Clone)]
pub struct Store {
    inner: Arc<Mutex<Inner>>,
    on_evict: Option<EvictionCallback>,
    prefix: Option<String>,
}

impl Store {
    pub fn new() -> Self {
        Self::with_config(StoreConfig::default())
    }

    pub fn with_config(config: StoreConfig) -> Self {
        let backing = match config.max_entries {
            Some(n) => Backing::Bounded(LruCache::new(
                NonZeroUsize::new(n.max(1)).expect("max_entries must be > 0"),
            )),
            None => Backing::Unbounded(HashMap::new()),
        };
        Self {
            inner: Arc::new(Mutex::new(Inner {
                backing,
                ttl: config.ttl,
                on_evict: config.on_evict.clone(),
            })),
            on_evict: config.on_evict,
            prefix: None,
        }
    }

    fn scoped_key(&self, key: &str) -> String {
        match &self.prefix {
            Some(p) => format!("{p}:{key}"),
            None => key.to_string(),
        }
    }

    /// `Get(key) -> (value, present)`. Never fails; a TTL-expired entry
    /// is lazily removed and reported as a miss.
    pub fn get(&self, key: &str) -> (Option<Value>, bool) {
        let scoped = self.scoped_key(key);
        self.inner.lock().get(&scoped)
    }

    /// Inserts or replaces `key`, evicting the least-recently-accessed
    /// entry if this would exceed `max_entries`.
    pub fn set(&self, key: impl Into<String>, value: Value) {
        let scoped = self.scoped_key(&key.into());
        let evicted = self.inner.lock().set(scoped, value);
        if let Some((evicted_key, evicted_value)) = evicted {
            if let Some(cb) = &self.on_evict {
                // Fired with no store locks held (spec §4.1).
                let unscoped = self.unscope(&evicted_key);
                cb(unscoped, &evicted_value);
            }
        }
    }

    fn unscope<'a>(&self, key: &'a str) -> &'a str {
        match &self.prefix {
            Some(p) => key.strip_prefix(&format!("{p}:")).unwrap_or(key),
            None => key,
        }
    }

    /// Removes `key` if present. Does **not** invoke the eviction
    /// callback — that callback is for evictions, not explicit deletions
    /// (spec §4.1).
    pub fn delete(&self, key: &str) -> bool {
        let scoped = self.scoped_key(key);
        self.inner.lock().delete(&scoped).is_some()
    }

    /// A handle sharing this store's backing map, with every key
    /// transparently prefixed by `prefix + ":"`. Scopes compose: scoping
    /// a scope concatenates prefixes.
    pub fn scope(&self, prefix: impl Into<String>) -> Store {
        let prefix = prefix.into();
        let full_prefix = match &self.prefix {
            Some(existing) => format!("{existing}:{prefix}"),
            None => prefix,
        };
        Store {
            inner: self.inner.clone(),
            on_evict: self.on_evict.clone(),
            prefix: Some(full_prefix),
        }
    }

    /// A read-only capability view, handed to `Prep` (spec §4.1, "reader
    /// vs writer capability split").
    pub fn reader(&self) -> StoreReader {
        StoreReader {
            store: self.clone(),
        }
    }

    /// A read-write capability view, handed to `Post`.
    pub fn writer(&self) -> StoreWriter {
        StoreWriter {
            store: self.clone(),
        }
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

/// Read-only capability over a `Store`, used during Prep.
#[derive(Clone)]
pub struct StoreReader {
    store: Store,
}

impl StoreReader {
    pub fn get(&self, key: &str) -> (Option<Value>, bool) {
        self.store.get(key)
    }

    pub fn scope(&self, prefix: impl Into<String>) -> StoreReader {
        StoreReader {
            store: self.store.scope(prefix),
        }
    }
}

/// Read-write capability over a `Store`, used during Post and by engine
/// hooks (onSuccess/onFailure/onComplete).
#[derive(Clone)]
pub struct StoreWriter {
    store: Store,
}

impl StoreWriter {
    pub fn get(&self, key: &str) -> (Option<Value>, bool) {
        self.store.get(key)
    }

    pub fn set(&self, key: impl Into<String>, value: Value) {
        self.store.set(key, value);
    }

    pub fn delete(&self, key: &str) -> bool {
        self.store.delete(key)
    }

    pub fn scope(&self, prefix: impl Into<String>) -> StoreWriter {
        StoreWriter {
            store: self.store.scope(prefix),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn set_then_get_round_trips() {
        let store = Store::new();
        store.set("a", json!(1));
        assert_eq!(store.get("a"), (Some(json!(1)), true));
    }

    #[test]
    fn get_of_missing_key_is_a_clean_miss() {
        let store = Store::new();
        assert_eq!(store.get("nope"), (None, false));
    }

    #[test]
    fn delete_does_not_invoke_eviction_callback() {
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        let store = Store::with_config(StoreConfig::new().on_evict(move |_, _| {
            fired2.fetch_add(1, Ordering::SeqCst);
        }));
        store.set("a", json!(1));
        assert!(store.delete("a"));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    /// P4 — LRU eviction: inserting N+k keys into a store bounded at N
    /// evicts exactly the k least-recently-accessed keys, once each.
    #[test]
    fn lru_evicts_least_recently_accessed_first() {
        let evicted = Arc::new(Mutex::new(Vec::new()));
        let evicted2 = evicted.clone();
        let store = Store::with_config(
            StoreConfig::new()
                .max_entries(3)
                .on_evict(move |k, _| evicted2.lock().push(k.to_string())),
        );
        store.set("a", json!(1));
        store.set("b", json!(2));
        store.set("c", json!(3));
        // touch "a" so "b" becomes least-recently-used
        store.get("a");
        store.set("d", json!(4));
        assert_eq!(*evicted.lock(), vec!["b".to_string()]);
        assert_eq!(store.get("b"), (None, false));
        assert_eq!(store.get("a"), (Some(json!(1)), true));
    }

    /// Overwriting an existing key in a bounded store is a replace, not
    /// an eviction — the callback must not fire for it even though
    /// `LruCache::push` reports the old entry back to the caller.
    #[test]
    fn overwriting_an_existing_key_does_not_fire_the_eviction_callback() {
        let evicted = Arc::new(Mutex::new(Vec::new()));
        let evicted2 = evicted.clone();
        let store = Store::with_config(
            StoreConfig::new()
                .max_entries(3)
                .on_evict(move |k, _| evicted2.lock().push(k.to_string())),
        );
        store.set("a", json!(1));
        store.set("a", json!(2));
        assert!(evicted.lock().is_empty());
        assert_eq!(store.get("a"), (Some(json!(2)), true));
    }

    /// P6 — scope isolation: writes through one scope are invisible
    /// through a different scope.
    #[test]
    fn scopes_are_isolated() {
        let store = Store::new();
        let a = store.scope("a");
        let b = store.scope("b");
        a.set("k", json!("in-a"));
        assert_eq!(b.get("k"), (None, false));
        assert_eq!(a.get("k"), (Some(json!("in-a")), true));
    }

    /// P5 — TTL expiry: a stale Get returns a miss and removes the entry,
    /// without firing the eviction callback.
    #[tokio::test]
    async fn ttl_expiry_is_silent() {
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        let store = Store::with_config(
            StoreConfig::new()
                .ttl(Duration::from_millis(20))
                .on_evict(move |_, _| {
                    fired2.fetch_add(1, Ordering::SeqCst);
                }),
        );
        store.set("a", json!(1));
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(store.get("a"), (None, false));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
