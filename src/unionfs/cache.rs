// Copyright (C) 2023 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! TTL caches backing the union engine.
//!
//! The branch cache remembers on which branch a path was found; the deletion cache
//! remembers the file names present in the deletion store. Neither cache lock is
//! ever held across a filesystem call.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// A map cache whose entries expire after a fixed TTL.
pub struct TimedCache<V: Clone> {
    ttl: Duration,
    entries: Mutex<HashMap<String, (Instant, V)>>,
}

impl<V: Clone> TimedCache<V> {
    /// Create a cache whose entries stay valid for `ttl`.
    pub fn new(ttl: Duration) -> TimedCache<V> {
        TimedCache {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// A fresh cached value, if any.
    pub fn get(&self, name: &str) -> Option<V> {
        let entries = self.entries.lock().unwrap();
        match entries.get(name) {
            Some((deadline, v)) if Instant::now() < *deadline => Some(v.clone()),
            _ => None,
        }
    }

    /// The cached value, or the result of `fetch`, which is stored.
    ///
    /// `fetch` runs without the cache lock held.
    pub fn get_or<F: FnOnce() -> V>(&self, name: &str, fetch: F) -> V {
        if let Some(v) = self.get(name) {
            return v;
        }
        let v = fetch();
        self.set(name, v.clone());
        v
    }

    /// Bypass the cache: fetch, store and return the fresh value.
    pub fn refresh<F: FnOnce() -> V>(&self, name: &str, fetch: F) -> V {
        let v = fetch();
        self.set(name, v.clone());
        v
    }

    /// Store a value, restarting its TTL.
    pub fn set(&self, name: &str, v: V) {
        let deadline = Instant::now() + self.ttl;
        let mut entries = self.entries.lock().unwrap();
        // Keep the table from accumulating corpses between purges.
        if entries.len() > 4096 {
            let now = Instant::now();
            entries.retain(|_, (d, _)| now < *d);
        }
        entries.insert(name.to_string(), (deadline, v));
    }

    /// Forget one entry.
    pub fn remove(&self, name: &str) {
        self.entries.lock().unwrap().remove(name);
    }

    /// Forget the named entries, or everything when `names` is `None`.
    pub fn drop_all(&self, names: Option<&[String]>) {
        let mut entries = self.entries.lock().unwrap();
        match names {
            Some(names) => {
                for name in names {
                    entries.remove(name);
                }
            }
            None => entries.clear(),
        }
    }
}

/// A cached set of the file names inside one directory, with TTL expiry.
pub struct DirCache {
    ttl: Duration,
    state: Mutex<Option<(Instant, HashSet<String>)>>,
}

impl DirCache {
    /// Create a cold cache with the given TTL.
    pub fn new(ttl: Duration) -> DirCache {
        DirCache {
            ttl,
            state: Mutex::new(None),
        }
    }

    /// Whether `name` is present. `None` means the cache is cold and the caller must
    /// consult the filesystem (and may refill the cache).
    pub fn has_entry(&self, name: &str) -> Option<bool> {
        let state = self.state.lock().unwrap();
        match state.as_ref() {
            Some((deadline, names)) if Instant::now() < *deadline => Some(names.contains(name)),
            _ => None,
        }
    }

    /// Replace the cached name set.
    pub fn fill(&self, names: HashSet<String>) {
        let deadline = Instant::now() + self.ttl;
        *self.state.lock().unwrap() = Some((deadline, names));
    }

    /// Record one new name, if the cache is warm.
    pub fn add_entry(&self, name: &str) {
        if let Some((_, names)) = self.state.lock().unwrap().as_mut() {
            names.insert(name.to_string());
        }
    }

    /// Drop one name, if the cache is warm.
    pub fn remove_entry(&self, name: &str) {
        if let Some((_, names)) = self.state.lock().unwrap().as_mut() {
            names.remove(name);
        }
    }

    /// Make the cache cold.
    pub fn drop_cache(&self) {
        *self.state.lock().unwrap() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_timed_cache_fetches_once_within_ttl() {
        let cache: TimedCache<u32> = TimedCache::new(Duration::from_secs(60));
        let calls = AtomicUsize::new(0);
        let fetch = || {
            calls.fetch_add(1, Ordering::SeqCst);
            7u32
        };

        assert_eq!(cache.get_or("a", fetch), 7);
        assert_eq!(cache.get_or("a", fetch), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        cache.remove("a");
        assert_eq!(cache.get_or("a", fetch), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_timed_cache_expiry() {
        let cache: TimedCache<u32> = TimedCache::new(Duration::from_millis(5));
        cache.set("a", 1);
        assert_eq!(cache.get("a"), Some(1));
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(cache.get("a"), None);
    }

    #[test]
    fn test_timed_cache_refresh_and_drop_all() {
        let cache: TimedCache<u32> = TimedCache::new(Duration::from_secs(60));
        cache.set("a", 1);
        assert_eq!(cache.refresh("a", || 2), 2);
        assert_eq!(cache.get("a"), Some(2));

        cache.set("b", 3);
        cache.drop_all(Some(&["a".to_string()]));
        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.get("b"), Some(3));

        cache.drop_all(None);
        assert_eq!(cache.get("b"), None);
    }

    #[test]
    fn test_dir_cache() {
        let cache = DirCache::new(Duration::from_secs(60));
        assert_eq!(cache.has_entry("x"), None);

        // Mutations on a cold cache stay silent until a fill.
        cache.add_entry("x");
        assert_eq!(cache.has_entry("x"), None);

        let mut names = HashSet::new();
        names.insert("x".to_string());
        cache.fill(names);
        assert_eq!(cache.has_entry("x"), Some(true));
        assert_eq!(cache.has_entry("y"), Some(false));

        cache.add_entry("y");
        assert_eq!(cache.has_entry("y"), Some(true));
        cache.remove_entry("x");
        assert_eq!(cache.has_entry("x"), Some(false));

        cache.drop_cache();
        assert_eq!(cache.has_entry("y"), None);
    }
}
