//! Process-wide text -> embedding memo.
//!
//! Bounded by entry count and age. Keys are normalized so trivially
//! different spellings of the same text share an entry.

use chrono::{DateTime, Utc};
use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

/// Longest cache key, in characters
const MAX_KEY_CHARS: usize = 200;

struct CacheEntry {
    vector: Vec<f32>,
    created_at: DateTime<Utc>,
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    /// Keys, oldest insert first
    order: VecDeque<String>,
}

impl CacheInner {
    fn remove(&mut self, key: &str) {
        if self.entries.remove(key).is_some() {
            self.order.retain(|k| k != key);
        }
    }
}

pub struct EmbeddingCache {
    inner: Mutex<CacheInner>,
    capacity: usize,
    ttl: Duration,
}

/// Lowercase, trimmed, whitespace runs collapsed, capped at 200 chars.
pub fn normalize_key(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
        .chars()
        .take(MAX_KEY_CHARS)
        .collect()
}

impl EmbeddingCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(CacheInner::default()),
            capacity: capacity.max(1),
            ttl,
        }
    }

    // entries and order are updated together, a poisoned guard is still usable
    fn lock(&self) -> MutexGuard<'_, CacheInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_expired(&self, created_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        // entries from the future count as fresh
        (now - created_at)
            .to_std()
            .map(|age| age > self.ttl)
            .unwrap_or(false)
    }

    pub fn get(&self, text: &str) -> Option<Vec<f32>> {
        self.get_at(text, Utc::now())
    }

    pub fn get_at(&self, text: &str, now: DateTime<Utc>) -> Option<Vec<f32>> {
        let key = normalize_key(text);
        let mut inner = self.lock();

        let created_at = inner.entries.get(&key)?.created_at;
        if self.is_expired(created_at, now) {
            inner.remove(&key);
            return None;
        }

        inner.entries.get(&key).map(|entry| entry.vector.clone())
    }

    pub fn set(&self, text: &str, vector: Vec<f32>) {
        self.set_at(text, vector, Utc::now());
    }

    pub fn set_at(&self, text: &str, vector: Vec<f32>, created_at: DateTime<Utc>) {
        let key = normalize_key(text);
        if key.is_empty() {
            return;
        }

        let mut inner = self.lock();

        if inner.entries.contains_key(&key) {
            inner.remove(&key);
        } else {
            while inner.entries.len() >= self.capacity {
                let Some(oldest) = inner.order.pop_front() else {
                    break;
                };
                inner.entries.remove(&oldest);
            }
        }

        inner.order.push_back(key.clone());
        inner.entries.insert(key, CacheEntry { vector, created_at });
    }

    /// Drops every expired entry and returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let mut inner = self.lock();
        let before = inner.entries.len();

        inner
            .entries
            .retain(|_, entry| !self.is_expired(entry.created_at, now));
        let CacheInner { entries, order } = &mut *inner;
        order.retain(|key| entries.contains_key(key));

        before - inner.entries.len()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.entries.clear();
        inner.order.clear();
    }
}

/// Purges expired entries every `every` until the runtime shuts down.
pub fn spawn_sweeper(cache: Arc<EmbeddingCache>, every: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        // first tick fires immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let purged = cache.purge_expired();
            if purged > 0 {
                log::debug!("purged {purged} expired embeddings from cache");
            }
        }
    })
}
