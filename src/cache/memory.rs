//! In-memory cache backend for testing and single-process use
//!
//! Emulates the Redis list/string commands the audit subsystem relies on.
//! Can be switched unavailable to exercise the failure paths.

use super::{CacheBackend, CacheConnection};
use crate::error::{ObserveError, Result};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Default)]
struct Tables {
    lists: HashMap<String, VecDeque<String>>,
    values: HashMap<String, (String, Option<Instant>)>,
}

struct Inner {
    tables: Mutex<Tables>,
    available: AtomicBool,
    dials: AtomicU32,
}

/// Shared in-memory cache
///
/// Clones share the same data, so a test can keep a handle while the
/// connector dials its own connections.
#[derive(Clone)]
pub struct MemoryCache {
    inner: Arc<Inner>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                tables: Mutex::new(Tables::default()),
                available: AtomicBool::new(true),
                dials: AtomicU32::new(0),
            }),
        }
    }

    /// Simulate the cache going down or coming back
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    /// Number of dial attempts seen so far
    pub fn dial_count(&self) -> u32 {
        self.inner.dials.load(Ordering::SeqCst)
    }

    /// Push a value directly, bypassing the connector
    pub fn inject(&self, key: &str, value: &str) {
        if let Ok(mut tables) = self.inner.tables.lock() {
            tables
                .lists
                .entry(key.to_string())
                .or_default()
                .push_front(value.to_string());
        }
    }

    /// Remaining lifetime of a string key
    pub fn expiry_of(&self, key: &str) -> Option<Duration> {
        let tables = self.inner.tables.lock().ok()?;
        let (_, deadline) = tables.values.get(key)?;
        deadline.map(|d| d.saturating_duration_since(Instant::now()))
    }

    fn check(&self) -> Result<()> {
        if self.inner.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ObserveError::Cache("memory cache unavailable".to_string()))
        }
    }

    fn tables(&self) -> Result<MutexGuard<'_, Tables>> {
        self.check()?;
        self.inner
            .tables
            .lock()
            .map_err(|e| ObserveError::Cache(format!("lock poisoned: {}", e)))
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    async fn dial(&self) -> Result<Box<dyn CacheConnection>> {
        self.inner.dials.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        Ok(Box::new(MemoryConnection {
            cache: self.clone(),
        }))
    }

    fn name(&self) -> &str {
        "memory"
    }
}

/// Connection handle onto a `MemoryCache`
pub struct MemoryConnection {
    cache: MemoryCache,
}

#[async_trait]
impl CacheConnection for MemoryConnection {
    async fn ping(&mut self) -> Result<()> {
        self.cache.check()
    }

    async fn push_front(&mut self, key: &str, value: &str) -> Result<()> {
        let mut tables = self.cache.tables()?;
        tables
            .lists
            .entry(key.to_string())
            .or_default()
            .push_front(value.to_string());
        Ok(())
    }

    async fn trim(&mut self, key: &str, start: isize, stop: isize) -> Result<()> {
        let mut tables = self.cache.tables()?;
        if let Some(list) = tables.lists.get_mut(key) {
            match resolve_range(list.len(), start, stop) {
                Some((from, to)) => {
                    list.truncate(to + 1);
                    list.drain(..from);
                }
                None => list.clear(),
            }
            if list.is_empty() {
                tables.lists.remove(key);
            }
        }
        Ok(())
    }

    async fn range(&mut self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        let tables = self.cache.tables()?;
        let Some(list) = tables.lists.get(key) else {
            return Ok(Vec::new());
        };
        Ok(match resolve_range(list.len(), start, stop) {
            Some((from, to)) => list.range(from..=to).cloned().collect(),
            None => Vec::new(),
        })
    }

    async fn list_len(&mut self, key: &str) -> Result<usize> {
        let tables = self.cache.tables()?;
        Ok(tables.lists.get(key).map(VecDeque::len).unwrap_or(0))
    }

    async fn set_with_expiry(&mut self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut tables = self.cache.tables()?;
        tables
            .values
            .insert(key.to_string(), (value.to_string(), Some(Instant::now() + ttl)));
        Ok(())
    }

    async fn get(&mut self, key: &str) -> Result<Option<String>> {
        let mut tables = self.cache.tables()?;
        let expired = match tables.values.get(key) {
            Some((_, Some(deadline))) => *deadline <= Instant::now(),
            _ => false,
        };
        if expired {
            tables.values.remove(key);
            return Ok(None);
        }
        Ok(tables.values.get(key).map(|(value, _)| value.clone()))
    }

    async fn delete(&mut self, key: &str) -> Result<()> {
        let mut tables = self.cache.tables()?;
        tables.values.remove(key);
        tables.lists.remove(key);
        Ok(())
    }
}

/// Resolve Redis-style inclusive indexes against a list of `len` elements
fn resolve_range(len: usize, start: isize, stop: isize) -> Option<(usize, usize)> {
    if len == 0 {
        return None;
    }
    let len = len as isize;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if start > stop || start >= len || stop < 0 {
        return None;
    }
    Some((start as usize, stop as usize))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn conn(cache: &MemoryCache) -> Box<dyn CacheConnection> {
        cache.dial().await.unwrap()
    }

    #[test]
    fn test_resolve_range() {
        assert_eq!(resolve_range(5, 0, -1), Some((0, 4)));
        assert_eq!(resolve_range(5, 0, 99), Some((0, 4)));
        assert_eq!(resolve_range(5, -2, -1), Some((3, 4)));
        assert_eq!(resolve_range(5, -100, -1), Some((0, 4)));
        assert_eq!(resolve_range(5, 3, 1), None);
        assert_eq!(resolve_range(5, 7, 9), None);
        assert_eq!(resolve_range(0, 0, -1), None);
    }

    #[tokio::test]
    async fn test_push_front_and_range() {
        let cache = MemoryCache::new();
        let mut c = conn(&cache).await;
        c.push_front("k", "a").await.unwrap();
        c.push_front("k", "b").await.unwrap();
        c.push_front("k", "c").await.unwrap();

        assert_eq!(c.range("k", 0, -1).await.unwrap(), vec!["c", "b", "a"]);
        assert_eq!(c.range("k", 0, 0).await.unwrap(), vec!["c"]);
        assert_eq!(c.list_len("k").await.unwrap(), 3);
        assert!(c.range("missing", 0, -1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_trim_keeps_head() {
        let cache = MemoryCache::new();
        let mut c = conn(&cache).await;
        for i in 0..10 {
            c.push_front("k", &i.to_string()).await.unwrap();
        }
        c.trim("k", 0, 2).await.unwrap();
        assert_eq!(c.range("k", 0, -1).await.unwrap(), vec!["9", "8", "7"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_with_expiry() {
        let cache = MemoryCache::new();
        let mut c = conn(&cache).await;
        c.set_with_expiry("session:a", "v", Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(c.get("session:a").await.unwrap().as_deref(), Some("v"));
        assert_eq!(cache.expiry_of("session:a"), Some(Duration::from_secs(10)));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(c.get("session:a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unavailable_fails_dial_and_commands() {
        let cache = MemoryCache::new();
        let mut c = conn(&cache).await;
        cache.set_available(false);

        assert!(cache.dial().await.is_err());
        assert!(c.ping().await.is_err());
        assert!(c.push_front("k", "v").await.is_err());

        cache.set_available(true);
        assert!(c.ping().await.is_ok());
    }

    #[tokio::test]
    async fn test_delete() {
        let cache = MemoryCache::new();
        let mut c = conn(&cache).await;
        c.set_with_expiry("s", "v", Duration::from_secs(60)).await.unwrap();
        c.delete("s").await.unwrap();
        assert_eq!(c.get("s").await.unwrap(), None);
    }
}
