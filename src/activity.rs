//! Recent-activity log
//!
//! A capped list of the latest log entries in the cache, newest at the head.
//! Writes push to the head and trim the tail, so the list never holds more
//! than [`RECENT_CAPACITY`] entries.

use crate::cache::ResilientConnector;
use crate::config::RECENT_CAPACITY;
use crate::error::Result;
use crate::telemetry::Telemetry;
use crate::types::{LogEntry, RecentEntry};

/// Capped, newest-first activity list
#[derive(Clone)]
pub struct RecentActivityLog {
    connector: ResilientConnector,
    key: String,
    telemetry: Telemetry,
}

impl RecentActivityLog {
    pub fn new(connector: ResilientConnector, key: impl Into<String>, telemetry: Telemetry) -> Self {
        Self {
            connector,
            key: key.into(),
            telemetry,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Append an entry; failures are logged and counted, never returned
    pub async fn record(&self, action: &str, details: &str) {
        if let Err(e) = self.try_record(action, details).await {
            tracing::warn!(
                key = %self.key,
                action,
                error = %e,
                "Failed to record recent activity"
            );
            self.telemetry.sink_error("recent_activity");
        }
    }

    /// Append an entry, surfacing any failure
    pub async fn try_record(&self, action: &str, details: &str) -> Result<()> {
        let entry = LogEntry::new(action, details);
        let payload = serde_json::to_string(&entry)?;

        let mut conn = self.connector.connect().await?;
        conn.push_front(&self.key, &payload).await?;
        conn.trim(&self.key, 0, RECENT_CAPACITY as isize - 1).await?;

        tracing::debug!(key = %self.key, action, "Recorded recent activity");
        Ok(())
    }

    /// The newest `limit` entries, newest first
    ///
    /// `limit` is clamped to the list capacity. Stored values that fail to
    /// parse are returned as [`RecentEntry::Raw`] at their position in the list.
    pub async fn read_recent(&self, limit: usize) -> Result<Vec<RecentEntry>> {
        let limit = limit.min(RECENT_CAPACITY);
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut conn = self.connector.connect().await?;
        let stored = conn.range(&self.key, 0, limit as isize - 1).await?;

        Ok(stored.into_iter().map(RecentEntry::parse).collect())
    }

    /// List length together with the newest `limit` entries, read over a
    /// single connection
    pub async fn snapshot(&self, limit: usize) -> Result<(usize, Vec<RecentEntry>)> {
        let limit = limit.min(RECENT_CAPACITY);
        let mut conn = self.connector.connect().await?;

        let len = conn.list_len(&self.key).await?;
        if limit == 0 || len == 0 {
            return Ok((len, Vec::new()));
        }
        let stored = conn.range(&self.key, 0, limit as isize - 1).await?;

        Ok((len, stored.into_iter().map(RecentEntry::parse).collect()))
    }

    /// Number of entries currently stored
    pub async fn len(&self) -> Result<usize> {
        let mut conn = self.connector.connect().await?;
        conn.list_len(&self.key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::telemetry::{MemorySpanExporter, SINK_ERRORS};
    use std::sync::Arc;
    use std::time::Duration;

    fn log_with(cache: &MemoryCache) -> (RecentActivityLog, Telemetry) {
        let telemetry = Telemetry::new("test", Arc::new(MemorySpanExporter::new()));
        let connector = ResilientConnector::new(Arc::new(cache.clone()), 3, Duration::from_secs(2));
        (
            RecentActivityLog::new(connector, "api_logs", telemetry.clone()),
            telemetry,
        )
    }

    #[tokio::test]
    async fn test_record_then_read_one() {
        let cache = MemoryCache::new();
        let (log, _) = log_with(&cache);

        log.record("db_insert", "Message saved: hello...").await;

        let recent = log.read_recent(1).await.unwrap();
        assert_eq!(recent.len(), 1);
        let entry = recent[0].entry().unwrap();
        assert_eq!(entry.action, "db_insert");
        assert_eq!(entry.details, "Message saved: hello...");
    }

    #[tokio::test]
    async fn test_capacity_keeps_newest_hundred() {
        let cache = MemoryCache::new();
        let (log, _) = log_with(&cache);

        for i in 0..105 {
            log.try_record("op", &format!("entry-{}", i)).await.unwrap();
        }

        assert_eq!(log.len().await.unwrap(), 100);
        let recent = log.read_recent(100).await.unwrap();
        assert_eq!(recent.len(), 100);
        assert_eq!(recent[0].entry().unwrap().details, "entry-104");
        assert_eq!(recent[99].entry().unwrap().details, "entry-5");
    }

    #[tokio::test]
    async fn test_limit_clamped_to_capacity() {
        let cache = MemoryCache::new();
        let (log, _) = log_with(&cache);
        for i in 0..120 {
            cache.inject("api_logs", &format!("raw-{}", i));
        }

        assert_eq!(log.read_recent(500).await.unwrap().len(), 100);
        assert!(log.read_recent(0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_entry_kept_in_place() {
        let cache = MemoryCache::new();
        let (log, _) = log_with(&cache);

        log.try_record("first", "a").await.unwrap();
        cache.inject("api_logs", "{not json");
        log.try_record("third", "c").await.unwrap();

        let recent = log.read_recent(10).await.unwrap();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].entry().unwrap().action, "third");
        assert_eq!(
            recent[1],
            RecentEntry::Raw {
                raw: "{not json".to_string()
            }
        );
        assert_eq!(recent[2].entry().unwrap().action, "first");
    }

    #[tokio::test]
    async fn test_empty_list_reads_empty() {
        let cache = MemoryCache::new();
        let (log, _) = log_with(&cache);
        assert!(log.read_recent(100).await.unwrap().is_empty());
        assert_eq!(log.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_snapshot_reports_length_and_entries() {
        let cache = MemoryCache::new();
        let (log, _) = log_with(&cache);
        for i in 0..3 {
            log.try_record("op", &format!("entry-{}", i)).await.unwrap();
        }

        let (len, entries) = log.snapshot(2).await.unwrap();
        assert_eq!(len, 3);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].entry().unwrap().details, "entry-2");
        assert_eq!(cache.dial_count(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_unreachable_cache_runs_one_retry_loop() {
        let cache = MemoryCache::new();
        cache.set_available(false);
        let (log, _) = log_with(&cache);

        let start = tokio::time::Instant::now();
        assert!(log.snapshot(100).await.is_err());

        assert_eq!(cache.dial_count(), 3);
        assert_eq!(start.elapsed(), Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_record_swallows_unreachable_cache() {
        let cache = MemoryCache::new();
        cache.set_available(false);
        let (log, telemetry) = log_with(&cache);

        log.record("db_insert", "lost").await;

        assert_eq!(cache.dial_count(), 3);
        assert_eq!(
            telemetry.counter_value(SINK_ERRORS, &[("sink", "recent_activity")]),
            1
        );
        assert!(log.try_record("db_insert", "lost").await.is_err());
        assert!(log.read_recent(10).await.is_err());
    }
}
