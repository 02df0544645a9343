use std::num::NonZeroUsize;
use std::time::Duration;

use lru::LruCache;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::StorageError;
use crate::source::{ObjectMetadata, ObjectSource};

const CACHE_CAPACITY: NonZeroUsize = match NonZeroUsize::new(10_000) {
    Some(n) => n,
    None => panic!("cache capacity must be non-zero"),
};

struct CachedMetadata {
    metadata: ObjectMetadata,
    fetched_at: Instant,
}

/// Time-bounded cache of remote object metadata, keyed by `bucket:key`.
///
/// Entries are served while younger than the TTL and refetched afterwards.
/// Nothing invalidates an entry early, so a changed object can be reported
/// stale for up to one TTL.
pub struct MetadataCache {
    entries: Mutex<LruCache<String, CachedMetadata>>,
    ttl: Duration,
}

impl MetadataCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(CACHE_CAPACITY)),
            ttl,
        }
    }

    fn cache_key(bucket: &str, key: &str) -> String {
        format!("{bucket}:{key}")
    }

    /// Fresh cached entry, if any.
    pub fn peek(&self, bucket: &str, key: &str) -> Option<ObjectMetadata> {
        let mut entries = self.entries.lock();
        let cache_key = Self::cache_key(bucket, key);
        let found = entries
            .get(&cache_key)
            .map(|entry| (entry.fetched_at.elapsed() < self.ttl, entry.metadata.clone()));
        match found {
            Some((true, metadata)) => Some(metadata),
            Some((false, _)) => {
                entries.pop(&cache_key);
                None
            }
            None => None,
        }
    }

    pub async fn get(
        &self,
        source: &dyn ObjectSource,
        bucket: &str,
        key: &str,
    ) -> Result<ObjectMetadata, StorageError> {
        if let Some(metadata) = self.peek(bucket, key) {
            debug!("Metadata cache hit: {}:{}", bucket, key);
            return Ok(metadata);
        }

        info!("Metadata cache miss: {}:{}", bucket, key);
        let metadata = source.head(bucket, key).await?;

        self.entries.lock().put(
            Self::cache_key(bucket, key),
            CachedMetadata {
                metadata: metadata.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(metadata)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::Utc;

    use super::*;
    use crate::source::DownloadedFile;

    /// Counts HEAD requests; reports the request number as the size.
    #[derive(Default)]
    struct CountingSource {
        heads: AtomicUsize,
    }

    #[async_trait]
    impl ObjectSource for CountingSource {
        async fn list(&self, _: &str, _: &str, _: bool) -> Result<Vec<String>, StorageError> {
            Ok(Vec::new())
        }

        async fn head(&self, _: &str, _: &str) -> Result<ObjectMetadata, StorageError> {
            let n = self.heads.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(ObjectMetadata {
                size_bytes: n as u64,
                checksum: format!("etag-{n}"),
                last_modified: Utc::now(),
            })
        }

        async fn download(&self, _: &str, _: &str, _: &Path, _: u64) -> Result<DownloadedFile, StorageError> {
            Err(StorageError::Other("not used".into()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn entry_served_until_ttl_elapses() {
        let source = CountingSource::default();
        let cache = MetadataCache::new(Duration::from_secs(3600));

        let first = cache.get(&source, "b", "k").await.unwrap();
        assert_eq!(first.size_bytes, 1);

        tokio::time::advance(Duration::from_secs(3599)).await;
        let cached = cache.get(&source, "b", "k").await.unwrap();
        assert_eq!(cached, first);
        assert_eq!(source.heads.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(1)).await;
        let refreshed = cache.get(&source, "b", "k").await.unwrap();
        assert_eq!(refreshed.size_bytes, 2);
        assert_eq!(source.heads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn keys_are_scoped_by_bucket() {
        let source = CountingSource::default();
        let cache = MetadataCache::new(Duration::from_secs(60));

        cache.get(&source, "a", "k").await.unwrap();
        cache.get(&source, "b", "k").await.unwrap();
        assert_eq!(source.heads.load(Ordering::SeqCst), 2);
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn peek_drops_expired_entries() {
        let source = CountingSource::default();
        let cache = MetadataCache::new(Duration::from_secs(10));

        cache.get(&source, "b", "k").await.unwrap();
        assert!(cache.peek("b", "k").is_some());

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(cache.peek("b", "k").is_none());
        assert!(cache.is_empty());
    }
}
