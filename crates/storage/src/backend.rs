use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use futures::TryStreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;
use parking_lot::Mutex;
use tracing::{debug, info};

use loadstar_core::config::AwsConfig;

use crate::error::StorageError;
use crate::source::{normalize_etag, write_stream, DownloadedFile, ObjectMetadata, ObjectSource};

/// `ObjectSource` over `object_store`, one client per bucket.
///
/// Buckets map to S3 buckets, or to directories under `AwsConfig::local_root`
/// when that is set.
pub struct ObjectStoreSource {
    aws: AwsConfig,
    chunk_bytes: usize,
    stores: Mutex<HashMap<String, Arc<dyn ObjectStore>>>,
}

impl ObjectStoreSource {
    pub fn new(aws: AwsConfig, chunk_bytes: usize) -> Self {
        Self {
            aws,
            chunk_bytes,
            stores: Mutex::new(HashMap::new()),
        }
    }

    /// Source whose buckets are directories under `root`.
    pub fn local(root: impl Into<PathBuf>, chunk_bytes: usize) -> Self {
        let aws = AwsConfig {
            region: String::new(),
            access_key_id: None,
            secret_access_key: None,
            session_token: None,
            endpoint_url: None,
            local_root: Some(root.into()),
        };
        Self::new(aws, chunk_bytes)
    }

    fn store(&self, bucket: &str) -> Result<Arc<dyn ObjectStore>, StorageError> {
        let mut stores = self.stores.lock();
        if let Some(store) = stores.get(bucket) {
            return Ok(store.clone());
        }
        let store: Arc<dyn ObjectStore> = match &self.aws.local_root {
            Some(root) => Arc::new(local_store(&root.join(bucket))?),
            None => Arc::new(s3_store(&self.aws, bucket)?),
        };
        stores.insert(bucket.to_string(), store.clone());
        Ok(store)
    }
}

fn local_store(dir: &Path) -> Result<LocalFileSystem, StorageError> {
    let canonical = std::fs::canonicalize(dir).unwrap_or_else(|_| dir.to_path_buf());
    let store = LocalFileSystem::new_with_prefix(&canonical)
        .map_err(|e| StorageError::Other(format!("local filesystem error: {e}")))?;
    info!("Objects: local bucket at {}", canonical.display());
    Ok(store)
}

fn s3_store(aws: &AwsConfig, bucket: &str) -> Result<object_store::aws::AmazonS3, StorageError> {
    if bucket.is_empty() {
        return Err(StorageError::NotConfigured("bucket name is empty".into()));
    }

    let mut builder = AmazonS3Builder::new()
        .with_region(&aws.region)
        .with_bucket_name(bucket);

    if aws.is_configured() {
        if let Some(ref key) = aws.access_key_id {
            builder = builder.with_access_key_id(key);
        }
        if let Some(ref secret) = aws.secret_access_key {
            builder = builder.with_secret_access_key(secret);
        }
        if let Some(ref token) = aws.session_token {
            builder = builder.with_token(token);
        }
    } else {
        // Public buckets: send unsigned requests.
        builder = builder.with_skip_signature(true);
    }

    if let Some(ref endpoint) = aws.endpoint_url {
        // object_store requires absolute URLs
        let endpoint_url = if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            endpoint.clone()
        } else {
            format!("https://{}", endpoint)
        };
        builder = builder
            .with_endpoint(&endpoint_url)
            .with_allow_http(endpoint_url.starts_with("http://"));
    }

    let store = builder.build()?;
    info!(
        "Objects: S3 bucket s3://{} (region: {}, signed: {})",
        bucket,
        aws.region,
        aws.is_configured()
    );
    Ok(store)
}

fn prefix_path(prefix: &str) -> Option<ObjectPath> {
    let trimmed = prefix.trim_matches('/');
    if trimmed.is_empty() {
        None
    } else {
        Some(ObjectPath::from(trimmed))
    }
}

#[async_trait]
impl ObjectSource for ObjectStoreSource {
    async fn list(&self, bucket: &str, prefix: &str, recursive: bool) -> Result<Vec<String>, StorageError> {
        let store = self.store(bucket)?;
        let path = prefix_path(prefix);

        let keys: Vec<String> = if recursive {
            let mut stream = store.list(path.as_ref());
            let mut keys = Vec::new();
            while let Some(meta) = stream.try_next().await? {
                keys.push(meta.location.to_string());
            }
            keys
        } else {
            store
                .list_with_delimiter(path.as_ref())
                .await?
                .objects
                .into_iter()
                .map(|meta| meta.location.to_string())
                .collect()
        };

        debug!(bucket, prefix, recursive, count = keys.len(), "listed objects");
        Ok(keys)
    }

    async fn head(&self, bucket: &str, key: &str) -> Result<ObjectMetadata, StorageError> {
        let store = self.store(bucket)?;
        let meta = store.head(&ObjectPath::from(key)).await?;
        Ok(ObjectMetadata {
            size_bytes: meta.size as u64,
            checksum: normalize_etag(meta.e_tag.as_deref()),
            last_modified: meta.last_modified,
        })
    }

    async fn download(
        &self,
        bucket: &str,
        key: &str,
        target: &Path,
        max_bytes: u64,
    ) -> Result<DownloadedFile, StorageError> {
        let store = self.store(bucket)?;
        let result = store.get(&ObjectPath::from(key)).await?;
        let downloaded = write_stream(key, result.into_stream(), target, self.chunk_bytes, max_bytes).await?;
        debug!(
            bucket,
            key,
            bytes = downloaded.bytes,
            lines = downloaded.lines,
            target = %target.display(),
            "downloaded object"
        );
        Ok(downloaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded_root() -> tempfile::TempDir {
        let root = tempfile::tempdir().unwrap();
        let bucket = root.path().join("bucket");
        std::fs::create_dir_all(bucket.join("p/nested")).unwrap();
        std::fs::write(bucket.join("p/2021.ndjson"), "{}\n{}\n").unwrap();
        std::fs::write(bucket.join("p/nested/2022.ndjson"), "{}\n").unwrap();
        root
    }

    #[tokio::test]
    async fn local_listing_respects_recursion() {
        let root = seeded_root();
        let source = ObjectStoreSource::local(root.path(), 1024);

        let flat = source.list("bucket", "p/", false).await.unwrap();
        assert_eq!(flat, vec!["p/2021.ndjson".to_string()]);

        let mut deep = source.list("bucket", "p", true).await.unwrap();
        deep.sort();
        assert_eq!(deep, vec!["p/2021.ndjson".to_string(), "p/nested/2022.ndjson".to_string()]);
    }

    #[tokio::test]
    async fn local_head_and_download() {
        let root = seeded_root();
        let source = ObjectStoreSource::local(root.path(), 1024);

        let meta = source.head("bucket", "p/2021.ndjson").await.unwrap();
        assert_eq!(meta.size_bytes, 6);
        assert!(!meta.checksum.contains('"'));

        let target = root.path().join("copy.ndjson");
        let file = source.download("bucket", "p/2021.ndjson", &target, 1024).await.unwrap();
        assert_eq!(file, DownloadedFile { bytes: 6, lines: 2 });
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "{}\n{}\n");
    }

    #[tokio::test]
    async fn missing_object_is_an_error() {
        let root = seeded_root();
        let source = ObjectStoreSource::local(root.path(), 1024);
        let err = source.head("bucket", "p/1999.ndjson").await.unwrap_err();
        assert!(matches!(err, StorageError::ObjectStore(object_store::Error::NotFound { .. })));
    }
}
