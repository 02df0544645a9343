//! The object-store collaborator as seen by discovery and the pipeline.

use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{Stream, TryStreamExt};
use serde::Serialize;
use tokio::io::{AsyncWriteExt, BufWriter};

use crate::error::StorageError;

/// Identity-relevant metadata of a remote object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObjectMetadata {
    pub size_bytes: u64,
    /// ETag with surrounding quotes stripped; empty when the store reports none.
    pub checksum: String,
    pub last_modified: DateTime<Utc>,
}

/// A remote object copied to local disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadedFile {
    pub bytes: u64,
    /// Newline-delimited records, counting an unterminated final line.
    pub lines: u64,
}

#[async_trait]
pub trait ObjectSource: Send + Sync {
    /// Keys under `prefix`, in the order the store returns them.
    /// Non-recursive listing stays at the first level below the prefix.
    async fn list(&self, bucket: &str, prefix: &str, recursive: bool) -> Result<Vec<String>, StorageError>;

    async fn head(&self, bucket: &str, key: &str) -> Result<ObjectMetadata, StorageError>;

    /// Stream the object into `target`, failing once more than `max_bytes` arrive.
    async fn download(
        &self,
        bucket: &str,
        key: &str,
        target: &Path,
        max_bytes: u64,
    ) -> Result<DownloadedFile, StorageError>;
}

/// Strip the quoting S3 puts around ETags.
pub fn normalize_etag(etag: Option<&str>) -> String {
    etag.map(|e| e.trim_matches('"').to_string()).unwrap_or_default()
}

/// Write a chunk stream to `target` through a buffer of `chunk_bytes`,
/// counting bytes and newline-delimited records on the way.
pub async fn write_stream<S, E>(
    key: &str,
    stream: S,
    target: &Path,
    chunk_bytes: usize,
    max_bytes: u64,
) -> Result<DownloadedFile, StorageError>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    StorageError: From<E>,
{
    let file = tokio::fs::File::create(target).await?;
    let mut writer = BufWriter::with_capacity(chunk_bytes.max(8 * 1024), file);
    let mut stream = stream.map_err(StorageError::from);

    let mut bytes = 0u64;
    let mut lines = 0u64;
    let mut last = b'\n';

    while let Some(chunk) = stream.try_next().await? {
        if chunk.is_empty() {
            continue;
        }
        bytes += chunk.len() as u64;
        if bytes > max_bytes {
            return Err(StorageError::TooLarge {
                key: key.to_string(),
                size: bytes,
                limit: max_bytes,
            });
        }
        lines += chunk.iter().filter(|b| **b == b'\n').count() as u64;
        last = chunk[chunk.len() - 1];
        writer.write_all(&chunk).await?;
    }
    writer.flush().await?;

    if last != b'\n' {
        lines += 1;
    }
    Ok(DownloadedFile { bytes, lines })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunks(parts: &[&'static str]) -> impl Stream<Item = Result<Bytes, std::io::Error>> + Unpin {
        futures::stream::iter(
            parts
                .iter()
                .map(|p| Ok(Bytes::from_static(p.as_bytes())))
                .collect::<Vec<_>>(),
        )
    }

    #[test]
    fn etag_quotes_are_stripped() {
        assert_eq!(normalize_etag(Some("\"abc123\"")), "abc123");
        assert_eq!(normalize_etag(Some("abc123")), "abc123");
        assert_eq!(normalize_etag(None), "");
    }

    #[tokio::test]
    async fn counts_lines_across_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("out.ndjson");

        let result = write_stream("k", chunks(&["{\"a\":1}\n{\"a\"", ":2}\n{\"a\":3}"]), &target, 16, 1024)
            .await
            .unwrap();

        assert_eq!(result.lines, 3);
        assert_eq!(result.bytes, 23);
        let written = std::fs::read_to_string(&target).unwrap();
        assert_eq!(written, "{\"a\":1}\n{\"a\":2}\n{\"a\":3}");
    }

    #[tokio::test]
    async fn empty_object_has_no_lines() {
        let dir = tempfile::tempdir().unwrap();
        let result = write_stream("k", chunks(&[]), &dir.path().join("e"), 16, 1024)
            .await
            .unwrap();
        assert_eq!(result, DownloadedFile { bytes: 0, lines: 0 });
    }

    #[tokio::test]
    async fn oversized_stream_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = write_stream("big", chunks(&["0123456789", "0123456789"]), &dir.path().join("b"), 16, 15)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::TooLarge { size: 20, limit: 15, .. }));
    }
}
