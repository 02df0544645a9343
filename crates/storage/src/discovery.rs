use tracing::info;

use loadstar_core::NamingConvention;

use crate::error::StorageError;
use crate::source::ObjectSource;

/// Candidate object keys under `path`, in listing order.
///
/// Keys must follow `naming`; with `year` set, only keys whose year token
/// equals it are kept.
pub async fn discover(
    source: &dyn ObjectSource,
    bucket: &str,
    path: &str,
    recursive: bool,
    year: Option<i32>,
    naming: NamingConvention,
) -> Result<Vec<String>, StorageError> {
    let prefix = format!("{}/", path.trim_end_matches('/'));
    let listed = source.list(bucket, &prefix, recursive).await?;
    let listed_count = listed.len();

    let keys: Vec<String> = listed
        .into_iter()
        .filter(|key| match naming.year_of(key) {
            Some(file_year) => year.map_or(true, |wanted| wanted == file_year),
            None => false,
        })
        .collect();

    info!(
        bucket,
        prefix = %prefix,
        recursive,
        listed = listed_count,
        matched = keys.len(),
        "discovered objects"
    );
    Ok(keys)
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use async_trait::async_trait;

    use super::*;
    use crate::source::{DownloadedFile, ObjectMetadata};

    /// Returns a fixed listing and records the prefix it was asked for.
    struct FixedListing {
        keys: Vec<&'static str>,
        seen: parking_lot::Mutex<Vec<(String, bool)>>,
    }

    impl FixedListing {
        fn new(keys: Vec<&'static str>) -> Self {
            Self { keys, seen: parking_lot::Mutex::new(Vec::new()) }
        }
    }

    #[async_trait]
    impl ObjectSource for FixedListing {
        async fn list(&self, _: &str, prefix: &str, recursive: bool) -> Result<Vec<String>, StorageError> {
            self.seen.lock().push((prefix.to_string(), recursive));
            Ok(self.keys.iter().map(|k| k.to_string()).collect())
        }

        async fn head(&self, _: &str, _: &str) -> Result<ObjectMetadata, StorageError> {
            Err(StorageError::Other("not used".into()))
        }

        async fn download(&self, _: &str, _: &str, _: &Path, _: u64) -> Result<DownloadedFile, StorageError> {
            Err(StorageError::Other("not used".into()))
        }
    }

    #[tokio::test]
    async fn filters_by_shape_and_year_keeping_order() {
        let source = FixedListing::new(vec![
            "p/2021b.ndjson",
            "p/2020.ndjson",
            "p/2021a.ndjson",
            "p/readme.txt",
            "p/catalog.ndjson",
        ]);

        let keys = discover(&source, "b", "p", false, Some(2021), NamingConvention::DEFAULT)
            .await
            .unwrap();

        assert_eq!(keys, vec!["p/2021b.ndjson", "p/2021a.ndjson"]);
        assert_eq!(source.seen.lock()[0], ("p/".to_string(), false));
    }

    #[tokio::test]
    async fn no_year_filter_keeps_every_matching_key() {
        let source = FixedListing::new(vec!["p/2019.ndjson", "p/2020.ndjson", "p/x.ndjson"]);
        let keys = discover(&source, "b", "p/", true, None, NamingConvention::DEFAULT)
            .await
            .unwrap();
        assert_eq!(keys, vec!["p/2019.ndjson", "p/2020.ndjson"]);
        assert_eq!(source.seen.lock()[0], ("p/".to_string(), true));
    }

    #[tokio::test]
    async fn listing_failure_propagates() {
        struct Broken;

        #[async_trait]
        impl ObjectSource for Broken {
            async fn list(&self, _: &str, _: &str, _: bool) -> Result<Vec<String>, StorageError> {
                Err(StorageError::Other("access denied".into()))
            }
            async fn head(&self, _: &str, _: &str) -> Result<ObjectMetadata, StorageError> {
                unreachable!()
            }
            async fn download(&self, _: &str, _: &str, _: &Path, _: u64) -> Result<DownloadedFile, StorageError> {
                unreachable!()
            }
        }

        let err = discover(&Broken, "b", "p", false, None, NamingConvention::DEFAULT)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "access denied");
    }
}
