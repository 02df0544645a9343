use tracing::debug;

use crate::store::JobStore;

/// Whether another job already loaded this exact object version.
///
/// Scans every other job's details for a `success` entry with the same
/// bucket, key, size and checksum. Linear in jobs × items.
pub fn was_already_ingested(
    store: &JobStore,
    current_job_id: &str,
    bucket: &str,
    key: &str,
    size_bytes: u64,
    checksum: &str,
) -> bool {
    let found = store.records().into_iter().find(|record| {
        record.job_id != current_job_id
            && record.parameters.bucket == bucket
            && record
                .details
                .get(key)
                .is_some_and(|item| item.is_success_for(size_bytes, checksum))
    });

    match found {
        Some(record) => {
            debug!(key = %key, previous_job = %record.job_id, "object already ingested");
            true
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use loadstar_core::{ItemOutcome, JobParameters};
    use tempfile::TempDir;

    use super::*;

    const KEY: &str = "p/2021.ndjson";

    /// Store holding one prior job that loaded `KEY` (10 bytes, checksum "abc").
    fn store_with_prior_success() -> (TempDir, JobStore, String) {
        let dir = TempDir::new().expect("create tempdir");
        let store = JobStore::open(dir.path(), 10).unwrap();
        let prior = store.create(JobParameters::new("b", "p/")).unwrap();
        store.update(&prior, |r| {
            let now = Utc::now();
            r.begin(1);
            r.describe_item(KEY, 10, "abc");
            r.begin_item(KEY, now);
            r.settle_item(KEY, ItemOutcome::Success { item_count: 3, ingest_secs: 0.1 }, now);
        });
        (dir, store, prior)
    }

    #[test]
    fn exact_match_is_duplicate() {
        let (_dir, store, _) = store_with_prior_success();
        let current = store.create(JobParameters::new("b", "p/")).unwrap();
        assert!(was_already_ingested(&store, &current, "b", KEY, 10, "abc"));
    }

    #[test]
    fn different_checksum_or_size_is_not_duplicate() {
        let (_dir, store, _) = store_with_prior_success();
        let current = store.create(JobParameters::new("b", "p/")).unwrap();
        assert!(!was_already_ingested(&store, &current, "b", KEY, 10, "abd"));
        assert!(!was_already_ingested(&store, &current, "b", KEY, 11, "abc"));
        assert!(!was_already_ingested(&store, &current, "other", KEY, 10, "abc"));
        assert!(!was_already_ingested(&store, &current, "b", "p/2022.ndjson", 10, "abc"));
    }

    #[test]
    fn own_job_and_failed_items_do_not_count() {
        let (_dir, store, prior) = store_with_prior_success();
        assert!(!was_already_ingested(&store, &prior, "b", KEY, 10, "abc"));

        let failed = store.create(JobParameters::new("b", "p/")).unwrap();
        store.update(&failed, |r| {
            r.describe_item("p/2020.ndjson", 5, "xyz");
            r.settle_item("p/2020.ndjson", ItemOutcome::Failed { error: "bad row".into() }, Utc::now());
        });
        let current = store.create(JobParameters::new("b", "p/")).unwrap();
        assert!(!was_already_ingested(&store, &current, "b", "p/2020.ndjson", 5, "xyz"));
    }
}
