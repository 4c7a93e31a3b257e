mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::{fast_retry, FlakyFetcher, MissingFetcher};
use mlpot_parity::core::scenarios::ArtifactSpec;
use mlpot_parity::engine::artifacts::{ArtifactCache, RetryPolicy};
use mlpot_parity::error::HarnessError;

const URL: &str = "https://models.invalid/model.json";

#[test]
fn test_transient_failures_are_retried() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = Arc::new(FlakyFetcher::new(2, b"{\"weights\": []}"));
    let cache = ArtifactCache::new(dir.path(), fetcher.clone(), fast_retry());

    let path = cache.ensure(&ArtifactSpec::remote("model.json", URL)).unwrap();
    assert_eq!(path, dir.path().join("model.json"));
    assert_eq!(std::fs::read(&path).unwrap(), b"{\"weights\": []}");
    assert_eq!(fetcher.calls(), 3);
}

#[test]
fn test_exhausted_retries_become_artifact_unavailable() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = Arc::new(FlakyFetcher::new(10, b"never"));
    let cache = ArtifactCache::new(dir.path(), fetcher.clone(), fast_retry());

    let err = cache.ensure(&ArtifactSpec::remote("model.json", URL)).unwrap_err();
    assert!(matches!(err, HarnessError::ArtifactUnavailable { .. }));
    assert!(err.to_string().contains("3 attempts"));
    assert_eq!(fetcher.calls(), 3);
    assert!(!dir.path().join("model.json").exists());
}

#[test]
fn test_permanent_failure_is_not_retried() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = Arc::new(MissingFetcher {
        calls: AtomicUsize::new(0),
    });
    let cache = ArtifactCache::new(dir.path(), fetcher.clone(), fast_retry());

    let err = cache.ensure(&ArtifactSpec::remote("model.json", URL)).unwrap_err();
    assert!(matches!(err, HarnessError::ArtifactUnavailable { .. }));
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_cached_artifact_is_not_fetched_again() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = Arc::new(FlakyFetcher::new(0, b"v1"));
    let cache = ArtifactCache::new(dir.path(), fetcher.clone(), RetryPolicy::default());
    let spec = ArtifactSpec::remote("model.json", URL);

    let first = cache.ensure(&spec).unwrap();
    let second = cache.ensure(&spec).unwrap();
    assert_eq!(first, second);
    assert_eq!(fetcher.calls(), 1);
}

#[test]
fn test_concurrent_first_use_downloads_once() {
    let dir = tempfile::tempdir().unwrap();
    let mut fetcher = FlakyFetcher::new(0, &[7u8; 4096]);
    fetcher.delay = Duration::from_millis(50);
    let fetcher = Arc::new(fetcher);
    let cache = Arc::new(ArtifactCache::new(dir.path(), fetcher.clone(), fast_retry()));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let cache = cache.clone();
            thread::spawn(move || {
                let path = cache
                    .ensure(&ArtifactSpec::remote("model.json", URL))
                    .unwrap();
                // Every reader sees the complete file.
                std::fs::read(path).unwrap().len()
            })
        })
        .collect();

    for h in handles {
        assert_eq!(h.join().unwrap(), 4096);
    }
    assert_eq!(fetcher.calls(), 1);

    // Only the final file remains; no temporary leftovers.
    let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
    assert_eq!(entries.len(), 1);
}

#[test]
fn test_path_like_cache_keys_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = Arc::new(FlakyFetcher::new(0, b"x"));
    let cache = ArtifactCache::new(dir.path(), fetcher.clone(), fast_retry());

    let err = cache
        .ensure(&ArtifactSpec::remote("../escape.json", URL))
        .unwrap_err();
    assert!(matches!(err, HarnessError::ArtifactUnavailable { .. }));
    assert_eq!(fetcher.calls(), 0);
}

#[test]
fn test_local_artifact_is_used_in_place() {
    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().join("local.json");
    std::fs::write(&local, b"{}").unwrap();
    let fetcher = Arc::new(FlakyFetcher::new(0, b"x"));
    let cache = ArtifactCache::new(dir.path().join("cache"), fetcher.clone(), fast_retry());

    assert_eq!(cache.ensure(&ArtifactSpec::local(&local)).unwrap(), local);
    assert_eq!(fetcher.calls(), 0);
    assert!(!cache.dir().exists());
}
