use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};
use parking_lot::Mutex;
use thiserror::Error;

use crate::core::scenarios::{ArtifactSource, ArtifactSpec};
use crate::error::{HarnessError, Result};

/// Failure of a single fetch attempt.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Worth retrying (connection reset, timeout, 5xx).
    #[error("transient fetch failure: {0}")]
    Transient(String),
    /// Retrying cannot help (404, malformed URL).
    #[error("permanent fetch failure: {0}")]
    Permanent(String),
}

/// Remote transport for parameter artifacts.
pub trait Fetcher: Send + Sync {
    fn fetch(&self, url: &str) -> std::result::Result<Vec<u8>, FetchError>;
}

/// Blocking HTTP(S) fetcher.
pub struct HttpFetcher {
    client: reqwest::blocking::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| HarnessError::EvaluatorInit(format!("HTTP client setup failed: {}", e)))?;
        Ok(Self { client })
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(&self, url: &str) -> std::result::Result<Vec<u8>, FetchError> {
        let response = self.client.get(url).send().map_err(|e| {
            if e.is_builder() {
                FetchError::Permanent(e.to_string())
            } else {
                FetchError::Transient(e.to_string())
            }
        })?;

        let status = response.status();
        if status.is_server_error() || status.as_u16() == 429 {
            return Err(FetchError::Transient(format!("HTTP {}", status)));
        }
        if !status.is_success() {
            return Err(FetchError::Permanent(format!("HTTP {}", status)));
        }

        response
            .bytes()
            .map(|b| b.to_vec())
            .map_err(|e| FetchError::Transient(e.to_string()))
    }
}

/// Bounded retry with linear backoff.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(500),
        }
    }
}

/// Filename-addressed local cache of parameter artifacts.
///
/// Acquisition is idempotent. Concurrent first use of the same file is
/// serialized by a per-file lock, and bytes land via write-then-rename so a
/// reader never observes a partial file.
pub struct ArtifactCache {
    dir: PathBuf,
    fetcher: Arc<dyn Fetcher>,
    retry: RetryPolicy,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ArtifactCache {
    pub fn new(dir: impl Into<PathBuf>, fetcher: Arc<dyn Fetcher>, retry: RetryPolicy) -> Self {
        Self {
            dir: dir.into(),
            fetcher,
            retry,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns a local path holding the artifact, downloading it if absent.
    pub fn ensure(&self, spec: &ArtifactSpec) -> Result<PathBuf> {
        match &spec.source {
            ArtifactSource::Local(path) => {
                if path.is_file() {
                    Ok(path.clone())
                } else {
                    Err(HarnessError::ArtifactUnavailable {
                        name: spec.file_name.clone(),
                        reason: format!("local file {} does not exist", path.display()),
                    })
                }
            }
            ArtifactSource::Remote(url) => self.ensure_remote(&spec.file_name, url),
        }
    }

    fn ensure_remote(&self, file_name: &str, url: &str) -> Result<PathBuf> {
        validate_file_name(file_name)?;
        let target = self.dir.join(file_name);
        if target.is_file() {
            debug!("Artifact {} already cached at {:?}", file_name, target);
            return Ok(target);
        }

        let lock = self.lock_for(file_name);
        let _guard = lock.lock();

        // Another cell may have finished the download while we waited.
        if target.is_file() {
            return Ok(target);
        }

        fs::create_dir_all(&self.dir)?;
        let bytes = self.fetch_with_retry(file_name, url)?;
        self.persist(&target, &bytes)?;
        info!("Cached artifact {} ({} bytes)", file_name, bytes.len());
        Ok(target)
    }

    fn lock_for(&self, file_name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock();
        locks
            .entry(file_name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn fetch_with_retry(&self, file_name: &str, url: &str) -> Result<Vec<u8>> {
        let attempts = self.retry.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            info!("Fetching {} (attempt {}/{})", file_name, attempt, attempts);
            match self.fetcher.fetch(url) {
                Ok(bytes) => return Ok(bytes),
                Err(FetchError::Permanent(reason)) => {
                    return Err(HarnessError::ArtifactUnavailable {
                        name: file_name.to_string(),
                        reason,
                    });
                }
                Err(FetchError::Transient(reason)) => {
                    warn!("Transient failure fetching {}: {}", file_name, reason);
                    last_error = reason;
                    if attempt < attempts {
                        thread::sleep(self.retry.backoff * attempt as u32);
                    }
                }
            }
        }

        Err(HarnessError::ArtifactUnavailable {
            name: file_name.to_string(),
            reason: format!("gave up after {} attempts: {}", attempts, last_error),
        })
    }

    fn persist(&self, target: &Path, bytes: &[u8]) -> Result<()> {
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(target).map_err(|e| HarnessError::Io(e.error))?;
        Ok(())
    }
}

fn validate_file_name(file_name: &str) -> Result<()> {
    let path = Path::new(file_name);
    let plain = path.components().count() == 1 && path.file_name().is_some();
    if file_name.is_empty() || !plain {
        return Err(HarnessError::ArtifactUnavailable {
            name: file_name.to_string(),
            reason: "cache key must be a plain file name".to_string(),
        });
    }
    Ok(())
}
