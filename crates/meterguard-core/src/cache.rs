//! Disk-backed response cache with TTL.
//!
//! Each entry is one JSON file `<sha256>.json` holding `{"value": ..., "expires_at": ms}`.
//! Entries that fail to decode, lack a field, or have expired are treated as misses and
//! removed. The cache is meant for idempotent read-only queries during development;
//! concurrent writers from several processes are last-writer-wins.

use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

const ENTRY_EXTENSION: &str = "json";

/// Errors raised by cache maintenance operations.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache I/O error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode cache entry: {0}")]
    Encode(#[from] serde_json::Error),
}

impl CacheError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheEntry {
    value: Value,
    expires_at: u64,
}

/// Outcome of reading one entry file.
#[derive(Debug)]
enum Lookup<T> {
    Hit(T),
    Miss,
    Expired,
    Corrupt(String),
}

/// Aggregate numbers reported by [`ResponseCache::stats`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub cache_dir: PathBuf,
    pub total_files: usize,
    pub total_size_bytes: u64,
    pub ttl_secs: u64,
}

/// File-based cache for API responses.
#[derive(Debug, Clone)]
pub struct ResponseCache {
    dir: PathBuf,
    ttl: Duration,
}

impl ResponseCache {
    /// Opens (and creates if needed) a cache rooted at `dir`.
    pub fn new(dir: impl Into<PathBuf>, ttl: Duration) -> Result<Self, CacheError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| CacheError::io(&dir, e))?;
        Ok(Self { dir, ttl })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub const fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Deterministic key for a (call name, arguments) pair.
    ///
    /// Object keys are sorted at every nesting level before hashing, so argument order
    /// never changes the key.
    pub fn cache_key(name: &str, args: &Value) -> String {
        let mut canonical = String::with_capacity(64);
        canonical.push_str("{\"args\":");
        write_canonical(args, &mut canonical);
        canonical.push_str(",\"func\":");
        canonical.push_str(&Value::String(name.to_owned()).to_string());
        canonical.push('}');

        hex::encode(Sha256::digest(canonical.as_bytes()))
    }

    /// Returns the cached value for `key` if present, readable and unexpired.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let path = self.entry_path(key);
        match self.lookup(&path).await {
            Lookup::Hit(value) => Some(value),
            Lookup::Miss => None,
            Lookup::Expired => {
                tracing::debug!(key, "cache entry expired");
                self.discard(&path).await;
                None
            }
            Lookup::Corrupt(reason) => {
                tracing::warn!(key, %reason, "discarding unreadable cache entry");
                self.discard(&path).await;
                None
            }
        }
    }

    /// Stores `value` under `key`, expiring after the configured TTL.
    pub async fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<(), CacheError> {
        let entry = CacheEntry {
            value: serde_json::to_value(value)?,
            expires_at: unix_millis(SystemTime::now() + self.ttl),
        };
        let bytes = serde_json::to_vec(&entry)?;

        let path = self.entry_path(key);
        let staging = self
            .dir
            .join(format!("{key}.{}.tmp", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&staging, bytes)
            .await
            .map_err(|e| CacheError::io(&staging, e))?;
        tokio::fs::rename(&staging, &path)
            .await
            .map_err(|e| CacheError::io(&path, e))
    }

    /// Serves `call` from cache when possible, otherwise runs it and caches a success.
    ///
    /// Failures are returned as-is and never cached. A failed cache write is logged and
    /// does not affect the returned value.
    pub async fn cached_call<T, E, F, Fut>(&self, name: &str, args: &Value, call: F) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let key = Self::cache_key(name, args);
        if let Some(cached) = self.get::<T>(&key).await {
            tracing::debug!(call = name, "cache hit");
            return Ok(cached);
        }

        tracing::debug!(call = name, "cache miss");
        let value = call().await?;
        if let Err(error) = self.set(&key, &value).await {
            tracing::warn!(call = name, %error, "failed to write cache entry");
        }
        Ok(value)
    }

    /// Removes every entry. Returns the number of files deleted.
    pub async fn clear(&self) -> Result<usize, CacheError> {
        let mut removed = 0;
        for path in self.entry_files().await? {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(CacheError::io(&path, e)),
            }
        }
        tracing::info!(removed, dir = %self.dir.display(), "response cache cleared");
        Ok(removed)
    }

    /// Removes expired and unreadable entries. Returns the number of files deleted.
    pub async fn purge_expired(&self) -> Result<usize, CacheError> {
        let mut removed = 0;
        for path in self.entry_files().await? {
            if matches!(
                self.lookup::<Value>(&path).await,
                Lookup::Expired | Lookup::Corrupt(_)
            ) {
                self.discard(&path).await;
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub async fn stats(&self) -> Result<CacheStats, CacheError> {
        let files = self.entry_files().await?;
        let mut total_size_bytes = 0;
        for path in &files {
            if let Ok(metadata) = tokio::fs::metadata(path).await {
                total_size_bytes += metadata.len();
            }
        }

        Ok(CacheStats {
            cache_dir: self.dir.clone(),
            total_files: files.len(),
            total_size_bytes,
            ttl_secs: self.ttl.as_secs(),
        })
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.{ENTRY_EXTENSION}"))
    }

    async fn lookup<T: DeserializeOwned>(&self, path: &Path) -> Lookup<T> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Lookup::Miss,
            Err(e) => return Lookup::Corrupt(format!("unreadable: {e}")),
        };

        let entry = match serde_json::from_slice::<CacheEntry>(&bytes) {
            Ok(entry) => entry,
            Err(e) => return Lookup::Corrupt(format!("malformed entry: {e}")),
        };
        if unix_millis(SystemTime::now()) >= entry.expires_at {
            return Lookup::Expired;
        }

        match serde_json::from_value(entry.value) {
            Ok(value) => Lookup::Hit(value),
            Err(e) => Lookup::Corrupt(format!("value has unexpected shape: {e}")),
        }
    }

    async fn discard(&self, path: &Path) {
        if let Err(e) = tokio::fs::remove_file(path).await {
            if e.kind() != ErrorKind::NotFound {
                tracing::warn!(path = %path.display(), error = %e, "failed to remove cache entry");
            }
        }
    }

    async fn entry_files(&self) -> Result<Vec<PathBuf>, CacheError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(CacheError::io(&self.dir, e)),
        };

        let mut files = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| CacheError::io(&self.dir, e))?
        {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) == Some(ENTRY_EXTENSION) {
                files.push(path);
            }
        }
        Ok(files)
    }
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys = map.keys().collect::<Vec<_>>();
            keys.sort();
            out.push('{');
            for (index, key) in keys.into_iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

fn unix_millis(at: SystemTime) -> u64 {
    at.duration_since(UNIX_EPOCH)
        .map(|elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
