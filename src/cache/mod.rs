//! Durable query → result store.
//!
//! The exact query string is the key; nothing here trims, folds case or
//! hashes it. Entries are replaced wholesale on `put` and removed only by
//! explicit invalidation.

mod json;
mod sqlite;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use tracing::warn;

use crate::config::{AppConfig, CacheBackend};
use crate::errors::AppResult;
use crate::resolution::CacheEntry;

pub use json::JsonFileCache;
pub use sqlite::SqliteCache;

pub trait ResolutionCache: Send + Sync {
    fn get(&self, query: &str) -> AppResult<Option<CacheEntry>>;

    /// Last write wins.
    fn put(&self, query: &str, entry: &CacheEntry) -> AppResult<()>;

    /// Removes one entry so the next resolution goes back to the providers.
    fn invalidate(&self, query: &str) -> AppResult<bool>;

    /// Removes every terminal failure, keeping resolved coordinates.
    fn invalidate_failures(&self) -> AppResult<usize>;

    fn len(&self) -> AppResult<usize>;

    fn is_empty(&self) -> AppResult<bool> {
        Ok(self.len()? == 0)
    }
}

/// Non-durable cache for tests and one-off runs.
#[derive(Default)]
pub struct MemoryCache {
    entries: RwLock<BTreeMap<String, CacheEntry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ResolutionCache for MemoryCache {
    fn get(&self, query: &str) -> AppResult<Option<CacheEntry>> {
        Ok(self.entries.read().get(query).cloned())
    }

    fn put(&self, query: &str, entry: &CacheEntry) -> AppResult<()> {
        self.entries.write().insert(query.to_string(), entry.clone());
        Ok(())
    }

    fn invalidate(&self, query: &str) -> AppResult<bool> {
        Ok(self.entries.write().remove(query).is_some())
    }

    fn invalidate_failures(&self) -> AppResult<usize> {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| entry.is_resolved());
        Ok(before - entries.len())
    }

    fn len(&self) -> AppResult<usize> {
        Ok(self.entries.read().len())
    }
}

/// Opens the backend selected in configuration.
pub fn open_cache(config: &AppConfig) -> AppResult<Arc<dyn ResolutionCache>> {
    let cache: Arc<dyn ResolutionCache> = match config.cache_backend {
        CacheBackend::Json => Arc::new(JsonFileCache::open(&config.cache_path)?),
        CacheBackend::Sqlite => Arc::new(SqliteCache::open(&config.cache_path)?),
    };
    Ok(cache)
}

/// Sibling path a corrupt cache file is moved to, so it is kept for
/// inspection instead of being overwritten by the next write.
fn quarantine_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "geocode-cache".into());
    path.with_file_name(format!(
        "{name}.corrupt-{}",
        Utc::now().format("%Y%m%d%H%M%S%3f")
    ))
}

/// Moves a corrupt cache file aside. A failed move is logged and the caller
/// carries on with an empty cache; `None` means the file is still in place.
fn move_aside(path: &Path) -> Option<PathBuf> {
    let quarantined = quarantine_path(path);
    match std::fs::rename(path, &quarantined) {
        Ok(()) => Some(quarantined),
        Err(err) => {
            warn!(
                target: "geocode_cache",
                path = %path.display(),
                error = %err,
                "could not quarantine corrupt cache file"
            );
            None
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::resolution::{FailureResult, GeocodeResult, ProviderId};

    pub(crate) fn resolved(lat: f64, lon: f64) -> CacheEntry {
        CacheEntry::Resolved(GeocodeResult {
            latitude: lat,
            longitude: lon,
            formatted_address: "Nairobi, Kenya".into(),
            method: ProviderId::NOMINATIM,
            confidence: 0.7,
            raw_result_type: "administrative".into(),
            importance: 0.5,
            resolved_at: None,
        })
    }

    pub(crate) fn failed() -> CacheEntry {
        CacheEntry::Failed(FailureResult::new(vec![ProviderId::NOMINATIM]))
    }

    #[test]
    fn memory_cache_keys_are_exact() {
        let cache = MemoryCache::new();
        cache.put("Starehe, Nairobi", &resolved(-1.28, 36.82)).unwrap();
        assert!(cache.get("Starehe, Nairobi").unwrap().is_some());
        assert!(cache.get("starehe, nairobi").unwrap().is_none());
        assert!(cache.get("Starehe,  Nairobi").unwrap().is_none());
    }

    #[test]
    fn memory_cache_invalidates_failures_only() {
        let cache = MemoryCache::new();
        cache.put("a", &resolved(-1.0, 37.0)).unwrap();
        cache.put("b", &failed()).unwrap();
        cache.put("c", &failed()).unwrap();
        assert_eq!(cache.invalidate_failures().unwrap(), 2);
        assert_eq!(cache.len().unwrap(), 1);
        assert!(cache.invalidate("a").unwrap());
        assert!(!cache.invalidate("a").unwrap());
        assert!(cache.is_empty().unwrap());
    }

    #[test]
    fn quarantine_keeps_original_name() {
        let path = Path::new("/tmp/cache/geocode_cache.json");
        let moved = quarantine_path(path);
        let name = moved.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("geocode_cache.json.corrupt-"));
        assert_eq!(moved.parent(), path.parent());
    }

    #[test]
    fn move_aside_reports_failed_rename() {
        let dir = tempfile::tempdir().unwrap();
        assert!(move_aside(&dir.path().join("missing.json")).is_none());

        let path = dir.path().join("geocode_cache.json");
        std::fs::write(&path, "{").unwrap();
        let moved = move_aside(&path).unwrap();
        assert!(!path.exists());
        assert!(moved.exists());
    }
}
