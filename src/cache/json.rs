use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::{move_aside, ResolutionCache};
use crate::errors::{AppError, AppResult};
use crate::resolution::CacheEntry;

/// JSON object keyed by query, rewritten whole on every change.
///
/// Writes go to a sibling temp file which is synced and renamed over the
/// cache, so a crash leaves either the old or the new file, never a torn one.
pub struct JsonFileCache {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, CacheEntry>>,
    recovered: bool,
}

impl JsonFileCache {
    pub fn open(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref().to_path_buf();
        let (entries, recovered) = match fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<BTreeMap<String, CacheEntry>>(&contents)
            {
                Ok(entries) => {
                    info!(
                        target: "geocode_cache",
                        path = %path.display(),
                        entries = entries.len(),
                        "loaded geocode cache"
                    );
                    (entries, false)
                }
                Err(err) => {
                    warn!(
                        target: "geocode_cache",
                        path = %path.display(),
                        error = %err,
                        "geocode cache is corrupt; starting with an empty cache"
                    );
                    if let Some(quarantined) = move_aside(&path) {
                        info!(
                            target: "geocode_cache",
                            quarantined = %quarantined.display(),
                            "corrupt cache kept for inspection"
                        );
                    }
                    (BTreeMap::new(), true)
                }
            },
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(target: "geocode_cache", path = %path.display(), "no cache file yet");
                (BTreeMap::new(), false)
            }
            Err(err) => return Err(AppError::Io(err)),
        };

        Ok(Self {
            path,
            entries: Mutex::new(entries),
            recovered,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True when a corrupt file was set aside at open.
    pub fn recovered(&self) -> bool {
        self.recovered
    }

    fn persist_locked(&self, entries: &BTreeMap<String, CacheEntry>) -> AppResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let serialized = serde_json::to_vec_pretty(entries)?;
        let staging = self.staging_path();
        {
            let mut file = File::create(&staging)?;
            file.write_all(&serialized)?;
            file.sync_all()?;
        }
        fs::rename(&staging, &self.path)?;
        debug!(
            target: "geocode_cache",
            entries = entries.len(),
            "geocode cache saved"
        );
        Ok(())
    }

    fn staging_path(&self) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| "geocode-cache".into());
        self.path.with_file_name(format!("{name}.tmp"))
    }
}

impl ResolutionCache for JsonFileCache {
    fn get(&self, query: &str) -> AppResult<Option<CacheEntry>> {
        Ok(self.entries.lock().get(query).cloned())
    }

    fn put(&self, query: &str, entry: &CacheEntry) -> AppResult<()> {
        let mut entries = self.entries.lock();
        let previous = entries.insert(query.to_string(), entry.clone());
        if let Err(err) = self.persist_locked(&entries) {
            // keep memory in step with what is on disk
            match previous {
                Some(previous) => entries.insert(query.to_string(), previous),
                None => entries.remove(query),
            };
            return Err(err);
        }
        Ok(())
    }

    fn invalidate(&self, query: &str) -> AppResult<bool> {
        let mut entries = self.entries.lock();
        let Some(previous) = entries.remove(query) else {
            return Ok(false);
        };
        if let Err(err) = self.persist_locked(&entries) {
            entries.insert(query.to_string(), previous);
            return Err(err);
        }
        Ok(true)
    }

    fn invalidate_failures(&self) -> AppResult<usize> {
        let mut entries = self.entries.lock();
        let failed: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| !entry.is_resolved())
            .map(|(query, _)| query.clone())
            .collect();
        if failed.is_empty() {
            return Ok(0);
        }
        let mut retained = entries.clone();
        for query in &failed {
            retained.remove(query);
        }
        self.persist_locked(&retained)?;
        *entries = retained;
        info!(
            target: "geocode_cache",
            removed = failed.len(),
            "invalidated cached failures"
        );
        Ok(failed.len())
    }

    fn len(&self) -> AppResult<usize> {
        Ok(self.entries.lock().len())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tempfile::tempdir;

    use super::super::tests::{failed, resolved};
    use super::*;

    #[test]
    fn survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("cache.json");
        {
            let cache = JsonFileCache::open(&path).unwrap();
            cache.put("Starehe, Nairobi", &resolved(-1.28, 36.82)).unwrap();
            cache.put("Nowhere, Kenya", &failed()).unwrap();
        }
        let cache = JsonFileCache::open(&path).unwrap();
        assert!(!cache.recovered());
        assert_eq!(cache.len().unwrap(), 2);
        assert!(cache.get("Starehe, Nairobi").unwrap().unwrap().is_resolved());
        assert!(!cache.get("Nowhere, Kenya").unwrap().unwrap().is_resolved());
        assert!(!dir.path().join("nested").join("cache.json.tmp").exists());
    }

    #[test]
    fn corrupt_file_is_quarantined_not_overwritten() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache.json");
        fs::write(&path, "{\"Starehe\": {\"lat\": -1.2, \"lon\": 36.8, \"meth").unwrap();

        let cache = JsonFileCache::open(&path).unwrap();
        assert!(cache.recovered());
        assert!(cache.is_empty().unwrap());

        let quarantined: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().contains(".corrupt-"))
            .collect();
        assert_eq!(quarantined.len(), 1);
    }

    // procfs refuses renames, so the corrupt file cannot be moved aside
    #[cfg(target_os = "linux")]
    #[test]
    fn unmovable_corrupt_file_still_opens_empty() {
        let cache = JsonFileCache::open("/proc/self/cmdline").unwrap();
        assert!(cache.recovered());
        assert!(cache.is_empty().unwrap());
    }

    #[test]
    fn undecodable_entry_fails_the_whole_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache.json");
        fs::write(
            &path,
            r#"{
                "good": { "lat": -1.2, "lon": 36.8, "method": "nominatim" },
                "bad": { "method": "shrug" }
            }"#,
        )
        .unwrap();
        let cache = JsonFileCache::open(&path).unwrap();
        assert!(cache.recovered());
        assert!(cache.get("good").unwrap().is_none());
    }

    #[test]
    fn reads_legacy_cache_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("geocode_cache.json");
        fs::write(
            &path,
            r#"{
                "Kibra Sub-County Office, Nairobi County, Kenya": {
                    "lat": -1.3133, "lon": 36.7878,
                    "address": "Kibra, Nairobi", "confidence": 0.9, "method": "google"
                },
                "Unknown Place, Kenya": {
                    "lat": null, "lon": null, "method": "manual", "address": null, "confidence": 0
                }
            }"#,
        )
        .unwrap();
        let cache = JsonFileCache::open(&path).unwrap();
        assert!(!cache.recovered());
        assert_eq!(cache.len().unwrap(), 2);
        assert_eq!(cache.invalidate_failures().unwrap(), 1);

        let reopened = JsonFileCache::open(&path).unwrap();
        assert_eq!(reopened.len().unwrap(), 1);
    }

    #[test]
    fn concurrent_writers_keep_every_entry() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache.json");
        let cache = Arc::new(JsonFileCache::open(&path).unwrap());
        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    for i in 0..10 {
                        let query = format!("office {worker}-{i}");
                        cache.put(&query, &resolved(-1.0, 37.0)).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let reopened = JsonFileCache::open(&path).unwrap();
        assert_eq!(reopened.len().unwrap(), 80);
    }

    #[test]
    fn last_write_wins() {
        let dir = tempdir().unwrap();
        let cache = JsonFileCache::open(dir.path().join("cache.json")).unwrap();
        cache.put("q", &failed()).unwrap();
        cache.put("q", &resolved(0.1, 37.5)).unwrap();
        assert_eq!(
            cache.get("q").unwrap().unwrap().coordinate(),
            Some((0.1, 37.5))
        );
    }
}
