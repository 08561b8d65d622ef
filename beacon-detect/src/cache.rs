//! Persisted detected-games cache.
//!
//! Maps process paths to their catalog lookup result so a game (or a
//! known-uninteresting process) is never matched against the multi-megabyte
//! catalog twice. `None` memoizes "not a detectable app". Entries expire
//! after a week; the file is rewritten after every modifying pass.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

const CACHE_FILE: &str = "detected_apps_cache.json";

/// Entries older than this are purged at startup.
const MAX_CACHE_AGE_SECS: u64 = 7 * 86_400;

/// One cached lookup: `[app_id, app_name, catalog_path, last_seen]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedApp(
    pub Option<String>,
    pub Option<String>,
    pub Option<String>,
    pub u64,
);

impl CachedApp {
    pub fn app_id(&self) -> Option<&str> {
        self.0.as_deref()
    }

    pub fn app_name(&self) -> Option<&str> {
        self.1.as_deref()
    }

    pub fn catalog_path(&self) -> Option<&str> {
        self.2.as_deref()
    }
}

/// On-disk cache of catalog lookups keyed by process path.
#[derive(Debug)]
pub struct DetectedCache {
    path: PathBuf,
    entries: HashMap<String, CachedApp>,
}

impl DetectedCache {
    /// Load the cache from the configuration directory, dropping entries
    /// last seen more than a week ago.
    pub fn load(config_dir: &Path) -> Self {
        let path = config_dir.join(CACHE_FILE);
        let mut entries: HashMap<String, CachedApp> = std::fs::read_to_string(&path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();

        let now = now_secs();
        let before = entries.len();
        entries.retain(|_, entry| now.saturating_sub(entry.3) <= MAX_CACHE_AGE_SECS);
        if entries.len() < before {
            debug!(purged = before - entries.len(), "purged outdated cache entries");
        }
        Self { path, entries }
    }

    pub fn get(&self, process_path: &str) -> Option<&CachedApp> {
        self.entries.get(process_path)
    }

    /// Record a lookup result (including negative results).
    pub fn insert(
        &mut self,
        process_path: &str,
        app_id: Option<String>,
        app_name: Option<String>,
        catalog_path: Option<String>,
    ) {
        self.entries.insert(
            process_path.to_string(),
            CachedApp(app_id, app_name, catalog_path, now_secs()),
        );
    }

    /// Refresh the last-seen time of a known process path.
    pub fn touch(&mut self, process_path: &str) -> bool {
        match self.entries.get_mut(process_path) {
            Some(entry) => {
                entry.3 = now_secs();
                true
            }
            None => false,
        }
    }

    /// All positively identified games: `(app_id, app_name)` pairs.
    pub fn detected(&self) -> Vec<(String, String)> {
        self.entries
            .values()
            .filter_map(|entry| Some((entry.0.clone()?, entry.1.clone().unwrap_or_default())))
            .collect()
    }

    /// Find a cached game by its application id.
    pub fn find_by_app_id(&self, app_id: &str) -> Option<&CachedApp> {
        self.entries
            .values()
            .find(|entry| entry.app_id() == Some(app_id))
    }

    /// Write the cache back to disk.
    pub fn save(&self) {
        if let Some(parent) = self.path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match serde_json::to_string_pretty(&self.entries) {
            Ok(raw) => {
                if let Err(e) = std::fs::write(&self.path, raw) {
                    warn!(error = %e, "failed to save detected-games cache");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize detected-games cache"),
        }
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_and_touch() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = DetectedCache::load(dir.path());
        cache.insert(
            "/games/foo/foo.exe",
            Some("123".to_string()),
            Some("Foo".to_string()),
            Some("foo.exe".to_string()),
        );
        cache.insert("/usr/bin/htop", None, None, None);
        cache.save();

        let reloaded = DetectedCache::load(dir.path());
        let hit = reloaded.get("/games/foo/foo.exe").unwrap();
        assert_eq!(hit.app_id(), Some("123"));
        assert_eq!(hit.app_name(), Some("Foo"));
        // Negative entries survive too.
        assert!(reloaded.get("/usr/bin/htop").unwrap().app_id().is_none());
        assert_eq!(reloaded.detected(), vec![("123".to_string(), "Foo".to_string())]);
    }

    #[test]
    fn test_outdated_entries_purged_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let stale = now_secs() - MAX_CACHE_AGE_SECS - 60;
        let raw = format!(
            r#"{{"/old/game": ["1", "Old", "/old", {stale}], "/new/game": ["2", "New", "/new", {}]}}"#,
            now_secs()
        );
        std::fs::write(dir.path().join(CACHE_FILE), raw).unwrap();

        let cache = DetectedCache::load(dir.path());
        assert!(cache.get("/old/game").is_none());
        assert!(cache.get("/new/game").is_some());
    }

    #[test]
    fn test_find_by_app_id() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = DetectedCache::load(dir.path());
        cache.insert("/a", Some("1".to_string()), Some("A".to_string()), None);
        assert_eq!(cache.find_by_app_id("1").unwrap().app_name(), Some("A"));
        assert!(cache.find_by_app_id("2").is_none());
    }

    #[test]
    fn test_corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CACHE_FILE), "not json").unwrap();
        let cache = DetectedCache::load(dir.path());
        assert!(cache.detected().is_empty());
    }
}
