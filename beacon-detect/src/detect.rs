//! Detection service.
//!
//! Long-running loop: refresh the catalog on startup, then every few seconds
//! diff the process table, match new paths against the catalog (through the
//! persisted cache), and maintain one playing activity per recognized game.
//! Session open/close also reports to the activity-session endpoint.

use crate::{cache::DetectedCache, current_os_code, ProcessScanner};
use beacon_gateway::Gateway;
use beacon_http::{CatalogFetch, CatalogStore, RestClient};
use beacon_model::{Activity, ActivityTable};
use parking_lot::{Mutex, RwLock};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::sleep;
use tracing::{error, info, warn};

/// Seconds between scanner passes.
const SCAN_INTERVAL: Duration = Duration::from_secs(5);

/// Game-detection service.
pub struct GameDetection {
    gateway: Arc<Gateway>,
    rest: Arc<RestClient>,
    activities: Arc<ActivityTable>,
    blacklist: RwLock<Vec<String>>,
    scanner: Mutex<ProcessScanner>,
    cache: Mutex<DetectedCache>,
    config_dir: PathBuf,
    download_delay_days: u64,
    run: AtomicBool,
}

impl GameDetection {
    pub fn new(
        gateway: Arc<Gateway>,
        rest: Arc<RestClient>,
        blacklist: Vec<String>,
        config_dir: &Path,
        download_delay_days: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            gateway,
            rest,
            activities: Arc::new(ActivityTable::new()),
            blacklist: RwLock::new(blacklist),
            scanner: Mutex::new(ProcessScanner::new()),
            cache: Mutex::new(DetectedCache::load(config_dir)),
            config_dir: config_dir.to_path_buf(),
            download_delay_days,
            run: AtomicBool::new(true),
        })
    }

    /// Changed-only snapshot of the detection activities.
    pub fn take_activities(&self, force: bool) -> Option<Vec<Activity>> {
        self.activities.take(force)
    }

    /// All games known to the cache: `(app_id, app_name)` pairs.
    pub fn detected(&self) -> Vec<(String, String)> {
        self.cache.lock().detected()
    }

    pub fn stop(&self) {
        self.run.store(false, Ordering::SeqCst);
    }

    /// Replace the blacklist. Running blacklisted games are closed out:
    /// their activity is withdrawn and a closed session update is sent.
    pub async fn set_blacklist(&self, blacklist: Vec<String>) {
        *self.blacklist.write() = blacklist.clone();
        self.scanner.lock().reset();

        for app_id in &blacklist {
            if app_id.is_empty() {
                continue;
            }
            if !self.activities.contains(app_id) {
                continue;
            }
            let (app_name, exe_path) = {
                let cache = self.cache.lock();
                match cache.find_by_app_id(app_id) {
                    Some(entry) => (
                        entry.app_name().unwrap_or_default().to_string(),
                        entry.catalog_path().map(str::to_string),
                    ),
                    None => continue,
                }
            };
            self.close_session(app_id, exe_path.as_deref()).await;
            self.activities.remove(app_id);
            info!(app = %app_name, "game removed from activities");
        }
    }

    /// Run the detection loop until stopped. Fatal scanner errors stop this
    /// task without touching the rest of the process.
    pub async fn run(&self) {
        let Some(my_os) = current_os_code() else {
            warn!("game detection is not supported on this platform");
            return;
        };

        let Some(catalog_path) = self.prepare_catalog().await else {
            return;
        };

        // Refresh last-seen times for processes already running, then reset
        // the scanner so the first loop pass reports them as added.
        {
            let mut scanner = self.scanner.lock();
            match scanner.diff() {
                Ok((added, _)) => {
                    let mut cache = self.cache.lock();
                    for path in &added {
                        cache.touch(path);
                    }
                    cache.save();
                }
                Err(e) => {
                    error!(error = %e, "game detection stopped: process enumeration failed");
                    return;
                }
            }
            scanner.reset();
        }

        info!("game detection started");
        while self.run.load(Ordering::SeqCst) {
            let diff = self.scanner.lock().diff();
            let (added, removed) = match diff {
                Ok(diff) => diff,
                Err(e) => {
                    error!(error = %e, "game detection stopped: process enumeration failed");
                    return;
                }
            };

            let mut cache_changed = false;
            for process_path in added {
                if let Some((app_id, app_name)) =
                    self.identify(&process_path, &catalog_path, my_os, &mut cache_changed)
                {
                    if self.is_blacklisted(&app_id) {
                        continue;
                    }
                    let exe_path = self
                        .cache
                        .lock()
                        .get(&process_path)
                        .and_then(|entry| entry.catalog_path().map(str::to_string));
                    self.open_session(&app_id, exe_path.as_deref()).await;
                    self.activities
                        .publish(&app_id, Activity::playing(&app_id, &app_name, now_ms()));
                    info!(app = %app_name, app_id = %app_id, "game added to activities");
                }
            }

            for process_path in removed {
                let Some((app_id, app_name, exe_path)) = ({
                    let cache = self.cache.lock();
                    cache.get(&process_path).and_then(|entry| {
                        Some((
                            entry.app_id()?.to_string(),
                            entry.app_name().unwrap_or_default().to_string(),
                            entry.catalog_path().map(str::to_string),
                        ))
                    })
                }) else {
                    continue;
                };
                if self.is_blacklisted(&app_id) {
                    continue;
                }
                self.close_session(&app_id, exe_path.as_deref()).await;
                self.activities.remove(&app_id);
                info!(app = %app_name, "game removed from activities");
            }

            if cache_changed {
                self.cache.lock().save();
            }
            sleep(SCAN_INTERVAL).await;
        }
    }

    /// Make sure a catalog file exists, downloading or revalidating when the
    /// refresh window has passed. `None` means detection cannot start.
    async fn prepare_catalog(&self) -> Option<PathBuf> {
        let store = CatalogStore::new(&self.config_dir);
        let existing = store.existing();
        if !store.needs_refresh(self.download_delay_days) {
            return existing.map(|file| file.path);
        }

        let etag = existing.as_ref().map(|file| file.etag.clone());
        match store.download(&self.rest, etag.as_deref()).await {
            Ok(CatalogFetch::Downloaded(file)) => Some(file.path),
            Ok(CatalogFetch::NotModified) => existing.map(|file| file.path),
            Err(e) => {
                warn!(error = %e, "could not download the detectable applications catalog");
                None
            }
        }
    }

    /// Resolve a process path to `(app_id, app_name)` via the cache, falling
    /// back to a catalog scan whose result (positive or negative) is cached.
    fn identify(
        &self,
        process_path: &str,
        catalog_path: &Path,
        my_os: u8,
        cache_changed: &mut bool,
    ) -> Option<(String, String)> {
        let mut cache = self.cache.lock();
        if let Some(entry) = cache.get(process_path) {
            return Some((entry.app_id()?.to_string(), entry.app_name()?.to_string()));
        }
        let hit = CatalogStore::find_app(process_path, catalog_path, my_os);
        cache.insert(
            process_path,
            hit.as_ref().map(|hit| hit.app_id.clone()),
            hit.as_ref().map(|hit| hit.app_name.clone()),
            hit.as_ref().map(|hit| hit.exe_path.clone()),
        );
        *cache_changed = true;
        let hit = hit?;
        Some((hit.app_id, hit.app_name))
    }

    fn is_blacklisted(&self, app_id: &str) -> bool {
        self.blacklist.read().iter().any(|entry| entry == app_id)
    }

    async fn open_session(&self, app_id: &str, exe_path: Option<&str>) {
        let session_id = self.gateway.session_id();
        if let Err(e) = self
            .rest
            .send_update_activity_session(app_id, exe_path, false, &session_id)
            .await
        {
            warn!(error = %e, app_id = %app_id, "failed to open activity session");
        }
    }

    async fn close_session(&self, app_id: &str, exe_path: Option<&str>) {
        let session_id = self.gateway.session_id();
        if let Err(e) = self
            .rest
            .send_update_activity_session(app_id, exe_path, true, &session_id)
            .await
        {
            warn!(error = %e, app_id = %app_id, "failed to close activity session");
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
