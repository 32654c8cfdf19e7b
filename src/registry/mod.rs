//! External loadable registry.
//!
//! A concurrent cache of externally-configured objects with two
//! provenances: declared in config files on disk, or added through the
//! catalog. A single background thread re-scans config files, retries
//! failed constructions with exponential backoff, and refreshes healthy
//! objects inside their lifetime window.

pub mod config;
pub mod loadable;

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime};

use parking_lot::{Condvar, Mutex};
use rand::Rng;
use tracing::{debug, warn};

pub use config::{Config, ConfigRepository, FileConfigRepository};
pub use loadable::{Lifetime, Loadable};

use crate::error::{CinderError, Result};

/// Timing knobs for the background refresh cycle.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct UpdateSettings {
    /// How often the background thread wakes, in seconds
    pub check_period_sec: u64,
    /// First retry delay after a failed construction, in seconds
    pub backoff_initial_sec: u64,
    /// Retry delay ceiling, in seconds
    pub backoff_max_sec: u64,
}

impl Default for UpdateSettings {
    fn default() -> Self {
        Self {
            check_period_sec: 5,
            backoff_initial_sec: 5,
            backoff_max_sec: 10 * 60,
        }
    }
}

/// Keys the registry looks for in scanned config files.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct ConfigSettings {
    /// Top-level node name declaring one object (e.g. `"dictionary"`)
    pub external_config: String,
    /// Child key holding the object's name (e.g. `"name"`)
    pub external_name: String,
    /// Main-config key listing the paths to scan
    pub path_setting_name: String,
}

/// Where a registry entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    File,
    Catalog,
}

/// Factory turning a named config subtree into a loadable object.
pub type CreateLoadable =
    dyn Fn(&str, &Config, &str) -> Result<Arc<dyn Loadable>> + Send + Sync;

struct LoadableInfo {
    loadable: Option<Arc<dyn Loadable>>,
    #[allow(dead_code)]
    source: Provenance,
    /// Config path for file entries, database name for catalog entries
    origin: String,
    error: Option<Arc<CinderError>>,
}

struct FailedLoadableInfo {
    /// Snapshot of the defining config, replayed on retry
    config: Config,
    key: String,
    next_attempt: Instant,
    error_count: u32,
}

#[derive(Default)]
struct ReloadState {
    failed: HashMap<String, FailedLoadableInfo>,
    /// `None` marks a non-updateable object
    update_times: HashMap<String, Option<Instant>>,
    last_modification_times: HashMap<PathBuf, SystemTime>,
    defined_in_config: HashMap<PathBuf, HashSet<String>>,
}

struct DestroyEvent {
    signaled: Mutex<bool>,
    condvar: Condvar,
}

impl DestroyEvent {
    fn new() -> Self {
        Self {
            signaled: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    fn set(&self) {
        *self.signaled.lock() = true;
        self.condvar.notify_all();
    }

    /// Wait up to `timeout`; returns true once the event is set.
    fn wait_for(&self, timeout: Duration) -> bool {
        let mut signaled = self.signaled.lock();
        if *signaled {
            return true;
        }
        self.condvar.wait_for(&mut signaled, timeout);
        *signaled
    }
}

struct RegistryInner {
    config_main: Config,
    update_settings: UpdateSettings,
    config_settings: ConfigSettings,
    config_repository: Box<dyn ConfigRepository>,
    /// What the registry manages, for log and error messages
    object_kind: String,
    create: Box<CreateLoadable>,

    from_files: Mutex<HashMap<String, LoadableInfo>>,
    from_catalog: Mutex<HashMap<String, LoadableInfo>>,
    /// Serializes reload cycles and guards the bookkeeping state
    all_state: Mutex<ReloadState>,
    destroy: DestroyEvent,
}

/// Registry of named loadable objects with background reload.
pub struct LoadableRegistry {
    inner: Arc<RegistryInner>,
    reloading_thread: Mutex<Option<JoinHandle<()>>>,
    is_initialized: AtomicBool,
}

impl LoadableRegistry {
    /// Build a registry. Nothing loads until [`LoadableRegistry::init`].
    pub fn new(
        config_main: Config,
        update_settings: UpdateSettings,
        config_settings: ConfigSettings,
        config_repository: Box<dyn ConfigRepository>,
        object_kind: impl Into<String>,
        create: Box<CreateLoadable>,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                config_main,
                update_settings,
                config_settings,
                config_repository,
                object_kind: object_kind.into(),
                create,
                from_files: Mutex::new(HashMap::new()),
                from_catalog: Mutex::new(HashMap::new()),
                all_state: Mutex::new(ReloadState::default()),
                destroy: DestroyEvent::new(),
            }),
            reloading_thread: Mutex::new(None),
            is_initialized: AtomicBool::new(false),
        }
    }

    /// Run one synchronous reload cycle and start the background thread.
    pub fn init(&self, throw_on_error: bool) -> Result<()> {
        if self.is_initialized.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.inner.reload_and_update(throw_on_error)?;

        let inner = Arc::downgrade(&self.inner);
        let check_period = Duration::from_secs(self.inner.update_settings.check_period_sec.max(1));
        let thread = std::thread::Builder::new()
            .name("registry-reload".to_string())
            .spawn(move || loop {
                let Some(registry) = inner.upgrade() else {
                    return;
                };
                if registry.destroy.wait_for(check_period) {
                    return;
                }
                if let Err(e) = registry.reload_and_update(false) {
                    warn!(error = %e, "background reload cycle failed");
                }
            })
            .map_err(|e| CinderError::internal(format!("failed to spawn reload thread: {}", e)))?;

        *self.reloading_thread.lock() = Some(thread);
        Ok(())
    }

    /// Signal the background thread and wait for it to exit.
    pub fn shutdown(&self) {
        self.inner.destroy.set();
        if let Some(thread) = self.reloading_thread.lock().take() {
            let _ = thread.join();
        }
    }

    /// Force a re-parse of every configured file.
    pub fn reload(&self) -> Result<()> {
        self.inner.reload_from_config_files(true, true, None)
    }

    /// Force-reload one named object; errors if it is still missing after.
    pub fn reload_single(&self, name: &str) -> Result<()> {
        self.inner.reload_from_config_files(true, true, Some(name))?;

        if !self.inner.from_files.lock().contains_key(name) {
            return Err(CinderError::config(format!(
                "Failed to load {} '{}' during the reload process",
                self.inner.object_kind, name
            )));
        }
        Ok(())
    }

    /// Register a catalog-declared object under `database.name`.
    pub fn add_from_catalog(
        &self,
        database: &str,
        name: &str,
        loadable: Arc<dyn Loadable>,
    ) -> Result<()> {
        let full_name = format!("{}.{}", database, name);
        debug!(object = %full_name, "adding catalog-declared object");

        let mut state = self.inner.all_state.lock();

        if self.inner.from_files.lock().contains_key(&full_name) {
            return Err(CinderError::already_exists(format!(
                "Can't add {} '{}': already declared in a config file",
                self.inner.object_kind, full_name
            )));
        }

        let mut catalog_map = self.inner.from_catalog.lock();
        if catalog_map.contains_key(&full_name) {
            return Err(CinderError::already_exists(format!(
                "Can't add {} '{}': already exists",
                self.inner.object_kind, full_name
            )));
        }

        state
            .update_times
            .insert(full_name.clone(), self.inner.next_update_time(&loadable));
        catalog_map.insert(
            full_name,
            LoadableInfo {
                loadable: Some(loadable),
                source: Provenance::Catalog,
                origin: database.to_string(),
                error: None,
            },
        );
        Ok(())
    }

    /// Remove a catalog-declared object.
    pub fn remove_from_catalog(&self, database: &str, name: &str) -> Result<()> {
        let full_name = format!("{}.{}", database, name);
        let mut catalog_map = self.inner.from_catalog.lock();
        if catalog_map.remove(&full_name).is_none() {
            return Err(CinderError::catalog(format!(
                "Can't remove {} '{}': it is missing",
                self.inner.object_kind, full_name
            )));
        }
        Ok(())
    }

    /// Get a file-declared object, failing on unknown names and entries
    /// holding a captured error.
    pub fn get(&self, name: &str) -> Result<Arc<dyn Loadable>> {
        self.inner
            .get_impl(&self.inner.from_files, name, true)?
            .ok_or_else(|| {
                CinderError::internal(format!(
                    "{} '{}' is not loaded",
                    self.inner.object_kind, name
                ))
            })
    }

    /// Get a file-declared object, or `None` when unknown or failed.
    pub fn try_get(&self, name: &str) -> Option<Arc<dyn Loadable>> {
        self.inner
            .get_impl(&self.inner.from_files, name, false)
            .ok()
            .flatten()
    }

    /// Get a catalog-declared object by database and name.
    pub fn get_from_catalog(&self, database: &str, name: &str) -> Result<Arc<dyn Loadable>> {
        let full_name = format!("{}.{}", database, name);
        self.inner
            .get_impl(&self.inner.from_catalog, &full_name, true)?
            .ok_or_else(|| {
                CinderError::internal(format!(
                    "{} '{}' is not loaded",
                    self.inner.object_kind, full_name
                ))
            })
    }

    /// Get a catalog-declared object, or `None` when unknown or failed.
    pub fn try_get_from_catalog(&self, database: &str, name: &str) -> Option<Arc<dyn Loadable>> {
        if database.is_empty() || name.is_empty() {
            return None;
        }
        let full_name = format!("{}.{}", database, name);
        self.inner
            .get_impl(&self.inner.from_catalog, &full_name, false)
            .ok()
            .flatten()
    }

    /// Failure-set diagnostics for one name: `(error_count, next_attempt)`.
    pub fn failure_info(&self, name: &str) -> Option<(u32, Instant)> {
        let state = self.inner.all_state.lock();
        state
            .failed
            .get(name)
            .map(|info| (info.error_count, info.next_attempt))
    }

    /// Names of all live file-declared objects.
    pub fn object_names(&self) -> Vec<String> {
        self.inner.from_files.lock().keys().cloned().collect()
    }

    /// Run one reload cycle on the caller's thread.
    pub fn reload_and_update(&self, throw_on_error: bool) -> Result<()> {
        self.inner.reload_and_update(throw_on_error)
    }
}

impl Drop for LoadableRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for LoadableRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadableRegistry")
            .field("object_kind", &self.inner.object_kind)
            .finish()
    }
}

impl RegistryInner {
    fn get_impl(
        &self,
        map: &Mutex<HashMap<String, LoadableInfo>>,
        name: &str,
        throw_on_error: bool,
    ) -> Result<Option<Arc<dyn Loadable>>> {
        let map = map.lock();
        let Some(info) = map.get(name) else {
            if throw_on_error {
                return Err(CinderError::catalog(format!(
                    "No such {}: {}",
                    self.object_kind, name
                )));
            }
            return Ok(None);
        };

        if let Some(error) = &info.error {
            if throw_on_error {
                return Err(CinderError::from_stored(error));
            }
            return Ok(None);
        }

        match &info.loadable {
            Some(loadable) => Ok(Some(loadable.clone())),
            None => {
                if throw_on_error {
                    Err(CinderError::internal(format!(
                        "{} '{}' is not loaded",
                        self.object_kind, name
                    )))
                } else {
                    Ok(None)
                }
            }
        }
    }

    /// One full cycle: re-scan files, retry the failure set, update
    /// healthy objects.
    fn reload_and_update(&self, throw_on_error: bool) -> Result<()> {
        self.reload_from_config_files(throw_on_error, false, None)?;

        {
            let mut state = self.all_state.lock();

            let now = Instant::now();
            let due: Vec<String> = state
                .failed
                .iter()
                .filter(|(_, info)| now >= info.next_attempt)
                .map(|(name, _)| name.clone())
                .collect();

            for name in due {
                let Some(info) = state.failed.get(&name) else {
                    continue;
                };
                let result = (self.create)(&name, &info.config, &info.key);
                match result {
                    Ok(loadable) => {
                        let next_update = self.next_update_time(&loadable);
                        {
                            let mut files = self.from_files.lock();
                            if let Some(entry) = files.get_mut(&name) {
                                entry.loadable = Some(loadable);
                                entry.error = None;
                            }
                        }
                        state.update_times.insert(name.clone(), next_update);
                        state.failed.remove(&name);
                        debug!(object = %name, "failed object recovered");
                    }
                    Err(e) => {
                        let mut retries = 0;
                        if let Some(info) = state.failed.get_mut(&name) {
                            let delay = self.backoff_delay(info.error_count);
                            info.next_attempt = Instant::now() + delay;
                            info.error_count += 1;
                            retries = info.error_count;
                        }

                        let shared = Arc::new(e);
                        if let Some(entry) = self.from_files.lock().get_mut(&name) {
                            entry.error = Some(shared.clone());
                        }
                        warn!(
                            object = %name,
                            retries,
                            "failed reloading {} '{}': {}",
                            self.object_kind,
                            name,
                            shared
                        );
                        if throw_on_error {
                            return Err(CinderError::from_stored(&shared));
                        }
                    }
                }
            }

            self.update_objects(&self.from_files, &mut state, throw_on_error)?;
            self.update_objects(&self.from_catalog, &mut state, throw_on_error)?;
        }

        Ok(())
    }

    /// Update healthy objects whose jittered update time has passed.
    ///
    /// New versions are built without holding the map lock; installation
    /// re-checks that the entry still exists.
    fn update_objects(
        &self,
        map: &Mutex<HashMap<String, LoadableInfo>>,
        state: &mut ReloadState,
        throw_on_error: bool,
    ) -> Result<()> {
        let mut to_update: Vec<(String, Arc<dyn Loadable>)> = Vec::new();
        {
            let map = map.lock();
            for (name, info) in map.iter() {
                let Some(loadable) = &info.loadable else {
                    continue;
                };
                if self.should_update(name, loadable, state) {
                    to_update.push((name.clone(), loadable.clone()));
                }
            }
        }

        for (name, current) in to_update {
            debug!(object = %name, "updating {}", self.object_kind);
            let result = current.clone_loadable();

            let mut map = map.lock();
            let Some(entry) = map.get_mut(&name) else {
                // Removed concurrently; nothing to install.
                continue;
            };
            state
                .update_times
                .insert(name.clone(), self.next_update_time(&current));

            match result {
                Ok(new_version) => {
                    entry.loadable = Some(new_version);
                    entry.error = None;
                }
                Err(e) => {
                    let shared = Arc::new(e);
                    entry.error = Some(shared.clone());
                    warn!(
                        object = %name,
                        "cannot update {} '{}', leaving old version: {}",
                        self.object_kind,
                        name,
                        shared
                    );
                    if throw_on_error {
                        return Err(CinderError::from_stored(&shared));
                    }
                }
            }
        }
        Ok(())
    }

    fn should_update(&self, name: &str, loadable: &Arc<dyn Loadable>, state: &ReloadState) -> bool {
        let lifetime = loadable.lifetime();
        if lifetime.is_zero() {
            return false;
        }
        if !loadable.supports_updates() {
            return false;
        }
        match state.update_times.get(name) {
            Some(None) => return false,
            Some(Some(update_time)) if Instant::now() < *update_time => return false,
            _ => {}
        }
        loadable.is_modified()
    }

    /// Re-scan configured paths, then drop file entries whose names no
    /// longer appear in any scanned config.
    fn reload_from_config_files(
        &self,
        throw_on_error: bool,
        force_reload: bool,
        only_name: Option<&str>,
    ) -> Result<()> {
        let paths = self
            .config_repository
            .list(&self.config_main, &self.config_settings.path_setting_name);

        for path in &paths {
            if let Err(e) = self.reload_from_config_file(path, force_reload, only_name) {
                warn!(path = %path.display(), "config reload failed: {}", e);
                if throw_on_error {
                    return Err(e);
                }
            }
        }

        let state = self.all_state.lock();
        let mut files = self.from_files.lock();
        files.retain(|name, info| {
            state
                .defined_in_config
                .get(Path::new(&info.origin))
                .map_or(false, |defined| defined.contains(name))
        });

        Ok(())
    }

    fn reload_from_config_file(
        &self,
        path: &Path,
        force_reload: bool,
        only_name: Option<&str>,
    ) -> Result<()> {
        if path.as_os_str().is_empty() || !self.config_repository.exists(path) {
            warn!(path = %path.display(), "config file does not exist");
            return Ok(());
        }

        let mut state = self.all_state.lock();

        let last_modified = self.config_repository.last_modification_time(path)?;
        let recorded = state
            .last_modification_times
            .entry(path.to_path_buf())
            .or_insert(SystemTime::UNIX_EPOCH);
        if !force_reload && last_modified <= *recorded {
            return Ok(());
        }

        let root_dir = self
            .config_main
            .get_string("path")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        let loaded = self.config_repository.load(path, &root_dir)?;

        state
            .defined_in_config
            .entry(path.to_path_buf())
            .or_default()
            .clear();

        // A single-object reload must not advance the file's recorded
        // time: other objects in it still need a future scan.
        if only_name.is_none() {
            state
                .last_modification_times
                .insert(path.to_path_buf(), last_modified);
        }

        let mut first_error: Option<CinderError> = None;

        for key in loaded.keys("") {
            if !key.starts_with(&self.config_settings.external_config) {
                if !key.starts_with("comment") && !key.starts_with("include_from") {
                    warn!(
                        path = %path.display(),
                        node = %key,
                        expected = %self.config_settings.external_config,
                        "unknown node in config file"
                    );
                }
                continue;
            }

            let name = loaded
                .get_string(&format!("{}.{}", key, self.config_settings.external_name))
                .unwrap_or_default();
            if name.is_empty() {
                warn!(path = %path.display(), "{} name cannot be empty", self.config_settings.external_name);
                continue;
            }

            state
                .defined_in_config
                .entry(path.to_path_buf())
                .or_default()
                .insert(name.clone());

            if only_name.map_or(false, |only| only != name) {
                continue;
            }

            if let Err(e) = self.load_object_from_config(&mut state, path, &loaded, &key, &name) {
                warn!(
                    object = %name,
                    path = %path.display(),
                    "cannot create {} '{}': {}",
                    self.object_kind,
                    name,
                    e
                );
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn load_object_from_config(
        &self,
        state: &mut ReloadState,
        path: &Path,
        loaded: &Config,
        key: &str,
        name: &str,
    ) -> Result<()> {
        {
            let files = self.from_files.lock();
            if let Some(existing) = files.get(name) {
                if existing.origin != path.display().to_string() {
                    return Err(CinderError::already_exists(format!(
                        "{} '{}' from file {} already declared in file {}",
                        self.object_kind,
                        name,
                        path.display(),
                        existing.origin
                    )));
                }
            }
            if self.from_catalog.lock().contains_key(name) {
                return Err(CinderError::already_exists(format!(
                    "{} '{}' from file {} already declared in the catalog",
                    self.object_kind,
                    name,
                    path.display()
                )));
            }
        }

        match (self.create)(name, loaded, key) {
            Ok(loadable) => {
                if loadable.supports_updates() {
                    state
                        .update_times
                        .insert(name.to_string(), self.next_update_time(&loadable));
                }

                let mut files = self.from_files.lock();
                match files.entry(name.to_string()) {
                    Entry::Occupied(mut occupied) => {
                        let entry = occupied.get_mut();
                        entry.loadable = Some(loadable);
                        entry.error = None;
                        state.failed.remove(name);
                    }
                    Entry::Vacant(vacant) => {
                        vacant.insert(LoadableInfo {
                            loadable: Some(loadable),
                            source: Provenance::File,
                            origin: path.display().to_string(),
                            error: None,
                        });
                    }
                }
                Ok(())
            }
            Err(e) => {
                let shared = Arc::new(e);

                let delay = Duration::from_secs(self.update_settings.backoff_initial_sec);
                state.failed.insert(
                    name.to_string(),
                    FailedLoadableInfo {
                        config: loaded.clone(),
                        key: key.to_string(),
                        next_attempt: Instant::now() + delay,
                        error_count: 0,
                    },
                );

                // The entry is installed even though construction failed,
                // so accessors report the real failure instead of an
                // unknown name.
                let mut files = self.from_files.lock();
                match files.entry(name.to_string()) {
                    Entry::Occupied(mut occupied) => {
                        occupied.get_mut().error = Some(shared.clone());
                    }
                    Entry::Vacant(vacant) => {
                        vacant.insert(LoadableInfo {
                            loadable: None,
                            source: Provenance::File,
                            origin: path.display().to_string(),
                            error: Some(shared.clone()),
                        });
                    }
                }

                Err(CinderError::from_stored(&shared))
            }
        }
    }

    /// `min(backoff_max, backoff_initial + Uniform[0, 2^error_count])`.
    fn backoff_delay(&self, error_count: u32) -> Duration {
        let ceiling = 2u64.saturating_pow(error_count.min(32));
        let jitter = rand::thread_rng().gen_range(0..=ceiling);
        let seconds = (self.update_settings.backoff_initial_sec + jitter)
            .min(self.update_settings.backoff_max_sec);
        Duration::from_secs(seconds)
    }

    /// Next update drawn uniformly from the lifetime window, or `None`
    /// for a non-updateable object.
    fn next_update_time(&self, loadable: &Arc<dyn Loadable>) -> Option<Instant> {
        let lifetime = loadable.lifetime();
        if lifetime.max_sec < lifetime.min_sec {
            return None;
        }
        let seconds = rand::thread_rng().gen_range(lifetime.min_sec..=lifetime.max_sec);
        Some(Instant::now() + Duration::from_secs(seconds))
    }
}
