//! File system watcher flagging plugin collections that need a rescan.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::{Mutex, RwLock};

use crate::context::Context;
use crate::error::{Error, Result};

/// Configuration for the collection watcher.
#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// Minimum delay between two notifications for one collection.
    pub debounce: Duration,
    /// Whether to watch collection subdirectories.
    pub recursive: bool,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(500),
            recursive: true,
        }
    }
}

impl WatchConfig {
    /// Create a new watch configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the debounce duration.
    pub fn with_debounce(mut self, duration: Duration) -> Self {
        self.debounce = duration;
        self
    }

    /// Set recursive watching.
    pub fn with_recursive(mut self, recursive: bool) -> Self {
        self.recursive = recursive;
        self
    }

    fn mode(&self) -> RecursiveMode {
        if self.recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        }
    }
}

type ChangeHandler = Box<dyn Fn(&Path) + Send + Sync>;

#[derive(Default)]
struct WatchState {
    last_events: HashMap<PathBuf, Instant>,
    changed: BTreeSet<PathBuf>,
    handlers: Vec<ChangeHandler>,
}

impl WatchState {
    /// Mark a collection as changed. Returns false when the change falls
    /// inside the debounce window of the previous one.
    fn record(&mut self, collection: &Path, now: Instant, debounce: Duration) -> bool {
        self.changed.insert(collection.to_path_buf());

        if let Some(last) = self.last_events.get(collection) {
            if now.duration_since(*last) < debounce {
                return false;
            }
        }
        self.last_events.insert(collection.to_path_buf(), now);
        true
    }
}

/// Watches plugin collections and remembers which ones changed.
///
/// The watcher never touches a context by itself; the host drains
/// [`CollectionWatcher::take_changed`] and calls
/// [`Context::scan_plugins`] from its own loop.
pub struct CollectionWatcher {
    config: WatchConfig,
    watcher: Option<RecommendedWatcher>,
    collections: Arc<RwLock<Vec<PathBuf>>>,
    state: Arc<Mutex<WatchState>>,
    running: Arc<AtomicBool>,
}

impl CollectionWatcher {
    /// Create a new collection watcher.
    pub fn new(config: WatchConfig) -> Result<Self> {
        Ok(Self {
            config,
            watcher: None,
            collections: Arc::new(RwLock::new(Vec::new())),
            state: Arc::new(Mutex::new(WatchState::default())),
            running: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Create with default configuration.
    pub fn default_config() -> Result<Self> {
        Self::new(WatchConfig::default())
    }

    /// Get the watcher configuration.
    pub fn config(&self) -> &WatchConfig {
        &self.config
    }

    /// Check if the watcher is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Add a handler called with the collection that changed.
    pub fn on_change<F>(&self, handler: F)
    where
        F: Fn(&Path) + Send + Sync + 'static,
    {
        self.state.lock().handlers.push(Box::new(handler));
    }

    /// Watch every collection registered with `context`.
    pub fn watch_context(&mut self, context: &Context) -> Result<()> {
        for collection in context.collections() {
            self.watch(collection)?;
        }
        Ok(())
    }

    /// Start watching.
    pub fn start(&mut self) -> Result<()> {
        if self.running.load(Ordering::Relaxed) {
            return Ok(());
        }

        let state = self.state.clone();
        let collections = self.collections.clone();
        let running = self.running.clone();
        let debounce = self.config.debounce;

        let watcher = RecommendedWatcher::new(
            move |res: std::result::Result<Event, notify::Error>| {
                if !running.load(Ordering::Relaxed) {
                    return;
                }
                match res {
                    Ok(event) => Self::handle_event(&state, &collections, debounce, event),
                    Err(e) => tracing::warn!("Collection watch error: {}", e),
                }
            },
            Config::default(),
        )
        .map_err(|e| Error::Watch(e.to_string()))?;

        self.watcher = Some(watcher);
        self.running.store(true, Ordering::Relaxed);

        let paths = self.collections.read().clone();
        for path in &paths {
            self.watch_path_internal(path)?;
        }

        tracing::info!("Collection watcher started on {} collection(s)", paths.len());
        Ok(())
    }

    /// Stop watching.
    pub fn stop(&mut self) {
        if self.running.swap(false, Ordering::Relaxed) {
            tracing::info!("Collection watcher stopped");
        }
        self.watcher = None;
    }

    /// Watch a collection directory.
    pub fn watch(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref().to_path_buf();

        {
            let mut paths = self.collections.write();
            if paths.contains(&path) {
                return Ok(());
            }
            paths.push(path.clone());
        }

        if self.running.load(Ordering::Relaxed) {
            self.watch_path_internal(&path)?;
        }

        Ok(())
    }

    /// Stop watching a collection directory.
    pub fn unwatch(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        self.collections.write().retain(|p| p != path);
        self.state.lock().changed.remove(path);

        if let Some(ref mut watcher) = self.watcher {
            if let Err(e) = watcher.unwatch(path) {
                tracing::debug!("Unwatch {}: {}", path.display(), e);
            }
        }

        Ok(())
    }

    /// Watched collections.
    pub fn watched_paths(&self) -> Vec<PathBuf> {
        self.collections.read().clone()
    }

    /// Drain the collections changed since the previous call.
    pub fn take_changed(&self) -> Vec<PathBuf> {
        std::mem::take(&mut self.state.lock().changed)
            .into_iter()
            .collect()
    }

    fn watch_path_internal(&mut self, path: &Path) -> Result<()> {
        let mode = self.config.mode();
        let Some(ref mut watcher) = self.watcher else {
            return Ok(());
        };

        if !path.is_dir() {
            tracing::warn!("Not watching missing collection {}", path.display());
            return Ok(());
        }

        watcher
            .watch(path, mode)
            .map_err(|e| Error::Watch(e.to_string()))?;
        tracing::debug!("Watching collection {}", path.display());
        Ok(())
    }

    fn owning_collection(collections: &[PathBuf], path: &Path) -> Option<PathBuf> {
        collections
            .iter()
            .filter(|c| path.starts_with(c))
            .max_by_key(|c| c.components().count())
            .cloned()
    }

    fn handle_event(
        state: &Mutex<WatchState>,
        collections: &RwLock<Vec<PathBuf>>,
        debounce: Duration,
        event: Event,
    ) {
        if !matches!(
            event.kind,
            EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
        ) {
            return;
        }

        let owners: BTreeSet<PathBuf> = {
            let collections = collections.read();
            event
                .paths
                .iter()
                .filter_map(|p| Self::owning_collection(&collections, p))
                .collect()
        };

        let now = Instant::now();
        let mut state = state.lock();
        for collection in owners {
            if state.record(&collection, now, debounce) {
                tracing::debug!("Plugin collection changed: {}", collection.display());
                for handler in &state.handlers {
                    handler(&collection);
                }
            }
        }
    }
}

impl std::fmt::Debug for CollectionWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectionWatcher")
            .field("config", &self.config)
            .field("running", &self.is_running())
            .field("collections", &self.collections.read().len())
            .finish()
    }
}

impl Drop for CollectionWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}
