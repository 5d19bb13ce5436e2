use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, info, warn};

use crate::error::{ConfigError, Result};
use crate::memory::MemoryConfigStore;
use crate::store::ConfigSnapshot;

/// Parse a JSON table snapshot (`config_db.json` layout).
pub fn load_config_file(path: &Path) -> Result<ConfigSnapshot> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Default settle time between a file change and the reload it triggers.
pub const DEFAULT_RELOAD_DELAY: Duration = Duration::from_millis(100);

enum WatchMsg {
    Fs(notify::Result<Event>),
    Stop,
}

/// Keeps a [`MemoryConfigStore`] in step with a JSON file.
///
/// The file's directory is watched, so both in-place writes and an editor's
/// write-then-rename are seen. Every change is applied with
/// [`MemoryConfigStore::apply_snapshot`], so subscribers see one event per
/// changed entry. A file that fails to parse leaves the store untouched.
pub struct ConfigFileWatcher {
    path: PathBuf,
    watcher: Option<RecommendedWatcher>,
    tx: mpsc::Sender<WatchMsg>,
    handle: Option<JoinHandle<()>>,
}

impl ConfigFileWatcher {
    /// Load `path` into `store` and reload it on every change, once writes
    /// have been quiet for `delay`.
    pub fn spawn(path: PathBuf, store: MemoryConfigStore, delay: Duration) -> Result<Self> {
        let snapshot = load_config_file(&path)?;
        store.apply_snapshot(snapshot);
        info!(path = %path.display(), "configuration loaded");

        let (tx, rx) = mpsc::channel::<WatchMsg>();
        let fs_tx = tx.clone();
        let mut watcher = notify::recommended_watcher(move |event: notify::Result<Event>| {
            let _ = fs_tx.send(WatchMsg::Fs(event));
        })?;
        watcher.watch(watch_dir(&path), RecursiveMode::NonRecursive)?;

        let watched = path.clone();
        let handle = std::thread::Builder::new()
            .name("config-watch".to_string())
            .spawn(move || watch_loop(&rx, &watched, &store, delay))
            .map_err(ConfigError::Watcher)?;

        Ok(Self {
            path,
            watcher: Some(watcher),
            tx,
            handle: Some(handle),
        })
    }

    /// Watched file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stop watching and wait for the watcher thread to exit.
    pub fn stop(&mut self) {
        self.watcher.take();
        let _ = self.tx.send(WatchMsg::Stop);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("configuration watcher panicked");
            }
            debug!(path = %self.path.display(), "configuration watcher stopped");
        }
    }
}

impl Drop for ConfigFileWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn watch_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    }
}

fn touches(event: &Event, path: &Path) -> bool {
    !matches!(event.kind, EventKind::Access(_))
        && event.paths.iter().any(|p| p.file_name() == path.file_name())
}

fn watch_loop(
    rx: &mpsc::Receiver<WatchMsg>,
    path: &Path,
    store: &MemoryConfigStore,
    delay: Duration,
) {
    loop {
        match rx.recv() {
            Ok(WatchMsg::Fs(Ok(event))) if touches(&event, path) => {}
            Ok(WatchMsg::Fs(Ok(_))) => continue,
            Ok(WatchMsg::Fs(Err(err))) => {
                warn!(error = %err, "configuration watch error");
                continue;
            }
            Ok(WatchMsg::Stop) | Err(_) => return,
        }

        // Coalesce the rest of a burst (truncate, write, rename) into one reload.
        let settle = Instant::now() + delay;
        loop {
            match rx.recv_timeout(settle.saturating_duration_since(Instant::now())) {
                Ok(WatchMsg::Fs(_)) => continue,
                Err(RecvTimeoutError::Timeout) => break,
                Ok(WatchMsg::Stop) | Err(RecvTimeoutError::Disconnected) => return,
            }
        }

        match load_config_file(path) {
            Ok(snapshot) => {
                let changes = store.apply_snapshot(snapshot);
                info!(path = %path.display(), changes, "configuration reloaded");
            }
            Err(err) => warn!(error = %err, "keeping previous configuration"),
        }
    }
}
