use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use notify::event::ModifyKind;
use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};

use crate::module::{ModuleId, ScriptModule};
use crate::paths::normalize_path;
use crate::refcount::{Handle, WeakHandle};

struct Registration {
    module: ModuleId,
    target: WeakHandle<ScriptModule>,
    files: Vec<PathBuf>,
}

struct WatchState {
    watcher: RecommendedWatcher,
    rx: Receiver<notify::Result<Event>>,
    registrations: Vec<Registration>,
    directories: HashMap<PathBuf, usize>,
    hashes: HashMap<PathBuf, blake3::Hash>,
}

impl WatchState {
    fn retain_directory(&mut self, dir: &Path) -> Result<()> {
        if let Some(count) = self.directories.get_mut(dir) {
            *count += 1;
            return Ok(());
        }
        self.watcher.watch(dir, RecursiveMode::NonRecursive).with_context(|| format!("watch {}", dir.display()))?;
        self.directories.insert(dir.to_path_buf(), 1);
        Ok(())
    }

    fn release_directory(&mut self, dir: &Path) {
        let Some(count) = self.directories.get_mut(dir) else {
            return;
        };
        *count -= 1;
        if *count == 0 {
            self.directories.remove(dir);
            if let Err(err) = self.watcher.unwatch(dir) {
                tracing::debug!(target: "scripting::watch", dir = %dir.display(), "unwatch failed: {err}");
            }
        }
    }

    fn remove_registration(&mut self, module: ModuleId) {
        let Some(index) = self.registrations.iter().position(|registration| registration.module == module) else {
            return;
        };
        let registration = self.registrations.swap_remove(index);
        for file in &registration.files {
            if let Some(dir) = file.parent() {
                self.release_directory(dir);
            }
            if !self.registrations.iter().any(|other| other.files.contains(file)) {
                self.hashes.remove(file);
            }
        }
    }
}

/// Watches module source files and reloads modules whose content changed.
pub struct ScriptWatcher {
    state: Mutex<WatchState>,
}

impl ScriptWatcher {
    pub fn new(poll_interval: Duration) -> Result<Self> {
        let (tx, rx) = channel();
        let mut watcher = notify::recommended_watcher(move |res| {
            let _ = tx.send(res);
        })?;
        watcher
            .configure(NotifyConfig::default().with_compare_contents(false).with_poll_interval(poll_interval))
            .context("configure script watcher")?;
        let state = WatchState {
            watcher,
            rx,
            registrations: Vec::new(),
            directories: HashMap::new(),
            hashes: HashMap::new(),
        };
        Ok(Self { state: Mutex::new(state) })
    }

    fn lock_state(&self) -> MutexGuard<'_, WatchState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replaces any earlier registration for `module`.
    pub fn watch(&self, module: ModuleId, target: WeakHandle<ScriptModule>, files: &[PathBuf]) -> Result<()> {
        let mut state = self.lock_state();
        state.remove_registration(module);
        let mut watched = Vec::with_capacity(files.len());
        for file in files {
            let file = normalize_path(file);
            if let Some(dir) = file.parent() {
                state.retain_directory(dir)?;
            }
            if let Ok(bytes) = fs::read(&file) {
                state.hashes.insert(file.clone(), blake3::hash(&bytes));
            }
            watched.push(file);
        }
        tracing::debug!(target: "scripting::watch", module = %module, files = watched.len(), "watching module sources");
        state.registrations.push(Registration { module, target, files: watched });
        Ok(())
    }

    pub fn unwatch(&self, module: ModuleId) {
        self.lock_state().remove_registration(module);
    }

    pub fn is_watching(&self, module: ModuleId) -> bool {
        self.lock_state().registrations.iter().any(|registration| registration.module == module)
    }

    pub fn watched_files(&self) -> Vec<PathBuf> {
        let state = self.lock_state();
        let mut files: Vec<PathBuf> =
            state.registrations.iter().flat_map(|registration| registration.files.iter().cloned()).collect();
        files.sort();
        files.dedup();
        files
    }

    /// Drains queued file system events. Returns the number of modules reloaded.
    pub fn poll(&self) -> usize {
        let mut changed = Vec::new();
        {
            let state = self.lock_state();
            let mut backlog: VecDeque<notify::Result<Event>> = VecDeque::new();
            while let Ok(event) = state.rx.try_recv() {
                backlog.push_back(event);
            }
            while let Some(event) = backlog.pop_front() {
                match event {
                    Ok(event) if is_relevant(&event.kind) => changed.extend(event.paths),
                    Ok(_) => {}
                    Err(err) => tracing::warn!(target: "scripting::watch", "script watcher error: {err}"),
                }
            }
        }
        if changed.is_empty() {
            return 0;
        }
        self.handle_changed_paths(&changed)
    }

    /// Reloads every live module that reads one of `paths`, once per module.
    /// Files whose content hash did not change are skipped.
    pub fn handle_changed_paths(&self, paths: &[PathBuf]) -> usize {
        let targets = self.collect_targets(paths);
        let mut reloaded = 0;
        for (file, module) in targets {
            tracing::info!(
                target: "scripting::watch",
                module = %module.name(),
                file = %file.display(),
                "source changed, reloading"
            );
            if module.reload() {
                reloaded += 1;
            }
        }
        reloaded
    }

    fn collect_targets(&self, paths: &[PathBuf]) -> Vec<(PathBuf, Handle<ScriptModule>)> {
        let mut state = self.lock_state();
        let mut targets: Vec<(PathBuf, Handle<ScriptModule>)> = Vec::new();
        let mut stale = Vec::new();
        for path in paths {
            let path = normalize_path(path);
            if !state.registrations.iter().any(|registration| registration.files.contains(&path)) {
                continue;
            }
            let bytes = match fs::read(&path) {
                Ok(bytes) => bytes,
                Err(err) => {
                    tracing::debug!(
                        target: "scripting::watch",
                        file = %path.display(),
                        "skipping unreadable source: {err}"
                    );
                    continue;
                }
            };
            let hash = blake3::hash(&bytes);
            if state.hashes.get(&path) == Some(&hash) {
                continue;
            }
            state.hashes.insert(path.clone(), hash);
            for registration in state.registrations.iter().filter(|registration| registration.files.contains(&path)) {
                if targets.iter().any(|(_, module)| module.id() == registration.module) {
                    continue;
                }
                match registration.target.upgrade() {
                    Some(module) => targets.push((path.clone(), module)),
                    None => stale.push(registration.module),
                }
            }
        }
        for module in stale {
            state.remove_registration(module);
        }
        targets
    }
}

fn is_relevant(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Modify(ModifyKind::Data(_))
            | EventKind::Modify(ModifyKind::Name(_))
            | EventKind::Modify(ModifyKind::Any)
            | EventKind::Create(_)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ScriptExecutor;
    use crate::module::BuildState;
    use tempfile::TempDir;

    #[test]
    fn changed_content_reloads_the_module_once() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("counter.rhai");
        fs::write(&file, "fn value() { 1 }").unwrap();

        let executor = ScriptExecutor::builder().hot_reload(true).build().unwrap();
        let module = executor.create_module("Counter", "test");
        module.add_source_file(&file).unwrap();
        module.build().expect("build");
        let watcher = executor.watcher().expect("watcher");
        assert!(watcher.is_watching(module.id()));

        assert_eq!(watcher.handle_changed_paths(&[file.clone()]), 0);

        fs::write(&file, "fn value() { 2 }").unwrap();
        assert_eq!(watcher.handle_changed_paths(&[file.clone(), file.clone()]), 1);
        assert_eq!(module.reload_count(), 1);
        assert_eq!(module.build_state(), BuildState::Built);
        assert_eq!(module.segments()[0].code, "fn value() { 2 }");
    }

    #[test]
    fn released_modules_stop_being_watched() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("gone.rhai");
        fs::write(&file, "fn value() { 1 }").unwrap();

        let executor = ScriptExecutor::builder().hot_reload(true).build().unwrap();
        let module = executor.create_module("Gone", "test");
        module.add_source_file(&file).unwrap();
        module.build().expect("build");
        let id = module.id();
        drop(module);
        assert!(executor.delete_module(id));
        let watcher = executor.watcher().expect("watcher");
        assert!(!watcher.is_watching(id));
        assert!(watcher.watched_files().is_empty());
    }
}
