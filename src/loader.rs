use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver, Sender};

use anyhow::Result;

use crate::config::ScriptingConfig;
use crate::description::ModuleDescription;
use crate::error::LoadError;
use crate::executor::ScriptExecutor;
use crate::game_module::GameModule;
use crate::paths::{normalize_path, SourceSearch};
use crate::refcount::{Handle, WeakHandle};

/// Arena key of a loaded game module. Stale once the slot's generation moves on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotKey {
    index: u32,
    generation: u32,
}

struct SlotEntry {
    name: String,
    module: WeakHandle<GameModule>,
}

#[derive(Default)]
struct Slot {
    generation: u32,
    entry: Option<SlotEntry>,
}

/// Registry of game modules, deduplicated by name. Does not keep modules alive.
pub struct GameModuleLoader {
    executor: ScriptExecutor,
    search: SourceSearch,
    module_extension: String,
    known: HashMap<String, PathBuf>,
    slots: Vec<Slot>,
    free: Vec<u32>,
    by_name: HashMap<String, SlotKey>,
    reports_tx: Sender<SlotKey>,
    reports_rx: Receiver<SlotKey>,
}

impl GameModuleLoader {
    pub fn new(executor: ScriptExecutor, config: &ScriptingConfig) -> Self {
        let search = executor.search().clone();
        Self::with_search(executor, search, &config.module_extension)
    }

    pub fn with_search(executor: ScriptExecutor, search: SourceSearch, module_extension: &str) -> Self {
        let (reports_tx, reports_rx) = channel();
        Self {
            executor,
            search,
            module_extension: module_extension.trim_start_matches('.').to_string(),
            known: HashMap::new(),
            slots: Vec::new(),
            free: Vec::new(),
            by_name: HashMap::new(),
            reports_tx,
            reports_rx,
        }
    }

    pub fn executor(&self) -> &ScriptExecutor {
        &self.executor
    }

    /// Scans the roots for description files. Returns the number of distinct module names found.
    pub fn init(&mut self) -> Result<usize> {
        self.known.clear();
        for path in self.search.collect_files(&self.module_extension)? {
            let description = match ModuleDescription::from_path(&path) {
                Ok(description) => description,
                Err(err) => {
                    tracing::warn!(target: "scripting::loader", file = %path.display(), "skipping description: {err}");
                    continue;
                }
            };
            if let Some(existing) = self.known.get(&description.name) {
                tracing::warn!(
                    target: "scripting::loader",
                    module = %description.name,
                    kept = %existing.display(),
                    ignored = %path.display(),
                    "duplicate game module name"
                );
                continue;
            }
            self.known.insert(description.name, path);
        }
        tracing::info!(target: "scripting::loader", modules = self.known.len(), "game module scan complete");
        Ok(self.known.len())
    }

    /// Module names from the last scan, sorted.
    pub fn known_modules(&self) -> Vec<(String, PathBuf)> {
        let mut known: Vec<(String, PathBuf)> =
            self.known.iter().map(|(name, path)| (name.clone(), path.clone())).collect();
        known.sort();
        known
    }

    /// Returns the live module called `name_or_file`, creating and initializing it if needed.
    pub fn load(&mut self, name_or_file: &str, requested_by: &str) -> Result<Handle<GameModule>, LoadError> {
        self.drain_reports();
        if let Some(module) = self.live_instance(name_or_file, requested_by)? {
            return Ok(module);
        }

        let path = match self.known.get(name_or_file) {
            Some(path) => path.clone(),
            None if Path::new(name_or_file).is_file() => PathBuf::from(name_or_file),
            None => return Err(LoadError::NotFound(name_or_file.to_string())),
        };
        let description = ModuleDescription::from_path(&path)
            .map_err(|source| LoadError::InvalidDescription { path: path.clone(), source })?;
        if let Some(module) = self.live_instance(&description.name, requested_by)? {
            return Ok(module);
        }
        if !self.known.contains_key(&description.name) {
            self.known.insert(description.name.clone(), normalize_path(&path));
        }

        let name = description.name.clone();
        let slot = self.allocate(&name);
        let module = Handle::new(GameModule::new(
            description,
            requested_by,
            self.executor.clone(),
            slot,
            self.reports_tx.clone(),
        ));
        module.bind_self(Handle::downgrade(&module));
        if let Some(reserved) = self.slot_mut(slot) {
            reserved.entry = Some(SlotEntry { name: name.clone(), module: Handle::downgrade(&module) });
        }
        tracing::debug!(target: "scripting::loader", module = %name, requested_by, "loading game module");

        if let Err(err) = module.try_init(self) {
            self.free_slot(slot);
            return Err(err);
        }
        Ok(module)
    }

    fn live_instance(&self, name: &str, requested_by: &str) -> Result<Option<Handle<GameModule>>, LoadError> {
        match self.loaded_module(name) {
            Some(module) if module.is_initializing() => Err(LoadError::CircularDependency {
                module: name.to_string(),
                requested_by: requested_by.to_string(),
            }),
            other => Ok(other),
        }
    }

    /// The live instance registered under `name`, if any.
    pub fn loaded_module(&self, name: &str) -> Option<Handle<GameModule>> {
        let key = self.by_name.get(name)?;
        let slot = self.slots.get(key.index as usize)?;
        if slot.generation != key.generation {
            return None;
        }
        slot.entry.as_ref()?.module.upgrade()
    }

    pub fn loaded_modules(&mut self) -> Vec<Handle<GameModule>> {
        self.drain_reports();
        self.slots.iter().filter_map(|slot| slot.entry.as_ref()?.module.upgrade()).collect()
    }

    pub fn loaded_count(&mut self) -> usize {
        self.drain_reports();
        self.slots.iter().filter(|slot| slot.entry.is_some()).count()
    }

    /// Frees the slots of modules that reported their destruction.
    pub fn drain_reports(&mut self) {
        while let Ok(key) = self.reports_rx.try_recv() {
            self.free_slot(key);
        }
    }

    fn allocate(&mut self, name: &str) -> SlotKey {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot::default());
                (self.slots.len() - 1) as u32
            }
        };
        let generation = self.slots[index as usize].generation;
        let key = SlotKey { index, generation };
        self.by_name.insert(name.to_string(), key);
        key
    }

    fn slot_mut(&mut self, key: SlotKey) -> Option<&mut Slot> {
        self.slots.get_mut(key.index as usize).filter(|slot| slot.generation == key.generation)
    }

    fn free_slot(&mut self, key: SlotKey) {
        let Some(slot) = self.slot_mut(key) else {
            return;
        };
        let entry = slot.entry.take();
        slot.generation = slot.generation.wrapping_add(1);
        if let Some(entry) = entry {
            if self.by_name.get(&entry.name) == Some(&key) {
                self.by_name.remove(&entry.name);
            }
            tracing::debug!(target: "scripting::loader", module = %entry.name, "game module slot released");
        } else if let Some((name, _)) = self.by_name.iter().find(|(_, value)| **value == key) {
            let name = name.clone();
            self.by_name.remove(&name);
        }
        self.free.push(key.index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write_module(dir: &Path, name: &str, imports: &[&str], code: &str) {
        let imports: Vec<String> = imports.iter().map(|import| format!("\"{import}\"")).collect();
        let description = format!(
            r#"{{ "version": "1.0", "objects": [
                {{ "name": "{name}", "properties": {{ "Imports": [{}] }}, "sourcefiles": ["{}"] }}
            ] }}"#,
            imports.join(", "),
            name.to_lowercase()
        );
        fs::write(dir.join(format!("{}.kgm", name.to_lowercase())), description).unwrap();
        fs::write(dir.join(format!("{}.rhai", name.to_lowercase())), code).unwrap();
    }

    fn loader(dir: &TempDir) -> GameModuleLoader {
        let executor = ScriptExecutor::builder().build().unwrap();
        let search = SourceSearch::new(vec![dir.path().to_path_buf()], "rhai");
        let mut loader = GameModuleLoader::with_search(executor, search, "kgm");
        loader.init().unwrap();
        loader
    }

    #[test]
    fn unknown_names_are_not_found() {
        let dir = TempDir::new().unwrap();
        let mut loader = loader(&dir);
        assert!(matches!(loader.load("Missing", "test"), Err(LoadError::NotFound(_))));
    }

    #[test]
    fn slots_are_freed_when_modules_drop() {
        let dir = TempDir::new().unwrap();
        write_module(dir.path(), "Solo", &[], "fn value() { 1 }");
        let mut loader = loader(&dir);
        let first = loader.load("Solo", "test").unwrap();
        let key = first.slot();
        assert_eq!(loader.loaded_count(), 1);
        drop(first);
        assert_eq!(loader.loaded_count(), 0);
        assert!(loader.loaded_module("Solo").is_none());

        let second = loader.load("Solo", "test").unwrap();
        assert_eq!(second.slot().index, key.index);
        assert_ne!(second.slot().generation, key.generation);
    }

    #[test]
    fn imports_become_dependencies() {
        let dir = TempDir::new().unwrap();
        write_module(dir.path(), "Base", &[], "fn base() { 1 }");
        write_module(dir.path(), "Game", &["Base"], "fn game() { 2 }");
        let mut loader = loader(&dir);
        let game = loader.load("Game", "test").unwrap();
        let dependencies = game.dependencies();
        assert_eq!(dependencies.len(), 1);
        assert_eq!(dependencies[0].name(), "Base");
        assert_eq!(dependencies[0].owner(), "Game");
        assert!(Handle::ptr_eq(&dependencies[0], &loader.loaded_module("Base").unwrap()));
    }
}
