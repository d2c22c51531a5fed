use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use rhai::Engine;

use crate::access::AccessFlags;
use crate::description::ModuleDescription;
use crate::error::{InvokeError, LoadError};
use crate::events::{Event, EventKind, EventType, ListenerKind};
use crate::executor::{RunSetup, ScriptExecutor};
use crate::listeners::ListenerEntry;
use crate::loader::{GameModuleLoader, SlotKey};
use crate::marshal::{FromScript, Value};
use crate::module::{BuildState, LifecycleHooks, ScriptModule};
use crate::refcount::{Handle, WeakHandle};

/// A global event a module's listener index subscribes it to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub event: EventKind,
    pub listener: ListenerKind,
    pub function: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    Handled,
    NoListener,
    NoScript,
}

#[derive(Default)]
struct GameModuleState {
    script: Option<Handle<ScriptModule>>,
    dependencies: Vec<Handle<GameModule>>,
}

/// Named, file-described unit owning one script module.
pub struct GameModule {
    name: String,
    owner: String,
    file: PathBuf,
    version: String,
    sources: Vec<String>,
    exports: Vec<String>,
    imports: Vec<String>,
    extra_access: AccessFlags,
    executor: ScriptExecutor,
    initializing: AtomicBool,
    initialized: AtomicBool,
    state: Mutex<GameModuleState>,
    slot: SlotKey,
    reports: Sender<SlotKey>,
    self_ref: OnceLock<WeakHandle<GameModule>>,
}

impl GameModule {
    pub(crate) fn new(
        description: ModuleDescription,
        owner: &str,
        executor: ScriptExecutor,
        slot: SlotKey,
        reports: Sender<SlotKey>,
    ) -> Self {
        Self {
            name: description.name,
            owner: owner.to_string(),
            file: description.path,
            version: description.version,
            sources: description.source_files,
            exports: description.exports,
            imports: description.imports,
            extra_access: description.extra_access,
            executor,
            initializing: AtomicBool::new(false),
            initialized: AtomicBool::new(false),
            state: Mutex::new(GameModuleState::default()),
            slot,
            reports,
            self_ref: OnceLock::new(),
        }
    }

    pub(crate) fn bind_self(&self, weak: WeakHandle<GameModule>) {
        let _ = self.self_ref.set(weak);
    }

    fn lock_state(&self) -> MutexGuard<'_, GameModuleState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handle(&self) -> Option<Handle<GameModule>> {
        self.self_ref.get().and_then(WeakHandle::upgrade)
    }

    fn self_value(&self) -> Value {
        self.handle().map(Value::object).unwrap_or(Value::Void)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of whoever first requested the load.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn file(&self) -> &Path {
        &self.file
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn source_files(&self) -> &[String] {
        &self.sources
    }

    pub fn exports(&self) -> &[String] {
        &self.exports
    }

    pub fn imports(&self) -> &[String] {
        &self.imports
    }

    pub fn extra_access(&self) -> AccessFlags {
        self.extra_access
    }

    pub fn is_initializing(&self) -> bool {
        self.initializing.load(Ordering::Acquire)
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub fn script(&self) -> Option<Handle<ScriptModule>> {
        self.lock_state().script.clone()
    }

    pub fn dependencies(&self) -> Vec<Handle<GameModule>> {
        self.lock_state().dependencies.clone()
    }

    pub(crate) fn slot(&self) -> SlotKey {
        self.slot
    }

    fn base_dir(&self) -> Option<&Path> {
        self.file.parent()
    }

    fn resolve_files(&self, names: &[String]) -> Result<Vec<PathBuf>, String> {
        names
            .iter()
            .map(|name| self.executor.search().find_source(name, self.base_dir()).ok_or_else(|| name.clone()))
            .collect()
    }

    /// Export files of this module, resolved against its description file. The error names
    /// the first export that could not be found.
    pub fn export_paths(&self) -> Result<Vec<PathBuf>, String> {
        self.resolve_files(&self.exports)
    }

    /// Compiles the script module and fires INIT. False on import or compile failure.
    pub fn init(&self, loader: &mut GameModuleLoader) -> bool {
        self.try_init(loader).is_ok()
    }

    pub(crate) fn try_init(&self, loader: &mut GameModuleLoader) -> Result<(), LoadError> {
        if self.is_initialized() {
            return Ok(());
        }
        if self.initializing.swap(true, Ordering::AcqRel) {
            return Err(LoadError::CircularDependency { module: self.name.clone(), requested_by: self.name.clone() });
        }
        let result = self.initialize(loader);
        self.initializing.store(false, Ordering::Release);
        match result {
            Ok(script) => {
                self.initialized.store(true, Ordering::Release);
                tracing::info!(
                    target: "scripting::loader",
                    module = %self.name,
                    version = %self.version,
                    internal = %script.internal_name(),
                    "game module initialized"
                );
                if let Err(err) = self.fire_event(&Event::new(EventType::Init)) {
                    tracing::error!(target: "scripting::loader", module = %self.name, "init listener failed: {err}");
                }
                Ok(())
            }
            Err(err) => {
                tracing::error!(target: "scripting::loader", module = %self.name, "initialization failed: {err}");
                self.detach_script(false);
                Err(err)
            }
        }
    }

    fn initialize(&self, loader: &mut GameModuleLoader) -> Result<Handle<ScriptModule>, LoadError> {
        let script = self.executor.create_module(&self.name, &self.file.display().to_string());
        script.set_access(AccessFlags::default_module() | self.extra_access);
        self.lock_state().script = Some(script.clone());

        let sources = self.resolve_files(&self.sources).map_err(|missing| {
            tracing::error!(target: "scripting::loader", module = %self.name, "source file '{missing}' not found");
            LoadError::InitFailed(self.name.clone())
        })?;
        for path in &sources {
            script.add_source_file(path).map_err(|err| {
                tracing::error!(target: "scripting::loader", module = %self.name, "{err}");
                LoadError::InitFailed(self.name.clone())
            })?;
        }

        for import in &self.imports {
            let dependency = loader.load(import, &self.name)?;
            let exports = dependency.export_paths().map_err(|missing| {
                tracing::error!(
                    target: "scripting::loader",
                    module = %self.name,
                    import = %import,
                    "export file '{missing}' not found"
                );
                LoadError::InitFailed(self.name.clone())
            })?;
            for path in &exports {
                script.add_source_file(path).map_err(|err| {
                    tracing::error!(target: "scripting::loader", module = %self.name, "{err}");
                    LoadError::InitFailed(self.name.clone())
                })?;
            }
            self.lock_state().dependencies.push(dependency);
        }

        if script.build().is_none() {
            return Err(LoadError::InitFailed(self.name.clone()));
        }
        if let Some(module) = self.self_ref.get() {
            script.set_lifecycle_hooks(Arc::new(GameModuleHooks { module: module.clone() }));
        }
        for subscription in self.subscriptions_logged(&script.listeners(), true) {
            tracing::debug!(
                target: "scripting::loader",
                module = %self.name,
                listener = %subscription.listener,
                function = %subscription.function,
                "subscribed"
            );
        }
        Ok(script)
    }

    fn subscriptions_logged(&self, listeners: &[ListenerEntry], warn: bool) -> Vec<Subscription> {
        let mut subscriptions = Vec::new();
        for entry in listeners {
            let event = match (entry.kind.event_type(), &entry.generic_type) {
                (Some(event), _) => EventKind::Builtin(event),
                (None, Some(generic)) => EventKind::Generic(generic.clone()),
                (None, None) => {
                    if warn {
                        tracing::warn!(
                            target: "scripting::loader",
                            module = %self.name,
                            function = entry.function.name(),
                            "listener '{}' has no global event",
                            entry.kind
                        );
                    }
                    continue;
                }
            };
            subscriptions.push(Subscription {
                event,
                listener: entry.kind,
                function: entry.function.name().to_string(),
            });
        }
        subscriptions
    }

    /// Global events the current listener index subscribes this module to.
    pub fn subscriptions(&self) -> Vec<Subscription> {
        match self.script() {
            Some(script) => self.subscriptions_logged(&script.listeners(), false),
            None => Vec::new(),
        }
    }

    pub fn is_subscribed(&self, event: &EventKind) -> bool {
        self.subscriptions().iter().any(|subscription| &subscription.event == event)
    }

    /// Delivers `event` to the matching listener. Listeners receive `(event, module)`.
    pub fn fire_event(&self, event: &Event) -> Result<EventOutcome, InvokeError> {
        let Some(script) = self.script() else {
            return Ok(EventOutcome::NoScript);
        };
        self.deliver(&script, event, self.self_value())
    }

    fn deliver(&self, script: &ScriptModule, event: &Event, module: Value) -> Result<EventOutcome, InvokeError> {
        let listener = match event.kind() {
            EventKind::Builtin(event_type) => script.find_listener(event_type.listener().name(), None),
            EventKind::Generic(name) => script.find_listener(ListenerKind::Generic.name(), Some(name)),
        };
        let Some(listener) = listener else {
            return Ok(EventOutcome::NoListener);
        };
        tracing::trace!(
            target: "scripting::loader",
            module = %self.name,
            event = %event,
            function = listener.function.name(),
            "firing event"
        );
        let args = [Value::object(Handle::new(event.clone())), module];
        self.executor.invoke::<rhai::Dynamic>(&listener.function, &args, &RunSetup::new(listener.function.name()))?;
        Ok(EventOutcome::Handled)
    }

    /// Runs `setup.entry` on this module's script. With `pass_self` the module is the first argument.
    pub fn execute_on_module<R: FromScript>(
        &self,
        setup: &mut RunSetup,
        pass_self: bool,
        args: &[Value],
    ) -> Result<Option<R>, InvokeError> {
        let Some(script) = self.script() else {
            return Err(InvokeError::ModuleUnusable { module: self.name.clone(), state: BuildState::Empty });
        };
        if pass_self {
            let mut with_self = Vec::with_capacity(args.len() + 1);
            with_self.push(self.self_value());
            with_self.extend_from_slice(args);
            self.executor.run(&script, setup, &with_self)
        } else {
            self.executor.run(&script, setup, args)
        }
    }

    /// Fires RELEASE and detaches the script module.
    pub fn release_script(&self) {
        self.detach_script(true);
    }

    fn detach_script(&self, fire_release: bool) {
        let (script, dependencies) = {
            let mut state = self.lock_state();
            (state.script.take(), std::mem::take(&mut state.dependencies))
        };
        if let Some(script) = script {
            if fire_release && script.build_state() == BuildState::Built {
                if let Err(err) = self.deliver(&script, &Event::new(EventType::Release), self.self_value()) {
                    tracing::error!(target: "scripting::loader", module = %self.name, "release listener failed: {err}");
                }
            }
            script.clear_lifecycle_hooks();
            if !self.executor.delete_module(script.id()) {
                script.release();
            }
        }
        self.initialized.store(false, Ordering::Release);
        drop(dependencies);
    }
}

impl Drop for GameModule {
    fn drop(&mut self) {
        let _ = self.reports.send(self.slot);
        self.detach_script(true);
        tracing::debug!(target: "scripting::loader", module = %self.name, "game module destroyed");
    }
}

impl fmt::Display for GameModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GameModule {} v{} ({})", self.name, self.version, self.file.display())
    }
}

impl fmt::Debug for GameModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GameModule")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("file", &self.file)
            .field("slot", &self.slot)
            .finish()
    }
}

struct GameModuleHooks {
    module: WeakHandle<GameModule>,
}

impl GameModuleHooks {
    fn args(&self, event: EventType) -> Vec<Value> {
        let module = self.module.upgrade().map(Value::object).unwrap_or(Value::Void);
        vec![Value::object(Handle::new(Event::new(event))), module]
    }
}

impl LifecycleHooks for GameModuleHooks {
    fn release_args(&self) -> Vec<Value> {
        self.args(EventType::Release)
    }

    fn init_args(&self) -> Vec<Value> {
        self.args(EventType::Init)
    }
}

pub(crate) fn register_script_api(engine: &mut Engine) {
    engine.register_type_with_name::<Handle<GameModule>>("GameModule");
    engine.register_get("name", |module: &mut Handle<GameModule>| module.name().to_string());
    engine.register_get("version", |module: &mut Handle<GameModule>| module.version().to_string());
    engine.register_get("owner", |module: &mut Handle<GameModule>| module.owner().to_string());
    engine.register_fn("to_string", |module: &mut Handle<GameModule>| module.to_string());
}
