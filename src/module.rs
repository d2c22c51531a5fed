use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};

use rhai::{Dynamic, FnAccess, ParseError, AST};

use crate::access::AccessFlags;
use crate::error::{BuildError, InvokeError};
use crate::events::ListenerKind;
use crate::executor::{ExecutorShared, RunSetup, ScriptExecutor};
use crate::listeners::{ListenerEntry, ListenerIndex};
use crate::marshal::Value;
use crate::paths::normalize_path;
use crate::refcount::WeakHandle;
use crate::source::{self, LineMap, SourceSegment};

/// Held for the duration of every compile. At most one module compiles at a time.
pub static MODULE_BUILD_LOCK: Mutex<()> = Mutex::new(());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleId(pub u64);

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildState {
    Empty,
    ReadyToBuild,
    Built,
    Failed,
    Discarded,
}

impl BuildState {
    pub fn is_terminal(self) -> bool {
        matches!(self, BuildState::Failed | BuildState::Discarded)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionSignature {
    pub name: String,
    pub params: Vec<String>,
    pub public: bool,
    pub comments: Vec<String>,
}

/// Output of one successful build. Shared by every function reference taken from it.
pub struct CompiledModule {
    internal_name: String,
    ast: AST,
    lines: LineMap,
    access: AccessFlags,
    functions: Vec<FunctionSignature>,
}

impl CompiledModule {
    fn new(internal_name: String, ast: AST, lines: LineMap, access: AccessFlags) -> Self {
        let functions = ast
            .iter_functions()
            .map(|meta| FunctionSignature {
                name: meta.name.to_string(),
                params: meta.params.iter().map(|param| param.to_string()).collect(),
                public: !matches!(meta.access, FnAccess::Private),
                comments: meta.comments.iter().map(|comment| comment.to_string()).collect(),
            })
            .collect();
        Self { internal_name, ast, lines, access, functions }
    }

    pub fn internal_name(&self) -> &str {
        &self.internal_name
    }

    pub fn ast(&self) -> &AST {
        &self.ast
    }

    pub fn lines(&self) -> &LineMap {
        &self.lines
    }

    /// Access the module was built with. Restricted host functions check it on every call.
    pub fn access(&self) -> AccessFlags {
        self.access
    }

    pub fn functions(&self) -> &[FunctionSignature] {
        &self.functions
    }

    pub fn has_function(&self, name: &str) -> bool {
        self.functions.iter().any(|function| function.name == name)
    }

    /// Picks the overload taking exactly `arg_count` parameters, else the widest one taking fewer.
    pub fn resolve(self: &Arc<Self>, name: &str, arg_count: usize) -> Option<FunctionRef> {
        let mut candidates: Vec<&FunctionSignature> =
            self.functions.iter().filter(|function| function.name == name).collect();
        candidates.sort_by_key(|function| function.params.len());
        let chosen =
            candidates.iter().rev().find(|function| function.params.len() <= arg_count).or(candidates.first())?;
        Some(FunctionRef::new(self.clone(), &chosen.name, chosen.params.len()))
    }
}

impl fmt::Debug for CompiledModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledModule")
            .field("internal_name", &self.internal_name)
            .field("functions", &self.functions.len())
            .finish()
    }
}

/// A script function plus the compiled module that keeps it alive.
#[derive(Clone)]
pub struct FunctionRef {
    module: Arc<CompiledModule>,
    name: String,
    arity: usize,
}

impl FunctionRef {
    pub(crate) fn new(module: Arc<CompiledModule>, name: &str, arity: usize) -> Self {
        Self { module, name: name.to_string(), arity }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arity(&self) -> usize {
        self.arity
    }

    pub fn module(&self) -> &Arc<CompiledModule> {
        &self.module
    }
}

impl fmt::Debug for FunctionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}/{}", self.module.internal_name, self.name, self.arity)
    }
}

/// Argument provider for the RELEASE and INIT listeners fired around a reload.
pub trait LifecycleHooks: Send + Sync {
    fn release_args(&self) -> Vec<Value>;
    fn init_args(&self) -> Vec<Value>;
}

struct ModuleState {
    build_state: BuildState,
    internal_name: String,
    segments: Vec<SourceSegment>,
    access: AccessFlags,
    compiled: Option<Arc<CompiledModule>>,
    listeners: Option<ListenerIndex>,
    watched: Vec<PathBuf>,
    hooks: Option<Arc<dyn LifecycleHooks>>,
    reloads: u32,
}

/// One unit of script source and its compiled form.
pub struct ScriptModule {
    id: ModuleId,
    name: String,
    source: String,
    executor: Weak<ExecutorShared>,
    self_ref: OnceLock<WeakHandle<ScriptModule>>,
    state: Mutex<ModuleState>,
}

impl ScriptModule {
    pub(crate) fn new(id: ModuleId, name: &str, source: &str, executor: Weak<ExecutorShared>) -> Self {
        let state = ModuleState {
            build_state: BuildState::Empty,
            internal_name: format!("{name}-{id}"),
            segments: Vec::new(),
            access: AccessFlags::default_module(),
            compiled: None,
            listeners: None,
            watched: Vec::new(),
            hooks: None,
            reloads: 0,
        };
        Self {
            id,
            name: name.to_string(),
            source: source.to_string(),
            executor,
            self_ref: OnceLock::new(),
            state: Mutex::new(state),
        }
    }

    pub(crate) fn bind_self(&self, weak: WeakHandle<ScriptModule>) {
        let _ = self.self_ref.set(weak);
    }

    fn lock_state(&self) -> MutexGuard<'_, ModuleState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> ModuleId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source_tag(&self) -> &str {
        &self.source
    }

    pub fn internal_name(&self) -> String {
        self.lock_state().internal_name.clone()
    }

    pub fn build_state(&self) -> BuildState {
        self.lock_state().build_state
    }

    pub fn reload_count(&self) -> u32 {
        self.lock_state().reloads
    }

    pub fn access(&self) -> AccessFlags {
        self.lock_state().access
    }

    /// Applies to the next build.
    pub fn set_access(&self, access: AccessFlags) {
        self.lock_state().access = access;
    }

    pub fn add_access(&self, extra: AccessFlags) {
        self.lock_state().access |= extra;
    }

    pub fn add_source_segment(&self, file: &str, start_line: usize, code: &str) -> bool {
        self.push_segment(SourceSegment::new(file, start_line, code))
    }

    pub fn add_source_file(&self, path: impl AsRef<Path>) -> Result<bool, BuildError> {
        Ok(self.push_segment(SourceSegment::from_file(path.as_ref())?))
    }

    fn push_segment(&self, segment: SourceSegment) -> bool {
        let mut state = self.lock_state();
        if state.segments.iter().any(|existing| existing.overlaps(&segment.file, segment.start_line)) {
            tracing::debug!(
                target: "scripting::module",
                module = %self.name,
                file = %segment.file,
                line = segment.start_line,
                "duplicate source segment ignored"
            );
            return false;
        }
        state.segments.push(segment);
        if state.build_state == BuildState::Empty {
            state.build_state = BuildState::ReadyToBuild;
        }
        true
    }

    pub fn segments(&self) -> Vec<SourceSegment> {
        self.lock_state().segments.clone()
    }

    pub fn segment_count(&self) -> usize {
        self.lock_state().segments.len()
    }

    pub fn watched_files(&self) -> Vec<PathBuf> {
        self.lock_state().watched.clone()
    }

    /// Compiles on first call. Later calls return the same compiled module until a reload.
    pub fn build(&self) -> Option<Arc<CompiledModule>> {
        let mut state = self.lock_state();
        self.build_locked(&mut state)
    }

    fn build_locked(&self, state: &mut ModuleState) -> Option<Arc<CompiledModule>> {
        match state.build_state {
            BuildState::Built => {
                let live = self.executor.upgrade().is_some_and(|executor| executor.is_compiled(&state.internal_name));
                match (&state.compiled, live) {
                    (Some(compiled), true) => return Some(compiled.clone()),
                    _ => {
                        self.discard_locked(state, "compiled module was invalidated");
                        return None;
                    }
                }
            }
            BuildState::ReadyToBuild => {}
            BuildState::Empty | BuildState::Failed | BuildState::Discarded => return None,
        }

        let Some(executor) = self.executor.upgrade() else {
            self.discard_locked(state, "script executor is gone");
            return None;
        };
        match self.compile(&executor, state) {
            Ok((compiled, watched)) => {
                executor.register_compiled(compiled.clone());
                state.compiled = Some(compiled.clone());
                state.listeners = None;
                state.build_state = BuildState::Built;
                self.start_monitoring(&executor, state, watched);
                tracing::info!(
                    target: "scripting::module",
                    module = %self.name,
                    internal = %state.internal_name,
                    segments = state.segments.len(),
                    functions = compiled.functions().len(),
                    "module built"
                );
                Some(compiled)
            }
            Err(err) => {
                match &err {
                    BuildError::Compile { source_line, .. } if !source_line.is_empty() => tracing::error!(
                        target: "scripting::module",
                        module = %self.name,
                        "build failed: {err}\n    > {source_line}"
                    ),
                    _ => tracing::error!(target: "scripting::module", module = %self.name, "build failed: {err}"),
                }
                state.build_state = BuildState::Failed;
                None
            }
        }
    }

    fn compile(
        &self,
        executor: &ExecutorShared,
        state: &ModuleState,
    ) -> Result<(Arc<CompiledModule>, Vec<PathBuf>), BuildError> {
        let prepared = source::prepare(&state.segments, executor.search())?;
        source::check_access(&prepared, state.access, executor.restricted())?;
        let compiled = {
            let _build = MODULE_BUILD_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
            executor.note_build();
            executor.engine().compile(&prepared.combined)
        };
        let mut ast = compiled.map_err(|err| compile_error(&prepared.lines, &state.internal_name, err))?;
        ast.set_source(state.internal_name.as_str());

        let mut watched: Vec<PathBuf> = state
            .segments
            .iter()
            .filter(|segment| segment.from_disk)
            .map(|segment| normalize_path(Path::new(&segment.file)))
            .collect();
        for included in prepared.included {
            if !watched.contains(&included) {
                watched.push(included);
            }
        }
        let compiled = CompiledModule::new(state.internal_name.clone(), ast, prepared.lines, state.access);
        Ok((Arc::new(compiled), watched))
    }

    fn start_monitoring(&self, executor: &ExecutorShared, state: &mut ModuleState, files: Vec<PathBuf>) {
        if let (Some(watcher), Some(module)) = (executor.watcher(), self.self_ref.get()) {
            if let Err(err) = watcher.watch(self.id, module.clone(), &files) {
                tracing::warn!(target: "scripting::watch", module = %self.name, "cannot watch module sources: {err:#}");
            }
        }
        state.watched = files;
    }

    fn stop_monitoring(&self, executor: Option<&ExecutorShared>, state: &mut ModuleState) {
        if let Some(watcher) = executor.and_then(ExecutorShared::watcher) {
            watcher.unwatch(self.id);
        }
        state.watched.clear();
    }

    fn discard_locked(&self, state: &mut ModuleState, reason: &str) {
        let executor = self.executor.upgrade();
        if let (Some(executor), Some(compiled)) = (&executor, state.compiled.take()) {
            executor.remove_compiled(compiled.internal_name());
        }
        self.stop_monitoring(executor.as_deref(), state);
        state.listeners = None;
        if state.build_state != BuildState::Discarded {
            tracing::warn!(target: "scripting::module", module = %self.name, "module discarded: {reason}");
        }
        state.build_state = BuildState::Discarded;
    }

    /// Marks the module unusable. It has to be recreated to run again.
    pub fn mark_discarded(&self) {
        let mut state = self.lock_state();
        self.discard_locked(&mut state, "discarded by host");
    }

    /// Tears down compiled state, listeners and file watches.
    pub fn release(&self) {
        let mut state = self.lock_state();
        state.hooks = None;
        if state.build_state != BuildState::Discarded {
            tracing::debug!(target: "scripting::module", module = %self.name, "releasing module");
        }
        let executor = self.executor.upgrade();
        if let (Some(executor), Some(compiled)) = (&executor, state.compiled.take()) {
            executor.remove_compiled(compiled.internal_name());
        }
        self.stop_monitoring(executor.as_deref(), &mut state);
        state.listeners = None;
        state.build_state = BuildState::Discarded;
    }

    fn listeners_locked<'a>(&self, state: &'a mut ModuleState) -> Option<&'a ListenerIndex> {
        let compiled = self.build_locked(state)?;
        if state.listeners.is_none() {
            let index = ListenerIndex::build(&compiled);
            tracing::debug!(
                target: "scripting::module",
                module = %self.name,
                listeners = index.len(),
                "listener index built"
            );
            state.listeners = Some(index);
        }
        state.listeners.as_ref()
    }

    pub fn find_listener(&self, name: &str, generic_type: Option<&str>) -> Option<ListenerEntry> {
        let mut state = self.lock_state();
        self.listeners_locked(&mut state)?.find(name, generic_type).cloned()
    }

    pub fn has_listener(&self, name: &str, generic_type: Option<&str>) -> bool {
        self.find_listener(name, generic_type).is_some()
    }

    pub fn listeners(&self) -> Vec<ListenerEntry> {
        let mut state = self.lock_state();
        self.listeners_locked(&mut state).map(|index| index.entries().cloned().collect()).unwrap_or_default()
    }

    /// Resolves an entry point, building the module if needed.
    pub fn function(&self, name: &str, arg_count: usize) -> Result<FunctionRef, InvokeError> {
        if self.executor.strong_count() == 0 {
            return Err(InvokeError::ExecutorGone);
        }
        let mut state = self.lock_state();
        let compiled = self
            .build_locked(&mut state)
            .ok_or_else(|| InvokeError::ModuleUnusable { module: self.name.clone(), state: state.build_state })?;
        compiled.resolve(name, arg_count).ok_or_else(|| InvokeError::FunctionNotFound(name.to_string()))
    }

    /// Returns false if hooks were already registered.
    pub fn set_lifecycle_hooks(&self, hooks: Arc<dyn LifecycleHooks>) -> bool {
        let mut state = self.lock_state();
        if state.hooks.is_some() {
            return false;
        }
        state.hooks = Some(hooks);
        true
    }

    pub fn clear_lifecycle_hooks(&self) {
        self.lock_state().hooks = None;
    }

    fn fire_lifecycle(
        &self,
        executor: &Arc<ExecutorShared>,
        state: &mut ModuleState,
        kind: ListenerKind,
        args: &[Value],
    ) {
        let Some(entry) = self.listeners_locked(state).and_then(|index| index.find(kind.name(), None).cloned()) else {
            return;
        };
        let runner = ScriptExecutor::from_shared(executor.clone());
        if let Err(err) = runner.invoke::<Dynamic>(&entry.function, args, &RunSetup::new(entry.function.name())) {
            tracing::error!(target: "scripting::module", module = %self.name, "{kind} listener failed: {err}");
        }
    }

    /// Rebuilds from the same segments, re-reading the ones that came from disk.
    pub fn reload(&self) -> bool {
        let mut retained = Vec::new();
        let reloaded = {
            let mut state = self.lock_state();
            self.reload_locked(&mut state, &mut retained)
        };
        // Listener arguments may hold the last handle to an owner whose drop locks this module.
        drop(retained);
        reloaded
    }

    fn reload_locked(&self, state: &mut ModuleState, retained: &mut Vec<Value>) -> bool {
        if state.build_state != BuildState::Built {
            tracing::warn!(
                target: "scripting::module",
                module = %self.name,
                state = ?state.build_state,
                "reload ignored for a module that is not built"
            );
            return false;
        }
        let Some(executor) = self.executor.upgrade() else {
            self.discard_locked(state, "script executor is gone");
            return false;
        };
        let hooks = state.hooks.clone();
        if let Some(hooks) = &hooks {
            let args = hooks.release_args();
            self.fire_lifecycle(&executor, state, ListenerKind::OnRelease, &args);
            retained.extend(args);
        }

        if let Some(compiled) = state.compiled.take() {
            executor.remove_compiled(compiled.internal_name());
        }
        self.stop_monitoring(Some(executor.as_ref()), state);
        state.listeners = None;
        state.reloads += 1;
        state.internal_name.push('R');
        for segment in state.segments.iter_mut().filter(|segment| segment.from_disk) {
            match fs::read_to_string(&segment.file) {
                Ok(code) => segment.code = code,
                Err(err) => tracing::warn!(
                    target: "scripting::module",
                    module = %self.name,
                    file = %segment.file,
                    "keeping previous source, re-read failed: {err}"
                ),
            }
        }
        state.build_state = BuildState::ReadyToBuild;

        if self.build_locked(state).is_none() {
            return false;
        }
        executor.note_reload();
        if let Some(hooks) = &hooks {
            let args = hooks.init_args();
            self.fire_lifecycle(&executor, state, ListenerKind::OnInit, &args);
            retained.extend(args);
        }
        tracing::info!(
            target: "scripting::module",
            module = %self.name,
            internal = %state.internal_name,
            "module reloaded"
        );
        true
    }

    pub fn describe(&self) -> String {
        format!("ScriptModule({}) {}, from: {}", self.id, self.name, self.source)
    }
}

impl Drop for ScriptModule {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        let executor = self.executor.upgrade();
        if let Some(executor) = &executor {
            if let Some(compiled) = state.compiled.take() {
                executor.remove_compiled(compiled.internal_name());
            }
            if !state.watched.is_empty() {
                if let Some(watcher) = executor.watcher() {
                    watcher.unwatch(self.id);
                }
            }
        }
    }
}

impl fmt::Debug for ScriptModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptModule")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("source", &self.source)
            .finish()
    }
}

fn compile_error(lines: &LineMap, internal_name: &str, err: ParseError) -> BuildError {
    let combined_line = err.1.line().unwrap_or(0);
    let (file, line) = lines.locate(combined_line).unwrap_or((internal_name, combined_line));
    BuildError::Compile {
        file: file.to_string(),
        line,
        message: err.0.to_string(),
        source_line: lines.source_line(combined_line).unwrap_or_default().trim().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::refcount::Handle;

    fn executor() -> ScriptExecutor {
        ScriptExecutor::builder().hot_reload(false).build().expect("executor")
    }

    /// Stands in for a game module whose destructor inspects its script module.
    struct Owner {
        script: WeakHandle<ScriptModule>,
        dropped: Arc<AtomicBool>,
    }

    impl Drop for Owner {
        fn drop(&mut self) {
            if let Some(script) = self.script.upgrade() {
                let _ = script.build_state();
            }
            self.dropped.store(true, Ordering::SeqCst);
        }
    }

    /// Gives the only handle to its owner away with the RELEASE arguments.
    struct HandOff {
        owner: Mutex<Option<Handle<Owner>>>,
    }

    impl LifecycleHooks for HandOff {
        fn release_args(&self) -> Vec<Value> {
            let owner = self.owner.lock().unwrap().take();
            vec![Value::Void, owner.map(Value::object).unwrap_or(Value::Void)]
        }

        fn init_args(&self) -> Vec<Value> {
            vec![Value::Void, Value::Void]
        }
    }

    #[test]
    fn segments_advance_state_and_reject_duplicates() {
        let executor = executor();
        let module = executor.create_module("Segments", "test");
        assert_eq!(module.build_state(), BuildState::Empty);
        assert!(module.add_source_segment("main.rhai", 10, "fn a() { 1 }"));
        assert_eq!(module.build_state(), BuildState::ReadyToBuild);
        assert!(!module.add_source_segment("main.rhai", 11, "fn b() { 2 }"));
        assert_eq!(module.segment_count(), 1);
        assert!(module.add_source_segment("main.rhai", 13, "fn c() { 3 }"));
        assert!(module.add_source_segment("other.rhai", 10, "fn d() { 4 }"));
        assert_eq!(module.segment_count(), 3);
    }

    #[test]
    fn build_is_idempotent() {
        let executor = executor();
        let module = executor.create_module("Idempotent", "test");
        module.add_source_segment("inline", 1, "fn value() { 42 }");
        let first = module.build().expect("first build");
        let builds = executor.stats().builds;
        let second = module.build().expect("second build");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(executor.stats().builds, builds);
        assert_eq!(module.build_state(), BuildState::Built);
    }

    #[test]
    fn compile_errors_are_terminal() {
        let executor = executor();
        let module = executor.create_module("Broken", "test");
        module.add_source_segment("broken.rhai", 1, "fn ok() { 1 }\nfn broken( { }");
        assert!(module.build().is_none());
        assert_eq!(module.build_state(), BuildState::Failed);
        assert!(module.build().is_none());
        assert!(!module.reload());
        assert_eq!(module.build_state(), BuildState::Failed);
    }

    #[test]
    fn empty_modules_do_not_build() {
        let executor = executor();
        let module = executor.create_module("Empty", "test");
        assert!(module.build().is_none());
        assert_eq!(module.build_state(), BuildState::Empty);
    }

    #[test]
    fn reload_renames_internal_module() {
        let executor = executor();
        let module = executor.create_module("Reloading", "test");
        module.add_source_segment("inline", 1, "fn value() { 1 }");
        let before = module.build().expect("build");
        let name = module.internal_name();
        assert!(module.reload());
        let after = module.build().expect("rebuilt");
        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(module.internal_name(), format!("{name}R"));
        assert_eq!(module.reload_count(), 1);
        assert!(!executor.discard_compiled(&name));
    }

    #[test]
    fn last_owner_handle_in_listener_args_drops_after_unlock() {
        let executor = ScriptExecutor::builder().register_object::<Owner>("Owner", false).build().expect("executor");
        let module = executor.create_module("HandOff", "test");
        let code = "/// @Listener=\"OnRelease\"\nfn bye(event, owner) { }\nfn value() { 1 }";
        module.add_source_segment("inline", 1, code);
        module.build().expect("build");

        let dropped = Arc::new(AtomicBool::new(false));
        let owner = Handle::new(Owner { script: Handle::downgrade(&module), dropped: dropped.clone() });
        assert!(module.set_lifecycle_hooks(Arc::new(HandOff { owner: Mutex::new(Some(owner)) })));

        let (done, finished) = mpsc::channel();
        let reloading = module.clone();
        thread::spawn(move || {
            let _ = done.send(reloading.reload());
        });
        let reloaded = finished.recv_timeout(Duration::from_secs(10)).expect("reload returned");
        assert!(reloaded);
        assert!(dropped.load(Ordering::SeqCst));
        assert_eq!(module.build_state(), BuildState::Built);
    }

    #[test]
    fn discarded_compiled_handle_is_never_reused() {
        let executor = executor();
        let module = executor.create_module("Discard", "test");
        module.add_source_segment("inline", 1, "fn value() { 1 }");
        module.build().expect("build");
        assert!(executor.discard_compiled(&module.internal_name()));
        assert!(module.build().is_none());
        assert_eq!(module.build_state(), BuildState::Discarded);
        assert!(!module.reload());
    }

    #[test]
    fn overloads_resolve_by_argument_count() {
        let executor = executor();
        let module = executor.create_module("Overloads", "test");
        module.add_source_segment("inline", 1, "fn pick() { 0 }\nfn pick(a) { 1 }\nfn pick(a, b) { 2 }");
        assert_eq!(module.function("pick", 1).unwrap().arity(), 1);
        assert_eq!(module.function("pick", 5).unwrap().arity(), 2);
        assert_eq!(module.function("pick", 0).unwrap().arity(), 0);
        assert!(matches!(module.function("missing", 0), Err(InvokeError::FunctionNotFound(_))));
    }
}
