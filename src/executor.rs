use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use rhai::{CallFnOptions, Dynamic, Engine, EvalAltResult, NativeCallContext, Position, Scope};

use crate::access::{AccessFlags, AccessGrants};
use crate::config::ScriptingConfig;
use crate::error::{AbortReason, FrameKind, InvokeError, ScriptException, StackFrame};
use crate::events::{self, Event};
use crate::game_module::{self, GameModule};
use crate::marshal::{marshal_args, FromScript, Value};
use crate::module::{CompiledModule, FunctionRef, ModuleId, ScriptModule};
use crate::paths::SourceSearch;
use crate::refcount::Handle;
use crate::types::{ScriptTypeInfo, TypeRegistry};
use crate::watch::ScriptWatcher;

const DEADLINE_CHECK_INTERVAL: u64 = 128;

/// Host-side switch that stops a running script at its next operation.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::Release);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// How an entry point is run. `existed` is filled in by [`ScriptExecutor::run`].
#[derive(Debug, Clone)]
pub struct RunSetup {
    pub entry: String,
    pub timeout: Option<Duration>,
    pub abort: Option<AbortHandle>,
    pub print_errors: bool,
    pub error_on_missing: bool,
    pub existed: bool,
}

impl RunSetup {
    pub fn new(entry: impl Into<String>) -> Self {
        Self {
            entry: entry.into(),
            timeout: None,
            abort: None,
            print_errors: true,
            error_on_missing: true,
            existed: false,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_abort(mut self, abort: AbortHandle) -> Self {
        self.abort = Some(abort);
        self
    }

    pub fn quiet(mut self) -> Self {
        self.print_errors = false;
        self
    }

    pub fn allow_missing(mut self) -> Self {
        self.error_on_missing = false;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExecutorStats {
    pub builds: usize,
    pub reloads: usize,
    pub invocations: usize,
    pub modules: usize,
    pub compiled: usize,
}

#[derive(Debug, Default)]
struct Counters {
    builds: AtomicUsize,
    reloads: AtomicUsize,
    invocations: AtomicUsize,
}

struct ActiveCall {
    deadline: Option<(Instant, Duration)>,
    abort: Option<AbortHandle>,
    tripped: Option<AbortReason>,
}

thread_local! {
    static ACTIVE_CALLS: RefCell<Vec<ActiveCall>> = const { RefCell::new(Vec::new()) };
}

/// Registers a call's deadline and abort switch for the progress callback.
struct CallGuard {
    depth: usize,
}

impl CallGuard {
    fn enter(timeout: Option<Duration>, abort: Option<AbortHandle>) -> Self {
        let deadline = timeout.map(|limit| (Instant::now() + limit, limit));
        let depth = ACTIVE_CALLS.with(|calls| {
            let mut calls = calls.borrow_mut();
            calls.push(ActiveCall { deadline, abort, tripped: None });
            calls.len() - 1
        });
        Self { depth }
    }

    fn tripped(&self) -> Option<AbortReason> {
        ACTIVE_CALLS.with(|calls| calls.borrow().get(self.depth).and_then(|call| call.tripped))
    }
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        ACTIVE_CALLS.with(|calls| calls.borrow_mut().truncate(self.depth));
    }
}

fn check_progress(operations: u64) -> Option<Dynamic> {
    ACTIVE_CALLS.with(|calls| {
        let mut calls = calls.borrow_mut();
        for call in calls.iter_mut().rev() {
            if call.tripped.is_none() {
                if call.abort.as_ref().is_some_and(AbortHandle::is_aborted) {
                    call.tripped = Some(AbortReason::Requested);
                } else if operations % DEADLINE_CHECK_INTERVAL == 0 {
                    if let Some((deadline, limit)) = call.deadline {
                        if Instant::now() >= deadline {
                            call.tripped = Some(AbortReason::Timeout(limit));
                        }
                    }
                }
            }
            if let Some(reason) = call.tripped {
                return Some(Dynamic::from(reason.to_string()));
            }
        }
        None
    })
}

pub struct ExecutorBuilder {
    engine: Engine,
    types: TypeRegistry,
    restricted: HashMap<String, AccessFlags>,
    grants: AccessGrants,
    search: SourceSearch,
    hot_reload: bool,
    watch_poll: Duration,
    default_timeout: Option<Duration>,
}

impl Default for ExecutorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutorBuilder {
    pub fn new() -> Self {
        let defaults = ScriptingConfig::default();
        let mut engine = Engine::new();
        engine.set_max_call_levels(defaults.max_call_levels);
        engine.on_print(|text| tracing::info!(target: "scripting::print", "{text}"));
        engine.on_debug(|text, source, pos| {
            tracing::debug!(
                target: "scripting::print",
                source = source.unwrap_or("<script>"),
                line = pos.line().unwrap_or(0),
                "{text}"
            )
        });
        engine.on_progress(check_progress);
        engine.register_fn("log", |message: &str| tracing::info!(target: "scripting", "{message}"));
        let grants = AccessGrants::new();
        let file_grants = grants.clone();
        engine.register_fn(
            "read_text_file",
            move |context: NativeCallContext, path: &str| -> Result<String, Box<EvalAltResult>> {
                file_grants.require(&context, "read_text_file", AccessFlags::FULL_FILE_SYSTEM)?;
                fs::read_to_string(path).map_err(|err| format!("cannot read '{path}': {err}").into())
            },
        );
        events::register_script_api(&mut engine);
        game_module::register_script_api(&mut engine);

        let mut types = TypeRegistry::new();
        types.register_object::<GameModule>("GameModule", true);
        types.register_object::<Event>("Event", false);

        let restricted = HashMap::from([("read_text_file".to_string(), AccessFlags::FULL_FILE_SYSTEM)]);
        Self {
            engine,
            types,
            restricted,
            grants,
            search: SourceSearch::from_config(&defaults),
            hot_reload: false,
            watch_poll: defaults.watch_poll_interval(),
            default_timeout: defaults.call_timeout(),
        }
    }

    pub fn config(mut self, config: &ScriptingConfig) -> Self {
        self.engine.set_max_call_levels(config.max_call_levels);
        self.search = SourceSearch::from_config(config);
        self.hot_reload = config.hot_reload;
        self.watch_poll = config.watch_poll_interval();
        self.default_timeout = config.call_timeout();
        self
    }

    pub fn search(mut self, search: SourceSearch) -> Self {
        self.search = search;
        self
    }

    pub fn hot_reload(mut self, enabled: bool) -> Self {
        self.hot_reload = enabled;
        self
    }

    pub fn default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Makes `Handle<T>` visible to scripts as `name`.
    pub fn register_object<T: Send + Sync + 'static>(mut self, name: &str, supports_weak: bool) -> Self {
        self.types.register_object::<T>(name, supports_weak);
        self.engine.register_type_with_name::<Handle<T>>(name);
        self
    }

    pub fn with_engine(mut self, configure: impl FnOnce(&mut Engine)) -> Self {
        configure(&mut self.engine);
        self
    }

    /// Grants table for host functions that check access at call time through
    /// [`AccessGrants::require`].
    pub fn access_grants(&self) -> AccessGrants {
        self.grants.clone()
    }

    /// Modules calling `function` directly fail to build unless granted `access`. The
    /// function itself still has to call [`AccessGrants::require`].
    pub fn restrict(mut self, function: &str, access: AccessFlags) -> Self {
        self.restricted.insert(function.to_string(), access);
        self
    }

    pub fn build(self) -> Result<ScriptExecutor> {
        let watcher = if self.hot_reload {
            Some(ScriptWatcher::new(self.watch_poll).context("create script file watcher")?)
        } else {
            None
        };
        let shared = ExecutorShared {
            engine: self.engine,
            types: self.types,
            restricted: self.restricted,
            grants: self.grants,
            search: self.search,
            watcher,
            default_timeout: self.default_timeout,
            compiled: RwLock::new(HashMap::new()),
            modules: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            counters: Counters::default(),
        };
        tracing::debug!(
            target: "scripting",
            types = shared.types.len(),
            hot_reload = shared.watcher.is_some(),
            "script executor ready"
        );
        Ok(ScriptExecutor { inner: Arc::new(shared) })
    }
}

pub(crate) struct ExecutorShared {
    engine: Engine,
    types: TypeRegistry,
    restricted: HashMap<String, AccessFlags>,
    grants: AccessGrants,
    search: SourceSearch,
    watcher: Option<ScriptWatcher>,
    default_timeout: Option<Duration>,
    compiled: RwLock<HashMap<String, Arc<CompiledModule>>>,
    modules: Mutex<HashMap<ModuleId, Handle<ScriptModule>>>,
    next_id: AtomicU64,
    counters: Counters,
}

impl ExecutorShared {
    pub(crate) fn engine(&self) -> &Engine {
        &self.engine
    }

    pub(crate) fn search(&self) -> &SourceSearch {
        &self.search
    }

    pub(crate) fn restricted(&self) -> &HashMap<String, AccessFlags> {
        &self.restricted
    }

    pub(crate) fn watcher(&self) -> Option<&ScriptWatcher> {
        self.watcher.as_ref()
    }

    pub(crate) fn register_compiled(&self, compiled: Arc<CompiledModule>) {
        let mut table = self.compiled.write().unwrap_or_else(PoisonError::into_inner);
        self.grants.grant(compiled.internal_name(), compiled.access());
        table.insert(compiled.internal_name().to_string(), compiled);
    }

    pub(crate) fn remove_compiled(&self, internal_name: &str) -> bool {
        let mut table = self.compiled.write().unwrap_or_else(PoisonError::into_inner);
        self.grants.revoke(internal_name);
        table.remove(internal_name).is_some()
    }

    pub(crate) fn is_compiled(&self, internal_name: &str) -> bool {
        self.compiled.read().unwrap_or_else(PoisonError::into_inner).contains_key(internal_name)
    }

    pub(crate) fn note_build(&self) {
        self.counters.builds.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_reload(&self) {
        self.counters.reloads.fetch_add(1, Ordering::Relaxed);
    }

    fn lock_modules(&self) -> MutexGuard<'_, HashMap<ModuleId, Handle<ScriptModule>>> {
        self.modules.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Owner of the script engine and module registry. Cheap to clone.
#[derive(Clone)]
pub struct ScriptExecutor {
    inner: Arc<ExecutorShared>,
}

impl ScriptExecutor {
    pub fn builder() -> ExecutorBuilder {
        ExecutorBuilder::new()
    }

    pub fn from_config(config: &ScriptingConfig) -> Result<Self> {
        ExecutorBuilder::new().config(config).build()
    }

    pub(crate) fn from_shared(inner: Arc<ExecutorShared>) -> Self {
        Self { inner }
    }

    pub fn engine(&self) -> &Engine {
        &self.inner.engine
    }

    pub fn types(&self) -> &TypeRegistry {
        &self.inner.types
    }

    pub fn resolve_type_name(&self, name: &str) -> Option<&ScriptTypeInfo> {
        self.inner.types.resolve_name(name)
    }

    pub fn search(&self) -> &SourceSearch {
        &self.inner.search
    }

    pub fn watcher(&self) -> Option<&ScriptWatcher> {
        self.inner.watcher.as_ref()
    }

    /// Applies queued file changes. Returns the number of modules reloaded.
    pub fn poll_file_changes(&self) -> usize {
        self.inner.watcher.as_ref().map(ScriptWatcher::poll).unwrap_or(0)
    }

    pub fn stats(&self) -> ExecutorStats {
        ExecutorStats {
            builds: self.inner.counters.builds.load(Ordering::Relaxed),
            reloads: self.inner.counters.reloads.load(Ordering::Relaxed),
            invocations: self.inner.counters.invocations.load(Ordering::Relaxed),
            modules: self.inner.lock_modules().len(),
            compiled: self.inner.compiled.read().unwrap_or_else(PoisonError::into_inner).len(),
        }
    }

    pub fn create_module(&self, name: &str, source: &str) -> Handle<ScriptModule> {
        let id = ModuleId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.create_module_with_id(name, source, id)
    }

    /// Allocates the module record. Nothing is compiled until the module is first used.
    pub fn create_module_with_id(&self, name: &str, source: &str, id: ModuleId) -> Handle<ScriptModule> {
        let module = Handle::new(ScriptModule::new(id, name, source, Arc::downgrade(&self.inner)));
        module.bind_self(Handle::downgrade(&module));
        let replaced = self.inner.lock_modules().insert(id, module.clone());
        if let Some(replaced) = replaced {
            tracing::warn!(
                target: "scripting",
                module = %replaced.name(),
                id = %id,
                "module id reused, previous module released"
            );
            replaced.release();
        }
        tracing::debug!(target: "scripting", module = name, id = %id, "module created");
        module
    }

    pub fn module(&self, id: ModuleId) -> Option<Handle<ScriptModule>> {
        self.inner.lock_modules().get(&id).cloned()
    }

    pub fn delete_module(&self, id: ModuleId) -> bool {
        let removed = self.inner.lock_modules().remove(&id);
        match removed {
            Some(module) => {
                module.release();
                true
            }
            None => false,
        }
    }

    /// Removes the module only when the registry holds its last reference.
    pub fn delete_module_if_unreferenced(&self, id: ModuleId) -> bool {
        let removed = {
            let mut modules = self.inner.lock_modules();
            match modules.get(&id) {
                Some(module) if Handle::ref_count(module) == 1 => modules.remove(&id),
                _ => None,
            }
        };
        match removed {
            Some(module) => {
                module.release();
                true
            }
            None => false,
        }
    }

    /// Invalidates a compiled module out-of-band. Its owner becomes `Discarded`.
    pub fn discard_compiled(&self, internal_name: &str) -> bool {
        self.inner.remove_compiled(internal_name)
    }

    /// Looks up `setup.entry` in `module` and invokes it.
    pub fn run<R: FromScript>(
        &self,
        module: &ScriptModule,
        setup: &mut RunSetup,
        args: &[Value],
    ) -> Result<Option<R>, InvokeError> {
        let function = match module.function(&setup.entry, args.len()) {
            Ok(function) => function,
            Err(err) => {
                setup.existed = false;
                let missing = matches!(err, InvokeError::FunctionNotFound(_));
                if !missing || setup.error_on_missing {
                    tracing::error!(
                        target: "scripting",
                        module = %module.name(),
                        "cannot run '{}': {err}",
                        setup.entry
                    );
                }
                return Err(err);
            }
        };
        setup.existed = true;
        self.invoke(&function, args, setup)
    }

    pub fn invoke<R: FromScript>(
        &self,
        function: &FunctionRef,
        args: &[Value],
        setup: &RunSetup,
    ) -> Result<Option<R>, InvokeError> {
        self.call(function, None, args, setup)
    }

    /// Invokes `function` with `this` bound to `target`.
    pub fn invoke_method<R: FromScript>(
        &self,
        function: &FunctionRef,
        target: &mut Dynamic,
        args: &[Value],
        setup: &RunSetup,
    ) -> Result<Option<R>, InvokeError> {
        self.call(function, Some(target), args, setup)
    }

    fn call<R: FromScript>(
        &self,
        function: &FunctionRef,
        target: Option<&mut Dynamic>,
        args: &[Value],
        setup: &RunSetup,
    ) -> Result<Option<R>, InvokeError> {
        let arity = function.arity();
        if args.len() < arity {
            return Err(InvokeError::ArgumentCount {
                function: function.name().to_string(),
                expected: arity,
                provided: args.len(),
            });
        }
        if args.len() > arity {
            tracing::trace!(
                target: "scripting",
                function = function.name(),
                "ignoring {} extra argument(s)",
                args.len() - arity
            );
        }
        let arguments = marshal_args(&args[..arity], &self.inner.types).map_err(|(index, source)| {
            InvokeError::TypeMismatch { function: function.name().to_string(), index, source }
        })?;

        self.inner.counters.invocations.fetch_add(1, Ordering::Relaxed);
        let guard = CallGuard::enter(setup.timeout.or(self.inner.default_timeout), setup.abort.clone());
        let mut scope = Scope::new();
        let ast = function.module().ast();
        let result = match target {
            Some(target) => {
                let options = CallFnOptions::new().eval_ast(false).rewind_scope(true).bind_this_ptr(target);
                self.inner.engine.call_fn_with_options::<Dynamic>(options, &mut scope, ast, function.name(), arguments)
            }
            None => {
                let options = CallFnOptions::new().eval_ast(false).rewind_scope(true);
                self.inner.engine.call_fn_with_options::<Dynamic>(options, &mut scope, ast, function.name(), arguments)
            }
        };
        let tripped = guard.tripped();
        drop(guard);

        match result {
            Ok(value) => unmarshal_return(function, value),
            Err(err) => Err(self.translate_error(function, *err, tripped, setup)),
        }
    }

    fn translate_error(
        &self,
        function: &FunctionRef,
        err: EvalAltResult,
        tripped: Option<AbortReason>,
        setup: &RunSetup,
    ) -> InvokeError {
        let exception = script_exception(function, err);
        let terminated = exception.terminated;
        if let Some(reason) = tripped.or(terminated.then_some(AbortReason::Requested)) {
            tracing::warn!(target: "scripting", function = function.name(), "script call {reason}");
            return InvokeError::Aborted { function: function.name().to_string(), reason };
        }
        if setup.print_errors {
            tracing::error!(target: "scripting", "{}", exception.exception.report());
        }
        InvokeError::Exception(exception.exception)
    }
}

fn unmarshal_return<R: FromScript>(function: &FunctionRef, value: Dynamic) -> Result<Option<R>, InvokeError> {
    if value.is_unit() {
        if !R::is_unit() {
            tracing::warn!(
                target: "scripting",
                function = function.name(),
                "script returned nothing but {} was expected",
                std::any::type_name::<R>()
            );
        }
        return Ok(None);
    }
    R::from_script(value)
        .map(Some)
        .map_err(|source| InvokeError::ReturnTypeMismatch { function: function.name().to_string(), source })
}

struct TranslatedError {
    exception: ScriptException,
    terminated: bool,
}

fn stack_frame(compiled: &CompiledModule, function: &str, position: Position) -> StackFrame {
    let kind = if compiled.has_function(function) { FrameKind::Script } else { FrameKind::Native };
    let located = position.line().and_then(|line| compiled.lines().locate(line));
    let (file, line) = match located {
        Some((file, line)) => (file.to_string(), Some(line)),
        None => (compiled.internal_name().to_string(), position.line()),
    };
    StackFrame { function: function.to_string(), file, line, kind }
}

/// Unwinds nested call errors into a stack, innermost frame first.
fn script_exception(function: &FunctionRef, err: EvalAltResult) -> TranslatedError {
    let compiled = function.module();
    let mut chain: Vec<(String, Position)> = Vec::new();
    let mut current = err;
    let mut innermost = loop {
        match current {
            EvalAltResult::ErrorInFunctionCall(name, _, inner, call_site) => {
                chain.push((name, call_site));
                current = *inner;
            }
            other => break other,
        }
    };
    let terminated = matches!(innermost, EvalAltResult::ErrorTerminated(..));
    let position = innermost.position();
    innermost.clear_position();

    let mut frames = Vec::with_capacity(chain.len() + 1);
    if chain.first().map(|(name, _)| name.as_str()) != Some(function.name()) {
        let line = chain.first().map(|(_, call_site)| *call_site).unwrap_or(position);
        frames.push(stack_frame(compiled, function.name(), line));
    }
    for (index, (name, _)) in chain.iter().enumerate() {
        let line = chain.get(index + 1).map(|(_, call_site)| *call_site).unwrap_or(position);
        frames.push(stack_frame(compiled, name, line));
    }
    frames.reverse();

    TranslatedError {
        exception: ScriptException {
            message: innermost.to_string(),
            function: function.name().to_string(),
            stack: frames,
        },
        terminated,
    }
}
