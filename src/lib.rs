pub mod access;
pub mod callback;
pub mod config;
pub mod description;
pub mod error;
pub mod events;
pub mod executor;
pub mod game_module;
pub mod listeners;
pub mod loader;
pub mod logging;
pub mod marshal;
pub mod module;
pub mod paths;
pub mod refcount;
pub mod source;
pub mod types;
pub mod watch;

pub use access::{AccessFlags, AccessGrants};
pub use callback::{NonOwningCallback, ScriptCallback};
pub use config::ScriptingConfig;
pub use description::ModuleDescription;
pub use error::{AbortReason, BuildError, InvokeError, LoadError, ScriptException, StackFrame};
pub use events::{Event, EventKind, EventType, ListenerKind};
pub use executor::{AbortHandle, ExecutorBuilder, ExecutorStats, RunSetup, ScriptExecutor};
pub use game_module::{EventOutcome, GameModule, Subscription};
pub use loader::GameModuleLoader;
pub use marshal::{FromScript, Value};
pub use module::{BuildState, FunctionRef, ModuleId, ScriptModule, MODULE_BUILD_LOCK};
pub use refcount::{Handle, WeakHandle};
pub use types::TypeRegistry;
