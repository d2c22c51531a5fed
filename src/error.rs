use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::description::DescriptionError;
use crate::marshal::MarshalError;
use crate::module::BuildState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Script,
    Native,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFrame {
    pub function: String,
    pub file: String,
    pub line: Option<usize>,
    pub kind: FrameKind,
}

impl fmt::Display for StackFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            FrameKind::Script => "script",
            FrameKind::Native => "native",
        };
        match self.line {
            Some(line) => write!(f, "{} ({kind}) at {}:{line}", self.function, self.file),
            None => write!(f, "{} ({kind}) in {}", self.function, self.file),
        }
    }
}

/// Uncaught script error with the call stack at the throw site, innermost frame first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptException {
    pub message: String,
    pub function: String,
    pub stack: Vec<StackFrame>,
}

impl ScriptException {
    pub fn origin(&self) -> Option<&StackFrame> {
        self.stack.first()
    }

    pub fn report(&self) -> String {
        let mut out = format!("script exception in '{}': {}", self.function, self.message);
        for frame in &self.stack {
            out.push_str("\n    ");
            out.push_str(&frame.to_string());
        }
        out
    }
}

impl fmt::Display for ScriptException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.origin() {
            Some(frame) => write!(f, "{} ({frame})", self.message),
            None => f.write_str(&self.message),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    Timeout(Duration),
    Requested,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::Timeout(limit) => write!(f, "timed out after {limit:?}"),
            AbortReason::Requested => f.write_str("aborted by host"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum InvokeError {
    #[error("script function '{0}' not found")]
    FunctionNotFound(String),
    #[error("module '{module}' is not usable ({state:?})")]
    ModuleUnusable { module: String, state: BuildState },
    #[error("'{function}' takes {expected} argument(s), {provided} provided")]
    ArgumentCount { function: String, expected: usize, provided: usize },
    #[error("argument {index} of '{function}': {source}")]
    TypeMismatch {
        function: String,
        index: usize,
        #[source]
        source: MarshalError,
    },
    #[error("return value of '{function}': {source}")]
    ReturnTypeMismatch {
        function: String,
        #[source]
        source: MarshalError,
    },
    #[error("{0}")]
    Exception(ScriptException),
    #[error("call to '{function}' {reason}")]
    Aborted { function: String, reason: AbortReason },
    #[error("callback is empty")]
    EmptyCallback,
    #[error("callback target has been destroyed")]
    TargetGone,
    #[error("script executor is no longer available")]
    ExecutorGone,
}

impl InvokeError {
    pub fn is_abort(&self) -> bool {
        matches!(self, InvokeError::Aborted { .. })
    }

    pub fn exception(&self) -> Option<&ScriptException> {
        match self {
            InvokeError::Exception(exception) => Some(exception),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("module has no source segments")]
    Empty,
    #[error("failed to read '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{file}:{line}: cannot resolve include \"{target}\"")]
    Include { file: String, line: usize, target: String },
    #[error("{file}:{line}: '{function}' requires {required} access")]
    Access { file: String, line: usize, function: String, required: String },
    #[error("{file}:{line}: {message}")]
    Compile { file: String, line: usize, message: String, source_line: String },
}

/// Every failure of [`GameModuleLoader::load`](crate::loader::GameModuleLoader::load).
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("game module '{0}' not found")]
    NotFound(String),
    #[error("invalid module description '{path}': {source}")]
    InvalidDescription {
        path: PathBuf,
        #[source]
        source: DescriptionError,
    },
    #[error("circular dependency: '{module}' requested by '{requested_by}' while it is initializing")]
    CircularDependency { module: String, requested_by: String },
    #[error("game module '{0}' failed to initialize")]
    InitFailed(String),
}
