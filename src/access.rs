use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use bitflags::bitflags;
use rhai::{EvalAltResult, NativeCallContext};
use thiserror::Error;

bitflags! {
    /// Groups of host functions a script module may call.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AccessFlags: u32 {
        const BUILTIN = 0b0001;
        const DEFAULT_ENGINE = 0b0010;
        const FULL_FILE_SYSTEM = 0b0100;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AccessParseError {
    #[error("empty access group in '{0}'")]
    EmptyPart(String),
    #[error("unknown access group '{part}' in '{input}'")]
    Unknown { part: String, input: String },
}

impl AccessFlags {
    pub const NOTHING: AccessFlags = AccessFlags::empty();

    /// Mask every script module receives before any extra access is granted.
    pub fn default_module() -> Self {
        AccessFlags::BUILTIN | AccessFlags::DEFAULT_ENGINE
    }

    /// Parses `"Name+Name"` lists. `"Nothing"` is the empty mask.
    pub fn parse(input: &str) -> Result<Self, AccessParseError> {
        let mut flags = AccessFlags::empty();
        for part in input.split('+') {
            let trimmed = part.trim();
            if trimmed.is_empty() {
                return Err(AccessParseError::EmptyPart(input.to_string()));
            }
            flags |= Self::from_group_name(trimmed)
                .ok_or_else(|| AccessParseError::Unknown { part: trimmed.to_string(), input: input.to_string() })?;
        }
        Ok(flags)
    }

    fn from_group_name(name: &str) -> Option<Self> {
        match name {
            "Nothing" => Some(AccessFlags::empty()),
            "Builtin" => Some(AccessFlags::BUILTIN),
            "DefaultEngine" => Some(AccessFlags::DEFAULT_ENGINE),
            "FullFileSystem" => Some(AccessFlags::FULL_FILE_SYSTEM),
            _ => None,
        }
    }

    pub fn group_names(self) -> Vec<&'static str> {
        let mut names = Vec::new();
        if self.contains(AccessFlags::BUILTIN) {
            names.push("Builtin");
        }
        if self.contains(AccessFlags::DEFAULT_ENGINE) {
            names.push("DefaultEngine");
        }
        if self.contains(AccessFlags::FULL_FILE_SYSTEM) {
            names.push("FullFileSystem");
        }
        names
    }
}

impl fmt::Display for AccessFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("Nothing");
        }
        f.write_str(&self.group_names().join("+"))
    }
}

/// Access granted to each compiled module, keyed by the source name its AST carries.
/// Restricted host functions look up their calling module here on every call.
#[derive(Debug, Clone, Default)]
pub struct AccessGrants {
    grants: Arc<RwLock<HashMap<String, AccessFlags>>>,
}

impl AccessGrants {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn grant(&self, source: &str, access: AccessFlags) {
        self.grants.write().unwrap_or_else(PoisonError::into_inner).insert(source.to_string(), access);
    }

    pub(crate) fn revoke(&self, source: &str) {
        self.grants.write().unwrap_or_else(PoisonError::into_inner).remove(source);
    }

    /// Code outside any compiled module is granted nothing.
    pub fn granted(&self, source: Option<&str>) -> AccessFlags {
        let grants = self.grants.read().unwrap_or_else(PoisonError::into_inner);
        source.and_then(|source| grants.get(source).copied()).unwrap_or(AccessFlags::empty())
    }

    /// Fails the native call unless the calling module holds `required`.
    pub fn require(
        &self,
        context: &NativeCallContext,
        function: &str,
        required: AccessFlags,
    ) -> Result<(), Box<EvalAltResult>> {
        let source = context.call_source();
        let granted = self.granted(source);
        if granted.contains(required) {
            return Ok(());
        }
        let missing = required - granted;
        tracing::warn!(
            target: "scripting",
            module = source.unwrap_or("<host>"),
            function,
            "call denied, {missing} access required"
        );
        let message = format!("'{function}' requires {missing} access");
        Err(EvalAltResult::ErrorRuntime(message.into(), context.call_position()).into())
    }
}
