use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::events::ListenerKind;
use crate::module::{CompiledModule, FunctionRef};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerAnnotation {
    pub kind: ListenerKind,
    pub generic_type: Option<String>,
    pub metadata: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AnnotationError {
    #[error("unknown listener name '{0}'")]
    UnknownListener(String),
    #[error("generic listener without @Type")]
    MissingType,
    #[error("malformed annotation '{0}'")]
    Malformed(String),
}

fn strip_comment_leader(line: &str) -> &str {
    let trimmed = line.trim();
    let trimmed = trimmed.strip_prefix("///").or_else(|| trimmed.strip_prefix("/**")).unwrap_or(trimmed);
    let trimmed = trimmed.strip_suffix("*/").unwrap_or(trimmed);
    trimmed.trim().trim_start_matches('*').trim()
}

/// Reads `@Key="value"` and returns the value with the remaining text.
fn quoted_value<'a>(text: &'a str, key: &str) -> Option<(&'a str, &'a str)> {
    let rest = text.strip_prefix(key)?.trim_start().strip_prefix('=')?.trim_start().strip_prefix('"')?;
    let end = rest.find('"')?;
    Some((&rest[..end], &rest[end + 1..]))
}

/// Parses one doc-comment line. Lines that are not `@Listener` annotations yield `Ok(None)`.
pub fn parse_annotation(line: &str) -> Result<Option<ListenerAnnotation>, AnnotationError> {
    let text = strip_comment_leader(line);
    if !text.starts_with("@Listener") {
        return Ok(None);
    }
    let (name, rest) = quoted_value(text, "@Listener").ok_or_else(|| AnnotationError::Malformed(text.to_string()))?;
    let kind = ListenerKind::from_name(name).ok_or_else(|| AnnotationError::UnknownListener(name.to_string()))?;
    let mut rest = rest.trim_start().trim_start_matches(',').trim_start();
    let mut generic_type = None;
    if kind == ListenerKind::Generic {
        let (event_type, after) = quoted_value(rest, "@Type").ok_or(AnnotationError::MissingType)?;
        if event_type.is_empty() {
            return Err(AnnotationError::MissingType);
        }
        generic_type = Some(event_type.to_string());
        rest = after.trim_start().trim_start_matches(',').trim_start();
    }
    Ok(Some(ListenerAnnotation { kind, generic_type, metadata: rest.trim_end().to_string() }))
}

/// Script function discovered through a listener annotation.
#[derive(Clone)]
pub struct ListenerEntry {
    pub function: FunctionRef,
    pub kind: ListenerKind,
    pub generic_type: Option<String>,
    pub metadata: String,
}

impl ListenerEntry {
    pub fn listener_name(&self) -> &str {
        self.kind.name()
    }

    fn key(&self) -> String {
        listener_key(self.kind.name(), self.generic_type.as_deref())
    }
}

impl fmt::Debug for ListenerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerEntry")
            .field("function", &self.function.name())
            .field("kind", &self.kind)
            .field("generic_type", &self.generic_type)
            .field("metadata", &self.metadata)
            .finish()
    }
}

fn listener_key(name: &str, generic_type: Option<&str>) -> String {
    match generic_type {
        Some(event_type) => format!("Generic:{event_type}"),
        None => name.to_string(),
    }
}

#[derive(Debug, Clone, Default)]
pub struct ListenerIndex {
    entries: HashMap<String, ListenerEntry>,
    order: Vec<String>,
}

impl ListenerIndex {
    /// Scans every public function's doc comments. Bad annotations are logged and skipped.
    pub fn build(compiled: &Arc<CompiledModule>) -> Self {
        let mut index = Self::default();
        for signature in compiled.functions().iter().filter(|signature| signature.public) {
            for line in signature.comments.iter().flat_map(|comment| comment.lines()) {
                let annotation = match parse_annotation(line) {
                    Ok(Some(annotation)) => annotation,
                    Ok(None) => continue,
                    Err(err) => {
                        tracing::warn!(
                            target: "scripting::module",
                            module = compiled.internal_name(),
                            function = %signature.name,
                            "skipping listener annotation: {err}"
                        );
                        continue;
                    }
                };
                let entry = ListenerEntry {
                    function: FunctionRef::new(compiled.clone(), &signature.name, signature.params.len()),
                    kind: annotation.kind,
                    generic_type: annotation.generic_type,
                    metadata: annotation.metadata,
                };
                let key = entry.key();
                if index.entries.contains_key(&key) {
                    tracing::warn!(
                        target: "scripting::module",
                        module = compiled.internal_name(),
                        function = %signature.name,
                        "duplicate listener '{key}' ignored"
                    );
                    continue;
                }
                index.order.push(key.clone());
                index.entries.insert(key, entry);
                break;
            }
        }
        index
    }

    pub fn find(&self, name: &str, generic_type: Option<&str>) -> Option<&ListenerEntry> {
        self.entries.get(&listener_key(name, generic_type))
    }

    /// Entries in declaration order.
    pub fn entries(&self) -> impl Iterator<Item = &ListenerEntry> {
        self.order.iter().filter_map(|key| self.entries.get(key))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
