use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::access::{AccessFlags, AccessParseError};

#[derive(Debug, Error)]
pub enum DescriptionError {
    #[error("cannot read description: {0}")]
    Read(#[from] io::Error),
    #[error("malformed description: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("expected exactly one described object, found {0}")]
    ObjectCount(usize),
    #[error("described object has an empty name")]
    EmptyName,
    #[error("'{0}' has no properties")]
    MissingProperties(String),
    #[error("'{0}' lists no source files")]
    MissingSourceFiles(String),
    #[error("'{name}' has invalid ExtraAccess: {source}")]
    Access {
        name: String,
        #[source]
        source: AccessParseError,
    },
}

#[derive(Debug, Deserialize)]
struct DescriptionFile {
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    objects: Vec<DescribedObject>,
}

#[derive(Debug, Deserialize)]
struct DescribedObject {
    #[serde(default)]
    name: String,
    #[serde(default)]
    properties: Option<DescribedProperties>,
    #[serde(default)]
    sourcefiles: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribedProperties {
    #[serde(default)]
    extra_access: Option<String>,
    #[serde(default)]
    imports: Vec<String>,
    #[serde(default)]
    exports: Vec<String>,
    #[serde(default)]
    version: Option<String>,
}

/// Validated contents of a `*.kgm` game module description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleDescription {
    pub path: PathBuf,
    pub name: String,
    pub version: String,
    pub extra_access: AccessFlags,
    pub imports: Vec<String>,
    pub exports: Vec<String>,
    /// The first entry is the primary source file.
    pub source_files: Vec<String>,
}

impl ModuleDescription {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, DescriptionError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        Self::parse(path, &contents)
    }

    pub fn parse(path: &Path, contents: &str) -> Result<Self, DescriptionError> {
        let file: DescriptionFile = serde_json::from_str(contents)?;
        if file.objects.len() != 1 {
            return Err(DescriptionError::ObjectCount(file.objects.len()));
        }
        let Some(object) = file.objects.into_iter().next() else {
            return Err(DescriptionError::ObjectCount(0));
        };
        let name = object.name.trim().to_string();
        if name.is_empty() {
            return Err(DescriptionError::EmptyName);
        }
        let properties = object.properties.ok_or_else(|| DescriptionError::MissingProperties(name.clone()))?;
        let source_files: Vec<String> = object
            .sourcefiles
            .unwrap_or_default()
            .into_iter()
            .map(|file| file.trim().to_string())
            .filter(|file| !file.is_empty())
            .collect();
        if source_files.is_empty() {
            return Err(DescriptionError::MissingSourceFiles(name));
        }
        let extra_access = match properties.extra_access.as_deref().map(str::trim) {
            None | Some("") => AccessFlags::empty(),
            Some(text) => {
                AccessFlags::parse(text).map_err(|source| DescriptionError::Access { name: name.clone(), source })?
            }
        };
        let version = properties.version.or(file.version).unwrap_or_else(|| "0".to_string());
        Ok(Self {
            path: path.to_path_buf(),
            name,
            version,
            extra_access,
            imports: properties.imports,
            exports: properties.exports,
            source_files,
        })
    }

    /// Directory relative source names are resolved against first.
    pub fn base_dir(&self) -> Option<&Path> {
        self.path.parent()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Result<ModuleDescription, DescriptionError> {
        ModuleDescription::parse(Path::new("mods/foo.kgm"), text)
    }

    #[test]
    fn parses_full_description() {
        let description = parse(
            r#"{ "version": "1.0",
                 "objects": [ { "name": "Foo",
                                "properties": { "ExtraAccess": "FullFileSystem",
                                                "Imports": ["Base"],
                                                "Exports": ["foo_public.rhai"],
                                                "Version": "2.1" },
                                "sourcefiles": ["foo", "foo_helpers.rhai"] } ] }"#,
        )
        .unwrap();
        assert_eq!(description.name, "Foo");
        assert_eq!(description.version, "2.1");
        assert_eq!(description.extra_access, AccessFlags::FULL_FILE_SYSTEM);
        assert_eq!(description.imports, vec!["Base"]);
        assert_eq!(description.exports, vec!["foo_public.rhai"]);
        assert_eq!(description.source_files, vec!["foo", "foo_helpers.rhai"]);
        assert_eq!(description.base_dir(), Some(Path::new("mods")));
    }

    #[test]
    fn version_falls_back_to_file_version() {
        let description =
            parse(r#"{ "version": "1.0", "objects": [ { "name": "Foo", "properties": {}, "sourcefiles": ["foo"] } ] }"#)
                .unwrap();
        assert_eq!(description.version, "1.0");
        assert!(description.extra_access.is_empty());
    }

    #[test]
    fn rejects_structural_problems() {
        assert!(matches!(parse(r#"{ "objects": [] }"#), Err(DescriptionError::ObjectCount(0))));
        assert!(matches!(
            parse(
                r#"{ "objects": [
                    { "name": "A", "properties": {}, "sourcefiles": ["a"] },
                    { "name": "B", "properties": {}, "sourcefiles": ["b"] }
                ] }"#
            ),
            Err(DescriptionError::ObjectCount(2))
        ));
        assert!(matches!(
            parse(r#"{ "objects": [ { "name": "Foo", "sourcefiles": ["foo"] } ] }"#),
            Err(DescriptionError::MissingProperties(_))
        ));
        assert!(matches!(
            parse(r#"{ "objects": [ { "name": "Foo", "properties": {} } ] }"#),
            Err(DescriptionError::MissingSourceFiles(_))
        ));
        assert!(matches!(
            parse(r#"{ "objects": [ { "name": "Foo", "properties": {}, "sourcefiles": [] } ] }"#),
            Err(DescriptionError::MissingSourceFiles(_))
        ));
        assert!(matches!(parse("not json"), Err(DescriptionError::Parse(_))));
    }

    #[test]
    fn rejects_unknown_access_groups() {
        let err = parse(
            r#"{ "objects": [
                { "name": "Foo", "properties": { "ExtraAccess": "Network" }, "sourcefiles": ["foo"] }
            ] }"#,
        )
        .unwrap_err();
        assert!(matches!(err, DescriptionError::Access { .. }));
    }
}
