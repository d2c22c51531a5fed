use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::config::ScriptingConfig;

/// Directory-based lookup for script sources and module description files.
#[derive(Debug, Clone)]
pub struct SourceSearch {
    roots: Vec<PathBuf>,
    source_extension: String,
}

impl Default for SourceSearch {
    fn default() -> Self {
        Self::from_config(&ScriptingConfig::default())
    }
}

impl SourceSearch {
    pub fn new(roots: Vec<PathBuf>, source_extension: impl Into<String>) -> Self {
        Self { roots, source_extension: source_extension.into() }
    }

    pub fn from_config(config: &ScriptingConfig) -> Self {
        Self::new(config.script_roots.clone(), config.source_extension.clone())
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    pub fn add_root(&mut self, root: impl Into<PathBuf>) {
        let root = root.into();
        if !self.roots.contains(&root) {
            self.roots.push(root);
        }
    }

    pub fn source_extension(&self) -> &str {
        &self.source_extension
    }

    fn candidates(&self, name: &str) -> Vec<PathBuf> {
        let path = PathBuf::from(name);
        if path.extension().is_some() {
            vec![path]
        } else {
            vec![path.with_extension(&self.source_extension), path]
        }
    }

    /// Resolves a source name, with or without extension, relative to `relative_to` first and then the roots.
    pub fn find_source(&self, name: &str, relative_to: Option<&Path>) -> Option<PathBuf> {
        let candidates = self.candidates(name);
        if Path::new(name).is_absolute() {
            return candidates.into_iter().find(|candidate| candidate.is_file());
        }
        let bases = relative_to.into_iter().map(Path::to_path_buf).chain(self.roots.iter().cloned());
        for base in bases {
            for candidate in &candidates {
                let joined = base.join(candidate);
                if joined.is_file() {
                    return Some(joined);
                }
            }
        }
        None
    }

    /// `./` targets resolve against the working directory, everything else against the including file.
    pub fn resolve_include(&self, target: &str, including_file: &Path) -> Option<PathBuf> {
        if let Some(stripped) = target.strip_prefix("./") {
            let cwd = env::current_dir().ok()?;
            return self
                .candidates(stripped)
                .into_iter()
                .map(|candidate| cwd.join(candidate))
                .find(|path| path.is_file());
        }
        self.find_source(target, including_file.parent())
    }

    /// Every file under the roots carrying `extension`, sorted.
    pub fn collect_files(&self, extension: &str) -> Result<Vec<PathBuf>> {
        let mut out = Vec::new();
        for root in &self.roots {
            if root.exists() {
                collect_with_extension(root, extension, &mut out)?;
            }
        }
        out.sort();
        out.dedup();
        Ok(out)
    }
}

fn collect_with_extension(root: &Path, extension: &str, out: &mut Vec<PathBuf>) -> Result<()> {
    if root.is_file() {
        if root.extension().and_then(|ext| ext.to_str()) == Some(extension) {
            out.push(root.to_path_buf());
        }
        return Ok(());
    }
    for entry in fs::read_dir(root).with_context(|| format!("Reading '{}'", root.display()))? {
        let path = entry?.path();
        if path.is_dir() {
            collect_with_extension(&path, extension, out)?;
        } else if path.extension().and_then(|ext| ext.to_str()) == Some(extension) {
            out.push(path);
        }
    }
    Ok(())
}

pub(crate) fn normalize_path(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else if let Ok(cwd) = env::current_dir() {
        cwd.join(path)
    } else {
        path.to_path_buf()
    };
    match fs::canonicalize(&absolute) {
        Ok(canonical) => canonical,
        Err(_) => {
            if let Some(parent) = absolute.parent() {
                if let Ok(parent_canon) = fs::canonicalize(parent) {
                    if let Some(name) = absolute.file_name() {
                        return parent_canon.join(name);
                    }
                    return parent_canon;
                }
            }
            absolute
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn finds_sources_without_extension() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("main.rhai"), "fn main() {}").unwrap();
        let search = SourceSearch::new(vec![dir.path().to_path_buf()], "rhai");
        assert_eq!(search.find_source("main", None), Some(dir.path().join("main.rhai")));
        assert_eq!(search.find_source("main.rhai", None), Some(dir.path().join("main.rhai")));
        assert!(search.find_source("missing", None).is_none());
    }

    #[test]
    fn relative_directory_wins_over_roots() {
        let root = TempDir::new().unwrap();
        let local = TempDir::new().unwrap();
        fs::write(root.path().join("util.rhai"), "").unwrap();
        fs::write(local.path().join("util.rhai"), "").unwrap();
        let search = SourceSearch::new(vec![root.path().to_path_buf()], "rhai");
        assert_eq!(search.find_source("util", Some(local.path())), Some(local.path().join("util.rhai")));
        let including = local.path().join("main.rhai");
        assert_eq!(search.resolve_include("util.rhai", &including), Some(local.path().join("util.rhai")));
    }

    #[test]
    fn collects_nested_files_by_extension() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("nested")).unwrap();
        fs::write(dir.path().join("a.kgm"), "{}").unwrap();
        fs::write(dir.path().join("nested/b.kgm"), "{}").unwrap();
        fs::write(dir.path().join("nested/c.rhai"), "").unwrap();
        let search = SourceSearch::new(vec![dir.path().to_path_buf()], "rhai");
        let found = search.collect_files("kgm").unwrap();
        assert_eq!(found, vec![dir.path().join("a.kgm"), dir.path().join("nested/b.kgm")]);
    }
}
