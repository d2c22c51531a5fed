use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct ScriptingConfig {
    #[serde(default = "ScriptingConfig::default_script_roots")]
    pub script_roots: Vec<PathBuf>,
    #[serde(default = "ScriptingConfig::default_module_extension")]
    pub module_extension: String,
    #[serde(default = "ScriptingConfig::default_source_extension")]
    pub source_extension: String,
    #[serde(default = "ScriptingConfig::default_hot_reload")]
    pub hot_reload: bool,
    #[serde(default = "ScriptingConfig::default_watch_poll_ms")]
    pub watch_poll_ms: u64,
    #[serde(default)]
    pub call_timeout_ms: Option<u64>,
    #[serde(default = "ScriptingConfig::default_max_call_levels")]
    pub max_call_levels: usize,
    #[serde(default = "ScriptingConfig::default_log_filter")]
    pub log_filter: String,
}

impl ScriptingConfig {
    fn default_script_roots() -> Vec<PathBuf> {
        vec![PathBuf::from("assets/scripts")]
    }

    fn default_module_extension() -> String {
        "kgm".to_string()
    }

    fn default_source_extension() -> String {
        "rhai".to_string()
    }

    const fn default_hot_reload() -> bool {
        true
    }

    const fn default_watch_poll_ms() -> u64 {
        300
    }

    const fn default_max_call_levels() -> usize {
        64
    }

    fn default_log_filter() -> String {
        "info".to_string()
    }

    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_ms.map(Duration::from_millis)
    }

    pub fn watch_poll_interval(&self) -> Duration {
        Duration::from_millis(self.watch_poll_ms.max(1))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes =
            fs::read(path).with_context(|| format!("Failed to read config file {}", path.display()))?;
        let cfg = serde_json::from_slice(&bytes)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(cfg)
    }

    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        match Self::load(path) {
            Ok(cfg) => cfg,
            Err(err) => {
                tracing::warn!(target: "scripting", "Config load error: {err:?}. Falling back to defaults.");
                Self::default()
            }
        }
    }
}

impl Default for ScriptingConfig {
    fn default() -> Self {
        Self {
            script_roots: Self::default_script_roots(),
            module_extension: Self::default_module_extension(),
            source_extension: Self::default_source_extension(),
            hot_reload: Self::default_hot_reload(),
            watch_poll_ms: Self::default_watch_poll_ms(),
            call_timeout_ms: None,
            max_call_levels: Self::default_max_call_levels(),
            log_filter: Self::default_log_filter(),
        }
    }
}
