// Configuration management for the Lifeline CLI
//
// Cross-platform config stored in:
// - macOS: ~/Library/Application Support/lifeline/config.json
// - Linux: ~/.config/lifeline/config.json
// - Windows: %APPDATA%\lifeline\config.json
//
// Keys are dotted paths into the JSON document, e.g. `core.mesh.default_ttl`.

use anyhow::{Context, Result};
use lifeline_core::CoreConfig;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Display name used for this device
    pub node_name: String,

    /// Storage path for queues and delivery records
    pub storage_path: Option<String>,

    /// Tuning for the mesh, delivery and hybrid layers
    pub core: CoreConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_name: "lifeline".to_string(),
            storage_path: None,
            core: CoreConfig::default(),
        }
    }
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("lifeline");

        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir)
    }

    /// Get the data directory path (cross-platform)
    pub fn data_dir() -> Result<PathBuf> {
        let data_dir = dirs::data_local_dir()
            .context("Failed to determine data directory")?
            .join("lifeline");

        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

        Ok(data_dir)
    }

    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Where the node keeps its key-value store.
    pub fn storage_dir(&self) -> Result<PathBuf> {
        match &self.storage_path {
            Some(path) => Ok(PathBuf::from(path)),
            None => Ok(Self::data_dir()?.join("storage")),
        }
    }

    /// Load config from file, or create default if not exists
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_file()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path).context("Failed to read config file")?;
            let config: Config =
                serde_json::from_str(&contents).context("Failed to parse config file")?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_file()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents).context("Failed to write config file")?;
        Ok(())
    }

    /// Set a config value by dotted key. The value is parsed as JSON when
    /// possible (numbers, booleans, null) and taken as a string otherwise.
    /// The result must still pass validation.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let mut doc = serde_json::to_value(&*self).context("Failed to serialize config")?;
        let slot = lookup_mut(&mut doc, key)
            .with_context(|| format!("Unknown config key: {}", key))?;
        if slot.is_object() {
            anyhow::bail!("{} is a section; set one of its fields instead", key);
        }

        let parsed = serde_json::from_str::<Value>(value)
            .unwrap_or_else(|_| Value::String(value.to_string()));
        *slot = parsed;

        let updated: Config = serde_json::from_value(doc)
            .with_context(|| format!("Invalid value for {}: {}", key, value))?;
        updated
            .core
            .validate()
            .with_context(|| format!("Rejected {} = {}", key, value))?;
        *self = updated;
        Ok(())
    }

    /// Get a config value by dotted key.
    pub fn get(&self, key: &str) -> Option<String> {
        let doc = serde_json::to_value(self).ok()?;
        let mut current = &doc;
        for part in key.split('.') {
            current = current.get(part)?;
        }
        Some(render(current))
    }

    /// Every leaf value as `(dotted key, value)`, sorted by key.
    pub fn list(&self) -> Vec<(String, String)> {
        let mut out = Vec::new();
        if let Ok(doc) = serde_json::to_value(self) {
            flatten("", &doc, &mut out);
        }
        out
    }
}

fn lookup_mut<'a>(doc: &'a mut Value, key: &str) -> Option<&'a mut Value> {
    let mut current = doc;
    for part in key.split('.') {
        current = current.as_object_mut()?.get_mut(part)?;
    }
    Some(current)
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "(unset)".to_string(),
        other => other.to_string(),
    }
}

fn flatten(prefix: &str, value: &Value, out: &mut Vec<(String, String)>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", prefix, key)
                };
                flatten(&path, child, out);
            }
        }
        leaf => out.push((prefix.to_string(), render(leaf))),
    }
}
