//! Patch run configuration.
//!
//! Defaults reproduce the canonical rewrite: calls to `printf` become calls
//! to the `puts` stub found in `.plt.sec`.

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

/// Names that parameterize a patch run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatchConfig {
    /// Raw symbol name whose call sites get rewritten.
    pub source_symbol: String,
    /// Section searched for the replacement function.
    pub target_section: String,
    /// Substring identifying the replacement function by name.
    pub target_name_substring: String,
}

impl Default for PatchConfig {
    fn default() -> Self {
        Self {
            source_symbol: "printf".to_string(),
            target_section: ".plt.sec".to_string(),
            target_name_substring: "puts".to_string(),
        }
    }
}

/// Serialization format, chosen from the file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Yaml,
    Json,
}

impl ConfigFormat {
    pub fn from_path(path: &Path) -> Result<Self> {
        match path.extension().and_then(|e| e.to_str()).unwrap_or_default() {
            "yaml" | "yml" => Ok(ConfigFormat::Yaml),
            "json" => Ok(ConfigFormat::Json),
            other => Err(anyhow!(
                "Unsupported config extension '{}' for {} (expected yaml, yml or json)",
                other,
                path.display()
            )),
        }
    }
}

impl PatchConfig {
    /// Load a config from YAML or JSON; missing fields fall back to defaults.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let format = ConfigFormat::from_path(path)?;
        let body = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read patch config at {}", path.display()))?;
        let config = match format {
            ConfigFormat::Yaml => serde_yaml::from_str(&body)
                .with_context(|| format!("Failed to parse YAML config {}", path.display()))?,
            ConfigFormat::Json => serde_json::from_str(&body)
                .with_context(|| format!("Failed to parse JSON config {}", path.display()))?,
        };
        Ok(config)
    }

    /// Serialize in the format implied by `path`'s extension.
    pub fn to_string_for(&self, path: &Path) -> Result<String> {
        match ConfigFormat::from_path(path)? {
            ConfigFormat::Yaml => serde_yaml::to_string(self).context("Failed to serialize config"),
            ConfigFormat::Json => {
                serde_json::to_string_pretty(self).context("Failed to serialize config")
            }
        }
    }

    /// Apply optional overrides (e.g. from CLI flags) on top of this config.
    pub fn with_overrides(
        mut self,
        source_symbol: Option<String>,
        target_section: Option<String>,
        target_name_substring: Option<String>,
    ) -> Self {
        if let Some(v) = source_symbol {
            self.source_symbol = v;
        }
        if let Some(v) = target_section {
            self.target_section = v;
        }
        if let Some(v) = target_name_substring {
            self.target_name_substring = v;
        }
        self
    }
}
