//! Workspace configuration loaded from `domainscope.toml`.

use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const CONFIG_FILE: &str = "domainscope.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// Path of the embedded database, relative to the workspace root.
    pub db_path: String,
    pub embedding: EmbeddingConfig,
    /// Optional prompt-profile override; selected from the domain's model
    /// config when absent.
    pub profile: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: String,
    pub model: String,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            db_path: "domainscope.db".to_string(),
            embedding: EmbeddingConfig::default(),
            profile: None,
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self { provider: "ollama".to_string(), model: "nomic-embed-text".to_string() }
    }
}

/// Load the workspace config, falling back to defaults when the file does
/// not exist.
pub fn load_config(root: &Path) -> Result<WorkspaceConfig> {
    let path = root.join(CONFIG_FILE);
    if !path.exists() {
        return Ok(WorkspaceConfig::default());
    }
    let raw = std::fs::read_to_string(&path)?;
    toml::from_str(&raw)
        .map_err(|e| CoreError::parse(format!("{}: {e}", path.display())))
}

/// Write a starter config, refusing to clobber an existing one.
pub fn write_starter_config(root: &Path) -> Result<()> {
    let path = root.join(CONFIG_FILE);
    if path.exists() {
        return Err(CoreError::validation(format!("{} already exists", path.display())));
    }
    let config = WorkspaceConfig::default();
    let rendered = toml::to_string_pretty(&config)
        .map_err(|e| CoreError::parse(e.to_string()))?;
    std::fs::write(&path, rendered)?;
    Ok(())
}
