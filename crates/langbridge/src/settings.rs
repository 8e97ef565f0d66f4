//! Server configuration for the command line tool.
//!
//! Settings come from a `langbridge.json` in the working directory or one of
//! its ancestors, or from an explicit `--config` path. Built-in presets fill
//! in every language the file does not configure.

use anyhow::{bail, Context};
use langbridge_lsp::{default_configs, LspConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const SETTINGS_FILE: &str = "langbridge.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default)]
    pub servers: Vec<LspConfig>,

    /// Append the built-in presets after the configured servers.
    #[serde(default = "default_include_defaults")]
    pub include_defaults: bool,

    /// Where the settings were read from, if anywhere.
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

fn default_include_defaults() -> bool {
    true
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            include_defaults: true,
            source: None,
        }
    }
}

impl Settings {
    /// Load from `explicit`, or search upwards from `cwd`.
    pub fn load(explicit: Option<&Path>, cwd: &Path) -> anyhow::Result<Self> {
        if let Some(path) = explicit {
            if !path.exists() {
                bail!("config file {} does not exist", path.display());
            }
            return Self::from_file(path);
        }

        for dir in cwd.ancestors() {
            let path = dir.join(SETTINGS_FILE);
            if path.is_file() {
                return Self::from_file(&path);
            }
        }

        tracing::debug!("No {} found, using presets", SETTINGS_FILE);
        Ok(Self::default())
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let mut settings: Settings = serde_json::from_str(&content)
            .with_context(|| format!("invalid settings in {}", path.display()))?;
        settings.source = Some(path.to_path_buf());
        tracing::info!(path = %path.display(), servers = settings.servers.len(), "Loaded settings");
        Ok(settings)
    }

    /// Configured servers first, then presets for languages they leave out.
    pub fn servers(&self) -> Vec<LspConfig> {
        let mut servers: Vec<LspConfig> = self.servers.clone();
        if self.include_defaults {
            let presets: Vec<LspConfig> = default_configs()
                .into_iter()
                .filter(|preset| !self.servers.iter().any(|s| s.language == preset.language))
                .collect();
            servers.extend(presets);
        }
        servers
    }

    /// First enabled server that handles `path`.
    pub fn config_for(&self, path: &Path) -> Option<LspConfig> {
        self.servers()
            .into_iter()
            .find(|config| config.enabled && config.handles_path(path))
    }
}
