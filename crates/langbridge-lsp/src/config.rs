//! Per-server configuration.

use crate::document::{uri_to_path, TextDocument};
use crate::transport::ServerCommand;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration for one language server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LspConfig {
    /// Language id handled by this server (e.g. "rust", "typescript").
    pub language: String,

    /// Display name used in logs. Defaults to the language.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// File extensions handled by this server.
    #[serde(default)]
    pub extensions: Vec<String>,

    /// Glob patterns matched against file names or full paths.
    #[serde(default)]
    pub file_patterns: Vec<String>,

    pub command: String,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub env: HashMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<PathBuf>,

    /// Files marking a workspace root (e.g. `["Cargo.toml"]`).
    #[serde(default)]
    pub root_patterns: Vec<String>,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Sent verbatim as `initializationOptions`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initialization_options: Option<Value>,

    /// Debounce window for batching document changes.
    #[serde(default = "default_update_threshold_ms")]
    pub document_update_threshold_ms: u64,

    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,

    /// How many times the client may be reset after an unexpected exit.
    #[serde(default = "default_restart_budget")]
    pub restart_budget: u32,

    /// Show diagnostics for documents as soon as they are opened.
    #[serde(default = "default_enabled")]
    pub activate_documents_automatically: bool,
}

fn default_enabled() -> bool {
    true
}

fn default_update_threshold_ms() -> u64 {
    500
}

fn default_shutdown_timeout_secs() -> u64 {
    20
}

fn default_restart_budget() -> u32 {
    5
}

impl Default for LspConfig {
    fn default() -> Self {
        Self::new("plaintext", "", Vec::<String>::new())
    }
}

impl LspConfig {
    pub fn new(
        language: impl Into<String>,
        command: impl Into<String>,
        extensions: Vec<impl Into<String>>,
    ) -> Self {
        Self {
            language: language.into(),
            name: None,
            extensions: extensions.into_iter().map(|e| e.into()).collect(),
            file_patterns: Vec::new(),
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            working_directory: None,
            root_patterns: Vec::new(),
            enabled: true,
            initialization_options: None,
            document_update_threshold_ms: default_update_threshold_ms(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            restart_budget: default_restart_budget(),
            activate_documents_automatically: true,
        }
    }

    pub fn with_args(mut self, args: Vec<impl Into<String>>) -> Self {
        self.args = args.into_iter().map(|a| a.into()).collect();
        self
    }

    pub fn with_root_patterns(mut self, patterns: Vec<impl Into<String>>) -> Self {
        self.root_patterns = patterns.into_iter().map(|p| p.into()).collect();
        self
    }

    pub fn with_file_patterns(mut self, patterns: Vec<impl Into<String>>) -> Self {
        self.file_patterns = patterns.into_iter().map(|p| p.into()).collect();
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.language)
    }

    pub fn document_update_threshold(&self) -> Duration {
        Duration::from_millis(self.document_update_threshold_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Launch parameters for [`StdioTransport`](crate::StdioTransport).
    pub fn server_command(&self) -> ServerCommand {
        ServerCommand {
            command: self.command.clone(),
            args: self.args.clone(),
            env: self.env.clone(),
            working_directory: self.working_directory.clone(),
        }
    }

    /// rust-analyzer, rooted at the nearest `Cargo.toml`.
    pub fn rust() -> Self {
        Self::new("rust", "rust-analyzer", vec!["rs"]).with_root_patterns(vec!["Cargo.toml"])
    }

    /// Built-in settings for a language id, if there are any.
    pub fn preset(language: &str) -> Option<Self> {
        PRESETS
            .iter()
            .find(|preset| preset.language == language)
            .map(Preset::to_config)
    }

    pub fn handles_extension(&self, ext: &str) -> bool {
        self.extensions.iter().any(|e| e.eq_ignore_ascii_case(ext))
    }

    /// Whether `doc` belongs to this server: by language id, extension or
    /// file pattern.
    pub fn handles_document(&self, doc: &TextDocument) -> bool {
        if !self.enabled {
            return false;
        }
        if doc.language_id == self.language {
            return true;
        }
        let path = uri_to_path(&doc.uri);
        self.handles_path(Path::new(&path))
    }

    pub fn handles_path(&self, path: &Path) -> bool {
        if path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| self.handles_extension(ext))
        {
            return true;
        }
        let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        self.file_patterns.iter().any(|pattern| {
            glob::Pattern::new(pattern)
                .map(|p| p.matches(file_name) || p.matches_path(path))
                .unwrap_or(false)
        })
    }

    /// Walk up from `file_path` to the first directory containing one of
    /// the root patterns.
    pub fn find_workspace_root(&self, file_path: &Path) -> Option<PathBuf> {
        let mut current = file_path.parent()?;

        loop {
            for pattern in &self.root_patterns {
                if current.join(pattern).exists() {
                    return Some(current.to_path_buf());
                }
            }

            current = current.parent()?;
        }
    }
}

struct Preset {
    language: &'static str,
    command: &'static str,
    args: &'static [&'static str],
    extensions: &'static [&'static str],
    file_patterns: &'static [&'static str],
    root_patterns: &'static [&'static str],
}

impl Preset {
    fn to_config(&self) -> LspConfig {
        LspConfig::new(self.language, self.command, self.extensions.to_vec())
            .with_args(self.args.to_vec())
            .with_file_patterns(self.file_patterns.to_vec())
            .with_root_patterns(self.root_patterns.to_vec())
    }
}

const STDIO: &[&str] = &["--stdio"];

const PRESETS: &[Preset] = &[
    Preset {
        language: "rust",
        command: "rust-analyzer",
        args: &[],
        extensions: &["rs"],
        file_patterns: &[],
        root_patterns: &["Cargo.toml"],
    },
    Preset {
        language: "typescript",
        command: "typescript-language-server",
        args: STDIO,
        extensions: &["ts", "tsx", "js", "jsx", "mjs", "cjs"],
        file_patterns: &[],
        root_patterns: &["tsconfig.json", "jsconfig.json", "package.json"],
    },
    Preset {
        language: "python",
        command: "pyright-langserver",
        args: STDIO,
        extensions: &["py", "pyi"],
        file_patterns: &[],
        root_patterns: &["pyproject.toml", "setup.cfg", "setup.py"],
    },
    Preset {
        language: "go",
        command: "gopls",
        args: &[],
        extensions: &["go"],
        file_patterns: &[],
        root_patterns: &["go.work", "go.mod"],
    },
    Preset {
        language: "cpp",
        command: "clangd",
        args: &[],
        extensions: &["c", "h", "cc", "cpp", "cxx", "hh", "hpp", "hxx"],
        file_patterns: &[],
        root_patterns: &["compile_commands.json", "compile_flags.txt", "CMakeLists.txt"],
    },
    Preset {
        language: "lua",
        command: "lua-language-server",
        args: &[],
        extensions: &["lua"],
        file_patterns: &[],
        root_patterns: &[".luarc.json", ".stylua.toml"],
    },
    Preset {
        language: "shellscript",
        command: "bash-language-server",
        args: &["start"],
        extensions: &["sh", "bash"],
        file_patterns: &[".bashrc", ".bash_profile"],
        root_patterns: &[],
    },
    Preset {
        language: "yaml",
        command: "yaml-language-server",
        args: STDIO,
        extensions: &["yaml", "yml"],
        file_patterns: &[],
        root_patterns: &[],
    },
    Preset {
        language: "json",
        command: "vscode-json-language-server",
        args: STDIO,
        extensions: &["json", "jsonc"],
        file_patterns: &[],
        root_patterns: &[],
    },
    // Dockerfiles usually have no extension.
    Preset {
        language: "dockerfile",
        command: "docker-langserver",
        args: STDIO,
        extensions: &[],
        file_patterns: &["Dockerfile", "Dockerfile.*", "*.dockerfile"],
        root_patterns: &[],
    },
];

/// Settings for every built-in server.
pub fn default_configs() -> Vec<LspConfig> {
    PRESETS.iter().map(Preset::to_config).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(uri: &str, language: &str) -> TextDocument {
        TextDocument::new(uri.parse().unwrap(), language, "")
    }

    #[test]
    fn test_rust_config() {
        let config = LspConfig::rust();
        assert_eq!(config.language, "rust");
        assert_eq!(config.command, "rust-analyzer");
        assert!(config.handles_extension("rs"));
        assert!(!config.handles_extension("py"));
        assert_eq!(config.display_name(), "rust");
    }

    #[test]
    fn test_presets() {
        assert_eq!(LspConfig::preset("rust"), Some(LspConfig::rust()));
        assert!(LspConfig::preset("cobol").is_none());

        let configs = default_configs();
        assert_eq!(configs.len(), PRESETS.len());
        let languages: std::collections::HashSet<&str> =
            configs.iter().map(|c| c.language.as_str()).collect();
        assert_eq!(languages.len(), configs.len());
        assert!(configs.iter().all(|c| !c.command.is_empty()));
    }

    #[test]
    fn test_defaults_from_json() {
        let config: LspConfig = serde_json::from_value(json!({
            "language": "custom",
            "command": "custom-lsp",
            "extensions": ["cst"],
            "initializationOptions": {"lint": true}
        }))
        .unwrap();
        assert_eq!(config.document_update_threshold(), Duration::from_millis(500));
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(20));
        assert_eq!(config.restart_budget, 5);
        assert!(config.enabled);
        assert!(config.activate_documents_automatically);
        assert_eq!(config.initialization_options, Some(json!({"lint": true})));
    }

    #[test]
    fn test_handles_document() {
        let config = LspConfig::rust();
        assert!(config.handles_document(&doc("file:///w/main.rs", "plaintext")));
        assert!(config.handles_document(&doc("file:///w/notes.txt", "rust")));
        assert!(!config.handles_document(&doc("file:///w/main.py", "python")));

        let docker = LspConfig::preset("dockerfile").unwrap();
        assert!(docker.handles_document(&doc("file:///w/Dockerfile", "plaintext")));
        assert!(docker.handles_document(&doc("file:///w/Dockerfile.dev", "plaintext")));
        assert!(!docker.handles_document(&doc("file:///w/main.rs", "rust")));
    }

    #[test]
    fn test_disabled_handles_nothing() {
        let mut config = LspConfig::rust();
        config.enabled = false;
        assert!(!config.handles_document(&doc("file:///w/main.rs", "rust")));
    }

    #[test]
    fn test_find_workspace_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Cargo.toml"), "").unwrap();
        let nested = dir.path().join("src/bin");
        std::fs::create_dir_all(&nested).unwrap();
        let root = LspConfig::rust()
            .find_workspace_root(&nested.join("main.rs"))
            .unwrap();
        assert_eq!(root, dir.path());
    }

    #[test]
    fn test_server_command() {
        let mut config = LspConfig::preset("typescript").unwrap();
        config.working_directory = Some(PathBuf::from("/w"));
        let command = config.server_command();
        assert_eq!(command.command, "typescript-language-server");
        assert_eq!(command.args, vec!["--stdio"]);
        assert_eq!(command.working_directory, Some(PathBuf::from("/w")));
    }
}
