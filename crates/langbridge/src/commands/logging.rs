//! Logging setup for the command line tool.
//!
//! Output goes to stderr so stdout stays clean for results, or to a file in
//! the platform log directory when `--log-file` is given.

use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Log level selected on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "trace" => Some(LogLevel::Trace),
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" | "warning" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            _ => None,
        }
    }

    /// `-v` raises to debug, `-vv` and beyond to trace (wire dumps).
    pub fn from_verbosity(verbose: u8) -> Self {
        match verbose {
            0 => LogLevel::Warn,
            1 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }

    /// Filter directive covering both crates of the tool.
    pub fn directive(&self) -> String {
        format!(
            "langbridge={level},langbridge_lsp={level}",
            level = self.as_str()
        )
    }
}

/// Install the global subscriber. `RUST_LOG` overrides the level.
/// Returns the log file path if logging to a file.
pub fn init_logging(level: LogLevel, to_file: bool) -> Option<PathBuf> {
    let filter = || {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.directive()))
    };

    if !to_file {
        tracing_subscriber::fmt()
            .with_env_filter(filter())
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
        return None;
    }

    let log_dir = get_log_dir();
    if let Err(e) = std::fs::create_dir_all(&log_dir) {
        eprintln!("Warning: Could not create log directory: {e}");
        return None;
    }

    let log_file = log_dir.join("langbridge.log");
    let file = match std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_file)
    {
        Ok(f) => f,
        Err(e) => {
            eprintln!("Warning: Could not open log file: {e}");
            return None;
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter())
        .with_target(true)
        .with_ansi(false)
        .with_writer(file)
        .init();

    Some(log_file)
}

/// Platform log directory.
pub fn get_log_dir() -> PathBuf {
    // macOS: ~/Library/Logs/langbridge
    // Linux: ~/.local/state/langbridge/logs
    // Windows: %LOCALAPPDATA%/langbridge/logs

    #[cfg(target_os = "macos")]
    {
        if let Some(home) = dirs::home_dir() {
            return home.join("Library/Logs/langbridge");
        }
    }

    #[cfg(target_os = "linux")]
    {
        if let Some(state_dir) = dirs::state_dir() {
            return state_dir.join("langbridge/logs");
        }
        if let Some(home) = dirs::home_dir() {
            return home.join(".local/state/langbridge/logs");
        }
    }

    #[cfg(target_os = "windows")]
    {
        if let Some(local_app) = dirs::data_local_dir() {
            return local_app.join("langbridge/logs");
        }
    }

    PathBuf::from(".langbridge/logs")
}
