//! langbridge - drive a language server from the command line.
//!
//! Each command spawns the server configured for its files, runs one
//! exchange against it and shuts it down again.

mod commands;
mod settings;

use clap::{Parser, Subcommand};
use commands::*;
use settings::Settings;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "langbridge")]
#[command(author, version, about = "Talk to language servers from the command line", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Log level (trace, debug, info, warn, error); overrides -v
    #[arg(long, global = true, value_parser = parse_log_level)]
    log_level: Option<LogLevel>,

    /// Write logs to the log directory instead of stderr
    #[arg(long, global = true)]
    log_file: bool,

    /// Settings file (default: langbridge.json in this or a parent directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Seconds to wait for each server response
    #[arg(short, long, default_value_t = 30, global = true)]
    timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the configured language servers
    Servers {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the diagnostics a server reports for a file
    Check {
        file: PathBuf,
        /// Print raw diagnostics as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the semantic tokens of a file
    Tokens {
        file: PathBuf,
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show the occurrences of the symbol at a position
    Highlight {
        file: PathBuf,
        /// Line, starting at 1
        line: u32,
        /// Column, starting at 1
        column: u32,
    },
    /// Search workspace symbols using the servers for the given files
    Symbols {
        query: String,
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
}

fn parse_log_level(s: &str) -> Result<LogLevel, String> {
    LogLevel::parse(s).ok_or_else(|| format!("unknown log level: {s}"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = cli
        .log_level
        .unwrap_or_else(|| LogLevel::from_verbosity(cli.verbose));
    let log_file = init_logging(level, cli.log_file);
    if let Some(path) = &log_file {
        tracing::debug!(path = %path.display(), "Logging to file");
    }

    let cwd = std::env::current_dir()?;
    let settings = Settings::load(cli.config.as_deref(), &cwd)?;
    let timeout = Duration::from_secs(cli.timeout);

    match cli.command {
        Commands::Servers { json } => run_servers(&settings, json)?,
        Commands::Check { file, json } => {
            let errors = run_check(&settings, &file, timeout, json).await?;
            if errors > 0 {
                std::process::exit(1);
            }
        }
        Commands::Tokens { file, json } => run_tokens(&settings, &file, timeout, json).await?,
        Commands::Highlight { file, line, column } => {
            run_highlight(&settings, &file, line, column, timeout).await?
        }
        Commands::Symbols { query, files } => {
            run_symbols(&settings, &query, &files, timeout).await?
        }
    }

    Ok(())
}
