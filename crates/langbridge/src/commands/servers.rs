//! `langbridge servers`: show the configured language servers.

use crate::settings::Settings;
use langbridge_lsp::LspConfig;

pub fn run_servers(settings: &Settings, json: bool) -> anyhow::Result<()> {
    let servers = settings.servers();
    if json {
        println!("{}", serde_json::to_string_pretty(&servers)?);
        return Ok(());
    }

    match &settings.source {
        Some(path) => println!("Settings: {}", path.display()),
        None => println!("Settings: built-in presets"),
    }
    for server in &servers {
        println!("{}", describe(server));
    }
    Ok(())
}

fn describe(server: &LspConfig) -> String {
    let mut command = server.command.clone();
    for arg in &server.args {
        command.push(' ');
        command.push_str(arg);
    }
    let mut matches: Vec<String> = server.extensions.iter().map(|e| format!(".{e}")).collect();
    matches.extend(server.file_patterns.iter().cloned());
    format!(
        "  {:<12} {:<40} {}{}",
        server.display_name(),
        command,
        matches.join(" "),
        if server.enabled { "" } else { " (disabled)" }
    )
}
