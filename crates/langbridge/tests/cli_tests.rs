//! CLI integration tests.
//!
//! These run the built binary. None of them needs a real language server.

use std::path::Path;
use std::process::{Command, Output};

fn langbridge(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_langbridge"))
        .args(args)
        .current_dir(dir)
        .env_remove("RUST_LOG")
        .output()
        .expect("Failed to execute command")
}

fn write_settings(dir: &Path, content: &str) {
    std::fs::write(dir.join("langbridge.json"), content).expect("Failed to write settings");
}

/// Test that help lists every subcommand.
#[test]
fn test_help_command() {
    let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let output = langbridge(temp_dir.path(), &["--help"]);

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for command in ["servers", "check", "tokens", "highlight", "symbols"] {
        assert!(stdout.contains(command), "missing {command} in help");
    }
}

/// Test that the preset servers are listed without a settings file.
#[test]
fn test_servers_presets() {
    let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let output = langbridge(temp_dir.path(), &["servers"]);

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("built-in presets"));
    assert!(stdout.contains("rust-analyzer"));
    assert!(stdout.contains("gopls"));
}

/// Test that servers from langbridge.json come first in the JSON listing.
#[test]
fn test_servers_from_settings_file() {
    let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    write_settings(
        temp_dir.path(),
        r#"{"servers": [{"language": "rust", "command": "ra-multiplex", "extensions": ["rs"]}]}"#,
    );
    let output = langbridge(temp_dir.path(), &["servers", "--json"]);

    assert!(output.status.success());
    let servers: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("Failed to parse servers JSON");
    assert_eq!(servers[0]["command"], "ra-multiplex");
    assert_eq!(servers[0]["documentUpdateThresholdMs"], 500);
    let rust_servers = servers
        .as_array()
        .expect("Failed to get server list")
        .iter()
        .filter(|s| s["language"] == "rust")
        .count();
    assert_eq!(rust_servers, 1);
}

/// Test that a broken settings file is reported.
#[test]
fn test_invalid_settings_file() {
    let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    write_settings(temp_dir.path(), "{\"servers\": ");
    let output = langbridge(temp_dir.path(), &["servers"]);

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("langbridge.json"));
}

/// Test that checking a file without a matching server fails cleanly.
#[test]
fn test_check_without_server() {
    let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    write_settings(temp_dir.path(), r#"{"includeDefaults": false}"#);
    std::fs::write(temp_dir.path().join("main.rs"), "fn main() {}\n").expect("Failed to write file");

    let output = langbridge(temp_dir.path(), &["check", "main.rs"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("no language server configured"));
}

/// Test that a server binary that cannot be started is reported.
#[test]
fn test_check_with_missing_server_binary() {
    let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    write_settings(
        temp_dir.path(),
        r#"{"includeDefaults": false, "servers": [{"language": "plaintext", "command": "langbridge-no-such-server", "extensions": ["txt"]}]}"#,
    );
    std::fs::write(temp_dir.path().join("notes.txt"), "hello\n").expect("Failed to write file");

    let output = langbridge(temp_dir.path(), &["check", "notes.txt", "--timeout", "5"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("did not initialize"));
}
