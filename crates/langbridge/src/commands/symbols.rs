//! `langbridge symbols`: search workspace symbols across every server
//! needed for the given files. The first server to answer wins.

use super::session::{prepare, Target};
use crate::settings::Settings;
use anyhow::{anyhow, bail};
use langbridge_lsp::{
    path_to_uri, uri_to_path, Client, ClientEvent, ClientId, ClientRegistry, StdioTransport,
};
use lsp_types::{OneOf, SymbolKind, WorkspaceFolder, WorkspaceSymbolResponse};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct SymbolLine {
    pub name: String,
    pub kind: SymbolKind,
    pub location: String,
    pub container: Option<String>,
}

pub async fn run_symbols(
    settings: &Settings,
    query: &str,
    files: &[PathBuf],
    timeout: Duration,
) -> anyhow::Result<()> {
    let targets = files
        .iter()
        .map(|file| prepare(settings, file))
        .collect::<anyhow::Result<Vec<_>>>()?;

    let mut registry = ClientRegistry::new();
    let started = spawn_clients(&mut registry, &targets)?;
    wait_until_ready(&mut registry, &started, timeout).await;
    if registry.is_empty() {
        bail!("no language server could be started");
    }

    let (tx, rx) = oneshot::channel();
    let asked = registry.workspace_symbols(query, move |id, result| {
        let _ = tx.send((id, result));
    });
    info!(query, servers = asked, "Sent workspace/symbol");

    let answer = tokio::time::timeout(timeout, async {
        let mut rx = rx;
        loop {
            tokio::select! {
                answer = &mut rx => break answer,
                _ = registry.process_next() => {}
            }
        }
    })
    .await;

    shutdown(&mut registry, timeout).await;

    let (id, result) = match answer {
        Ok(Ok(answer)) => answer,
        Ok(Err(_)) => bail!("symbol request was dropped"),
        Err(_) => bail!("timed out after {}s", timeout.as_secs()),
    };
    let response = result.map_err(|e| anyhow!("symbol search failed: {}", e.message))?;
    debug!(client = %id, "Symbols answered");

    let lines = symbol_lines(response);
    if lines.is_empty() {
        println!("no symbols matching {query:?}");
    }
    for line in &lines {
        match &line.container {
            Some(container) => println!("{:?} {} ({}) {}", line.kind, line.name, container, line.location),
            None => println!("{:?} {} {}", line.kind, line.name, line.location),
        }
    }
    Ok(())
}

/// One client per distinct server and root; each gets the documents of
/// its targets assigned before it starts.
fn spawn_clients(registry: &mut ClientRegistry, targets: &[Target]) -> anyhow::Result<Vec<ClientId>> {
    let mut started: Vec<(String, PathBuf, ClientId)> = Vec::new();

    for target in targets {
        let key = target.config.display_name().to_string();
        let existing = started
            .iter()
            .find(|(name, root, _)| *name == key && *root == target.root)
            .map(|(_, _, id)| *id);
        let id = match existing {
            Some(id) => id,
            None => {
                let mut config = target.config.clone();
                config.working_directory.get_or_insert_with(|| target.root.clone());
                let transport = StdioTransport::new(config.server_command());
                let mut client = Client::new(config, Box::new(transport));
                client.set_workspace_folders(vec![WorkspaceFolder {
                    uri: path_to_uri(&target.root)?,
                    name: target.root.display().to_string(),
                }]);
                let id = registry.add_client(client);
                started.push((key, target.root.clone(), id));
                id
            }
        };
        registry.open_document_with_client(target.document.clone(), id);
    }

    let ids: Vec<ClientId> = started.into_iter().map(|(_, _, id)| id).collect();
    for id in &ids {
        if let Err(e) = registry.start_client(*id) {
            warn!(client = %id, error = %e, "Failed to start language server");
        }
    }
    Ok(ids)
}

/// Process events until every started client is initialized or gone.
async fn wait_until_ready(registry: &mut ClientRegistry, ids: &[ClientId], timeout: Duration) {
    let mut waiting: HashSet<ClientId> = ids.iter().copied().collect();
    let result = tokio::time::timeout(timeout, async {
        while !waiting.is_empty() {
            for (id, event) in registry.drain_events() {
                match event {
                    ClientEvent::Initialized => {
                        waiting.remove(&id);
                    }
                    ClientEvent::Error(message) => warn!(client = %id, "{}", message),
                    _ => {}
                }
            }
            waiting.retain(|id| registry.client(*id).is_some());
            if waiting.is_empty() {
                break;
            }
            registry.process_next().await;
        }
    })
    .await;

    if result.is_err() {
        warn!(pending = waiting.len(), "Some servers did not initialize in time");
        for id in waiting {
            registry.remove_client(id);
        }
    }
}

async fn shutdown(registry: &mut ClientRegistry, timeout: Duration) {
    registry.shutdown_all();
    let drained = tokio::time::timeout(timeout, async {
        while !registry.is_empty() {
            registry.process_next().await;
        }
    })
    .await;
    if drained.is_err() {
        warn!(remaining = registry.len(), "Servers did not shut down in time");
    }
}

fn symbol_lines(response: WorkspaceSymbolResponse) -> Vec<SymbolLine> {
    match response {
        WorkspaceSymbolResponse::Flat(symbols) => symbols
            .into_iter()
            .map(|symbol| {
                let start = symbol.location.range.start;
                SymbolLine {
                    name: symbol.name,
                    kind: symbol.kind,
                    location: format!(
                        "{}:{}:{}",
                        uri_to_path(&symbol.location.uri),
                        start.line + 1,
                        start.character + 1
                    ),
                    container: symbol.container_name,
                }
            })
            .collect(),
        WorkspaceSymbolResponse::Nested(symbols) => symbols
            .into_iter()
            .map(|symbol| {
                let location = match symbol.location {
                    OneOf::Left(location) => {
                        let start = location.range.start;
                        format!(
                            "{}:{}:{}",
                            uri_to_path(&location.uri),
                            start.line + 1,
                            start.character + 1
                        )
                    }
                    OneOf::Right(location) => uri_to_path(&location.uri),
                };
                SymbolLine {
                    name: symbol.name,
                    kind: symbol.kind,
                    location,
                    container: symbol.container_name,
                }
            })
            .collect(),
    }
}
