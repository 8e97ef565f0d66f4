//! A driven client talking to a real server process.

use crate::settings::Settings;
use anyhow::{bail, Context};
use langbridge_lsp::{
    path_to_uri, Client, ClientDriver, ClientEvent, ClientHandle, ClientId, LspConfig,
    StdioTransport, TextDocument,
};
use lsp_types::WorkspaceFolder;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// What a file command works on: the server for the file, the workspace
/// root it lives in and its contents.
#[derive(Debug, Clone)]
pub struct Target {
    pub config: LspConfig,
    pub root: PathBuf,
    pub path: PathBuf,
    pub document: TextDocument,
}

/// Resolve the server, root and document for `file`.
pub fn prepare(settings: &Settings, file: &Path) -> anyhow::Result<Target> {
    let path = file
        .canonicalize()
        .with_context(|| format!("cannot open {}", file.display()))?;
    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read {}", path.display()))?;

    let Some(config) = settings.config_for(&path) else {
        bail!("no language server configured for {}", path.display());
    };
    let root = config
        .find_workspace_root(&path)
        .or_else(|| path.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("/"));

    let uri = path_to_uri(&path)?;
    let document = TextDocument::new(uri, config.language.clone(), text);
    debug!(
        file = %path.display(),
        server = %config.display_name(),
        root = %root.display(),
        "Resolved target"
    );
    Ok(Target {
        config,
        root,
        path,
        document,
    })
}

pub struct Session {
    pub handle: ClientHandle,
    events: mpsc::UnboundedReceiver<ClientEvent>,
    task: JoinHandle<Client>,
    name: String,
    last_error: Option<String>,
}

impl Session {
    /// Spawn the server for `config` in `root` and wait for the handshake.
    pub async fn start(config: LspConfig, root: &Path, timeout: Duration) -> anyhow::Result<Self> {
        let mut config = config;
        if config.working_directory.is_none() {
            config.working_directory = Some(root.to_path_buf());
        }
        let name = config.display_name().to_string();
        info!(server = %name, command = %config.command, root = %root.display(), "Starting language server");

        let transport = StdioTransport::new(config.server_command());
        let mut client = Client::new(config, Box::new(transport));
        client.set_workspace_folders(vec![WorkspaceFolder {
            uri: path_to_uri(root)?,
            name: root
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| root.display().to_string()),
        }]);

        let (driver, handle, events) = ClientDriver::new(ClientId(1), client);
        let task = tokio::spawn(driver.run());
        let mut session = Self {
            handle,
            events,
            task,
            name,
            last_error: None,
        };
        session
            .wait_for(timeout, |event| matches!(event, ClientEvent::Initialized))
            .await
            .with_context(|| format!("{} did not initialize", session.name))?;
        Ok(session)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait for the first event accepted by `pred`.
    pub async fn wait_for<P>(&mut self, timeout: Duration, mut pred: P) -> anyhow::Result<ClientEvent>
    where
        P: FnMut(&ClientEvent) -> bool,
    {
        match tokio::time::timeout(timeout, self.next_matching(&mut pred)).await {
            Ok(result) => result,
            Err(_) => bail!("timed out after {}s", timeout.as_secs()),
        }
    }

    async fn next_matching<P>(&mut self, pred: &mut P) -> anyhow::Result<ClientEvent>
    where
        P: FnMut(&ClientEvent) -> bool,
    {
        while let Some(event) = self.events.recv().await {
            if pred(&event) {
                return Ok(event);
            }
            match &event {
                ClientEvent::Finished { .. } => match self.last_error.take() {
                    Some(error) => bail!("{} exited: {}", self.name, error),
                    None => bail!("{} exited", self.name),
                },
                ClientEvent::Error(message) => {
                    warn!(server = %self.name, "{}", message);
                    self.last_error = Some(message.clone());
                }
                ClientEvent::ServerMessage { kind, message } => {
                    info!(server = %self.name, kind = ?kind, "{}", message);
                }
                other => debug!(server = %self.name, event = ?other, "Ignoring event"),
            }
        }
        bail!("{} stopped", self.name)
    }

    /// Shut the server down, giving up after `timeout`.
    pub async fn shutdown(self, timeout: Duration) -> anyhow::Result<()> {
        let Session {
            handle,
            mut task,
            name,
            ..
        } = self;
        match handle.shutdown() {
            Ok(()) => {}
            Err(e) if e.is_connection_error() => debug!(server = %name, "Driver already stopped"),
            Err(e) => return Err(e.into()),
        }
        match tokio::time::timeout(timeout, &mut task).await {
            Ok(Ok(client)) => {
                info!(server = %name, state = %client.state(), "Language server stopped");
                Ok(())
            }
            Ok(Err(e)) => Err(e).context("driver task failed"),
            Err(_) => {
                warn!(server = %name, "Shutdown timed out, abandoning server");
                task.abort();
                Ok(())
            }
        }
    }
}
