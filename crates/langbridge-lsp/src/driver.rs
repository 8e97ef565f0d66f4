//! Async owner task for a single [`Client`].
//!
//! The driver is the only place the client is touched. Editor code talks to
//! it through a cloneable [`ClientHandle`] that ships closures into the loop.

use crate::client::{Client, ClientEvent};
use crate::document::TextDocument;
use crate::error::{LspError, LspResult};
use crate::protocol::ResponseResult;
use crate::transport::{ClientId, TransportEvents, TransportSink};
use lsp_types::Uri;
use serde_json::Value;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

/// Work to run on the owner task.
pub type ClientCommand = Box<dyn FnOnce(&mut Client) + Send>;

/// Cloneable access to a driven client.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    id: ClientId,
    commands: mpsc::UnboundedSender<ClientCommand>,
}

impl ClientHandle {
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Queue `f` without waiting for it.
    pub fn execute<F>(&self, f: F) -> LspResult<()>
    where
        F: FnOnce(&mut Client) + Send + 'static,
    {
        self.commands
            .send(Box::new(f))
            .map_err(|_| LspError::connection_failed(format!("{} is no longer running", self.id)))
    }

    /// Run `f` on the owner task and return its result.
    pub async fn call<F, R>(&self, f: F) -> LspResult<R>
    where
        F: FnOnce(&mut Client) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.execute(move |client| {
            let _ = tx.send(f(client));
        })?;
        rx.await
            .map_err(|_| LspError::connection_failed(format!("{} stopped", self.id)))
    }

    /// Send a request and wait for its response.
    pub async fn request(&self, method: impl Into<String>, params: Value) -> LspResult<ResponseResult> {
        let method = method.into();
        let (tx, rx) = oneshot::channel();
        let sent = self
            .call(move |client| {
                client
                    .send_request(&method, params, move |result| {
                        let _ = tx.send(result);
                    })
                    .is_some()
            })
            .await?;
        if !sent {
            return Err(LspError::request_failed("client is not reachable"));
        }
        rx.await
            .map_err(|_| LspError::request_failed("request was cancelled"))
    }

    pub fn open_document(&self, doc: TextDocument) -> LspResult<()> {
        self.execute(move |client| {
            client.open_document(doc);
        })
    }

    pub fn close_document(&self, uri: Uri) -> LspResult<()> {
        self.execute(move |client| client.close_document(&uri))
    }

    pub fn document_contents_changed(
        &self,
        doc: TextDocument,
        position: usize,
        chars_removed: usize,
        chars_added: usize,
    ) -> LspResult<()> {
        self.execute(move |client| {
            client.document_contents_changed(&doc, position, chars_removed, chars_added)
        })
    }

    /// Ask the server to shut down. The driver loop ends once it has.
    pub fn shutdown(&self) -> LspResult<()> {
        self.execute(|client| {
            let _ = client.shutdown();
        })
    }
}

/// Owns a [`Client`] and runs it until it finishes.
pub struct ClientDriver {
    id: ClientId,
    client: Client,
    sink: TransportSink,
    transport_events: TransportEvents,
    commands: mpsc::UnboundedReceiver<ClientCommand>,
    events: mpsc::UnboundedSender<ClientEvent>,
}

impl ClientDriver {
    /// Wrap `client`. Returns the driver, a handle for commands, and the
    /// stream of client events.
    pub fn new(id: ClientId, client: Client) -> (Self, ClientHandle, mpsc::UnboundedReceiver<ClientEvent>) {
        let (sink, transport_events) = TransportSink::channel(id);
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let driver = Self {
            id,
            client,
            sink,
            transport_events,
            commands: command_rx,
            events: event_tx,
        };
        let handle = ClientHandle {
            id,
            commands: command_tx,
        };
        (driver, handle, event_rx)
    }

    /// Start the transport, send `initialize` and process everything until
    /// the client finishes. The client is handed back for a possible reset.
    pub async fn run(mut self) -> Client {
        info!(id = %self.id, client = %self.client.name(), "Driver started");
        if self.client.start(self.sink.clone()).is_ok() {
            let _ = self.client.initialize();
        }

        let mut commands_open = true;
        loop {
            if self.forward_events() {
                break;
            }
            let deadline = self.client.next_deadline();

            tokio::select! {
                Some((_, event)) = self.transport_events.recv() => {
                    self.client.handle_transport_event(event);
                }
                command = self.commands.recv(), if commands_open => {
                    match command {
                        Some(command) => command(&mut self.client),
                        None => {
                            debug!(id = %self.id, "All handles dropped, shutting down");
                            commands_open = false;
                            let _ = self.client.shutdown();
                        }
                    }
                }
                _ = sleep_until(deadline) => {
                    self.client.handle_timeout(Instant::now());
                }
            }
        }

        info!(id = %self.id, state = %self.client.state(), "Driver stopped");
        self.client
    }

    /// Forward queued events. Returns true once the client finished.
    fn forward_events(&mut self) -> bool {
        let mut finished = false;
        for event in self.client.drain_events() {
            finished |= matches!(event, ClientEvent::Finished { .. });
            let _ = self.events.send(event);
        }
        finished
    }
}

pub(crate) async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await,
        None => std::future::pending().await,
    }
}
