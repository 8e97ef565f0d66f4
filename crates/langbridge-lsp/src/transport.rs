//! Byte transports connecting a client to its language server.
//!
//! A transport only moves bytes. Everything it observes (data, end of
//! stream, failures) is reported as a [`TransportEvent`] through a
//! [`TransportSink`], tagged with the owning [`ClientId`], so the client can
//! consume it on its own task.

use crate::error::{LspError, LspResult};
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Identifier of a client within a registry or driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// Something a transport observed.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A chunk of bytes from the server. Chunks need not align with messages.
    Received(Bytes),
    /// The server closed its side of the connection.
    Closed,
    /// The connection failed.
    Error(String),
}

/// Sender half handed to a transport when it starts.
#[derive(Debug, Clone)]
pub struct TransportSink {
    client: ClientId,
    tx: mpsc::UnboundedSender<(ClientId, TransportEvent)>,
}

/// Receiver half matching [`TransportSink::channel`].
pub type TransportEvents = mpsc::UnboundedReceiver<(ClientId, TransportEvent)>;

impl TransportSink {
    pub fn new(client: ClientId, tx: mpsc::UnboundedSender<(ClientId, TransportEvent)>) -> Self {
        Self { client, tx }
    }

    /// Create a sink together with the receiver it feeds.
    pub fn channel(client: ClientId) -> (Self, TransportEvents) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(client, tx), rx)
    }

    pub fn client(&self) -> ClientId {
        self.client
    }

    /// Deliver an event. Returns false once the receiving side is gone.
    pub fn send(&self, event: TransportEvent) -> bool {
        self.tx.send((self.client, event)).is_ok()
    }
}

/// Duplex byte channel to a language server.
pub trait Transport: Send {
    /// Begin delivering events into `sink`.
    fn start(&mut self, sink: TransportSink) -> LspResult<()>;

    /// Queue bytes for the server. Must not block.
    fn send(&mut self, data: Bytes) -> LspResult<()>;

    /// Tear the connection down. Safe to call more than once.
    fn close(&mut self);
}

/// Launch parameters for a server process.
#[derive(Debug, Clone)]
pub struct ServerCommand {
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub working_directory: Option<PathBuf>,
}

/// Transport over the stdio of a spawned server process.
///
/// Must be started from within a tokio runtime.
pub struct StdioTransport {
    command: ServerCommand,
    child: Option<Child>,
    writer: Option<mpsc::UnboundedSender<Bytes>>,
    tasks: Vec<JoinHandle<()>>,
}

const READ_CHUNK: usize = 8192;

impl StdioTransport {
    pub fn new(command: ServerCommand) -> Self {
        Self {
            command,
            child: None,
            writer: None,
            tasks: Vec::new(),
        }
    }

    pub fn command(&self) -> &ServerCommand {
        &self.command
    }

    fn spawn(&self) -> LspResult<Child> {
        let mut cmd = Command::new(&self.command.command);
        cmd.args(&self.command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .envs(&self.command.env)
            .kill_on_drop(true);

        if let Some(dir) = &self.command.working_directory {
            cmd.current_dir(dir);
        }

        debug!(command = %self.command.command, args = ?self.command.args, "Starting LSP server");

        cmd.spawn().map_err(|e| {
            LspError::Process(format!(
                "Failed to start server {}: {e}",
                self.command.command
            ))
        })
    }
}

impl Transport for StdioTransport {
    fn start(&mut self, sink: TransportSink) -> LspResult<()> {
        if self.child.is_some() {
            return Err(LspError::precondition("transport already started"));
        }

        let mut child = self.spawn()?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| LspError::Process("Failed to get stdin".to_string()))?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| LspError::Process("Failed to get stdout".to_string()))?;
        let stderr = child.stderr.take();

        let reader_sink = sink.clone();
        let reader = tokio::spawn(async move {
            let mut buf = vec![0u8; READ_CHUNK];
            loop {
                match stdout.read(&mut buf).await {
                    Ok(0) => {
                        reader_sink.send(TransportEvent::Closed);
                        break;
                    }
                    Ok(n) => {
                        if !reader_sink.send(TransportEvent::Received(Bytes::copy_from_slice(&buf[..n]))) {
                            break;
                        }
                    }
                    Err(e) => {
                        reader_sink.send(TransportEvent::Error(format!("read failed: {e}")));
                        break;
                    }
                }
            }
        });

        self.tasks.push(reader);

        if let Some(stderr) = stderr {
            let client = sink.client();
            self.tasks.push(tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(client = %client, stderr = %line, "LSP server stderr");
                }
            }));
        }

        let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<Bytes>();
        let writer_sink = sink;
        self.tasks.push(tokio::spawn(async move {
            while let Some(data) = writer_rx.recv().await {
                let written = match stdin.write_all(&data).await {
                    Ok(()) => stdin.flush().await,
                    Err(e) => Err(e),
                };
                if let Err(e) = written {
                    writer_sink.send(TransportEvent::Error(format!("write failed: {e}")));
                    break;
                }
            }
        }));

        self.child = Some(child);
        self.writer = Some(writer_tx);
        Ok(())
    }

    fn send(&mut self, data: Bytes) -> LspResult<()> {
        let writer = self
            .writer
            .as_ref()
            .ok_or_else(|| LspError::connection_failed("Transport closed"))?;
        trace!(bytes = data.len(), "Sending LSP message");
        writer
            .send(data)
            .map_err(|_| LspError::connection_failed("Transport closed"))
    }

    /// Stops the pump tasks as well, so nothing from this process reaches
    /// the sink after `close` returns.
    fn close(&mut self) {
        self.writer = None;
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.start_kill() {
                debug!(error = %e, "Server process already gone");
            }
        }
        debug!(command = %self.command.command, "Closed LSP server transport");
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        if let Some(ref mut child) = self.child {
            let _ = child.start_kill();
        }
    }
}

#[derive(Debug, Default)]
struct MemoryShared {
    sink: Option<TransportSink>,
    closed: bool,
}

/// In-process transport. The paired [`MemoryServer`] sees everything the
/// client writes and can inject bytes, end of stream or failures.
#[derive(Debug)]
pub struct MemoryTransport {
    shared: Arc<Mutex<MemoryShared>>,
    outgoing: mpsc::UnboundedSender<Bytes>,
    fail_start: bool,
}

/// Server end of a [`MemoryTransport`].
#[derive(Debug)]
pub struct MemoryServer {
    shared: Arc<Mutex<MemoryShared>>,
    incoming: mpsc::UnboundedReceiver<Bytes>,
}

impl MemoryTransport {
    pub fn pair() -> (MemoryTransport, MemoryServer) {
        let shared = Arc::new(Mutex::new(MemoryShared::default()));
        let (tx, rx) = mpsc::unbounded_channel();
        (
            MemoryTransport {
                shared: Arc::clone(&shared),
                outgoing: tx,
                fail_start: false,
            },
            MemoryServer {
                shared,
                incoming: rx,
            },
        )
    }

    /// Make `start` fail, as if the server binary were missing.
    pub fn failing_start(mut self) -> Self {
        self.fail_start = true;
        self
    }

    fn shared(&self) -> LspResult<std::sync::MutexGuard<'_, MemoryShared>> {
        self.shared
            .lock()
            .map_err(|_| LspError::connection_failed("memory transport poisoned"))
    }
}

impl Transport for MemoryTransport {
    fn start(&mut self, sink: TransportSink) -> LspResult<()> {
        if self.fail_start {
            return Err(LspError::Process("memory transport refused to start".to_string()));
        }
        let mut shared = self.shared()?;
        shared.sink = Some(sink);
        shared.closed = false;
        Ok(())
    }

    fn send(&mut self, data: Bytes) -> LspResult<()> {
        if self.shared()?.closed {
            return Err(LspError::connection_failed("Transport closed"));
        }
        self.outgoing
            .send(data)
            .map_err(|_| LspError::connection_failed("Transport closed"))
    }

    fn close(&mut self) {
        if let Ok(mut shared) = self.shared.lock() {
            shared.closed = true;
        }
    }
}

impl MemoryServer {
    fn deliver(&self, event: TransportEvent) -> bool {
        let shared = match self.shared.lock() {
            Ok(shared) => shared,
            Err(_) => return false,
        };
        match &shared.sink {
            Some(sink) if !shared.closed => sink.send(event),
            _ => false,
        }
    }

    /// Send raw bytes to the client.
    pub fn send_bytes(&self, data: impl Into<Bytes>) -> bool {
        self.deliver(TransportEvent::Received(data.into()))
    }

    /// Frame and send a JSON value to the client.
    pub fn send_json(&self, value: &serde_json::Value) -> bool {
        match crate::framing::frame_json(value) {
            Ok(framed) => self.send_bytes(framed),
            Err(_) => false,
        }
    }

    /// Simulate the server exiting.
    pub fn close(&self) -> bool {
        self.deliver(TransportEvent::Closed)
    }

    /// Simulate a broken pipe.
    pub fn fail(&self, message: &str) -> bool {
        self.deliver(TransportEvent::Error(message.to_string()))
    }

    /// Whether the client closed its end.
    pub fn is_closed(&self) -> bool {
        self.shared.lock().map(|s| s.closed).unwrap_or(true)
    }

    /// Drain every chunk the client has written so far.
    pub fn take_written(&mut self) -> Vec<Bytes> {
        let mut chunks = Vec::new();
        while let Ok(chunk) = self.incoming.try_recv() {
            chunks.push(chunk);
        }
        chunks
    }

    /// Wait for the next chunk written by the client.
    pub async fn next_written(&mut self) -> Option<Bytes> {
        self.incoming.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_id_display() {
        assert_eq!(ClientId(3).to_string(), "client-3");
    }

    #[test]
    fn test_memory_transport_roundtrip() {
        let (mut transport, mut server) = MemoryTransport::pair();
        let (sink, mut events) = TransportSink::channel(ClientId(1));
        transport.start(sink).unwrap();

        transport.send(Bytes::from_static(b"hello")).unwrap();
        assert_eq!(server.take_written(), vec![Bytes::from_static(b"hello")]);

        assert!(server.send_bytes(Bytes::from_static(b"world")));
        let (id, event) = events.try_recv().unwrap();
        assert_eq!(id, ClientId(1));
        assert_eq!(event, TransportEvent::Received(Bytes::from_static(b"world")));

        assert!(server.close());
        assert_eq!(events.try_recv().unwrap().1, TransportEvent::Closed);
    }

    #[test]
    fn test_memory_transport_close_rejects_send() {
        let (mut transport, server) = MemoryTransport::pair();
        let (sink, _events) = TransportSink::channel(ClientId(1));
        transport.start(sink).unwrap();
        transport.close();
        assert!(server.is_closed());
        assert!(transport.send(Bytes::from_static(b"x")).is_err());
        assert!(!server.send_bytes(Bytes::from_static(b"stale")));
    }

    #[test]
    fn test_memory_server_without_sink() {
        let (_transport, server) = MemoryTransport::pair();
        assert!(!server.send_bytes(Bytes::from_static(b"x")));
    }

    #[test]
    fn test_failing_start() {
        let (transport, _server) = MemoryTransport::pair();
        let mut transport = transport.failing_start();
        let (sink, _events) = TransportSink::channel(ClientId(1));
        assert!(matches!(transport.start(sink), Err(LspError::Process(_))));
    }

    #[tokio::test]
    async fn test_stdio_transport_spawn_failure() {
        let mut transport = StdioTransport::new(ServerCommand {
            command: "nonexistent_lsp_12345".to_string(),
            args: Vec::new(),
            env: HashMap::new(),
            working_directory: None,
        });
        let (sink, _events) = TransportSink::channel(ClientId(1));
        assert!(transport.start(sink).is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stdio_transport_echo() {
        let mut transport = StdioTransport::new(ServerCommand {
            command: "cat".to_string(),
            args: Vec::new(),
            env: HashMap::new(),
            working_directory: None,
        });
        let (sink, mut events) = TransportSink::channel(ClientId(7));
        transport.start(sink).unwrap();
        transport.send(Bytes::from_static(b"ping")).unwrap();

        let mut received = Vec::new();
        while received.len() < 4 {
            match events.recv().await {
                Some((_, TransportEvent::Received(chunk))) => received.extend_from_slice(&chunk),
                other => panic!("unexpected event: {other:?}"),
            }
        }
        assert_eq!(received, b"ping");
        transport.close();
    }
}
