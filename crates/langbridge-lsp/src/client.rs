//! One connection to a language server.
//!
//! [`Client`] is a plain state machine: it never blocks and never spawns.
//! Transport events, editor calls and timer expiry are fed in by its owner
//! ([`ClientDriver`](crate::ClientDriver) or [`ClientRegistry`](crate::ClientRegistry)),
//! and everything observable comes back out as [`ClientEvent`]s.

use crate::capabilities::{CapabilityRegistry, DocumentTarget, SemanticTokensSupport, SEMANTIC_TOKENS};
use crate::config::LspConfig;
use crate::correlator::RequestCorrelator;
use crate::diagnostics::{DiagnosticStore, DiagnosticsFilter, DiagnosticsObserver};
use crate::document::{DocumentStore, TextDocument};
use crate::error::{LspError, LspResult};
use crate::framing::{frame_json, MessageFramer};
use crate::progress::{ProgressEvent, ProgressToken, ProgressTracker};
use crate::protocol::{
    ErrorCode, Message, MessageId, NotificationMessage, RequestMessage, ResponseError,
    ResponseMessage, ResponseResult,
};
use crate::semantic_tokens::{
    DeltaOutcome, ExpandedSemanticToken, SemanticTokenStore, SemanticTokensReply, TokenRequest,
    MAX_RETRIES,
};
use crate::transport::{Transport, TransportEvent, TransportSink};
use lsp_types::{
    ClientCapabilities, ClientInfo, ConfigurationParams, DidChangeTextDocumentParams,
    DidChangeWorkspaceFoldersParams, DidCloseTextDocumentParams, DidOpenTextDocumentParams,
    DidSaveTextDocumentParams, DocumentHighlightClientCapabilities, DocumentHighlightParams,
    InitializeParams, InitializeResult, InitializedParams, LogMessageParams, MessageType,
    PartialResultParams, Position, PublishDiagnosticsClientCapabilities, PublishDiagnosticsParams,
    RegistrationParams, SemanticTokenModifier, SemanticTokenType, SemanticTokensClientCapabilities,
    SemanticTokensClientCapabilitiesRequests, SemanticTokensDeltaParams,
    SemanticTokensFullOptions, SemanticTokensParams, SemanticTokensWorkspaceClientCapabilities,
    ServerCapabilities, ShowMessageParams, ShowMessageRequestParams, TextDocumentClientCapabilities,
    TextDocumentIdentifier, TextDocumentItem, TextDocumentPositionParams, TextDocumentSaveReason,
    TextDocumentSyncClientCapabilities, TextDocumentSyncKind, TokenFormat, UnregistrationParams,
    Uri, VersionedTextDocumentIdentifier, WillSaveTextDocumentParams, WindowClientCapabilities,
    WorkDoneProgressParams, WorkspaceClientCapabilities, WorkspaceFolder,
    WorkspaceFoldersChangeEvent,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Uninitialized,
    InitializeRequested,
    Initialized,
    ShutdownRequested,
    Shutdown,
    Error,
}

impl ClientState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientState::Uninitialized => "uninitialized",
            ClientState::InitializeRequested => "initialize requested",
            ClientState::Initialized => "initialized",
            ClientState::ShutdownRequested => "shutdown requested",
            ClientState::Shutdown => "shutdown",
            ClientState::Error => "error",
        }
    }
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Something the owner of a client should know about.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// The handshake completed.
    Initialized,
    /// The connection is gone. `unexpected` is false after a requested
    /// shutdown.
    Finished { unexpected: bool },
    CapabilitiesChanged,
    /// Queued changes for the document were sent.
    DocumentUpdated(Uri),
    DiagnosticsChanged(Uri),
    SemanticTokensChanged(Uri),
    Progress(ProgressEvent),
    WorkDone(ProgressToken),
    /// `window/showMessage` from the server.
    ServerMessage { kind: MessageType, message: String },
    Error(String),
}

/// Continuation for a user request.
pub type ResponseCallback = Box<dyn FnOnce(ResponseResult) + Send>;

/// Decides whether to retry an `initialize` the server asked to retry.
pub type InitializeRetryPolicy = Box<dyn FnMut(&ResponseError) -> bool + Send>;

/// When semantic tokens are refreshed after queued changes are sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateMode {
    Now,
    /// One update threshold later, unless the document changed again.
    Delayed,
}

enum PendingHandler {
    Initialize,
    Shutdown,
    SemanticTokens {
        uri: Uri,
        version: i32,
        delta: bool,
        retries: u32,
    },
    Highlight {
        uri: Uri,
        callback: ResponseCallback,
    },
    Callback(ResponseCallback),
}

impl fmt::Debug for PendingHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PendingHandler::Initialize => f.write_str("Initialize"),
            PendingHandler::Shutdown => f.write_str("Shutdown"),
            PendingHandler::SemanticTokens { uri, delta, .. } => f
                .debug_struct("SemanticTokens")
                .field("uri", &uri.as_str())
                .field("delta", delta)
                .finish(),
            PendingHandler::Highlight { uri, .. } => {
                f.debug_struct("Highlight").field("uri", &uri.as_str()).finish()
            }
            PendingHandler::Callback(_) => f.write_str("Callback"),
        }
    }
}

/// Client side of one language server connection.
pub struct Client {
    name: String,
    config: LspConfig,
    state: ClientState,
    transport: Box<dyn Transport>,
    framer: MessageFramer,
    correlator: RequestCorrelator<PendingHandler>,
    capabilities: CapabilityRegistry,
    documents: DocumentStore,
    diagnostics: DiagnosticStore,
    tokens: SemanticTokenStore,
    progress: ProgressTracker,
    highlights: HashMap<Uri, MessageId>,
    workspace_folders: Vec<WorkspaceFolder>,
    server_name: Option<String>,
    server_version: Option<String>,
    restarts_remaining: u32,
    retry_policy: Option<InitializeRetryPolicy>,
    update_threshold: Duration,
    shutdown_timeout: Duration,
    update_deadline: Option<Instant>,
    shutdown_deadline: Option<Instant>,
    delayed_token_updates: Vec<(Instant, Uri)>,
    connected: bool,
    finished: bool,
    events: VecDeque<ClientEvent>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("name", &self.name)
            .field("state", &self.state)
            .field("pending", &self.correlator.len())
            .finish()
    }
}

impl Client {
    pub fn new(config: LspConfig, transport: Box<dyn Transport>) -> Self {
        Self {
            name: config.display_name().to_string(),
            state: ClientState::Uninitialized,
            transport,
            framer: MessageFramer::new(),
            correlator: RequestCorrelator::new(),
            capabilities: CapabilityRegistry::new(),
            documents: DocumentStore::new(),
            diagnostics: DiagnosticStore::new(),
            tokens: SemanticTokenStore::new(),
            progress: ProgressTracker::new(),
            highlights: HashMap::new(),
            workspace_folders: Vec::new(),
            server_name: None,
            server_version: None,
            restarts_remaining: config.restart_budget,
            retry_policy: None,
            update_threshold: config.document_update_threshold(),
            shutdown_timeout: config.shutdown_timeout(),
            update_deadline: None,
            shutdown_deadline: None,
            delayed_token_updates: Vec::new(),
            connected: false,
            finished: false,
            events: VecDeque::new(),
            config,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &LspConfig {
        &self.config
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn state_string(&self) -> &'static str {
        self.state.as_str()
    }

    /// Whether regular messages can be sent.
    pub fn reachable(&self) -> bool {
        self.state == ClientState::Initialized
    }

    pub fn server_name(&self) -> Option<&str> {
        self.server_name.as_deref()
    }

    pub fn server_version(&self) -> Option<&str> {
        self.server_version.as_deref()
    }

    pub fn server_capabilities(&self) -> &ServerCapabilities {
        self.capabilities.server()
    }

    pub fn capabilities(&self) -> &CapabilityRegistry {
        &self.capabilities
    }

    pub fn documents(&self) -> &DocumentStore {
        &self.documents
    }

    pub fn diagnostics(&self) -> &DiagnosticStore {
        &self.diagnostics
    }

    pub fn set_diagnostics_filter(&mut self, filter: Option<DiagnosticsFilter>) {
        self.diagnostics.set_filter(filter);
    }

    pub fn set_diagnostics_observer(&mut self, observer: Option<Box<dyn DiagnosticsObserver>>) {
        self.diagnostics.set_observer(observer);
    }

    pub fn semantic_tokens(&self) -> &SemanticTokenStore {
        &self.tokens
    }

    pub fn expanded_semantic_tokens(&self, uri: &Uri) -> Vec<ExpandedSemanticToken> {
        self.tokens.expanded_tokens(uri)
    }

    pub fn progress(&self) -> &ProgressTracker {
        &self.progress
    }

    pub fn set_progress_title_for_token(&mut self, token: ProgressToken, title: impl Into<String>) {
        self.progress.set_title_for_token(token, title);
    }

    pub fn set_initialize_retry_policy(&mut self, policy: Option<InitializeRetryPolicy>) {
        self.retry_policy = policy;
    }

    pub fn workspace_folders(&self) -> &[WorkspaceFolder] {
        &self.workspace_folders
    }

    /// Folders announced in `initialize`. The first one is the root.
    pub fn set_workspace_folders(&mut self, folders: Vec<WorkspaceFolder>) {
        self.workspace_folders = folders;
    }

    pub fn set_document_change_update_threshold(&mut self, threshold: Duration) {
        self.update_threshold = threshold;
    }

    pub fn restarts_remaining(&self) -> u32 {
        self.restarts_remaining
    }

    pub fn pending_requests(&self) -> usize {
        self.correlator.len()
    }

    pub fn next_event(&mut self) -> Option<ClientEvent> {
        self.events.pop_front()
    }

    pub fn drain_events(&mut self) -> Vec<ClientEvent> {
        self.events.drain(..).collect()
    }

    pub fn has_events(&self) -> bool {
        !self.events.is_empty()
    }

    fn emit(&mut self, event: ClientEvent) {
        self.events.push_back(event);
    }

    fn emit_finished(&mut self, unexpected: bool) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.emit(ClientEvent::Finished { unexpected });
    }

    fn finished_unexpectedly(&self) -> bool {
        !matches!(self.state, ClientState::Shutdown | ClientState::ShutdownRequested)
    }

    /// Start the transport. Events are delivered into `sink`.
    pub fn start(&mut self, sink: TransportSink) -> LspResult<()> {
        self.finished = false;
        if let Err(e) = self.transport.start(sink) {
            error!(client = %self.name, error = %e, "Failed to start language server");
            self.emit(ClientEvent::Error(e.to_string()));
            self.emit_finished(true);
            return Err(e);
        }
        self.connected = true;
        info!(client = %self.name, "Language server started");
        Ok(())
    }

    // Handshake

    /// Send `initialize`. Only valid from [`ClientState::Uninitialized`].
    pub fn initialize(&mut self) -> LspResult<()> {
        if self.state != ClientState::Uninitialized {
            warn!(client = %self.name, state = %self.state, "initialize called in wrong state");
            return Err(LspError::precondition(format!(
                "initialize requires state uninitialized, client is {}",
                self.state
            )));
        }

        let params = self.initialize_params();
        let id = self.correlator.next_id();
        let request = RequestMessage::new(id.clone(), "initialize", Some(serde_json::to_value(&params)?));
        self.correlator.insert(id.clone(), PendingHandler::Initialize);
        if let Err(e) = self.write_message(&request) {
            self.correlator.cancel(&id);
            return Err(e);
        }
        debug!(client = %self.name, id = %id, "Sent initialize");
        self.state = ClientState::InitializeRequested;
        Ok(())
    }

    #[allow(deprecated)] // root_uri is deprecated but older servers still read it
    fn initialize_params(&self) -> InitializeParams {
        InitializeParams {
            process_id: Some(std::process::id()),
            root_uri: self.workspace_folders.first().map(|folder| folder.uri.clone()),
            workspace_folders: (!self.workspace_folders.is_empty())
                .then(|| self.workspace_folders.clone()),
            initialization_options: self.config.initialization_options.clone(),
            capabilities: client_capabilities(),
            client_info: Some(ClientInfo {
                name: env!("CARGO_PKG_NAME").to_string(),
                version: Some(env!("CARGO_PKG_VERSION").to_string()),
            }),
            ..Default::default()
        }
    }

    fn initialize_callback(&mut self, result: ResponseResult) {
        let value = match result {
            Ok(value) => value,
            Err(error) => {
                if error.retry_requested() && self.should_retry(&error) {
                    info!(client = %self.name, error = %error, "Retrying initialize");
                    self.state = ClientState::Uninitialized;
                    if let Err(e) = self.initialize() {
                        self.fail_initialize(e.to_string());
                    }
                } else {
                    self.fail_initialize(format!("Initialize error: {error}"));
                }
                return;
            }
        };

        let result: InitializeResult = match serde_json::from_value(value) {
            Ok(result) => result,
            Err(e) => {
                self.fail_initialize(format!("Initialize result is not valid: {e}"));
                return;
            }
        };

        if let Some(info) = result.server_info {
            self.server_name = Some(info.name);
            self.server_version = info.version;
        }
        self.capabilities.set_server(result.capabilities);
        if let Some(legend) = self
            .capabilities
            .static_semantic_tokens()
            .and_then(|support| support.legend)
        {
            self.tokens.set_legend(legend);
        }

        self.state = ClientState::Initialized;
        info!(
            client = %self.name,
            server = self.server_name.as_deref().unwrap_or("unknown"),
            version = self.server_version.as_deref().unwrap_or("unknown"),
            "Language server initialized"
        );
        self.send_notification_direct("initialized", &InitializedParams {});

        for doc in self.documents.take_postponed() {
            self.open_document(doc);
        }
        self.emit(ClientEvent::Initialized);
    }

    fn should_retry(&mut self, error: &ResponseError) -> bool {
        match self.retry_policy.as_mut() {
            Some(policy) => policy(error),
            None => true,
        }
    }

    fn fail_initialize(&mut self, message: String) {
        let error = LspError::Initialization(message);
        error!(client = %self.name, "{error}");
        self.state = ClientState::Error;
        self.emit(ClientEvent::Error(error.to_string()));
        self.emit_finished(true);
    }

    /// Send `shutdown` and arm the shutdown timer. Only valid from
    /// [`ClientState::Initialized`]; otherwise the client reports itself
    /// finished right away.
    pub fn shutdown(&mut self) -> LspResult<()> {
        if self.state != ClientState::Initialized {
            warn!(client = %self.name, state = %self.state, "shutdown called in wrong state");
            self.emit_finished(false);
            return Err(LspError::InvalidState(self.state.as_str().to_string()));
        }
        if self
            .send_request_with("shutdown", Value::Null, PendingHandler::Shutdown)
            .is_none()
        {
            self.emit_finished(false);
            return Err(LspError::connection_failed("Failed to send shutdown"));
        }
        self.state = ClientState::ShutdownRequested;
        self.shutdown_deadline = Some(Instant::now() + self.shutdown_timeout);
        Ok(())
    }

    fn shutdown_callback(&mut self, result: ResponseResult) {
        self.shutdown_deadline = None;
        if let Err(error) = result {
            warn!(client = %self.name, error = %error, "Shutdown request failed");
        }
        self.send_notification_direct("exit", &Value::Null);
        self.state = ClientState::Shutdown;
        debug!(client = %self.name, "Language server shut down");
    }

    fn shutdown_timed_out(&mut self) {
        warn!(client = %self.name, "Language server did not answer shutdown in time");
        self.shutdown_deadline = None;
        self.send_notification_direct("exit", &Value::Null);
        self.state = ClientState::Shutdown;
        self.fail_pending();
        self.transport.close();
        self.emit_finished(false);
    }

    /// Prepare for a restart. Returns false once the restart budget is spent.
    ///
    /// Documents stay tracked: they are re-opened with their current text
    /// and version after the next successful `initialize`.
    pub fn reset(&mut self) -> bool {
        if self.restarts_remaining == 0 {
            warn!(client = %self.name, "Restart budget exhausted");
            return false;
        }
        self.restarts_remaining -= 1;
        debug!(client = %self.name, remaining = self.restarts_remaining, "Resetting client");

        self.transport.close();
        self.connected = false;
        self.state = ClientState::Uninitialized;
        self.framer.reset();
        self.correlator.clear();
        self.capabilities.reset();
        self.diagnostics.clear_diagnostics();
        self.tokens.reset();
        for event in self.progress.reset() {
            self.emit(ClientEvent::Progress(event));
        }
        self.highlights.clear();
        self.documents.reset();
        self.server_name = None;
        self.server_version = None;
        self.update_deadline = None;
        self.shutdown_deadline = None;
        self.delayed_token_updates.clear();
        self.finished = false;
        true
    }

    // Transport

    /// Feed one event from the transport.
    ///
    /// Events arriving while no connection is live belong to a connection
    /// that was already torn down and are dropped.
    pub fn handle_transport_event(&mut self, event: TransportEvent) {
        if !self.connected {
            debug!(client = %self.name, event = ?event, "Dropping event from a closed connection");
            return;
        }
        match event {
            TransportEvent::Received(data) => {
                for message in self.framer.push(&data) {
                    match message {
                        Ok(message) => self.handle_message(message),
                        Err(e) => {
                            warn!(client = %self.name, error = %e, "Dropping unreadable message");
                            self.emit(ClientEvent::Error(e.to_string()));
                        }
                    }
                }
            }
            TransportEvent::Closed => self.connection_lost(None),
            TransportEvent::Error(message) => self.connection_lost(Some(message)),
        }
    }

    fn connection_lost(&mut self, error: Option<String>) {
        if self.finished {
            return;
        }
        let unexpected = self.finished_unexpectedly();
        match &error {
            Some(message) => {
                error!(client = %self.name, error = %message, "Connection to language server failed")
            }
            None if unexpected => warn!(client = %self.name, "Language server exited unexpectedly"),
            None => debug!(client = %self.name, "Language server exited"),
        }
        if let Some(message) = error {
            self.emit(ClientEvent::Error(message));
        }
        self.fail_pending();
        if self.state == ClientState::ShutdownRequested {
            self.state = ClientState::Shutdown;
        }
        self.shutdown_deadline = None;
        self.update_deadline = None;
        self.transport.close();
        self.connected = false;
        self.emit_finished(unexpected);
    }

    /// Invoke every outstanding user callback with a connection error.
    fn fail_pending(&mut self) {
        for (_, handler) in self.correlator.drain() {
            fail_handler(handler, ResponseError::connection_closed());
        }
        self.highlights.clear();
    }

    fn write_message<T: Serialize>(&mut self, message: &T) -> LspResult<()> {
        let framed = frame_json(message)?;
        trace!(client = %self.name, bytes = framed.len(), "Sending message");
        self.transport.send(framed)
    }

    /// Handshake path: no state check, no document flush.
    fn send_notification_direct<P: Serialize>(&mut self, method: &str, params: &P) {
        let params = match serde_json::to_value(params) {
            Ok(Value::Null) => None,
            Ok(value) => Some(value),
            Err(e) => {
                warn!(client = %self.name, method, error = %e, "Failed to encode params");
                return;
            }
        };
        let notification = NotificationMessage::new(method, params);
        if let Err(e) = self.write_message(&notification) {
            warn!(client = %self.name, method, error = %e, "Failed to send notification");
        }
    }

    fn flush_before_send(&mut self) {
        if self.documents.any_pending_changes() {
            self.send_postponed_document_updates(UpdateMode::Delayed);
        }
    }

    /// Send a notification. Returns false when the client is not reachable
    /// or the write failed.
    pub fn send_notification<P: Serialize>(&mut self, method: &str, params: &P) -> bool {
        if !self.reachable() {
            debug!(client = %self.name, method, state = %self.state, "Dropping notification");
            return false;
        }
        self.flush_before_send();
        self.send_notification_raw(method, params)
    }

    fn send_notification_raw<P: Serialize>(&mut self, method: &str, params: &P) -> bool {
        let params = match serde_json::to_value(params) {
            Ok(value) => value,
            Err(e) => {
                warn!(client = %self.name, method, error = %e, "Failed to encode params");
                return false;
            }
        };
        let notification = NotificationMessage::new(method, Some(params));
        match self.write_message(&notification) {
            Ok(()) => true,
            Err(e) => {
                warn!(client = %self.name, method, error = %e, "Failed to send notification");
                false
            }
        }
    }

    /// Send a request. `callback` runs exactly once with the response or a
    /// connection error, unless the request is cancelled or the client is
    /// reset first.
    pub fn send_request<F>(&mut self, method: &str, params: Value, callback: F) -> Option<MessageId>
    where
        F: FnOnce(ResponseResult) + Send + 'static,
    {
        self.send_request_with(method, params, PendingHandler::Callback(Box::new(callback)))
    }

    fn send_request_with(&mut self, method: &str, params: Value, handler: PendingHandler) -> Option<MessageId> {
        if !self.reachable() {
            debug!(client = %self.name, method, state = %self.state, "Dropping request");
            return None;
        }
        self.flush_before_send();
        let id = self.correlator.next_id();
        let request = RequestMessage::new(id.clone(), method, Some(params));
        match self.write_message(&request) {
            Ok(()) => {
                trace!(client = %self.name, method, id = %id, "Sent request");
                self.correlator.insert(id.clone(), handler);
                Some(id)
            }
            Err(e) => {
                warn!(client = %self.name, method, error = %e, "Failed to send request");
                fail_handler(handler, ResponseError::new(ErrorCode::INTERNAL_ERROR, e.to_string()));
                None
            }
        }
    }

    /// Forget a request. A late response is dropped without running its
    /// callback. The server is told only when reachable.
    pub fn cancel_request(&mut self, id: &MessageId) {
        if !self.correlator.cancel(id) {
            return;
        }
        self.highlights.retain(|_, pending| pending != id);
        if self.reachable() {
            self.send_notification_raw("$/cancelRequest", &json!({ "id": id }));
        }
    }

    // Inbound

    pub fn handle_message(&mut self, message: Message) {
        match message {
            Message::Response(response) => {
                let Some(id) = response.id.clone() else {
                    warn!(client = %self.name, error = ?response.error, "Response without id");
                    return;
                };
                match self.correlator.take(&id) {
                    Some(handler) => self.handle_response(id, handler, response.into_result()),
                    None => debug!(client = %self.name, id = %id, "Response for unknown request"),
                }
            }
            Message::Request(request) => {
                self.handle_method(&request.method, Some(request.id), request.params)
            }
            Message::Notification(notification) => {
                self.handle_method(&notification.method, None, notification.params)
            }
        }
    }

    fn handle_response(&mut self, id: MessageId, handler: PendingHandler, result: ResponseResult) {
        match handler {
            PendingHandler::Initialize => self.initialize_callback(result),
            PendingHandler::Shutdown => self.shutdown_callback(result),
            PendingHandler::SemanticTokens {
                uri,
                version,
                delta,
                retries,
            } => self.semantic_tokens_callback(uri, version, delta, retries, result),
            PendingHandler::Highlight { uri, callback } => {
                if self.highlights.get(&uri) == Some(&id) {
                    self.highlights.remove(&uri);
                }
                callback(result);
            }
            PendingHandler::Callback(callback) => callback(result),
        }
    }

    fn handle_method(&mut self, method: &str, id: Option<MessageId>, params: Option<Value>) {
        let params = params.unwrap_or(Value::Null);
        trace!(client = %self.name, method, "Incoming method");
        let response: Option<ResponseResult> = match method {
            "textDocument/publishDiagnostics" => {
                if let Ok(params) = self.parse_params::<PublishDiagnosticsParams>(method, params) {
                    self.handle_diagnostics(params);
                }
                None
            }
            "$/progress" => {
                if let Some(event) = self.progress.handle_notification(params) {
                    self.relay_progress(event);
                }
                None
            }
            "window/logMessage" => {
                if let Ok(params) = self.parse_params::<LogMessageParams>(method, params) {
                    self.log_server_message(params.typ, &params.message);
                }
                None
            }
            "window/showMessage" => {
                if let Ok(params) = self.parse_params::<ShowMessageParams>(method, params) {
                    self.log_server_message(params.typ, &params.message);
                    self.emit(ClientEvent::ServerMessage {
                        kind: params.typ,
                        message: params.message,
                    });
                }
                None
            }
            "window/showMessageRequest" => Some(
                self.parse_params::<ShowMessageRequestParams>(method, params)
                    .map(|params| {
                        self.log_server_message(params.typ, &params.message);
                        Value::Null
                    }),
            ),
            "client/registerCapability" => Some(
                self.parse_params::<RegistrationParams>(method, params)
                    .map(|params| {
                        self.register_capabilities(params);
                        Value::Null
                    }),
            ),
            "client/unregisterCapability" => Some(
                self.parse_params::<UnregistrationParams>(method, params)
                    .map(|params| {
                        self.unregister_capabilities(params);
                        Value::Null
                    }),
            ),
            "window/workDoneProgress/create" => Some(Ok(Value::Null)),
            "workspace/workspaceFolders" => Some(Ok(if self.workspace_folders.is_empty() {
                Value::Null
            } else {
                json!(self.workspace_folders)
            })),
            "workspace/configuration" => Some(
                self.parse_params::<ConfigurationParams>(method, params)
                    .map(|params| Value::Array(vec![Value::Null; params.items.len()])),
            ),
            "workspace/semanticTokens/refresh" => {
                self.refresh_semantic_tokens();
                Some(Ok(Value::Null))
            }
            _ => {
                if id.is_some() {
                    debug!(client = %self.name, method, "Unsupported request");
                    Some(Err(ResponseError::new(
                        ErrorCode::METHOD_NOT_FOUND,
                        format!("Method not found: {method}"),
                    )))
                } else {
                    debug!(client = %self.name, method, "Ignoring notification");
                    None
                }
            }
        };

        if let (Some(id), Some(result)) = (id, response) {
            self.respond(id, result);
        }
    }

    fn parse_params<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, ResponseError> {
        serde_json::from_value(params).map_err(|e| {
            warn!(client = %self.name, method, error = %e, "Invalid params");
            ResponseError::new(
                ErrorCode::INVALID_PARAMS,
                format!("Invalid parameter in \"{method}\": {e}"),
            )
        })
    }

    fn respond(&mut self, id: MessageId, result: ResponseResult) {
        if !self.reachable() {
            debug!(client = %self.name, id = %id, state = %self.state, "Dropping response");
            return;
        }
        let response = match result {
            Ok(value) => ResponseMessage::success(id, value),
            Err(error) => ResponseMessage::failure(id, error),
        };
        if let Err(e) = self.write_message(&response) {
            warn!(client = %self.name, error = %e, "Failed to send response");
        }
    }

    fn log_server_message(&self, kind: MessageType, message: &str) {
        match kind {
            MessageType::ERROR => error!(client = %self.name, "{message}"),
            MessageType::WARNING => warn!(client = %self.name, "{message}"),
            MessageType::INFO => info!(client = %self.name, "{message}"),
            _ => debug!(client = %self.name, "{message}"),
        }
    }

    fn relay_progress(&mut self, event: ProgressEvent) {
        let done = match &event {
            ProgressEvent::End { token, .. } => Some(token.clone()),
            _ => None,
        };
        self.emit(ClientEvent::Progress(event));
        if let Some(token) = done {
            self.emit(ClientEvent::WorkDone(token));
        }
    }

    fn handle_diagnostics(&mut self, params: PublishDiagnosticsParams) {
        let uri = params.uri;
        debug!(
            client = %self.name,
            uri = uri.as_str(),
            count = params.diagnostics.len(),
            version = ?params.version,
            "Diagnostics published"
        );
        self.diagnostics
            .set_diagnostics(&uri, params.diagnostics, params.version);
        if self.documents.is_active(&uri) {
            let version = self.documents.version(&uri).unwrap_or(0);
            self.diagnostics.show_diagnostics(&uri, version);
        }
        self.emit(ClientEvent::DiagnosticsChanged(uri));
    }

    // Capabilities

    fn register_capabilities(&mut self, params: RegistrationParams) {
        self.capabilities
            .dynamic_mut()
            .register(&params.registrations);
        let mut tokens_changed = false;
        for registration in &params.registrations {
            debug!(client = %self.name, method = %registration.method, "Capability registered");
            if registration.method == SEMANTIC_TOKENS {
                if let Some(legend) = registration
                    .register_options
                    .as_ref()
                    .and_then(SemanticTokensSupport::from_options)
                    .and_then(|support| support.legend)
                {
                    self.tokens.set_legend(legend);
                }
                tokens_changed = true;
            }
        }
        if tokens_changed {
            self.update_all_semantic_tokens();
        }
        self.emit(ClientEvent::CapabilitiesChanged);
    }

    fn unregister_capabilities(&mut self, params: UnregistrationParams) {
        let tokens_changed = params
            .unregisterations
            .iter()
            .any(|u| u.method == SEMANTIC_TOKENS || self.registration_method(&u.id) == Some(SEMANTIC_TOKENS));
        self.capabilities
            .dynamic_mut()
            .unregister(&params.unregisterations);
        if tokens_changed {
            self.update_all_semantic_tokens();
        }
        self.emit(ClientEvent::CapabilitiesChanged);
    }

    fn registration_method(&self, id: &str) -> Option<&'static str> {
        self.capabilities
            .dynamic()
            .get(SEMANTIC_TOKENS)
            .filter(|cap| cap.registration_id == id)
            .map(|_| SEMANTIC_TOKENS)
    }

    // Documents

    /// Announce `doc` to the server. Before initialization the document is
    /// queued and opened once the handshake completes.
    pub fn open_document(&mut self, doc: TextDocument) -> bool {
        if self.documents.is_open(&doc.uri) || !self.config.handles_document(&doc) {
            return false;
        }
        if self.state != ClientState::Initialized {
            debug!(client = %self.name, uri = doc.uri.as_str(), "Postponing document open");
            self.documents.postpone(doc);
            return true;
        }
        if !self
            .capabilities
            .did_open_enabled(&DocumentTarget::new(&doc.uri, &doc.language_id))
        {
            debug!(client = %self.name, uri = doc.uri.as_str(), "Server does not want didOpen");
            return false;
        }

        let version = self.documents.open(&doc).version;
        let uri = doc.uri.clone();
        let params = DidOpenTextDocumentParams {
            text_document: TextDocumentItem {
                uri: doc.uri,
                language_id: doc.language_id,
                version,
                text: doc.text,
            },
        };
        self.send_notification("textDocument/didOpen", &params);
        debug!(client = %self.name, uri = uri.as_str(), version, "Opened document");

        if self.config.activate_documents_automatically {
            self.activate_document(&uri);
        }
        true
    }

    /// Stop tracking a document. Queued changes are dropped.
    pub fn close_document(&mut self, uri: &Uri) {
        self.deactivate_document(uri);
        if let Some(id) = self.highlights.remove(uri) {
            self.cancel_request(&id);
        }
        self.tokens.remove(uri);
        self.delayed_token_updates.retain(|(_, pending)| pending != uri);
        if self.documents.close(uri) && self.state == ClientState::Initialized {
            let params = DidCloseTextDocumentParams {
                text_document: TextDocumentIdentifier { uri: uri.clone() },
            };
            self.send_notification("textDocument/didClose", &params);
        }
    }

    pub fn is_document_open(&self, uri: &Uri) -> bool {
        self.documents.is_open(uri)
    }

    pub fn document_version(&self, uri: &Uri) -> Option<i32> {
        self.documents.version(uri)
    }

    /// Whether `uri` has changes that were not sent yet.
    pub fn document_update_postponed(&self, uri: &Uri) -> bool {
        self.documents.has_pending_changes(uri)
    }

    /// Make this client the one whose results are shown for `uri`.
    pub fn activate_document(&mut self, uri: &Uri) {
        if !self.documents.is_open(uri) {
            return;
        }
        self.documents.activate(uri);
        let version = self.documents.version(uri).unwrap_or(0);
        self.diagnostics.show_diagnostics(uri, version);
        self.update_semantic_tokens(uri);
    }

    pub fn deactivate_document(&mut self, uri: &Uri) {
        self.documents.deactivate(uri);
        self.diagnostics.hide_diagnostics(uri);
    }

    pub fn is_document_active(&self, uri: &Uri) -> bool {
        self.documents.is_active(uri)
    }

    /// Record an edit. `doc` holds the text after the edit; `position`,
    /// `chars_removed` and `chars_added` are counted in chars.
    pub fn document_contents_changed(
        &mut self,
        doc: &TextDocument,
        position: usize,
        chars_removed: usize,
        chars_added: usize,
    ) {
        if let Some(version) = self.documents.update_postponed(doc) {
            trace!(client = %self.name, uri = doc.uri.as_str(), version, "Postponed document changed");
            return;
        }
        if !self.documents.is_open(&doc.uri) || !self.reachable() {
            return;
        }

        let kind = self
            .capabilities
            .sync_kind(&DocumentTarget::new(&doc.uri, &doc.language_id));
        let Some(open) = self.documents.get_mut(&doc.uri) else {
            return;
        };
        let version = open.record_change(&doc.text, position, chars_removed, chars_added, kind);
        trace!(client = %self.name, uri = doc.uri.as_str(), version, ?kind, "Document changed");

        if let Some(id) = self.highlights.remove(&doc.uri) {
            self.cancel_request(&id);
        }
        if kind != TextDocumentSyncKind::NONE {
            self.update_deadline = Some(Instant::now() + self.update_threshold);
        }
    }

    /// Send every queued change as `didChange`.
    pub fn send_postponed_document_updates(&mut self, mode: UpdateMode) {
        self.update_deadline = None;
        if !self.reachable() {
            return;
        }
        for (uri, version, changes) in self.documents.take_pending_changes() {
            let params = DidChangeTextDocumentParams {
                text_document: VersionedTextDocumentIdentifier {
                    uri: uri.clone(),
                    version,
                },
                content_changes: changes,
            };
            self.send_notification_raw("textDocument/didChange", &params);
            self.emit(ClientEvent::DocumentUpdated(uri.clone()));
            match mode {
                UpdateMode::Now => self.update_semantic_tokens(&uri),
                UpdateMode::Delayed => {
                    let due = Instant::now() + self.update_threshold;
                    self.delayed_token_updates.retain(|(_, pending)| pending != &uri);
                    self.delayed_token_updates.push((due, uri));
                }
            }
        }
    }

    pub fn document_contents_saved(&mut self, doc: &TextDocument) {
        if !self.documents.is_open(&doc.uri) {
            return;
        }
        let Some(save) = self
            .capabilities
            .save_notification(&DocumentTarget::new(&doc.uri, &doc.language_id))
        else {
            return;
        };
        let params = DidSaveTextDocumentParams {
            text_document: TextDocumentIdentifier {
                uri: doc.uri.clone(),
            },
            text: save.include_text.then(|| doc.text.clone()),
        };
        self.send_notification("textDocument/didSave", &params);
    }

    pub fn document_will_save(&mut self, doc: &TextDocument) {
        if !self.documents.is_open(&doc.uri)
            || !self
                .capabilities
                .will_save_enabled(&DocumentTarget::new(&doc.uri, &doc.language_id))
        {
            return;
        }
        let params = WillSaveTextDocumentParams {
            text_document: TextDocumentIdentifier {
                uri: doc.uri.clone(),
            },
            reason: TextDocumentSaveReason::MANUAL,
        };
        self.send_notification("textDocument/willSave", &params);
    }

    /// Ask for the highlights of the symbol at `position`. An earlier
    /// request for the same document is cancelled.
    pub fn request_document_highlights<F>(&mut self, uri: &Uri, position: Position, callback: F) -> Option<MessageId>
    where
        F: FnOnce(ResponseResult) + Send + 'static,
    {
        let enabled = {
            let doc = self.documents.get(uri)?;
            self.capabilities
                .document_highlight_enabled(&DocumentTarget::new(uri, &doc.language_id))
        };
        if !enabled || self.documents.has_pending_changes(uri) {
            return None;
        }
        if let Some(id) = self.highlights.remove(uri) {
            self.cancel_request(&id);
        }
        let params = DocumentHighlightParams {
            text_document_position_params: TextDocumentPositionParams {
                text_document: TextDocumentIdentifier { uri: uri.clone() },
                position,
            },
            work_done_progress_params: WorkDoneProgressParams::default(),
            partial_result_params: PartialResultParams::default(),
        };
        let params = serde_json::to_value(&params).ok()?;
        let id = self.send_request_with(
            "textDocument/documentHighlight",
            params,
            PendingHandler::Highlight {
                uri: uri.clone(),
                callback: Box::new(callback),
            },
        )?;
        self.highlights.insert(uri.clone(), id.clone());
        Some(id)
    }

    // Workspace

    /// Update the folder list and tell the server when it supports it.
    pub fn send_workspace_folder_changes(&mut self, added: Vec<WorkspaceFolder>, removed: Vec<WorkspaceFolder>) {
        self.workspace_folders
            .retain(|folder| !removed.iter().any(|r| r.uri == folder.uri));
        for folder in &added {
            if !self.workspace_folders.iter().any(|f| f.uri == folder.uri) {
                self.workspace_folders.push(folder.clone());
            }
        }
        if !self.reachable() || !self.capabilities.workspace_folder_changes_enabled() {
            return;
        }
        let params = DidChangeWorkspaceFoldersParams {
            event: WorkspaceFoldersChangeEvent { added, removed },
        };
        self.send_notification("workspace/didChangeWorkspaceFolders", &params);
    }

    /// Whether `workspace/symbol` can be sent.
    pub fn supports_workspace_symbols(&self) -> bool {
        self.reachable() && self.capabilities.workspace_symbol_enabled()
    }

    // Semantic tokens

    fn semantic_token_support(&self, uri: &Uri) -> Option<SemanticTokensSupport> {
        let doc = self.documents.get(uri)?;
        self.capabilities
            .semantic_tokens(&DocumentTarget::new(uri, &doc.language_id))
    }

    /// Bring the tokens of `uri` up to its current version.
    pub fn update_semantic_tokens(&mut self, uri: &Uri) {
        self.update_semantic_tokens_with(uri, MAX_RETRIES);
    }

    /// Request a full token set for `uri`.
    pub fn reload_semantic_tokens(&mut self, uri: &Uri) {
        self.reload_semantic_tokens_with(uri, MAX_RETRIES);
    }

    fn update_semantic_tokens_with(&mut self, uri: &Uri, retries: u32) {
        let Some(support) = self.semantic_token_support(uri) else {
            return;
        };
        let version = self.documents.version(uri).unwrap_or(0);
        if let Some(request) = self.tokens.plan_update(uri, version, &support) {
            self.send_token_request(uri, request, retries);
        }
    }

    fn reload_semantic_tokens_with(&mut self, uri: &Uri, retries: u32) {
        let Some(support) = self.semantic_token_support(uri) else {
            return;
        };
        if let Some(request) = self.tokens.plan_reload(&support) {
            self.send_token_request(uri, request, retries);
        }
    }

    fn send_token_request(&mut self, uri: &Uri, request: TokenRequest, retries: u32) {
        let version = self.documents.version(uri).unwrap_or(0);
        let text_document = TextDocumentIdentifier { uri: uri.clone() };
        let params = match &request {
            TokenRequest::Full => serde_json::to_value(SemanticTokensParams {
                work_done_progress_params: WorkDoneProgressParams::default(),
                partial_result_params: PartialResultParams::default(),
                text_document,
            }),
            TokenRequest::Delta { previous_result_id } => serde_json::to_value(SemanticTokensDeltaParams {
                work_done_progress_params: WorkDoneProgressParams::default(),
                partial_result_params: PartialResultParams::default(),
                text_document,
                previous_result_id: previous_result_id.clone(),
            }),
        };
        let params = match params {
            Ok(params) => params,
            Err(e) => {
                warn!(client = %self.name, error = %e, "Failed to encode token request");
                return;
            }
        };
        let handler = PendingHandler::SemanticTokens {
            uri: uri.clone(),
            version,
            delta: matches!(request, TokenRequest::Delta { .. }),
            retries,
        };
        self.send_request_with(request.method(), params, handler);
    }

    fn semantic_tokens_callback(&mut self, uri: Uri, version: i32, delta: bool, retries: u32, result: ResponseResult) {
        if !self.documents.is_open(&uri) {
            return;
        }
        let value = match result {
            Ok(value) => value,
            Err(error) => {
                debug!(client = %self.name, uri = uri.as_str(), error = %error, retries, "Semantic token request failed");
                match (delta, retries) {
                    (true, 0) => self.reload_semantic_tokens_with(&uri, 1),
                    (true, n) => self.update_semantic_tokens_with(&uri, n - 1),
                    (false, 0) => {}
                    (false, n) => self.reload_semantic_tokens_with(&uri, n - 1),
                }
                return;
            }
        };
        let reply = match SemanticTokensReply::from_value(value) {
            Ok(reply) => reply,
            Err(e) => {
                warn!(client = %self.name, uri = uri.as_str(), error = %e, "Invalid semantic tokens");
                return;
            }
        };

        if delta {
            if self.tokens.handle_delta_reply(&uri, reply, version) == DeltaOutcome::Desynchronized {
                debug!(client = %self.name, uri = uri.as_str(), "Semantic tokens out of sync, reloading");
                self.reload_semantic_tokens(&uri);
                return;
            }
        } else {
            match reply {
                SemanticTokensReply::Full(tokens) => self.tokens.handle_full(&uri, tokens, version),
                SemanticTokensReply::Empty => return,
                SemanticTokensReply::Delta(_) => {
                    warn!(client = %self.name, uri = uri.as_str(), "Delta reply to a full token request");
                    return;
                }
            }
        }
        self.emit(ClientEvent::SemanticTokensChanged(uri));
    }

    fn update_all_semantic_tokens(&mut self) {
        let mut uris = self.documents.open_uris();
        uris.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        for uri in uris {
            self.update_semantic_tokens(&uri);
        }
    }

    /// Drop every stored token set and request fresh ones.
    pub fn refresh_semantic_tokens(&mut self) {
        self.tokens.clear();
        self.update_all_semantic_tokens();
    }

    // Timers

    /// Earliest instant at which [`handle_timeout`](Self::handle_timeout)
    /// has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        [self.update_deadline, self.shutdown_deadline]
            .into_iter()
            .flatten()
            .chain(self.delayed_token_updates.iter().map(|(due, _)| *due))
            .min()
    }

    /// Run every timer that expired at `now`.
    pub fn handle_timeout(&mut self, now: Instant) {
        if self.shutdown_deadline.is_some_and(|due| due <= now) {
            self.shutdown_timed_out();
        }
        if self.update_deadline.is_some_and(|due| due <= now) {
            self.send_postponed_document_updates(UpdateMode::Now);
        }
        let (due, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.delayed_token_updates)
            .into_iter()
            .partition(|(deadline, _)| *deadline <= now);
        self.delayed_token_updates = pending;
        for (_, uri) in due {
            if !self.documents.has_pending_changes(&uri) {
                self.update_semantic_tokens(&uri);
            }
        }
    }
}

fn fail_handler(handler: PendingHandler, error: ResponseError) {
    match handler {
        PendingHandler::Callback(callback) | PendingHandler::Highlight { callback, .. } => {
            callback(Err(error))
        }
        PendingHandler::Initialize | PendingHandler::Shutdown | PendingHandler::SemanticTokens { .. } => {}
    }
}

/// Capabilities this client announces in `initialize`.
pub fn client_capabilities() -> ClientCapabilities {
    ClientCapabilities {
        workspace: Some(WorkspaceClientCapabilities {
            workspace_folders: Some(true),
            configuration: Some(true),
            semantic_tokens: Some(SemanticTokensWorkspaceClientCapabilities {
                refresh_support: Some(true),
            }),
            ..Default::default()
        }),
        text_document: Some(TextDocumentClientCapabilities {
            synchronization: Some(TextDocumentSyncClientCapabilities {
                dynamic_registration: Some(true),
                will_save: Some(true),
                will_save_wait_until: Some(false),
                did_save: Some(true),
            }),
            publish_diagnostics: Some(PublishDiagnosticsClientCapabilities {
                related_information: Some(true),
                version_support: Some(true),
                ..Default::default()
            }),
            document_highlight: Some(DocumentHighlightClientCapabilities {
                dynamic_registration: Some(true),
            }),
            semantic_tokens: Some(SemanticTokensClientCapabilities {
                dynamic_registration: Some(true),
                requests: SemanticTokensClientCapabilitiesRequests {
                    range: Some(false),
                    full: Some(SemanticTokensFullOptions::Delta { delta: Some(true) }),
                },
                token_types: supported_token_types(),
                token_modifiers: supported_token_modifiers(),
                formats: vec![TokenFormat::RELATIVE],
                ..Default::default()
            }),
            ..Default::default()
        }),
        window: Some(WindowClientCapabilities {
            work_done_progress: Some(true),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn supported_token_types() -> Vec<SemanticTokenType> {
    vec![
        SemanticTokenType::NAMESPACE,
        SemanticTokenType::TYPE,
        SemanticTokenType::CLASS,
        SemanticTokenType::ENUM,
        SemanticTokenType::INTERFACE,
        SemanticTokenType::STRUCT,
        SemanticTokenType::TYPE_PARAMETER,
        SemanticTokenType::PARAMETER,
        SemanticTokenType::VARIABLE,
        SemanticTokenType::PROPERTY,
        SemanticTokenType::ENUM_MEMBER,
        SemanticTokenType::EVENT,
        SemanticTokenType::FUNCTION,
        SemanticTokenType::METHOD,
        SemanticTokenType::MACRO,
        SemanticTokenType::KEYWORD,
        SemanticTokenType::MODIFIER,
        SemanticTokenType::COMMENT,
        SemanticTokenType::STRING,
        SemanticTokenType::NUMBER,
        SemanticTokenType::REGEXP,
        SemanticTokenType::OPERATOR,
    ]
}

fn supported_token_modifiers() -> Vec<SemanticTokenModifier> {
    vec![
        SemanticTokenModifier::DECLARATION,
        SemanticTokenModifier::DEFINITION,
        SemanticTokenModifier::READONLY,
        SemanticTokenModifier::STATIC,
        SemanticTokenModifier::DEPRECATED,
        SemanticTokenModifier::ABSTRACT,
        SemanticTokenModifier::ASYNC,
        SemanticTokenModifier::MODIFICATION,
        SemanticTokenModifier::DOCUMENTATION,
        SemanticTokenModifier::DEFAULT_LIBRARY,
    ]
}
