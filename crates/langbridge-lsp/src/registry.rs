//! The set of running clients.
//!
//! The registry owns every [`Client`], decides which client serves a
//! document, restarts clients that died, and fans requests out to all
//! servers when only the first answer matters.

use crate::client::{Client, ClientEvent};
use crate::document::TextDocument;
use crate::driver::sleep_until;
use crate::error::{LspError, LspResult};
use crate::protocol::{ErrorCode, MessageId, ResponseError, ResponseResult};
use crate::transport::{ClientId, TransportEvent, TransportEvents, TransportSink};
use lsp_types::{
    PartialResultParams, Uri, WorkDoneProgressParams, WorkspaceSymbolParams,
    WorkspaceSymbolResponse,
};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Delay before a client that exited unexpectedly is started again.
pub const RESTART_DELAY: Duration = Duration::from_secs(5);

/// Called with the first response of an exclusive request.
pub type ExclusiveCallback = Box<dyn FnOnce(ClientId, ResponseResult) + Send>;

#[derive(Default)]
struct ExclusiveState {
    callback: Option<ExclusiveCallback>,
    winner: Option<ClientId>,
}

struct ExclusiveGroup {
    state: Arc<Mutex<ExclusiveState>>,
    requests: Vec<(ClientId, MessageId)>,
}

/// Owner of all clients.
pub struct ClientRegistry {
    next_id: u64,
    clients: BTreeMap<ClientId, Client>,
    owners: HashMap<Uri, ClientId>,
    restarts: Vec<(Instant, ClientId)>,
    restart_delay: Duration,
    groups: Vec<ExclusiveGroup>,
    events: Vec<(ClientId, ClientEvent)>,
    transport_tx: mpsc::UnboundedSender<(ClientId, TransportEvent)>,
    transport_rx: TransportEvents,
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientRegistry {
    pub fn new() -> Self {
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        Self {
            next_id: 1,
            clients: BTreeMap::new(),
            owners: HashMap::new(),
            restarts: Vec::new(),
            restart_delay: RESTART_DELAY,
            groups: Vec::new(),
            events: Vec::new(),
            transport_tx,
            transport_rx,
        }
    }

    pub fn set_restart_delay(&mut self, delay: Duration) {
        self.restart_delay = delay;
    }

    pub fn add_client(&mut self, client: Client) -> ClientId {
        let id = ClientId(self.next_id);
        self.next_id += 1;
        info!(id = %id, client = %client.name(), "Client added");
        self.clients.insert(id, client);
        id
    }

    pub fn client(&self, id: ClientId) -> Option<&Client> {
        self.clients.get(&id)
    }

    pub fn client_mut(&mut self, id: ClientId) -> Option<&mut Client> {
        self.clients.get_mut(&id)
    }

    pub fn client_ids(&self) -> Vec<ClientId> {
        self.clients.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Remove a client. Documents it served become unserved.
    pub fn remove_client(&mut self, id: ClientId) -> Option<Client> {
        self.owners.retain(|_, owner| *owner != id);
        self.restarts.retain(|(_, pending)| *pending != id);
        let client = self.clients.remove(&id)?;
        info!(id = %id, client = %client.name(), "Client removed");
        Some(client)
    }

    /// Start the transport and send `initialize`. Documents assigned
    /// earlier are opened once the handshake completes.
    pub fn start_client(&mut self, id: ClientId) -> LspResult<()> {
        let sink = TransportSink::new(id, self.transport_tx.clone());
        let client = self
            .clients
            .get_mut(&id)
            .ok_or_else(|| LspError::UnknownClient(id.to_string()))?;
        let result = client.start(sink).and_then(|()| client.initialize());
        self.collect_events(id, Instant::now());
        result
    }

    /// Ask a client to shut down, or drop it right away if it cannot be
    /// reached.
    pub fn shutdown_client(&mut self, id: ClientId) {
        let Some(client) = self.clients.get_mut(&id) else {
            return;
        };
        if client.reachable() {
            let _ = client.shutdown();
            self.collect_events(id, Instant::now());
        } else {
            self.remove_client(id);
        }
    }

    pub fn shutdown_all(&mut self) {
        for id in self.client_ids() {
            self.shutdown_client(id);
        }
    }

    // Documents

    pub fn client_for_document(&self, uri: &Uri) -> Option<ClientId> {
        self.owners.get(uri).copied()
    }

    /// Make `id` the client serving `doc`.
    pub fn open_document_with_client(&mut self, doc: TextDocument, id: ClientId) -> bool {
        if !self.clients.contains_key(&id) {
            return false;
        }
        let uri = doc.uri.clone();
        if let Some(previous) = self.owners.insert(uri.clone(), id) {
            if previous != id {
                if let Some(client) = self.clients.get_mut(&previous) {
                    client.deactivate_document(&uri);
                }
            }
        }
        let Some(client) = self.clients.get_mut(&id) else {
            return false;
        };
        client.open_document(doc);
        client.activate_document(&uri);
        self.collect_events(id, Instant::now());
        true
    }

    /// Open `doc` on every client that handles it. The first one becomes
    /// its owner unless the document already has one.
    pub fn open_document(&mut self, doc: TextDocument) -> Option<ClientId> {
        let candidates: Vec<ClientId> = self
            .clients
            .iter()
            .filter(|(_, client)| client.config().handles_document(&doc))
            .map(|(id, _)| *id)
            .collect();
        let owner = self
            .owners
            .get(&doc.uri)
            .copied()
            .or_else(|| candidates.first().copied())?;

        for id in &candidates {
            if *id == owner {
                continue;
            }
            if let Some(client) = self.clients.get_mut(id) {
                client.open_document(doc.clone());
                client.deactivate_document(&doc.uri);
            }
            self.collect_events(*id, Instant::now());
        }
        self.open_document_with_client(doc, owner);
        Some(owner)
    }

    pub fn close_document(&mut self, uri: &Uri) {
        self.owners.remove(uri);
        for id in self.client_ids() {
            if let Some(client) = self.clients.get_mut(&id) {
                client.close_document(uri);
            }
            self.collect_events(id, Instant::now());
        }
    }

    /// Forward an edit to every client tracking the document.
    pub fn document_contents_changed(
        &mut self,
        doc: &TextDocument,
        position: usize,
        chars_removed: usize,
        chars_added: usize,
    ) {
        for id in self.client_ids() {
            if let Some(client) = self.clients.get_mut(&id) {
                client.document_contents_changed(doc, position, chars_removed, chars_added);
            }
        }
    }

    // Events

    /// Deliver a transport event to its client.
    pub fn dispatch(&mut self, id: ClientId, event: TransportEvent) {
        let Some(client) = self.clients.get_mut(&id) else {
            debug!(id = %id, "Event for unknown client");
            return;
        };
        client.handle_transport_event(event);
        self.collect_events(id, Instant::now());
        self.settle_exclusive_requests();
    }

    /// Dispatch everything the transports delivered so far.
    pub fn process_pending_events(&mut self) -> usize {
        let mut count = 0;
        while let Ok((id, event)) = self.transport_rx.try_recv() {
            self.dispatch(id, event);
            count += 1;
        }
        count
    }

    /// Wait for the next transport event.
    pub async fn next_transport_event(&mut self) -> Option<(ClientId, TransportEvent)> {
        self.transport_rx.recv().await
    }

    /// Wait for the next transport event or due timer and handle it.
    pub async fn process_next(&mut self) {
        let deadline = self.next_deadline();
        tokio::select! {
            Some((id, event)) = self.transport_rx.recv() => self.dispatch(id, event),
            _ = sleep_until(deadline) => self.handle_timeout(Instant::now()),
        }
    }

    pub fn drain_events(&mut self) -> Vec<(ClientId, ClientEvent)> {
        std::mem::take(&mut self.events)
    }

    fn collect_events(&mut self, id: ClientId, now: Instant) {
        let Some(client) = self.clients.get_mut(&id) else {
            return;
        };
        let events = client.drain_events();
        for event in events {
            if let ClientEvent::Finished { unexpected } = event {
                self.client_finished(id, unexpected, now);
            }
            self.events.push((id, event));
        }
    }

    /// React to a client going away: reset and restart it after a delay if
    /// the exit was unexpected and the budget allows, delete it otherwise.
    pub fn client_finished(&mut self, id: ClientId, unexpected: bool, now: Instant) {
        let Some(client) = self.clients.get_mut(&id) else {
            return;
        };
        if !unexpected {
            debug!(id = %id, "Client finished");
            self.remove_client(id);
            return;
        }
        if client.reset() {
            warn!(
                id = %id,
                client = %client.name(),
                delay = ?self.restart_delay,
                "Client finished unexpectedly, restarting"
            );
            self.restarts.retain(|(_, pending)| *pending != id);
            self.restarts.push((now + self.restart_delay, id));
        } else {
            error!(id = %id, client = %client.name(), "Client finished unexpectedly, giving up");
            self.remove_client(id);
        }
    }

    // Timers

    pub fn next_deadline(&self) -> Option<Instant> {
        self.restarts
            .iter()
            .map(|(due, _)| *due)
            .chain(self.clients.values().filter_map(Client::next_deadline))
            .min()
    }

    /// Run client timers and due restarts.
    pub fn handle_timeout(&mut self, now: Instant) {
        for id in self.client_ids() {
            let Some(client) = self.clients.get_mut(&id) else {
                continue;
            };
            if client.next_deadline().is_some_and(|due| due <= now) {
                client.handle_timeout(now);
                self.collect_events(id, now);
            }
        }

        let (due, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.restarts)
            .into_iter()
            .partition(|(deadline, _)| *deadline <= now);
        self.restarts = pending;
        if !due.is_empty() {
            // Whatever the old connections left queued must not reach the new ones.
            self.process_pending_events();
        }
        for (_, id) in due {
            info!(id = %id, "Restarting client");
            if let Err(e) = self.start_client(id) {
                warn!(id = %id, error = %e, "Restart failed");
            }
        }
        self.settle_exclusive_requests();
    }

    // Exclusive requests

    /// Send one request to every reachable client. `callback` gets the
    /// first response; the other requests are cancelled. Returns how many
    /// clients the request went to.
    pub fn send_exclusive_request<F>(&mut self, method: &str, params: Value, callback: F) -> usize
    where
        F: FnOnce(ClientId, ResponseResult) + Send + 'static,
    {
        let targets: Vec<ClientId> = self
            .clients
            .iter()
            .filter(|(_, client)| client.reachable())
            .map(|(id, _)| *id)
            .collect();
        self.send_exclusive_to(&targets, method, params, Box::new(callback))
    }

    fn send_exclusive_to(
        &mut self,
        targets: &[ClientId],
        method: &str,
        params: Value,
        callback: ExclusiveCallback,
    ) -> usize {
        let state = Arc::new(Mutex::new(ExclusiveState {
            callback: Some(callback),
            winner: None,
        }));
        let mut requests = Vec::new();
        for id in targets {
            let Some(client) = self.clients.get_mut(id) else {
                continue;
            };
            let shared = Arc::clone(&state);
            let client_id = *id;
            let sent = client.send_request(method, params.clone(), move |result| {
                let callback = match shared.lock() {
                    Ok(mut state) if state.winner.is_none() => {
                        state.winner = Some(client_id);
                        state.callback.take()
                    }
                    _ => None,
                };
                if let Some(callback) = callback {
                    callback(client_id, result);
                }
            });
            if let Some(request_id) = sent {
                requests.push((*id, request_id));
            }
        }

        let count = requests.len();
        if count == 0 {
            debug!(method, "No client to send exclusive request to");
            let callback = state.lock().ok().and_then(|mut state| state.callback.take());
            if let Some(callback) = callback {
                callback(
                    ClientId(0),
                    Err(ResponseError::new(
                        ErrorCode::REQUEST_FAILED,
                        "no reachable client",
                    )),
                );
            }
            return 0;
        }
        self.groups.push(ExclusiveGroup { state, requests });
        count
    }

    /// Cancel the losers of every group that has a winner.
    fn settle_exclusive_requests(&mut self) {
        let groups = std::mem::take(&mut self.groups);
        for group in groups {
            let winner = group.state.lock().ok().and_then(|state| state.winner);
            let Some(winner) = winner else {
                self.groups.push(group);
                continue;
            };
            for (id, request_id) in group.requests {
                if id == winner {
                    continue;
                }
                if let Some(client) = self.clients.get_mut(&id) {
                    debug!(id = %id, request = %request_id, "Cancelling losing exclusive request");
                    client.cancel_request(&request_id);
                }
            }
        }
    }

    /// Number of exclusive requests still waiting for a first answer.
    pub fn pending_exclusive_requests(&self) -> usize {
        self.groups.len()
    }

    /// Query `workspace/symbol` on every server that supports it; the first
    /// answer wins.
    pub fn workspace_symbols<F>(&mut self, query: &str, callback: F) -> usize
    where
        F: FnOnce(ClientId, Result<WorkspaceSymbolResponse, ResponseError>) + Send + 'static,
    {
        let targets: Vec<ClientId> = self
            .clients
            .iter()
            .filter(|(_, client)| client.supports_workspace_symbols())
            .map(|(id, _)| *id)
            .collect();
        let params = WorkspaceSymbolParams {
            query: query.to_string(),
            work_done_progress_params: WorkDoneProgressParams::default(),
            partial_result_params: PartialResultParams::default(),
        };
        let params = match serde_json::to_value(params) {
            Ok(params) => params,
            Err(e) => {
                warn!(error = %e, "Failed to encode workspace/symbol params");
                return 0;
            }
        };
        self.send_exclusive_to(
            &targets,
            "workspace/symbol",
            params,
            Box::new(move |id, result| {
                let symbols = result.and_then(|value| {
                    if value.is_null() {
                        return Ok(WorkspaceSymbolResponse::Flat(Vec::new()));
                    }
                    serde_json::from_value(value).map_err(|e| {
                        ResponseError::new(ErrorCode::PARSE_ERROR, e.to_string())
                    })
                });
                callback(id, symbols);
            }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientState;
    use crate::config::LspConfig;
    use crate::transport::{MemoryServer, MemoryTransport};
    use serde_json::json;

    fn written(server: &mut MemoryServer) -> Vec<Value> {
        server
            .take_written()
            .iter()
            .map(|chunk| {
                let text = std::str::from_utf8(chunk).unwrap();
                let (_, body) = text.split_once("\r\n\r\n").unwrap();
                serde_json::from_str(body).unwrap()
            })
            .collect()
    }

    fn add(registry: &mut ClientRegistry, config: LspConfig) -> (ClientId, MemoryServer) {
        let (transport, server) = MemoryTransport::pair();
        let id = registry.add_client(Client::new(config, Box::new(transport)));
        (id, server)
    }

    fn initialize(registry: &mut ClientRegistry, id: ClientId, server: &mut MemoryServer, capabilities: Value) {
        registry.start_client(id).unwrap();
        let init = written(server)
            .into_iter()
            .find(|m| m["method"] == "initialize")
            .unwrap();
        server.send_json(&json!({"jsonrpc": "2.0", "id": init["id"], "result": {"capabilities": capabilities}}));
        registry.process_pending_events();
        written(server);
    }

    fn doc(uri: &str) -> TextDocument {
        TextDocument::new(uri.parse().unwrap(), "rust", "fn main() {}\n")
    }

    #[test]
    fn test_restart_after_unexpected_exit() {
        let mut registry = ClientRegistry::new();
        let (id, mut server) = add(&mut registry, LspConfig::rust());
        initialize(&mut registry, id, &mut server, json!({}));

        server.close();
        registry.process_pending_events();
        assert_eq!(registry.client(id).unwrap().state(), ClientState::Uninitialized);

        let due = registry.next_deadline().unwrap();
        registry.handle_timeout(due - Duration::from_millis(1));
        assert!(written(&mut server).is_empty());

        registry.handle_timeout(due);
        let messages = written(&mut server);
        assert_eq!(messages[0]["method"], "initialize");
        assert_eq!(
            registry.client(id).unwrap().state(),
            ClientState::InitializeRequested
        );
    }

    #[test]
    fn test_budget_exhaustion_removes_client() {
        let mut registry = ClientRegistry::new();
        let mut config = LspConfig::rust();
        config.restart_budget = 1;
        let (id, mut server) = add(&mut registry, config);
        registry.open_document_with_client(doc("file:///w/main.rs"), id);

        initialize(&mut registry, id, &mut server, json!({}));
        server.close();
        registry.process_pending_events();
        let due = registry.next_deadline().unwrap();
        registry.handle_timeout(due);

        server.close();
        registry.process_pending_events();
        assert!(registry.client(id).is_none());
        assert_eq!(registry.client_for_document(&"file:///w/main.rs".parse().unwrap()), None);
    }

    #[test]
    fn test_one_crash_costs_one_restart() {
        let mut registry = ClientRegistry::new();
        let (id, mut server) = add(&mut registry, LspConfig::rust());
        initialize(&mut registry, id, &mut server, json!({}));
        registry.drain_events();

        server.close();
        server.fail("write failed: broken pipe");
        registry.process_pending_events();

        assert_eq!(registry.client(id).unwrap().restarts_remaining(), 4);
        let finished = registry
            .drain_events()
            .into_iter()
            .filter(|(_, e)| matches!(e, ClientEvent::Finished { .. }))
            .count();
        assert_eq!(finished, 1);
        assert_eq!(registry.restarts.len(), 1);

        let due = registry.next_deadline().unwrap();
        registry.handle_timeout(due);
        assert_eq!(
            registry.client(id).unwrap().state(),
            ClientState::InitializeRequested
        );
        assert_eq!(registry.client(id).unwrap().restarts_remaining(), 4);
    }

    #[test]
    fn test_expected_finish_removes_client() {
        let mut registry = ClientRegistry::new();
        let (id, mut server) = add(&mut registry, LspConfig::rust());
        initialize(&mut registry, id, &mut server, json!({}));

        registry.shutdown_client(id);
        let shutdown = written(&mut server).remove(0);
        server.send_json(&json!({"jsonrpc": "2.0", "id": shutdown["id"], "result": null}));
        server.close();
        registry.process_pending_events();
        assert!(registry.client(id).is_none());
        assert!(registry
            .drain_events()
            .contains(&(id, ClientEvent::Finished { unexpected: false })));
    }

    #[test]
    fn test_document_ownership() {
        let mut registry = ClientRegistry::new();
        let (first, _s1) = add(&mut registry, LspConfig::rust());
        let (second, _s2) = add(&mut registry, LspConfig::rust().with_name("other"));
        let uri: Uri = "file:///w/lib.rs".parse().unwrap();

        assert_eq!(registry.open_document(doc("file:///w/lib.rs")), Some(first));
        assert_eq!(registry.client_for_document(&uri), Some(first));

        registry.open_document_with_client(doc("file:///w/lib.rs"), second);
        assert_eq!(registry.client_for_document(&uri), Some(second));

        registry.close_document(&uri);
        assert_eq!(registry.client_for_document(&uri), None);
        let script = TextDocument::new("file:///w/script.py".parse().unwrap(), "python", "print(1)\n");
        assert_eq!(registry.open_document(script), None);
    }

    #[test]
    fn test_exclusive_request_first_wins() {
        let mut registry = ClientRegistry::new();
        let (a, mut server_a) = add(&mut registry, LspConfig::rust());
        let (b, mut server_b) = add(&mut registry, LspConfig::rust());
        initialize(&mut registry, a, &mut server_a, json!({"workspaceSymbolProvider": true}));
        initialize(&mut registry, b, &mut server_b, json!({"workspaceSymbolProvider": true}));

        let results = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&results);
        let sent = registry.workspace_symbols("main", move |id, result| {
            sink.lock().unwrap().push((id, result.is_ok()));
        });
        assert_eq!(sent, 2);

        let req_a = written(&mut server_a).remove(0);
        let req_b = written(&mut server_b).remove(0);
        server_b.send_json(&json!({"jsonrpc": "2.0", "id": req_b["id"], "result": []}));
        registry.process_pending_events();

        let cancel = written(&mut server_a).remove(0);
        assert_eq!(cancel["method"], "$/cancelRequest");
        assert_eq!(cancel["params"]["id"], req_a["id"]);

        server_a.send_json(&json!({"jsonrpc": "2.0", "id": req_a["id"], "result": []}));
        registry.process_pending_events();

        assert_eq!(*results.lock().unwrap(), vec![(b, true)]);
        assert_eq!(registry.pending_exclusive_requests(), 0);
    }

    #[test]
    fn test_exclusive_request_without_clients() {
        let mut registry = ClientRegistry::new();
        let called = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&called);
        let sent = registry.send_exclusive_request("workspace/symbol", json!({}), move |_, result| {
            assert!(result.is_err());
            *flag.lock().unwrap() = true;
        });
        assert_eq!(sent, 0);
        assert!(*called.lock().unwrap());
    }

    #[tokio::test]
    async fn test_process_next_drives_restart() {
        let mut registry = ClientRegistry::new();
        registry.set_restart_delay(Duration::ZERO);
        let (id, mut server) = add(&mut registry, LspConfig::rust());
        registry.start_client(id).unwrap();
        let init = written(&mut server).remove(0);
        server.send_json(&json!({"jsonrpc": "2.0", "id": init["id"], "result": {"capabilities": {}}}));

        registry.process_next().await;
        assert!(registry.client(id).unwrap().reachable());

        server.close();
        registry.process_next().await;
        assert!(registry.next_deadline().is_some());
        registry.process_next().await;
        let messages = written(&mut server);
        assert!(messages.iter().any(|m| m["method"] == "initialize"));
    }
}
