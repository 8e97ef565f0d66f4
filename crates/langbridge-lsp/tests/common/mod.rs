//! Fake language server harness shared by the integration tests.

#![allow(dead_code)]

use langbridge_lsp::transport::TransportEvents;
use langbridge_lsp::{
    Client, ClientEvent, ClientId, LspConfig, MemoryServer, MemoryTransport, TextDocument,
    TransportSink, Uri,
};
use serde_json::{json, Value};

/// A client wired to an in-memory server that the test scripts by hand.
pub struct FakeServer {
    pub client: Client,
    pub server: MemoryServer,
    events: TransportEvents,
}

impl FakeServer {
    /// Client for plain text files (`*.txt`), transport already started.
    pub fn new() -> Self {
        Self::with_config(LspConfig::new("plaintext", "fake-server", vec!["txt"]))
    }

    pub fn with_config(config: LspConfig) -> Self {
        let (transport, server) = MemoryTransport::pair();
        let mut client = Client::new(config, Box::new(transport));
        let (sink, events) = TransportSink::channel(ClientId(1));
        client.start(sink).expect("Failed to start transport");
        Self {
            client,
            server,
            events,
        }
    }

    /// Start the transport again after a reset.
    pub fn restart(&mut self) {
        let (sink, events) = TransportSink::channel(ClientId(1));
        self.events = events;
        self.client.start(sink).expect("Failed to restart transport");
    }

    /// Feed everything the server sent into the client.
    pub fn pump(&mut self) {
        while let Ok((_, event)) = self.events.try_recv() {
            self.client.handle_transport_event(event);
        }
    }

    pub fn send(&mut self, message: Value) {
        assert!(self.server.send_json(&message), "server could not deliver");
        self.pump();
    }

    pub fn notify(&mut self, method: &str, params: Value) {
        self.send(json!({"jsonrpc": "2.0", "method": method, "params": params}));
    }

    pub fn respond(&mut self, id: &Value, result: Value) {
        self.send(json!({"jsonrpc": "2.0", "id": id, "result": result}));
    }

    pub fn respond_error(&mut self, id: &Value, code: i64, message: &str) {
        self.send(json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}}));
    }

    /// Simulate the server process exiting.
    pub fn exit(&mut self) {
        self.server.close();
        self.pump();
    }

    /// Decode every message the client wrote since the last call.
    pub fn written(&mut self) -> Vec<Value> {
        self.server
            .take_written()
            .iter()
            .map(|chunk| {
                let text = std::str::from_utf8(chunk).expect("Frame is not UTF-8");
                let (header, body) = text
                    .split_once("\r\n\r\n")
                    .expect("Frame without header terminator");
                assert!(header.starts_with("Content-Length: "));
                serde_json::from_str(body).expect("Frame body is not JSON")
            })
            .collect()
    }

    /// Messages written since the last call with the given method.
    pub fn written_method(&mut self, method: &str) -> Vec<Value> {
        self.written()
            .into_iter()
            .filter(|m| m["method"] == method)
            .collect()
    }

    /// Run the `initialize` handshake with `capabilities` and drop what the
    /// client wrote during it except the returned messages.
    pub fn initialize(&mut self, capabilities: Value) -> Vec<Value> {
        self.client.initialize().expect("Failed to send initialize");
        let init = self.written().remove(0);
        assert_eq!(init["method"], "initialize");
        self.respond(&init["id"], json!({"capabilities": capabilities}));
        let written = self.written();
        assert_eq!(written[0]["method"], "initialized");
        written
    }

    /// Fire every timer that is due at the next deadline.
    pub fn fire_timers(&mut self) {
        if let Some(deadline) = self.client.next_deadline() {
            self.client.handle_timeout(deadline);
        }
    }

    pub fn events(&mut self) -> Vec<ClientEvent> {
        self.client.drain_events()
    }
}

pub fn uri(path: &str) -> Uri {
    format!("file:///workspace/{path}")
        .parse()
        .expect("Invalid test uri")
}

pub fn text_doc(path: &str, text: &str) -> TextDocument {
    TextDocument::new(uri(path), "plaintext", text)
}

pub fn methods(messages: &[Value]) -> Vec<&str> {
    messages
        .iter()
        .filter_map(|m| m["method"].as_str())
        .collect()
}
