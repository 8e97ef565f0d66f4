//! Semantic token integration tests.
//!
//! The fake server keeps an authoritative token stream; the client must end
//! up with the same data whether it got there through deltas or a reload.

mod common;

use common::{text_doc, uri, FakeServer};
use langbridge_lsp::{ClientEvent, ErrorCode, ExpandedSemanticToken};
use serde_json::{json, Value};

const FULL: &str = "textDocument/semanticTokens/full";
const DELTA: &str = "textDocument/semanticTokens/full/delta";

fn capabilities() -> Value {
    json!({
        "textDocumentSync": 2,
        "semanticTokensProvider": {
            "legend": {
                "tokenTypes": ["keyword", "variable", "function"],
                "tokenModifiers": ["declaration", "readonly"]
            },
            "full": {"delta": true}
        }
    })
}

/// Open `main.txt` and answer the first full token request with `data`.
fn opened_with_tokens(data: &[u32]) -> FakeServer {
    let mut fake = FakeServer::new();
    fake.initialize(capabilities());
    fake.client.open_document(text_doc("main.txt", "let a = b;\n"));
    let request = fake.written_method(FULL).remove(0);
    assert_eq!(request["params"]["textDocument"]["uri"], uri("main.txt").as_str());
    fake.respond(&request["id"], json!({"resultId": "1", "data": data}));
    fake.events();
    fake
}

fn stored(fake: &FakeServer) -> Vec<u32> {
    fake.client
        .semantic_tokens()
        .tokens(&uri("main.txt"))
        .map(|state| state.data.clone())
        .unwrap_or_default()
}

fn edit(fake: &mut FakeServer) {
    let doc = text_doc("main.txt", "let a = b;\n");
    fake.client
        .document_contents_changed(&doc.with_text("let ab = b;\n"), 5, 0, 1);
    fake.fire_timers();
}

/// Test that deltas and a fresh reload agree with the server's stream.
#[test]
fn test_delta_then_reload_matches_full_stream() {
    let authoritative = vec![0, 0, 3, 0, 0, 0, 4, 2, 1, 1, 1, 0, 4, 2, 0];
    let mut fake = opened_with_tokens(&[0, 0, 3, 0, 0, 0, 4, 1, 1, 1]);

    edit(&mut fake);
    let request = fake.written_method(DELTA).remove(0);
    assert_eq!(request["params"]["previousResultId"], "1");
    fake.respond(
        &request["id"],
        json!({
            "resultId": "2",
            "edits": [
                {"start": 7, "deleteCount": 1, "data": [2]},
                {"start": 10, "deleteCount": 0, "data": [1, 0, 4, 2, 0]}
            ]
        }),
    );
    assert_eq!(stored(&fake), authoritative);
    assert_eq!(
        fake.events(),
        vec![
            ClientEvent::DocumentUpdated(uri("main.txt")),
            ClientEvent::SemanticTokensChanged(uri("main.txt"))
        ]
    );

    // The server asks for a refresh and answers with its full stream.
    fake.send(json!({"jsonrpc": "2.0", "id": 50, "method": "workspace/semanticTokens/refresh"}));
    let written = fake.written();
    assert_eq!(written[0]["method"], FULL);
    assert_eq!(written[1]["id"], 50);
    fake.respond(&written[0]["id"], json!({"resultId": "3", "data": authoritative}));
    assert_eq!(stored(&fake), authoritative);
}

/// Test that tokens already current for the version are not requested
/// again.
#[test]
fn test_current_tokens_are_not_requested() {
    let mut fake = opened_with_tokens(&[0, 0, 3, 0, 0]);
    fake.client.update_semantic_tokens(&uri("main.txt"));
    assert!(fake.written().is_empty());
}

/// Test that a delta that does not fit the stored data triggers a reload.
#[test]
fn test_desynchronized_delta_reloads() {
    let mut fake = opened_with_tokens(&[0, 0, 3, 0, 0]);
    edit(&mut fake);
    let request = fake.written_method(DELTA).remove(0);
    fake.respond(
        &request["id"],
        json!({"resultId": "2", "edits": [{"start": 40, "deleteCount": 0, "data": [1]}]}),
    );

    let stale = fake
        .client
        .semantic_tokens()
        .tokens(&uri("main.txt"))
        .expect("Failed to keep the old tokens");
    assert_eq!(stale.result_id, None);
    assert_ne!(Some(stale.version), fake.client.document_version(&uri("main.txt")));

    let reload = fake.written_method(FULL);
    assert_eq!(reload.len(), 1);
    fake.respond(&reload[0]["id"], json!({"resultId": "3", "data": [0, 0, 4, 2, 0]}));
    assert_eq!(stored(&fake), vec![0, 0, 4, 2, 0]);
}

/// Test that a failed delta request is retried before giving up.
#[test]
fn test_failed_request_is_retried() {
    let mut fake = opened_with_tokens(&[0, 0, 3, 0, 0]);
    edit(&mut fake);
    let request = fake.written_method(DELTA).remove(0);
    fake.respond_error(&request["id"], ErrorCode::CONTENT_MODIFIED, "modified");

    let retry = fake.written_method(DELTA);
    assert_eq!(retry.len(), 1);
    fake.respond(&retry[0]["id"], json!({"edits": []}));
    assert_eq!(stored(&fake), vec![0, 0, 3, 0, 0]);
}

/// Test that tokens decode to absolute positions with legend names.
#[test]
fn test_expanded_tokens() {
    let fake = opened_with_tokens(&[0, 0, 3, 0, 0, 0, 4, 1, 1, 1, 2, 2, 5, 2, 3]);
    let tokens = fake.client.expanded_semantic_tokens(&uri("main.txt"));
    assert_eq!(
        tokens,
        vec![
            ExpandedSemanticToken {
                line: 1,
                column: 1,
                length: 3,
                token_type: "keyword".to_string(),
                modifiers: vec![],
            },
            ExpandedSemanticToken {
                line: 1,
                column: 5,
                length: 1,
                token_type: "variable".to_string(),
                modifiers: vec!["declaration".to_string()],
            },
            ExpandedSemanticToken {
                line: 3,
                column: 3,
                length: 5,
                token_type: "function".to_string(),
                modifiers: vec!["declaration".to_string(), "readonly".to_string()],
            },
        ]
    );
}

/// Test that a dynamic registration brings its own legend and requests
/// tokens for open documents.
#[test]
fn test_dynamic_registration() {
    let mut fake = FakeServer::new();
    fake.initialize(json!({"textDocumentSync": 2}));
    fake.client.open_document(text_doc("main.txt", "x"));
    assert!(fake.written_method(FULL).is_empty());

    fake.send(json!({
        "jsonrpc": "2.0",
        "id": 9,
        "method": "client/registerCapability",
        "params": {"registrations": [{
            "id": "tokens",
            "method": "textDocument/semanticTokens",
            "registerOptions": {
                "documentSelector": null,
                "legend": {"tokenTypes": ["string"], "tokenModifiers": []},
                "full": true
            }
        }]}
    }));
    let request = fake.written_method(FULL).remove(0);
    fake.respond(&request["id"], json!({"data": [0, 0, 1, 0, 0]}));

    let tokens = fake.client.expanded_semantic_tokens(&uri("main.txt"));
    assert_eq!(tokens.len(), 1);
    assert_eq!(tokens[0].token_type, "string");
}

/// Test that closing a document drops its tokens.
#[test]
fn test_close_drops_tokens() {
    let mut fake = opened_with_tokens(&[0, 0, 3, 0, 0]);
    fake.client.close_document(&uri("main.txt"));
    assert!(fake.client.semantic_tokens().tokens(&uri("main.txt")).is_none());
    assert!(fake.client.semantic_tokens().legend().is_some());
}
