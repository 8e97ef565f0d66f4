//! Document synchronization integration tests.

mod common;

use common::{methods, text_doc, uri, FakeServer};
use langbridge_lsp::{ClientEvent, Position, UpdateMode};
use serde_json::json;
use std::time::Duration;

/// Test the typical edit flow: open before the handshake, type one
/// character, let the debounce timer fire.
#[test]
fn test_open_type_and_flush() {
    let mut fake = FakeServer::new();
    let doc = text_doc("main.txt", "");
    assert!(fake.client.open_document(doc.clone()));
    assert!(fake.client.documents().is_postponed(&uri("main.txt")));
    assert!(fake.written().is_empty());

    let written = fake.initialize(json!({"textDocumentSync": 2}));
    assert_eq!(methods(&written), vec!["initialized", "textDocument/didOpen"]);
    assert_eq!(written[1]["params"]["textDocument"]["version"], 0);
    assert_eq!(written[1]["params"]["textDocument"]["languageId"], "plaintext");
    assert_eq!(fake.client.document_version(&uri("main.txt")), Some(0));

    fake.client
        .document_contents_changed(&doc.with_text("x"), 0, 0, 1);
    assert_eq!(fake.client.document_version(&uri("main.txt")), Some(1));
    assert!(fake.client.document_update_postponed(&uri("main.txt")));
    assert!(fake.written().is_empty());

    fake.fire_timers();
    let changes = fake.written_method("textDocument/didChange");
    assert_eq!(changes.len(), 1);
    let params = &changes[0]["params"];
    assert_eq!(params["textDocument"]["version"], 1);
    assert_eq!(
        params["contentChanges"],
        json!([{
            "range": {
                "start": {"line": 0, "character": 0},
                "end": {"line": 0, "character": 0}
            },
            "rangeLength": 0,
            "text": "x"
        }])
    );
    assert!(!fake.client.document_update_postponed(&uri("main.txt")));
    assert!(fake
        .events()
        .contains(&ClientEvent::DocumentUpdated(uri("main.txt"))));
}

/// Test that consecutive single-character insertions merge into one change.
#[test]
fn test_typing_merges_into_one_change() {
    let mut fake = FakeServer::new();
    fake.initialize(json!({"textDocumentSync": 2}));
    let doc = text_doc("main.txt", "fn\n");
    fake.client.open_document(doc.clone());
    fake.written();

    let mut text = String::from("fn\n");
    for (i, c) in "hello".chars().enumerate() {
        text.insert(2 + i, c);
        fake.client
            .document_contents_changed(&doc.with_text(text.clone()), 2 + i, 0, 1);
    }
    assert_eq!(text, "fnhello\n");
    assert_eq!(fake.client.document_version(&uri("main.txt")), Some(5));

    fake.fire_timers();
    let changes = fake.written_method("textDocument/didChange");
    assert_eq!(changes.len(), 1);
    let content = changes[0]["params"]["contentChanges"].as_array().unwrap();
    assert_eq!(content.len(), 1);
    assert_eq!(content[0]["text"], "hello");
    assert_eq!(content[0]["range"]["start"], json!({"line": 0, "character": 2}));
    assert_eq!(changes[0]["params"]["textDocument"]["version"], 5);
}

/// Test that edits away from the last insertion are queued separately
/// with ranges against the previous snapshot.
#[test]
fn test_incremental_ranges() {
    let mut fake = FakeServer::new();
    fake.initialize(json!({"textDocumentSync": 2}));
    let doc = text_doc("main.txt", "abc\ndef\n");
    fake.client.open_document(doc.clone());
    fake.written();

    // Delete "e".
    fake.client
        .document_contents_changed(&doc.with_text("abc\ndf\n"), 5, 1, 0);
    // Insert "X" at the start.
    fake.client
        .document_contents_changed(&doc.with_text("Xabc\ndf\n"), 0, 0, 1);
    fake.fire_timers();

    let changes = fake.written_method("textDocument/didChange");
    let content = &changes[0]["params"]["contentChanges"];
    assert_eq!(
        content[0],
        json!({
            "range": {
                "start": {"line": 1, "character": 1},
                "end": {"line": 1, "character": 2}
            },
            "rangeLength": 1,
            "text": ""
        })
    );
    assert_eq!(content[1]["range"]["start"], json!({"line": 0, "character": 0}));
    assert_eq!(content[1]["text"], "X");
}

/// Test that full sync replaces the queue with the whole document.
#[test]
fn test_full_sync_sends_whole_text() {
    let mut fake = FakeServer::new();
    fake.initialize(json!({"textDocumentSync": 1}));
    let doc = text_doc("main.txt", "a");
    fake.client.open_document(doc.clone());
    fake.written();

    fake.client
        .document_contents_changed(&doc.with_text("ab"), 1, 0, 1);
    fake.client
        .document_contents_changed(&doc.with_text("abc"), 2, 0, 1);
    fake.fire_timers();

    let changes = fake.written_method("textDocument/didChange");
    assert_eq!(changes.len(), 1);
    assert_eq!(
        changes[0]["params"]["contentChanges"],
        json!([{"text": "abc"}])
    );
    assert_eq!(changes[0]["params"]["textDocument"]["version"], 2);
}

/// Test that every edit advances the version by exactly one, whatever the
/// sync kind.
#[test]
fn test_version_advances_for_every_sync_kind() {
    for kind in [0, 1, 2] {
        let mut fake = FakeServer::new();
        fake.initialize(json!({"textDocumentSync": kind}));
        let doc = text_doc("main.txt", "");
        fake.client.open_document(doc.clone());

        let mut text = String::new();
        for i in 0..3 {
            text.push('x');
            fake.client
                .document_contents_changed(&doc.with_text(text.clone()), i, 0, 1);
            assert_eq!(
                fake.client.document_version(&uri("main.txt")),
                Some(i as i32 + 1),
                "sync kind {kind}"
            );
        }
    }
}

/// Test that a server without change sync gets nothing and no timer runs.
#[test]
fn test_no_sync_sends_nothing() {
    let mut fake = FakeServer::new();
    fake.initialize(json!({"textDocumentSync": 0}));
    let doc = text_doc("main.txt", "");
    fake.client.open_document(doc.clone());
    fake.written();

    fake.client
        .document_contents_changed(&doc.with_text("x"), 0, 0, 1);
    assert_eq!(fake.client.next_deadline(), None);
    assert!(!fake.client.document_update_postponed(&uri("main.txt")));
    assert!(fake.written().is_empty());
}

/// Test that other traffic flushes queued changes first.
#[test]
fn test_outgoing_request_flushes_changes() {
    let mut fake = FakeServer::new();
    fake.initialize(json!({"textDocumentSync": 2}));
    let doc = text_doc("main.txt", "");
    fake.client.open_document(doc.clone());
    fake.written();

    fake.client
        .document_contents_changed(&doc.with_text("x"), 0, 0, 1);
    fake.client
        .send_request("workspace/symbol", json!({"query": ""}), |_| {});

    assert_eq!(
        methods(&fake.written()),
        vec!["textDocument/didChange", "workspace/symbol"]
    );
    assert!(!fake.client.document_update_postponed(&uri("main.txt")));
}

/// Test that the debounce window follows the configured threshold.
#[test]
fn test_update_threshold() {
    let mut fake = FakeServer::new();
    fake.client
        .set_document_change_update_threshold(Duration::from_millis(50));
    fake.initialize(json!({"textDocumentSync": 2}));
    let doc = text_doc("main.txt", "");
    fake.client.open_document(doc.clone());
    fake.written();

    let before = std::time::Instant::now();
    fake.client
        .document_contents_changed(&doc.with_text("x"), 0, 0, 1);
    let deadline = fake.client.next_deadline().expect("Timer not armed");
    assert!(deadline >= before + Duration::from_millis(50));
    assert!(deadline <= std::time::Instant::now() + Duration::from_millis(50));

    fake.client.handle_timeout(deadline - Duration::from_millis(10));
    assert!(fake.written().is_empty());
    fake.client.handle_timeout(deadline);
    assert_eq!(fake.written_method("textDocument/didChange").len(), 1);
}

/// Test that closing drops queued changes and is idempotent.
#[test]
fn test_close_document() {
    let mut fake = FakeServer::new();
    fake.initialize(json!({"textDocumentSync": 2}));
    let doc = text_doc("main.txt", "");
    fake.client.open_document(doc.clone());
    fake.written();

    fake.client
        .document_contents_changed(&doc.with_text("x"), 0, 0, 1);
    fake.client.close_document(&uri("main.txt"));
    fake.client.close_document(&uri("main.txt"));

    assert_eq!(methods(&fake.written()), vec!["textDocument/didClose"]);
    assert!(!fake.client.is_document_open(&uri("main.txt")));

    // Reopening keeps counting from the old version.
    fake.client.open_document(doc);
    let open = fake.written_method("textDocument/didOpen");
    assert_eq!(open[0]["params"]["textDocument"]["version"], 1);
}

/// Test that documents outside the client's languages are ignored.
#[test]
fn test_open_rejects_other_languages() {
    let mut fake = FakeServer::new();
    fake.initialize(json!({}));
    let doc = langbridge_lsp::TextDocument::new(uri("main.rs"), "rust", "");
    assert!(!fake.client.open_document(doc));
    assert!(fake.written().is_empty());
}

/// Test that a server can opt out of open/close notifications.
#[test]
fn test_open_close_disabled() {
    let mut fake = FakeServer::new();
    fake.initialize(json!({"textDocumentSync": {"openClose": false, "change": 2}}));
    assert!(!fake.client.open_document(text_doc("main.txt", "")));
    assert!(fake.written().is_empty());
}

/// Test save notifications and their includeText option.
#[test]
fn test_save_notifications() {
    let mut fake = FakeServer::new();
    fake.initialize(json!({
        "textDocumentSync": {
            "openClose": true,
            "change": 2,
            "willSave": true,
            "save": {"includeText": true}
        }
    }));
    let doc = text_doc("main.txt", "saved");
    fake.client.open_document(doc.clone());
    fake.written();

    fake.client.document_will_save(&doc);
    fake.client.document_contents_saved(&doc);
    let written = fake.written();
    assert_eq!(
        methods(&written),
        vec!["textDocument/willSave", "textDocument/didSave"]
    );
    assert_eq!(written[0]["params"]["reason"], 1);
    assert_eq!(written[1]["params"]["text"], "saved");
}

/// Test that willSave stays off unless the server asks for it.
#[test]
fn test_will_save_defaults_off() {
    let mut fake = FakeServer::new();
    fake.initialize(json!({"textDocumentSync": 2}));
    let doc = text_doc("main.txt", "");
    fake.client.open_document(doc.clone());
    fake.written();

    fake.client.document_will_save(&doc);
    fake.client.document_contents_saved(&doc);
    let written = fake.written();
    assert_eq!(methods(&written), vec!["textDocument/didSave"]);
    assert!(written[0]["params"].get("text").is_none());
}

/// Test that an edit cancels the in-flight highlight request and that
/// highlights are not requested while changes are queued.
#[test]
fn test_highlights_follow_edits() {
    let mut fake = FakeServer::new();
    fake.initialize(json!({"textDocumentSync": 2, "documentHighlightProvider": true}));
    let doc = text_doc("main.txt", "let x = x;");
    fake.client.open_document(doc.clone());
    fake.written();

    let position = Position::new(0, 4);
    let first = fake
        .client
        .request_document_highlights(&uri("main.txt"), position, |_| {})
        .expect("Highlight request not sent");
    let second = fake
        .client
        .request_document_highlights(&uri("main.txt"), position, |_| {})
        .expect("Highlight request not sent");
    let written = fake.written();
    assert_eq!(
        methods(&written),
        vec![
            "textDocument/documentHighlight",
            "$/cancelRequest",
            "textDocument/documentHighlight"
        ]
    );
    assert_eq!(written[1]["params"]["id"], json!(first));

    fake.client
        .document_contents_changed(&doc.with_text("let xy = x;"), 5, 0, 1);
    let cancel = fake.written_method("$/cancelRequest");
    assert_eq!(cancel[0]["params"]["id"], json!(second));

    assert!(fake
        .client
        .request_document_highlights(&uri("main.txt"), position, |_| {})
        .is_none());
    fake.client
        .send_postponed_document_updates(UpdateMode::Now);
    assert!(fake
        .client
        .request_document_highlights(&uri("main.txt"), position, |_| {})
        .is_some());
}
