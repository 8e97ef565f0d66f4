//! Diagnostics integration tests.

mod common;

use common::{text_doc, uri, FakeServer};
use langbridge_lsp::diagnostics::DiagnosticsObserver;
use langbridge_lsp::{ClientEvent, Diagnostic, DiagnosticSeverity, Range, Uri};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};

fn publish(fake: &mut FakeServer, version: Option<i32>, messages: &[&str]) {
    let diagnostics: Vec<Value> = messages
        .iter()
        .enumerate()
        .map(|(line, message)| {
            json!({
                "range": {
                    "start": {"line": line, "character": 0},
                    "end": {"line": line, "character": 3}
                },
                "severity": 1,
                "message": message
            })
        })
        .collect();
    let mut params = json!({"uri": uri("main.txt").as_str(), "diagnostics": diagnostics});
    if let Some(version) = version {
        params["version"] = json!(version);
    }
    fake.notify("textDocument/publishDiagnostics", params);
}

fn opened() -> FakeServer {
    let mut fake = FakeServer::new();
    fake.initialize(json!({"textDocumentSync": 2}));
    fake.client.open_document(text_doc("main.txt", "abc\ndef\n"));
    fake.written();
    fake.events();
    fake
}

#[derive(Default, Clone)]
struct Recorder {
    calls: Arc<Mutex<Vec<String>>>,
}

impl DiagnosticsObserver for Recorder {
    fn show(&mut self, uri: &Uri, diagnostics: &[Diagnostic]) {
        self.calls
            .lock()
            .unwrap()
            .push(format!("show {} {}", uri.as_str(), diagnostics.len()));
    }

    fn hide(&mut self, uri: &Uri) {
        self.calls
            .lock()
            .unwrap()
            .push(format!("hide {}", uri.as_str()));
    }
}

/// Test that diagnostics for the current version are shown.
#[test]
fn test_diagnostics_round_trip() {
    let mut fake = opened();
    publish(&mut fake, Some(0), &["unused", "typo"]);

    assert_eq!(
        fake.events(),
        vec![ClientEvent::DiagnosticsChanged(uri("main.txt"))]
    );
    let shown = fake.client.diagnostics().shown_diagnostics(&uri("main.txt"));
    assert_eq!(shown.len(), 2);
    assert_eq!(shown[0].message, "unused");
    assert_eq!(shown[0].severity, Some(DiagnosticSeverity::ERROR));

    let first_line = Range::new(
        lsp_types::Position::new(0, 0),
        lsp_types::Position::new(0, 1),
    );
    let at = fake
        .client
        .diagnostics()
        .diagnostics_at(&uri("main.txt"), first_line, 0);
    assert_eq!(at.len(), 1);
    assert!(fake
        .client
        .diagnostics()
        .has_diagnostic(&uri("main.txt"), &shown[0], 0));

    publish(&mut fake, Some(0), &[]);
    assert!(fake
        .client
        .diagnostics()
        .shown_diagnostics(&uri("main.txt"))
        .is_empty());
}

/// Test that diagnostics computed for another version stay hidden.
#[test]
fn test_diagnostics_version_skew() {
    let mut fake = opened();
    let doc = text_doc("main.txt", "abc\ndef\n");
    fake.client
        .document_contents_changed(&doc.with_text("xabc\ndef\n"), 0, 0, 1);

    publish(&mut fake, Some(0), &["stale"]);
    assert!(fake
        .client
        .diagnostics()
        .shown_diagnostics(&uri("main.txt"))
        .is_empty());
    assert!(fake
        .client
        .diagnostics()
        .diagnostics_at(&uri("main.txt"), Range::default(), 1)
        .is_empty());
    assert_eq!(
        fake.client
            .diagnostics()
            .entry(&uri("main.txt"))
            .and_then(|entry| entry.version),
        Some(0)
    );

    publish(&mut fake, Some(1), &["fresh"]);
    let shown = fake.client.diagnostics().shown_diagnostics(&uri("main.txt"));
    assert_eq!(shown.len(), 1);
    assert_eq!(shown[0].message, "fresh");
}

/// Test that unversioned diagnostics always match.
#[test]
fn test_unversioned_diagnostics() {
    let mut fake = opened();
    let doc = text_doc("main.txt", "abc\ndef\n");
    fake.client
        .document_contents_changed(&doc.with_text("xabc\ndef\n"), 0, 0, 1);
    publish(&mut fake, None, &["any"]);
    assert_eq!(
        fake.client
            .diagnostics()
            .shown_diagnostics(&uri("main.txt"))
            .len(),
        1
    );
}

/// Test that inactive documents store diagnostics without showing them.
#[test]
fn test_inactive_document() {
    let mut fake = opened();
    let recorder = Recorder::default();
    fake.client
        .set_diagnostics_observer(Some(Box::new(recorder.clone())));

    publish(&mut fake, Some(0), &["one"]);
    fake.client.deactivate_document(&uri("main.txt"));
    publish(&mut fake, Some(0), &["two"]);
    assert!(fake
        .client
        .diagnostics()
        .shown_diagnostics(&uri("main.txt"))
        .is_empty());

    fake.client.activate_document(&uri("main.txt"));
    assert_eq!(
        fake.client.diagnostics().shown_diagnostics(&uri("main.txt"))[0].message,
        "two"
    );

    let target = uri("main.txt");
    let calls = recorder.calls.lock().unwrap().clone();
    assert_eq!(
        calls,
        vec![
            format!("show {} 1", target.as_str()),
            format!("hide {}", target.as_str()),
            format!("show {} 1", target.as_str()),
        ]
    );
}

/// Test that the filter drops unwanted diagnostics before storage.
#[test]
fn test_diagnostics_filter() {
    let mut fake = opened();
    fake.client
        .set_diagnostics_filter(Some(Box::new(|d: &Diagnostic| d.message != "noise")));
    publish(&mut fake, Some(0), &["noise", "signal"]);
    let shown = fake.client.diagnostics().shown_diagnostics(&uri("main.txt"));
    assert_eq!(shown.len(), 1);
    assert_eq!(shown[0].message, "signal");
}

/// Test that a reset hides and forgets every diagnostic.
#[test]
fn test_reset_clears_diagnostics() {
    let mut fake = opened();
    publish(&mut fake, Some(0), &["one"]);
    fake.exit();
    assert!(fake.client.reset());
    assert!(fake.client.diagnostics().entries().next().is_none());
    assert!(fake
        .client
        .diagnostics()
        .shown_diagnostics(&uri("main.txt"))
        .is_empty());
}
