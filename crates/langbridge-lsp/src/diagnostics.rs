//! Diagnostics keyed by document and version.
//!
//! Diagnostics published for one version of a document are never shown
//! against another version. An entry without a version matches any.

use crate::document::uri_to_path;
use lsp_types::{Diagnostic, DiagnosticSeverity, Position, Range, Uri};
use std::collections::HashMap;
use std::fmt;

/// Predicate deciding which published diagnostics are kept.
pub type DiagnosticsFilter = Box<dyn Fn(&Diagnostic) -> bool + Send>;

/// Receives show/hide calls for a rendering layer.
pub trait DiagnosticsObserver: Send {
    fn show(&mut self, uri: &Uri, diagnostics: &[Diagnostic]);
    fn hide(&mut self, uri: &Uri);
}

/// Diagnostics last published for one document.
#[derive(Debug, Clone, PartialEq)]
pub struct DiagnosticsEntry {
    pub uri: Uri,
    pub version: Option<i32>,
    pub diagnostics: Vec<Diagnostic>,
}

impl DiagnosticsEntry {
    fn matches(&self, current_version: i32) -> bool {
        self.version.unwrap_or(current_version) == current_version
    }
}

#[derive(Default)]
pub struct DiagnosticStore {
    entries: HashMap<Uri, DiagnosticsEntry>,
    shown: HashMap<Uri, Vec<Diagnostic>>,
    filter: Option<DiagnosticsFilter>,
    observer: Option<Box<dyn DiagnosticsObserver>>,
}

impl fmt::Debug for DiagnosticStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiagnosticStore")
            .field("entries", &self.entries)
            .field("shown", &self.shown)
            .field("filter", &self.filter.is_some())
            .field("observer", &self.observer.is_some())
            .finish()
    }
}

impl DiagnosticStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_filter(&mut self, filter: Option<DiagnosticsFilter>) {
        self.filter = filter;
    }

    pub fn set_observer(&mut self, observer: Option<Box<dyn DiagnosticsObserver>>) {
        self.observer = observer;
    }

    /// Replace the entry for `uri`. Whatever was shown for it is hidden
    /// first.
    pub fn set_diagnostics(&mut self, uri: &Uri, diagnostics: Vec<Diagnostic>, version: Option<i32>) {
        self.hide_diagnostics(uri);
        let diagnostics = match &self.filter {
            Some(filter) => diagnostics.into_iter().filter(|d| filter(d)).collect(),
            None => diagnostics,
        };
        self.entries.insert(
            uri.clone(),
            DiagnosticsEntry {
                uri: uri.clone(),
                version,
                diagnostics,
            },
        );
    }

    /// Show the stored diagnostics for `uri` if they were computed for
    /// `current_version`.
    pub fn show_diagnostics(&mut self, uri: &Uri, current_version: i32) -> bool {
        let Some(entry) = self.entries.get(uri) else {
            return false;
        };
        if !entry.matches(current_version) || entry.diagnostics.is_empty() {
            return false;
        }
        let diagnostics = entry.diagnostics.clone();
        if let Some(observer) = self.observer.as_mut() {
            observer.show(uri, &diagnostics);
        }
        self.shown.insert(uri.clone(), diagnostics);
        true
    }

    pub fn hide_diagnostics(&mut self, uri: &Uri) {
        if self.shown.remove(uri).is_some() {
            if let Some(observer) = self.observer.as_mut() {
                observer.hide(uri);
            }
        }
    }

    /// What is currently shown for `uri`.
    pub fn shown_diagnostics(&self, uri: &Uri) -> &[Diagnostic] {
        self.shown.get(uri).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn entry(&self, uri: &Uri) -> Option<&DiagnosticsEntry> {
        self.entries.get(uri)
    }

    pub fn entries(&self) -> impl Iterator<Item = &DiagnosticsEntry> {
        self.entries.values()
    }

    /// Diagnostics overlapping `range`, empty when the stored version is
    /// stale.
    pub fn diagnostics_at(&self, uri: &Uri, range: Range, current_version: i32) -> Vec<Diagnostic> {
        match self.entries.get(uri) {
            Some(entry) if entry.matches(current_version) => entry
                .diagnostics
                .iter()
                .filter(|d| overlaps(&d.range, &range))
                .cloned()
                .collect(),
            _ => Vec::new(),
        }
    }

    pub fn has_diagnostic(&self, uri: &Uri, diagnostic: &Diagnostic, current_version: i32) -> bool {
        self.entries
            .get(uri)
            .is_some_and(|entry| entry.matches(current_version) && entry.diagnostics.contains(diagnostic))
    }

    /// Hide everything and drop all entries.
    pub fn clear_diagnostics(&mut self) {
        let shown: Vec<Uri> = self.shown.keys().cloned().collect();
        for uri in shown {
            self.hide_diagnostics(&uri);
        }
        self.entries.clear();
    }
}

fn key(position: &Position) -> (u32, u32) {
    (position.line, position.character)
}

fn overlaps(a: &Range, b: &Range) -> bool {
    !(key(&a.end) < key(&b.start) || key(&b.end) < key(&a.start))
}

/// Diagnostic information for display.
#[derive(Debug, Clone)]
pub struct DiagnosticInfo {
    pub path: String,
    pub line: u32,
    pub column: u32,
    pub severity: DiagnosticSeverityLevel,
    pub message: String,
    pub source: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DiagnosticSeverityLevel {
    Error,
    Warning,
    Info,
    Hint,
}

impl DiagnosticInfo {
    pub fn from_lsp(diag: &Diagnostic, uri: &Uri) -> Self {
        Self {
            path: uri_to_path(uri),
            line: diag.range.start.line + 1,
            column: diag.range.start.character + 1,
            severity: match diag.severity {
                Some(DiagnosticSeverity::WARNING) => DiagnosticSeverityLevel::Warning,
                Some(DiagnosticSeverity::INFORMATION) => DiagnosticSeverityLevel::Info,
                Some(DiagnosticSeverity::HINT) => DiagnosticSeverityLevel::Hint,
                _ => DiagnosticSeverityLevel::Error,
            },
            message: diag.message.clone(),
            source: diag.source.clone(),
        }
    }

    pub fn pretty(&self) -> String {
        let severity = match self.severity {
            DiagnosticSeverityLevel::Error => "ERROR",
            DiagnosticSeverityLevel::Warning => "WARN",
            DiagnosticSeverityLevel::Info => "INFO",
            DiagnosticSeverityLevel::Hint => "HINT",
        };
        match &self.source {
            Some(source) => format!(
                "{severity} [{}:{}] {} ({source})",
                self.line, self.column, self.message
            ),
            None => format!("{severity} [{}:{}] {}", self.line, self.column, self.message),
        }
    }
}
