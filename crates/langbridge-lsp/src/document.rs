//! Document state kept in sync with the server.
//!
//! Editor offsets count `char`s. LSP positions count UTF-16 code units, so
//! every range sent to the server goes through [`position_at`].

use crate::error::{LspError, LspResult};
use lsp_types::{Position, Range, TextDocumentContentChangeEvent, TextDocumentSyncKind, Uri};
use std::collections::{HashMap, HashSet};
use std::path::Path;

/// Snapshot of an editor document handed to the client.
#[derive(Debug, Clone, PartialEq)]
pub struct TextDocument {
    pub uri: Uri,
    pub language_id: String,
    pub text: String,
}

impl TextDocument {
    pub fn new(uri: Uri, language_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            uri,
            language_id: language_id.into(),
            text: text.into(),
        }
    }

    /// Build a document for a file path, guessing the language id from its
    /// extension.
    pub fn from_path(path: &Path, text: impl Into<String>) -> LspResult<Self> {
        let uri = path_to_uri(path)?;
        let language_id = path
            .extension()
            .and_then(|e| e.to_str())
            .map(ext_to_language_id)
            .unwrap_or("plaintext");
        Ok(Self::new(uri, language_id, text))
    }

    /// Text after an edit, keeping uri and language.
    pub fn with_text(&self, text: impl Into<String>) -> Self {
        Self {
            uri: self.uri.clone(),
            language_id: self.language_id.clone(),
            text: text.into(),
        }
    }
}

/// Convert a file path to a `file://` URI.
pub fn path_to_uri(path: &Path) -> LspResult<Uri> {
    let abs_path = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map_err(|e| LspError::InvalidUri(e.to_string()))?
            .join(path)
    };

    format!("file://{}", abs_path.display())
        .parse()
        .map_err(|e| LspError::InvalidUri(format!("{}: {e}", abs_path.display())))
}

/// Path component of a `file://` URI, or the URI itself otherwise.
pub fn uri_to_path(uri: &Uri) -> String {
    let uri = uri.as_str();
    uri.strip_prefix("file://").unwrap_or(uri).to_string()
}

pub fn ext_to_language_id(ext: &str) -> &'static str {
    match ext {
        "rs" => "rust",
        "ts" | "tsx" => "typescript",
        "js" | "jsx" => "javascript",
        "py" => "python",
        "go" => "go",
        "java" => "java",
        "c" | "h" => "c",
        "cpp" | "hpp" | "cc" | "cxx" => "cpp",
        "cs" => "csharp",
        "rb" => "ruby",
        "lua" => "lua",
        "sh" | "bash" => "shellscript",
        "json" => "json",
        "yaml" | "yml" => "yaml",
        "toml" => "toml",
        "md" => "markdown",
        "html" => "html",
        "css" => "css",
        _ => "plaintext",
    }
}

/// LSP position of the `offset`-th char of `text`. Offsets past the end
/// clamp to the end.
pub fn position_at(text: &str, offset: usize) -> Position {
    let mut line = 0u32;
    let mut character = 0u32;
    for c in text.chars().take(offset) {
        if c == '\n' {
            line += 1;
            character = 0;
        } else {
            character += c.len_utf16() as u32;
        }
    }
    Position { line, character }
}

/// Char offset of an LSP position, the inverse of [`position_at`].
pub fn offset_at(text: &str, position: Position) -> usize {
    let mut line = 0u32;
    let mut character = 0u32;
    for (offset, c) in text.chars().enumerate() {
        if line == position.line && character >= position.character {
            return offset;
        }
        if c == '\n' {
            if line == position.line {
                return offset;
            }
            line += 1;
            character = 0;
        } else if line == position.line {
            character += c.len_utf16() as u32;
        }
    }
    text.chars().count()
}

fn char_slice(text: &str, start: usize, len: usize) -> String {
    text.chars().skip(start).take(len).collect()
}

/// UTF-16 length of the chars in `start..end`.
fn utf16_len(text: &str, start: usize, end: usize) -> u32 {
    text.chars()
        .skip(start)
        .take(end.saturating_sub(start))
        .map(|c| c.len_utf16() as u32)
        .sum()
}

/// A document that has been announced to the server with `didOpen`.
#[derive(Debug, Clone)]
pub struct OpenDocument {
    pub uri: Uri,
    pub language_id: String,
    pub version: i32,
    pub last_known_text: String,
    pub pending_changes: Vec<TextDocumentContentChangeEvent>,
}

impl OpenDocument {
    /// Record one editor edit against `new_text` and bump the version.
    ///
    /// `position`, `chars_removed` and `chars_added` describe the edit in
    /// chars relative to the previous snapshot.
    pub fn record_change(
        &mut self,
        new_text: &str,
        position: usize,
        chars_removed: usize,
        chars_added: usize,
        kind: TextDocumentSyncKind,
    ) -> i32 {
        if kind == TextDocumentSyncKind::INCREMENTAL {
            let inserted = char_slice(new_text, position, chars_added);
            if !self.merge_append(position, chars_removed, &inserted) {
                let old = &self.last_known_text;
                let old_len = old.chars().count();
                let end = (position + chars_removed).min(old_len);
                self.pending_changes.push(TextDocumentContentChangeEvent {
                    range: Some(Range {
                        start: position_at(old, position),
                        end: position_at(old, end),
                    }),
                    range_length: Some(utf16_len(old, position, end)),
                    text: inserted,
                });
            }
        } else if kind == TextDocumentSyncKind::FULL {
            self.pending_changes = vec![TextDocumentContentChangeEvent {
                range: None,
                range_length: None,
                text: new_text.to_string(),
            }];
        }
        if kind != TextDocumentSyncKind::NONE {
            self.last_known_text = new_text.to_string();
        }
        self.version += 1;
        self.version
    }

    /// Extend the last queued change when this edit is a pure insertion
    /// right after the text that change inserted.
    fn merge_append(&mut self, position: usize, chars_removed: usize, inserted: &str) -> bool {
        if chars_removed != 0 {
            return false;
        }
        let Some(prev) = self.pending_changes.last_mut() else {
            return false;
        };
        let Some(range) = prev.range else {
            return false;
        };
        let prev_start = offset_at(&self.last_known_text, range.start);
        if prev_start + prev.text.chars().count() != position {
            return false;
        }
        prev.text.push_str(inserted);
        true
    }
}

/// Open, postponed and active documents plus the per-uri version counters.
#[derive(Debug, Default)]
pub struct DocumentStore {
    open: HashMap<Uri, OpenDocument>,
    postponed: Vec<TextDocument>,
    versions: HashMap<Uri, i32>,
    active: HashSet<Uri>,
}

impl DocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_open(&self, uri: &Uri) -> bool {
        self.open.contains_key(uri)
    }

    pub fn get(&self, uri: &Uri) -> Option<&OpenDocument> {
        self.open.get(uri)
    }

    pub fn get_mut(&mut self, uri: &Uri) -> Option<&mut OpenDocument> {
        self.open.get_mut(uri)
    }

    pub fn open_documents(&self) -> impl Iterator<Item = &OpenDocument> {
        self.open.values()
    }

    pub fn open_uris(&self) -> Vec<Uri> {
        self.open.keys().cloned().collect()
    }

    /// Current version for `uri`, whether or not it is open right now.
    pub fn version(&self, uri: &Uri) -> Option<i32> {
        self.open
            .get(uri)
            .map(|doc| doc.version)
            .or_else(|| self.versions.get(uri).copied())
    }

    pub fn is_postponed(&self, uri: &Uri) -> bool {
        self.postponed.iter().any(|doc| &doc.uri == uri)
    }

    /// Queue a document until the client is initialized.
    pub fn postpone(&mut self, doc: TextDocument) {
        match self.postponed.iter_mut().find(|d| d.uri == doc.uri) {
            Some(existing) => *existing = doc,
            None => self.postponed.push(doc),
        }
    }

    pub fn take_postponed(&mut self) -> Vec<TextDocument> {
        std::mem::take(&mut self.postponed)
    }

    /// Track `doc` as open, carrying over an earlier version counter.
    pub fn open(&mut self, doc: &TextDocument) -> &OpenDocument {
        let version = self.versions.get(&doc.uri).copied().unwrap_or(0);
        self.versions.insert(doc.uri.clone(), version);
        self.open
            .entry(doc.uri.clone())
            .or_insert_with(|| OpenDocument {
                uri: doc.uri.clone(),
                language_id: doc.language_id.clone(),
                version,
                last_known_text: doc.text.clone(),
                pending_changes: Vec::new(),
            })
    }

    /// Drop `uri` from the open and postponed sets. Returns whether it was
    /// open.
    pub fn close(&mut self, uri: &Uri) -> bool {
        self.postponed.retain(|doc| &doc.uri != uri);
        self.active.remove(uri);
        match self.open.remove(uri) {
            Some(doc) => {
                self.versions.insert(doc.uri, doc.version);
                true
            }
            None => false,
        }
    }

    /// An edit to a postponed document: keep its newest text and advance
    /// its version so nothing older is sent later.
    pub fn update_postponed(&mut self, doc: &TextDocument) -> Option<i32> {
        let postponed = self.postponed.iter_mut().find(|d| d.uri == doc.uri)?;
        postponed.text = doc.text.clone();
        let version = self.versions.entry(doc.uri.clone()).or_insert(0);
        *version += 1;
        Some(*version)
    }

    pub fn has_pending_changes(&self, uri: &Uri) -> bool {
        self.open
            .get(uri)
            .is_some_and(|doc| !doc.pending_changes.is_empty())
    }

    pub fn any_pending_changes(&self) -> bool {
        self.open.values().any(|doc| !doc.pending_changes.is_empty())
    }

    /// Take every queued change, with the version to send it under.
    pub fn take_pending_changes(&mut self) -> Vec<(Uri, i32, Vec<TextDocumentContentChangeEvent>)> {
        let mut updates: Vec<_> = self
            .open
            .values_mut()
            .filter(|doc| !doc.pending_changes.is_empty())
            .map(|doc| {
                (
                    doc.uri.clone(),
                    doc.version,
                    std::mem::take(&mut doc.pending_changes),
                )
            })
            .collect();
        updates.sort_by(|a, b| a.0.as_str().cmp(b.0.as_str()));
        updates
    }

    /// Move every open document back to the postponed set with its latest
    /// text. Versions are kept.
    pub fn reset(&mut self) {
        let mut reopened: Vec<TextDocument> = self
            .open
            .drain()
            .map(|(uri, doc)| {
                self.versions.insert(uri.clone(), doc.version);
                TextDocument {
                    uri,
                    language_id: doc.language_id,
                    text: doc.last_known_text,
                }
            })
            .collect();
        reopened.sort_by(|a, b| a.uri.as_str().cmp(b.uri.as_str()));
        for doc in reopened {
            self.postpone(doc);
        }
    }

    pub fn activate(&mut self, uri: &Uri) {
        self.active.insert(uri.clone());
    }

    pub fn deactivate(&mut self, uri: &Uri) -> bool {
        self.active.remove(uri)
    }

    pub fn is_active(&self, uri: &Uri) -> bool {
        self.active.contains(uri)
    }
}
