//! Static and dynamically registered server capabilities.
//!
//! Capabilities come from two places: the `ServerCapabilities` returned by
//! `initialize`, and `client/registerCapability` requests received later.
//! Whenever a method has a dynamic entry it decides, and a document selector
//! in its registration options narrows which documents it covers.

use lsp_types::{
    DocumentFilter, OneOf, Registration, SemanticTokensLegend, ServerCapabilities,
    TextDocumentSyncCapability, TextDocumentSyncKind, TextDocumentSyncSaveOptions, Unregistration,
    Uri,
};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use tracing::debug;

pub const DID_OPEN: &str = "textDocument/didOpen";
pub const DID_CHANGE: &str = "textDocument/didChange";
pub const DID_SAVE: &str = "textDocument/didSave";
pub const WILL_SAVE: &str = "textDocument/willSave";
pub const DOCUMENT_HIGHLIGHT: &str = "textDocument/documentHighlight";
pub const SEMANTIC_TOKENS: &str = "textDocument/semanticTokens";
pub const WORKSPACE_SYMBOL: &str = "workspace/symbol";
pub const DID_CHANGE_WORKSPACE_FOLDERS: &str = "workspace/didChangeWorkspaceFolders";

/// One dynamically registered method.
#[derive(Debug, Clone, PartialEq)]
pub struct DynamicCapability {
    pub enabled: bool,
    pub registration_id: String,
    pub options: Option<Value>,
}

/// Methods registered through `client/registerCapability`.
#[derive(Debug, Clone, Default)]
pub struct DynamicCapabilities {
    capabilities: HashMap<String, DynamicCapability>,
    method_for_id: HashMap<String, String>,
}

impl DynamicCapabilities {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, registrations: &[Registration]) {
        for registration in registrations {
            debug!(method = %registration.method, id = %registration.id, "Registering capability");
            self.capabilities.insert(
                registration.method.clone(),
                DynamicCapability {
                    enabled: true,
                    registration_id: registration.id.clone(),
                    options: registration.register_options.clone(),
                },
            );
            self.method_for_id
                .insert(registration.id.clone(), registration.method.clone());
        }
    }

    /// Disable the matching entries. The method is looked up by
    /// registration id when the unregistration does not name it.
    pub fn unregister(&mut self, unregistrations: &[Unregistration]) {
        for unregistration in unregistrations {
            let method = if unregistration.method.is_empty() {
                match self.method_for_id.get(&unregistration.id) {
                    Some(method) => method.clone(),
                    None => {
                        debug!(id = %unregistration.id, "Unregistration for unknown id");
                        continue;
                    }
                }
            } else {
                unregistration.method.clone()
            };
            debug!(method = %method, id = %unregistration.id, "Unregistering capability");
            self.capabilities
                .entry(method)
                .and_modify(|cap| cap.enabled = false)
                .or_insert_with(|| DynamicCapability {
                    enabled: false,
                    registration_id: unregistration.id.clone(),
                    options: None,
                });
        }
    }

    /// `None` when the method was never registered dynamically.
    pub fn is_registered(&self, method: &str) -> Option<bool> {
        self.capabilities.get(method).map(|cap| cap.enabled)
    }

    pub fn option(&self, method: &str) -> Option<&Value> {
        self.capabilities.get(method)?.options.as_ref()
    }

    pub fn get(&self, method: &str) -> Option<&DynamicCapability> {
        self.capabilities.get(method)
    }

    pub fn registered_methods(&self) -> impl Iterator<Item = &str> {
        self.capabilities.keys().map(String::as_str)
    }

    pub fn reset(&mut self) {
        self.capabilities.clear();
        self.method_for_id.clear();
    }

    /// Dynamic decision for `method` on one document: `None` if there is no
    /// entry, `Some(false)` if it is disabled or its selector excludes the
    /// document.
    pub fn enabled_for(&self, method: &str, target: &DocumentTarget<'_>) -> Option<bool> {
        let cap = self.capabilities.get(method)?;
        Some(cap.enabled && selector_applies(cap.options.as_ref(), target))
    }
}

/// The facts about a document that selectors match on.
#[derive(Debug, Clone, Copy)]
pub struct DocumentTarget<'a> {
    pub uri: &'a Uri,
    pub language_id: &'a str,
}

impl<'a> DocumentTarget<'a> {
    pub fn new(uri: &'a Uri, language_id: &'a str) -> Self {
        Self { uri, language_id }
    }

    fn scheme(&self) -> &str {
        self.uri
            .as_str()
            .split_once(':')
            .map(|(scheme, _)| scheme)
            .unwrap_or("")
    }

    fn path(&self) -> &str {
        let uri = self.uri.as_str();
        uri.strip_prefix("file://").unwrap_or(uri)
    }
}

/// Whether the `documentSelector` inside `options` covers `target`. A
/// missing or null selector covers everything.
pub fn selector_applies(options: Option<&Value>, target: &DocumentTarget<'_>) -> bool {
    let Some(selector) = options.and_then(|o| o.get("documentSelector")) else {
        return true;
    };
    if selector.is_null() {
        return true;
    }
    match serde_json::from_value::<Vec<DocumentFilter>>(selector.clone()) {
        Ok(filters) => filters.iter().any(|f| filter_matches(f, target)),
        Err(e) => {
            debug!(error = %e, "Ignoring malformed document selector");
            true
        }
    }
}

fn filter_matches(filter: &DocumentFilter, target: &DocumentTarget<'_>) -> bool {
    if let Some(language) = &filter.language {
        if language != target.language_id {
            return false;
        }
    }
    if let Some(scheme) = &filter.scheme {
        if scheme != target.scheme() {
            return false;
        }
    }
    if let Some(pattern) = &filter.pattern {
        let Ok(glob) = glob::Pattern::new(pattern) else {
            return false;
        };
        let path = target.path();
        let file_name = path.rsplit('/').next().unwrap_or(path);
        if !glob.matches(path) && !glob.matches(file_name) {
            return false;
        }
    }
    true
}

/// Semantic token provider options, read the same way from the static
/// provider and from a dynamic registration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SemanticTokensSupport {
    #[serde(default)]
    pub legend: Option<SemanticTokensLegend>,
    #[serde(default)]
    full: Option<Value>,
    #[serde(default)]
    range: Option<Value>,
}

impl SemanticTokensSupport {
    pub fn from_options(options: &Value) -> Option<Self> {
        serde_json::from_value(options.clone()).ok()
    }

    pub fn supports_full(&self) -> bool {
        match &self.full {
            Some(Value::Bool(enabled)) => *enabled,
            Some(Value::Object(_)) => true,
            _ => false,
        }
    }

    pub fn supports_delta(&self) -> bool {
        self.full
            .as_ref()
            .and_then(|full| full.get("delta"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn supports_range(&self) -> bool {
        match &self.range {
            Some(Value::Bool(enabled)) => *enabled,
            Some(Value::Object(_)) => true,
            _ => false,
        }
    }
}

/// Outcome of the save gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaveNotification {
    pub include_text: bool,
}

/// Merged view over static and dynamic capabilities.
#[derive(Debug, Clone, Default)]
pub struct CapabilityRegistry {
    server: ServerCapabilities,
    dynamic: DynamicCapabilities,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn server(&self) -> &ServerCapabilities {
        &self.server
    }

    pub fn set_server(&mut self, server: ServerCapabilities) {
        self.server = server;
    }

    pub fn dynamic(&self) -> &DynamicCapabilities {
        &self.dynamic
    }

    pub fn dynamic_mut(&mut self) -> &mut DynamicCapabilities {
        &mut self.dynamic
    }

    /// Forget everything negotiated with the server.
    pub fn reset(&mut self) {
        self.server = ServerCapabilities::default();
        self.dynamic.reset();
    }

    pub fn did_open_enabled(&self, target: &DocumentTarget<'_>) -> bool {
        if let Some(enabled) = self.dynamic.enabled_for(DID_OPEN, target) {
            return enabled;
        }
        match &self.server.text_document_sync {
            Some(TextDocumentSyncCapability::Options(options)) => options.open_close.unwrap_or(true),
            _ => true,
        }
    }

    /// Sync kind for `didChange`. A dynamic registration means full sync
    /// unless its options say otherwise.
    pub fn sync_kind(&self, target: &DocumentTarget<'_>) -> TextDocumentSyncKind {
        match self.dynamic.enabled_for(DID_CHANGE, target) {
            Some(false) => TextDocumentSyncKind::NONE,
            Some(true) => self
                .dynamic
                .option(DID_CHANGE)
                .and_then(|options| options.get("syncKind"))
                .and_then(Value::as_i64)
                .and_then(|kind| i32::try_from(kind).ok())
                .map(sync_kind_from_i32)
                .unwrap_or(TextDocumentSyncKind::FULL),
            None => self.static_sync_kind(),
        }
    }

    fn static_sync_kind(&self) -> TextDocumentSyncKind {
        match &self.server.text_document_sync {
            Some(TextDocumentSyncCapability::Kind(kind)) => *kind,
            Some(TextDocumentSyncCapability::Options(options)) => {
                options.change.unwrap_or(TextDocumentSyncKind::NONE)
            }
            None => TextDocumentSyncKind::NONE,
        }
    }

    /// `None` when `didSave` must not be sent.
    pub fn save_notification(&self, target: &DocumentTarget<'_>) -> Option<SaveNotification> {
        if let Some(enabled) = self.dynamic.enabled_for(DID_SAVE, target) {
            if !enabled {
                return None;
            }
            let include_text = self
                .dynamic
                .option(DID_SAVE)
                .and_then(|options| options.get("includeText"))
                .and_then(Value::as_bool)
                .unwrap_or(false);
            return Some(SaveNotification { include_text });
        }
        let include_text = match &self.server.text_document_sync {
            Some(TextDocumentSyncCapability::Options(options)) => match &options.save {
                Some(TextDocumentSyncSaveOptions::SaveOptions(save)) => {
                    save.include_text.unwrap_or(false)
                }
                _ => false,
            },
            _ => false,
        };
        Some(SaveNotification { include_text })
    }

    pub fn will_save_enabled(&self, target: &DocumentTarget<'_>) -> bool {
        if let Some(enabled) = self.dynamic.enabled_for(WILL_SAVE, target) {
            return enabled;
        }
        match &self.server.text_document_sync {
            Some(TextDocumentSyncCapability::Options(options)) => options.will_save.unwrap_or(false),
            _ => false,
        }
    }

    pub fn document_highlight_enabled(&self, target: &DocumentTarget<'_>) -> bool {
        if let Some(enabled) = self.dynamic.enabled_for(DOCUMENT_HIGHLIGHT, target) {
            return enabled;
        }
        match &self.server.document_highlight_provider {
            Some(OneOf::Left(enabled)) => *enabled,
            Some(OneOf::Right(_)) => true,
            None => false,
        }
    }

    pub fn workspace_symbol_enabled(&self) -> bool {
        if let Some(enabled) = self.dynamic.is_registered(WORKSPACE_SYMBOL) {
            return enabled;
        }
        match &self.server.workspace_symbol_provider {
            Some(OneOf::Left(enabled)) => *enabled,
            Some(OneOf::Right(_)) => true,
            None => false,
        }
    }

    /// Whether `workspace/didChangeWorkspaceFolders` may be sent.
    pub fn workspace_folder_changes_enabled(&self) -> bool {
        if self
            .dynamic
            .is_registered(DID_CHANGE_WORKSPACE_FOLDERS)
            .unwrap_or(false)
        {
            return true;
        }
        let Some(folders) = self
            .server
            .workspace
            .as_ref()
            .and_then(|workspace| workspace.workspace_folders.as_ref())
        else {
            return false;
        };
        if !folders.supported.unwrap_or(false) {
            return false;
        }
        match &folders.change_notifications {
            Some(OneOf::Left(enabled)) => *enabled,
            Some(OneOf::Right(_)) => true,
            None => false,
        }
    }

    /// Semantic token support for a document, if any.
    pub fn semantic_tokens(&self, target: &DocumentTarget<'_>) -> Option<SemanticTokensSupport> {
        match self.dynamic.enabled_for(SEMANTIC_TOKENS, target) {
            Some(false) => None,
            Some(true) => self
                .dynamic
                .option(SEMANTIC_TOKENS)
                .and_then(SemanticTokensSupport::from_options),
            None => self.static_semantic_tokens(),
        }
    }

    /// Semantic token options advertised in the `initialize` result.
    pub fn static_semantic_tokens(&self) -> Option<SemanticTokensSupport> {
        let provider = self.server.semantic_tokens_provider.as_ref()?;
        let options = serde_json::to_value(provider).ok()?;
        SemanticTokensSupport::from_options(&options)
    }
}

fn sync_kind_from_i32(kind: i32) -> TextDocumentSyncKind {
    match kind {
        1 => TextDocumentSyncKind::FULL,
        2 => TextDocumentSyncKind::INCREMENTAL,
        _ => TextDocumentSyncKind::NONE,
    }
}
