//! Semantic token storage and delta application.
//!
//! Tokens travel as a flat array of `u32`, five per token: delta line,
//! delta start, length, type index and modifier bitset. Deltas are lists of
//! splices into that array.

use crate::capabilities::SemanticTokensSupport;
use lsp_types::{SemanticTokensLegend, Uri};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tracing::debug;

/// How many times a failed token request is re-sent.
pub const MAX_RETRIES: u32 = 3;

const TOKEN_WIDTH: usize = 5;

/// Stored tokens for one document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SemanticTokenState {
    pub result_id: Option<String>,
    pub data: Vec<u32>,
    /// Document version the tokens were requested for.
    pub version: i32,
}

/// Full token set as returned by `textDocument/semanticTokens/full`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawSemanticTokens {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_id: Option<String>,
    pub data: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawSemanticTokensEdit {
    pub start: u32,
    pub delete_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<u32>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawSemanticTokensDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_id: Option<String>,
    pub edits: Vec<RawSemanticTokensEdit>,
}

/// Any reply to a full or delta token request.
#[derive(Debug, Clone, PartialEq)]
pub enum SemanticTokensReply {
    Full(RawSemanticTokens),
    Delta(RawSemanticTokensDelta),
    Empty,
}

impl SemanticTokensReply {
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        if value.is_null() {
            Ok(SemanticTokensReply::Empty)
        } else if value.get("edits").is_some() {
            serde_json::from_value(value).map(SemanticTokensReply::Delta)
        } else {
            serde_json::from_value(value).map(SemanticTokensReply::Full)
        }
    }
}

/// Which request to send for a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenRequest {
    Full,
    Delta { previous_result_id: String },
}

impl TokenRequest {
    pub fn method(&self) -> &'static str {
        match self {
            TokenRequest::Full => "textDocument/semanticTokens/full",
            TokenRequest::Delta { .. } => "textDocument/semanticTokens/full/delta",
        }
    }
}

/// Result of handling a delta reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaOutcome {
    Applied,
    /// The edits do not fit the stored data; a full reload is needed.
    Desynchronized,
}

/// A token with absolute 1-based position and resolved names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpandedSemanticToken {
    pub line: u32,
    pub column: u32,
    pub length: u32,
    pub token_type: String,
    pub modifiers: Vec<String>,
}

/// Splice sorted `edits` into `data`. `None` means the edits do not match
/// the data (the client is out of sync with the server).
pub fn apply_edits(data: &[u32], mut edits: Vec<RawSemanticTokensEdit>) -> Option<Vec<u32>> {
    edits.sort_by_key(|edit| edit.start);

    let new_len = edits.iter().fold(data.len() as i64, |len, edit| {
        len + edit.data.as_ref().map_or(0, Vec::len) as i64 - i64::from(edit.delete_count)
    });
    let mut result = Vec::with_capacity(new_len.max(0) as usize);
    let mut cursor = 0usize;

    for edit in &edits {
        let start = edit.start as usize;
        if start > data.len() || start < cursor {
            debug!(start, len = data.len(), "Semantic token edit outside known data");
            return None;
        }
        result.extend_from_slice(&data[cursor..start]);
        if let Some(insert) = &edit.data {
            result.extend_from_slice(insert);
        }
        let delete_count = edit.delete_count as usize;
        if delete_count > data.len() - start {
            debug!(
                start,
                delete_count,
                len = data.len(),
                "Semantic token edit deletes past the end"
            );
            return None;
        }
        cursor = start + delete_count;
    }
    result.extend_from_slice(&data[cursor..]);
    Some(result)
}

/// Decode relative token data against `legend`.
///
/// Tokens whose type index is outside the legend are skipped, but still
/// move the running position.
pub fn decode(data: &[u32], legend: &SemanticTokensLegend) -> Vec<ExpandedSemanticToken> {
    let mut line = 1u32;
    let mut column = 1u32;
    let mut tokens = Vec::with_capacity(data.len() / TOKEN_WIDTH);

    for chunk in data.chunks_exact(TOKEN_WIDTH) {
        let (delta_line, delta_start, length, type_index, mut modifier_bits) =
            (chunk[0], chunk[1], chunk[2], chunk[3], chunk[4]);
        line = line.saturating_add(delta_line);
        if delta_line != 0 {
            column = 1;
        }
        column = column.saturating_add(delta_start);

        let Some(token_type) = legend.token_types.get(type_index as usize) else {
            continue;
        };
        let mut modifiers = Vec::new();
        for modifier in &legend.token_modifiers {
            if modifier_bits == 0 {
                break;
            }
            if modifier_bits & 1 == 1 {
                modifiers.push(modifier.as_str().to_string());
            }
            modifier_bits >>= 1;
        }
        tokens.push(ExpandedSemanticToken {
            line,
            column,
            length,
            token_type: token_type.as_str().to_string(),
            modifiers,
        });
    }
    tokens
}

/// Per-document token state plus the legend used to decode it.
#[derive(Debug, Default)]
pub struct SemanticTokenStore {
    tokens: HashMap<Uri, SemanticTokenState>,
    legend: Option<SemanticTokensLegend>,
}

impl SemanticTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_legend(&mut self, legend: SemanticTokensLegend) {
        self.legend = Some(legend);
    }

    pub fn legend(&self) -> Option<&SemanticTokensLegend> {
        self.legend.as_ref()
    }

    pub fn tokens(&self, uri: &Uri) -> Option<&SemanticTokenState> {
        self.tokens.get(uri)
    }

    /// Request for a full reload, if the server supports it.
    pub fn plan_reload(&self, support: &SemanticTokensSupport) -> Option<TokenRequest> {
        support.supports_full().then_some(TokenRequest::Full)
    }

    /// Request to bring `uri` up to `current_version`: a delta when the
    /// server supports it and there is a previous result, nothing when the
    /// stored tokens are already current, a full reload otherwise.
    pub fn plan_update(
        &self,
        uri: &Uri,
        current_version: i32,
        support: &SemanticTokensSupport,
    ) -> Option<TokenRequest> {
        if support.supports_delta() {
            if let Some(state) = self.tokens.get(uri) {
                if let Some(result_id) = state.result_id.as_ref().filter(|id| !id.is_empty()) {
                    if state.version == current_version {
                        return None;
                    }
                    return Some(TokenRequest::Delta {
                        previous_result_id: result_id.clone(),
                    });
                }
            }
        }
        self.plan_reload(support)
    }

    /// Store a full token set.
    pub fn handle_full(&mut self, uri: &Uri, tokens: RawSemanticTokens, version: i32) {
        self.tokens.insert(
            uri.clone(),
            SemanticTokenState {
                result_id: tokens.result_id,
                data: tokens.data,
                version,
            },
        );
    }

    /// Handle the reply to a delta request.
    pub fn handle_delta_reply(
        &mut self,
        uri: &Uri,
        reply: SemanticTokensReply,
        version: i32,
    ) -> DeltaOutcome {
        match reply {
            SemanticTokensReply::Full(tokens) => {
                self.handle_full(uri, tokens, version);
                DeltaOutcome::Applied
            }
            SemanticTokensReply::Empty => DeltaOutcome::Applied,
            SemanticTokensReply::Delta(delta) => {
                let state = self.tokens.entry(uri.clone()).or_default();
                match apply_edits(&state.data, delta.edits) {
                    Some(data) => {
                        state.data = data;
                        state.version = version;
                        if delta.result_id.is_some() {
                            state.result_id = delta.result_id;
                        }
                        DeltaOutcome::Applied
                    }
                    None => {
                        // The old result id no longer describes anything the
                        // server will diff against.
                        state.result_id = None;
                        DeltaOutcome::Desynchronized
                    }
                }
            }
        }
    }

    /// Decoded tokens for `uri`, empty without tokens or legend.
    pub fn expanded_tokens(&self, uri: &Uri) -> Vec<ExpandedSemanticToken> {
        match (self.tokens.get(uri), self.legend.as_ref()) {
            (Some(state), Some(legend)) => decode(&state.data, legend),
            _ => Vec::new(),
        }
    }

    pub fn remove(&mut self, uri: &Uri) -> bool {
        self.tokens.remove(uri).is_some()
    }

    /// Drop all stored tokens. The legend is kept.
    pub fn clear(&mut self) {
        self.tokens.clear();
    }

    /// Drop tokens and legend.
    pub fn reset(&mut self) {
        self.tokens.clear();
        self.legend = None;
    }
}
