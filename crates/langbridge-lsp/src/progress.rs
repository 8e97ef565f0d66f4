//! Work-done progress tracking.

use crate::protocol::MessageId;
use lsp_types::{WorkDoneProgress, WorkDoneProgressBegin, WorkDoneProgressEnd, WorkDoneProgressReport};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, trace};

/// Progress tokens share the integer-or-string shape of request ids.
pub type ProgressToken = MessageId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEntry {
    pub token: ProgressToken,
    pub title: String,
    pub message: Option<String>,
    pub percentage: Option<u32>,
}

/// What an observer of the tracker sees.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    Begin(ProgressEntry),
    Report(ProgressEntry),
    End {
        token: ProgressToken,
        title: String,
        message: Option<String>,
        /// A final message exists and the handle should stay visible until
        /// the user dismisses it.
        keep_visible: bool,
    },
}

impl ProgressEvent {
    pub fn token(&self) -> &ProgressToken {
        match self {
            ProgressEvent::Begin(entry) | ProgressEvent::Report(entry) => &entry.token,
            ProgressEvent::End { token, .. } => token,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ProgressParams {
    token: ProgressToken,
    value: Value,
}

#[derive(Debug, Default)]
pub struct ProgressTracker {
    entries: HashMap<ProgressToken, ProgressEntry>,
    titles: HashMap<ProgressToken, String>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Title to use for `token` instead of the one the server sends.
    pub fn set_title_for_token(&mut self, token: ProgressToken, title: impl Into<String>) {
        self.titles.insert(token, title.into());
    }

    pub fn entry(&self, token: &ProgressToken) -> Option<&ProgressEntry> {
        self.entries.get(token)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Handle `$/progress` params. Values that are not work-done progress
    /// (partial results) are ignored.
    pub fn handle_notification(&mut self, params: Value) -> Option<ProgressEvent> {
        let params: ProgressParams = match serde_json::from_value(params) {
            Ok(params) => params,
            Err(e) => {
                debug!(error = %e, "Malformed $/progress params");
                return None;
            }
        };
        match serde_json::from_value::<WorkDoneProgress>(params.value) {
            Ok(WorkDoneProgress::Begin(begin)) => Some(self.begin(params.token, begin)),
            Ok(WorkDoneProgress::Report(report)) => self.report(&params.token, report),
            Ok(WorkDoneProgress::End(end)) => self.end(&params.token, end),
            Err(_) => {
                trace!(token = %params.token, "Ignoring non work-done progress");
                None
            }
        }
    }

    pub fn begin(&mut self, token: ProgressToken, begin: WorkDoneProgressBegin) -> ProgressEvent {
        let title = self.titles.get(&token).cloned().unwrap_or(begin.title);
        let entry = ProgressEntry {
            token: token.clone(),
            title,
            message: begin.message,
            percentage: begin.percentage,
        };
        debug!(token = %token, title = %entry.title, "Progress begin");
        self.entries.insert(token, entry.clone());
        ProgressEvent::Begin(entry)
    }

    /// Update an entry in place. Unknown tokens are ignored.
    pub fn report(&mut self, token: &ProgressToken, report: WorkDoneProgressReport) -> Option<ProgressEvent> {
        let Some(entry) = self.entries.get_mut(token) else {
            trace!(token = %token, "Report for unknown progress token");
            return None;
        };
        if report.message.is_some() {
            entry.message = report.message;
        }
        if report.percentage.is_some() {
            entry.percentage = report.percentage;
        }
        Some(ProgressEvent::Report(entry.clone()))
    }

    pub fn end(&mut self, token: &ProgressToken, end: WorkDoneProgressEnd) -> Option<ProgressEvent> {
        let entry = self.entries.remove(token)?;
        self.titles.remove(token);
        let keep_visible = end.message.as_ref().is_some_and(|m| !m.is_empty());
        debug!(token = %token, keep_visible, "Progress end");
        Some(ProgressEvent::End {
            token: entry.token,
            title: entry.title,
            message: end.message,
            keep_visible,
        })
    }

    /// End everything that is still running.
    pub fn reset(&mut self) -> Vec<ProgressEvent> {
        self.titles.clear();
        self.entries
            .drain()
            .map(|(token, entry)| ProgressEvent::End {
                token,
                title: entry.title,
                message: None,
                keep_visible: false,
            })
            .collect()
    }
}
