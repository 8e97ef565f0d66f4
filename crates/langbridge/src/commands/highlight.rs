//! `langbridge highlight`: list the occurrences of the symbol at a
//! position.

use super::session::{prepare, Session};
use crate::settings::Settings;
use anyhow::{anyhow, bail};
use langbridge_lsp::{ClientEvent, Position};
use lsp_types::{DocumentHighlight, DocumentHighlightKind};
use std::path::Path;
use std::time::Duration;
use tokio::sync::oneshot;

/// `line` and `column` are 1-based, as editors show them.
pub async fn run_highlight(
    settings: &Settings,
    file: &Path,
    line: u32,
    column: u32,
    timeout: Duration,
) -> anyhow::Result<()> {
    if line == 0 || column == 0 {
        bail!("line and column start at 1");
    }
    let target = prepare(settings, file)?;
    let shutdown_timeout = target.config.shutdown_timeout();
    let mut session = Session::start(target.config.clone(), &target.root, timeout).await?;

    let uri = target.document.uri.clone();
    session.handle.open_document(target.document.clone())?;
    // Some servers only answer once they have looked at the file.
    let _ = session
        .wait_for(Duration::from_millis(500), |event| {
            matches!(event, ClientEvent::DiagnosticsChanged(_))
        })
        .await;

    let (tx, rx) = oneshot::channel();
    let position = Position::new(line - 1, column - 1);
    let sent = session
        .handle
        .call(move |client| {
            client
                .request_document_highlights(&uri, position, move |result| {
                    let _ = tx.send(result);
                })
                .is_some()
        })
        .await?;

    let result = if sent {
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result.map_err(|e| anyhow!("server refused: {}", e.message)),
            Ok(Err(_)) => Err(anyhow!("request was cancelled")),
            Err(_) => Err(anyhow!("timed out after {}s", timeout.as_secs())),
        }
    } else {
        Err(anyhow!("{} does not support document highlights", session.name()))
    };
    session.shutdown(shutdown_timeout).await?;

    let highlights: Option<Vec<DocumentHighlight>> = serde_json::from_value(result?)?;
    let highlights = highlights.unwrap_or_default();
    if highlights.is_empty() {
        println!("no highlights at {}:{}:{}", target.path.display(), line, column);
    }
    for highlight in &highlights {
        println!("{}", format_highlight(highlight));
    }
    Ok(())
}

fn format_highlight(highlight: &DocumentHighlight) -> String {
    let kind = match highlight.kind {
        Some(DocumentHighlightKind::WRITE) => "write",
        Some(DocumentHighlightKind::READ) => "read",
        _ => "text",
    };
    let start = highlight.range.start;
    let end = highlight.range.end;
    format!(
        "{}:{}-{}:{} {}",
        start.line + 1,
        start.character + 1,
        end.line + 1,
        end.character + 1,
        kind
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use langbridge_lsp::Range;

    #[test]
    fn test_format_highlight() {
        let highlight = DocumentHighlight {
            range: Range::new(Position::new(0, 4), Position::new(0, 7)),
            kind: Some(DocumentHighlightKind::WRITE),
        };
        assert_eq!(format_highlight(&highlight), "1:5-1:8 write");

        let highlight = DocumentHighlight {
            kind: None,
            ..highlight
        };
        assert_eq!(format_highlight(&highlight), "1:5-1:8 text");
    }
}
