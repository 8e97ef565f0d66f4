//! `langbridge check`: print the diagnostics a server reports for a file.

use super::session::{prepare, Session};
use crate::settings::Settings;
use langbridge_lsp::{ClientEvent, Diagnostic, DiagnosticInfo, DiagnosticSeverity};
use std::path::Path;
use std::time::Duration;
use tracing::warn;

/// Returns the number of errors reported.
pub async fn run_check(
    settings: &Settings,
    file: &Path,
    timeout: Duration,
    json: bool,
) -> anyhow::Result<usize> {
    let target = prepare(settings, file)?;
    let shutdown_timeout = target.config.shutdown_timeout();
    let mut session = Session::start(target.config.clone(), &target.root, timeout).await?;

    let uri = target.document.uri.clone();
    session.handle.open_document(target.document.clone())?;
    let published = session
        .wait_for(timeout, |event| {
            matches!(event, ClientEvent::DiagnosticsChanged(changed) if *changed == uri)
        })
        .await;
    if let Err(e) = published {
        warn!(server = %session.name(), "No diagnostics published: {e:#}");
    }

    let query = uri.clone();
    let diagnostics: Vec<Diagnostic> = session
        .handle
        .call(move |client| client.diagnostics().shown_diagnostics(&query).to_vec())
        .await?;
    session.shutdown(shutdown_timeout).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&diagnostics)?);
    } else if diagnostics.is_empty() {
        println!("{}: no diagnostics", target.path.display());
    } else {
        for diagnostic in &diagnostics {
            let info = DiagnosticInfo::from_lsp(diagnostic, &uri);
            println!("{} {}", info.path, info.pretty());
        }
    }

    Ok(count_errors(&diagnostics))
}

fn count_errors(diagnostics: &[Diagnostic]) -> usize {
    diagnostics
        .iter()
        .filter(|d| matches!(d.severity, None | Some(DiagnosticSeverity::ERROR)))
        .count()
}
