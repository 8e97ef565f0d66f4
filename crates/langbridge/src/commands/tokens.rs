//! `langbridge tokens`: dump the semantic tokens of a file.

use super::session::{prepare, Session};
use crate::settings::Settings;
use anyhow::Context;
use langbridge_lsp::{ClientEvent, ExpandedSemanticToken};
use serde_json::json;
use std::path::Path;
use std::time::Duration;

pub async fn run_tokens(
    settings: &Settings,
    file: &Path,
    timeout: Duration,
    json: bool,
) -> anyhow::Result<()> {
    let target = prepare(settings, file)?;
    let shutdown_timeout = target.config.shutdown_timeout();
    let mut session = Session::start(target.config.clone(), &target.root, timeout).await?;

    let uri = target.document.uri.clone();
    session.handle.open_document(target.document.clone())?;
    let received = session
        .wait_for(timeout, |event| {
            matches!(event, ClientEvent::SemanticTokensChanged(changed) if *changed == uri)
        })
        .await
        .with_context(|| format!("{} sent no semantic tokens", session.name()));

    let tokens = match received {
        Ok(_) => {
            let query = uri.clone();
            session
                .handle
                .call(move |client| client.expanded_semantic_tokens(&query))
                .await?
        }
        Err(e) => {
            session.shutdown(shutdown_timeout).await?;
            return Err(e);
        }
    };
    session.shutdown(shutdown_timeout).await?;

    if json {
        let values: Vec<_> = tokens.iter().map(to_json).collect();
        println!("{}", serde_json::to_string_pretty(&values)?);
    } else {
        for token in &tokens {
            println!("{}", format_token(token));
        }
    }
    Ok(())
}

fn to_json(token: &ExpandedSemanticToken) -> serde_json::Value {
    json!({
        "line": token.line,
        "column": token.column,
        "length": token.length,
        "type": token.token_type,
        "modifiers": token.modifiers,
    })
}

fn format_token(token: &ExpandedSemanticToken) -> String {
    let mut line = format!(
        "{}:{} +{} {}",
        token.line, token.column, token.length, token.token_type
    );
    if !token.modifiers.is_empty() {
        line.push_str(&format!(" [{}]", token.modifiers.join(", ")));
    }
    line
}
