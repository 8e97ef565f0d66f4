//! Language Server Protocol (LSP) client for editors.
//!
//! The crate keeps an editor's view of its documents in sync with one or
//! more language servers and collects what they publish back:
//! - JSON-RPC framing over a byte transport (stdio child process or memory)
//! - Initialize/shutdown handshake with retry and restart budget
//! - Static and dynamically registered capabilities
//! - Debounced incremental or full document synchronization
//! - Version-gated diagnostics
//! - Semantic tokens with delta updates and desync recovery
//! - Work-done progress and server messages
//!
//! # Architecture
//!
//! ```text
//! ┌──────────┐ commands ┌──────────────┐ bytes ┌───────────┐ stdio ┌─────────────┐
//! │  Editor  │─────────▶│ ClientDriver │──────▶│ Transport │──────▶│ Lang Server │
//! │          │◀─────────│   (Client)   │◀──────│           │◀──────│             │
//! └──────────┘  events  └──────────────┘       └───────────┘       └─────────────┘
//! ```
//!
//! [`Client`] is a plain state machine: it never blocks and never spawns.
//! Transport bytes go in through [`Client::handle_transport_event`], timers
//! through [`Client::handle_timeout`], and results come out as
//! [`ClientEvent`]s. [`ClientDriver`] runs one client on a tokio task;
//! [`ClientRegistry`] manages several.
//!
//! # Example
//!
//! ```no_run
//! use langbridge_lsp::{path_to_uri, Client, ClientDriver, ClientEvent, ClientId, LspConfig, StdioTransport, TextDocument};
//! use std::path::Path;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = LspConfig::rust();
//! let transport = StdioTransport::new(config.server_command());
//! let client = Client::new(config, Box::new(transport));
//! let (driver, handle, mut events) = ClientDriver::new(ClientId(1), client);
//! tokio::spawn(driver.run());
//!
//! let path = Path::new("src/main.rs");
//! let doc = TextDocument::from_path(path, std::fs::read_to_string(path)?)?;
//! handle.open_document(doc)?;
//!
//! while let Some(event) = events.recv().await {
//!     if let ClientEvent::DiagnosticsChanged(uri) = event {
//!         let shown = handle
//!             .call(move |client| client.diagnostics().shown_diagnostics(&uri).len())
//!             .await?;
//!         println!("{shown} diagnostics");
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod capabilities;
pub mod client;
mod config;
mod correlator;
pub mod diagnostics;
pub mod document;
mod driver;
mod error;
pub mod framing;
pub mod progress;
pub mod protocol;
mod registry;
pub mod semantic_tokens;
pub mod transport;

pub use capabilities::{CapabilityRegistry, DynamicCapabilities, SemanticTokensSupport};
pub use client::{client_capabilities, Client, ClientEvent, ClientState, UpdateMode};
pub use config::{default_configs, LspConfig};
pub use correlator::RequestCorrelator;
pub use diagnostics::{DiagnosticInfo, DiagnosticSeverityLevel, DiagnosticStore};
pub use document::{path_to_uri, uri_to_path, DocumentStore, TextDocument};
pub use driver::{ClientCommand, ClientDriver, ClientHandle};
pub use error::{LspError, LspResult};
pub use framing::{LspCodec, MessageFramer};
pub use progress::{ProgressEntry, ProgressEvent, ProgressTracker};
pub use protocol::{ErrorCode, Message, MessageId, ResponseError, ResponseResult};
pub use registry::{ClientRegistry, RESTART_DELAY};
pub use semantic_tokens::{ExpandedSemanticToken, SemanticTokenStore};
pub use transport::{
    ClientId, MemoryServer, MemoryTransport, ServerCommand, StdioTransport, Transport,
    TransportEvent, TransportSink,
};

// Re-export useful lsp-types
pub use lsp_types::{Diagnostic, DiagnosticSeverity, MessageType, Position, Range, Uri};
