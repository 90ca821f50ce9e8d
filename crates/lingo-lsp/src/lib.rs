//! Language Server Protocol (LSP) client core for lingo.
//!
//! This crate manages external language server processes and exposes
//! their code intelligence over a typed API:
//! - Content-Length framed JSON-RPC transport with request correlation
//! - One connection per server process with a full initialize handshake
//! - Capability gating before any typed request is sent
//! - Document tracking with versioned full-text synchronization
//! - Diagnostics collection pushed by the server
//! - Optional crash-recovery supervision with backoff and replay
//! - A per-language manager that starts servers lazily
//!
//! # Architecture
//!
//! ```text
//! ┌─────────┐     ┌────────────────┐     ┌──────────────┐
//! │ Manager │────▶│ Supervisor     │────▶│ Lang Server  │
//! │         │     │ LanguageServer │◀────│ (rust-analyzer)
//! └─────────┘     └────────────────┘     └──────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use lingo_lsp::{Manager, SupervisionMode};
//! use std::path::Path;
//!
//! # async fn example() -> lingo_lsp::LspResult<()> {
//! let manager = Manager::new(SupervisionMode::Supervised);
//! manager.register_defaults().await;
//!
//! manager
//!     .open_document(Path::new("src/main.rs"), "fn main() {}")
//!     .await?;
//!
//! let server = manager.server_for_file(Path::new("src/main.rs")).await?;
//! let locations = server
//!     .definition("file:///src/main.rs", lsp_types::Position::new(0, 3))
//!     .await?;
//! println!("{locations:?}");
//!
//! manager.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod document;
pub mod error;
pub mod manager;
pub mod protocol;
pub mod server;
pub mod supervisor;
pub mod transport;

pub use config::{default_configs, ServerConfig};
pub use document::TrackedDocument;
pub use error::{LspError, LspResult};
pub use manager::{Manager, ServerStatusReport, SupervisionMode};
pub use server::{
    hover_text, DiagnosticsHandler, DocumentSymbolNode, LanguageServer, ProcessExit,
    ServerStatus,
};
pub use supervisor::{
    RestartPolicy, Supervisor, SupervisorEvent, SupervisorEventKind, SupervisorState,
};
pub use transport::{NotificationHandler, Transport};

// Re-export for downstream signatures built on protocol types.
pub use lsp_types;
