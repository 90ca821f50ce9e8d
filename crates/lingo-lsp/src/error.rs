//! LSP error types.

use thiserror::Error;

/// Result type for LSP operations.
pub type LspResult<T> = Result<T, LspError>;

/// Errors that can occur during LSP operations.
#[derive(Debug, Error)]
pub enum LspError {
    /// No server registered for a language.
    #[error("No server configured for language: {0}")]
    NoServerConfigured(String),

    /// No language could be resolved for a file.
    #[error("No server configured for file: {0}")]
    NoServerForFile(String),

    /// The remote side answered with a protocol-level error.
    #[error("Server error {code}: {message}")]
    Server { code: i64, message: String },

    /// Operation attempted while the connection is not ready.
    #[error("Server for {language} is not ready (status: {status})")]
    NotReady { language: String, status: String },

    /// The remote side does not advertise support for an operation.
    #[error("Server does not support {0}")]
    NotSupported(&'static str),

    /// Document is already tracked.
    #[error("Document already open: {0}")]
    AlreadyOpen(String),

    /// Document is not tracked.
    #[error("Document not open: {0}")]
    NotOpen(String),

    /// A request did not complete within its deadline.
    #[error("Request timed out: {0}")]
    Timeout(String),

    /// The transport has been shut down.
    #[error("Transport closed")]
    Closed,

    /// Server process failure (spawn, missing pipe, unexpected exit).
    #[error("Server process error: {0}")]
    Process(String),

    /// The initialize handshake failed.
    #[error("Server initialization failed: {0}")]
    InitializationFailed(String),

    /// The supervisor exhausted its restart budget.
    #[error("Server for {0} permanently failed")]
    PermanentlyFailed(String),

    /// Protocol error (malformed frame, unexpected payload shape).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Invalid URI.
    #[error("Invalid URI: {0}")]
    InvalidUri(String),

    /// Errors aggregated during shutdown.
    #[error("Shutdown completed with errors: {}", .0.join("; "))]
    Shutdown(Vec<String>),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl LspError {
    /// Create a process error.
    pub fn process(message: impl Into<String>) -> Self {
        Self::Process(message.into())
    }

    /// Create a protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    /// Create a not-ready error.
    pub fn not_ready(language: impl Into<String>, status: impl Into<String>) -> Self {
        Self::NotReady {
            language: language.into(),
            status: status.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let errors = vec![
            (
                LspError::NoServerConfigured("rust".to_string()),
                "No server configured for language: rust",
            ),
            (
                LspError::NoServerForFile("test.xyz".to_string()),
                "No server configured for file: test.xyz",
            ),
            (
                LspError::Server {
                    code: -32601,
                    message: "method not found".to_string(),
                },
                "Server error -32601: method not found",
            ),
            (
                LspError::NotSupported("textDocument/rename"),
                "Server does not support textDocument/rename",
            ),
            (
                LspError::AlreadyOpen("file:///a.rs".to_string()),
                "Document already open: file:///a.rs",
            ),
            (
                LspError::NotOpen("file:///a.rs".to_string()),
                "Document not open: file:///a.rs",
            ),
            (
                LspError::Timeout("initialize".to_string()),
                "Request timed out: initialize",
            ),
            (LspError::Closed, "Transport closed"),
            (
                LspError::Process("exit 1".to_string()),
                "Server process error: exit 1",
            ),
            (
                LspError::InitializationFailed("no reply".to_string()),
                "Server initialization failed: no reply",
            ),
            (
                LspError::PermanentlyFailed("go".to_string()),
                "Server for go permanently failed",
            ),
            (
                LspError::InvalidUri("bad://uri".to_string()),
                "Invalid URI: bad://uri",
            ),
        ];

        for (error, expected) in errors {
            assert_eq!(error.to_string(), expected);
        }
    }

    #[test]
    fn test_not_ready_display() {
        let err = LspError::not_ready("rust", "Starting");
        assert_eq!(
            err.to_string(),
            "Server for rust is not ready (status: Starting)"
        );
    }

    #[test]
    fn test_shutdown_aggregate_display() {
        let err = LspError::Shutdown(vec!["a failed".to_string(), "b failed".to_string()]);
        assert_eq!(
            err.to_string(),
            "Shutdown completed with errors: a failed; b failed"
        );
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let lsp_err: LspError = io_err.into();
        assert!(lsp_err.to_string().contains("IO error"));
    }

    #[test]
    fn test_error_from_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("invalid").unwrap_err();
        let lsp_err: LspError = json_err.into();
        assert!(lsp_err.to_string().contains("JSON error"));
    }
}
