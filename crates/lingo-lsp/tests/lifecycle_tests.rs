//! End-to-end lifecycle tests against the public API.
//!
//! Servers are real child processes: a small `sh` script that answers the
//! initialize handshake with a canned framed response and then idles.

use lingo_lsp::{LspError, Manager, ServerConfig, SupervisionMode, SupervisorState};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;

fn canned_initialize_frame() -> String {
    let body = serde_json::to_string(
        &json!({"jsonrpc": "2.0", "id": 1, "result": {"capabilities": {}}}),
    )
    .unwrap();
    format!("Content-Length: {}\r\n\r\n{}", body.len(), body)
}

fn scripted_config(language: &str, extensions: Vec<&str>) -> ServerConfig {
    ServerConfig::new(language, "sh", extensions).with_args(vec![
        "-c".to_string(),
        "printf '%s' \"$0\"; sleep 30".to_string(),
        canned_initialize_frame(),
    ])
}

/// Register a server, open a file, confirm tracking, then shut down.
#[tokio::test]
async fn test_open_edit_close_through_manager() {
    let manager = Manager::new(SupervisionMode::Unsupervised);
    manager.register_server(scripted_config("rust", vec!["rs"])).await;

    let path = Path::new("/project/src/lib.rs");
    manager
        .open_document(path, "pub fn answer() -> u32 { 42 }")
        .await
        .expect("Failed to open document");
    manager
        .change_document(path, "pub fn answer() -> u32 { 41 }")
        .await
        .expect("Failed to change document");

    let server = manager
        .server_for_file(path)
        .await
        .expect("Failed to resolve server");
    let documents = server.tracked_documents().await;
    assert_eq!(documents.len(), 1);
    assert_eq!(documents[0].version, 2);
    assert_eq!(documents[0].text, "pub fn answer() -> u32 { 41 }");

    manager
        .close_document(path)
        .await
        .expect("Failed to close document");
    manager.shutdown().await.expect("Failed to shut down");
}

/// Typed requests against an empty capability set fail before any send.
#[tokio::test]
async fn test_unadvertised_capability_is_rejected() {
    let manager = Manager::new(SupervisionMode::Unsupervised);
    manager.register_server(scripted_config("rust", vec!["rs"])).await;

    let server = manager
        .server_for_language("rust")
        .await
        .expect("Failed to start server");
    let result = server
        .hover("file:///a.rs", lingo_lsp::lsp_types::Position::new(0, 0))
        .await;
    assert!(matches!(result, Err(LspError::NotSupported(_))));

    manager.shutdown().await.expect("Failed to shut down");
}

/// Supervised instances report supervisor state and accept a restart.
#[tokio::test]
async fn test_supervised_status_and_restart() {
    let manager = Arc::new(Manager::new(SupervisionMode::Supervised));
    manager.register_server(scripted_config("go", vec!["go"])).await;

    let first = manager
        .server_for_language("go")
        .await
        .expect("Failed to start server");
    assert!(first.is_ready().await);

    let statuses = manager.statuses().await;
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0].language, "go");
    assert_eq!(statuses[0].supervisor_state, Some(SupervisorState::Running));

    manager
        .restart_server("go")
        .await
        .expect("Failed to restart server");
    let second = manager
        .server_for_language("go")
        .await
        .expect("Failed to start replacement");
    assert!(!Arc::ptr_eq(&first, &second));

    manager.shutdown().await.expect("Failed to shut down");
}
