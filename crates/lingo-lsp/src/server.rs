//! A connection to one language server process.
//!
//! [`LanguageServer`] owns exactly one external process and the transport
//! wired to its stdio, drives the initialize handshake, tracks open
//! documents, and exposes the typed protocol operations. Every typed
//! operation checks readiness and the remote's advertised capabilities
//! before anything is sent.

use crate::config::ServerConfig;
use crate::document::TrackedDocument;
use crate::error::{LspError, LspResult};
use crate::transport::Transport;
use lingo_util::TimingGuard;
use lsp_types::{
    ClientCapabilities, CodeActionContext, CodeActionOrCommand, CodeActionParams,
    CodeActionProviderCapability, CompletionItem, CompletionParams, CompletionResponse,
    Diagnostic, DidChangeTextDocumentParams, DidCloseTextDocumentParams,
    DidOpenTextDocumentParams, DidSaveTextDocumentParams, DocumentFormattingParams,
    DocumentRangeFormattingParams, DocumentSymbol, DocumentSymbolParams, DocumentSymbolResponse,
    FormattingOptions, GotoDefinitionParams, Hover, HoverParams, HoverProviderCapability,
    InitializeParams, InitializeResult, InitializedParams, Location, LocationLink, OneOf,
    PartialResultParams, Position, PublishDiagnosticsClientCapabilities,
    PublishDiagnosticsParams, Range, ReferenceContext, ReferenceParams, RenameParams,
    ServerCapabilities, SignatureHelp, SignatureHelpParams, SymbolInformation, SymbolKind,
    TextDocumentClientCapabilities, TextDocumentContentChangeEvent, TextDocumentIdentifier,
    TextDocumentItem, TextDocumentPositionParams, TextDocumentSyncClientCapabilities, TextEdit,
    TypeDefinitionProviderCapability, Uri, VersionedTextDocumentIdentifier,
    WorkDoneProgressParams, WorkspaceEdit, WorkspaceFolder, WorkspaceSymbolParams,
};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{watch, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Budget for the best-effort graceful shutdown round trip.
const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_millis(500);

/// How long to wait for the process to exit after teardown.
const EXIT_WAIT_TIMEOUT: Duration = Duration::from_secs(2);

/// Lifecycle state of one server connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerStatus {
    Stopped,
    Starting,
    Initializing,
    Ready,
    ShuttingDown,
    Error,
}

impl std::fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ServerStatus::Stopped => "Stopped",
            ServerStatus::Starting => "Starting",
            ServerStatus::Initializing => "Initializing",
            ServerStatus::Ready => "Ready",
            ServerStatus::ShuttingDown => "ShuttingDown",
            ServerStatus::Error => "Error",
        };
        f.write_str(s)
    }
}

/// Terminal report from the process watcher.
#[derive(Debug, Clone)]
pub struct ProcessExit {
    /// Exit code, if the process exited normally.
    pub code: Option<i32>,
    /// Whether the exit was requested by `shutdown`.
    pub planned: bool,
}

/// Handle to the watcher task that owns the child process.
pub(crate) struct ProcessHandle {
    kill: CancellationToken,
    planned: Arc<AtomicBool>,
    exit_rx: watch::Receiver<Option<ProcessExit>>,
}

impl ProcessHandle {
    /// Move the child into a watcher task. The task publishes the exit
    /// status on a watch channel and force-kills the child when the token
    /// fires.
    fn watch(mut child: Child) -> Self {
        let kill = CancellationToken::new();
        let planned = Arc::new(AtomicBool::new(false));
        let (exit_tx, exit_rx) = watch::channel(None);

        let watcher_kill = kill.clone();
        let watcher_planned = Arc::clone(&planned);
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = watcher_kill.cancelled() => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };
            let code = status.ok().and_then(|s| s.code());
            let planned = watcher_planned.load(Ordering::SeqCst);
            let _ = exit_tx.send(Some(ProcessExit { code, planned }));
        });

        Self {
            kill,
            planned,
            exit_rx,
        }
    }

    /// A handle with no process behind it, for wiring a connection to an
    /// in-process peer.
    #[cfg(test)]
    pub(crate) fn dummy() -> (Self, watch::Sender<Option<ProcessExit>>) {
        let (exit_tx, exit_rx) = watch::channel(None);
        (
            Self {
                kill: CancellationToken::new(),
                planned: Arc::new(AtomicBool::new(false)),
                exit_rx,
            },
            exit_tx,
        )
    }
}

/// Handler invoked when the server publishes diagnostics for a document.
pub type DiagnosticsHandler = Arc<dyn Fn(&str, &[Diagnostic]) + Send + Sync>;

/// Per-URI diagnostics plus the registered push callback.
///
/// Uses std locks because it is touched from the sync notification handler;
/// critical sections never hold a lock across an await point.
#[derive(Default)]
struct DiagnosticsState {
    map: StdMutex<HashMap<String, Vec<Diagnostic>>>,
    handler: StdMutex<Option<DiagnosticsHandler>>,
}

impl DiagnosticsState {
    fn lock_map(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<Diagnostic>>> {
        self.map.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, params: PublishDiagnosticsParams) {
        let uri = params.uri.as_str().to_string();
        {
            let mut map = self.lock_map();
            if params.diagnostics.is_empty() {
                // An empty set clears the entry rather than storing it.
                map.remove(&uri);
            } else {
                map.insert(uri.clone(), params.diagnostics.clone());
            }
        }

        let handler = self
            .handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(handler) = handler {
            handler(&uri, &params.diagnostics);
        }
    }
}

/// One live language server connection.
pub struct LanguageServer {
    config: ServerConfig,
    transport: Transport,
    /// Capabilities advertised during the initialize handshake.
    capabilities: ServerCapabilities,
    status: Arc<RwLock<ServerStatus>>,
    /// Open documents keyed by URI. Held across the notify write so
    /// per-document notifications keep their issue order.
    documents: Mutex<HashMap<String, TrackedDocument>>,
    diagnostics: Arc<DiagnosticsState>,
    process: ProcessHandle,
}

impl LanguageServer {
    /// Spawn the configured process and drive it to `Ready`.
    pub async fn start(config: ServerConfig) -> LspResult<Self> {
        info!(
            language = %config.language,
            command = %config.command,
            "Starting language server"
        );

        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &config.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| {
            LspError::process(format!("Failed to spawn {}: {e}", config.command))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| LspError::process("Failed to open server stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| LspError::process("Failed to open server stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| LspError::process("Failed to open server stderr"))?;

        // Drain stderr into the logs so a chatty server cannot fill the pipe.
        let stderr_language = config.language.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if !line.is_empty() {
                    debug!(language = %stderr_language, line = %line, "server stderr");
                }
            }
        });

        let transport = Transport::new(stdout, stdin);
        let process = ProcessHandle::watch(child);
        Self::initialize(config, transport, process).await
    }

    /// Perform the handshake over an already-wired transport.
    pub(crate) async fn initialize(
        config: ServerConfig,
        transport: Transport,
        process: ProcessHandle,
    ) -> LspResult<Self> {
        let status = Arc::new(RwLock::new(ServerStatus::Starting));
        *status.write().await = ServerStatus::Initializing;

        let init_result = {
            let _timing = TimingGuard::handshake(config.language.clone());
            Self::handshake(&config, &transport).await
        };

        let init_result = match init_result {
            Ok(result) => result,
            Err(e) => {
                // Tear the process down; nothing else may run before Ready.
                *status.write().await = ServerStatus::Error;
                let _ = transport.close().await;
                process.kill.cancel();
                return Err(e);
            }
        };

        let diagnostics = Arc::new(DiagnosticsState::default());
        let handler_state = Arc::clone(&diagnostics);
        transport
            .on_notification("textDocument/publishDiagnostics", move |_method, params| {
                let Some(params) = params else { return };
                match serde_json::from_value::<PublishDiagnosticsParams>(params) {
                    Ok(params) => handler_state.publish(params),
                    Err(e) => warn!(error = %e, "Malformed publishDiagnostics payload"),
                }
            })
            .await;
        transport
            .on_unhandled_notification(|method, _params| {
                debug!(method = %method, "Unhandled server notification");
            })
            .await;

        // Flip to Error if the process dies outside a planned shutdown.
        let status_watch = Arc::clone(&status);
        let mut exit_rx = process.exit_rx.clone();
        tokio::spawn(async move {
            loop {
                let exit = exit_rx.borrow().clone();
                if let Some(exit) = exit {
                    if !exit.planned {
                        let mut status = status_watch.write().await;
                        if !matches!(
                            *status,
                            ServerStatus::ShuttingDown | ServerStatus::Stopped
                        ) {
                            *status = ServerStatus::Error;
                        }
                    }
                    return;
                }
                if exit_rx.changed().await.is_err() {
                    return;
                }
            }
        });

        *status.write().await = ServerStatus::Ready;
        info!(language = %config.language, "Language server ready");

        Ok(Self {
            config,
            transport,
            capabilities: init_result.capabilities,
            status,
            documents: Mutex::new(HashMap::new()),
            diagnostics,
            process,
        })
    }

    async fn handshake(
        config: &ServerConfig,
        transport: &Transport,
    ) -> LspResult<InitializeResult> {
        let workspace_folders = config.working_dir.as_ref().and_then(|dir| {
            let uri: Uri = format!("file://{}", dir.display()).parse().ok()?;
            let name = dir
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("workspace")
                .to_string();
            Some(vec![WorkspaceFolder { uri, name }])
        });

        let params = InitializeParams {
            process_id: Some(std::process::id()),
            initialization_options: config.initialization_options.clone(),
            workspace_folders,
            capabilities: ClientCapabilities {
                text_document: Some(TextDocumentClientCapabilities {
                    publish_diagnostics: Some(PublishDiagnosticsClientCapabilities {
                        related_information: Some(true),
                        ..Default::default()
                    }),
                    synchronization: Some(TextDocumentSyncClientCapabilities {
                        did_save: Some(true),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            },
            ..Default::default()
        };

        let response = transport
            .call(
                "initialize",
                Some(serde_json::to_value(&params)?),
                config.initialize_timeout(),
            )
            .await
            .map_err(|e| match e {
                LspError::Server { message, .. } => LspError::InitializationFailed(message),
                LspError::Timeout(_) => {
                    LspError::InitializationFailed("handshake timed out".to_string())
                }
                other => other,
            })?;

        let result: InitializeResult = serde_json::from_value(response)
            .map_err(|e| LspError::InitializationFailed(format!("bad initialize result: {e}")))?;

        transport
            .notify(
                "initialized",
                Some(serde_json::to_value(InitializedParams {})?),
            )
            .await?;

        Ok(result)
    }

    /// The language id this connection serves.
    pub fn language(&self) -> &str {
        &self.config.language
    }

    /// Configuration this connection was started from.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Capabilities advertised by the remote side.
    pub fn capabilities(&self) -> &ServerCapabilities {
        &self.capabilities
    }

    /// Current lifecycle state.
    pub async fn status(&self) -> ServerStatus {
        *self.status.read().await
    }

    /// Whether typed operations are currently accepted.
    pub async fn is_ready(&self) -> bool {
        self.status().await == ServerStatus::Ready
    }

    /// Watch channel publishing the process's exit, once it happens.
    pub fn exit_signal(&self) -> watch::Receiver<Option<ProcessExit>> {
        self.process.exit_rx.clone()
    }

    async fn ensure_ready(&self) -> LspResult<()> {
        let status = self.status().await;
        if status == ServerStatus::Ready {
            Ok(())
        } else {
            Err(LspError::not_ready(
                &self.config.language,
                status.to_string(),
            ))
        }
    }

    fn ensure_supported(&self, supported: bool, method: &'static str) -> LspResult<()> {
        if supported {
            Ok(())
        } else {
            Err(LspError::NotSupported(method))
        }
    }

    async fn request<P: Serialize>(&self, method: &'static str, params: &P) -> LspResult<Value> {
        let _timing = TimingGuard::request(method);
        self.transport
            .call(
                method,
                Some(serde_json::to_value(params)?),
                self.config.request_timeout(),
            )
            .await
    }

    fn position_params(
        &self,
        uri: &str,
        position: Position,
    ) -> LspResult<TextDocumentPositionParams> {
        Ok(TextDocumentPositionParams {
            text_document: TextDocumentIdentifier {
                uri: parse_uri(uri)?,
            },
            position,
        })
    }

    // ------------------------------------------------------------------
    // Document synchronization
    // ------------------------------------------------------------------

    /// Open a document and start tracking it. Versions start at 1.
    pub async fn open_document(
        &self,
        uri: &str,
        language_id: &str,
        text: &str,
    ) -> LspResult<()> {
        self.ensure_ready().await?;

        let mut documents = self.documents.lock().await;
        if documents.contains_key(uri) {
            return Err(LspError::AlreadyOpen(uri.to_string()));
        }

        let document = TrackedDocument::new(uri, language_id, text);
        let params = DidOpenTextDocumentParams {
            text_document: TextDocumentItem {
                uri: parse_uri(uri)?,
                language_id: language_id.to_string(),
                version: document.version,
                text: text.to_string(),
            },
        };
        documents.insert(uri.to_string(), document);

        self.transport
            .notify("textDocument/didOpen", Some(serde_json::to_value(&params)?))
            .await
    }

    /// Replace a document's full text and notify the server.
    ///
    /// Sync is whole-document: every change is sent as a full resync.
    pub async fn change_document(&self, uri: &str, text: &str) -> LspResult<()> {
        self.ensure_ready().await?;

        let mut documents = self.documents.lock().await;
        let document = documents
            .get_mut(uri)
            .ok_or_else(|| LspError::NotOpen(uri.to_string()))?;
        let version = document.apply_full_change(text);

        let params = DidChangeTextDocumentParams {
            text_document: VersionedTextDocumentIdentifier {
                uri: parse_uri(uri)?,
                version,
            },
            content_changes: vec![TextDocumentContentChangeEvent {
                range: None,
                range_length: None,
                text: text.to_string(),
            }],
        };

        self.transport
            .notify(
                "textDocument/didChange",
                Some(serde_json::to_value(&params)?),
            )
            .await
    }

    /// Stop tracking a document and notify the server.
    pub async fn close_document(&self, uri: &str) -> LspResult<()> {
        self.ensure_ready().await?;

        let mut documents = self.documents.lock().await;
        documents
            .remove(uri)
            .ok_or_else(|| LspError::NotOpen(uri.to_string()))?;

        let params = DidCloseTextDocumentParams {
            text_document: TextDocumentIdentifier {
                uri: parse_uri(uri)?,
            },
        };

        self.transport
            .notify(
                "textDocument/didClose",
                Some(serde_json::to_value(&params)?),
            )
            .await
    }

    /// Notify the server that a tracked document was saved.
    pub async fn save_document(&self, uri: &str) -> LspResult<()> {
        self.ensure_ready().await?;

        let documents = self.documents.lock().await;
        if !documents.contains_key(uri) {
            return Err(LspError::NotOpen(uri.to_string()));
        }

        let params = DidSaveTextDocumentParams {
            text_document: TextDocumentIdentifier {
                uri: parse_uri(uri)?,
            },
            text: None,
        };

        self.transport
            .notify("textDocument/didSave", Some(serde_json::to_value(&params)?))
            .await
    }

    /// Snapshot of the currently tracked documents.
    pub async fn tracked_documents(&self) -> Vec<TrackedDocument> {
        self.documents.lock().await.values().cloned().collect()
    }

    // ------------------------------------------------------------------
    // Diagnostics
    // ------------------------------------------------------------------

    /// Register a callback for diagnostics pushed by the server.
    pub fn set_diagnostics_handler<F>(&self, handler: F)
    where
        F: Fn(&str, &[Diagnostic]) + Send + Sync + 'static,
    {
        *self
            .diagnostics
            .handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(handler));
    }

    /// Last-published diagnostics for a document.
    pub fn diagnostics_for(&self, uri: &str) -> Vec<Diagnostic> {
        self.diagnostics
            .lock_map()
            .get(uri)
            .cloned()
            .unwrap_or_default()
    }

    /// Snapshot of diagnostics for all documents.
    pub fn all_diagnostics(&self) -> HashMap<String, Vec<Diagnostic>> {
        self.diagnostics.lock_map().clone()
    }

    // ------------------------------------------------------------------
    // Typed requests
    // ------------------------------------------------------------------

    /// Request completions at a position.
    pub async fn completion(
        &self,
        uri: &str,
        position: Position,
    ) -> LspResult<Vec<CompletionItem>> {
        self.ensure_ready().await?;
        self.ensure_supported(
            self.capabilities.completion_provider.is_some(),
            "textDocument/completion",
        )?;

        let params = CompletionParams {
            text_document_position: self.position_params(uri, position)?,
            work_done_progress_params: WorkDoneProgressParams::default(),
            partial_result_params: PartialResultParams::default(),
            context: None,
        };

        let result = self.request("textDocument/completion", &params).await?;
        if result.is_null() {
            return Ok(Vec::new());
        }
        match serde_json::from_value::<CompletionResponse>(result) {
            Ok(CompletionResponse::Array(items)) => Ok(items),
            Ok(CompletionResponse::List(list)) => Ok(list.items),
            Err(e) => Err(LspError::protocol(format!(
                "Unexpected completion payload: {e}"
            ))),
        }
    }

    /// Request hover information at a position.
    pub async fn hover(&self, uri: &str, position: Position) -> LspResult<Option<Hover>> {
        self.ensure_ready().await?;
        let supported = match &self.capabilities.hover_provider {
            Some(HoverProviderCapability::Simple(enabled)) => *enabled,
            Some(HoverProviderCapability::Options(_)) => true,
            None => false,
        };
        self.ensure_supported(supported, "textDocument/hover")?;

        let params = HoverParams {
            text_document_position_params: self.position_params(uri, position)?,
            work_done_progress_params: WorkDoneProgressParams::default(),
        };

        let result = self.request("textDocument/hover", &params).await?;
        if result.is_null() {
            return Ok(None);
        }
        serde_json::from_value(result)
            .map(Some)
            .map_err(|e| LspError::protocol(format!("Unexpected hover payload: {e}")))
    }

    /// Go to definition.
    pub async fn definition(&self, uri: &str, position: Position) -> LspResult<Vec<Location>> {
        self.ensure_ready().await?;
        self.ensure_supported(
            provider_enabled(&self.capabilities.definition_provider),
            "textDocument/definition",
        )?;
        self.locations_request("textDocument/definition", uri, position)
            .await
    }

    /// Go to type definition.
    pub async fn type_definition(
        &self,
        uri: &str,
        position: Position,
    ) -> LspResult<Vec<Location>> {
        self.ensure_ready().await?;
        let supported = match &self.capabilities.type_definition_provider {
            Some(TypeDefinitionProviderCapability::Simple(enabled)) => *enabled,
            Some(_) => true,
            None => false,
        };
        self.ensure_supported(supported, "textDocument/typeDefinition")?;
        self.locations_request("textDocument/typeDefinition", uri, position)
            .await
    }

    async fn locations_request(
        &self,
        method: &'static str,
        uri: &str,
        position: Position,
    ) -> LspResult<Vec<Location>> {
        let params = GotoDefinitionParams {
            text_document_position_params: self.position_params(uri, position)?,
            work_done_progress_params: WorkDoneProgressParams::default(),
            partial_result_params: PartialResultParams::default(),
        };
        let result = self.request(method, &params).await?;
        Ok(decode_locations(result))
    }

    /// Find references to the symbol at a position.
    pub async fn references(
        &self,
        uri: &str,
        position: Position,
        include_declaration: bool,
    ) -> LspResult<Vec<Location>> {
        self.ensure_ready().await?;
        self.ensure_supported(
            provider_enabled(&self.capabilities.references_provider),
            "textDocument/references",
        )?;

        let params = ReferenceParams {
            text_document_position: self.position_params(uri, position)?,
            work_done_progress_params: WorkDoneProgressParams::default(),
            partial_result_params: PartialResultParams::default(),
            context: ReferenceContext {
                include_declaration,
            },
        };

        let result = self.request("textDocument/references", &params).await?;
        if result.is_null() {
            return Ok(Vec::new());
        }
        serde_json::from_value(result)
            .map_err(|e| LspError::protocol(format!("Unexpected references payload: {e}")))
    }

    /// List symbols in a document.
    pub async fn document_symbols(&self, uri: &str) -> LspResult<Vec<DocumentSymbolNode>> {
        self.ensure_ready().await?;
        self.ensure_supported(
            provider_enabled(&self.capabilities.document_symbol_provider),
            "textDocument/documentSymbol",
        )?;

        let params = DocumentSymbolParams {
            text_document: TextDocumentIdentifier {
                uri: parse_uri(uri)?,
            },
            work_done_progress_params: WorkDoneProgressParams::default(),
            partial_result_params: PartialResultParams::default(),
        };

        let result = self.request("textDocument/documentSymbol", &params).await?;
        if result.is_null() {
            return Ok(Vec::new());
        }
        match serde_json::from_value::<DocumentSymbolResponse>(result) {
            Ok(DocumentSymbolResponse::Nested(symbols)) => {
                Ok(symbols.into_iter().map(convert_document_symbol).collect())
            }
            Ok(DocumentSymbolResponse::Flat(symbols)) => Ok(symbols
                .into_iter()
                .map(|s| DocumentSymbolNode {
                    name: s.name,
                    kind: s.kind,
                    range: s.location.range,
                    children: Vec::new(),
                })
                .collect()),
            Err(e) => Err(LspError::protocol(format!(
                "Unexpected documentSymbol payload: {e}"
            ))),
        }
    }

    /// Search symbols across the workspace.
    pub async fn workspace_symbols(&self, query: &str) -> LspResult<Vec<SymbolInformation>> {
        self.ensure_ready().await?;
        self.ensure_supported(
            provider_enabled(&self.capabilities.workspace_symbol_provider),
            "workspace/symbol",
        )?;

        let params = WorkspaceSymbolParams {
            query: query.to_string(),
            work_done_progress_params: WorkDoneProgressParams::default(),
            partial_result_params: PartialResultParams::default(),
        };

        let result = self.request("workspace/symbol", &params).await?;
        if result.is_null() {
            return Ok(Vec::new());
        }
        serde_json::from_value(result)
            .map_err(|e| LspError::protocol(format!("Unexpected workspace/symbol payload: {e}")))
    }

    /// Format a whole document.
    pub async fn formatting(
        &self,
        uri: &str,
        options: FormattingOptions,
    ) -> LspResult<Vec<TextEdit>> {
        self.ensure_ready().await?;
        self.ensure_supported(
            provider_enabled(&self.capabilities.document_formatting_provider),
            "textDocument/formatting",
        )?;

        let params = DocumentFormattingParams {
            text_document: TextDocumentIdentifier {
                uri: parse_uri(uri)?,
            },
            options,
            work_done_progress_params: WorkDoneProgressParams::default(),
        };

        let result = self.request("textDocument/formatting", &params).await?;
        if result.is_null() {
            return Ok(Vec::new());
        }
        serde_json::from_value(result)
            .map_err(|e| LspError::protocol(format!("Unexpected formatting payload: {e}")))
    }

    /// Format a range of a document.
    pub async fn range_formatting(
        &self,
        uri: &str,
        range: Range,
        options: FormattingOptions,
    ) -> LspResult<Vec<TextEdit>> {
        self.ensure_ready().await?;
        self.ensure_supported(
            provider_enabled(&self.capabilities.document_range_formatting_provider),
            "textDocument/rangeFormatting",
        )?;

        let params = DocumentRangeFormattingParams {
            text_document: TextDocumentIdentifier {
                uri: parse_uri(uri)?,
            },
            range,
            options,
            work_done_progress_params: WorkDoneProgressParams::default(),
        };

        let result = self.request("textDocument/rangeFormatting", &params).await?;
        if result.is_null() {
            return Ok(Vec::new());
        }
        serde_json::from_value(result)
            .map_err(|e| LspError::protocol(format!("Unexpected rangeFormatting payload: {e}")))
    }

    /// Rename the symbol at a position.
    pub async fn rename(
        &self,
        uri: &str,
        position: Position,
        new_name: &str,
    ) -> LspResult<Option<WorkspaceEdit>> {
        self.ensure_ready().await?;
        self.ensure_supported(
            provider_enabled(&self.capabilities.rename_provider),
            "textDocument/rename",
        )?;

        let params = RenameParams {
            text_document_position: self.position_params(uri, position)?,
            new_name: new_name.to_string(),
            work_done_progress_params: WorkDoneProgressParams::default(),
        };

        let result = self.request("textDocument/rename", &params).await?;
        if result.is_null() {
            return Ok(None);
        }
        serde_json::from_value(result)
            .map(Some)
            .map_err(|e| LspError::protocol(format!("Unexpected rename payload: {e}")))
    }

    /// Request signature help at a position.
    pub async fn signature_help(
        &self,
        uri: &str,
        position: Position,
    ) -> LspResult<Option<SignatureHelp>> {
        self.ensure_ready().await?;
        self.ensure_supported(
            self.capabilities.signature_help_provider.is_some(),
            "textDocument/signatureHelp",
        )?;

        let params = SignatureHelpParams {
            text_document_position_params: self.position_params(uri, position)?,
            work_done_progress_params: WorkDoneProgressParams::default(),
            context: None,
        };

        let result = self.request("textDocument/signatureHelp", &params).await?;
        if result.is_null() {
            return Ok(None);
        }
        serde_json::from_value(result)
            .map(Some)
            .map_err(|e| LspError::protocol(format!("Unexpected signatureHelp payload: {e}")))
    }

    /// Request code actions for a range.
    pub async fn code_actions(
        &self,
        uri: &str,
        range: Range,
        diagnostics: Vec<Diagnostic>,
    ) -> LspResult<Vec<CodeActionOrCommand>> {
        self.ensure_ready().await?;
        let supported = match &self.capabilities.code_action_provider {
            Some(CodeActionProviderCapability::Simple(enabled)) => *enabled,
            Some(CodeActionProviderCapability::Options(_)) => true,
            None => false,
        };
        self.ensure_supported(supported, "textDocument/codeAction")?;

        let params = CodeActionParams {
            text_document: TextDocumentIdentifier {
                uri: parse_uri(uri)?,
            },
            range,
            context: CodeActionContext {
                diagnostics,
                only: None,
                trigger_kind: None,
            },
            work_done_progress_params: WorkDoneProgressParams::default(),
            partial_result_params: PartialResultParams::default(),
        };

        let result = self.request("textDocument/codeAction", &params).await?;
        if result.is_null() {
            return Ok(Vec::new());
        }
        serde_json::from_value(result)
            .map_err(|e| LspError::protocol(format!("Unexpected codeAction payload: {e}")))
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// Tear the connection down.
    ///
    /// Idempotent. Issues the graceful shutdown pair best-effort with a
    /// short budget, closes the transport, then force-kills the process if
    /// it has not exited.
    pub async fn shutdown(&self) -> LspResult<()> {
        {
            let mut status = self.status.write().await;
            if matches!(
                *status,
                ServerStatus::ShuttingDown | ServerStatus::Stopped
            ) {
                return Ok(());
            }
            *status = ServerStatus::ShuttingDown;
        }
        self.process.planned.store(true, Ordering::SeqCst);

        // Best-effort; a dead or wedged server must not block teardown.
        let _ = self
            .transport
            .call("shutdown", None, GRACEFUL_SHUTDOWN_TIMEOUT)
            .await;
        let _ = self.transport.notify("exit", None).await;
        let _ = self.transport.close().await;

        self.process.kill.cancel();
        let mut exit_rx = self.process.exit_rx.clone();
        let _ = tokio::time::timeout(EXIT_WAIT_TIMEOUT, async {
            loop {
                if exit_rx.borrow().is_some() {
                    break;
                }
                if exit_rx.changed().await.is_err() {
                    break;
                }
            }
        })
        .await;

        *self.status.write().await = ServerStatus::Stopped;
        info!(language = %self.config.language, "Language server stopped");
        Ok(())
    }
}

/// A document symbol with its children, decoded from either response shape.
#[derive(Debug, Clone)]
pub struct DocumentSymbolNode {
    pub name: String,
    pub kind: SymbolKind,
    pub range: Range,
    pub children: Vec<DocumentSymbolNode>,
}

fn convert_document_symbol(symbol: DocumentSymbol) -> DocumentSymbolNode {
    DocumentSymbolNode {
        name: symbol.name,
        kind: symbol.kind,
        range: symbol.range,
        children: symbol
            .children
            .unwrap_or_default()
            .into_iter()
            .map(convert_document_symbol)
            .collect(),
    }
}

/// Decode the three shapes a goto-style response can take.
fn decode_locations(value: Value) -> Vec<Location> {
    if value.is_null() {
        return Vec::new();
    }
    if let Ok(location) = serde_json::from_value::<Location>(value.clone()) {
        return vec![location];
    }
    if let Ok(locations) = serde_json::from_value::<Vec<Location>>(value.clone()) {
        return locations;
    }
    if let Ok(links) = serde_json::from_value::<Vec<LocationLink>>(value) {
        return links
            .into_iter()
            .map(|link| Location {
                uri: link.target_uri,
                range: link.target_selection_range,
            })
            .collect();
    }
    Vec::new()
}

/// Flatten hover contents into displayable text.
pub fn hover_text(hover: &Hover) -> String {
    match &hover.contents {
        lsp_types::HoverContents::Scalar(marked) => match marked {
            lsp_types::MarkedString::String(s) => s.clone(),
            lsp_types::MarkedString::LanguageString(ls) => ls.value.clone(),
        },
        lsp_types::HoverContents::Array(arr) => arr
            .iter()
            .map(|m| match m {
                lsp_types::MarkedString::String(s) => s.clone(),
                lsp_types::MarkedString::LanguageString(ls) => ls.value.clone(),
            })
            .collect::<Vec<_>>()
            .join("\n"),
        lsp_types::HoverContents::Markup(markup) => markup.value.clone(),
    }
}

fn provider_enabled<T>(provider: &Option<OneOf<bool, T>>) -> bool {
    match provider {
        Some(OneOf::Left(enabled)) => *enabled,
        Some(OneOf::Right(_)) => true,
        None => false,
    }
}

fn parse_uri(uri: &str) -> LspResult<Uri> {
    uri.parse()
        .map_err(|e| LspError::InvalidUri(format!("{uri}: {e}")))
}
