//! Routes work to per-language server instances.
//!
//! [`Manager`] holds the configuration registry and starts servers
//! lazily: the first caller to need a language pays the startup cost,
//! concurrent callers for the same language never race a second spawn.
//! Instances run supervised or unsupervised depending on the manager's
//! mode.

use crate::config::ServerConfig;
use crate::error::{LspError, LspResult};
use crate::server::{LanguageServer, ServerStatus};
use crate::supervisor::{RestartPolicy, Supervisor, SupervisorEvent, SupervisorState};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info};

/// Whether instances are wrapped in a crash-recovery supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisionMode {
    /// Crashed servers stay down until an explicit restart.
    Unsupervised,
    /// Crashed servers are restarted automatically.
    Supervised,
}

enum Instance {
    Plain(Arc<LanguageServer>),
    Supervised(Arc<Supervisor>),
}

impl Instance {
    async fn server(&self) -> Option<Arc<LanguageServer>> {
        match self {
            Instance::Plain(server) => Some(Arc::clone(server)),
            Instance::Supervised(supervisor) => supervisor.current_server().await,
        }
    }
}

/// Point-in-time view of one instance, for status listings.
#[derive(Debug, Clone)]
pub struct ServerStatusReport {
    pub language: String,
    /// `None` while a supervised instance has no live server.
    pub server_status: Option<ServerStatus>,
    /// `None` for unsupervised instances.
    pub supervisor_state: Option<SupervisorState>,
    pub open_documents: usize,
}

/// Lazily starts and routes to one server per language.
pub struct Manager {
    mode: SupervisionMode,
    policy: RestartPolicy,
    configs: RwLock<HashMap<String, ServerConfig>>,
    instances: RwLock<HashMap<String, Instance>>,
}

impl Manager {
    pub fn new(mode: SupervisionMode) -> Self {
        Self {
            mode,
            policy: RestartPolicy::default(),
            configs: RwLock::new(HashMap::new()),
            instances: RwLock::new(HashMap::new()),
        }
    }

    /// Override the restart policy used for supervised instances.
    pub fn with_restart_policy(mut self, policy: RestartPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Register a server configuration, keyed by its language id.
    /// Replaces any previous configuration for that language; running
    /// instances are not affected.
    pub async fn register_server(&self, config: ServerConfig) {
        debug!(language = %config.language, command = %config.command, "Registered server config");
        self.configs
            .write()
            .await
            .insert(config.language.clone(), config);
    }

    /// Register the built-in catalog of well-known servers.
    pub async fn register_defaults(&self) {
        for config in crate::config::default_configs() {
            self.register_server(config).await;
        }
    }

    /// Languages with a registered configuration, sorted.
    pub async fn configured_languages(&self) -> Vec<String> {
        let mut languages: Vec<String> = self.configs.read().await.keys().cloned().collect();
        languages.sort();
        languages
    }

    /// Resolve the language responsible for a path, by filename first and
    /// extension second.
    pub async fn language_for_path(&self, path: &Path) -> Option<String> {
        let configs = self.configs.read().await;
        configs
            .values()
            .find(|c| c.enabled && c.matches_path(path))
            .map(|c| c.language.clone())
    }

    /// Get (starting if necessary) the server for a file path.
    pub async fn server_for_file(&self, path: &Path) -> LspResult<Arc<LanguageServer>> {
        let language = self
            .language_for_path(path)
            .await
            .ok_or_else(|| LspError::NoServerForFile(path.display().to_string()))?;
        self.server_for_language(&language).await
    }

    /// Get (starting if necessary) the server for a language.
    ///
    /// The fast path only takes the read lock. On a miss, the write lock
    /// is held across the entire startup so concurrent callers for the
    /// same language wait for the one in-flight start instead of spawning
    /// their own.
    pub async fn server_for_language(&self, language: &str) -> LspResult<Arc<LanguageServer>> {
        {
            let instances = self.instances.read().await;
            if let Some(instance) = instances.get(language) {
                return self.resolve_instance(language, instance).await;
            }
        }

        let mut instances = self.instances.write().await;
        // Another caller may have finished the start while we waited.
        if let Some(instance) = instances.get(language) {
            return self.resolve_instance(language, instance).await;
        }

        let config = self
            .configs
            .read()
            .await
            .get(language)
            .filter(|c| c.enabled)
            .cloned()
            .ok_or_else(|| LspError::NoServerConfigured(language.to_string()))?;

        info!(language = %language, "Starting server on first use");
        let instance = match self.mode {
            SupervisionMode::Unsupervised => {
                let server = Arc::new(LanguageServer::start(config).await?);
                Instance::Plain(server)
            }
            SupervisionMode::Supervised => {
                let supervisor = Supervisor::new(config, self.policy.clone());
                supervisor.start().await?;
                Instance::Supervised(supervisor)
            }
        };

        let server = instance
            .server()
            .await
            .ok_or_else(|| LspError::not_ready(language, SupervisorState::Restarting.to_string()))?;
        instances.insert(language.to_string(), instance);
        Ok(server)
    }

    async fn resolve_instance(
        &self,
        language: &str,
        instance: &Instance,
    ) -> LspResult<Arc<LanguageServer>> {
        match instance {
            Instance::Plain(server) => {
                if server.is_ready().await {
                    Ok(Arc::clone(server))
                } else {
                    let status = server.status().await;
                    Err(LspError::not_ready(language, status.to_string()))
                }
            }
            Instance::Supervised(supervisor) => match supervisor.current_server().await {
                Some(server) => Ok(server),
                None => match supervisor.state().await {
                    SupervisorState::Failed => {
                        Err(LspError::PermanentlyFailed(language.to_string()))
                    }
                    state => Err(LspError::not_ready(language, state.to_string())),
                },
            },
        }
    }

    // ------------------------------------------------------------------
    // Document forwarding
    // ------------------------------------------------------------------

    /// Open a document with the server responsible for its path, starting
    /// the server if needed.
    pub async fn open_document(&self, path: &Path, text: &str) -> LspResult<()> {
        let language = self
            .language_for_path(path)
            .await
            .ok_or_else(|| LspError::NoServerForFile(path.display().to_string()))?;
        let uri = path_to_uri(path)?;

        // Ensure the instance exists before routing.
        self.server_for_language(&language).await?;

        let instances = self.instances.read().await;
        match instances.get(&language) {
            Some(Instance::Plain(server)) => server.open_document(&uri, &language, text).await,
            Some(Instance::Supervised(supervisor)) => {
                supervisor.open_document(&uri, &language, text).await
            }
            None => Err(LspError::not_ready(
                &language,
                ServerStatus::Stopped.to_string(),
            )),
        }
    }

    /// Forward a full-text change for an already-open document.
    pub async fn change_document(&self, path: &Path, text: &str) -> LspResult<()> {
        let uri = path_to_uri(path)?;
        match self.instance_for_path(path).await? {
            RoutedInstance::Plain(server) => server.change_document(&uri, text).await,
            RoutedInstance::Supervised(supervisor) => {
                supervisor.change_document(&uri, text).await
            }
        }
    }

    /// Close a document with its server.
    pub async fn close_document(&self, path: &Path) -> LspResult<()> {
        let uri = path_to_uri(path)?;
        match self.instance_for_path(path).await? {
            RoutedInstance::Plain(server) => server.close_document(&uri).await,
            RoutedInstance::Supervised(supervisor) => supervisor.close_document(&uri).await,
        }
    }

    /// Notify the responsible server that a document was saved.
    pub async fn save_document(&self, path: &Path) -> LspResult<()> {
        let uri = path_to_uri(path)?;
        match self.instance_for_path(path).await? {
            RoutedInstance::Plain(server) => server.save_document(&uri).await,
            RoutedInstance::Supervised(supervisor) => supervisor.save_document(&uri).await,
        }
    }

    /// Route to an existing instance only; change/close/save never start
    /// a server.
    async fn instance_for_path(&self, path: &Path) -> LspResult<RoutedInstance> {
        let language = self
            .language_for_path(path)
            .await
            .ok_or_else(|| LspError::NoServerForFile(path.display().to_string()))?;
        let instances = self.instances.read().await;
        match instances.get(&language) {
            Some(Instance::Plain(server)) => Ok(RoutedInstance::Plain(Arc::clone(server))),
            Some(Instance::Supervised(supervisor)) => {
                Ok(RoutedInstance::Supervised(Arc::clone(supervisor)))
            }
            None => Err(LspError::NotOpen(path_to_uri(path)?)),
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Tear down an instance so the next access starts a fresh one.
    /// Succeeds when no instance is running.
    pub async fn restart_server(&self, language: &str) -> LspResult<()> {
        let removed = self.instances.write().await.remove(language);
        match removed {
            Some(Instance::Plain(server)) => {
                info!(language = %language, "Restarting server on request");
                server.shutdown().await
            }
            Some(Instance::Supervised(supervisor)) => {
                info!(language = %language, "Restarting server on request");
                supervisor.stop().await
            }
            None => Ok(()),
        }
    }

    /// Shut down every instance. Failures are collected rather than
    /// aborting the sweep; an error lists every language that failed.
    pub async fn shutdown(&self) -> LspResult<()> {
        let instances: Vec<(String, Instance)> =
            self.instances.write().await.drain().collect();

        let mut failures = Vec::new();
        for (language, instance) in instances {
            let result = match instance {
                Instance::Plain(server) => server.shutdown().await,
                Instance::Supervised(supervisor) => supervisor.stop().await,
            };
            if let Err(e) = result {
                failures.push(format!("{language}: {e}"));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(LspError::Shutdown(failures))
        }
    }

    /// Status listing across all instances, sorted by language.
    pub async fn statuses(&self) -> Vec<ServerStatusReport> {
        let instances = self.instances.read().await;
        let mut reports = Vec::with_capacity(instances.len());

        for (language, instance) in instances.iter() {
            let report = match instance {
                Instance::Plain(server) => ServerStatusReport {
                    language: language.clone(),
                    server_status: Some(server.status().await),
                    supervisor_state: None,
                    open_documents: server.tracked_documents().await.len(),
                },
                Instance::Supervised(supervisor) => {
                    let state = supervisor.state().await;
                    match supervisor.current_server().await {
                        Some(server) => ServerStatusReport {
                            language: language.clone(),
                            server_status: Some(server.status().await),
                            supervisor_state: Some(state),
                            open_documents: server.tracked_documents().await.len(),
                        },
                        None => ServerStatusReport {
                            language: language.clone(),
                            server_status: None,
                            supervisor_state: Some(state),
                            open_documents: supervisor.mirrored_document_count().await,
                        },
                    }
                }
            };
            reports.push(report);
        }

        reports.sort_by(|a, b| a.language.cmp(&b.language));
        reports
    }

    /// Subscribe to a supervised instance's lifecycle events. `None` for
    /// unknown languages and unsupervised instances.
    pub async fn subscribe_events(
        &self,
        language: &str,
    ) -> Option<broadcast::Receiver<SupervisorEvent>> {
        match self.instances.read().await.get(language) {
            Some(Instance::Supervised(supervisor)) => Some(supervisor.subscribe()),
            _ => None,
        }
    }
}

enum RoutedInstance {
    Plain(Arc<LanguageServer>),
    Supervised(Arc<Supervisor>),
}

/// Build a `file://` URI for a filesystem path. Relative paths are
/// resolved against the working directory first; `file://src/lib.rs`
/// would make `src` a host component.
fn path_to_uri(path: &Path) -> LspResult<String> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map_err(|e| LspError::InvalidUri(format!("{}: {e}", path.display())))?
            .join(path)
    };
    Ok(format!("file://{}", absolute.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::PathBuf;

    /// Framed canned response to the first request (`initialize`, id 1).
    fn canned_initialize_frame() -> String {
        let body =
            serde_json::to_string(&json!({"jsonrpc": "2.0", "id": 1, "result": {"capabilities": {}}}))
                .unwrap();
        format!("Content-Length: {}\r\n\r\n{}", body.len(), body)
    }

    /// A shell-scripted server that answers the handshake and then idles.
    fn scripted_config(language: &str, extensions: Vec<&str>) -> ServerConfig {
        ServerConfig::new(language, "sh", extensions).with_args(vec![
            "-c".to_string(),
            "printf '%s' \"$0\"; sleep 30".to_string(),
            canned_initialize_frame(),
        ])
    }

    #[test]
    fn test_path_to_uri_keeps_absolute_paths() {
        assert_eq!(
            path_to_uri(Path::new("/work/src/lib.rs")).unwrap(),
            "file:///work/src/lib.rs"
        );
    }

    #[test]
    fn test_path_to_uri_resolves_relative_paths() {
        let uri = path_to_uri(Path::new("src/lib.rs")).unwrap();
        // A bare `file://src/...` would make `src` a host component.
        assert!(uri.starts_with("file:///"), "{uri}");
        assert!(uri.ends_with("/src/lib.rs"), "{uri}");
        let expected = format!(
            "file://{}",
            std::env::current_dir().unwrap().join("src/lib.rs").display()
        );
        assert_eq!(uri, expected);
    }

    #[tokio::test]
    async fn test_unknown_language_is_an_error() {
        let manager = Manager::new(SupervisionMode::Unsupervised);
        let result = manager.server_for_language("cobol").await;
        assert!(matches!(result, Err(LspError::NoServerConfigured(_))));
    }

    #[tokio::test]
    async fn test_unmatched_file_is_an_error() {
        let manager = Manager::new(SupervisionMode::Unsupervised);
        manager.register_defaults().await;
        let result = manager.server_for_file(Path::new("notes.txt")).await;
        assert!(matches!(result, Err(LspError::NoServerForFile(_))));
    }

    #[tokio::test]
    async fn test_disabled_config_is_not_used() {
        let manager = Manager::new(SupervisionMode::Unsupervised);
        let mut config = scripted_config("rust", vec!["rs"]);
        config.enabled = false;
        manager.register_server(config).await;

        assert!(manager
            .language_for_path(Path::new("main.rs"))
            .await
            .is_none());
        let result = manager.server_for_language("rust").await;
        assert!(matches!(result, Err(LspError::NoServerConfigured(_))));
    }

    #[tokio::test]
    async fn test_language_resolution_by_extension_and_filename() {
        let manager = Manager::new(SupervisionMode::Unsupervised);
        manager.register_defaults().await;

        assert_eq!(
            manager.language_for_path(Path::new("src/main.rs")).await,
            Some("rust".to_string())
        );
        assert_eq!(
            manager.language_for_path(Path::new("Dockerfile")).await,
            Some("dockerfile".to_string())
        );
        assert_eq!(manager.language_for_path(Path::new("a.xyz")).await, None);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_instance() {
        let manager = Arc::new(Manager::new(SupervisionMode::Unsupervised));
        manager.register_server(scripted_config("rust", vec!["rs"])).await;

        let mut handles = Vec::new();
        for _ in 0..3 {
            let manager = Arc::clone(&manager);
            handles.push(tokio::spawn(async move {
                manager.server_for_language("rust").await
            }));
        }

        let mut servers = Vec::new();
        for handle in handles {
            servers.push(handle.await.unwrap().expect("server should start"));
        }
        assert!(Arc::ptr_eq(&servers[0], &servers[1]));
        assert!(Arc::ptr_eq(&servers[1], &servers[2]));

        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_start_is_not_cached() {
        let manager = Manager::new(SupervisionMode::Unsupervised);
        manager
            .register_server(ServerConfig::new(
                "rust",
                "definitely-not-a-real-lsp-binary",
                vec!["rs"],
            ))
            .await;

        assert!(manager.server_for_language("rust").await.is_err());
        assert!(manager.statuses().await.is_empty());

        // A fixed configuration works on the next call.
        manager.register_server(scripted_config("rust", vec!["rs"])).await;
        assert!(manager.server_for_language("rust").await.is_ok());
        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_document_forwarding() {
        let manager = Manager::new(SupervisionMode::Unsupervised);
        manager.register_server(scripted_config("rust", vec!["rs"])).await;

        let path = PathBuf::from("/work/src/lib.rs");
        manager.open_document(&path, "fn a() {}").await.unwrap();
        manager.change_document(&path, "fn a() { b(); }").await.unwrap();

        let server = manager.server_for_language("rust").await.unwrap();
        let documents = server.tracked_documents().await;
        assert_eq!(documents.len(), 1);
        assert_eq!(documents[0].uri, "file:///work/src/lib.rs");
        assert_eq!(documents[0].version, 2);

        manager.close_document(&path).await.unwrap();
        assert!(server.tracked_documents().await.is_empty());

        // Save on a closed document surfaces the server's error.
        let result = manager.save_document(&path).await;
        assert!(matches!(result, Err(LspError::NotOpen(_))));

        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_restart_server_starts_fresh() {
        let manager = Manager::new(SupervisionMode::Unsupervised);
        manager.register_server(scripted_config("rust", vec!["rs"])).await;

        let first = manager.server_for_language("rust").await.unwrap();
        manager.restart_server("rust").await.unwrap();
        let second = manager.server_for_language("rust").await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));

        // Restarting a language with no instance is not an error.
        manager.restart_server("go").await.unwrap();
        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_supervised_mode_exposes_events() {
        let manager = Manager::new(SupervisionMode::Supervised);
        manager.register_server(scripted_config("rust", vec!["rs"])).await;

        let server = manager.server_for_language("rust").await.unwrap();
        assert!(server.is_ready().await);
        assert!(manager.subscribe_events("rust").await.is_some());
        assert!(manager.subscribe_events("go").await.is_none());

        let statuses = manager.statuses().await;
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].supervisor_state, Some(SupervisorState::Running));
        assert_eq!(statuses[0].server_status, Some(ServerStatus::Ready));

        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_clears_all_instances() {
        let manager = Manager::new(SupervisionMode::Unsupervised);
        manager.register_server(scripted_config("rust", vec!["rs"])).await;
        manager.register_server(scripted_config("go", vec!["go"])).await;

        manager.server_for_language("rust").await.unwrap();
        manager.server_for_language("go").await.unwrap();
        assert_eq!(manager.statuses().await.len(), 2);

        manager.shutdown().await.unwrap();
        assert!(manager.statuses().await.is_empty());
    }
}
