//! Crash recovery for a supervised language server.
//!
//! [`Supervisor`] wraps one [`LanguageServer`] and restarts it when the
//! process exits outside a planned shutdown, with exponential backoff and
//! a bounded restart budget. Open documents are mirrored so a replacement
//! server starts with the same view of the workspace, and lifecycle events
//! are published on a lossy broadcast channel for interested observers.

use crate::config::ServerConfig;
use crate::document::TrackedDocument;
use crate::error::{LspError, LspResult};
use crate::server::LanguageServer;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Capacity of the event broadcast channel. Slow subscribers lose the
/// oldest events rather than applying backpressure to recovery.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Restart budget and backoff schedule.
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    /// Restarts allowed before the supervisor gives up.
    pub max_restarts: u32,
    /// Delay before the first restart attempt.
    pub initial_delay: Duration,
    /// Multiplier applied per consecutive attempt.
    pub multiplier: u32,
    /// Upper bound on the computed delay.
    pub max_delay: Duration,
    /// A run healthy for longer than this resets the restart counter.
    pub reset_window: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: 5,
            initial_delay: Duration::from_secs(1),
            multiplier: 2,
            max_delay: Duration::from_secs(60),
            reset_window: Duration::from_secs(60),
        }
    }
}

/// Delay before restart attempt `attempt` (1-based).
fn backoff_delay(policy: &RestartPolicy, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(32);
    let factor = u64::from(policy.multiplier.saturating_pow(exponent));
    let initial_ms = policy.initial_delay.as_millis() as u64;
    let max_ms = policy.max_delay.as_millis() as u64;
    Duration::from_millis(initial_ms.saturating_mul(factor).min(max_ms))
}

/// Consecutive-restart accounting.
#[derive(Debug, Default)]
struct RestartRecord {
    count: u32,
    last_restart: Option<Instant>,
}

impl RestartRecord {
    /// Account for a crash at `now`. Returns the attempt number and the
    /// backoff delay, or `None` when the budget is exhausted.
    fn register_crash(
        &mut self,
        policy: &RestartPolicy,
        now: Instant,
    ) -> Option<(u32, Duration)> {
        if let Some(last) = self.last_restart {
            if now.saturating_duration_since(last) > policy.reset_window {
                self.count = 0;
            }
        }
        self.count += 1;
        self.last_restart = Some(now);
        if self.count > policy.max_restarts {
            return None;
        }
        Some((self.count, backoff_delay(policy, self.count)))
    }
}

/// Lifecycle state of the supervisor itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    Running,
    Restarting,
    Failed,
    Stopped,
}

impl std::fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SupervisorState::Idle => "Idle",
            SupervisorState::Running => "Running",
            SupervisorState::Restarting => "Restarting",
            SupervisorState::Failed => "Failed",
            SupervisorState::Stopped => "Stopped",
        };
        f.write_str(s)
    }
}

/// Event published on the supervisor's broadcast channel.
#[derive(Debug, Clone)]
pub struct SupervisorEvent {
    pub language: String,
    pub kind: SupervisorEventKind,
}

#[derive(Debug, Clone)]
pub enum SupervisorEventKind {
    /// The process exited outside a planned shutdown.
    Crashed { exit_code: Option<i32> },
    /// A restart attempt is about to run after `delay`.
    Restarting { attempt: u32, delay: Duration },
    /// A replacement server is up with documents replayed.
    Recovered { attempt: u32 },
    /// The restart budget is exhausted.
    Failed,
}

/// Supervises one language server, restarting it on crash.
pub struct Supervisor {
    config: ServerConfig,
    policy: RestartPolicy,
    state: RwLock<SupervisorState>,
    current: RwLock<Option<Arc<LanguageServer>>>,
    /// Documents opened through this supervisor, replayed into
    /// replacement servers.
    mirror: Mutex<HashMap<String, TrackedDocument>>,
    record: Mutex<RestartRecord>,
    events: broadcast::Sender<SupervisorEvent>,
    cancel: CancellationToken,
}

impl Supervisor {
    pub fn new(config: ServerConfig, policy: RestartPolicy) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            config,
            policy,
            state: RwLock::new(SupervisorState::Idle),
            current: RwLock::new(None),
            mirror: Mutex::new(HashMap::new()),
            record: Mutex::new(RestartRecord::default()),
            events,
            cancel: CancellationToken::new(),
        })
    }

    /// Start the supervised server. Idempotent while a server is live.
    ///
    /// A stopped supervisor is terminal: its cancellation token has
    /// fired and the crash watcher would never run again, so `start()`
    /// fails and a new [`Supervisor`] must be created instead.
    pub async fn start(self: &Arc<Self>) -> LspResult<()> {
        {
            let state = self.state.read().await;
            match *state {
                SupervisorState::Running | SupervisorState::Restarting => return Ok(()),
                SupervisorState::Stopped => {
                    return Err(LspError::not_ready(
                        &self.config.language,
                        SupervisorState::Stopped.to_string(),
                    ));
                }
                SupervisorState::Idle | SupervisorState::Failed => {}
            }
        }

        let server = Arc::new(LanguageServer::start(self.config.clone()).await?);
        *self.current.write().await = Some(Arc::clone(&server));
        *self.state.write().await = SupervisorState::Running;
        self.watch_exit(server);
        Ok(())
    }

    /// The language this supervisor serves.
    pub fn language(&self) -> &str {
        &self.config.language
    }

    pub async fn state(&self) -> SupervisorState {
        *self.state.read().await
    }

    /// The live server, if one is currently up.
    pub async fn current_server(&self) -> Option<Arc<LanguageServer>> {
        self.current.read().await.clone()
    }

    pub async fn is_ready(&self) -> bool {
        match self.current_server().await {
            Some(server) => server.is_ready().await,
            None => false,
        }
    }

    /// Subscribe to lifecycle events. Events published before the call
    /// are not delivered; a slow subscriber loses the oldest events.
    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.events.subscribe()
    }

    // ------------------------------------------------------------------
    // Document operations, mirrored for replay
    // ------------------------------------------------------------------

    pub async fn open_document(
        &self,
        uri: &str,
        language_id: &str,
        text: &str,
    ) -> LspResult<()> {
        let server = self.require_server().await?;
        server.open_document(uri, language_id, text).await?;
        self.mirror
            .lock()
            .await
            .insert(uri.to_string(), TrackedDocument::new(uri, language_id, text));
        Ok(())
    }

    pub async fn change_document(&self, uri: &str, text: &str) -> LspResult<()> {
        let server = self.require_server().await?;
        server.change_document(uri, text).await?;
        if let Some(document) = self.mirror.lock().await.get_mut(uri) {
            document.apply_full_change(text);
        }
        Ok(())
    }

    pub async fn close_document(&self, uri: &str) -> LspResult<()> {
        let server = self.require_server().await?;
        server.close_document(uri).await?;
        self.mirror.lock().await.remove(uri);
        Ok(())
    }

    pub async fn save_document(&self, uri: &str) -> LspResult<()> {
        let server = self.require_server().await?;
        server.save_document(uri).await
    }

    /// Number of documents in the replay mirror.
    pub async fn mirrored_document_count(&self) -> usize {
        self.mirror.lock().await.len()
    }

    /// Tear everything down. Pending restarts are cancelled; a respawn
    /// already in flight is shut down as soon as it lands. Terminal: the
    /// supervisor cannot be started again afterwards.
    pub async fn stop(&self) -> LspResult<()> {
        self.cancel.cancel();
        // Same lock order as the recovery install path (current, then
        // state), so a recovering task can never slip a fresh server in
        // between the take and the state flip.
        let server = {
            let mut current = self.current.write().await;
            let server = current.take();
            *self.state.write().await = SupervisorState::Stopped;
            server
        };
        if let Some(server) = server {
            server.shutdown().await?;
        }
        Ok(())
    }

    async fn require_server(&self) -> LspResult<Arc<LanguageServer>> {
        if let Some(server) = self.current.read().await.clone() {
            return Ok(server);
        }
        let state = self.state().await;
        match state {
            SupervisorState::Failed => Err(LspError::PermanentlyFailed(
                self.config.language.clone(),
            )),
            _ => Err(LspError::not_ready(
                &self.config.language,
                state.to_string(),
            )),
        }
    }

    fn emit(&self, kind: SupervisorEventKind) {
        let _ = self.events.send(SupervisorEvent {
            language: self.config.language.clone(),
            kind,
        });
    }

    /// Watch the server's exit signal; a non-planned exit starts recovery.
    fn watch_exit(self: &Arc<Self>, server: Arc<LanguageServer>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut exit_rx = server.exit_signal();
            let exit = loop {
                let current = exit_rx.borrow().clone();
                if let Some(exit) = current {
                    break exit;
                }
                tokio::select! {
                    changed = exit_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                    _ = this.cancel.cancelled() => return,
                }
            };
            if exit.planned {
                return;
            }
            this.recover(exit.code).await;
        });
    }

    async fn recover(self: Arc<Self>, exit_code: Option<i32>) {
        {
            let mut current = self.current.write().await;
            if self.cancel.is_cancelled() {
                return;
            }
            *current = None;
            *self.state.write().await = SupervisorState::Restarting;
        }
        warn!(
            language = %self.config.language,
            exit_code = ?exit_code,
            "Language server crashed"
        );
        self.emit(SupervisorEventKind::Crashed { exit_code });

        loop {
            if self.cancel.is_cancelled() {
                return;
            }

            let attempt = {
                let mut record = self.record.lock().await;
                record.register_crash(&self.policy, Instant::now())
            };
            let Some((attempt, delay)) = attempt else {
                let current = self.current.write().await;
                if self.cancel.is_cancelled() {
                    return;
                }
                *self.state.write().await = SupervisorState::Failed;
                drop(current);
                warn!(
                    language = %self.config.language,
                    "Restart budget exhausted, giving up"
                );
                self.emit(SupervisorEventKind::Failed);
                return;
            };

            info!(
                language = %self.config.language,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Restarting language server"
            );
            self.emit(SupervisorEventKind::Restarting { attempt, delay });
            if !sleep_with_cancel(delay, &self.cancel).await {
                return;
            }

            match LanguageServer::start(self.config.clone()).await {
                Ok(server) => {
                    let server = Arc::new(server);
                    // stop() may have landed while the respawn was in
                    // flight. The fresh server must not override it.
                    if self.cancel.is_cancelled() {
                        let _ = server.shutdown().await;
                        return;
                    }
                    if let Err(e) = self.replay_documents(&server).await {
                        warn!(
                            language = %self.config.language,
                            error = %e,
                            "Document replay failed, retrying"
                        );
                        let _ = server.shutdown().await;
                        continue;
                    }
                    {
                        let mut current = self.current.write().await;
                        if self.cancel.is_cancelled() {
                            drop(current);
                            let _ = server.shutdown().await;
                            return;
                        }
                        *current = Some(Arc::clone(&server));
                        *self.state.write().await = SupervisorState::Running;
                    }
                    info!(language = %self.config.language, attempt, "Language server recovered");
                    self.emit(SupervisorEventKind::Recovered { attempt });
                    self.watch_exit(server);
                    return;
                }
                Err(e) => {
                    warn!(
                        language = %self.config.language,
                        error = %e,
                        "Restart attempt failed"
                    );
                }
            }
        }
    }

    /// Reopen every mirrored document in a fresh server.
    async fn replay_documents(&self, server: &LanguageServer) -> LspResult<()> {
        let documents: Vec<TrackedDocument> =
            self.mirror.lock().await.values().cloned().collect();
        for document in documents {
            server
                .open_document(&document.uri, &document.language_id, &document.text)
                .await?;
        }
        Ok(())
    }
}

/// Sleep unless the token fires first. Returns false when cancelled.
async fn sleep_with_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = cancel.cancelled() => false,
    }
}
