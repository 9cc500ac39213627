// src/server/core.rs
//! Core server implementation for the inference gateway.
//!
//! This module contains the gateway server that accepts WebSocket
//! connections, wires sessions to the authenticator and the generation
//! tracker, and runs the background maintenance tasks.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::auth::challenge::{ChallengeAuthenticator, ChallengeError};
use crate::auth::registry::{ClientRegistry, LoadReport, RegistryError};
use crate::config::constants::{RATE_LIMIT_WINDOW, REVOCATION_REFRESH_INTERVAL};
use crate::config::settings::{ConfigError, ServerConfig};
use crate::generation::backend::{BackendError, InferenceBackend, OllamaBackend};
use crate::generation::tracker::GenerationTracker;
use crate::protocol::types::disconnect_reason;
use crate::protocol::MessageError;
use crate::server::client::handle_client;
use crate::server::session::{SessionError, SessionManager};
use crate::utils::security::RateLimiter;

/// How often consumed challenge fingerprints are swept
const CONSUMED_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] MessageError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Challenge error: {0}")]
    Challenge(#[from] ChallengeError),

    #[error("Internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Initial state
    Created,
    /// Server is starting up
    Starting,
    /// Server is running
    Running,
    /// Server is shutting down
    ShuttingDown,
    /// Server has stopped
    Stopped,
}

/// Inference gateway server
pub struct GatewayServer {
    /// Server configuration
    config: ServerConfig,
    /// Authorized client registry
    registry: Arc<ClientRegistry>,
    /// How the registry was loaded at startup
    load_report: LoadReport,
    /// Challenge-response authenticator
    authenticator: Arc<ChallengeAuthenticator>,
    /// Active generations, at most one per connection
    generations: Arc<GenerationTracker>,
    /// Live sessions
    session_manager: Arc<SessionManager>,
    /// Ollama client kept for startup probing, absent for injected backends
    startup_backend: Option<OllamaBackend>,
    /// Per-IP connection limiter
    rate_limiter: Arc<RateLimiter>,
    /// Server state
    state: Arc<RwLock<ServerState>>,
    /// Cancelled on shutdown; stops the accept loop and background tasks
    shutdown: CancellationToken,
    /// Accept loop and background task handles
    task_handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl GatewayServer {
    /// Create a server that relays generations to the configured Ollama URL
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        config.validate()?;
        let ollama = OllamaBackend::new(&config.ollama_url)?;
        let backend: Arc<dyn InferenceBackend> = Arc::new(ollama.clone());
        Self::build(config, backend, Some(ollama))
    }

    /// Create a server around an arbitrary backend
    pub fn with_backend(config: ServerConfig, backend: Arc<dyn InferenceBackend>) -> Result<Self, ServerError> {
        config.validate()?;
        Self::build(config, backend, None)
    }

    fn build(
        config: ServerConfig,
        backend: Arc<dyn InferenceBackend>,
        startup_backend: Option<OllamaBackend>,
    ) -> Result<Self, ServerError> {
        info!("Initializing inference gateway");

        let (registry, load_report) = ClientRegistry::open(&config.data_dir, config.max_backups)?;
        for warning in &load_report.warnings {
            warn!("Registry: {}", warning);
        }
        info!(
            "Registry loaded from {:?}: {} clients, {} revocations",
            load_report.source, load_report.clients, load_report.revocations
        );
        let registry = Arc::new(registry);

        let authenticator = Arc::new(ChallengeAuthenticator::new(registry.clone(), config.auth_timeout()));
        let generations = Arc::new(GenerationTracker::new(backend, config.default_model.clone()));
        let session_manager = Arc::new(SessionManager::new(registry.clone(), generations.clone()));
        let rate_limiter = Arc::new(RateLimiter::new(config.max_connections_per_ip, RATE_LIMIT_WINDOW));

        Ok(Self {
            config,
            registry,
            load_report,
            authenticator,
            generations,
            session_manager,
            startup_backend,
            rate_limiter,
            state: Arc::new(RwLock::new(ServerState::Created)),
            shutdown: CancellationToken::new(),
            task_handles: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Bind the listener and start serving. Returns the bound address.
    pub async fn start(&self) -> Result<SocketAddr, ServerError> {
        // --- State Check ---
        {
            let mut state = self.state.write().await;
            if *state != ServerState::Created {
                return Err(ServerError::Internal(format!("Cannot start server in state {:?}", *state)));
            }
            *state = ServerState::Starting;
        }

        if let Some(ollama) = &self.startup_backend {
            self.report_backend(ollama).await;
        }

        let listener = match TcpListener::bind(self.config.bind_address()).await {
            Ok(listener) => listener,
            Err(e) => {
                error!("Failed to bind to {}: {}", self.config.bind_address(), e);
                *self.state.write().await = ServerState::Stopped;
                return Err(e.into());
            }
        };
        let local_addr = listener.local_addr()?;
        info!("Inference gateway listening on {}", local_addr);

        *self.state.write().await = ServerState::Running;

        // --- Start Background Tasks ---
        self.start_background_tasks().await;

        // --- Accept Loop ---
        let session_manager = self.session_manager.clone();
        let authenticator = self.authenticator.clone();
        let generations = self.generations.clone();
        let rate_limiter = self.rate_limiter.clone();
        let shutdown = self.shutdown.clone();
        let auth_timeout = self.config.auth_timeout();

        let accept_handle = tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    accepted = listener.accept() => accepted,
                };

                match accepted {
                    Ok((stream, addr)) => {
                        trace!("Accepted connection from {}", addr);

                        if !rate_limiter.check_rate_limit(&addr.ip()) {
                            warn!("Rate limit exceeded for {}, rejecting connection", addr);
                            drop(stream);
                            continue;
                        }

                        let session_manager = session_manager.clone();
                        let authenticator = authenticator.clone();
                        let generations = generations.clone();

                        tokio::spawn(async move {
                            let result =
                                handle_client(stream, addr, session_manager, authenticator, generations, auth_timeout)
                                    .await;

                            if let Err(e) = result {
                                match e {
                                    ServerError::WebSocket(ws_err) => {
                                        use tokio_tungstenite::tungstenite::error::Error as WsError;
                                        match ws_err {
                                            WsError::ConnectionClosed | WsError::Protocol(_) | WsError::Io(_) => {
                                                trace!("WebSocket connection closed for {}: {}", addr, ws_err);
                                            }
                                            _ => {
                                                debug!("WebSocket error for {}: {}", addr, ws_err);
                                            }
                                        }
                                    }
                                    _ => {
                                        error!("Error handling client {}: {}", addr, e);
                                    }
                                }
                            }
                        });
                    }
                    Err(e) => {
                        error!("Error accepting connection: {}", e);
                        time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
            info!("Server listener task stopped.");
        });

        self.task_handles.lock().await.push(accept_handle);
        Ok(local_addr)
    }

    async fn report_backend(&self, ollama: &OllamaBackend) {
        match ollama.list_models().await {
            Ok(models) => {
                info!("Backend at {} reachable, {} models available", self.config.ollama_url, models.len());
                let default_model = &self.config.default_model;
                if !models.iter().any(|m| m == default_model || m.split(':').next() == Some(default_model.as_str())) {
                    warn!("Default model '{}' is not installed on the backend", default_model);
                }
            }
            Err(e) => {
                warn!(
                    "Backend at {} is not reachable ({}); generations will fail until it is",
                    self.config.ollama_url, e
                );
            }
        }
    }

    /// Shutdown the server. Active generations are cancelled without a grace
    /// period and every session receives a `SERVER_SHUTDOWN` disconnect.
    pub async fn shutdown(&self) -> Result<(), ServerError> {
        {
            let mut state = self.state.write().await;
            if *state == ServerState::ShuttingDown || *state == ServerState::Stopped {
                info!("Server already shutting down or stopped.");
                return Ok(());
            }
            info!("Shutting down inference gateway (current state: {:?})", *state);
            *state = ServerState::ShuttingDown;
        }

        self.shutdown.cancel();

        let cancelled = self.generations.cancel_all();
        if cancelled > 0 {
            info!("Cancelled {} active generations", cancelled);
        }

        let closed = self
            .session_manager
            .close_all(disconnect_reason::SERVER_SHUTDOWN, "Server shutting down")
            .await;
        info!("Closed {} client sessions", closed);

        {
            let mut handles = self.task_handles.lock().await;
            debug!("Aborting {} server tasks.", handles.len());
            for handle in handles.iter() {
                handle.abort();
            }
            handles.clear();
        }

        *self.state.write().await = ServerState::Stopped;
        info!("Server shutdown complete.");
        Ok(())
    }

    /// Start background maintenance tasks
    async fn start_background_tasks(&self) {
        debug!("Starting background maintenance tasks.");
        let mut handles = Vec::new();

        // --- Task: Liveness Sweep ---
        let session_manager = self.session_manager.clone();
        let shutdown = self.shutdown.clone();
        let ping_interval = self.config.ping_interval();
        handles.push(tokio::spawn(async move {
            let mut interval = time::interval_at(Instant::now() + ping_interval, ping_interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {}
                }
                let report = session_manager.sweep_liveness().await;
                if report.timed_out > 0 || report.revoked > 0 {
                    debug!(
                        "Liveness sweep: {} pinged, {} timed out, {} revoked",
                        report.pinged, report.timed_out, report.revoked
                    );
                }
            }
            debug!("Liveness task stopped.");
        }));

        // --- Task: Revocation Fan-out ---
        let session_manager = self.session_manager.clone();
        let registry = self.registry.clone();
        let shutdown = self.shutdown.clone();
        let mut revocations = self.registry.subscribe();
        handles.push(tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    received = revocations.recv() => received,
                };
                match received {
                    Ok(record) => {
                        let closed = session_manager.handle_revocation(&record.client_id).await;
                        if closed > 0 {
                            info!("Closed {} sessions of revoked client {}", closed, record.client_id);
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!("Missed {} revocation events; re-checking all revocations", missed);
                        for record in registry.revocations() {
                            session_manager.handle_revocation(&record.client_id).await;
                        }
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!("Revocation task stopped.");
        }));

        // --- Task: Revocation Refresh ---
        let registry = self.registry.clone();
        let shutdown = self.shutdown.clone();
        handles.push(tokio::spawn(async move {
            let mut interval = time::interval_at(
                Instant::now() + REVOCATION_REFRESH_INTERVAL,
                REVOCATION_REFRESH_INTERVAL,
            );
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {}
                }
                match registry.refresh_revocations().await {
                    Ok(found) if !found.is_empty() => {
                        info!("Picked up {} revocations from disk", found.len());
                    }
                    Ok(_) => {}
                    Err(e) => warn!("Failed to rescan revocations: {}", e),
                }
            }
            debug!("Revocation refresh task stopped.");
        }));

        // --- Task: Consumed Challenge Cleanup ---
        let authenticator = self.authenticator.clone();
        let shutdown = self.shutdown.clone();
        handles.push(tokio::spawn(async move {
            let mut interval = time::interval(CONSUMED_CLEANUP_INTERVAL);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {}
                }
                let removed = authenticator.cleanup_consumed();
                if removed > 0 {
                    trace!("Forgot {} consumed challenges", removed);
                }
            }
        }));

        self.task_handles.lock().await.extend(handles);
    }

    /// Reload the registry from disk and close sessions of clients it now
    /// lists as revoked
    pub async fn reload_registry(&self) -> Result<LoadReport, ServerError> {
        let report = self.registry.reload().await?;
        for warning in &report.warnings {
            warn!("Registry: {}", warning);
        }
        for record in self.registry.revocations() {
            self.session_manager.handle_revocation(&record.client_id).await;
        }
        info!("Registry reloaded: {} clients, {} revocations", report.clients, report.revocations);
        Ok(report)
    }

    /// Get the server's current state
    pub async fn get_state(&self) -> ServerState {
        *self.state.read().await
    }

    // --- Accessor methods ---
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
    pub fn load_report(&self) -> &LoadReport {
        &self.load_report
    }
    pub fn registry(&self) -> Arc<ClientRegistry> {
        self.registry.clone()
    }
    pub fn session_manager(&self) -> Arc<SessionManager> {
        self.session_manager.clone()
    }
    pub fn generations(&self) -> Arc<GenerationTracker> {
        self.generations.clone()
    }
    pub fn authenticator(&self) -> Arc<ChallengeAuthenticator> {
        self.authenticator.clone()
    }
}
