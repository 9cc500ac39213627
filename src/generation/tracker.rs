// src/generation/tracker.rs
//! Per-connection generation tracking.
//!
//! Each connection has at most one active generation. Cancellation and
//! completion race to remove the connection's entry from the active map;
//! whichever removes it reports to the session, so the client sees exactly
//! one of `GenerateCancelled`, `GenerateDone` or `GenerateError`.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::generation::backend::{BackendError, ChunkSink, GenerationRequest, InferenceBackend};
use crate::protocol::types::{error_code, PacketType};
use crate::server::session::{ClientSession, ConnectionId};

/// Error type for generation tracking
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GenerationError {
    #[error("A generation is already active on {0}")]
    Conflict(ConnectionId),

    #[error("Session is not authenticated")]
    Unauthenticated,

    #[error("No active generation on {0}")]
    NotFound(ConnectionId),

    #[error("Session {0} is closing")]
    Closed(ConnectionId),
}

struct ActiveGeneration {
    generation_id: u64,
    session: ClientSession,
    token: CancellationToken,
    gate: Arc<Mutex<()>>,
    started_at: DateTime<Utc>,
    model: String,
}

impl ActiveGeneration {
    /// Stop forwarding and signal the backend, optionally telling the client
    fn cancel(&self, notify: bool) {
        let _delivering = self.gate.lock();
        self.token.cancel();
        if notify {
            self.session.send(PacketType::GenerateCancelled);
        }
    }
}

/// Public view of an active generation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationState {
    pub connection_id: ConnectionId,
    pub generation_id: u64,
    pub model: String,
    pub start_time: DateTime<Utc>,
}

/// What the completion task did with the backend result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationOutcome {
    /// `GenerateDone` was sent
    Completed,
    /// `GenerateError` was sent
    Failed,
    /// A cancel got there first; nothing was sent by the completion path
    Superseded,
}

/// Handle to a started generation
#[derive(Debug)]
pub struct GenerationHandle {
    pub connection_id: ConnectionId,
    pub generation_id: u64,
    pub model: String,
    task: JoinHandle<GenerationOutcome>,
}

impl GenerationHandle {
    /// Wait for the completion task
    pub async fn finished(self) -> Option<GenerationOutcome> {
        self.task.await.ok()
    }
}

type ActiveMap = Arc<Mutex<HashMap<ConnectionId, ActiveGeneration>>>;

/// Maps connections to their active generation
pub struct GenerationTracker {
    backend: Arc<dyn InferenceBackend>,
    default_model: String,
    active: ActiveMap,
    next_id: AtomicU64,
}

impl std::fmt::Debug for GenerationTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationTracker")
            .field("default_model", &self.default_model)
            .field("active", &self.active_count())
            .finish()
    }
}

impl GenerationTracker {
    pub fn new(backend: Arc<dyn InferenceBackend>, default_model: String) -> Self {
        Self {
            backend,
            default_model,
            active: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Start a generation for an authenticated session
    pub fn start(
        &self,
        session: &ClientSession,
        model: Option<String>,
        prompt: String,
    ) -> Result<GenerationHandle, GenerationError> {
        let client_id = session.client_id().ok_or(GenerationError::Unauthenticated)?;
        let connection_id = session.connection_id();
        let model = model
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| self.default_model.clone());

        let generation_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let gate = Arc::new(Mutex::new(()));

        {
            let mut active = self.active.lock();
            // Teardown marks the session closing before it cancels under this lock
            if session.is_closing() {
                return Err(GenerationError::Closed(connection_id));
            }
            if active.contains_key(&connection_id) {
                return Err(GenerationError::Conflict(connection_id));
            }
            active.insert(
                connection_id,
                ActiveGeneration {
                    generation_id,
                    session: session.clone(),
                    token: token.clone(),
                    gate: gate.clone(),
                    started_at: Utc::now(),
                    model: model.clone(),
                },
            );
        }

        info!(
            connection = %connection_id,
            client_id = %client_id,
            generation_id,
            model = %model,
            "Generation started"
        );

        let request = GenerationRequest {
            model: model.clone(),
            prompt,
        };
        let sink = ChunkSink::new(session.clone(), token.clone(), gate);
        let backend = self.backend.clone();
        let active = self.active.clone();
        let session = session.clone();

        let task = tokio::spawn(async move {
            let result = backend.generate(request, sink, token).await;

            // Only the path that removes the entry may report
            let won = {
                let mut active = active.lock();
                match active.get(&connection_id) {
                    Some(entry) if entry.generation_id == generation_id => {
                        active.remove(&connection_id);
                        true
                    }
                    _ => false,
                }
            };
            if !won {
                debug!(connection = %connection_id, generation_id, "Generation result discarded after cancel");
                return GenerationOutcome::Superseded;
            }

            match result {
                Ok(summary) => {
                    info!(connection = %connection_id, generation_id, tokens = ?summary.eval_count, "Generation finished");
                    session.send(PacketType::GenerateDone {
                        model: summary.model,
                        total_duration_ns: summary.total_duration_ns,
                        eval_count: summary.eval_count,
                    });
                    GenerationOutcome::Completed
                }
                Err(e) => {
                    warn!(connection = %connection_id, generation_id, error = %e, "Generation failed");
                    let code = match e {
                        BackendError::Cancelled => error_code::GENERAL_ERROR,
                        _ => error_code::BACKEND_UNAVAILABLE,
                    };
                    session.send(PacketType::GenerateError {
                        code,
                        message: e.to_string(),
                    });
                    GenerationOutcome::Failed
                }
            }
        });

        Ok(GenerationHandle {
            connection_id,
            generation_id,
            model,
            task,
        })
    }

    /// Cancel the connection's generation and notify the client
    pub fn cancel(&self, connection_id: ConnectionId) -> Result<(), GenerationError> {
        let entry = self
            .active
            .lock()
            .remove(&connection_id)
            .ok_or(GenerationError::NotFound(connection_id))?;

        entry.cancel(true);
        info!(connection = %connection_id, generation_id = entry.generation_id, "Generation cancelled");
        Ok(())
    }

    /// Cancel without notifying, for connection teardown
    pub fn cancel_silently(&self, connection_id: ConnectionId) -> bool {
        let entry = self.active.lock().remove(&connection_id);
        match entry {
            Some(entry) => {
                entry.cancel(false);
                debug!(connection = %connection_id, generation_id = entry.generation_id, "Generation aborted");
                true
            }
            None => false,
        }
    }

    /// Cancel everything, for shutdown
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<ActiveGeneration> = self.active.lock().drain().map(|(_, entry)| entry).collect();
        for entry in &drained {
            entry.cancel(false);
        }
        if !drained.is_empty() {
            info!(count = drained.len(), "Cancelled all active generations");
        }
        drained.len()
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    pub fn is_active(&self, connection_id: ConnectionId) -> bool {
        self.active.lock().contains_key(&connection_id)
    }

    pub fn state(&self, connection_id: ConnectionId) -> Option<GenerationState> {
        self.active.lock().get(&connection_id).map(|entry| GenerationState {
            connection_id,
            generation_id: entry.generation_id,
            model: entry.model.clone(),
            start_time: entry.started_at,
        })
    }

    pub fn default_model(&self) -> &str {
        &self.default_model
    }
}
