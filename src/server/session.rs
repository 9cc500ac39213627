// src/server/session.rs
//! Per-connection session state and the manager owning all live sessions.
//!
//! A `ClientSession` is a cheap handle shared by the connection task, the
//! authentication timer and generation tasks. Outbound traffic goes through
//! an unbounded channel drained by the connection's writer task, so no
//! caller ever holds the socket.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::auth::challenge::{AuthRejection, AuthenticatedIdentity};
use crate::auth::registry::ClientRegistry;
use crate::generation::tracker::GenerationTracker;
use crate::protocol::serialization::log_packet_info;
use crate::protocol::types::{disconnect_reason, PacketType};
use crate::utils::current_timestamp_millis;
use crate::utils::logging::log_security_event;

/// Error type for session operations
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session is closed")]
    Closed,

    #[error("Session is {actual}, expected {expected}")]
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("Client {0} has been revoked")]
    Revoked(String),
}

/// Identifier of a live transport connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Authentication phase of a connection
#[derive(Debug, Clone)]
pub enum SessionPhase {
    Unauthenticated,
    Authenticating {
        challenge: Vec<u8>,
        deadline: Instant,
        timer: CancellationToken,
    },
    Authenticated {
        client_id: String,
        authenticated_at: DateTime<Utc>,
    },
    Rejected {
        reason: AuthRejection,
    },
}

impl SessionPhase {
    pub fn name(&self) -> &'static str {
        match self {
            SessionPhase::Unauthenticated => "Unauthenticated",
            SessionPhase::Authenticating { .. } => "Authenticating",
            SessionPhase::Authenticated { .. } => "Authenticated",
            SessionPhase::Rejected { .. } => "Rejected",
        }
    }
}

/// Work for the connection's writer task
#[derive(Debug)]
pub enum Outbound {
    Packet(PacketType),
    /// Send a `Disconnect`, close the socket and stop
    Close { reason: u16, message: String },
}

/// Challenge taken off a session for verification
#[derive(Debug)]
pub struct PendingChallenge {
    pub challenge: Vec<u8>,
    pub deadline: Instant,
}

/// Snapshot of a session's authentication state
#[derive(Debug, Clone, Serialize)]
pub struct ClientState {
    pub connection_id: ConnectionId,
    pub authenticated: bool,
    pub client_id: Option<String>,
    /// Outstanding challenge, base64
    pub challenge: Option<String>,
    pub connected_at: DateTime<Utc>,
}

/// Session snapshot with network details, for auditing
#[derive(Debug, Clone, Serialize)]
pub struct EnhancedClientState {
    #[serde(flatten)]
    pub state: ClientState,
    pub remote_addr: SocketAddr,
    /// `X-Forwarded-For` chain from the upgrade request, if any
    pub forwarded_for: Option<String>,
}

#[derive(Debug, Default)]
struct Liveness {
    next_sequence: u64,
    /// Sequence of the ping still waiting for a pong
    outstanding: Option<u64>,
    last_pong: Option<Instant>,
}

#[derive(Debug)]
struct SessionInner {
    connection_id: ConnectionId,
    remote_addr: SocketAddr,
    forwarded_for: Option<String>,
    connected_at: DateTime<Utc>,
    phase: Mutex<SessionPhase>,
    liveness: Mutex<Liveness>,
    outbound: mpsc::UnboundedSender<Outbound>,
    closing: AtomicBool,
    /// Reason given by the first `close`
    close_reason: Mutex<Option<(u16, String)>>,
    closed: CancellationToken,
}

/// Client session for a connected peer
#[derive(Debug, Clone)]
pub struct ClientSession {
    inner: Arc<SessionInner>,
}

impl ClientSession {
    /// Create a session and the receiving end of its outbound channel
    pub fn new(
        connection_id: ConnectionId,
        remote_addr: SocketAddr,
        forwarded_for: Option<String>,
    ) -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Self {
            inner: Arc::new(SessionInner {
                connection_id,
                remote_addr,
                forwarded_for,
                connected_at: Utc::now(),
                phase: Mutex::new(SessionPhase::Unauthenticated),
                liveness: Mutex::new(Liveness::default()),
                outbound: tx,
                closing: AtomicBool::new(false),
                close_reason: Mutex::new(None),
                closed: CancellationToken::new(),
            }),
        };
        (session, rx)
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.inner.connection_id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.remote_addr
    }

    pub fn forwarded_for(&self) -> Option<&str> {
        self.inner.forwarded_for.as_deref()
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.inner.connected_at
    }

    pub fn phase(&self) -> SessionPhase {
        self.inner.phase.lock().clone()
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(*self.inner.phase.lock(), SessionPhase::Authenticated { .. })
    }

    /// Client id if authenticated
    pub fn client_id(&self) -> Option<String> {
        match &*self.inner.phase.lock() {
            SessionPhase::Authenticated { client_id, .. } => Some(client_id.clone()),
            _ => None,
        }
    }

    pub fn authenticated_at(&self) -> Option<DateTime<Utc>> {
        match &*self.inner.phase.lock() {
            SessionPhase::Authenticated { authenticated_at, .. } => Some(*authenticated_at),
            _ => None,
        }
    }

    /// Move from `Unauthenticated` to `Authenticating`
    pub(crate) fn begin_challenge(
        &self,
        challenge: Vec<u8>,
        deadline: Instant,
        timer: CancellationToken,
    ) -> Result<(), SessionError> {
        if self.is_closing() {
            return Err(SessionError::Closed);
        }

        let mut phase = self.inner.phase.lock();
        match &*phase {
            SessionPhase::Unauthenticated => {
                *phase = SessionPhase::Authenticating {
                    challenge,
                    deadline,
                    timer,
                };
                Ok(())
            }
            other => Err(SessionError::InvalidState {
                expected: "Unauthenticated",
                actual: other.name(),
            }),
        }
    }

    /// Take the outstanding challenge and stop its timer. The challenge can
    /// be taken only once.
    pub(crate) fn consume_challenge(&self) -> Result<PendingChallenge, AuthRejection> {
        let mut phase = self.inner.phase.lock();
        match std::mem::replace(&mut *phase, SessionPhase::Unauthenticated) {
            SessionPhase::Authenticating {
                challenge,
                deadline,
                timer,
            } => {
                timer.cancel();
                Ok(PendingChallenge { challenge, deadline })
            }
            previous => {
                let rejection = match &previous {
                    SessionPhase::Rejected {
                        reason: AuthRejection::AuthTimeout,
                    } => AuthRejection::AuthTimeout,
                    _ => AuthRejection::ReplayedChallenge,
                };
                *phase = previous;
                Err(rejection)
            }
        }
    }

    /// Reject with `AuthTimeout` if `challenge` is still outstanding
    pub(crate) fn expire_challenge(&self, challenge: &[u8]) -> bool {
        let mut phase = self.inner.phase.lock();
        let outstanding = matches!(
            &*phase,
            SessionPhase::Authenticating { challenge: c, .. } if c.as_slice() == challenge
        );
        if outstanding {
            *phase = SessionPhase::Rejected {
                reason: AuthRejection::AuthTimeout,
            };
        }
        outstanding
    }

    /// Mark the session authenticated. Requires proof from the authenticator.
    pub fn promote(&self, identity: AuthenticatedIdentity) {
        *self.inner.phase.lock() = SessionPhase::Authenticated {
            client_id: identity.client_id().to_string(),
            authenticated_at: identity.authenticated_at(),
        };
        *self.inner.liveness.lock() = Liveness::default();
    }

    pub(crate) fn reject(&self, reason: AuthRejection) {
        let mut phase = self.inner.phase.lock();
        if let SessionPhase::Authenticating { timer, .. } = &*phase {
            timer.cancel();
        }
        *phase = SessionPhase::Rejected { reason };
    }

    /// Queue a packet for the client. Returns false once the session is closing.
    pub fn send(&self, packet: PacketType) -> bool {
        if self.is_closing() {
            trace!(connection = %self.connection_id(), "Dropping packet for closing session");
            return false;
        }
        log_packet_info(&packet, false);
        self.inner.outbound.send(Outbound::Packet(packet)).is_ok()
    }

    /// Ask the writer to send `Disconnect` and close the socket. Only the
    /// first call has an effect.
    pub fn close(&self, reason: u16, message: &str) -> bool {
        if self.inner.closing.swap(true, Ordering::AcqRel) {
            return false;
        }
        *self.inner.close_reason.lock() = Some((reason, message.to_string()));

        if let SessionPhase::Authenticating { timer, .. } = &*self.inner.phase.lock() {
            timer.cancel();
        }

        let _ = self.inner.outbound.send(Outbound::Close {
            reason,
            message: message.to_string(),
        });
        self.inner.closed.cancel();
        debug!(connection = %self.connection_id(), reason, "Session closing: {}", message);
        true
    }

    /// Reason and message of the close that took effect
    pub fn close_reason(&self) -> Option<(u16, String)> {
        self.inner.close_reason.lock().clone()
    }

    pub fn is_closing(&self) -> bool {
        self.inner.closing.load(Ordering::Acquire)
    }

    /// Token cancelled when the session starts closing
    pub fn close_token(&self) -> CancellationToken {
        self.inner.closed.clone()
    }

    /// Build the next `Ping`, or `None` if the previous one is unanswered
    pub(crate) fn prepare_ping(&self) -> Option<PacketType> {
        let mut liveness = self.inner.liveness.lock();
        if liveness.outstanding.is_some() {
            return None;
        }
        liveness.next_sequence += 1;
        let sequence = liveness.next_sequence;
        liveness.outstanding = Some(sequence);
        Some(PacketType::Ping {
            timestamp: current_timestamp_millis(),
            sequence,
        })
    }

    /// Clear the outstanding ping if `sequence` answers it
    pub fn record_pong(&self, sequence: u64) -> bool {
        let mut liveness = self.inner.liveness.lock();
        match liveness.outstanding {
            Some(expected) if sequence == expected => {
                liveness.outstanding = None;
                liveness.last_pong = Some(Instant::now());
                true
            }
            _ => false,
        }
    }

    /// Time of the last answered ping
    pub fn last_pong(&self) -> Option<Instant> {
        self.inner.liveness.lock().last_pong
    }

    pub fn state(&self) -> ClientState {
        let phase = self.inner.phase.lock();
        let (authenticated, client_id, challenge) = match &*phase {
            SessionPhase::Authenticated { client_id, .. } => (true, Some(client_id.clone()), None),
            SessionPhase::Authenticating { challenge, .. } => (false, None, Some(base64::encode(challenge))),
            _ => (false, None, None),
        };
        ClientState {
            connection_id: self.inner.connection_id,
            authenticated,
            client_id,
            challenge,
            connected_at: self.inner.connected_at,
        }
    }

    pub fn enhanced_state(&self) -> EnhancedClientState {
        EnhancedClientState {
            state: self.state(),
            remote_addr: self.inner.remote_addr,
            forwarded_for: self.inner.forwarded_for.clone(),
        }
    }
}

/// Result of one liveness sweep
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub pinged: usize,
    pub timed_out: usize,
    pub revoked: usize,
}

/// Session manager for handling multiple client sessions
#[derive(Debug)]
pub struct SessionManager {
    /// Active sessions
    sessions: RwLock<HashMap<ConnectionId, ClientSession>>,
    next_id: AtomicU64,
    registry: Arc<ClientRegistry>,
    generations: Arc<GenerationTracker>,
}

impl SessionManager {
    pub fn new(registry: Arc<ClientRegistry>, generations: Arc<GenerationTracker>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            registry,
            generations,
        }
    }

    /// Register a new connection in the `Unauthenticated` phase
    pub async fn on_connect(
        &self,
        remote_addr: SocketAddr,
        forwarded_for: Option<String>,
    ) -> (ClientSession, mpsc::UnboundedReceiver<Outbound>) {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (session, rx) = ClientSession::new(id, remote_addr, forwarded_for);

        self.sessions.write().await.insert(id, session.clone());
        info!(connection = %id, remote = %remote_addr, "Connection registered");

        (session, rx)
    }

    /// Tear a connection down. Runs once per connection; later calls return false.
    pub async fn on_disconnect(&self, connection_id: ConnectionId, reason: u16, message: &str) -> bool {
        let session = match self.sessions.write().await.remove(&connection_id) {
            Some(session) => session,
            None => return false,
        };

        // Close before cancelling; `GenerationTracker::start` refuses closing sessions
        session.close(reason, message);
        self.generations.cancel_silently(connection_id);

        // An earlier close (auth timeout, liveness, revocation) decides the reason
        let (reason, message) = session
            .close_reason()
            .unwrap_or_else(|| (reason, message.to_string()));
        let lifetime = Utc::now().signed_duration_since(session.connected_at());
        info!(
            connection = %connection_id,
            client_id = ?session.client_id(),
            reason,
            lifetime_ms = lifetime.num_milliseconds(),
            "Connection closed: {}",
            message
        );
        true
    }

    /// Route a pong to its session
    pub async fn record_pong(&self, connection_id: ConnectionId, sequence: u64) -> bool {
        match self.get(connection_id).await {
            Some(session) => session.record_pong(sequence),
            None => false,
        }
    }

    /// Ping every authenticated session, dropping those that missed the
    /// previous ping or whose identity has been revoked.
    pub async fn sweep_liveness(&self) -> SweepReport {
        let sessions: Vec<ClientSession> = self.sessions.read().await.values().cloned().collect();
        let mut report = SweepReport::default();

        for session in sessions {
            if !session.is_authenticated() {
                continue;
            }

            if self.ensure_not_revoked(&session).is_err() {
                self.on_disconnect(session.connection_id(), disconnect_reason::ACCESS_REVOKED, "Access revoked")
                    .await;
                report.revoked += 1;
                continue;
            }

            match session.prepare_ping() {
                Some(ping) => {
                    session.send(ping);
                    report.pinged += 1;
                }
                None => {
                    debug!(connection = %session.connection_id(), "Ping unanswered; disconnecting");
                    self.on_disconnect(session.connection_id(), disconnect_reason::IDLE_TIMEOUT, "Ping timeout")
                        .await;
                    report.timed_out += 1;
                }
            }
        }

        if report != SweepReport::default() {
            debug!(
                pinged = report.pinged,
                timed_out = report.timed_out,
                revoked = report.revoked,
                "Liveness sweep finished"
            );
        }
        report
    }

    /// Disconnect every session authenticated as `client_id`
    pub async fn handle_revocation(&self, client_id: &str) -> usize {
        let affected = self.sessions_for_client(client_id).await;
        for session in &affected {
            log_security_event(
                "SESSION_REVOKED",
                &format!("{} closed: client '{}' revoked", session.connection_id(), client_id),
            );
            self.on_disconnect(session.connection_id(), disconnect_reason::ACCESS_REVOKED, "Access revoked")
                .await;
        }
        affected.len()
    }

    /// Fail if the session's identity has been revoked since it authenticated
    pub fn ensure_not_revoked(&self, session: &ClientSession) -> Result<(), SessionError> {
        match session.phase() {
            SessionPhase::Authenticated { client_id, .. } => {
                if self.registry.is_revoked(&client_id) {
                    Err(SessionError::Revoked(client_id))
                } else {
                    Ok(())
                }
            }
            other => Err(SessionError::InvalidState {
                expected: "Authenticated",
                actual: other.name(),
            }),
        }
    }

    /// Close every session, e.g. on shutdown
    pub async fn close_all(&self, reason: u16, message: &str) -> usize {
        let ids: Vec<ConnectionId> = self.sessions.read().await.keys().copied().collect();
        let mut closed = 0;
        for id in ids {
            if self.on_disconnect(id, reason, message).await {
                closed += 1;
            }
        }
        closed
    }

    pub async fn get(&self, connection_id: ConnectionId) -> Option<ClientSession> {
        self.sessions.read().await.get(&connection_id).cloned()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn sessions_for_client(&self, client_id: &str) -> Vec<ClientSession> {
        self.sessions
            .read()
            .await
            .values()
            .filter(|s| s.client_id().as_deref() == Some(client_id))
            .cloned()
            .collect()
    }

    /// Audit view of every live session
    pub async fn states(&self) -> Vec<EnhancedClientState> {
        let mut states: Vec<EnhancedClientState> =
            self.sessions.read().await.values().map(|s| s.enhanced_state()).collect();
        states.sort_by_key(|s| s.state.connection_id);
        states
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::challenge::ChallengeAuthenticator;
    use crate::auth::registry::ClientIdentity;
    use crate::crypto::keys::ClientKeypair;
    use crate::generation::backend::testing::ScriptedBackend;
    use crate::generation::tracker::GenerationError;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        registry: Arc<ClientRegistry>,
        auth: ChallengeAuthenticator,
        manager: SessionManager,
        generations: Arc<GenerationTracker>,
        backend: Arc<ScriptedBackend>,
        alice: ClientKeypair,
    }

    async fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let (registry, _) = ClientRegistry::open(tmp.path(), 3).unwrap();
        let registry = Arc::new(registry);
        let alice = ClientKeypair::generate().unwrap();
        registry
            .add(ClientIdentity::new("alice", alice.public_key_base64(), None))
            .await
            .unwrap();

        let backend = Arc::new(ScriptedBackend::new(vec!["hi"]));
        let generations = Arc::new(GenerationTracker::new(backend.clone(), "llama2".to_string()));
        Fixture {
            _tmp: tmp,
            auth: ChallengeAuthenticator::new(registry.clone(), Duration::from_secs(5)),
            manager: SessionManager::new(registry.clone(), generations.clone()),
            generations,
            backend,
            registry,
            alice,
        }
    }

    async fn authenticated(f: &Fixture) -> (ClientSession, mpsc::UnboundedReceiver<Outbound>) {
        let (session, rx) = f.manager.on_connect("127.0.0.1:5000".parse().unwrap(), None).await;
        let issued = f.auth.issue_challenge(&session).unwrap();
        f.auth
            .verify(&session, "alice", &f.alice.sign_base64(&issued.challenge))
            .unwrap();
        (session, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Vec<Outbound> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    #[test]
    fn test_connection_id_display() {
        assert_eq!(ConnectionId(7).to_string(), "conn-7");
    }

    #[tokio::test]
    async fn test_connect_starts_unauthenticated() {
        let f = fixture().await;
        let (session, _rx) = f
            .manager
            .on_connect("10.0.0.2:6000".parse().unwrap(), Some("203.0.113.9".to_string()))
            .await;

        let state = session.enhanced_state();
        assert!(!state.state.authenticated);
        assert!(state.state.client_id.is_none());
        assert_eq!(state.forwarded_for.as_deref(), Some("203.0.113.9"));
        assert_eq!(f.manager.session_count().await, 1);
    }

    #[tokio::test]
    async fn test_state_exposes_challenge_until_verified() {
        let f = fixture().await;
        let (session, _rx) = f.manager.on_connect("127.0.0.1:5000".parse().unwrap(), None).await;

        let issued = f.auth.issue_challenge(&session).unwrap();
        assert_eq!(session.state().challenge, Some(issued.encoded()));

        f.auth
            .verify(&session, "alice", &f.alice.sign_base64(&issued.challenge))
            .unwrap();
        let state = session.state();
        assert!(state.authenticated);
        assert!(state.challenge.is_none());
        assert_eq!(state.client_id.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let f = fixture().await;
        let (session, mut rx) = f.manager.on_connect("127.0.0.1:5000".parse().unwrap(), None).await;
        let id = session.connection_id();

        assert!(f.manager.on_disconnect(id, disconnect_reason::USER_INITIATED, "bye").await);
        assert!(!f.manager.on_disconnect(id, disconnect_reason::USER_INITIATED, "bye").await);
        assert_eq!(f.manager.session_count().await, 0);

        let closes = drain(&mut rx)
            .into_iter()
            .filter(|m| matches!(m, Outbound::Close { .. }))
            .count();
        assert_eq!(closes, 1);
        assert!(!session.send(PacketType::GenerateCancelled));
    }

    #[tokio::test]
    async fn test_first_close_reason_is_kept() {
        let f = fixture().await;
        let (session, mut rx) = f.manager.on_connect("127.0.0.1:5000".parse().unwrap(), None).await;

        assert!(session.close(disconnect_reason::AUTHENTICATION_FAILED, "Authentication timed out"));
        assert!(f
            .manager
            .on_disconnect(session.connection_id(), disconnect_reason::USER_INITIATED, "Session closed")
            .await);

        assert_eq!(
            session.close_reason(),
            Some((disconnect_reason::AUTHENTICATION_FAILED, "Authentication timed out".to_string()))
        );
        let closes: Vec<u16> = drain(&mut rx)
            .into_iter()
            .filter_map(|m| match m {
                Outbound::Close { reason, .. } => Some(reason),
                _ => None,
            })
            .collect();
        assert_eq!(closes, vec![disconnect_reason::AUTHENTICATION_FAILED]);
    }

    #[tokio::test]
    async fn test_sweep_pings_then_drops_silent_sessions() {
        let f = fixture().await;
        let (session, mut rx) = authenticated(&f).await;
        drain(&mut rx);

        let report = f.manager.sweep_liveness().await;
        assert_eq!(report.pinged, 1);
        let sequence = match drain(&mut rx).pop() {
            Some(Outbound::Packet(PacketType::Ping { sequence, .. })) => sequence,
            other => panic!("expected ping, got {:?}", other),
        };

        assert!(f.manager.record_pong(session.connection_id(), sequence).await);
        assert_eq!(f.manager.sweep_liveness().await.pinged, 1);

        // No pong this time
        let report = f.manager.sweep_liveness().await;
        assert_eq!(report.timed_out, 1);
        assert!(f.manager.get(session.connection_id()).await.is_none());
        assert!(drain(&mut rx).iter().any(|m| matches!(
            m,
            Outbound::Close {
                reason: disconnect_reason::IDLE_TIMEOUT,
                ..
            }
        )));
    }

    #[tokio::test]
    async fn test_sweep_skips_unauthenticated() {
        let f = fixture().await;
        let (_session, mut rx) = f.manager.on_connect("127.0.0.1:5000".parse().unwrap(), None).await;
        assert_eq!(f.manager.sweep_liveness().await, SweepReport::default());
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_wrong_pong_sequence_ignored() {
        let f = fixture().await;
        let (session, _rx) = authenticated(&f).await;
        f.manager.sweep_liveness().await;
        assert!(!session.record_pong(9999));
    }

    #[tokio::test]
    async fn test_revocation_disconnects_sessions() {
        let f = fixture().await;
        let (first, mut rx) = authenticated(&f).await;
        let (second, _rx2) = authenticated(&f).await;
        assert_eq!(f.manager.sessions_for_client("alice").await.len(), 2);

        f.registry.revoke("alice", "test").await.unwrap();
        assert!(matches!(f.manager.ensure_not_revoked(&first), Err(SessionError::Revoked(_))));

        assert_eq!(f.manager.handle_revocation("alice").await, 2);
        assert_eq!(f.manager.session_count().await, 0);
        assert!(first.is_closing() && second.is_closing());
        assert!(drain(&mut rx).iter().any(|m| matches!(
            m,
            Outbound::Close {
                reason: disconnect_reason::ACCESS_REVOKED,
                ..
            }
        )));
    }

    #[tokio::test]
    async fn test_no_generation_after_teardown() {
        let f = fixture().await;
        let (session, mut rx) = authenticated(&f).await;
        let id = session.connection_id();

        // Revocation fan-out wins the race against a request already past its checks
        assert!(f.manager.on_disconnect(id, disconnect_reason::ACCESS_REVOKED, "Access revoked").await);
        assert_eq!(
            f.generations.start(&session, None, "late".to_string()).unwrap_err(),
            GenerationError::Closed(id)
        );

        tokio::task::yield_now().await;
        assert_eq!(f.generations.active_count(), 0);
        assert_eq!(f.backend.calls(), 0);
        assert!(!drain(&mut rx).iter().any(|m| matches!(
            m,
            Outbound::Packet(PacketType::GenerateDone { .. })
        )));
    }

    #[tokio::test]
    async fn test_sweep_catches_revocation() {
        let f = fixture().await;
        let (_session, _rx) = authenticated(&f).await;
        f.registry.revoke("alice", "test").await.unwrap();

        let report = f.manager.sweep_liveness().await;
        assert_eq!(report.revoked, 1);
        assert_eq!(f.manager.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_close_all() {
        let f = fixture().await;
        for _ in 0..3 {
            let _ = f.manager.on_connect("127.0.0.1:5000".parse().unwrap(), None).await;
        }
        assert_eq!(f.manager.close_all(disconnect_reason::SERVER_SHUTDOWN, "Shutdown").await, 3);
        assert_eq!(f.manager.session_count().await, 0);
        assert!(f.manager.states().await.is_empty());
    }
}
