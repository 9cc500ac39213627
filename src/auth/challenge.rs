// src/auth/challenge.rs
//! Challenge-response authentication.
//!
//! Each connection gets exactly one random challenge. The client proves
//! possession of a registered Ed25519 key by signing it before the deadline.
//! The challenge is consumed by the first verification attempt whatever the
//! outcome, and its fingerprint is remembered so the same value can never be
//! accepted twice anywhere.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::auth::registry::ClientRegistry;
use crate::config::constants::{CHALLENGE_SIZE, CONSUMED_CHALLENGE_TTL};
use crate::crypto::keys::{challenge_fingerprint, generate_challenge, verify_signature};
use crate::protocol::types::{disconnect_reason, PacketType};
use crate::server::session::{ClientSession, SessionError};
use crate::utils::logging::log_security_event;
use crate::utils::security::StringValidator;

/// Error type for issuing challenges
#[derive(Debug, Error)]
pub enum ChallengeError {
    #[error("Invalid session state: {0}")]
    InvalidState(String),

    #[error("Session is closed")]
    Closed,
}

impl From<SessionError> for ChallengeError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Closed => ChallengeError::Closed,
            other => ChallengeError::InvalidState(other.to_string()),
        }
    }
}

/// Why an authentication attempt was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AuthRejection {
    #[error("authentication timed out")]
    AuthTimeout,

    #[error("unknown client")]
    UnknownClient,

    #[error("client has been revoked")]
    Revoked,

    #[error("signature does not verify")]
    BadSignature,

    #[error("challenge already used or not issued")]
    ReplayedChallenge,

    #[error("client registry unavailable")]
    RegistryUnavailable,
}

impl AuthRejection {
    /// Stable name sent to clients in `AuthResult`
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthRejection::AuthTimeout => "AuthTimeout",
            AuthRejection::UnknownClient => "UnknownClient",
            AuthRejection::Revoked => "Revoked",
            AuthRejection::BadSignature => "BadSignature",
            AuthRejection::ReplayedChallenge => "ReplayedChallenge",
            AuthRejection::RegistryUnavailable => "RegistryUnavailable",
        }
    }
}

/// Proof of a successful verification.
///
/// Only this module can construct one, and [`ClientSession::promote`]
/// requires it, so verification is the only path to an authenticated session.
#[derive(Debug)]
pub struct AuthenticatedIdentity {
    client_id: String,
    authenticated_at: DateTime<Utc>,
}

impl AuthenticatedIdentity {
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn authenticated_at(&self) -> DateTime<Utc> {
        self.authenticated_at
    }
}

/// A challenge handed to a client
#[derive(Debug, Clone)]
pub struct IssuedChallenge {
    pub challenge: Vec<u8>,
    pub expires_at: DateTime<Utc>,
}

impl IssuedChallenge {
    /// Base64 form carried on the wire
    pub fn encoded(&self) -> String {
        base64::encode(&self.challenge)
    }
}

/// Issues and verifies per-connection challenges
#[derive(Debug)]
pub struct ChallengeAuthenticator {
    registry: Arc<ClientRegistry>,
    timeout: Duration,
    /// Fingerprints of consumed challenges and when they were consumed
    consumed: Mutex<HashMap<String, Instant>>,
    consumed_ttl: Duration,
}

impl ChallengeAuthenticator {
    pub fn new(registry: Arc<ClientRegistry>, timeout: Duration) -> Self {
        Self {
            registry,
            timeout,
            consumed: Mutex::new(HashMap::new()),
            consumed_ttl: CONSUMED_CHALLENGE_TTL.max(timeout),
        }
    }

    /// Issue the connection's challenge and arm the authentication timer.
    ///
    /// When the timer fires before verification the session is rejected with
    /// `AuthTimeout` and closed. There is no retry.
    pub fn issue_challenge(&self, session: &ClientSession) -> Result<IssuedChallenge, ChallengeError> {
        let challenge = generate_challenge(CHALLENGE_SIZE);
        let deadline = Instant::now() + self.timeout;
        let expires_at = Utc::now()
            + chrono::Duration::from_std(self.timeout).unwrap_or_else(|_| chrono::Duration::seconds(30));
        let timer = CancellationToken::new();

        session.begin_challenge(challenge.clone(), deadline, timer.clone())?;

        let timeout = self.timeout;
        let timed_session = session.clone();
        let closed = session.close_token();
        let expected = challenge.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = timer.cancelled() => {}
                _ = closed.cancelled() => {}
                _ = time::sleep(timeout) => {
                    if timed_session.expire_challenge(&expected) {
                        log_security_event(
                            "AUTH_TIMEOUT",
                            &format!("{} did not authenticate within {:?}", timed_session.connection_id(), timeout),
                        );
                        timed_session.send(PacketType::AuthResult {
                            ok: false,
                            reason: Some(AuthRejection::AuthTimeout.as_str().to_string()),
                        });
                        timed_session.close(disconnect_reason::AUTHENTICATION_FAILED, "Authentication timed out");
                    }
                }
            }
        });

        debug!(connection = %session.connection_id(), "Challenge issued");
        Ok(IssuedChallenge { challenge, expires_at })
    }

    /// Verify a challenge response and promote the session on success.
    ///
    /// The outstanding challenge is consumed whatever the outcome. On
    /// rejection the session is left in the `Rejected` phase; closing the
    /// connection is up to the caller.
    pub fn verify(&self, session: &ClientSession, client_id: &str, signature: &str) -> Result<String, AuthRejection> {
        let result = self.check(session, client_id, signature);

        match &result {
            Ok(_) => info!(connection = %session.connection_id(), client_id, "Client authenticated"),
            Err(reason) => {
                session.reject(*reason);
                log_security_event(
                    "AUTH_REJECTED",
                    &format!(
                        "{} from {} as '{}': {}",
                        session.connection_id(),
                        session.remote_addr(),
                        StringValidator::sanitize_log(client_id),
                        reason.as_str()
                    ),
                );
            }
        }

        result
    }

    fn check(&self, session: &ClientSession, client_id: &str, signature: &str) -> Result<String, AuthRejection> {
        let pending = session.consume_challenge()?;

        let fingerprint = challenge_fingerprint(&pending.challenge);
        if self.consumed.lock().insert(fingerprint, Instant::now()).is_some() {
            return Err(AuthRejection::ReplayedChallenge);
        }

        if Instant::now() > pending.deadline {
            return Err(AuthRejection::AuthTimeout);
        }

        if !self.registry.is_available() {
            return Err(AuthRejection::RegistryUnavailable);
        }

        if !StringValidator::is_valid_client_id(client_id) {
            return Err(AuthRejection::UnknownClient);
        }
        let identity = self
            .registry
            .lookup(client_id)
            .map_err(|_| AuthRejection::UnknownClient)?;
        if identity.is_revoked() || self.registry.is_revoked(client_id) {
            return Err(AuthRejection::Revoked);
        }

        verify_signature(&identity.public_key, &pending.challenge, signature)
            .map_err(|_| AuthRejection::BadSignature)?;

        session.promote(AuthenticatedIdentity {
            client_id: identity.client_id.clone(),
            authenticated_at: Utc::now(),
        });

        // A revocation committed between the check above and the promotion
        // would miss this session in the fan-out.
        if self.registry.is_revoked(client_id) {
            return Err(AuthRejection::Revoked);
        }

        Ok(identity.client_id)
    }

    /// Forget consumed fingerprints older than the TTL. Returns how many were removed.
    pub fn cleanup_consumed(&self) -> usize {
        let ttl = self.consumed_ttl;
        let mut consumed = self.consumed.lock();
        let before = consumed.len();
        consumed.retain(|_, at| at.elapsed() < ttl);
        before - consumed.len()
    }

    /// Number of remembered fingerprints
    pub fn consumed_count(&self) -> usize {
        self.consumed.lock().len()
    }
}
