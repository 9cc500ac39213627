// src/config/constants.rs
//! Application constants and fixed settings.
//!
//! This module contains fixed values that are used throughout the application,
//! such as timeouts, size limits, and on-disk layout names.

use std::time::Duration;

/// Cryptographic constants
pub const CHALLENGE_SIZE: usize = 32;
pub const PUBLIC_KEY_SIZE: usize = 32;
pub const SIGNATURE_SIZE: usize = 64;

/// Authentication must complete within this window of challenge issuance
pub const AUTH_TIMEOUT: Duration = Duration::from_millis(30_000);

/// Liveness check cadence for authenticated sessions
pub const PING_INTERVAL: Duration = Duration::from_millis(30_000);

/// How long a consumed challenge fingerprint is remembered
pub const CONSUMED_CHALLENGE_TTL: Duration = Duration::from_secs(600);

/// Registry layout
pub const REGISTRY_FILE: &str = "authorized_clients.json";
pub const BACKUP_DIR: &str = "backups";
pub const REVOKED_DIR: &str = "revoked";
pub const BACKUP_PREFIX: &str = "authorized_clients-";
pub const DEFAULT_MAX_BACKUPS: usize = 10;
pub const REGISTRY_FORMAT_VERSION: u32 = 1;

/// Revocation events buffered per subscriber before lagging
pub const REVOCATION_CHANNEL_CAPACITY: usize = 256;

/// How often the revoked/ directory is rescanned for out-of-process revocations
pub const REVOCATION_REFRESH_INTERVAL: Duration = Duration::from_secs(5);

/// Protocol limits
pub const MAX_PROMPT_SIZE: usize = 256 * 1024;
pub const MAX_CLIENT_ID_LEN: usize = 128;
pub const MAX_MODEL_NAME_LEN: usize = 256;

/// Connection rate limiting
pub const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);

/// Backend HTTP client
pub const BACKEND_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const BACKEND_LIST_TIMEOUT: Duration = Duration::from_secs(5);
