// src/config/defaults.rs
//! Default configurations for the inference gateway.
//!
//! This module provides sensible default values for configuration settings
//! when not explicitly specified by the user.

/// Default server listening port
pub const DEFAULT_PORT: u16 = 3000;

/// Default server listening address
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Default inference backend base URL
pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";

/// Default model used when a request names none
pub const DEFAULT_MODEL: &str = "llama2";

/// Default log level
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Default data directory holding the client registry
pub const DEFAULT_DATA_DIR: &str = "./data";

/// Default maximum connections per IP within one rate-limit window
pub const DEFAULT_MAX_CONNECTIONS_PER_IP: usize = 10;

/// Default revocation reason recorded by the admin CLI
pub const DEFAULT_REVOCATION_REASON: &str = "revoked by operator";
