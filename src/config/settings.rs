// src/config/settings.rs
//! Server configuration settings.
//!
//! This module contains the command line surface and the immutable
//! `ServerConfig` handed to every component at construction, together with
//! loading, merging and validation of user-provided settings.

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::config::constants::{AUTH_TIMEOUT, DEFAULT_MAX_BACKUPS, PING_INTERVAL};
use crate::config::defaults;

/// Error type for configuration-related operations
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid backend URL: {0}")]
    InvalidUrl(String),
}

/// Administrative subcommands operating on the registry in the data directory
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Register a new authorized client
    AddClient {
        /// Stable client identifier
        #[clap(long)]
        client_id: String,

        /// Base64-encoded Ed25519 public key
        #[clap(long)]
        public_key: String,

        /// Optional human-readable label
        #[clap(long)]
        label: Option<String>,
    },

    /// Permanently revoke an authorized client
    RevokeClient {
        /// Client identifier to revoke
        #[clap(long)]
        client_id: String,

        /// Reason stored in the revocation record
        #[clap(long, default_value = defaults::DEFAULT_REVOCATION_REASON)]
        reason: String,
    },

    /// List registered clients and their revocation status
    ListClients,

    /// Generate a fresh Ed25519 keypair for a client
    GenerateKeypair,
}

/// Command line arguments for the gateway
#[derive(Parser, Debug, Clone)]
#[clap(
    name = "AeroNyx Inference Gateway",
    about = "Authenticated WebSocket gateway in front of a local model backend",
    version,
    author,
    args_conflicts_with_subcommands = true
)]
pub struct ServerArgs {
    /// Address to listen on
    #[clap(long)]
    pub host: Option<String>,

    /// Port to listen on
    #[clap(long)]
    pub port: Option<u16>,

    /// Inference backend base URL
    #[clap(long)]
    pub ollama_url: Option<String>,

    /// Model used when a request does not name one
    #[clap(long)]
    pub default_model: Option<String>,

    /// Maximum number of rotated registry backups to keep
    #[clap(long)]
    pub max_backups: Option<usize>,

    /// Maximum new connections per IP within the rate-limit window
    #[clap(long)]
    pub max_connections_per_ip: Option<usize>,

    /// JSON configuration file; explicit flags override its values
    #[clap(long)]
    pub config_file: Option<String>,

    /// Data directory holding the client registry
    #[clap(long, global = true)]
    pub data_dir: Option<String>,

    /// Log level
    #[clap(long, default_value = defaults::DEFAULT_LOG_LEVEL, global = true)]
    pub log_level: String,

    /// Optional log file (rotated daily)
    #[clap(long, global = true)]
    pub log_file: Option<String>,

    /// Administrative subcommand; serve when absent
    #[clap(subcommand)]
    pub command: Option<Command>,
}

/// Server configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen host
    pub host: String,

    /// Listen port (0 picks an ephemeral port)
    pub port: u16,

    /// Inference backend base URL
    pub ollama_url: String,

    /// Model used when a request does not name one
    pub default_model: String,

    /// Data directory
    pub data_dir: PathBuf,

    /// Maximum number of rotated registry backups
    pub max_backups: usize,

    /// Maximum new connections per IP per rate-limit window
    pub max_connections_per_ip: usize,

    /// Authentication window after challenge issuance, in milliseconds
    pub auth_timeout_ms: u64,

    /// Liveness ping cadence, in milliseconds
    pub ping_interval_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: defaults::DEFAULT_HOST.to_string(),
            port: defaults::DEFAULT_PORT,
            ollama_url: defaults::DEFAULT_OLLAMA_URL.to_string(),
            default_model: defaults::DEFAULT_MODEL.to_string(),
            data_dir: PathBuf::from(defaults::DEFAULT_DATA_DIR),
            max_backups: DEFAULT_MAX_BACKUPS,
            max_connections_per_ip: defaults::DEFAULT_MAX_CONNECTIONS_PER_IP,
            auth_timeout_ms: AUTH_TIMEOUT.as_millis() as u64,
            ping_interval_ms: PING_INTERVAL.as_millis() as u64,
        }
    }
}

impl ServerConfig {
    /// Build the configuration from command line arguments, layering explicit
    /// flags over an optional configuration file over the defaults.
    pub fn from_args(args: &ServerArgs) -> Result<Self, ConfigError> {
        let mut config = match &args.config_file {
            Some(path) => {
                info!("Loading configuration from {}", path);
                Self::read_file(Path::new(path))?
            }
            None => Self::default(),
        };

        if let Some(host) = &args.host {
            config.host = host.clone();
        }
        if let Some(port) = args.port {
            config.port = port;
        }
        if let Some(url) = &args.ollama_url {
            config.ollama_url = url.clone();
        }
        if let Some(model) = &args.default_model {
            config.default_model = model.clone();
        }
        if let Some(max_backups) = args.max_backups {
            config.max_backups = max_backups;
        }
        if let Some(max_connections) = args.max_connections_per_ip {
            config.max_connections_per_ip = max_connections;
        }
        if let Some(data_dir) = &args.data_dir {
            config.data_dir = PathBuf::from(data_dir);
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration settings
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::Invalid("Listen host must not be empty".to_string()));
        }

        let url = reqwest::Url::parse(&self.ollama_url)
            .map_err(|e| ConfigError::InvalidUrl(format!("{}: {}", self.ollama_url, e)))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(ConfigError::InvalidUrl(format!(
                "{}: scheme must be http or https",
                self.ollama_url
            )));
        }

        if self.default_model.trim().is_empty() {
            return Err(ConfigError::Invalid("Default model must not be empty".to_string()));
        }

        if self.max_backups == 0 {
            return Err(ConfigError::Invalid(
                "At least one registry backup must be retained".to_string(),
            ));
        }

        if self.max_connections_per_ip == 0 {
            return Err(ConfigError::Invalid(
                "Connection limit per IP must be at least 1".to_string(),
            ));
        }

        if self.auth_timeout_ms == 0 || self.ping_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "Authentication timeout and ping interval must be non-zero".to_string(),
            ));
        }

        Ok(())
    }

    /// Authentication window after challenge issuance
    pub fn auth_timeout(&self) -> Duration {
        Duration::from_millis(self.auth_timeout_ms)
    }

    /// Liveness ping cadence
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    /// `host:port` string suitable for binding
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Save configuration to a file
    pub fn save_to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Load and validate configuration from a file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let config = Self::read_file(path)?;
        config.validate()?;
        Ok(config)
    }

    fn read_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use test_case::test_case;

    fn args(extra: &[&str]) -> ServerArgs {
        let mut argv = vec!["aeronyx-inference-gateway"];
        argv.extend_from_slice(extra);
        ServerArgs::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_defaults_match_documented_values() {
        let config = ServerConfig::from_args(&args(&[])).unwrap();
        assert_eq!(config.port, 3000);
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.ollama_url, "http://localhost:11434");
        assert_eq!(config.default_model, "llama2");
        assert_eq!(config.max_backups, 10);
        assert_eq!(config.auth_timeout(), Duration::from_millis(30_000));
        assert_eq!(config.ping_interval(), Duration::from_millis(30_000));
    }

    #[test]
    fn test_flags_override_config_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gateway.json");
        let mut file_config = ServerConfig::default();
        file_config.port = 4000;
        file_config.default_model = "mistral".to_string();
        file_config.save_to_file(&path).unwrap();

        let config = ServerConfig::from_args(&args(&[
            "--config-file",
            path.to_str().unwrap(),
            "--port",
            "5000",
        ]))
        .unwrap();

        assert_eq!(config.port, 5000);
        assert_eq!(config.default_model, "mistral");
    }

    #[test]
    fn test_partial_config_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("partial.json");
        fs::write(&path, r#"{"default_model": "phi"}"#).unwrap();

        let config = ServerConfig::load_from_file(&path).unwrap();
        assert_eq!(config.default_model, "phi");
        assert_eq!(config.port, defaults::DEFAULT_PORT);
    }

    #[test]
    fn test_admin_subcommand_parsing() {
        let parsed = args(&["--data-dir", "/tmp/x", "revoke-client", "--client-id", "alice"]);
        match parsed.command {
            Some(Command::RevokeClient { client_id, reason }) => {
                assert_eq!(client_id, "alice");
                assert_eq!(reason, defaults::DEFAULT_REVOCATION_REASON);
            }
            other => panic!("unexpected command: {:?}", other),
        }
        assert_eq!(parsed.data_dir.as_deref(), Some("/tmp/x"));
    }

    #[test_case("ftp://localhost:11434" ; "non http scheme")]
    #[test_case("not a url" ; "unparseable")]
    fn test_rejects_bad_backend_url(url: &str) {
        let config = ServerConfig {
            ollama_url: url.to_string(),
            ..ServerConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::InvalidUrl(_))));
    }

    #[test_case(|c: &mut ServerConfig| c.max_backups = 0 ; "zero backups")]
    #[test_case(|c: &mut ServerConfig| c.default_model = " ".to_string() ; "blank model")]
    #[test_case(|c: &mut ServerConfig| c.host.clear() ; "empty host")]
    #[test_case(|c: &mut ServerConfig| c.auth_timeout_ms = 0 ; "zero auth timeout")]
    fn test_rejects_invalid_values(mutate: fn(&mut ServerConfig)) {
        let mut config = ServerConfig::default();
        mutate(&mut config);
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
