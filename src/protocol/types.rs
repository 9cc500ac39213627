// src/protocol/types.rs
//! Protocol message types for client-server communication.
//!
//! Every packet is a JSON object carried in a WebSocket text frame and
//! tagged by its `type` field.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type for protocol message handling
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("Invalid message format: {0}")]
    InvalidFormat(String),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid field value: {0}")]
    InvalidValue(String),

    #[error("Message too large")]
    MessageTooLarge,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Packet types for client-server communication
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PacketType {
    /// Opens the handshake
    Hello {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_version: Option<String>,
    },

    /// Challenge for authentication
    Challenge {
        /// Base64 challenge bytes to sign
        challenge: String,
        /// Deadline, milliseconds since epoch
        expires_at: u64,
    },

    /// Challenge response
    ChallengeResponse {
        client_id: String,
        /// Base64 Ed25519 signature over the raw challenge bytes
        signature: String,
    },

    /// Outcome of authentication
    AuthResult {
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// Liveness check
    Ping {
        timestamp: u64,
        sequence: u64,
    },

    /// Liveness answer
    Pong {
        echo_timestamp: u64,
        sequence: u64,
    },

    /// Start a generation
    GenerateRequest {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        prompt: String,
    },

    /// Cancel the active generation
    GenerateCancel,

    /// Streamed output
    GenerateChunk {
        content: String,
    },

    /// Generation finished
    GenerateDone {
        model: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        total_duration_ns: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        eval_count: Option<u64>,
    },

    /// Generation failed
    GenerateError {
        code: u16,
        message: String,
    },

    /// Generation cancelled at the client's request
    GenerateCancelled,

    /// Disconnect notification
    Disconnect {
        /// Reason code
        reason: u16,
        /// Human-readable message
        message: String,
    },

    /// Error notification
    Error {
        /// Error code
        code: u16,
        /// Human-readable message
        message: String,
    },
}

/// Disconnect reason codes
pub mod disconnect_reason {
    pub const USER_INITIATED: u16 = 0;
    pub const SERVER_SHUTDOWN: u16 = 2;
    pub const AUTHENTICATION_FAILED: u16 = 3;
    pub const PROTOCOL_VIOLATION: u16 = 4;
    pub const IDLE_TIMEOUT: u16 = 6;
    pub const ACCESS_REVOKED: u16 = 8;
}

/// Error codes
pub mod error_code {
    pub const GENERAL_ERROR: u16 = 1000;
    pub const AUTHENTICATION_FAILED: u16 = 1001;
    pub const INVALID_MESSAGE: u16 = 1002;
    pub const RATE_LIMITED: u16 = 1003;
    pub const UNAUTHORIZED: u16 = 1005;
    pub const INTERNAL_ERROR: u16 = 1006;
    pub const INVALID_STATE: u16 = 1008;
    pub const GENERATION_CONFLICT: u16 = 1010;
    pub const BACKEND_UNAVAILABLE: u16 = 1011;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_shape_is_tagged() {
        let packet = PacketType::ChallengeResponse {
            client_id: "alice".to_string(),
            signature: "c2ln".to_string(),
        };
        let value = serde_json::to_value(&packet).unwrap();
        assert_eq!(value["type"], "ChallengeResponse");
        assert_eq!(value["client_id"], "alice");
    }

    #[test]
    fn test_unit_variants() {
        let json = serde_json::to_string(&PacketType::GenerateCancel).unwrap();
        assert_eq!(json, r#"{"type":"GenerateCancel"}"#);

        let parsed: PacketType = serde_json::from_str(r#"{"type":"GenerateCancelled"}"#).unwrap();
        assert_eq!(parsed, PacketType::GenerateCancelled);
    }

    #[test]
    fn test_optional_fields_may_be_omitted() {
        let parsed: PacketType = serde_json::from_str(r#"{"type":"GenerateRequest","prompt":"hi"}"#).unwrap();
        assert_eq!(
            parsed,
            PacketType::GenerateRequest {
                model: None,
                prompt: "hi".to_string()
            }
        );

        let parsed: PacketType = serde_json::from_str(r#"{"type":"Hello"}"#).unwrap();
        assert_eq!(parsed, PacketType::Hello { client_version: None });

        let json = serde_json::to_string(&PacketType::AuthResult { ok: true, reason: None }).unwrap();
        assert!(!json.contains("reason"));
    }

    #[test]
    fn test_unknown_type_rejected() {
        assert!(serde_json::from_str::<PacketType>(r#"{"type":"IpAssign"}"#).is_err());
    }
}
