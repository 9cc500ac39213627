// src/protocol/serialization.rs
//! Protocol message serialization and deserialization.
//!
//! This module provides functions for serializing and deserializing
//! protocol messages with proper error handling and validation.

use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, trace, warn};

use crate::protocol::types::{MessageError, PacketType};
use crate::protocol::validation::validate_message;
use crate::utils::security::StringValidator;

/// Maximum allowed message size (1MB)
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Serialize a packet to a JSON string
pub fn serialize_packet(packet: &PacketType) -> Result<String, MessageError> {
    validate_message(packet)?;

    let json = serde_json::to_string(packet)?;

    if json.len() > MAX_MESSAGE_SIZE {
        return Err(MessageError::MessageTooLarge);
    }

    trace!("Serialized {} packet, size: {} bytes", get_packet_type_name(packet), json.len());

    Ok(json)
}

/// Serialize a packet to a WebSocket message
pub fn packet_to_ws_message(packet: &PacketType) -> Result<WsMessage, MessageError> {
    let json = serialize_packet(packet)?;
    Ok(WsMessage::Text(json))
}

/// Deserialize a JSON string to a packet
pub fn deserialize_packet(json: &str) -> Result<PacketType, MessageError> {
    if json.len() > MAX_MESSAGE_SIZE {
        return Err(MessageError::MessageTooLarge);
    }

    let packet: PacketType = serde_json::from_str(json)?;

    validate_message(&packet)?;

    trace!("Deserialized {} packet, size: {} bytes", get_packet_type_name(&packet), json.len());

    Ok(packet)
}

/// Parse a WebSocket message to a packet
pub fn ws_message_to_packet(message: &WsMessage) -> Result<PacketType, MessageError> {
    match message {
        WsMessage::Text(text) => deserialize_packet(text),
        WsMessage::Binary(_) => Err(MessageError::InvalidFormat("Binary messages not supported".into())),
        _ => Err(MessageError::InvalidFormat("Unsupported message type".into())),
    }
}

/// Create a standard error packet
pub fn create_error_packet(code: u16, message: &str) -> PacketType {
    PacketType::Error {
        code,
        message: message.to_string(),
    }
}

/// Create a disconnect packet
pub fn create_disconnect_packet(reason: u16, message: &str) -> PacketType {
    PacketType::Disconnect {
        reason,
        message: message.to_string(),
    }
}

/// Get the name of a packet type for logging
pub fn get_packet_type_name(packet: &PacketType) -> &'static str {
    match packet {
        PacketType::Hello { .. } => "Hello",
        PacketType::Challenge { .. } => "Challenge",
        PacketType::ChallengeResponse { .. } => "ChallengeResponse",
        PacketType::AuthResult { .. } => "AuthResult",
        PacketType::Ping { .. } => "Ping",
        PacketType::Pong { .. } => "Pong",
        PacketType::GenerateRequest { .. } => "GenerateRequest",
        PacketType::GenerateCancel => "GenerateCancel",
        PacketType::GenerateChunk { .. } => "GenerateChunk",
        PacketType::GenerateDone { .. } => "GenerateDone",
        PacketType::GenerateError { .. } => "GenerateError",
        PacketType::GenerateCancelled => "GenerateCancelled",
        PacketType::Disconnect { .. } => "Disconnect",
        PacketType::Error { .. } => "Error",
    }
}

/// Log packet information (non-sensitive parts only)
pub fn log_packet_info(packet: &PacketType, is_incoming: bool) {
    let direction = if is_incoming { "Received" } else { "Sending" };

    match packet {
        PacketType::Hello { client_version } => {
            debug!("{} Hello packet, client version: {:?}", direction, client_version);
        }
        PacketType::Challenge { expires_at, .. } => {
            debug!("{} Challenge packet, expires: {}", direction, expires_at);
        }
        PacketType::ChallengeResponse { client_id, .. } => {
            debug!(
                "{} ChallengeResponse packet for client {}",
                direction,
                StringValidator::sanitize_log(client_id)
            );
        }
        PacketType::AuthResult { ok, reason } => {
            debug!("{} AuthResult packet, ok: {}, reason: {:?}", direction, ok, reason);
        }
        PacketType::Ping { sequence, .. } => {
            trace!("{} Ping packet, sequence: {}", direction, sequence);
        }
        PacketType::Pong { sequence, .. } => {
            trace!("{} Pong packet, sequence: {}", direction, sequence);
        }
        PacketType::GenerateRequest { model, prompt } => {
            debug!(
                "{} GenerateRequest packet, model: {:?}, prompt: {} bytes",
                direction,
                model,
                prompt.len()
            );
        }
        PacketType::GenerateChunk { content } => {
            trace!("{} GenerateChunk packet, {} bytes", direction, content.len());
        }
        PacketType::GenerateDone { model, eval_count, .. } => {
            debug!("{} GenerateDone packet, model: {}, tokens: {:?}", direction, model, eval_count);
        }
        PacketType::GenerateError { code, message } => {
            warn!("{} GenerateError packet, code: {}, message: {}", direction, code, message);
        }
        PacketType::GenerateCancel | PacketType::GenerateCancelled => {
            debug!("{} {} packet", direction, get_packet_type_name(packet));
        }
        PacketType::Disconnect { reason, message } => {
            debug!("{} Disconnect packet, reason: {}, message: {}", direction, reason, message);
        }
        PacketType::Error { code, message } => {
            warn!("{} Error packet, code: {}, message: {}", direction, code, message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_to_ws_message() {
        let packet = PacketType::Ping {
            timestamp: 123456789,
            sequence: 42,
        };

        match packet_to_ws_message(&packet).unwrap() {
            WsMessage::Text(text) => {
                assert!(serde_json::from_str::<serde_json::Value>(&text).is_ok());
            }
            _ => panic!("Wrong message type"),
        }
    }

    #[test]
    fn test_ws_message_to_packet() {
        let json = r#"{"type":"Pong","echo_timestamp":123456789,"sequence":42}"#;
        let packet = ws_message_to_packet(&WsMessage::Text(json.to_string())).unwrap();
        assert_eq!(
            packet,
            PacketType::Pong {
                echo_timestamp: 123456789,
                sequence: 42
            }
        );

        let binary = WsMessage::Binary(vec![1, 2, 3]);
        assert!(matches!(ws_message_to_packet(&binary), Err(MessageError::InvalidFormat(_))));
    }

    #[test]
    fn test_malformed_json() {
        assert!(matches!(deserialize_packet("{oops"), Err(MessageError::Serialization(_))));
    }

    #[test]
    fn test_oversized_message() {
        let json = "x".repeat(MAX_MESSAGE_SIZE + 1);
        assert!(matches!(deserialize_packet(&json), Err(MessageError::MessageTooLarge)));
    }

    #[test]
    fn test_malformed_challenge_response_is_delivered() {
        let json = r#"{"type":"ChallengeResponse","client_id":"mal lory","signature":""}"#;
        assert_eq!(
            deserialize_packet(json).unwrap(),
            PacketType::ChallengeResponse {
                client_id: "mal lory".to_string(),
                signature: String::new(),
            }
        );
    }

    #[test]
    fn test_validation_applies_on_receive() {
        let json = r#"{"type":"GenerateRequest","prompt":""}"#;
        assert!(matches!(deserialize_packet(json), Err(MessageError::MissingField(_))));
    }

    #[test]
    fn test_helper_packets() {
        assert_eq!(
            create_error_packet(1001, "Test error"),
            PacketType::Error {
                code: 1001,
                message: "Test error".to_string()
            }
        );
        assert_eq!(
            create_disconnect_packet(2, "Goodbye"),
            PacketType::Disconnect {
                reason: 2,
                message: "Goodbye".to_string()
            }
        );
        assert_eq!(get_packet_type_name(&PacketType::GenerateCancel), "GenerateCancel");
    }
}
