// src/protocol/validation.rs
//! Protocol message validation.
//!
//! This module provides functions for validating protocol messages
//! to ensure they conform to the expected format and constraints.

use crate::config::constants::{MAX_MODEL_NAME_LEN, MAX_PROMPT_SIZE};
use crate::protocol::types::{MessageError, PacketType};

/// Validate a generation request
fn validate_generate_request(model: Option<&str>, prompt: &str) -> Result<(), MessageError> {
    if prompt.is_empty() {
        return Err(MessageError::MissingField("prompt".to_string()));
    }

    if prompt.len() > MAX_PROMPT_SIZE {
        return Err(MessageError::MessageTooLarge);
    }

    if let Some(model) = model {
        if model.trim().is_empty() || model.len() > MAX_MODEL_NAME_LEN {
            return Err(MessageError::InvalidValue(format!(
                "Invalid model name length: {}",
                model.len()
            )));
        }
        if model.chars().any(|c| c.is_control()) {
            return Err(MessageError::InvalidValue("Model name contains control characters".to_string()));
        }
    }

    Ok(())
}

/// Validate a packet based on its type
pub fn validate_message(packet: &PacketType) -> Result<(), MessageError> {
    match packet {
        PacketType::Challenge { challenge, expires_at } => {
            if challenge.is_empty() {
                return Err(MessageError::MissingField("challenge".to_string()));
            }

            if *expires_at == 0 {
                return Err(MessageError::InvalidValue("expires_at cannot be zero".to_string()));
            }

            Ok(())
        }

        // Judged by the authenticator, so a malformed response still
        // consumes the challenge and gets an AuthResult
        PacketType::ChallengeResponse { .. } => Ok(()),

        PacketType::GenerateRequest { model, prompt } => validate_generate_request(model.as_deref(), prompt),

        PacketType::Hello { client_version: Some(version) } if version.len() > 64 => Err(
            MessageError::InvalidValue(format!("Invalid client version length: {}", version.len())),
        ),

        // The rest carry no constraints beyond their shape
        _ => Ok(()),
    }
}
