// src/protocol/mod.rs
//! Protocol module for the inference gateway.
//!
//! This module defines the protocol messages and types used for
//! client-server communication.

pub mod serialization;
pub mod types;
pub mod validation;

// Re-export commonly used items
pub use types::{disconnect_reason, error_code, MessageError, PacketType};
