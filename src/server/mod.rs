// src/server/mod.rs
//! Server module for the inference gateway.
//!
//! This module contains the server implementation, connection handling
//! and session management.

pub mod client;
pub mod core;
pub mod session;

// Re-export commonly used items
pub use client::handle_client;
pub use core::{GatewayServer, ServerError, ServerState};
pub use session::{ClientSession, ConnectionId, SessionManager};
