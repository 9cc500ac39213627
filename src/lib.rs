// Export all modules for public use
pub mod auth;
pub mod config;
pub mod crypto;
pub mod generation;
pub mod protocol;
pub mod server;
pub mod utils;

// Re-export the most commonly used items for convenience
pub use crate::auth::{ClientIdentity, ClientRegistry};
pub use crate::config::{ServerArgs, ServerConfig};
pub use crate::generation::{InferenceBackend, OllamaBackend};
pub use crate::protocol::PacketType;
pub use crate::server::{GatewayServer, ServerError};
