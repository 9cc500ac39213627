// src/auth/mod.rs
//! Authentication module for the inference gateway.
//!
//! This module provides the authorized client registry and the
//! challenge-response authentication of client connections.

pub mod backup;
pub mod challenge;
pub mod registry;
pub mod revocation;

// Re-export commonly used items
pub use challenge::{AuthRejection, AuthenticatedIdentity, ChallengeAuthenticator, ChallengeError};
pub use registry::{ClientIdentity, ClientRegistry, LoadReport, LoadSource, RegistryError};
pub use revocation::RevocationRecord;
