// src/config/mod.rs
//! Configuration module for the inference gateway.
//!
//! This module manages server settings, constants, and default configurations.

pub mod constants;
pub mod defaults;
pub mod settings;

pub use settings::{Command, ConfigError, ServerArgs, ServerConfig};
