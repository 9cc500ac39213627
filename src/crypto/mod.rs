// src/crypto/mod.rs
//! Cryptographic helpers for the inference gateway.

pub mod keys;

pub use keys::{
    challenge_fingerprint, generate_challenge, verify_signature, ClientKeypair, KeyError,
};
