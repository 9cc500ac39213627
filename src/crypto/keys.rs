// src/crypto/keys.rs
//! Client key handling.
//!
//! Clients prove possession of an Ed25519 private key by signing the
//! server-issued challenge. Public keys and signatures travel as standard
//! base64 strings.

use ed25519_dalek::{Keypair, PublicKey, SecretKey, Signature, Signer};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::config::constants::{PUBLIC_KEY_SIZE, SIGNATURE_SIZE};

/// Error type for key-related operations
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("Invalid base64: {0}")]
    Encoding(#[from] base64::DecodeError),

    #[error("Invalid key data: {0}")]
    InvalidData(String),

    #[error("Signature verification failed")]
    SignatureVerification,
}

/// Generate cryptographically random challenge bytes
pub fn generate_challenge(size: usize) -> Vec<u8> {
    let mut challenge = vec![0u8; size];
    OsRng.fill_bytes(&mut challenge);
    challenge
}

/// Stable fingerprint of a challenge value, used for replay tracking
pub fn challenge_fingerprint(challenge: &[u8]) -> String {
    hex::encode(Sha256::digest(challenge))
}

/// Decode and validate a base64 Ed25519 public key
pub fn decode_public_key(encoded: &str) -> Result<PublicKey, KeyError> {
    let bytes = base64::decode(encoded.trim())?;
    if bytes.len() != PUBLIC_KEY_SIZE {
        return Err(KeyError::InvalidData(format!(
            "public key must be {} bytes, got {}",
            PUBLIC_KEY_SIZE,
            bytes.len()
        )));
    }
    PublicKey::from_bytes(&bytes).map_err(|e| KeyError::InvalidData(e.to_string()))
}

/// Decode a base64 Ed25519 signature
pub fn decode_signature(encoded: &str) -> Result<Signature, KeyError> {
    let bytes = base64::decode(encoded.trim())?;
    if bytes.len() != SIGNATURE_SIZE {
        return Err(KeyError::InvalidData(format!(
            "signature must be {} bytes, got {}",
            SIGNATURE_SIZE,
            bytes.len()
        )));
    }
    Signature::try_from(bytes.as_slice()).map_err(|e| KeyError::InvalidData(e.to_string()))
}

/// Verify a base64 signature over `message` with a base64 public key
pub fn verify_signature(public_key: &str, message: &[u8], signature: &str) -> Result<(), KeyError> {
    let public_key = decode_public_key(public_key)?;
    let signature = decode_signature(signature)?;
    public_key
        .verify_strict(message, &signature)
        .map_err(|_| KeyError::SignatureVerification)
}

/// A client keypair with base64 accessors, as handed out by `generate-keypair`
pub struct ClientKeypair {
    inner: Keypair,
}

impl ClientKeypair {
    /// Generate a fresh keypair from the OS RNG
    pub fn generate() -> Result<Self, KeyError> {
        let mut seed = [0u8; 32];
        OsRng.fill_bytes(&mut seed);
        Self::from_seed(&seed)
    }

    /// Rebuild a keypair from a base64 secret seed
    pub fn from_secret_base64(encoded: &str) -> Result<Self, KeyError> {
        let seed = base64::decode(encoded.trim())?;
        Self::from_seed(&seed)
    }

    fn from_seed(seed: &[u8]) -> Result<Self, KeyError> {
        let secret = SecretKey::from_bytes(seed).map_err(|e| KeyError::InvalidData(e.to_string()))?;
        let public = PublicKey::from(&secret);
        Ok(Self {
            inner: Keypair { secret, public },
        })
    }

    /// Base64 public key, as stored in the registry
    pub fn public_key_base64(&self) -> String {
        base64::encode(self.inner.public.as_bytes())
    }

    /// Base64 secret seed
    pub fn secret_base64(&self) -> String {
        base64::encode(self.inner.secret.as_bytes())
    }

    /// Sign a message, returning the base64 signature
    pub fn sign_base64(&self, message: &[u8]) -> String {
        base64::encode(self.inner.sign(message).to_bytes())
    }
}
