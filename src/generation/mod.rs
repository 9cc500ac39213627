// src/generation/mod.rs
//! Generation relay.
//!
//! Streams model output from an inference backend to the requesting session
//! and guarantees each generation ends with exactly one terminal packet.

pub mod backend;
pub mod tracker;

pub use backend::{BackendError, ChunkSink, GenerationRequest, GenerationSummary, InferenceBackend, OllamaBackend};
pub use tracker::{GenerationError, GenerationHandle, GenerationOutcome, GenerationState, GenerationTracker};
