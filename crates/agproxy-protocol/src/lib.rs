//! Wire types for the three client-facing dialects and the Antigravity
//! upstream envelope.
//!
//! This crate is serde DTOs plus a small amount of pure helper logic
//! (SSE line parsing, model-name normalization). No IO, no async.

pub mod antigravity;
pub mod bridge;
pub mod claude;
pub mod gemini;
pub mod models;
pub mod openai;
pub mod sse;
