//! Protocol translation between the client dialects and the Antigravity
//! upstream shape, plus the streaming reassembly engine.
//!
//! Everything here is pure with respect to IO: translators take typed
//! requests and return typed requests; the stream states consume parsed
//! chunks and emit serialized events. The only shared mutable state they
//! touch is the signature cache.

pub mod claude;
pub mod collect;
pub mod context;
pub mod gemini;
pub mod ndjson;
pub mod openai;
pub mod sanitize;
pub mod schema;
pub mod signature;
pub mod stream_claude;
pub mod stream_openai;

#[derive(Debug, Clone)]
pub struct TranslateError(pub String);

impl std::fmt::Display for TranslateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for TranslateError {}

/// Knobs the translators read from the effective config.
#[derive(Debug, Clone)]
pub struct TranslateOptions {
    /// Collapse system messages into the first user turn instead of
    /// sending a `systemInstruction`.
    pub compatibility_mode: bool,
    /// Emit thinking parts to the client.
    pub return_thoughts: bool,
}

impl Default for TranslateOptions {
    fn default() -> Self {
        Self {
            compatibility_mode: true,
            return_thoughts: true,
        }
    }
}
