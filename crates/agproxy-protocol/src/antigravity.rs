//! The Antigravity internal-API envelope around the Gemini dialect.
//!
//! Requests go to `/v1internal:streamGenerateContent?alt=sse` (or the
//! non-stream sibling) wrapped as `{model, project, request}`; stream
//! chunks come back as `{response: {candidates, ...}}`.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::gemini::{GenerateContentRequest, GenerateContentResponse};

pub const DEFAULT_BASE_URL: &str = "https://daily-cloudcode-pa.sandbox.googleapis.com";
pub const OAUTH_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
pub const USER_AGENT: &str = "antigravity/1.15.8 (Windows; AMD64)";

pub const STREAM_GENERATE_PATH: &str = "/v1internal:streamGenerateContent?alt=sse";
pub const GENERATE_PATH: &str = "/v1internal:generateContent";
pub const FETCH_MODELS_PATH: &str = "/v1internal:fetchAvailableModels";

/// The documented bypass sentinel for replayed function calls whose real
/// thought signature is unrecoverable.
pub const SKIP_SIGNATURE_SENTINEL: &str = "skip_thought_signature_validator";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub model: String,
    pub project: String,
    pub request: GenerateContentRequest,
}

/// The system-prompt prologue the upstream requires on every request;
/// client system text rides after it.
pub const SYSTEM_PROLOGUE: &str = "You are Antigravity, a powerful agentic AI coding assistant designed by the Google Deepmind team working on Advanced Agentic Coding.You are pair programming with a USER to solve their coding task. The task may require creating a new codebase, modifying or debugging an existing codebase, or simply answering a question.**Absolute paths only****Proactiveness**";

/// One SSE `data:` payload. Newer servers wrap the response; older ones
/// put candidates at the top level, so both shapes deserialize.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StreamChunk {
    #[serde(default)]
    pub response: Option<GenerateContentResponse>,
    #[serde(flatten)]
    pub bare: GenerateContentResponse,
}

impl StreamChunk {
    pub fn into_response(self) -> GenerateContentResponse {
        match self.response {
            Some(response) if !response.candidates.is_empty() || response.usage_metadata.is_some() => {
                response
            }
            Some(response) if self.bare.candidates.is_empty() => response,
            _ => self.bare,
        }
    }
}

/// Non-stream responses carry the same wrapper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub response: GenerateContentResponse,
}

/// Per-model quota as reported by `fetchAvailableModels`.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelQuota {
    #[serde(default, alias = "percentage")]
    pub remaining_fraction: Option<f64>,
    #[serde(default)]
    pub reset_time: Option<String>,
    #[serde(default)]
    pub max_tokens: Option<u64>,
    #[serde(default)]
    pub max_output_tokens: Option<u64>,
}

impl ModelQuota {
    /// The reset time as an absolute instant, when present and parseable.
    pub fn reset_instant(&self) -> Option<time::OffsetDateTime> {
        let raw = self.reset_time.as_deref()?;
        time::OffsetDateTime::parse(raw, &time::format_description::well_known::Rfc3339).ok()
    }
}

/// `fetchAvailableModels` returns either `{models: {id → meta}}` or
/// `{models: [{id|name, …}]}` depending on server generation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AvailableModels {
    #[serde(default)]
    pub models: JsonValue,
}

impl AvailableModels {
    pub fn quotas(&self) -> Vec<(String, ModelQuota)> {
        let mut out = Vec::new();
        match &self.models {
            JsonValue::Object(map) => {
                for (id, meta) in map {
                    let quota: ModelQuota =
                        serde_json::from_value(meta.clone()).unwrap_or_default();
                    out.push((id.clone(), quota));
                }
            }
            JsonValue::Array(items) => {
                for item in items {
                    let id = item
                        .get("id")
                        .and_then(|v| v.as_str())
                        .or_else(|| item.get("name").and_then(|v| v.as_str()))
                        .or_else(|| item.as_str());
                    if let Some(id) = id {
                        let quota: ModelQuota =
                            serde_json::from_value(item.clone()).unwrap_or_default();
                        out.push((id.to_string(), quota));
                    }
                }
            }
            _ => {}
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out.dedup_by(|a, b| a.0 == b.0);
        out
    }

    pub fn model_ids(&self) -> Vec<String> {
        self.quotas().into_iter().map(|(id, _)| id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_chunk_unwraps_response_envelope() {
        let chunk: StreamChunk = serde_json::from_value(serde_json::json!({
            "response": {
                "candidates": [{"content": {"parts": [{"text": "hi"}], "role": "model"}}]
            }
        }))
        .unwrap();
        let response = chunk.into_response();
        assert_eq!(response.candidates.len(), 1);
    }

    #[test]
    fn stream_chunk_accepts_bare_candidates() {
        let chunk: StreamChunk = serde_json::from_value(serde_json::json!({
            "candidates": [{"content": {"parts": [{"text": "hi"}], "role": "model"}}]
        }))
        .unwrap();
        let response = chunk.into_response();
        assert_eq!(response.candidates.len(), 1);
    }

    #[test]
    fn quotas_read_both_payload_shapes() {
        let object_shape: AvailableModels = serde_json::from_value(serde_json::json!({
            "models": {
                "claude-sonnet-4-5": {"remainingFraction": 0.4, "resetTime": "2026-01-17T12:00:00Z"}
            }
        }))
        .unwrap();
        let quotas = object_shape.quotas();
        assert_eq!(quotas.len(), 1);
        assert_eq!(quotas[0].1.remaining_fraction, Some(0.4));

        let array_shape: AvailableModels = serde_json::from_value(serde_json::json!({
            "models": [{"id": "gemini-3-pro", "percentage": 1.0}]
        }))
        .unwrap();
        let quotas = array_shape.quotas();
        assert_eq!(quotas[0].0, "gemini-3-pro");
        assert_eq!(quotas[0].1.remaining_fraction, Some(1.0));
    }
}
