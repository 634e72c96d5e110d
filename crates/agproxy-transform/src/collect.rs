//! Auto-stream conversion: reassemble an upstream SSE stream into the
//! non-stream response shape, coalescing thinking blocks and collecting
//! tool calls, plus the signature-cache side effects shared by every
//! stream path.

use agproxy_pool::SignatureCache;
use agproxy_protocol::gemini::{
    Candidate, Content, ContentRole, FinishReason, GenerateContentResponse, Part, UsageMetadata,
};

/// Part-walking state machine: consecutive `thought: true` parts
/// coalesce into one thinking block (signature last-wins); text
/// accumulates into a single rolling buffer; function calls and unknown
/// parts are kept in arrival order.
#[derive(Debug, Default)]
pub struct StreamCollector {
    thinking_parts: Vec<Part>,
    current_thinking: String,
    current_signature: Option<String>,
    in_thinking: bool,
    text: String,
    function_calls: Vec<Part>,
    other_parts: Vec<Part>,
    finish_reason: Option<FinishReason>,
    usage: UsageMetadata,
    model_version: Option<String>,
    chunks_seen: usize,
}

impl StreamCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &GenerateContentResponse) {
        self.chunks_seen += 1;
        if let Some(usage) = &chunk.usage_metadata {
            self.usage.merge(usage);
        }
        if chunk.model_version.is_some() {
            self.model_version = chunk.model_version.clone();
        }

        let Some(candidate) = chunk.candidates.first() else {
            return;
        };
        if candidate.finish_reason.is_some() {
            self.finish_reason = candidate.finish_reason;
        }
        let Some(content) = &candidate.content else {
            return;
        };

        for part in &content.parts {
            if part.is_thought() {
                if !self.in_thinking {
                    self.in_thinking = true;
                    self.current_thinking.clear();
                    self.current_signature = None;
                }
                if let Some(text) = &part.text {
                    self.current_thinking.push_str(text);
                }
                if part.thought_signature.is_some() {
                    self.current_signature = part.thought_signature.clone();
                }
                continue;
            }

            // Any non-thought part closes the open thinking block.
            self.close_thinking_block();

            if let Some(text) = &part.text {
                self.text.push_str(text);
                continue;
            }
            if part.function_call.is_some() {
                self.function_calls.push(part.clone());
                continue;
            }
            self.other_parts.push(part.clone());
        }
    }

    fn close_thinking_block(&mut self) {
        if !self.in_thinking {
            return;
        }
        self.in_thinking = false;
        let part = Part {
            text: Some(std::mem::take(&mut self.current_thinking)),
            thought: Some(true),
            thought_signature: self.current_signature.take(),
            ..Part::default()
        };
        self.thinking_parts.push(part);
    }

    pub fn has_content(&self) -> bool {
        !self.text.is_empty()
            || !self.function_calls.is_empty()
            || !self.thinking_parts.is_empty()
            || self.in_thinking
            || !self.other_parts.is_empty()
    }

    pub fn chunks_seen(&self) -> usize {
        self.chunks_seen
    }

    /// Final ordering: thinking blocks, then the merged text part, then
    /// function calls, then everything else.
    pub fn finish(mut self) -> GenerateContentResponse {
        self.close_thinking_block();

        let mut parts = self.thinking_parts;
        if !self.text.is_empty() {
            parts.push(Part::text(self.text));
        }
        parts.extend(self.function_calls);
        parts.extend(self.other_parts);

        GenerateContentResponse {
            candidates: vec![Candidate {
                content: Some(Content {
                    role: Some(ContentRole::Model),
                    parts,
                }),
                finish_reason: Some(self.finish_reason.unwrap_or(FinishReason::Stop)),
                index: Some(0),
            }],
            usage_metadata: (!self.usage.is_empty()).then_some(self.usage),
            model_version: self.model_version,
            response_id: None,
        }
    }
}

/// Signature-cache side effects, applied on every stream path: completed
/// thinking blocks land in the text-keyed table; function calls land in
/// the tool-id table under their own signature or, failing that, the most
/// recent in-stream thinking signature.
#[derive(Debug, Default)]
pub struct SignatureRecorder {
    current_thinking: String,
    current_signature: Option<String>,
    in_thinking: bool,
    last_stream_signature: Option<String>,
}

impl SignatureRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, chunk: &GenerateContentResponse, cache: &SignatureCache) {
        let Some(candidate) = chunk.candidates.first() else {
            return;
        };
        let Some(content) = &candidate.content else {
            return;
        };
        for part in &content.parts {
            if part.is_thought() {
                if !self.in_thinking {
                    self.in_thinking = true;
                    self.current_thinking.clear();
                    self.current_signature = None;
                }
                if let Some(text) = &part.text {
                    self.current_thinking.push_str(text);
                }
                if let Some(signature) = &part.thought_signature {
                    self.current_signature = Some(signature.clone());
                    self.last_stream_signature = Some(signature.clone());
                }
                continue;
            }

            self.flush_thinking(cache);

            if let Some(call) = &part.function_call
                && let Some(id) = &call.id
            {
                let signature = part
                    .thought_signature
                    .clone()
                    .or_else(|| self.last_stream_signature.clone());
                if let Some(signature) = signature {
                    cache.put_tool(id, &signature);
                }
            }
        }
    }

    pub fn finish(&mut self, cache: &SignatureCache) {
        self.flush_thinking(cache);
    }

    fn flush_thinking(&mut self, cache: &SignatureCache) {
        if !self.in_thinking {
            return;
        }
        self.in_thinking = false;
        if let Some(signature) = self.current_signature.take()
            && !self.current_thinking.is_empty()
        {
            cache.put(&self.current_thinking, &signature);
        }
        self.current_thinking.clear();
    }
}
