//! Upstream chunks → OpenAI `chat.completion.chunk` SSE stream.

use agproxy_protocol::gemini::{FinishReason, GenerateContentResponse, UsageMetadata};
use agproxy_protocol::openai::{
    ChatCompletionChunk, ChunkChoice, Delta, DeltaToolCall, FunctionCallSpec,
};

use crate::openai::usage_from_metadata;

pub struct OpenAiStream {
    id: String,
    created: i64,
    model: String,
    return_thoughts: bool,
    sent_role: bool,
    tool_index: u32,
    saw_tool_call: bool,
    finish_reason: Option<FinishReason>,
    usage: UsageMetadata,
}

impl OpenAiStream {
    pub fn new(model: &str, return_thoughts: bool) -> Self {
        Self {
            id: format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
            created: time::OffsetDateTime::now_utc().unix_timestamp(),
            model: model.to_string(),
            return_thoughts,
            sent_role: false,
            tool_index: 0,
            saw_tool_call: false,
            finish_reason: None,
            usage: UsageMetadata::default(),
        }
    }

    fn chunk_with(&self, delta: Delta, finish_reason: Option<String>) -> ChatCompletionChunk {
        ChatCompletionChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason,
            }],
            usage: None,
        }
    }

    pub fn on_chunk(&mut self, upstream: &GenerateContentResponse) -> Vec<ChatCompletionChunk> {
        if let Some(usage) = &upstream.usage_metadata {
            self.usage.merge(usage);
        }
        let mut out = Vec::new();
        let Some(candidate) = upstream.candidates.first() else {
            return out;
        };
        if candidate.finish_reason.is_some() {
            self.finish_reason = candidate.finish_reason;
        }

        let role = if self.sent_role {
            None
        } else {
            self.sent_role = true;
            Some("assistant".to_string())
        };
        let mut role = role;

        if let Some(content) = &candidate.content {
            for part in &content.parts {
                if part.is_thought() {
                    if self.return_thoughts
                        && let Some(text) = &part.text
                        && !text.is_empty()
                    {
                        out.push(self.chunk_with(
                            Delta {
                                role: role.take(),
                                reasoning_content: Some(text.clone()),
                                ..Delta::default()
                            },
                            None,
                        ));
                    }
                    continue;
                }
                if let Some(text) = &part.text {
                    if text.is_empty() {
                        continue;
                    }
                    out.push(self.chunk_with(
                        Delta {
                            role: role.take(),
                            content: Some(text.clone()),
                            ..Delta::default()
                        },
                        None,
                    ));
                    continue;
                }
                if let Some(call) = &part.function_call {
                    self.saw_tool_call = true;
                    let index = self.tool_index;
                    self.tool_index += 1;
                    out.push(self.chunk_with(
                        Delta {
                            role: role.take(),
                            tool_calls: Some(vec![DeltaToolCall {
                                index,
                                id: Some(call.id.clone().unwrap_or_else(|| {
                                    format!("call_{}", uuid::Uuid::new_v4().simple())
                                })),
                                kind: Some("function".to_string()),
                                function: FunctionCallSpec {
                                    name: call.name.clone(),
                                    arguments: call
                                        .args
                                        .as_ref()
                                        .map(|args| args.to_string())
                                        .unwrap_or_else(|| "{}".to_string()),
                                },
                            }]),
                            ..Delta::default()
                        },
                        None,
                    ));
                }
            }
        }
        out
    }

    /// Terminal chunk with the mapped finish reason and merged usage.
    pub fn finish(&mut self) -> ChatCompletionChunk {
        let finish_reason = if self.saw_tool_call {
            "tool_calls"
        } else {
            match self.finish_reason {
                Some(FinishReason::MaxTokens) => "length",
                Some(FinishReason::Safety) | Some(FinishReason::Recitation) => "content_filter",
                _ => "stop",
            }
        };
        let mut chunk = self.chunk_with(Delta::default(), Some(finish_reason.to_string()));
        if !self.usage.is_empty() {
            chunk.usage = Some(usage_from_metadata(&self.usage));
        }
        chunk
    }
}

pub fn encode_sse(chunk: &ChatCompletionChunk) -> String {
    let json = serde_json::to_string(chunk).unwrap_or_else(|_| "{}".to_string());
    format!("data: {json}\n\n")
}

pub const DONE_FRAME: &str = "data: [DONE]\n\n";

#[cfg(test)]
mod tests {
    use super::*;
    use agproxy_protocol::gemini::{Candidate, Content, ContentRole, Part};

    fn upstream(parts: Vec<Part>, finish: Option<FinishReason>) -> GenerateContentResponse {
        GenerateContentResponse {
            candidates: vec![Candidate {
                content: Some(Content {
                    role: Some(ContentRole::Model),
                    parts,
                }),
                finish_reason: finish,
                index: Some(0),
            }],
            ..GenerateContentResponse::default()
        }
    }

    #[test]
    fn role_rides_only_the_first_delta() {
        let mut stream = OpenAiStream::new("claude-sonnet-4-5", true);
        let first = stream.on_chunk(&upstream(vec![Part::text("a")], None));
        let second = stream.on_chunk(&upstream(vec![Part::text("b")], None));
        assert_eq!(first[0].choices[0].delta.role.as_deref(), Some("assistant"));
        assert!(second[0].choices[0].delta.role.is_none());
    }

    #[test]
    fn thoughts_are_filtered_when_disabled() {
        let mut stream = OpenAiStream::new("claude-sonnet-4-5", false);
        let chunks = stream.on_chunk(&upstream(
            vec![Part::thinking("hidden", None), Part::text("shown")],
            None,
        ));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].choices[0].delta.content.as_deref(), Some("shown"));
    }

    #[test]
    fn tool_call_ends_with_tool_calls_reason() {
        let mut stream = OpenAiStream::new("claude-sonnet-4-5", true);
        stream.on_chunk(&upstream(
            vec![Part {
                function_call: Some(agproxy_protocol::gemini::FunctionCall {
                    id: Some("call_1".to_string()),
                    name: "lookup".to_string(),
                    args: Some(serde_json::json!({"q": 2})),
                }),
                ..Part::default()
            }],
            Some(FinishReason::Stop),
        ));
        let last = stream.finish();
        assert_eq!(
            last.choices[0].finish_reason.as_deref(),
            Some("tool_calls")
        );
    }

    #[test]
    fn sse_encoding_is_data_framed() {
        let mut stream = OpenAiStream::new("m", true);
        let chunks = stream.on_chunk(&upstream(vec![Part::text("x")], None));
        let frame = encode_sse(&chunks[0]);
        assert!(frame.starts_with("data: {"));
        assert!(frame.ends_with("\n\n"));
    }
}
