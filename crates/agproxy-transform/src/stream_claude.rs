//! Upstream chunks → Anthropic SSE event sequence.
//!
//! Event order per message: `message_start`, then per content block
//! `content_block_start` / `content_block_delta`* / `content_block_stop`,
//! then `message_delta` (stop reason + usage) and `message_stop`.

use agproxy_protocol::claude::{
    BlockDelta, ContentBlock, MessageDelta, MessagesResponse, StreamEvent, Usage,
};
use agproxy_protocol::gemini::{FinishReason, GenerateContentResponse, UsageMetadata};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenBlock {
    Thinking,
    Text,
    ToolUse,
}

pub struct ClaudeStream {
    model: String,
    message_id: String,
    return_thoughts: bool,
    started: bool,
    next_index: u32,
    open: Option<OpenBlock>,
    pending_signature: Option<String>,
    saw_tool_use: bool,
    finish_reason: Option<FinishReason>,
    usage: UsageMetadata,
}

impl ClaudeStream {
    pub fn new(model: &str, return_thoughts: bool) -> Self {
        Self {
            model: model.to_string(),
            message_id: format!("msg_{}", uuid::Uuid::new_v4().simple()),
            return_thoughts,
            started: false,
            next_index: 0,
            open: None,
            pending_signature: None,
            saw_tool_use: false,
            finish_reason: None,
            usage: UsageMetadata::default(),
        }
    }

    fn current_index(&self) -> u32 {
        self.next_index.saturating_sub(1)
    }

    fn ensure_started(&mut self, out: &mut Vec<StreamEvent>) {
        if self.started {
            return;
        }
        self.started = true;
        out.push(StreamEvent::MessageStart {
            message: MessagesResponse {
                id: self.message_id.clone(),
                kind: "message".to_string(),
                role: "assistant".to_string(),
                model: self.model.clone(),
                content: Vec::new(),
                stop_reason: None,
                stop_sequence: None,
                usage: Usage::default(),
            },
        });
    }

    fn close_block(&mut self, out: &mut Vec<StreamEvent>) {
        let Some(open) = self.open.take() else {
            return;
        };
        if open == OpenBlock::Thinking
            && let Some(signature) = self.pending_signature.take()
        {
            out.push(StreamEvent::ContentBlockDelta {
                index: self.current_index(),
                delta: BlockDelta::SignatureDelta { signature },
            });
        }
        out.push(StreamEvent::ContentBlockStop {
            index: self.current_index(),
        });
    }

    fn open_block(&mut self, kind: OpenBlock, block: ContentBlock, out: &mut Vec<StreamEvent>) {
        self.close_block(out);
        out.push(StreamEvent::ContentBlockStart {
            index: self.next_index,
            content_block: block,
        });
        self.next_index += 1;
        self.open = Some(kind);
    }

    pub fn on_chunk(&mut self, upstream: &GenerateContentResponse) -> Vec<StreamEvent> {
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
        let Some(content) = &candidate.content else {
            return out;
        };

        for part in &content.parts {
            if part.is_thought() {
                if !self.return_thoughts {
                    continue;
                }
                self.ensure_started(&mut out);
                if self.open != Some(OpenBlock::Thinking) {
                    self.open_block(
                        OpenBlock::Thinking,
                        ContentBlock::Thinking {
                            thinking: String::new(),
                            signature: None,
                        },
                        &mut out,
                    );
                }
                if let Some(text) = &part.text
                    && !text.is_empty()
                {
                    out.push(StreamEvent::ContentBlockDelta {
                        index: self.current_index(),
                        delta: BlockDelta::ThinkingDelta {
                            thinking: text.clone(),
                        },
                    });
                }
                if part.thought_signature.is_some() {
                    self.pending_signature = part.thought_signature.clone();
                }
                continue;
            }

            if let Some(text) = &part.text {
                if text.is_empty() {
                    continue;
                }
                self.ensure_started(&mut out);
                if self.open != Some(OpenBlock::Text) {
                    self.open_block(
                        OpenBlock::Text,
                        ContentBlock::Text {
                            text: String::new(),
                        },
                        &mut out,
                    );
                }
                out.push(StreamEvent::ContentBlockDelta {
                    index: self.current_index(),
                    delta: BlockDelta::TextDelta { text: text.clone() },
                });
                continue;
            }

            if let Some(call) = &part.function_call {
                self.ensure_started(&mut out);
                self.saw_tool_use = true;
                let id = call
                    .id
                    .clone()
                    .unwrap_or_else(|| format!("toolu_{}", uuid::Uuid::new_v4().simple()));
                self.open_block(
                    OpenBlock::ToolUse,
                    ContentBlock::ToolUse {
                        id,
                        name: call.name.clone(),
                        input: serde_json::json!({}),
                    },
                    &mut out,
                );
                let args = call
                    .args
                    .as_ref()
                    .map(|args| args.to_string())
                    .unwrap_or_else(|| "{}".to_string());
                out.push(StreamEvent::ContentBlockDelta {
                    index: self.current_index(),
                    delta: BlockDelta::InputJsonDelta { partial_json: args },
                });
            }
        }
        out
    }

    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        self.ensure_started(&mut out);
        self.close_block(&mut out);
        let stop_reason = if self.saw_tool_use {
            "tool_use"
        } else {
            match self.finish_reason {
                Some(FinishReason::MaxTokens) => "max_tokens",
                _ => "end_turn",
            }
        };
        out.push(StreamEvent::MessageDelta {
            delta: MessageDelta {
                stop_reason: Some(stop_reason.to_string()),
                stop_sequence: None,
            },
            usage: Some(Usage {
                input_tokens: self.usage.prompt_token_count.unwrap_or(0),
                output_tokens: self.usage.candidates_token_count.unwrap_or(0)
                    + self.usage.thoughts_token_count.unwrap_or(0),
            }),
        });
        out.push(StreamEvent::MessageStop);
        out
    }
}

/// `event: <name>\ndata: <json>\n\n`
pub fn encode_sse(event: &StreamEvent) -> String {
    let json = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    format!("event: {}\ndata: {json}\n\n", event.event_name())
}
