//! Upstream chunks → NDJSON bridge lines, plus the server-side tool-loop
//! reconstruction for follow-up turns.

use agproxy_protocol::bridge::{
    ChatStreamRequest, REQUEST_NODE_TOOL_RESULT, ResponseLine,
};
use agproxy_protocol::gemini::GenerateContentResponse;
use agproxy_protocol::openai::{
    ChatMessage, ChatRole, FunctionCallSpec, MessageContent, ToolCall,
};

/// Streaming state for one `/chat-stream` response.
#[derive(Debug, Default)]
pub struct NdjsonStream {
    return_thoughts: bool,
    saw_tool_use: bool,
    /// `(tool_use_id, name, args_json)` for the conversation map.
    pub issued_calls: Vec<(String, String, String)>,
}

impl NdjsonStream {
    pub fn new(return_thoughts: bool) -> Self {
        Self {
            return_thoughts,
            ..Self::default()
        }
    }

    pub fn on_chunk(&mut self, upstream: &GenerateContentResponse) -> Vec<ResponseLine> {
        let mut out = Vec::new();
        let Some(candidate) = upstream.candidates.first() else {
            return out;
        };
        let Some(content) = &candidate.content else {
            return out;
        };
        for part in &content.parts {
            if part.is_thought() {
                if self.return_thoughts
                    && let Some(text) = &part.text
                    && !text.is_empty()
                {
                    out.push(ResponseLine::text(format!("<think>{text}</think>")));
                }
                continue;
            }
            if let Some(text) = &part.text {
                if !text.is_empty() {
                    out.push(ResponseLine::text(text.clone()));
                }
                continue;
            }
            if let Some(call) = &part.function_call {
                self.saw_tool_use = true;
                let id = call
                    .id
                    .clone()
                    .unwrap_or_else(|| format!("toolu_{}", uuid::Uuid::new_v4().simple()));
                let args = call
                    .args
                    .as_ref()
                    .map(|args| args.to_string())
                    .unwrap_or_else(|| "{}".to_string());
                self.issued_calls
                    .push((id.clone(), call.name.clone(), args.clone()));
                out.push(ResponseLine::tool_use(id, call.name.clone(), args));
            }
        }
        out
    }

    pub fn finish(&mut self) -> Vec<ResponseLine> {
        if self.saw_tool_use {
            // The tool_use line already carried its stop reason.
            Vec::new()
        } else {
            vec![ResponseLine::end_turn()]
        }
    }
}

pub fn encode_line(line: &ResponseLine) -> String {
    let json = serde_json::to_string(line).unwrap_or_else(|_| "{}".to_string());
    format!("{json}\n")
}

/// Rebuild the OpenAI-shape messages for a follow-up bridge turn.
///
/// The client replays tool results as nodes with an empty user message;
/// the assistant's tool-use turn never comes back, so it is reconstructed
/// from the conversation-scoped `tool_use_id → (name, args)` map.
pub fn reconstruct_messages(
    request: &ChatStreamRequest,
    lookup_call: impl Fn(&str) -> Option<(String, String)>,
) -> Vec<ChatMessage> {
    let mut messages: Vec<ChatMessage> = request.chat_history.clone();

    let mut tool_calls: Vec<ToolCall> = Vec::new();
    let mut tool_results: Vec<(String, String)> = Vec::new();
    for node in &request.nodes {
        if node.kind != REQUEST_NODE_TOOL_RESULT {
            continue;
        }
        let Some(result) = &node.tool_result_node else {
            continue;
        };
        let Some((name, args)) = lookup_call(&result.tool_use_id) else {
            continue;
        };
        tool_calls.push(ToolCall {
            id: result.tool_use_id.clone(),
            kind: "function".to_string(),
            function: FunctionCallSpec {
                name,
                arguments: args,
            },
        });
        tool_results.push((result.tool_use_id.clone(), result.content_text()));
    }

    if !tool_calls.is_empty() {
        messages.push(ChatMessage {
            role: ChatRole::Assistant,
            content: None,
            tool_calls: Some(tool_calls),
            tool_call_id: None,
            name: None,
        });
        for (id, output) in tool_results {
            messages.push(ChatMessage {
                role: ChatRole::Tool,
                content: Some(MessageContent::Text(output)),
                tool_calls: None,
                tool_call_id: Some(id),
                name: None,
            });
        }
    }

    if !request.message.trim().is_empty() {
        messages.push(ChatMessage {
            role: ChatRole::User,
            content: Some(MessageContent::Text(request.message.clone())),
            tool_calls: None,
            tool_call_id: None,
            name: None,
        });
    }

    messages
}
