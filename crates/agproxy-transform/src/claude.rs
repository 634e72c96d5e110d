//! Anthropic Messages ⇄ upstream translation.

use serde_json::Value as JsonValue;

use agproxy_pool::SignatureCache;
use agproxy_protocol::antigravity::{SKIP_SIGNATURE_SENTINEL, SYSTEM_PROLOGUE};
use agproxy_protocol::claude::{
    ContentBlock, CountTokensRequest, ImageSource, MessageContent, MessageParam, MessagesRequest,
    MessagesResponse, Role, ThinkingParam, Tool as ClaudeTool, ToolChoice, Usage,
};
use agproxy_protocol::gemini::{
    Blob, Content, ContentRole, FileData, FinishReason, FunctionCall, FunctionCallingConfig,
    FunctionCallingMode, FunctionDeclaration, FunctionResponse, GenerateContentRequest,
    GenerateContentResponse, GenerationConfig, Part, ThinkingConfig, Tool, ToolConfig,
};

use crate::sanitize::{repair_orphans, sanitize_contents};
use crate::schema::clean_schema;
use crate::signature::{recover_thinking_signature, recover_tool_signature};
use crate::{TranslateError, TranslateOptions};

/// Whether `thinkingConfig` may be forwarded, and with what budget.
///
/// The upstream enforces two constraints jointly: a request with
/// `thinkingConfig` must have its last assistant turn begin with a
/// thinking block, and the budget must be strictly below `max_tokens`.
/// When forwarding is off, every thinking block is stripped from history
/// to satisfy the reciprocal constraint.
fn thinking_decision(request: &MessagesRequest) -> Option<ThinkingConfig> {
    let budget = match &request.thinking {
        Some(ThinkingParam::Enabled { budget_tokens }) => *budget_tokens,
        _ => return None,
    };

    let last_assistant_ok = request
        .messages
        .iter()
        .rev()
        .find(|message| message.role == Role::Assistant)
        .map(|message| match &message.content {
            MessageContent::Blocks(blocks) => matches!(
                blocks.first(),
                Some(ContentBlock::Thinking { .. }) | Some(ContentBlock::RedactedThinking { .. })
            ),
            MessageContent::Text(_) => false,
        })
        // No assistant turn yet: nothing to violate.
        .unwrap_or(true);
    if !last_assistant_ok {
        return None;
    }

    let budget = if budget >= request.max_tokens {
        // Auto-adjust down; suppress entirely if that hits zero.
        request.max_tokens.checked_sub(1)?
    } else {
        budget
    };
    if budget == 0 {
        return None;
    }
    Some(ThinkingConfig {
        include_thoughts: true,
        thinking_budget: Some(budget),
    })
}

pub fn to_upstream(
    request: &MessagesRequest,
    cache: &SignatureCache,
    opts: &TranslateOptions,
) -> Result<GenerateContentRequest, TranslateError> {
    let thinking_config = thinking_decision(request);
    let keep_thinking = thinking_config.is_some();

    // tool_use id → name, so tool_result parts can carry the function name.
    let mut tool_names: std::collections::HashMap<String, String> = std::collections::HashMap::new();
    for message in &request.messages {
        if let MessageContent::Blocks(blocks) = &message.content {
            for block in blocks {
                if let ContentBlock::ToolUse { id, name, .. } = block {
                    tool_names.insert(crate::signature::decode_tool_id(id).0, name.clone());
                }
            }
        }
    }

    let mut contents: Vec<Content> = Vec::new();
    let mut last_thinking_signature: Option<String> = None;
    let mut system_text = request
        .system
        .as_ref()
        .map(|system| system.joined_text())
        .unwrap_or_default();

    for message in &request.messages {
        let role = match message.role {
            Role::User => ContentRole::User,
            Role::Assistant => ContentRole::Model,
        };
        let mut parts: Vec<Part> = Vec::new();

        if role == ContentRole::User && opts.compatibility_mode && !system_text.is_empty() {
            parts.push(Part::text(std::mem::take(&mut system_text)));
        }

        match &message.content {
            MessageContent::Text(text) => parts.push(Part::text(text.clone())),
            MessageContent::Blocks(blocks) => {
                for block in blocks {
                    if let Some(part) = block_to_part(
                        block,
                        keep_thinking,
                        cache,
                        &tool_names,
                        &mut last_thinking_signature,
                    ) {
                        parts.push(part);
                    }
                }
            }
        }

        if !parts.is_empty() {
            contents.push(Content {
                role: Some(role),
                parts,
            });
        }
    }

    if opts.compatibility_mode && !system_text.is_empty() {
        contents.insert(
            0,
            Content {
                role: Some(ContentRole::User),
                parts: vec![Part::text(std::mem::take(&mut system_text))],
            },
        );
    }

    let contents = repair_orphans(sanitize_contents(contents));
    if contents.is_empty() {
        return Err(TranslateError("no usable messages in request".to_string()));
    }

    let mut system_parts = vec![Part::text(SYSTEM_PROLOGUE)];
    if !opts.compatibility_mode && !system_text.is_empty() {
        system_parts.push(Part::text(system_text));
    }

    let has_tools = request.tools.as_ref().is_some_and(|tools| !tools.is_empty());

    Ok(GenerateContentRequest {
        contents,
        session_id: None,
        system_instruction: Some(Content {
            role: None,
            parts: system_parts,
        }),
        tools: map_tools(request.tools.as_deref()),
        tool_config: map_tool_choice(request.tool_choice.as_ref(), has_tools),
        safety_settings: None,
        generation_config: Some(GenerationConfig {
            stop_sequences: request.stop_sequences.clone(),
            max_output_tokens: Some(request.max_tokens),
            temperature: request.temperature,
            top_p: request.top_p,
            top_k: request.top_k,
            thinking_config,
            ..GenerationConfig::default()
        }),
    })
}

fn block_to_part(
    block: &ContentBlock,
    keep_thinking: bool,
    cache: &SignatureCache,
    tool_names: &std::collections::HashMap<String, String>,
    last_thinking_signature: &mut Option<String>,
) -> Option<Part> {
    match block {
        ContentBlock::Text { text } => Some(Part::text(text.clone())),
        ContentBlock::Image { source } => Some(match source {
            ImageSource::Base64 { media_type, data } => Part {
                inline_data: Some(Blob {
                    mime_type: media_type.clone(),
                    data: data.clone(),
                }),
                ..Part::default()
            },
            ImageSource::Url { url } => Part {
                file_data: Some(FileData {
                    mime_type: None,
                    file_uri: url.clone(),
                }),
                ..Part::default()
            },
        }),
        ContentBlock::Thinking {
            thinking,
            signature,
        } => {
            if !keep_thinking {
                return None;
            }
            let signature =
                recover_thinking_signature(thinking, signature.as_deref(), cache);
            if let Some(signature) = &signature {
                *last_thinking_signature = Some(signature.clone());
            }
            Some(Part::thinking(thinking.clone(), signature))
        }
        ContentBlock::RedactedThinking { data } => {
            if !keep_thinking {
                return None;
            }
            // The redacted payload is itself the signed artifact.
            Some(Part {
                thought: Some(true),
                text: Some(String::new()),
                thought_signature: Some(data.clone()),
                ..Part::default()
            })
        }
        ContentBlock::ToolUse { id, name, input } => {
            let signature = recover_tool_signature(
                id,
                None,
                last_thinking_signature.as_deref(),
                None,
                cache,
            )
            .unwrap_or_else(|| SKIP_SIGNATURE_SENTINEL.to_string());
            Some(Part {
                function_call: Some(FunctionCall {
                    id: Some(crate::signature::decode_tool_id(id).0),
                    name: name.clone(),
                    args: Some(input.clone()),
                }),
                thought_signature: Some(signature),
                ..Part::default()
            })
        }
        ContentBlock::ToolResult {
            tool_use_id,
            content,
            is_error,
        } => {
            let mut output = content
                .as_ref()
                .map(|content| content.joined_text())
                .unwrap_or_default();
            if is_error == &Some(true) && !output.starts_with("Error") {
                output = format!("Error: {output}");
            }
            let bare_id = crate::signature::decode_tool_id(tool_use_id).0;
            let name = tool_names.get(&bare_id).cloned().unwrap_or_default();
            Some(Part {
                function_response: Some(FunctionResponse {
                    id: Some(bare_id),
                    name,
                    response: serde_json::json!({ "output": output }),
                }),
                ..Part::default()
            })
        }
    }
}

fn map_tools(tools: Option<&[ClaudeTool]>) -> Option<Vec<Tool>> {
    let tools = tools?;
    if tools.is_empty() {
        return None;
    }
    let declarations = tools
        .iter()
        .map(|tool| {
            let mut schema = clean_schema(&tool.input_schema);
            if let JsonValue::Object(map) = &mut schema
                && !map.contains_key("type")
            {
                map.insert(
                    "type".to_string(),
                    JsonValue::String("object".to_string()),
                );
            }
            FunctionDeclaration {
                name: tool.name.clone(),
                description: tool.description.clone().unwrap_or_default(),
                parameters: Some(schema),
            }
        })
        .collect();
    Some(vec![Tool {
        function_declarations: Some(declarations),
    }])
}

fn map_tool_choice(choice: Option<&ToolChoice>, has_tools: bool) -> Option<ToolConfig> {
    if !has_tools {
        return None;
    }
    let config = match choice {
        None | Some(ToolChoice::Auto) => FunctionCallingConfig {
            mode: Some(FunctionCallingMode::Validated),
            allowed_function_names: None,
        },
        Some(ToolChoice::Any) => FunctionCallingConfig {
            mode: Some(FunctionCallingMode::Any),
            allowed_function_names: None,
        },
        Some(ToolChoice::None) => FunctionCallingConfig {
            mode: Some(FunctionCallingMode::None),
            allowed_function_names: None,
        },
        Some(ToolChoice::Tool { name }) => FunctionCallingConfig {
            mode: Some(FunctionCallingMode::Any),
            allowed_function_names: Some(vec![name.clone()]),
        },
    };
    Some(ToolConfig {
        function_calling_config: Some(config),
    })
}

/// Project a reconstructed upstream response onto the Anthropic shape.
pub fn from_upstream(
    model: &str,
    response: &GenerateContentResponse,
    opts: &TranslateOptions,
) -> MessagesResponse {
    let mut blocks: Vec<ContentBlock> = Vec::new();
    let mut has_tool_use = false;

    if let Some(candidate) = response.candidates.first()
        && let Some(content) = &candidate.content
    {
        for part in &content.parts {
            if part.is_thought() {
                if opts.return_thoughts {
                    blocks.push(ContentBlock::Thinking {
                        thinking: part.text.clone().unwrap_or_default(),
                        signature: part.thought_signature.clone(),
                    });
                }
                continue;
            }
            if let Some(text) = &part.text
                && !text.is_empty()
            {
                if let Some(ContentBlock::Text { text: last }) = blocks.last_mut() {
                    last.push_str(text);
                } else {
                    blocks.push(ContentBlock::Text { text: text.clone() });
                }
                continue;
            }
            if let Some(call) = &part.function_call {
                has_tool_use = true;
                let id = call
                    .id
                    .clone()
                    .unwrap_or_else(|| format!("toolu_{}", uuid::Uuid::new_v4().simple()));
                blocks.push(ContentBlock::ToolUse {
                    id,
                    name: call.name.clone(),
                    input: call.args.clone().unwrap_or_else(|| serde_json::json!({})),
                });
            }
        }
    }

    let stop_reason = if has_tool_use {
        "tool_use"
    } else {
        match response
            .candidates
            .first()
            .and_then(|candidate| candidate.finish_reason)
        {
            Some(FinishReason::MaxTokens) => "max_tokens",
            _ => "end_turn",
        }
    };

    let usage = response
        .usage_metadata
        .as_ref()
        .map(|metadata| Usage {
            input_tokens: metadata.prompt_token_count.unwrap_or(0),
            output_tokens: metadata.candidates_token_count.unwrap_or(0)
                + metadata.thoughts_token_count.unwrap_or(0),
        })
        .unwrap_or_default();

    MessagesResponse {
        id: format!("msg_{}", uuid::Uuid::new_v4().simple()),
        kind: "message".to_string(),
        role: "assistant".to_string(),
        model: model.to_string(),
        content: blocks,
        stop_reason: Some(stop_reason.to_string()),
        stop_sequence: None,
        usage,
    }
}

/// Local token estimation for `count_tokens`; never touches upstream
/// quota. Four characters per token, the estimator's universal fallback.
pub fn estimate_input_tokens(request: &CountTokensRequest) -> u64 {
    let mut chars = 0usize;
    if let Some(system) = &request.system {
        chars += system.joined_text().chars().count();
    }
    for message in &request.messages {
        chars += message_chars(message);
    }
    if let Some(tools) = &request.tools {
        for tool in tools {
            chars += tool.name.chars().count();
            chars += tool
                .description
                .as_ref()
                .map(|d| d.chars().count())
                .unwrap_or(0);
            chars += tool.input_schema.to_string().chars().count();
        }
    }
    chars.div_ceil(4) as u64
}

fn message_chars(message: &MessageParam) -> usize {
    match &message.content {
        MessageContent::Text(text) => text.chars().count(),
        MessageContent::Blocks(blocks) => blocks
            .iter()
            .map(|block| match block {
                ContentBlock::Text { text } => text.chars().count(),
                ContentBlock::Thinking { thinking, .. } => thinking.chars().count(),
                ContentBlock::ToolUse { input, .. } => input.to_string().chars().count(),
                ContentBlock::ToolResult { content, .. } => content
                    .as_ref()
                    .map(|content| content.joined_text().chars().count())
                    .unwrap_or(0),
                _ => 0,
            })
            .sum(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_request(json: serde_json::Value) -> MessagesRequest {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn thinking_forwarded_only_when_constraints_hold() {
        // Enabled + last assistant starts with thinking + budget < max_tokens.
        let request = base_request(serde_json::json!({
            "model": "claude-sonnet-4-5-thinking",
            "max_tokens": 2048,
            "thinking": {"type": "enabled", "budget_tokens": 1024},
            "messages": [
                {"role": "user", "content": "hi"},
                {"role": "assistant", "content": [
                    {"type": "thinking", "thinking": "hm", "signature": "s"},
                    {"type": "text", "text": "yes"}
                ]},
                {"role": "user", "content": "go on"}
            ]
        }));
        let config = thinking_decision(&request).unwrap();
        assert_eq!(config.thinking_budget, Some(1024));

        // Budget equal to max_tokens auto-adjusts down by one.
        let mut equal = request.clone();
        equal.thinking = Some(ThinkingParam::Enabled { budget_tokens: 2048 });
        assert_eq!(
            thinking_decision(&equal).unwrap().thinking_budget,
            Some(2047)
        );

        // max_tokens == 1 would adjust to zero: suppressed.
        let mut tiny = request.clone();
        tiny.max_tokens = 1;
        tiny.thinking = Some(ThinkingParam::Enabled { budget_tokens: 1 });
        assert!(thinking_decision(&tiny).is_none());

        // Last assistant message starting with text: suppressed.
        let plain = base_request(serde_json::json!({
            "model": "claude-sonnet-4-5-thinking",
            "max_tokens": 2048,
            "thinking": {"type": "enabled", "budget_tokens": 100},
            "messages": [
                {"role": "user", "content": "hi"},
                {"role": "assistant", "content": "plain"},
                {"role": "user", "content": "more"}
            ]
        }));
        assert!(thinking_decision(&plain).is_none());
    }

    #[test]
    fn thinking_blocks_are_stripped_when_not_forwarded() {
        let request = base_request(serde_json::json!({
            "model": "claude-sonnet-4-5",
            "max_tokens": 100,
            "messages": [
                {"role": "user", "content": "hi"},
                {"role": "assistant", "content": [
                    {"type": "thinking", "thinking": "secret", "signature": "s"},
                    {"type": "text", "text": "visible"}
                ]},
                {"role": "user", "content": "next"}
            ]
        }));
        let cache = SignatureCache::default();
        let upstream = to_upstream(&request, &cache, &TranslateOptions::default()).unwrap();
        let assistant = &upstream.contents[1];
        assert_eq!(assistant.parts.len(), 1);
        assert_eq!(assistant.parts[0].text.as_deref(), Some("visible"));
        assert!(
            upstream
                .generation_config
                .as_ref()
                .unwrap()
                .thinking_config
                .is_none()
        );
    }

    #[test]
    fn orphan_tool_use_becomes_placeholder() {
        // Scenario: one full pair, then a dangling tool_use with no result.
        let request = base_request(serde_json::json!({
            "model": "claude-sonnet-4-5",
            "max_tokens": 100,
            "messages": [
                {"role": "user", "content": "x"},
                {"role": "assistant", "content": [
                    {"type": "tool_use", "id": "A", "name": "run", "input": {}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "A", "content": "ok"}
                ]},
                {"role": "user", "content": "continue"},
                {"role": "assistant", "content": [
                    {"type": "tool_use", "id": "B", "name": "run", "input": {}}
                ]}
            ]
        }));
        let cache = SignatureCache::default();
        let upstream = to_upstream(&request, &cache, &TranslateOptions::default()).unwrap();

        let mut calls = 0;
        let mut responses = 0;
        for content in &upstream.contents {
            for part in &content.parts {
                if part.function_call.is_some() {
                    calls += 1;
                }
                if part.function_response.is_some() {
                    responses += 1;
                }
            }
        }
        assert_eq!(calls, 1);
        assert_eq!(responses, 1);
        // The dangling tool_use turned into a placeholder text part.
        let last = upstream.contents.last().unwrap();
        assert_eq!(last.parts[0].text.as_deref(), Some("..."));
    }

    #[test]
    fn signature_is_reinstated_from_cache() {
        let cache = SignatureCache::default();
        let signature: String =
            std::iter::repeat_n('s', agproxy_pool::signature::MIN_SIGNATURE_LEN).collect();
        cache.put("deep thought", &signature);

        let request = base_request(serde_json::json!({
            "model": "claude-sonnet-4-5-thinking",
            "max_tokens": 2048,
            "thinking": {"type": "enabled", "budget_tokens": 512},
            "messages": [
                {"role": "user", "content": "hi"},
                {"role": "assistant", "content": [
                    {"type": "thinking", "thinking": "deep thought"},
                    {"type": "text", "text": "done"}
                ]},
                {"role": "user", "content": "next"}
            ]
        }));
        let upstream = to_upstream(&request, &cache, &TranslateOptions::default()).unwrap();
        let thinking_part = &upstream.contents[1].parts[0];
        assert_eq!(thinking_part.thought, Some(true));
        assert_eq!(thinking_part.thought_signature.as_deref(), Some(signature.as_str()));
    }

    #[test]
    fn response_projection_and_stop_reasons() {
        let response = GenerateContentResponse {
            candidates: vec![agproxy_protocol::gemini::Candidate {
                content: Some(Content {
                    role: Some(ContentRole::Model),
                    parts: vec![Part::text("answer")],
                }),
                finish_reason: Some(FinishReason::MaxTokens),
                index: Some(0),
            }],
            ..GenerateContentResponse::default()
        };
        let message = from_upstream("claude-sonnet-4-5", &response, &TranslateOptions::default());
        assert_eq!(message.stop_reason.as_deref(), Some("max_tokens"));
        assert!(matches!(message.content[0], ContentBlock::Text { .. }));
    }

    #[test]
    fn count_tokens_is_chars_over_four() {
        let request: CountTokensRequest = serde_json::from_value(serde_json::json!({
            "model": "claude-sonnet-4-5",
            "messages": [{"role": "user", "content": "abcdefgh"}]
        }))
        .unwrap();
        assert_eq!(estimate_input_tokens(&request), 2);
    }
}
