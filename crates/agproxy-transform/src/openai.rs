//! OpenAI Chat Completions ⇄ upstream translation.

use std::collections::{HashMap, HashSet};

use serde_json::Value as JsonValue;

use agproxy_pool::SignatureCache;
use agproxy_protocol::antigravity::{SKIP_SIGNATURE_SENTINEL, SYSTEM_PROLOGUE};
use agproxy_protocol::gemini::{
    Blob, Content, ContentRole, FinishReason, FunctionCall, FunctionCallingConfig,
    FunctionCallingMode, FunctionDeclaration, FunctionResponse, GenerateContentRequest,
    GenerateContentResponse, GenerationConfig, Part, Tool, ToolConfig,
};
use agproxy_protocol::openai::{
    AssistantMessage, ChatCompletionRequest, ChatCompletionResponse, ChatRole, Choice, ContentPart,
    MessageContent, ToolCall, ToolDef, Usage,
};

use crate::sanitize::{repair_orphans, sanitize_contents};
use crate::schema::clean_schema;
use crate::signature::{recover_thinking_signature, recover_tool_signature};
use crate::{TranslateError, TranslateOptions};

const TOOL_REMINDER: &str = "\n\nWhen calling tools, use the exact parameter names from the tool definitions and emit arguments as valid JSON.";
const TOOL_REMINDER_AFTER_ERROR: &str = "\n\nIMPORTANT: a previous tool call used invalid arguments. Re-read the tool definitions and use the exact parameter names and types they declare.";

const TOOL_ERROR_PATTERNS: &[&str] = &[
    "invalid arguments",
    "invalid parameters",
    "unexpected parameters",
    "model provided invalid",
    "tool call arguments",
    "were invalid",
];

pub fn to_upstream(
    request: &ChatCompletionRequest,
    cache: &SignatureCache,
    opts: &TranslateOptions,
) -> Result<GenerateContentRequest, TranslateError> {
    let has_tools = request
        .tools
        .as_ref()
        .is_some_and(|tools| !tools.is_empty());

    // tool_call_id → tool name over the whole history; a `tool` message
    // with no matching call is a known upstream 400 and gets dropped.
    let mut call_names: HashMap<String, String> = HashMap::new();
    for message in &request.messages {
        if let Some(calls) = &message.tool_calls {
            for call in calls {
                call_names.insert(call.id.clone(), call.function.name.clone());
            }
        }
    }

    let has_tool_error = request.messages.iter().any(|message| {
        message
            .content
            .as_ref()
            .map(|content| {
                let text = content.joined_text().to_ascii_lowercase();
                TOOL_ERROR_PATTERNS.iter().any(|p| text.contains(p))
            })
            .unwrap_or(false)
    });

    let mut system_texts: Vec<String> = Vec::new();
    let mut contents: Vec<Content> = Vec::new();
    let mut last_thinking_signature: Option<String> = None;

    for message in &request.messages {
        match message.role {
            ChatRole::System | ChatRole::Developer => {
                if let Some(content) = &message.content {
                    system_texts.push(content.joined_text());
                }
            }
            ChatRole::User => {
                let mut parts: Vec<Part> = Vec::new();
                if opts.compatibility_mode && !system_texts.is_empty() {
                    parts.push(Part::text(system_texts.join("\n\n")));
                    system_texts.clear();
                }
                if let Some(content) = &message.content {
                    parts.extend(user_content_parts(content));
                }
                if !parts.is_empty() {
                    contents.push(Content {
                        role: Some(ContentRole::User),
                        parts,
                    });
                }
            }
            ChatRole::Assistant => {
                let mut parts: Vec<Part> = Vec::new();
                if let Some(content) = &message.content {
                    parts.extend(assistant_content_parts(
                        content,
                        cache,
                        &mut last_thinking_signature,
                    ));
                }
                if let Some(calls) = &message.tool_calls {
                    for call in calls {
                        parts.push(function_call_part(
                            call,
                            last_thinking_signature.as_deref(),
                            cache,
                        ));
                    }
                }
                if !parts.is_empty() {
                    contents.push(Content {
                        role: Some(ContentRole::Model),
                        parts,
                    });
                }
            }
            ChatRole::Tool => {
                let Some(id) = &message.tool_call_id else {
                    continue;
                };
                // Orphan-result filter.
                let Some(name) = call_names.get(id) else {
                    continue;
                };
                let output = message
                    .content
                    .as_ref()
                    .map(|content| content.joined_text())
                    .unwrap_or_default();
                contents.push(Content {
                    role: Some(ContentRole::User),
                    parts: vec![Part {
                        function_response: Some(FunctionResponse {
                            id: Some(crate::signature::decode_tool_id(id).0),
                            name: name.clone(),
                            response: serde_json::json!({ "output": output }),
                        }),
                        ..Part::default()
                    }],
                });
            }
        }
    }

    // System text with no user turn to land in: emit a synthetic lead turn.
    if opts.compatibility_mode && !system_texts.is_empty() {
        contents.insert(
            0,
            Content {
                role: Some(ContentRole::User),
                parts: vec![Part::text(system_texts.join("\n\n"))],
            },
        );
        system_texts.clear();
    }

    let contents = repair_orphans(sanitize_contents(contents));
    if contents.is_empty() {
        return Err(TranslateError("no usable messages in request".to_string()));
    }

    let mut system_parts = vec![Part::text(build_prologue(has_tools, has_tool_error))];
    if !opts.compatibility_mode {
        for text in &system_texts {
            system_parts.push(Part::text(text.clone()));
        }
    }

    Ok(GenerateContentRequest {
        contents,
        session_id: None,
        system_instruction: Some(Content {
            role: None,
            parts: system_parts,
        }),
        tools: map_tools(request.tools.as_deref()),
        tool_config: has_tools.then(|| ToolConfig {
            function_calling_config: Some(FunctionCallingConfig {
                mode: Some(FunctionCallingMode::Validated),
                allowed_function_names: None,
            }),
        }),
        safety_settings: None,
        generation_config: map_generation_config(request),
    })
}

fn build_prologue(has_tools: bool, has_tool_error: bool) -> String {
    let mut prologue = SYSTEM_PROLOGUE.to_string();
    if has_tool_error {
        prologue.push_str(TOOL_REMINDER_AFTER_ERROR);
    } else if has_tools {
        prologue.push_str(TOOL_REMINDER);
    }
    prologue
}

fn user_content_parts(content: &MessageContent) -> Vec<Part> {
    match content {
        MessageContent::Text(text) => vec![Part::text(text.clone())],
        MessageContent::Parts(parts) => parts
            .iter()
            .filter_map(|part| match part {
                ContentPart::Text { text } => Some(Part::text(text.clone())),
                ContentPart::ImageUrl { image_url } => data_url_part(&image_url.url),
            })
            .collect(),
    }
}

/// `data:image/png;base64,<data>` → inlineData. Remote URLs are passed
/// through as file data.
fn data_url_part(url: &str) -> Option<Part> {
    if let Some(rest) = url.strip_prefix("data:") {
        let (mime, data) = rest.split_once(";base64,")?;
        return Some(Part {
            inline_data: Some(Blob {
                mime_type: mime.to_string(),
                data: data.to_string(),
            }),
            ..Part::default()
        });
    }
    Some(Part {
        file_data: Some(agproxy_protocol::gemini::FileData {
            mime_type: None,
            file_uri: url.to_string(),
        }),
        ..Part::default()
    })
}

/// Assistant history: `<think>…</think>` (and `<reasoning>` spellings)
/// peel off into a thinking part whose signature is recovered from the
/// cache; the remainder is plain text.
fn assistant_content_parts(
    content: &MessageContent,
    cache: &SignatureCache,
    last_thinking_signature: &mut Option<String>,
) -> Vec<Part> {
    let text = content.joined_text();
    let mut parts = Vec::new();
    let (thinking, remainder) = split_think_tags(&text);
    if let Some(thinking) = thinking
        && !thinking.trim().is_empty()
    {
        let signature = recover_thinking_signature(&thinking, None, cache);
        if let Some(signature) = &signature {
            *last_thinking_signature = Some(signature.clone());
        }
        // Forwarded even without a signature so downstream recovery can
        // still reinstate it.
        parts.push(Part::thinking(thinking, signature));
    }
    if !remainder.trim().is_empty() {
        parts.push(Part::text(remainder));
    }
    parts
}

fn split_think_tags(text: &str) -> (Option<String>, String) {
    for (open, close) in [
        ("<think>", "</think>"),
        ("<reasoning>", "</reasoning>"),
        ("<redacted_reasoning>", "</redacted_reasoning>"),
    ] {
        let lower = text.to_ascii_lowercase();
        if let Some(start) = lower.find(open)
            && let Some(end) = lower[start + open.len()..].find(close)
        {
            let inner_start = start + open.len();
            let inner = text[inner_start..inner_start + end].trim().to_string();
            let mut remainder = String::new();
            remainder.push_str(&text[..start]);
            remainder.push_str(&text[inner_start + end + close.len()..]);
            return (Some(inner), remainder.trim().to_string());
        }
    }
    (None, text.to_string())
}

fn function_call_part(
    call: &ToolCall,
    context_signature: Option<&str>,
    cache: &SignatureCache,
) -> Part {
    let args: Option<JsonValue> = if call.function.arguments.trim().is_empty() {
        Some(serde_json::json!({}))
    } else {
        serde_json::from_str(&call.function.arguments).ok()
    };
    let signature = recover_tool_signature(&call.id, None, context_signature, None, cache)
        .unwrap_or_else(|| SKIP_SIGNATURE_SENTINEL.to_string());
    Part {
        function_call: Some(FunctionCall {
            id: Some(crate::signature::decode_tool_id(&call.id).0),
            name: call.function.name.clone(),
            args,
        }),
        thought_signature: Some(signature),
        ..Part::default()
    }
}

fn map_tools(tools: Option<&[ToolDef]>) -> Option<Vec<Tool>> {
    let tools = tools?;
    if tools.is_empty() {
        return None;
    }
    let declarations = tools
        .iter()
        .map(|tool| FunctionDeclaration {
            name: tool.function.name.clone(),
            description: tool.function.description.clone().unwrap_or_default(),
            parameters: Some(
                tool.function
                    .parameters
                    .as_ref()
                    .map(clean_schema)
                    .unwrap_or_else(|| serde_json::json!({"type": "object", "properties": {}})),
            ),
        })
        .collect();
    Some(vec![Tool {
        function_declarations: Some(declarations),
    }])
}

fn map_generation_config(request: &ChatCompletionRequest) -> Option<GenerationConfig> {
    let stop_sequences = request.stop.clone().map(|stop| stop.into_vec());
    if request.temperature.is_none()
        && request.top_p.is_none()
        && request.max_tokens.is_none()
        && stop_sequences.is_none()
    {
        return None;
    }
    Some(GenerationConfig {
        stop_sequences,
        max_output_tokens: request.max_tokens,
        temperature: request.temperature,
        top_p: request.top_p,
        ..GenerationConfig::default()
    })
}

/// Project a reconstructed upstream response onto the OpenAI shape.
pub fn from_upstream(
    model: &str,
    response: &GenerateContentResponse,
    opts: &TranslateOptions,
) -> ChatCompletionResponse {
    let mut content = String::new();
    let mut reasoning = String::new();
    let mut tool_calls: Vec<ToolCall> = Vec::new();
    let mut seen_ids: HashSet<String> = HashSet::new();

    let candidate = response.candidates.first();
    if let Some(candidate) = candidate
        && let Some(body) = &candidate.content
    {
        for part in &body.parts {
            if part.is_thought() {
                if let Some(text) = &part.text {
                    reasoning.push_str(text);
                }
                continue;
            }
            if let Some(text) = &part.text {
                content.push_str(text);
            }
            if let Some(call) = &part.function_call {
                let id = call
                    .id
                    .clone()
                    .unwrap_or_else(|| format!("call_{}", uuid::Uuid::new_v4().simple()));
                if !seen_ids.insert(id.clone()) {
                    continue;
                }
                tool_calls.push(ToolCall {
                    id,
                    kind: "function".to_string(),
                    function: agproxy_protocol::openai::FunctionCallSpec {
                        name: call.name.clone(),
                        arguments: call
                            .args
                            .as_ref()
                            .map(|args| args.to_string())
                            .unwrap_or_else(|| "{}".to_string()),
                    },
                });
            }
        }
    }

    let finish_reason = if !tool_calls.is_empty() {
        "tool_calls"
    } else {
        match candidate.and_then(|c| c.finish_reason) {
            Some(FinishReason::MaxTokens) => "length",
            Some(FinishReason::Safety) | Some(FinishReason::Recitation) => "content_filter",
            _ => "stop",
        }
    };

    ChatCompletionResponse {
        id: format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
        object: "chat.completion".to_string(),
        created: time::OffsetDateTime::now_utc().unix_timestamp(),
        model: model.to_string(),
        choices: vec![Choice {
            index: 0,
            message: AssistantMessage {
                role: "assistant".to_string(),
                content: (!content.is_empty()).then_some(content),
                reasoning_content: (opts.return_thoughts && !reasoning.is_empty())
                    .then_some(reasoning),
                tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
            },
            finish_reason: Some(finish_reason.to_string()),
        }],
        usage: response.usage_metadata.as_ref().map(usage_from_metadata),
    }
}

pub fn usage_from_metadata(metadata: &agproxy_protocol::gemini::UsageMetadata) -> Usage {
    let prompt = metadata.prompt_token_count.unwrap_or(0);
    let completion = metadata.candidates_token_count.unwrap_or(0)
        + metadata.thoughts_token_count.unwrap_or(0);
    Usage {
        prompt_tokens: prompt,
        completion_tokens: completion,
        total_tokens: metadata.total_token_count.unwrap_or(prompt + completion),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agproxy_protocol::gemini::Candidate;

    fn request(messages: serde_json::Value) -> ChatCompletionRequest {
        serde_json::from_value(serde_json::json!({
            "model": "claude-sonnet-4.5",
            "messages": messages,
        }))
        .unwrap()
    }

    #[test]
    fn simple_round_trip_shape() {
        let cache = SignatureCache::default();
        let upstream = to_upstream(
            &request(serde_json::json!([{"role": "user", "content": "hi"}])),
            &cache,
            &TranslateOptions::default(),
        )
        .unwrap();
        assert_eq!(upstream.contents.len(), 1);
        assert_eq!(upstream.contents[0].parts[0].text.as_deref(), Some("hi"));
        let system = upstream.system_instruction.unwrap();
        assert!(
            system.parts[0]
                .text
                .as_deref()
                .unwrap()
                .starts_with("You are Antigravity")
        );
    }

    #[test]
    fn system_collapses_into_first_user_turn() {
        let cache = SignatureCache::default();
        let upstream = to_upstream(
            &request(serde_json::json!([
                {"role": "system", "content": "be terse"},
                {"role": "user", "content": "hi"}
            ])),
            &cache,
            &TranslateOptions::default(),
        )
        .unwrap();
        let first = &upstream.contents[0];
        assert_eq!(first.parts[0].text.as_deref(), Some("be terse"));
        assert_eq!(first.parts[1].text.as_deref(), Some("hi"));
    }

    #[test]
    fn think_tags_become_thinking_parts() {
        let cache = SignatureCache::default();
        let upstream = to_upstream(
            &request(serde_json::json!([
                {"role": "user", "content": "q"},
                {"role": "assistant", "content": "<think>mull it over</think>answer"},
                {"role": "user", "content": "next"}
            ])),
            &cache,
            &TranslateOptions::default(),
        )
        .unwrap();
        let assistant = &upstream.contents[1];
        assert_eq!(assistant.parts[0].thought, Some(true));
        assert_eq!(assistant.parts[0].text.as_deref(), Some("mull it over"));
        assert_eq!(assistant.parts[1].text.as_deref(), Some("answer"));
    }

    #[test]
    fn orphan_tool_result_is_dropped() {
        let cache = SignatureCache::default();
        let upstream = to_upstream(
            &request(serde_json::json!([
                {"role": "user", "content": "go"},
                {"role": "tool", "tool_call_id": "call_missing", "content": "ok"}
            ])),
            &cache,
            &TranslateOptions::default(),
        )
        .unwrap();
        assert_eq!(upstream.contents.len(), 1);
        assert!(upstream.contents[0].parts[0].function_response.is_none());
    }

    #[test]
    fn tool_calls_get_the_sentinel_when_unsigned() {
        let cache = SignatureCache::default();
        let upstream = to_upstream(
            &request(serde_json::json!([
                {"role": "user", "content": "go"},
                {"role": "assistant", "tool_calls": [{
                    "id": "call_1",
                    "type": "function",
                    "function": {"name": "lookup", "arguments": "{\"q\":\"x\"}"}
                }]},
                {"role": "tool", "tool_call_id": "call_1", "content": "found"}
            ])),
            &cache,
            &TranslateOptions::default(),
        )
        .unwrap();
        let call_part = &upstream.contents[1].parts[0];
        assert_eq!(
            call_part.thought_signature.as_deref(),
            Some(SKIP_SIGNATURE_SENTINEL)
        );
        assert_eq!(
            call_part.function_call.as_ref().unwrap().args,
            Some(serde_json::json!({"q": "x"}))
        );
        let response_part = &upstream.contents[2].parts[0];
        assert_eq!(
            response_part.function_response.as_ref().unwrap().name,
            "lookup"
        );
    }

    #[test]
    fn data_urls_become_inline_data() {
        let cache = SignatureCache::default();
        let upstream = to_upstream(
            &request(serde_json::json!([
                {"role": "user", "content": [
                    {"type": "text", "text": "what is this"},
                    {"type": "image_url", "image_url": {"url": "data:image/png;base64,iVBOR"}}
                ]}
            ])),
            &cache,
            &TranslateOptions::default(),
        )
        .unwrap();
        let blob = upstream.contents[0].parts[1].inline_data.as_ref().unwrap();
        assert_eq!(blob.mime_type, "image/png");
        assert_eq!(blob.data, "iVBOR");
    }

    #[test]
    fn projection_splits_thinking_text_and_tools() {
        let response = GenerateContentResponse {
            candidates: vec![Candidate {
                content: Some(Content {
                    role: Some(ContentRole::Model),
                    parts: vec![
                        Part::thinking("pondering", Some("sig".to_string())),
                        Part::text("hello"),
                        Part {
                            function_call: Some(FunctionCall {
                                id: Some("call_9".to_string()),
                                name: "lookup".to_string(),
                                args: Some(serde_json::json!({"q": 1})),
                            }),
                            ..Part::default()
                        },
                    ],
                }),
                finish_reason: Some(FinishReason::Stop),
                index: Some(0),
            }],
            ..GenerateContentResponse::default()
        };
        let completion = from_upstream("claude-sonnet-4-5", &response, &TranslateOptions::default());
        let message = &completion.choices[0].message;
        assert_eq!(message.content.as_deref(), Some("hello"));
        assert_eq!(message.reasoning_content.as_deref(), Some("pondering"));
        assert_eq!(message.tool_calls.as_ref().unwrap()[0].id, "call_9");
        assert_eq!(
            completion.choices[0].finish_reason.as_deref(),
            Some("tool_calls")
        );

        let hidden = from_upstream(
            "claude-sonnet-4-5",
            &response,
            &TranslateOptions {
                return_thoughts: false,
                ..TranslateOptions::default()
            },
        );
        assert!(hidden.choices[0].message.reasoning_content.is_none());
    }
}
