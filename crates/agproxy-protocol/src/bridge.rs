//! NDJSON bridge dialect (the Augment-style integration).
//!
//! Requests arrive as one JSON body; responses go back as
//! newline-delimited JSON objects, one per line.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::openai::{ChatMessage, ToolDef};

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ChatStreamRequest {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub chat_history: Vec<ChatMessage>,
    #[serde(default)]
    pub nodes: Vec<RequestNode>,
    #[serde(default)]
    pub tool_definitions: Vec<ToolDef>,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

/// Inbound node. `type: 1` carries a tool result for a call we issued on
/// an earlier turn.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RequestNode {
    #[serde(rename = "type")]
    pub kind: i32,
    #[serde(default)]
    pub tool_result_node: Option<ToolResultNode>,
    #[serde(default)]
    pub text: Option<String>,
}

pub const REQUEST_NODE_TOOL_RESULT: i32 = 1;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ToolResultNode {
    pub tool_use_id: String,
    #[serde(default)]
    pub content: JsonValue,
}

impl ToolResultNode {
    pub fn content_text(&self) -> String {
        match &self.content {
            JsonValue::String(text) => text.clone(),
            JsonValue::Null => String::new(),
            other => other.to_string(),
        }
    }
}

/// One NDJSON response line.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct ResponseLine {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nodes: Option<Vec<ResponseNode>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResponseNode {
    #[serde(rename = "type")]
    pub kind: i32,
    pub tool_use: ToolUseNode,
}

pub const RESPONSE_NODE_TOOL_USE: i32 = 5;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolUseNode {
    pub tool_use_id: String,
    pub tool_name: String,
    /// JSON-encoded arguments.
    pub input_json: String,
}

impl ResponseLine {
    pub fn text(text: impl Into<String>) -> Self {
        ResponseLine {
            text: Some(text.into()),
            ..ResponseLine::default()
        }
    }

    pub fn tool_use(id: String, name: String, input_json: String) -> Self {
        ResponseLine {
            nodes: Some(vec![ResponseNode {
                kind: RESPONSE_NODE_TOOL_USE,
                tool_use: ToolUseNode {
                    tool_use_id: id,
                    tool_name: name,
                    input_json,
                },
            }]),
            stop_reason: Some("tool_use".to_string()),
            ..ResponseLine::default()
        }
    }

    pub fn end_turn() -> Self {
        ResponseLine {
            text: Some(String::new()),
            stop_reason: Some("end_turn".to_string()),
            ..ResponseLine::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn end_turn_line_shape() {
        let line = serde_json::to_value(ResponseLine::end_turn()).unwrap();
        assert_eq!(line, serde_json::json!({"text": "", "stop_reason": "end_turn"}));
    }

    #[test]
    fn tool_use_line_shape() {
        let line = serde_json::to_value(ResponseLine::tool_use(
            "toolu_1".to_string(),
            "search".to_string(),
            "{\"q\":1}".to_string(),
        ))
        .unwrap();
        assert_eq!(line["nodes"][0]["type"], 5);
        assert_eq!(line["nodes"][0]["tool_use"]["tool_name"], "search");
        assert_eq!(line["stop_reason"], "tool_use");
    }

    #[test]
    fn tool_result_nodes_parse() {
        let request: ChatStreamRequest = serde_json::from_value(serde_json::json!({
            "message": "",
            "conversation_id": "conv-1",
            "nodes": [{"type": 1, "tool_result_node": {"tool_use_id": "toolu_1", "content": "42"}}]
        }))
        .unwrap();
        assert_eq!(request.nodes[0].kind, REQUEST_NODE_TOOL_RESULT);
        assert_eq!(
            request.nodes[0]
                .tool_result_node
                .as_ref()
                .unwrap()
                .content_text(),
            "42"
        );
    }
}
