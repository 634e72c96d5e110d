//! Part hygiene for outgoing upstream bodies.
//!
//! Typed deserialization already strips unknown keys (the allow-list);
//! this pass handles the rest: text trimming, empty-part and
//! empty-message removal, and the orphan `functionCall`/`functionResponse`
//! repair that prevents a known upstream 400.

use std::collections::HashSet;

use agproxy_protocol::gemini::{Content, Part};

/// Right-trim plain text parts, drop whitespace-only text parts, drop
/// parts with no payload at all, then drop messages left without parts.
pub fn sanitize_contents(contents: Vec<Content>) -> Vec<Content> {
    contents
        .into_iter()
        .filter_map(|content| {
            let parts: Vec<Part> = content.parts.into_iter().filter_map(sanitize_part).collect();
            if parts.is_empty() {
                None
            } else {
                Some(Content {
                    role: content.role,
                    parts,
                })
            }
        })
        .collect()
}

fn sanitize_part(mut part: Part) -> Option<Part> {
    let plain_text = part.inline_data.is_none()
        && part.file_data.is_none()
        && part.function_call.is_none()
        && part.function_response.is_none()
        && !part.is_thought();

    if plain_text {
        match part.text.take() {
            Some(text) => {
                let trimmed = text.trim_end();
                if trimmed.is_empty() {
                    return None;
                }
                part.text = Some(trimmed.to_string());
            }
            None => return None,
        }
    }
    Some(part)
}

/// Orphan repair over a whole request body:
/// - a `functionResponse` whose id never appeared as a `functionCall` is
///   dropped;
/// - a `functionCall` whose id is never answered by a `functionResponse`
///   is replaced in place by a `"..."` text part.
///
/// Parts without ids are left alone (native Gemini pairs positionally).
pub fn repair_orphans(contents: Vec<Content>) -> Vec<Content> {
    let mut call_ids: HashSet<String> = HashSet::new();
    let mut response_ids: HashSet<String> = HashSet::new();
    for content in &contents {
        for part in &content.parts {
            if let Some(call) = &part.function_call
                && let Some(id) = &call.id
            {
                call_ids.insert(id.clone());
            }
            if let Some(response) = &part.function_response
                && let Some(id) = &response.id
            {
                response_ids.insert(id.clone());
            }
        }
    }

    let repaired = contents
        .into_iter()
        .map(|content| {
            let parts = content
                .parts
                .into_iter()
                .filter_map(|part| {
                    if let Some(response) = &part.function_response
                        && let Some(id) = &response.id
                        && !call_ids.contains(id)
                    {
                        return None;
                    }
                    if let Some(call) = &part.function_call
                        && let Some(id) = &call.id
                        && !response_ids.contains(id)
                    {
                        return Some(Part::text("..."));
                    }
                    Some(part)
                })
                .collect();
            Content {
                role: content.role,
                parts,
            }
        })
        .collect();

    sanitize_contents(repaired)
}

#[cfg(test)]
mod tests {
    use super::*;
    use agproxy_protocol::gemini::{ContentRole, FunctionCall, FunctionResponse};

    fn user(parts: Vec<Part>) -> Content {
        Content {
            role: Some(ContentRole::User),
            parts,
        }
    }

    fn model(parts: Vec<Part>) -> Content {
        Content {
            role: Some(ContentRole::Model),
            parts,
        }
    }

    fn call(id: &str) -> Part {
        Part {
            function_call: Some(FunctionCall {
                id: Some(id.to_string()),
                name: "tool".to_string(),
                args: Some(serde_json::json!({})),
            }),
            ..Part::default()
        }
    }

    fn response(id: &str) -> Part {
        Part {
            function_response: Some(FunctionResponse {
                id: Some(id.to_string()),
                name: "tool".to_string(),
                response: serde_json::json!({"output": "ok"}),
            }),
            ..Part::default()
        }
    }

    #[test]
    fn trims_and_drops_empty_text() {
        let contents = sanitize_contents(vec![
            user(vec![Part::text("hi  "), Part::text("   ")]),
            user(vec![Part::text("\n")]),
        ]);
        assert_eq!(contents.len(), 1);
        assert_eq!(contents[0].parts.len(), 1);
        assert_eq!(contents[0].parts[0].text.as_deref(), Some("hi"));
    }

    #[test]
    fn whitespace_thinking_parts_survive() {
        let contents = sanitize_contents(vec![model(vec![Part::thinking(" ", None)])]);
        assert_eq!(contents.len(), 1);
    }

    #[test]
    fn paired_calls_survive_orphans_do_not() {
        let contents = repair_orphans(vec![
            user(vec![Part::text("x")]),
            model(vec![call("A")]),
            user(vec![response("A")]),
            model(vec![call("B")]),
        ]);
        // A's pair intact; B replaced by a placeholder text part.
        assert_eq!(contents.len(), 4);
        assert!(contents[1].parts[0].function_call.is_some());
        assert!(contents[2].parts[0].function_response.is_some());
        assert_eq!(contents[3].parts[0].text.as_deref(), Some("..."));
        assert!(contents[3].parts[0].function_call.is_none());
    }

    #[test]
    fn orphan_result_is_dropped_entirely() {
        let contents = repair_orphans(vec![
            user(vec![Part::text("go")]),
            user(vec![response("missing")]),
        ]);
        assert_eq!(contents.len(), 1);
        assert_eq!(contents[0].parts[0].text.as_deref(), Some("go"));
    }

    #[test]
    fn repair_is_idempotent() {
        let contents = vec![
            user(vec![Part::text("x")]),
            model(vec![call("A")]),
            user(vec![response("A")]),
        ];
        let once = repair_orphans(contents);
        let twice = repair_orphans(once.clone());
        assert_eq!(once, twice);
    }
}
