//! Context-pressure relief: token estimation, oversized tool-result
//! compression, and smart truncation under a model budget.

use agproxy_protocol::gemini::{Content, GenerateContentRequest, Part};

use crate::sanitize::repair_orphans;

/// Universal fallback: four characters per token.
pub fn estimate_text_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

pub fn estimate_part_tokens(part: &Part) -> usize {
    let mut chars = 0usize;
    if let Some(text) = &part.text {
        chars += text.chars().count();
    }
    if let Some(blob) = &part.inline_data {
        // Base64 payloads bill roughly like text.
        chars += blob.data.len();
    }
    if let Some(call) = &part.function_call {
        chars += call.name.chars().count();
        if let Some(args) = &call.args {
            chars += args.to_string().chars().count();
        }
    }
    if let Some(response) = &part.function_response {
        chars += response.response.to_string().chars().count();
    }
    chars.div_ceil(4)
}

pub fn estimate_request_tokens(request: &GenerateContentRequest) -> usize {
    let mut tokens = 0usize;
    if let Some(system) = &request.system_instruction {
        tokens += system.parts.iter().map(estimate_part_tokens).sum::<usize>();
    }
    for content in &request.contents {
        tokens += content.parts.iter().map(estimate_part_tokens).sum::<usize>();
    }
    if let Some(tools) = &request.tools {
        for tool in tools {
            if let Some(declarations) = &tool.function_declarations {
                for declaration in declarations {
                    tokens += estimate_text_tokens(&declaration.name);
                    tokens += estimate_text_tokens(&declaration.description);
                    if let Some(parameters) = &declaration.parameters {
                        tokens += estimate_text_tokens(&parameters.to_string());
                    }
                }
            }
        }
    }
    tokens
}

const COMPRESS_THRESHOLD_CHARS: usize = 40_000;
const HEAD_KEEP: usize = 12_000;
const TAIL_KEEP: usize = 8_000;

/// Shrink an oversized tool-result string, preserving head and tail.
/// Browser-snapshot-ish content gets its markup ballast stripped first,
/// and "output saved to file" notices collapse to the notice line.
pub fn compress_tool_output(output: &str) -> String {
    if output.chars().count() <= COMPRESS_THRESHOLD_CHARS {
        return output.to_string();
    }

    if let Some(line) = output
        .lines()
        .find(|line| line.to_ascii_lowercase().contains("output saved to"))
    {
        return line.trim().to_string();
    }

    let stripped = if looks_like_markup(output) {
        strip_markup_ballast(output)
    } else {
        output.to_string()
    };
    if stripped.chars().count() <= COMPRESS_THRESHOLD_CHARS {
        return stripped;
    }

    let chars: Vec<char> = stripped.chars().collect();
    let head: String = chars[..HEAD_KEEP.min(chars.len())].iter().collect();
    let tail: String = chars[chars.len().saturating_sub(TAIL_KEEP)..].iter().collect();
    let omitted = chars.len().saturating_sub(HEAD_KEEP + TAIL_KEEP);
    format!("{head}\n\n[... {omitted} characters omitted ...]\n\n{tail}")
}

fn looks_like_markup(text: &str) -> bool {
    let mut end = text.len().min(2048);
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    let head = &text[..end];
    head.contains("<html") || head.contains("<style") || head.contains("<svg") || head.contains("<script")
}

/// Drop `<style>`, `<script>`, `<svg>` bodies and long base64 runs.
fn strip_markup_ballast(text: &str) -> String {
    let mut out = text.to_string();
    for tag in ["style", "script", "svg"] {
        out = strip_tag(&out, tag);
    }
    strip_base64_runs(&out)
}

fn strip_tag(text: &str, tag: &str) -> String {
    let open = format!("<{tag}");
    let close = format!("</{tag}>");
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    loop {
        let lower = rest.to_ascii_lowercase();
        let Some(start) = lower.find(&open) else {
            out.push_str(rest);
            return out;
        };
        out.push_str(&rest[..start]);
        match lower[start..].find(&close) {
            Some(end) => rest = &rest[start + end + close.len()..],
            None => return out,
        }
    }
}

fn strip_base64_runs(text: &str) -> String {
    const MIN_RUN: usize = 512;
    let mut out = String::with_capacity(text.len());
    let mut run = String::new();
    for c in text.chars() {
        let is_b64 = c.is_ascii_alphanumeric() || c == '+' || c == '/' || c == '=';
        if is_b64 {
            run.push(c);
            continue;
        }
        if run.len() >= MIN_RUN {
            out.push_str("[base64 omitted]");
        } else {
            out.push_str(&run);
        }
        run.clear();
        out.push(c);
    }
    if run.len() >= MIN_RUN {
        out.push_str("[base64 omitted]");
    } else {
        out.push_str(&run);
    }
    out
}

fn compress_contents(contents: &mut [Content]) {
    for content in contents.iter_mut() {
        for part in content.parts.iter_mut() {
            if let Some(response) = part.function_response.as_mut()
                && let Some(output) = response.response.get("output").and_then(|v| v.as_str())
            {
                let compressed = compress_tool_output(output);
                if compressed.len() < output.len() {
                    response.response = serde_json::json!({ "output": compressed });
                }
            }
        }
    }
}

/// Recent tool-call rounds to always keep during truncation.
const KEEP_RECENT_TOOL_ROUNDS: usize = 3;

/// Bring the request under `budget_tokens`: compress tool results first,
/// then evict the oldest turns while keeping the system instruction, the
/// last few tool rounds, and the most recent messages. Pair integrity is
/// restored by the orphan-repair pass afterwards.
pub fn apply_context_pressure(
    mut request: GenerateContentRequest,
    budget_tokens: usize,
) -> GenerateContentRequest {
    if estimate_request_tokens(&request) <= budget_tokens {
        return request;
    }

    compress_contents(&mut request.contents);
    if estimate_request_tokens(&request) <= budget_tokens {
        return request;
    }

    let overhead = estimate_request_tokens(&GenerateContentRequest {
        contents: Vec::new(),
        ..request.clone()
    });
    let content_budget = budget_tokens.saturating_sub(overhead);

    let contents = std::mem::take(&mut request.contents);
    let total = contents.len();
    let mut kept_rev: Vec<Content> = Vec::new();
    let mut spent = 0usize;
    let mut tool_rounds = 0usize;

    for (offset, content) in contents.into_iter().rev().enumerate() {
        let cost: usize = content.parts.iter().map(estimate_part_tokens).sum();
        let is_tool_round = content
            .parts
            .iter()
            .any(|part| part.function_call.is_some() || part.function_response.is_some());
        let must_keep = offset == 0
            || (is_tool_round && tool_rounds < KEEP_RECENT_TOOL_ROUNDS * 2)
            || offset + 1 == total;
        if spent + cost > content_budget && !must_keep {
            continue;
        }
        if is_tool_round {
            tool_rounds += 1;
        }
        spent += cost;
        kept_rev.push(content);
    }

    kept_rev.reverse();
    request.contents = repair_orphans(kept_rev);
    request
}

#[cfg(test)]
mod tests {
    use super::*;
    use agproxy_protocol::gemini::ContentRole;

    fn text_turn(role: ContentRole, text: &str) -> Content {
        Content {
            role: Some(role),
            parts: vec![Part::text(text)],
        }
    }

    #[test]
    fn small_outputs_pass_through() {
        assert_eq!(compress_tool_output("short"), "short");
    }

    #[test]
    fn long_outputs_keep_head_and_tail() {
        let long: String = "x".repeat(100_000);
        let compressed = compress_tool_output(&long);
        assert!(compressed.len() < long.len());
        assert!(compressed.contains("characters omitted"));
        assert!(compressed.starts_with('x'));
        assert!(compressed.ends_with('x'));
    }

    #[test]
    fn saved_to_file_notice_collapses() {
        let mut long = String::from("preamble\nOutput saved to /tmp/result.txt\n");
        long.push_str(&"y".repeat(60_000));
        let compressed = compress_tool_output(&long);
        assert_eq!(compressed, "Output saved to /tmp/result.txt");
    }

    #[test]
    fn markup_ballast_is_stripped() {
        let mut page = String::from("<html><style>");
        page.push_str(&"c".repeat(60_000));
        page.push_str("</style><body>hello</body></html>");
        let compressed = compress_tool_output(&page);
        assert!(compressed.contains("hello"));
        assert!(!compressed.contains("ccc"));
    }

    #[test]
    fn truncation_keeps_newest_and_fits_budget() {
        let mut contents = Vec::new();
        for i in 0..40 {
            contents.push(text_turn(ContentRole::User, &format!("question {i} {}", "q".repeat(400))));
            contents.push(text_turn(ContentRole::Model, &format!("answer {i} {}", "a".repeat(400))));
        }
        let request = GenerateContentRequest {
            contents,
            ..GenerateContentRequest::default()
        };
        let before = estimate_request_tokens(&request);
        let squeezed = apply_context_pressure(request, before / 4);
        let after = estimate_request_tokens(&squeezed);
        assert!(after < before);
        // The newest turn always survives.
        let last_text = squeezed
            .contents
            .last()
            .unwrap()
            .parts[0]
            .text
            .as_deref()
            .unwrap();
        assert!(last_text.starts_with("answer 39"));
    }

    #[test]
    fn under_budget_requests_are_untouched() {
        let request = GenerateContentRequest {
            contents: vec![text_turn(ContentRole::User, "hi")],
            ..GenerateContentRequest::default()
        };
        let same = apply_context_pressure(request.clone(), 10_000);
        assert_eq!(request, same);
    }
}
