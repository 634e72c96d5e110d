//! Gemini-dialect normalization.
//!
//! Native Gemini requests mostly pass through: the typed deserialization
//! already whitelists part keys and folds the `system_instructions`
//! alias. What remains is part hygiene, the mandatory prologue, and
//! synthesizing `thinkingConfig` / `imageConfig` from model-name
//! suffixes.

use agproxy_protocol::antigravity::SYSTEM_PROLOGUE;
use agproxy_protocol::gemini::{
    Content, GenerateContentRequest, GenerationConfig, ImageConfig, Part, ThinkingConfig,
};
use agproxy_protocol::models::{ResolvedModel, ThinkingVariant};

use crate::TranslateError;
use crate::sanitize::{repair_orphans, sanitize_contents};

pub fn to_upstream(
    mut request: GenerateContentRequest,
    resolved: &ResolvedModel,
) -> Result<GenerateContentRequest, TranslateError> {
    request.contents = repair_orphans(sanitize_contents(std::mem::take(&mut request.contents)));
    if request.contents.is_empty() {
        return Err(TranslateError("no usable contents in request".to_string()));
    }

    request.system_instruction = Some(with_prologue(request.system_instruction.take()));

    if let Some(thinking) = synthesized_thinking(resolved) {
        let config = request.generation_config.get_or_insert_with(GenerationConfig::default);
        if config.thinking_config.is_none() {
            config.thinking_config = Some(thinking);
        }
    }

    if resolved.image.aspect_ratio.is_some() || resolved.image.image_size.is_some() {
        let config = request.generation_config.get_or_insert_with(GenerationConfig::default);
        config.image_config = Some(ImageConfig {
            aspect_ratio: resolved.image.aspect_ratio.clone(),
            image_size: resolved.image.image_size.clone(),
        });
    }

    Ok(request)
}

fn with_prologue(system_instruction: Option<Content>) -> Content {
    let mut parts = vec![Part::text(SYSTEM_PROLOGUE)];
    if let Some(existing) = system_instruction {
        let already_present = existing
            .parts
            .first()
            .and_then(|part| part.text.as_deref())
            .is_some_and(|text| text.starts_with("You are Antigravity"));
        if already_present {
            return existing;
        }
        parts.extend(existing.parts);
    }
    Content { role: None, parts }
}

/// Budgets for suffix-driven thinking variants, per model family.
pub fn synthesized_thinking(resolved: &ResolvedModel) -> Option<ThinkingConfig> {
    match resolved.thinking {
        ThinkingVariant::Default => None,
        ThinkingVariant::Off => Some(ThinkingConfig {
            include_thoughts: false,
            thinking_budget: Some(0),
        }),
        ThinkingVariant::Max => {
            let budget = if resolved.upstream.contains("pro") {
                32_768
            } else {
                24_576
            };
            Some(ThinkingConfig {
                include_thoughts: true,
                thinking_budget: Some(budget),
            })
        }
    }
}
