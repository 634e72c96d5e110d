//! Model catalog: upstream-supported names, client alias rewriting, and
//! the suffix conventions that encode thinking / image variants.

/// Model names the Antigravity upstream accepts.
pub const UPSTREAM_MODELS: &[&str] = &[
    "gemini-2.5-flash",
    "gemini-2.5-flash-lite",
    "gemini-2.5-flash-image",
    "gemini-2.5-pro",
    "gemini-3-flash",
    "gemini-3-pro-low",
    "gemini-3-pro-high",
    "gemini-3-pro-image",
    "claude-sonnet-4-5",
    "claude-sonnet-4-5-thinking",
    "claude-opus-4-5-thinking",
    "gpt-oss-120b-medium",
];

const HAIKU_FALLBACK_TARGET: &str = "gemini-3-flash";
const FAMILY_DEFAULT: &str = "claude-sonnet-4-5";

/// Fixed alias table; entries not found here go through suffix stripping
/// and then family defaults.
const ALIASES: &[(&str, &str)] = &[
    ("claude-sonnet-4-5-thinking", "claude-sonnet-4-5-thinking"),
    ("claude-opus-4-5", "claude-opus-4-5-thinking"),
    ("gemini-2.5-flash-thinking", "gemini-2.5-flash"),
    ("claude-4.5-opus-high-thinking", "claude-opus-4-5-thinking"),
    ("claude-4.5-opus-high", "claude-opus-4-5-thinking"),
    ("claude-4.5-opus", "claude-opus-4-5-thinking"),
    ("claude-4.5-opus-thinking", "claude-opus-4-5-thinking"),
    ("claude-4.5-sonnet-high-thinking", "claude-sonnet-4-5-thinking"),
    ("claude-4.5-sonnet-high", "claude-sonnet-4-5"),
    ("claude-4.5-sonnet", "claude-sonnet-4-5"),
    ("claude-4.5-sonnet-thinking", "claude-sonnet-4-5-thinking"),
    ("claude-sonnet-4.5", "claude-sonnet-4-5"),
    ("claude-3-5-sonnet-20241022", "claude-sonnet-4-5"),
    ("claude-3-5-sonnet-20240620", "claude-sonnet-4-5"),
    ("claude-3-5-sonnet", "claude-sonnet-4-5"),
    ("claude-3-opus-20240229", "claude-opus-4-5-thinking"),
    ("claude-3-opus", "claude-opus-4-5-thinking"),
    ("claude-opus-4", "gemini-3-pro-high"),
    ("gemini-3-pro", "gemini-3-pro-high"),
    ("gpt-4", "claude-opus-4-5-thinking"),
    ("gpt-4-turbo", "claude-opus-4-5-thinking"),
    ("gpt-4o", "claude-sonnet-4-5"),
    ("gpt-oss-120b", "gpt-oss-120b-medium"),
];

/// Which backend family an alias implies when no routing rule matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFamily {
    Gemini,
    Claude,
    Gpt,
    Other,
}

pub fn family_of(model: &str) -> ModelFamily {
    let lower = model.to_ascii_lowercase();
    if lower.starts_with("gemini") {
        ModelFamily::Gemini
    } else if lower.starts_with("claude") {
        ModelFamily::Claude
    } else if lower.starts_with("gpt") {
        ModelFamily::Gpt
    } else {
        ModelFamily::Other
    }
}

/// Thinking variant requested through a model-name suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThinkingVariant {
    Default,
    Max,
    Off,
}

/// Image generation options decoded from a model-name suffix
/// (`-16x9`, `-4k`, ...).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageVariant {
    pub aspect_ratio: Option<String>,
    pub image_size: Option<String>,
}

/// A client-facing model alias resolved against the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedModel {
    /// The upstream name to send.
    pub upstream: String,
    pub thinking: ThinkingVariant,
    pub image: ImageVariant,
}

/// Lowercase and strip the decorations clients append: `-thinking`,
/// `-maxthinking`, `-nothinking`, a trailing `-YYYYMMDD` date, and the
/// image suffixes. Returns the bare alias plus what was stripped.
fn strip_suffixes(alias: &str) -> (String, ThinkingVariant, ImageVariant) {
    let mut name = alias
        .trim()
        .trim_start_matches("models/")
        .to_ascii_lowercase();
    let mut thinking = ThinkingVariant::Default;
    let mut image = ImageVariant::default();

    // Size rides after the aspect ratio when both are present
    // (`…-image-16x9-4k`), so peel it off first.
    for (suffix, size) in [("-4k", "4K"), ("-2k", "2K"), ("-1k", "1K")] {
        if let Some(stripped) = name.strip_suffix(suffix) {
            image.image_size = Some(size.to_string());
            name = stripped.to_string();
            break;
        }
    }
    for (suffix, ratio) in [
        ("-16x9", "16:9"),
        ("-9x16", "9:16"),
        ("-4x3", "4:3"),
        ("-3x4", "3:4"),
        ("-1x1", "1:1"),
    ] {
        if let Some(stripped) = name.strip_suffix(suffix) {
            image.aspect_ratio = Some(ratio.to_string());
            name = stripped.to_string();
            break;
        }
    }

    if let Some(stripped) = name.strip_suffix("-maxthinking") {
        thinking = ThinkingVariant::Max;
        name = stripped.to_string();
    } else if let Some(stripped) = name.strip_suffix("-nothinking") {
        thinking = ThinkingVariant::Off;
        name = stripped.to_string();
    }

    (name, thinking, image)
}

fn strip_date_suffix(name: &str) -> &str {
    // claude-opus-4-5-20251101 style version pins.
    if let Some(idx) = name.rfind('-') {
        let tail = &name[idx + 1..];
        if tail.len() == 8 && tail.chars().all(|c| c.is_ascii_digit()) {
            return &name[..idx];
        }
    }
    name
}

fn is_haiku(name: &str) -> bool {
    name.contains("haiku")
}

/// Resolve a client-facing alias onto an upstream model name.
pub fn resolve(alias: &str) -> ResolvedModel {
    let (name, thinking, image) = strip_suffixes(alias);
    let name = strip_date_suffix(&name).to_string();

    let upstream = if UPSTREAM_MODELS.contains(&name.as_str()) {
        name.clone()
    } else if let Some((_, target)) = ALIASES.iter().find(|(from, _)| *from == name) {
        (*target).to_string()
    } else if is_haiku(&name) {
        HAIKU_FALLBACK_TARGET.to_string()
    } else {
        match family_of(&name) {
            ModelFamily::Gemini => "gemini-3-pro-high".to_string(),
            ModelFamily::Claude => FAMILY_DEFAULT.to_string(),
            ModelFamily::Gpt => "gpt-oss-120b-medium".to_string(),
            ModelFamily::Other => FAMILY_DEFAULT.to_string(),
        }
    };

    ResolvedModel {
        upstream,
        thinking,
        image,
    }
}

/// Routing-rule key normalization: lowercase, then `-thinking` / date
/// suffix stripped as a lookup fallback.
pub fn routing_keys(alias: &str) -> Vec<String> {
    let lower = alias.trim().to_ascii_lowercase();
    let mut keys = vec![lower.clone()];
    if let Some(stripped) = lower.strip_suffix("-thinking") {
        keys.push(stripped.to_string());
    }
    let dateless = strip_date_suffix(&lower);
    if dateless != lower {
        keys.push(dateless.to_string());
    }
    keys
}

pub fn is_thinking_model(model: &str) -> bool {
    model.contains("-thinking") || model.to_ascii_lowercase().contains("pro")
}

pub fn is_image_model(model: &str) -> bool {
    model.to_ascii_lowercase().contains("image")
}

/// `requestType` header value derived from the model.
pub fn request_type_for_model(model: &str) -> &'static str {
    if is_image_model(model) { "image_gen" } else { "agent" }
}

/// Context-window budget (tokens) used by the truncation pass.
pub fn context_budget(model: &str) -> usize {
    let lower = model.to_ascii_lowercase();
    if lower.contains("gemini-3-pro") || lower.contains("gemini-2.5-pro") {
        1_000_000
    } else if lower.starts_with("gemini") {
        500_000
    } else if lower.contains("opus") {
        200_000
    } else if lower.starts_with("claude") {
        200_000
    } else {
        128_000
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aliases_map_to_upstream_names() {
        assert_eq!(resolve("claude-sonnet-4.5").upstream, "claude-sonnet-4-5");
        assert_eq!(
            resolve("claude-3-5-sonnet-20241022").upstream,
            "claude-sonnet-4-5"
        );
        assert_eq!(
            resolve("claude-4.5-sonnet-high-thinking").upstream,
            "claude-sonnet-4-5-thinking"
        );
        assert_eq!(resolve("gemini-3-pro").upstream, "gemini-3-pro-high");
        assert_eq!(resolve("gpt-4o").upstream, "claude-sonnet-4-5");
    }

    #[test]
    fn date_pins_are_stripped() {
        assert_eq!(
            resolve("claude-opus-4-5-20251101").upstream,
            "claude-opus-4-5-thinking"
        );
    }

    #[test]
    fn haiku_falls_to_flash() {
        assert_eq!(resolve("claude-haiku-4-5").upstream, "gemini-3-flash");
    }

    #[test]
    fn unknown_names_fall_to_family_default() {
        assert_eq!(resolve("claude-9-colossus").upstream, "claude-sonnet-4-5");
        assert_eq!(resolve("gemini-99").upstream, "gemini-3-pro-high");
        assert_eq!(resolve("totally-unknown").upstream, "claude-sonnet-4-5");
    }

    #[test]
    fn image_suffixes_decode() {
        let resolved = resolve("gemini-3-pro-image-16x9-4k");
        assert_eq!(resolved.upstream, "gemini-3-pro-image");
        assert_eq!(resolved.image.aspect_ratio.as_deref(), Some("16:9"));
        assert_eq!(resolved.image.image_size.as_deref(), Some("4K"));
    }

    #[test]
    fn thinking_suffixes_decode() {
        assert_eq!(
            resolve("gemini-3-flash-maxthinking").thinking,
            ThinkingVariant::Max
        );
        assert_eq!(
            resolve("gemini-3-flash-nothinking").thinking,
            ThinkingVariant::Off
        );
    }

    #[test]
    fn routing_keys_include_suffix_stripped_fallbacks() {
        let keys = routing_keys("Claude-Sonnet-4-5-Thinking");
        assert_eq!(keys[0], "claude-sonnet-4-5-thinking");
        assert!(keys.contains(&"claude-sonnet-4-5".to_string()));
    }
}
