//! Thought-signature recovery.
//!
//! When history comes back from a client, signatures may arrive intact,
//! embedded in an encoded tool id, cached from an earlier stream, or not
//! at all. Recovery runs a fixed ladder and the caller substitutes the
//! upstream's bypass sentinel only when every rung misses.

use agproxy_pool::SignatureCache;

/// `toolu_<id>__sig__<hex>`: some clients round-trip tool ids verbatim,
/// so the signature can ride inside the id itself.
const SIG_MARKER: &str = "__sig__";

pub fn decode_tool_id(tool_id: &str) -> (String, Option<String>) {
    match tool_id.split_once(SIG_MARKER) {
        Some((bare, hex)) => (bare.to_string(), decode_hex(hex)),
        None => (tool_id.to_string(), None),
    }
}

pub fn encode_tool_id(tool_id: &str, signature: &str) -> String {
    let hex: String = signature.bytes().fold(String::new(), |mut acc, b| {
        acc.push_str(&format!("{b:02x}"));
        acc
    });
    format!("{tool_id}{SIG_MARKER}{hex}")
}

fn decode_hex(hex: &str) -> Option<String> {
    if hex.is_empty() || hex.len() % 2 != 0 {
        return None;
    }
    let mut bytes = Vec::with_capacity(hex.len() / 2);
    let chars: Vec<u8> = hex.bytes().collect();
    for pair in chars.chunks(2) {
        let hi = (pair[0] as char).to_digit(16)?;
        let lo = (pair[1] as char).to_digit(16)?;
        bytes.push(((hi << 4) | lo) as u8);
    }
    String::from_utf8(bytes).ok()
}

/// Recovery ladder for a replayed `tool_use`:
/// client signature → request-context signature → encoded-id payload →
/// session-scoped signature → tool-id cache → most recent signature.
pub fn recover_tool_signature(
    tool_id: &str,
    client_signature: Option<&str>,
    context_signature: Option<&str>,
    session_signature: Option<&str>,
    cache: &SignatureCache,
) -> Option<String> {
    if let Some(signature) = non_empty(client_signature) {
        return Some(signature);
    }
    if let Some(signature) = non_empty(context_signature) {
        return Some(signature);
    }
    let (bare_id, embedded) = decode_tool_id(tool_id);
    if let Some(signature) = embedded {
        return Some(signature);
    }
    if let Some(signature) = non_empty(session_signature) {
        return Some(signature);
    }
    if let Some(signature) = cache.get_tool(&bare_id) {
        return Some(signature);
    }
    cache.get_last().map(|(signature, _)| signature)
}

/// Recovery for a replayed thinking block: client signature, then the
/// text-keyed cache, then the most recent signature seen.
pub fn recover_thinking_signature(
    thinking_text: &str,
    client_signature: Option<&str>,
    cache: &SignatureCache,
) -> Option<String> {
    if let Some(signature) = non_empty(client_signature) {
        return Some(signature);
    }
    if let Some(signature) = cache.get(thinking_text) {
        return Some(signature);
    }
    cache.get_last().map(|(signature, _)| signature)
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use agproxy_pool::signature::MIN_SIGNATURE_LEN;

    fn sig(tag: char) -> String {
        std::iter::repeat_n(tag, MIN_SIGNATURE_LEN).collect()
    }

    #[test]
    fn encoded_id_round_trips() {
        let encoded = encode_tool_id("toolu_01", "sigvalue");
        let (bare, signature) = decode_tool_id(&encoded);
        assert_eq!(bare, "toolu_01");
        assert_eq!(signature.as_deref(), Some("sigvalue"));

        let (bare, signature) = decode_tool_id("toolu_plain");
        assert_eq!(bare, "toolu_plain");
        assert!(signature.is_none());
    }

    #[test]
    fn ladder_prefers_client_signature() {
        let cache = SignatureCache::default();
        cache.put_tool("toolu_01", &sig('c'));
        let recovered = recover_tool_signature(
            "toolu_01",
            Some("client-sig"),
            Some("context-sig"),
            None,
            &cache,
        );
        assert_eq!(recovered.as_deref(), Some("client-sig"));
    }

    #[test]
    fn ladder_falls_through_to_cache_and_last() {
        let cache = SignatureCache::default();
        cache.put_tool("toolu_01", &sig('t'));
        let recovered = recover_tool_signature("toolu_01", None, None, None, &cache);
        assert_eq!(recovered, Some(sig('t')));

        cache.put("some thinking", &sig('z'));
        let recovered = recover_tool_signature("toolu_unknown", None, None, None, &cache);
        assert_eq!(recovered, Some(sig('z')));
    }

    #[test]
    fn thinking_recovery_uses_text_cache() {
        let cache = SignatureCache::default();
        cache.put("the thought", &sig('a'));
        let recovered = recover_thinking_signature("the thought", None, &cache);
        assert_eq!(recovered, Some(sig('a')));
        let recovered = recover_thinking_signature("unseen", Some(""), &cache);
        assert_eq!(recovered, Some(sig('a')));
    }
}
