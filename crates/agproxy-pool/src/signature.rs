use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Thought-signature cache.
///
/// The upstream signs every thinking block; clients routinely strip the
/// signature before replaying history, and the upstream then rejects the
/// turn. This cache maps a fingerprint of the thinking text back to its
/// signature (plus a tool-id table for function calls) so the translator
/// can reinstate them. Correctness-bearing state, not an optimization.
pub struct SignatureCache {
    inner: Mutex<Inner>,
    capacity: usize,
    ttl: Duration,
    min_signature_len: usize,
}

struct Inner {
    by_text: HashMap<String, CacheEntry>,
    text_order: VecDeque<String>,
    by_tool: HashMap<String, CacheEntry>,
    tool_order: VecDeque<String>,
    last: Option<(String, String)>,
}

#[derive(Clone)]
struct CacheEntry {
    signature: String,
    created: Instant,
}

/// Shortest signature the upstream has been observed to accept.
pub const MIN_SIGNATURE_LEN: usize = 55;

const DEFAULT_CAPACITY: usize = 8192;
const DEFAULT_TTL: Duration = Duration::from_secs(45 * 60);

impl Default for SignatureCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_TTL)
    }
}

impl SignatureCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                by_text: HashMap::new(),
                text_order: VecDeque::new(),
                by_tool: HashMap::new(),
                tool_order: VecDeque::new(),
                last: None,
            }),
            capacity: capacity.max(1),
            ttl,
            min_signature_len: MIN_SIGNATURE_LEN,
        }
    }

    fn fingerprint(text: &str) -> String {
        blake3::hash(text.as_bytes()).to_hex().to_string()
    }

    /// Store a thinking-text → signature association. Empty text and
    /// too-short signatures are rejected.
    pub fn put(&self, thinking_text: &str, signature: &str) {
        if thinking_text.trim().is_empty() || signature.len() < self.min_signature_len {
            return;
        }
        let key = Self::fingerprint(thinking_text);
        let mut inner = self.inner.lock().expect("signature cache poisoned");
        if inner.by_text.len() >= self.capacity
            && !inner.by_text.contains_key(&key)
            && let Some(evicted) = inner.text_order.pop_front()
        {
            inner.by_text.remove(&evicted);
        }
        inner.by_text.insert(
            key.clone(),
            CacheEntry {
                signature: signature.to_string(),
                created: Instant::now(),
            },
        );
        inner.text_order.retain(|k| *k != key);
        inner.text_order.push_back(key);
        inner.last = Some((signature.to_string(), thinking_text.to_string()));
    }

    pub fn get(&self, thinking_text: &str) -> Option<String> {
        let key = Self::fingerprint(thinking_text);
        let mut inner = self.inner.lock().expect("signature cache poisoned");
        match inner.by_text.get(&key) {
            Some(entry) if entry.created.elapsed() <= self.ttl => Some(entry.signature.clone()),
            Some(_) => {
                inner.by_text.remove(&key);
                inner.text_order.retain(|k| *k != key);
                None
            }
            None => None,
        }
    }

    pub fn put_tool(&self, tool_use_id: &str, signature: &str) {
        if tool_use_id.is_empty() || signature.len() < self.min_signature_len {
            return;
        }
        let mut inner = self.inner.lock().expect("signature cache poisoned");
        if inner.by_tool.len() >= self.capacity
            && !inner.by_tool.contains_key(tool_use_id)
            && let Some(evicted) = inner.tool_order.pop_front()
        {
            inner.by_tool.remove(&evicted);
        }
        inner.by_tool.insert(
            tool_use_id.to_string(),
            CacheEntry {
                signature: signature.to_string(),
                created: Instant::now(),
            },
        );
        inner.tool_order.retain(|k| k != tool_use_id);
        inner.tool_order.push_back(tool_use_id.to_string());
    }

    pub fn get_tool(&self, tool_use_id: &str) -> Option<String> {
        let mut inner = self.inner.lock().expect("signature cache poisoned");
        match inner.by_tool.get(tool_use_id) {
            Some(entry) if entry.created.elapsed() <= self.ttl => Some(entry.signature.clone()),
            Some(_) => {
                inner.by_tool.remove(tool_use_id);
                inner.tool_order.retain(|k| k != tool_use_id);
                None
            }
            None => None,
        }
    }

    /// Most recent `(signature, thinking_text)` seen; the last-resort rung
    /// of the recovery ladder.
    pub fn get_last(&self) -> Option<(String, String)> {
        self.inner
            .lock()
            .expect("signature cache poisoned")
            .last
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sig(tag: char) -> String {
        std::iter::repeat_n(tag, MIN_SIGNATURE_LEN + 5).collect()
    }

    #[test]
    fn put_get_round_trip() {
        let cache = SignatureCache::default();
        cache.put("thinking about it", &sig('a'));
        assert_eq!(cache.get("thinking about it"), Some(sig('a')));
        assert_eq!(cache.get("something else"), None);
    }

    #[test]
    fn rejects_empty_text_and_short_signatures() {
        let cache = SignatureCache::default();
        cache.put("  ", &sig('a'));
        cache.put("real text", "short");
        assert_eq!(cache.get("real text"), None);
        assert!(cache.get_last().is_none());
    }

    #[test]
    fn lru_evicts_oldest() {
        let cache = SignatureCache::new(2, Duration::from_secs(60));
        cache.put("one", &sig('1'));
        cache.put("two", &sig('2'));
        cache.put("three", &sig('3'));
        assert_eq!(cache.get("one"), None);
        assert_eq!(cache.get("two"), Some(sig('2')));
        assert_eq!(cache.get("three"), Some(sig('3')));
    }

    #[test]
    fn tool_table_is_independent() {
        let cache = SignatureCache::default();
        cache.put_tool("toolu_123", &sig('t'));
        assert_eq!(cache.get_tool("toolu_123"), Some(sig('t')));
        assert_eq!(cache.get("toolu_123"), None);
    }

    #[test]
    fn get_last_tracks_most_recent() {
        let cache = SignatureCache::default();
        cache.put("first", &sig('f'));
        cache.put("second", &sig('s'));
        let (signature, text) = cache.get_last().unwrap();
        assert_eq!(signature, sig('s'));
        assert_eq!(text, "second");
    }
}
