use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Conversation-scoped state for the NDJSON bridge: the model the
/// conversation settled on and the tool calls we issued, so later
/// `tool_result` nodes can be paired back up. Entries age out on access.
pub struct ConversationStore {
    inner: Mutex<HashMap<String, Entry>>,
    ttl: Duration,
}

struct Entry {
    model: Option<String>,
    /// tool_use_id → (tool_name, arguments_json)
    calls: HashMap<String, (String, String)>,
    touched: Instant,
}

const DEFAULT_TTL: Duration = Duration::from_secs(45 * 60);

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl ConversationStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    fn prune(map: &mut HashMap<String, Entry>, ttl: Duration) {
        map.retain(|_, entry| entry.touched.elapsed() <= ttl);
    }

    pub fn remember_call(&self, conversation: &str, id: &str, name: &str, args_json: &str) {
        let mut map = self.inner.lock().expect("conversation store poisoned");
        Self::prune(&mut map, self.ttl);
        let entry = map.entry(conversation.to_string()).or_insert_with(|| Entry {
            model: None,
            calls: HashMap::new(),
            touched: Instant::now(),
        });
        entry.touched = Instant::now();
        entry
            .calls
            .insert(id.to_string(), (name.to_string(), args_json.to_string()));
    }

    pub fn lookup_call(&self, conversation: &str, id: &str) -> Option<(String, String)> {
        let mut map = self.inner.lock().expect("conversation store poisoned");
        Self::prune(&mut map, self.ttl);
        let entry = map.get_mut(conversation)?;
        entry.touched = Instant::now();
        entry.calls.get(id).cloned()
    }

    pub fn set_model(&self, conversation: &str, model: &str) {
        let mut map = self.inner.lock().expect("conversation store poisoned");
        Self::prune(&mut map, self.ttl);
        let entry = map.entry(conversation.to_string()).or_insert_with(|| Entry {
            model: None,
            calls: HashMap::new(),
            touched: Instant::now(),
        });
        entry.touched = Instant::now();
        entry.model = Some(model.to_string());
    }

    pub fn model_of(&self, conversation: &str) -> Option<String> {
        let mut map = self.inner.lock().expect("conversation store poisoned");
        Self::prune(&mut map, self.ttl);
        map.get(conversation).and_then(|entry| entry.model.clone())
    }
}
