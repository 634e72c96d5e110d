use std::collections::HashMap;
use std::sync::Mutex;

use agproxy_protocol::gemini::UsageMetadata;

/// Observational token counters per (model, credential). No billing
/// semantics; surfaced through logs and the stats snapshot only.
#[derive(Default)]
pub struct UsageStats {
    inner: Mutex<HashMap<(String, String), Counters>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    pub requests: u64,
    pub prompt_tokens: u64,
    pub output_tokens: u64,
    pub thinking_tokens: u64,
}

impl UsageStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, model: &str, credential: &str, usage: Option<&UsageMetadata>) {
        let mut inner = self.inner.lock().expect("usage stats poisoned");
        let counters = inner
            .entry((model.to_string(), credential.to_string()))
            .or_default();
        counters.requests += 1;
        if let Some(usage) = usage {
            counters.prompt_tokens += usage.prompt_token_count.unwrap_or(0);
            counters.output_tokens += usage.candidates_token_count.unwrap_or(0);
            counters.thinking_tokens += usage.thoughts_token_count.unwrap_or(0);
        }
    }

    pub fn snapshot(&self) -> Vec<(String, String, Counters)> {
        let inner = self.inner.lock().expect("usage stats poisoned");
        let mut rows: Vec<(String, String, Counters)> = inner
            .iter()
            .map(|((model, credential), counters)| {
                (model.clone(), credential.clone(), *counters)
            })
            .collect();
        rows.sort_by(|a, b| (&a.0, &a.1).cmp(&(&b.0, &b.1)));
        rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_per_pair() {
        let stats = UsageStats::new();
        let usage = UsageMetadata {
            prompt_token_count: Some(10),
            candidates_token_count: Some(4),
            thoughts_token_count: Some(2),
            ..UsageMetadata::default()
        };
        stats.record("m", "alice", Some(&usage));
        stats.record("m", "alice", Some(&usage));
        stats.record("m", "bob", None);

        let rows = stats.snapshot();
        assert_eq!(rows.len(), 2);
        let alice = &rows[0].2;
        assert_eq!(alice.requests, 2);
        assert_eq!(alice.prompt_tokens, 20);
        assert_eq!(alice.thinking_tokens, 4);
    }
}
