use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use agproxy_common::CredentialKind;
use agproxy_protocol::antigravity::ModelQuota;

/// TTL-bounded, in-memory quota snapshots per credential, fed from the
/// upstream's available-models endpoint. Never persisted.
pub struct QuotaCache {
    inner: Mutex<HashMap<(CredentialKind, String), Snapshot>>,
    ttl: Duration,
}

struct Snapshot {
    fetched: Instant,
    models: HashMap<String, ModelQuota>,
}

const DEFAULT_TTL: Duration = Duration::from_secs(15 * 60);

impl Default for QuotaCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl QuotaCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    pub fn store(
        &self,
        kind: CredentialKind,
        name: &str,
        models: impl IntoIterator<Item = (String, ModelQuota)>,
    ) {
        let mut inner = self.inner.lock().expect("quota cache poisoned");
        inner.insert(
            (kind, name.to_string()),
            Snapshot {
                fetched: Instant::now(),
                models: models.into_iter().collect(),
            },
        );
    }

    pub fn get(&self, kind: CredentialKind, name: &str, model: &str) -> Option<ModelQuota> {
        let inner = self.inner.lock().expect("quota cache poisoned");
        let snapshot = inner.get(&(kind, name.to_string()))?;
        if snapshot.fetched.elapsed() > self.ttl {
            return None;
        }
        snapshot.models.get(model).cloned()
    }

    pub fn all_for(&self, kind: CredentialKind, name: &str) -> Vec<(String, ModelQuota)> {
        let inner = self.inner.lock().expect("quota cache poisoned");
        let Some(snapshot) = inner.get(&(kind, name.to_string())) else {
            return Vec::new();
        };
        if snapshot.fetched.elapsed() > self.ttl {
            return Vec::new();
        }
        let mut rows: Vec<(String, ModelQuota)> = snapshot
            .models
            .iter()
            .map(|(model, quota)| (model.clone(), quota.clone()))
            .collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        rows
    }
}
