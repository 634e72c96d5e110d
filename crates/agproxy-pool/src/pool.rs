use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use agproxy_common::CredentialKind;

use crate::cooldown::{
    SERVER_ERROR_COOLDOWN, classify_429_lockout, parse_cooldown_hint, tiered_quota_lockout,
};
use crate::record::{CredentialRecord, CredentialState, StatePatch};
use crate::storage::Storage;

#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Upper bound on the starvation-relief wait for a cooled-down model.
    pub max_wait: Duration,
    pub auto_ban_enabled: bool,
    pub auto_ban_codes: Vec<u16>,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_wait: Duration::from_secs(10),
            auto_ban_enabled: false,
            auto_ban_codes: vec![403],
        }
    }
}

/// What the dispatcher observed for one upstream call.
#[derive(Debug, Clone)]
pub enum Outcome {
    Success,
    HttpError {
        status: u16,
        headers: Vec<(String, String)>,
        body: String,
        /// True when the caller found every other credential already
        /// exhausted for this model; switches to the tiered lockout ladder.
        all_others_exhausted: bool,
    },
}

#[derive(Debug, Clone, Default)]
pub struct RecordedFailure {
    pub cooldown_until: Option<OffsetDateTime>,
    pub auto_banned: bool,
}

#[derive(Clone)]
struct Entry {
    record: CredentialRecord,
    state: CredentialState,
}

/// The credential pool: selection, outcome recording, cooldown state.
///
/// The in-memory index is the read path; every state change is pushed
/// through the storage adapter (atomic per key) and mirrored back. When
/// storage errors, the mirror keeps serving and the next successful write
/// reconciles.
pub struct CredentialPool {
    storage: Arc<dyn Storage>,
    settings: PoolSettings,
    entries: RwLock<HashMap<(CredentialKind, String), Entry>>,
    exhausted_failures: Mutex<HashMap<(String, String), u32>>,
}

impl CredentialPool {
    pub fn new(storage: Arc<dyn Storage>, settings: PoolSettings) -> Self {
        Self {
            storage,
            settings,
            entries: RwLock::new(HashMap::new()),
            exhausted_failures: Mutex::new(HashMap::new()),
        }
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Load every credential of `kind` from storage into the index.
    pub async fn load(&self, kind: CredentialKind) -> Result<usize, crate::StorageError> {
        let names = self.storage.list_credentials(kind).await?;
        let mut loaded = 0;
        for name in names {
            let Some(record) = self.storage.get_credential(kind, &name).await? else {
                continue;
            };
            let state = self.storage.get_state(kind, &name).await?;
            self.entries
                .write()
                .await
                .insert((kind, name.clone()), Entry { record, state });
            loaded += 1;
        }
        Ok(loaded)
    }

    pub async fn upsert(&self, kind: CredentialKind, name: &str, record: CredentialRecord) {
        if let Err(err) = self.storage.store_credential(kind, name, &record).await {
            warn!(credential = name, %err, "credential persist failed; keeping in-memory copy");
        }
        let mut entries = self.entries.write().await;
        match entries.get_mut(&(kind, name.to_string())) {
            Some(entry) => entry.record = record,
            None => {
                entries.insert(
                    (kind, name.to_string()),
                    Entry {
                        record,
                        state: CredentialState::default(),
                    },
                );
            }
        }
    }

    pub async fn names(&self, kind: CredentialKind) -> Vec<String> {
        let entries = self.entries.read().await;
        let mut names: Vec<String> = entries
            .keys()
            .filter(|(k, _)| *k == kind)
            .map(|(_, name)| name.clone())
            .collect();
        names.sort();
        names
    }

    pub async fn get(&self, kind: CredentialKind, name: &str) -> Option<CredentialRecord> {
        let entries = self.entries.read().await;
        entries
            .get(&(kind, name.to_string()))
            .map(|entry| entry.record.clone())
    }

    pub async fn state_of(&self, kind: CredentialKind, name: &str) -> Option<CredentialState> {
        let entries = self.entries.read().await;
        entries
            .get(&(kind, name.to_string()))
            .map(|entry| entry.state.clone())
    }

    /// Pick a usable credential for `model` (or any model when `None`).
    ///
    /// Candidates are enabled credentials whose cooldown for the model is
    /// absent or expired; among them, least-recently-successful wins with
    /// a name tiebreak, so a hot credential cannot monopolize the pool.
    pub async fn pick(
        &self,
        kind: CredentialKind,
        model: Option<&str>,
    ) -> Option<(String, CredentialRecord)> {
        let now = OffsetDateTime::now_utc();
        let entries = self.entries.read().await;
        let mut candidates: Vec<(&String, &Entry)> = entries
            .iter()
            .filter(|((k, _), entry)| {
                *k == kind
                    && entry.record.has_token_material()
                    && entry.state.usable_for(model, now)
            })
            .map(|((_, name), entry)| (name, entry))
            .collect();
        candidates.sort_by(|a, b| {
            let a_success = a.1.state.last_success.unwrap_or(0);
            let b_success = b.1.state.last_success.unwrap_or(0);
            a_success.cmp(&b_success).then_with(|| a.0.cmp(b.0))
        });
        candidates
            .first()
            .map(|(name, entry)| ((*name).clone(), entry.record.clone()))
    }

    /// `pick` with starvation relief: wait (bounded by `max_wait`) for the
    /// earliest cooldown on this model to expire, then retry; failing
    /// that, drop the model constraint entirely.
    pub async fn pick_with_relief(
        &self,
        kind: CredentialKind,
        model: Option<&str>,
    ) -> Option<(String, CredentialRecord)> {
        if let Some(found) = self.pick(kind, model).await {
            return Some(found);
        }
        let Some(model) = model else {
            return None;
        };

        if let Some(wait) = self.earliest_cooldown_wait(kind, model).await
            && wait <= self.settings.max_wait
        {
            debug!(model, wait_ms = wait.as_millis() as u64, "waiting out the earliest cooldown");
            tokio::time::sleep(wait + Duration::from_millis(50)).await;
            if let Some(found) = self.pick(kind, Some(model)).await {
                return Some(found);
            }
        }

        // Any-model fallback: the caller explicitly prefers some credential
        // over advancing the chain.
        self.pick(kind, None).await
    }

    /// How many enabled credentials could serve `model` right now,
    /// excluding `except`. Zero means the caller just burned the last one.
    pub async fn usable_count_excluding(
        &self,
        kind: CredentialKind,
        model: &str,
        except: &str,
    ) -> usize {
        let now = OffsetDateTime::now_utc();
        let entries = self.entries.read().await;
        entries
            .iter()
            .filter(|((k, name), entry)| {
                *k == kind && name != except && entry.state.usable_for(Some(model), now)
            })
            .count()
    }

    async fn earliest_cooldown_wait(&self, kind: CredentialKind, model: &str) -> Option<Duration> {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let entries = self.entries.read().await;
        entries
            .iter()
            .filter(|((k, _), entry)| *k == kind && !entry.state.disabled)
            .filter_map(|(_, entry)| entry.state.model_cooldowns.get(model))
            .filter(|until| **until > now)
            .min()
            .map(|until| Duration::from_secs((until - now).max(0) as u64))
    }

    /// Record an upstream outcome and update cooldown state.
    pub async fn record(
        &self,
        kind: CredentialKind,
        name: &str,
        model: &str,
        outcome: &Outcome,
    ) -> RecordedFailure {
        match outcome {
            Outcome::Success => {
                self.exhausted_failures
                    .lock()
                    .await
                    .remove(&(name.to_string(), model.to_string()));
                // Cooldowns are left alone: a parsed reset instant stays
                // authoritative even after a success elsewhere.
                let patch = StatePatch {
                    last_success: Some(OffsetDateTime::now_utc().unix_timestamp()),
                    reset_error_codes: true,
                    ..StatePatch::default()
                };
                self.apply_patch(kind, name, patch).await;
                RecordedFailure::default()
            }
            Outcome::HttpError {
                status,
                headers,
                body,
                all_others_exhausted,
            } => {
                self.record_http_error(
                    kind,
                    name,
                    model,
                    *status,
                    headers,
                    body,
                    *all_others_exhausted,
                )
                .await
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn record_http_error(
        &self,
        kind: CredentialKind,
        name: &str,
        model: &str,
        status: u16,
        headers: &[(String, String)],
        body: &str,
        all_others_exhausted: bool,
    ) -> RecordedFailure {
        let now = OffsetDateTime::now_utc();
        let mut result = RecordedFailure::default();
        let mut patch = StatePatch {
            push_error_code: Some(status),
            ..StatePatch::default()
        };

        let hinted = parse_cooldown_hint(headers, body, now);
        let cooldown_until = match (status, hinted) {
            (_, Some(until)) => Some(until),
            (429, None) if all_others_exhausted => {
                let mut counters = self.exhausted_failures.lock().await;
                let count = counters
                    .entry((name.to_string(), model.to_string()))
                    .and_modify(|c| *c += 1)
                    .or_insert(1);
                let lockout = tiered_quota_lockout(*count);
                warn!(
                    credential = name,
                    model,
                    consecutive = *count,
                    lockout_secs = lockout.as_secs(),
                    "quota lockout ladder engaged"
                );
                Some(now + lockout)
            }
            (429, None) => Some(now + classify_429_lockout(body)),
            (500 | 503 | 529, None) => Some(now + SERVER_ERROR_COOLDOWN),
            _ => None,
        };

        if let Some(until) = cooldown_until {
            patch
                .set_model_cooldowns
                .push((model.to_string(), until.unix_timestamp()));
            result.cooldown_until = Some(until);
        }

        if self.settings.auto_ban_enabled && self.settings.auto_ban_codes.contains(&status) {
            warn!(credential = name, status, "auto-ban triggered");
            patch.disabled = Some(true);
            patch.disabled_reason = Some(Some("auto_ban".to_string()));
            result.auto_banned = true;
        }

        self.apply_patch(kind, name, patch).await;
        result
    }

    pub async fn set_disabled(
        &self,
        kind: CredentialKind,
        name: &str,
        disabled: bool,
        reason: Option<String>,
        by_warmup: bool,
    ) {
        let patch = StatePatch {
            disabled: Some(disabled),
            disabled_reason: Some(if disabled { reason } else { None }),
            auto_disabled_by_warmup: Some(disabled && by_warmup),
            ..StatePatch::default()
        };
        self.apply_patch(kind, name, patch).await;
    }

    pub async fn touch_quota_refresh(&self, kind: CredentialKind, name: &str) {
        let patch = StatePatch {
            last_quota_refresh: Some(OffsetDateTime::now_utc().unix_timestamp()),
            ..StatePatch::default()
        };
        self.apply_patch(kind, name, patch).await;
    }

    async fn apply_patch(&self, kind: CredentialKind, name: &str, patch: StatePatch) {
        let persisted = match self.storage.update_state(kind, name, patch.clone()).await {
            Ok(state) => Some(state),
            Err(err) => {
                warn!(credential = name, %err, "state persist failed; serving from memory");
                None
            }
        };
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(&(kind, name.to_string())) {
            match persisted {
                Some(state) => entry.state = state,
                None => patch.apply(&mut entry.state),
            }
        }
    }
}
