use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use agproxy_common::CredentialKind;

/// OAuth material plus upstream binding. Created by the OAuth dance
/// (external to this crate); this side only refreshes tokens in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub access_token: String,
    pub refresh_token: String,
    /// Unix seconds at which `access_token` expires.
    pub expires_at: i64,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    pub client_id: String,
    pub client_secret: String,
    pub project_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub kind: CredentialKind,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl CredentialRecord {
    pub fn is_token_expired_at(&self, now: OffsetDateTime) -> bool {
        self.expires_at <= now.unix_timestamp()
    }

    /// Enabled credentials must carry at least one usable token.
    pub fn has_token_material(&self) -> bool {
        !self.access_token.is_empty() || !self.refresh_token.is_empty()
    }
}

/// Mutable runtime state, one blob per credential.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CredentialState {
    #[serde(default)]
    pub disabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disabled_reason: Option<String>,
    #[serde(default)]
    pub auto_disabled_by_warmup: bool,
    /// model key → unix seconds until which the credential must not be
    /// used for that model.
    #[serde(default)]
    pub model_cooldowns: BTreeMap<String, i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_success: Option<i64>,
    /// Rolling window of recent upstream error statuses.
    #[serde(default)]
    pub error_codes: Vec<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_quota_refresh: Option<i64>,
}

impl CredentialState {
    pub fn cooldown_active(&self, model: &str, now: OffsetDateTime) -> bool {
        self.model_cooldowns
            .get(model)
            .is_some_and(|until| *until > now.unix_timestamp())
    }

    pub fn usable_for(&self, model: Option<&str>, now: OffsetDateTime) -> bool {
        if self.disabled {
            return false;
        }
        match model {
            Some(model) => !self.cooldown_active(model, now),
            None => true,
        }
    }
}

/// Partial update applied read-modify-write under the storage's per-key
/// lock. `Some(None)` on an option field clears it.
#[derive(Debug, Clone, Default)]
pub struct StatePatch {
    pub disabled: Option<bool>,
    pub disabled_reason: Option<Option<String>>,
    pub auto_disabled_by_warmup: Option<bool>,
    pub set_model_cooldowns: Vec<(String, i64)>,
    pub clear_model_cooldowns: Vec<String>,
    pub last_success: Option<i64>,
    pub push_error_code: Option<u16>,
    pub reset_error_codes: bool,
    pub last_quota_refresh: Option<i64>,
}

const ERROR_CODE_WINDOW: usize = 20;

impl StatePatch {
    pub fn apply(&self, state: &mut CredentialState) {
        if let Some(disabled) = self.disabled {
            state.disabled = disabled;
        }
        if let Some(reason) = &self.disabled_reason {
            state.disabled_reason = reason.clone();
        }
        if let Some(flag) = self.auto_disabled_by_warmup {
            state.auto_disabled_by_warmup = flag;
        }
        for (model, until) in &self.set_model_cooldowns {
            state.model_cooldowns.insert(model.clone(), *until);
        }
        for model in &self.clear_model_cooldowns {
            state.model_cooldowns.remove(model);
        }
        if let Some(ts) = self.last_success {
            state.last_success = Some(ts);
        }
        if self.reset_error_codes {
            state.error_codes.clear();
        }
        if let Some(code) = self.push_error_code {
            state.error_codes.push(code);
            if state.error_codes.len() > ERROR_CODE_WINDOW {
                let excess = state.error_codes.len() - ERROR_CODE_WINDOW;
                state.error_codes.drain(..excess);
            }
        }
        if let Some(ts) = self.last_quota_refresh {
            state.last_quota_refresh = Some(ts);
        }
    }
}
