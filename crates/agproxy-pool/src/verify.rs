use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::info;

/// Auto-verification: when the dispatcher keeps reporting "all credentials
/// exhausted", nudge the most-recently-failed credential through a token
/// refresh instead of letting the whole pool sit dark.
///
/// Every action is gated by a per-credential cooldown *and* a global
/// hourly cap; a failed verify marks the credential for chain fallback.
#[derive(Debug, Clone)]
pub struct VerifySettings {
    pub enabled: bool,
    /// Consecutive all-exhausted reports before a verify fires.
    pub trigger_threshold: u32,
    pub per_credential_cooldown: Duration,
    pub global_hourly_cap: usize,
}

impl Default for VerifySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            trigger_threshold: 5,
            per_credential_cooldown: Duration::from_secs(20 * 60),
            global_hourly_cap: 6,
        }
    }
}

#[derive(Default)]
struct CredState {
    consecutive_exhausted: u32,
    last_verify: Option<Instant>,
    should_fallback: bool,
}

pub struct AutoVerify {
    settings: VerifySettings,
    inner: Mutex<VerifyInner>,
}

#[derive(Default)]
struct VerifyInner {
    creds: HashMap<String, CredState>,
    global_attempts: Vec<Instant>,
}

impl AutoVerify {
    pub fn new(settings: VerifySettings) -> Self {
        Self {
            settings,
            inner: Mutex::new(VerifyInner::default()),
        }
    }

    /// Report one "all credentials exhausted" observation against the
    /// credential that failed most recently. Returns true when the caller
    /// should attempt a credential refresh now.
    pub fn note_exhausted(&self, credential: &str) -> bool {
        if !self.settings.enabled {
            return false;
        }
        let mut inner = self.inner.lock().expect("auto-verify poisoned");
        let hour_ago = Instant::now() - Duration::from_secs(3600);
        inner.global_attempts.retain(|at| *at > hour_ago);
        let globally_capped = inner.global_attempts.len() >= self.settings.global_hourly_cap;

        let threshold = self.settings.trigger_threshold;
        let cooldown = self.settings.per_credential_cooldown;
        let state = inner.creds.entry(credential.to_string()).or_default();
        state.consecutive_exhausted += 1;
        if state.consecutive_exhausted < threshold {
            return false;
        }
        if globally_capped {
            return false;
        }
        if state
            .last_verify
            .is_some_and(|at| at.elapsed() < cooldown)
        {
            return false;
        }

        state.consecutive_exhausted = 0;
        state.last_verify = Some(Instant::now());
        inner.global_attempts.push(Instant::now());
        info!(credential, "auto-verify triggered");
        true
    }

    /// Caller reports how the refresh went. A failure flags the
    /// credential so the dispatcher skips it and advances the chain.
    pub fn record_verify_result(&self, credential: &str, ok: bool) {
        let mut inner = self.inner.lock().expect("auto-verify poisoned");
        let state = inner.creds.entry(credential.to_string()).or_default();
        state.should_fallback = !ok;
    }

    /// Any successful call (or a manual enable/disable) resets the
    /// consecutive counter and clears the fallback flag.
    pub fn record_success(&self, credential: &str) {
        let mut inner = self.inner.lock().expect("auto-verify poisoned");
        if let Some(state) = inner.creds.get_mut(credential) {
            state.consecutive_exhausted = 0;
            state.should_fallback = false;
        }
    }

    pub fn should_fallback(&self, credential: &str) -> bool {
        let inner = self.inner.lock().expect("auto-verify poisoned");
        inner
            .creds
            .get(credential)
            .is_some_and(|state| state.should_fallback)
    }
}
