//! Background maintenance loops: quota refresh, smart warmup, and the
//! quota-protection sweeper. All are disabled by default and honor a
//! cooperative stop signal; an in-flight iteration completes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rand::Rng;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::sync::{Semaphore, watch};
use tracing::{debug, info, warn};

use agproxy_common::{CredentialKind, make_request_id};
use agproxy_pool::CredentialRecord;
use agproxy_protocol::antigravity::{
    self, AvailableModels, Envelope, FETCH_MODELS_PATH, STREAM_GENERATE_PATH,
};
use agproxy_protocol::gemini::{
    Content, ContentRole, GenerateContentRequest, GenerationConfig, Part,
};

use crate::dispatch::antigravity_headers;
use crate::oauth;
use crate::state::AppState;
use crate::upstream::{HttpMethod, HttpRequest, UpstreamClient};

const KIND: CredentialKind = CredentialKind::Antigravity;

const REFRESH_CONCURRENCY: usize = 5;
const PER_CREDENTIAL_MIN_INTERVAL: Duration = Duration::from_secs(15 * 60);
const GLOBAL_429_COOLDOWN: Duration = Duration::from_secs(10 * 60);
const WARMUP_INTERVAL: Duration = Duration::from_secs(30 * 60);
const WARMUP_LOCAL_COOLDOWN_SECS: i64 = 5 * 3600;
const WARMUP_HISTORY_KEY: &str = "warmup_history";

pub struct BackgroundLoops {
    state: Arc<AppState>,
    client: Arc<dyn UpstreamClient>,
    stop_rx: watch::Receiver<bool>,
}

pub fn stop_channel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

impl BackgroundLoops {
    pub fn new(
        state: Arc<AppState>,
        client: Arc<dyn UpstreamClient>,
        stop_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            state,
            client,
            stop_rx,
        }
    }

    /// Spawn whichever loops the config enables.
    pub fn spawn(self) {
        let config = self.state.config_snapshot();
        if config.background_refresh_enabled {
            let refresh = RefreshLoop {
                state: self.state.clone(),
                client: self.client.clone(),
                stop_rx: self.stop_rx.clone(),
            };
            tokio::spawn(refresh.run());
        }
        if config.smart_warmup_enabled {
            let warmup = WarmupLoop {
                state: self.state.clone(),
                client: self.client.clone(),
                stop_rx: self.stop_rx.clone(),
            };
            tokio::spawn(warmup.run());
        }
    }
}

async fn sleep_or_stop(stop_rx: &mut watch::Receiver<bool>, duration: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        _ = stop_rx.changed() => *stop_rx.borrow(),
    }
}

fn jittered(base: Duration, ratio: f64) -> Duration {
    let factor = rand::rng().random_range(1.0 - ratio..=1.0 + ratio);
    Duration::from_secs_f64(base.as_secs_f64() * factor)
}

// ---- Quota refresh ------------------------------------------------------

struct RefreshLoop {
    state: Arc<AppState>,
    client: Arc<dyn UpstreamClient>,
    stop_rx: watch::Receiver<bool>,
}

impl RefreshLoop {
    async fn run(mut self) {
        info!("quota refresh loop started");
        loop {
            let interval = self.state.config_snapshot().background_refresh_interval;
            if sleep_or_stop(&mut self.stop_rx, jittered(interval, 0.15)).await {
                break;
            }
            if let Err(cooldown) = self.refresh_all().await {
                warn!("quota refresh hit upstream pressure; cooling down");
                if sleep_or_stop(&mut self.stop_rx, cooldown).await {
                    break;
                }
            }
        }
        info!("quota refresh loop stopped");
    }

    /// Refresh tokens near expiry and pull quota snapshots. Returns the
    /// global cooldown to apply when the upstream pushes back with 429s.
    async fn refresh_all(&self) -> Result<(), Duration> {
        let names = self.state.pool.names(KIND).await;
        let semaphore = Arc::new(Semaphore::new(REFRESH_CONCURRENCY));
        let mut rate_limited = false;

        let mut handles = Vec::new();
        for name in names {
            let Some(record) = self.state.pool.get(KIND, &name).await else {
                continue;
            };
            let Some(state) = self.state.pool.state_of(KIND, &name).await else {
                continue;
            };
            if state.disabled {
                continue;
            }
            let recently = state.last_quota_refresh.is_some_and(|at| {
                OffsetDateTime::now_utc().unix_timestamp() - at
                    < PER_CREDENTIAL_MIN_INTERVAL.as_secs() as i64
            });
            if recently {
                continue;
            }

            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };
            let app = self.state.clone();
            let client = self.client.clone();
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                refresh_one(&app, &client, &name, record).await
            }));
        }

        for handle in handles {
            if let Ok(Err(RefreshOneError::RateLimited)) = handle.await {
                rate_limited = true;
            }
        }
        if rate_limited {
            Err(GLOBAL_429_COOLDOWN)
        } else {
            Ok(())
        }
    }
}

enum RefreshOneError {
    RateLimited,
    Other,
}

async fn refresh_one(
    state: &Arc<AppState>,
    client: &Arc<dyn UpstreamClient>,
    name: &str,
    mut record: CredentialRecord,
) -> Result<(), RefreshOneError> {
    if oauth::needs_refresh(&record, OffsetDateTime::now_utc()) {
        match oauth::refresh_access_token(client, &record).await {
            Ok(updated) => {
                state.pool.upsert(KIND, name, updated.clone()).await;
                record = updated;
            }
            Err(err) => {
                debug!(credential = name, %err, "token refresh during quota sweep failed");
                return Err(RefreshOneError::Other);
            }
        }
    }

    match fetch_quota(client, state, &record).await {
        Ok(models) => {
            apply_quota_protection(state, name, &models).await;
            state.quotas.store(KIND, name, models.quotas());
            state.pool.touch_quota_refresh(KIND, name).await;
            Ok(())
        }
        Err(status) if status == 429 => Err(RefreshOneError::RateLimited),
        Err(_) => Err(RefreshOneError::Other),
    }
}

/// Pull the available-models payload for one credential.
pub async fn fetch_quota(
    client: &Arc<dyn UpstreamClient>,
    state: &Arc<AppState>,
    record: &CredentialRecord,
) -> Result<AvailableModels, u16> {
    let base = state
        .config_snapshot()
        .antigravity_api_url
        .clone()
        .unwrap_or_else(|| antigravity::DEFAULT_BASE_URL.to_string());
    let url = format!("{}{}", base.trim_end_matches('/'), FETCH_MODELS_PATH);
    let response = client
        .request(HttpRequest {
            method: HttpMethod::Post,
            url,
            headers: antigravity_headers(&record.access_token, ""),
            body: Some(Bytes::from_static(b"{}")),
            stream: false,
            timeout: Duration::from_secs(30),
        })
        .await
        .map_err(|_| 0u16)?;
    let status = response.status;
    let bytes = response.into_bytes().await;
    if !(200..300).contains(&status) {
        return Err(status);
    }
    serde_json::from_slice(&bytes).map_err(|_| 0u16)
}

/// Quota-protection sweeper: below the threshold on a watched model the
/// credential is parked (`auto_disabled_by_warmup`); back at 100% it is
/// re-enabled. Manual disables are never overridden.
async fn apply_quota_protection(state: &Arc<AppState>, name: &str, models: &AvailableModels) {
    let config = state.config_snapshot();
    if !config.quota_protection_enabled || config.quota_protection_models.is_empty() {
        return;
    }
    let Some(cred_state) = state.pool.state_of(KIND, name).await else {
        return;
    };

    let mut watched_low = false;
    let mut watched_full = true;
    let mut saw_watched = false;
    for (model, quota) in models.quotas() {
        let watched = config
            .quota_protection_models
            .iter()
            .any(|candidate| model.contains(candidate));
        if !watched {
            continue;
        }
        saw_watched = true;
        let remaining = quota.remaining_fraction.unwrap_or(1.0);
        if remaining < config.quota_protection_threshold {
            watched_low = true;
        }
        if remaining < 1.0 {
            watched_full = false;
        }
    }
    if !saw_watched {
        return;
    }

    if watched_low && !cred_state.disabled {
        info!(credential = name, "quota protection: parking credential");
        state
            .pool
            .set_disabled(KIND, name, true, Some("quota_protection".to_string()), true)
            .await;
    } else if watched_full && cred_state.disabled && cred_state.auto_disabled_by_warmup {
        info!(credential = name, "quota protection: restoring credential");
        state.pool.set_disabled(KIND, name, false, None, false).await;
    }
}

// ---- Smart warmup -------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
struct WarmupHistory {
    /// `(credential, model)` → unix seconds of the last attempt.
    #[serde(default)]
    attempts: HashMap<String, i64>,
    /// `(credential, model)` → the upstream resetTime observed when the
    /// last warmup fired, marking the quota cycle already covered.
    #[serde(default)]
    cycles: HashMap<String, String>,
}

fn history_key(credential: &str, model: &str) -> String {
    format!("{credential}::{model}")
}

struct WarmupLoop {
    state: Arc<AppState>,
    client: Arc<dyn UpstreamClient>,
    stop_rx: watch::Receiver<bool>,
}

impl WarmupLoop {
    async fn run(mut self) {
        info!("smart warmup loop started");
        loop {
            if sleep_or_stop(&mut self.stop_rx, jittered(WARMUP_INTERVAL, 0.1)).await {
                break;
            }
            self.scan_and_warm().await;
        }
        info!("smart warmup loop stopped");
    }

    async fn load_history(&self) -> WarmupHistory {
        match self.state.storage.get_config(WARMUP_HISTORY_KEY).await {
            Ok(Some(value)) => serde_json::from_value(value).unwrap_or_default(),
            _ => WarmupHistory::default(),
        }
    }

    async fn save_history(&self, history: &WarmupHistory) {
        if let Ok(value) = serde_json::to_value(history) {
            let _ = self.state.storage.set_config(WARMUP_HISTORY_KEY, value).await;
        }
    }

    async fn scan_and_warm(&self) {
        let config = self.state.config_snapshot();
        let watched = &config.quota_protection_models;
        let mut history = self.load_history().await;
        let now = OffsetDateTime::now_utc().unix_timestamp();

        for name in self.state.pool.names(KIND).await {
            let Some(state) = self.state.pool.state_of(KIND, &name).await else {
                continue;
            };
            if state.disabled {
                continue;
            }
            let Some(record) = self.state.pool.get(KIND, &name).await else {
                continue;
            };

            let mut credential_blocked = false;
            for (model, quota) in self.state.quotas.all_for(KIND, &name) {
                if credential_blocked {
                    break;
                }
                if !watched.is_empty() && !watched.iter().any(|w| model.contains(w)) {
                    continue;
                }
                if quota.remaining_fraction != Some(1.0) {
                    continue;
                }

                let key = history_key(&name, &model);
                // Dual dedup: the cycle marker derived from resetTime, and
                // a local wall-clock cooldown for when resetTime is absent.
                if let (Some(seen), Some(current)) =
                    (history.cycles.get(&key), quota.reset_time.as_ref())
                    && seen == current
                {
                    continue;
                }
                if history
                    .attempts
                    .get(&key)
                    .is_some_and(|at| now - at < WARMUP_LOCAL_COOLDOWN_SECS)
                {
                    continue;
                }

                match self.warm_one(&record, &model).await {
                    WarmOutcome::Consumed => {
                        history.attempts.insert(key.clone(), now);
                        if let Some(reset) = &quota.reset_time {
                            history.cycles.insert(key, reset.clone());
                        }
                        info!(credential = %name, model = %model, "warmup ping consumed quota");
                    }
                    WarmOutcome::ConnectError => {
                        warn!(credential = %name, "warmup connect error; skipping credential this cycle");
                        credential_blocked = true;
                    }
                    WarmOutcome::Failed => {}
                }
            }
        }

        self.save_history(&history).await;
    }

    async fn warm_one(&self, record: &CredentialRecord, model: &str) -> WarmOutcome {
        let base = self
            .state
            .config_snapshot()
            .antigravity_api_url
            .clone()
            .unwrap_or_else(|| antigravity::DEFAULT_BASE_URL.to_string());
        let envelope = Envelope {
            model: model.to_string(),
            project: record.project_id.clone(),
            request: GenerateContentRequest {
                contents: vec![Content {
                    role: Some(ContentRole::User),
                    parts: vec![Part::text("ping")],
                }],
                session_id: Some(make_request_id()),
                generation_config: Some(GenerationConfig {
                    max_output_tokens: Some(1),
                    ..GenerationConfig::default()
                }),
                ..GenerateContentRequest::default()
            },
        };
        let Ok(payload) = serde_json::to_vec(&envelope) else {
            return WarmOutcome::Failed;
        };
        let url = format!("{}{}", base.trim_end_matches('/'), STREAM_GENERATE_PATH);
        let response = self
            .client
            .request(HttpRequest {
                method: HttpMethod::Post,
                url,
                headers: antigravity_headers(&record.access_token, model),
                body: Some(Bytes::from(payload)),
                stream: false,
                timeout: Duration::from_secs(30),
            })
            .await;

        match response {
            // 429 proved the quota was touched, which is the whole point.
            Ok(response) if (200..300).contains(&response.status) || response.status == 429 => {
                WarmOutcome::Consumed
            }
            Ok(_) => WarmOutcome::Failed,
            Err(err) if !err.is_timeout() => WarmOutcome::ConnectError,
            Err(_) => WarmOutcome::Failed,
        }
    }
}

enum WarmOutcome {
    Consumed,
    ConnectError,
    Failed,
}

/// Parse the upstream reset time to a cycle-start instant; warmups fired
/// after it belong to the same quota cycle.
pub fn cycle_start_from_reset(reset_time: &str, period: Duration) -> Option<OffsetDateTime> {
    let reset = OffsetDateTime::parse(reset_time, &Rfc3339).ok()?;
    Some(reset - period)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_start_subtracts_the_period() {
        let start =
            cycle_start_from_reset("2026-01-17T12:00:00Z", Duration::from_secs(5 * 3600)).unwrap();
        assert_eq!(start.hour(), 7);
    }

    #[test]
    fn history_round_trips_through_json() {
        let mut history = WarmupHistory::default();
        history.attempts.insert(history_key("alice", "m"), 42);
        history
            .cycles
            .insert(history_key("alice", "m"), "2026-01-17T12:00:00Z".to_string());
        let value = serde_json::to_value(&history).unwrap();
        let back: WarmupHistory = serde_json::from_value(value).unwrap();
        assert_eq!(back.attempts.get("alice::m"), Some(&42));
        assert_eq!(
            back.cycles.get("alice::m").map(String::as_str),
            Some("2026-01-17T12:00:00Z")
        );
    }
}
