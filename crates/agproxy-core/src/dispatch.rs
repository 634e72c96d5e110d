//! The dispatcher: drives one normalized request to completion across
//! retries, credential rotation, BaseURL failover, and backend rollover.
//!
//! Pipeline position: normalize → route → translate → **dispatch** →
//! record. The routing rule is resolved once here; the pool only records
//! outcomes, and this module is the single retry authority.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rand::Rng;
use serde_json::Value as JsonValue;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use agproxy_common::{CredentialKind, GatewayError, make_request_id};
use agproxy_pool::{CredentialRecord, Outcome};
use agproxy_protocol::antigravity::{
    self, Envelope, GENERATE_PATH, ResponseEnvelope, STREAM_GENERATE_PATH, StreamChunk,
};
use agproxy_protocol::gemini::{GenerateContentRequest, GenerateContentResponse};
use agproxy_protocol::models::{context_budget, request_type_for_model};
use agproxy_protocol::sse::SseParser;
use agproxy_transform::collect::{SignatureRecorder, StreamCollector};
use agproxy_transform::context::apply_context_pressure;

use crate::config::{BackendConfig, BackendDialect, RoutingRule};
use crate::oauth;
use crate::state::AppState;
use crate::upstream::{
    ByteStream, HttpBody, HttpMethod, HttpRequest, TransportError, UpstreamClient,
};

const KIND: CredentialKind = CredentialKind::Antigravity;
const QUOTA_EXHAUSTED_MARKER: &str = "MODEL_CAPACITY_EXHAUSTED";

#[derive(Debug)]
pub struct DispatchRequest {
    /// Client-facing model alias; routing key and stats key.
    pub alias: String,
    /// Translated upstream body for Antigravity-dialect backends.
    pub upstream: GenerateContentRequest,
    /// Raw OpenAI-shape body for OpenAI-compatible sibling backends;
    /// chain entries of that dialect are skipped when absent.
    pub openai_body: Option<JsonValue>,
    /// Whether the *client* asked for a stream. Antigravity is always
    /// called streaming (auto-stream conversion); this picks the output.
    pub stream: bool,
}

pub struct StreamHandle {
    pub rx: mpsc::Receiver<GenerateContentResponse>,
    /// Model the chunks came from (chain target, not the client alias).
    pub model: String,
}

pub enum DispatchOutput {
    /// Reconstructed upstream-shape response (non-stream client).
    Upstream(GenerateContentResponse),
    /// Parsed upstream chunks for downstream re-serialization.
    UpstreamStream(StreamHandle),
    /// Sibling-backend JSON body, already client-shaped.
    Passthrough(Bytes),
    /// Sibling-backend SSE bytes, forwarded verbatim.
    PassthroughStream(ByteStream),
}

/// Why a backend attempt gave up, and whether the chain may advance.
struct ChainFailure {
    error: GatewayError,
    status: Option<u16>,
    timeout: bool,
    connect: bool,
    /// Pool exhaustion always offers the chain a chance to advance.
    exhausted: bool,
}

impl ChainFailure {
    fn from_status(status: u16, error: GatewayError) -> Self {
        Self {
            error,
            status: Some(status),
            timeout: false,
            connect: false,
            exhausted: false,
        }
    }

    fn exhausted(model: &str) -> Self {
        Self {
            error: GatewayError::CredentialPoolExhausted {
                model: model.to_string(),
            },
            status: None,
            timeout: false,
            connect: false,
            exhausted: true,
        }
    }

    fn should_advance(&self, rule: &RoutingRule) -> bool {
        if self.exhausted {
            return true;
        }
        if let Some(status) = self.status {
            return rule.should_fallback_status(status);
        }
        rule.should_fallback_transport(self.timeout)
    }
}

enum AttemptResult {
    Output(DispatchOutput),
    /// 200 but the stream produced nothing.
    Empty,
    Http {
        status: u16,
        headers: Vec<(String, String)>,
        body: String,
    },
    Transport(TransportError),
    /// First-chunk timeout; cooldown already applied.
    Stalled,
}

#[derive(Clone)]
pub struct Dispatcher {
    state: Arc<AppState>,
    client: Arc<dyn UpstreamClient>,
}

impl Dispatcher {
    pub fn new(state: Arc<AppState>, client: Arc<dyn UpstreamClient>) -> Self {
        Self { state, client }
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    pub async fn dispatch(&self, request: DispatchRequest) -> Result<DispatchOutput, GatewayError> {
        let routing = self.state.routing_snapshot();
        let rule = routing.resolve(&request.alias);
        let mut last_error: Option<GatewayError> = None;

        for (position, (backend_name, target_model)) in rule.chain.iter().enumerate() {
            let Some(backend) = routing.backend(backend_name) else {
                debug!(backend = %backend_name, "chain entry references unknown or disabled backend");
                continue;
            };
            info!(
                alias = %request.alias,
                backend = %backend_name,
                target = %target_model,
                position,
                "trying chain entry"
            );
            let outcome = match backend.dialect {
                BackendDialect::Antigravity => {
                    self.run_antigravity(backend, target_model, &request).await
                }
                BackendDialect::OpenAi => {
                    self.run_openai_compatible(backend, target_model, &request)
                        .await
                }
            };
            match outcome {
                Ok(output) => return Ok(output),
                Err(failure) => {
                    let advance = failure.should_advance(&rule);
                    warn!(
                        backend = %backend_name,
                        error = %failure.error,
                        advance,
                        "chain entry failed"
                    );
                    if !advance {
                        return Err(failure.error);
                    }
                    last_error = Some(failure.error);
                }
            }
        }

        Err(last_error.unwrap_or(GatewayError::CredentialPoolExhausted {
            model: request.alias.clone(),
        }))
    }

    // ---- Antigravity path ------------------------------------------------

    async fn run_antigravity(
        &self,
        backend: &BackendConfig,
        target_model: &str,
        request: &DispatchRequest,
    ) -> Result<DispatchOutput, ChainFailure> {
        let config = self.state.config_snapshot();
        let mut cred_switches = 0u32;
        let mut backoff_attempt = 0u32;
        let mut last_failure: Option<ChainFailure> = None;
        let mut last_cred: Option<String> = None;
        // Credentials that hit MODEL_CAPACITY_EXHAUSTED are never retried
        // here; seeing one again means the any-model fallback is cycling.
        let mut quota_burned: std::collections::HashSet<String> = std::collections::HashSet::new();

        while cred_switches <= config.max_credential_switches {
            let picked = self.state.pool.pick_with_relief(KIND, Some(target_model)).await;
            let Some((name, record)) = picked else {
                break;
            };
            if quota_burned.contains(&name) {
                break;
            }
            if self.state.verify.should_fallback(&name) {
                debug!(credential = %name, "auto-verify marked credential for fallback");
                break;
            }
            last_cred = Some(name.clone());

            let record = match self.ensure_fresh_token(&name, record).await {
                Ok(record) => record,
                Err(err) => {
                    warn!(credential = %name, %err, "token refresh failed; rotating");
                    cred_switches += 1;
                    continue;
                }
            };

            match self
                .try_credential_on_urls(
                    backend,
                    target_model,
                    request,
                    &name,
                    &record,
                    &mut backoff_attempt,
                )
                .await
            {
                CredentialVerdict::Done(output) => {
                    self.state.verify.record_success(&name);
                    return Ok(output);
                }
                CredentialVerdict::Fatal(failure) => return Err(failure),
                CredentialVerdict::Rotate(failure) => {
                    let quota_hit =
                        matches!(failure.error, GatewayError::UpstreamQuotaExhausted { .. });
                    let rate_limited =
                        matches!(failure.error, GatewayError::UpstreamRateLimited { .. });
                    last_failure = Some(failure);
                    if rate_limited && !config.retry_429_enabled {
                        // Rotation on 429 is switched off; surface (or let
                        // the chain advance if the rule says so).
                        break;
                    }
                    cred_switches += 1;
                    if quota_hit {
                        // No sleep: the credential is parked, move on.
                        quota_burned.insert(name.clone());
                        continue;
                    }
                    let delay = retry_delay(
                        backoff_attempt,
                        config.retry_base_delay,
                        config.retry_max_delay,
                        None,
                    );
                    backoff_attempt += 1;
                    tokio::time::sleep(delay).await;
                }
            }
        }

        // The pool (or the switch budget) is spent for this model.
        if let Some(name) = &last_cred
            && self.state.verify.note_exhausted(name)
        {
            self.auto_verify_refresh(name).await;
        }
        Err(last_failure.unwrap_or_else(|| ChainFailure::exhausted(target_model)))
    }

    async fn ensure_fresh_token(
        &self,
        name: &str,
        record: CredentialRecord,
    ) -> Result<CredentialRecord, oauth::RefreshError> {
        if !oauth::needs_refresh(&record, OffsetDateTime::now_utc()) {
            return Ok(record);
        }
        let updated = oauth::refresh_access_token(&self.client, &record).await?;
        self.state.pool.upsert(KIND, name, updated.clone()).await;
        Ok(updated)
    }

    async fn auto_verify_refresh(&self, name: &str) {
        let Some(record) = self.state.pool.get(KIND, name).await else {
            return;
        };
        match oauth::refresh_access_token(&self.client, &record).await {
            Ok(updated) => {
                self.state.pool.upsert(KIND, name, updated).await;
                self.state.verify.record_verify_result(name, true);
            }
            Err(err) => {
                warn!(credential = name, %err, "auto-verify refresh failed");
                self.state.verify.record_verify_result(name, false);
            }
        }
    }

    /// One credential across the backend's BaseURL list. Decides between
    /// finishing, rotating to another credential, or failing the backend.
    async fn try_credential_on_urls(
        &self,
        backend: &BackendConfig,
        target_model: &str,
        request: &DispatchRequest,
        name: &str,
        record: &CredentialRecord,
        backoff_attempt: &mut u32,
    ) -> CredentialVerdict {
        let config = self.state.config_snapshot();
        let url_count = backend.base_urls.len();

        for (url_index, base_url) in backend.base_urls.iter().enumerate() {
            let mut same_cred_retries = 0u32;
            loop {
                let attempt = self
                    .attempt_antigravity_once(base_url, target_model, request, name, record)
                    .await;

                match attempt {
                    AttemptResult::Output(output) => {
                        self.state
                            .pool
                            .record(KIND, name, target_model, &Outcome::Success)
                            .await;
                        return CredentialVerdict::Done(output);
                    }
                    AttemptResult::Empty => {
                        match self
                            .empty_response_fallback(base_url, target_model, request, name, record)
                            .await
                        {
                            Some(output) => {
                                self.state
                                    .pool
                                    .record(KIND, name, target_model, &Outcome::Success)
                                    .await;
                                return CredentialVerdict::Done(output);
                            }
                            None => {
                                return CredentialVerdict::Rotate(ChainFailure {
                                    error: GatewayError::UpstreamEmpty,
                                    status: None,
                                    timeout: false,
                                    connect: false,
                                    exhausted: false,
                                });
                            }
                        }
                    }
                    AttemptResult::Http {
                        status,
                        headers,
                        body,
                    } => {
                        let others = self
                            .state
                            .pool
                            .usable_count_excluding(KIND, target_model, name)
                            .await;
                        let recorded = self
                            .state
                            .pool
                            .record(
                                KIND,
                                name,
                                target_model,
                                &Outcome::HttpError {
                                    status,
                                    headers,
                                    body: body.clone(),
                                    all_others_exhausted: others == 0,
                                },
                            )
                            .await;

                        match status {
                            400 => {
                                return CredentialVerdict::Fatal(ChainFailure::from_status(
                                    400,
                                    GatewayError::UpstreamNonRetryable { status, body },
                                ));
                            }
                            429 if body.contains(QUOTA_EXHAUSTED_MARKER) => {
                                // Never retried on the same credential.
                                return CredentialVerdict::Rotate(ChainFailure::from_status(
                                    429,
                                    GatewayError::UpstreamQuotaExhausted {
                                        model: target_model.to_string(),
                                    },
                                ));
                            }
                            429 => {
                                if url_index + 1 < url_count {
                                    break; // next BaseURL first
                                }
                                let delay = retry_delay(
                                    *backoff_attempt,
                                    config.retry_base_delay,
                                    config.retry_max_delay,
                                    recorded.cooldown_until,
                                );
                                *backoff_attempt += 1;
                                tokio::time::sleep(delay).await;
                                return CredentialVerdict::Rotate(ChainFailure::from_status(
                                    429,
                                    GatewayError::UpstreamRateLimited { message: body },
                                ));
                            }
                            503 | 529 => {
                                let delay = retry_delay(
                                    *backoff_attempt,
                                    config.retry_base_delay,
                                    config.retry_max_delay,
                                    recorded.cooldown_until,
                                );
                                *backoff_attempt += 1;
                                tokio::time::sleep(delay).await;
                                return CredentialVerdict::Rotate(ChainFailure::from_status(
                                    status,
                                    GatewayError::UpstreamRateLimited { message: body },
                                ));
                            }
                            500 | 502 | 504 => {
                                if same_cred_retries < config.max_same_cred_retries {
                                    same_cred_retries += 1;
                                    let delay = retry_delay(
                                        same_cred_retries,
                                        config.retry_base_delay,
                                        config.retry_max_delay,
                                        None,
                                    );
                                    tokio::time::sleep(delay).await;
                                    continue;
                                }
                                return CredentialVerdict::Rotate(ChainFailure::from_status(
                                    status,
                                    GatewayError::UpstreamServerError { status },
                                ));
                            }
                            _ => {
                                return CredentialVerdict::Fatal(ChainFailure::from_status(
                                    status,
                                    GatewayError::UpstreamNonRetryable { status, body },
                                ));
                            }
                        }
                    }
                    AttemptResult::Transport(err) => {
                        if same_cred_retries < config.max_same_cred_retries {
                            same_cred_retries += 1;
                            let delay = retry_delay(
                                same_cred_retries,
                                config.retry_base_delay,
                                config.retry_max_delay,
                                None,
                            );
                            tokio::time::sleep(delay).await;
                            continue;
                        }
                        return CredentialVerdict::Rotate(ChainFailure {
                            error: GatewayError::UpstreamStalled(err.message.clone()),
                            status: None,
                            timeout: err.is_timeout(),
                            connect: !err.is_timeout(),
                            exhausted: false,
                        });
                    }
                    AttemptResult::Stalled => {
                        return CredentialVerdict::Rotate(ChainFailure {
                            error: GatewayError::UpstreamStalled(
                                "no data before first-chunk deadline".to_string(),
                            ),
                            status: None,
                            timeout: true,
                            connect: false,
                            exhausted: false,
                        });
                    }
                }
            }
        }

        CredentialVerdict::Rotate(ChainFailure::exhausted(target_model))
    }

    /// One HTTP exchange on one BaseURL. Always calls the *streaming*
    /// endpoint: Google's quota on it is materially more permissive, so
    /// non-stream clients get their JSON rebuilt from the stream.
    async fn attempt_antigravity_once(
        &self,
        base_url: &str,
        target_model: &str,
        request: &DispatchRequest,
        name: &str,
        record: &CredentialRecord,
    ) -> AttemptResult {
        let config = self.state.config_snapshot();

        let permit = match self.state.antigravity_permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                return AttemptResult::Transport(TransportError {
                    kind: crate::upstream::TransportErrorKind::Other,
                    message: "concurrency gate closed".to_string(),
                });
            }
        };
        self.state.antigravity_interval.wait().await;

        let mut body = request.upstream.clone();
        body.session_id = Some(make_request_id());
        let envelope = Envelope {
            model: target_model.to_string(),
            project: record.project_id.clone(),
            request: body,
        };
        let payload = match serde_json::to_vec(&envelope) {
            Ok(payload) => payload,
            Err(err) => {
                return AttemptResult::Transport(TransportError {
                    kind: crate::upstream::TransportErrorKind::Other,
                    message: err.to_string(),
                });
            }
        };

        let url = format!("{}{}", base_url.trim_end_matches('/'), STREAM_GENERATE_PATH);
        let http = HttpRequest {
            method: HttpMethod::Post,
            url,
            headers: antigravity_headers(&record.access_token, target_model),
            body: Some(Bytes::from(payload)),
            stream: true,
            timeout: config.stream_timeout,
        };

        let response = match self.client.request(http).await {
            Ok(response) => response,
            Err(err) => return AttemptResult::Transport(err),
        };

        if !(200..300).contains(&response.status) {
            let status = response.status;
            let headers = response.headers.clone();
            let body = response.into_bytes().await;
            return AttemptResult::Http {
                status,
                headers,
                body: String::from_utf8_lossy(&body).to_string(),
            };
        }

        let rx = match response.body {
            HttpBody::Stream(rx) => rx,
            // Non-stream body despite the stream endpoint; decode directly.
            HttpBody::Bytes(bytes) => {
                drop(permit);
                return match serde_json::from_slice::<ResponseEnvelope>(&bytes) {
                    Ok(envelope) => {
                        AttemptResult::Output(DispatchOutput::Upstream(envelope.response))
                    }
                    Err(err) => AttemptResult::Transport(TransportError {
                        kind: crate::upstream::TransportErrorKind::Other,
                        message: format!("undecodable upstream body: {err}"),
                    }),
                };
            }
        };

        if request.stream {
            self.pump_client_stream(rx, permit, target_model, name, &config)
                .await
        } else {
            let result = self
                .collect_stream(rx, target_model, name, &config)
                .await;
            drop(permit);
            result
        }
    }

    /// Non-stream client: drain the SSE into a reconstructed response.
    async fn collect_stream(
        &self,
        mut rx: ByteStream,
        target_model: &str,
        name: &str,
        config: &crate::config::GatewayConfig,
    ) -> AttemptResult {
        let mut parser = SseParser::new();
        let mut collector = StreamCollector::new();
        let mut recorder = SignatureRecorder::new();
        let started = tokio::time::Instant::now();
        let mut first_chunk = true;

        loop {
            let chunk_timeout = if first_chunk {
                config.first_chunk_timeout
            } else {
                config.stream_timeout
            };
            if started.elapsed() > config.stream_timeout {
                return AttemptResult::Transport(TransportError {
                    kind: crate::upstream::TransportErrorKind::Timeout,
                    message: "stream collection deadline exceeded".to_string(),
                });
            }
            let next = tokio::time::timeout(chunk_timeout, rx.recv()).await;
            let bytes = match next {
                Ok(Some(bytes)) => bytes,
                Ok(None) => break,
                Err(_) if first_chunk => {
                    self.punish_stall(name, target_model, config).await;
                    return AttemptResult::Stalled;
                }
                Err(_) => {
                    return AttemptResult::Transport(TransportError {
                        kind: crate::upstream::TransportErrorKind::Timeout,
                        message: "mid-stream stall".to_string(),
                    });
                }
            };
            first_chunk = false;
            let mut done = false;
            for event in parser.push_bytes(&bytes) {
                if event.is_done() {
                    done = true;
                    break;
                }
                if let Ok(chunk) = serde_json::from_str::<StreamChunk>(&event.data) {
                    let response = chunk.into_response();
                    recorder.observe(&response, &self.state.signatures);
                    collector.push(&response);
                }
            }
            if done {
                break;
            }
        }
        for event in parser.finish() {
            if event.is_done() {
                continue;
            }
            if let Ok(chunk) = serde_json::from_str::<StreamChunk>(&event.data) {
                let response = chunk.into_response();
                recorder.observe(&response, &self.state.signatures);
                collector.push(&response);
            }
        }
        recorder.finish(&self.state.signatures);

        if !collector.has_content() {
            warn!(
                model = target_model,
                chunks = collector.chunks_seen(),
                "stream completed but produced no content"
            );
            return AttemptResult::Empty;
        }

        let response = collector.finish();
        self.state
            .stats
            .record(target_model, name, response.usage_metadata.as_ref());
        AttemptResult::Output(DispatchOutput::Upstream(response))
    }

    /// Stream client: verify the first chunk arrives, then hand chunks
    /// through a channel. The permit rides inside the pump task and is
    /// released on stream termination.
    async fn pump_client_stream(
        &self,
        mut rx: ByteStream,
        permit: tokio::sync::OwnedSemaphorePermit,
        target_model: &str,
        name: &str,
        config: &crate::config::GatewayConfig,
    ) -> AttemptResult {
        let mut parser = SseParser::new();
        let mut pending: Vec<GenerateContentResponse> = Vec::new();
        let mut recorder = SignatureRecorder::new();

        // First-chunk gate: don't commit a stream to the client until the
        // upstream actually says something.
        loop {
            match tokio::time::timeout(config.first_chunk_timeout, rx.recv()).await {
                Ok(Some(bytes)) => {
                    for event in parser.push_bytes(&bytes) {
                        if event.is_done() {
                            continue;
                        }
                        if let Ok(chunk) = serde_json::from_str::<StreamChunk>(&event.data) {
                            let response = chunk.into_response();
                            recorder.observe(&response, &self.state.signatures);
                            pending.push(response);
                        }
                    }
                    if !pending.is_empty() {
                        break;
                    }
                }
                Ok(None) => {
                    drop(permit);
                    return AttemptResult::Empty;
                }
                Err(_) => {
                    drop(permit);
                    self.punish_stall(name, target_model, config).await;
                    return AttemptResult::Stalled;
                }
            }
        }

        let (tx, out_rx) = mpsc::channel(32);
        let signatures_state = self.state.clone();
        let stats_model = target_model.to_string();
        let stats_name = name.to_string();
        let stream_timeout = config.stream_timeout;

        tokio::spawn(async move {
            let _permit = permit;
            let mut usage: Option<agproxy_protocol::gemini::UsageMetadata> = None;
            for chunk in pending {
                if chunk.usage_metadata.is_some() {
                    usage = chunk.usage_metadata.clone();
                }
                if tx.send(chunk).await.is_err() {
                    return;
                }
            }
            loop {
                let next = tokio::time::timeout(stream_timeout, rx.recv()).await;
                let bytes = match next {
                    Ok(Some(bytes)) => bytes,
                    _ => break,
                };
                for event in parser.push_bytes(&bytes) {
                    if event.is_done() {
                        continue;
                    }
                    if let Ok(chunk) = serde_json::from_str::<StreamChunk>(&event.data) {
                        let response = chunk.into_response();
                        recorder.observe(&response, &signatures_state.signatures);
                        if response.usage_metadata.is_some() {
                            usage = response.usage_metadata.clone();
                        }
                        if tx.send(response).await.is_err() {
                            // Client went away; stop reading upstream.
                            recorder.finish(&signatures_state.signatures);
                            return;
                        }
                    }
                }
            }
            recorder.finish(&signatures_state.signatures);
            signatures_state
                .stats
                .record(&stats_model, &stats_name, usage.as_ref());
        });

        AttemptResult::Output(DispatchOutput::UpstreamStream(StreamHandle {
            rx: out_rx,
            model: target_model.to_string(),
        }))
    }

    async fn punish_stall(
        &self,
        name: &str,
        target_model: &str,
        config: &crate::config::GatewayConfig,
    ) {
        // A short cooldown discourages immediately re-picking the stalled
        // credential; the dispatcher rotates meanwhile.
        let until = OffsetDateTime::now_utc() + config.first_chunk_failure_cooldown;
        let _ = self
            .state
            .storage
            .update_state(
                KIND,
                name,
                agproxy_pool::StatePatch {
                    set_model_cooldowns: vec![(target_model.to_string(), until.unix_timestamp())],
                    ..agproxy_pool::StatePatch::default()
                },
            )
            .await;
        self.state.pool.load(KIND).await.ok();
    }

    /// One non-stream re-issue with a reduced context, for 200-but-empty
    /// streams.
    async fn empty_response_fallback(
        &self,
        base_url: &str,
        target_model: &str,
        request: &DispatchRequest,
        _name: &str,
        record: &CredentialRecord,
    ) -> Option<DispatchOutput> {
        let config = self.state.config_snapshot();
        if !config.empty_response_fallback {
            return None;
        }
        info!(model = target_model, "empty stream; re-issuing as non-stream with reduced context");

        let budget = context_budget(target_model) / 2;
        let mut reduced = apply_context_pressure(request.upstream.clone(), budget);
        reduced.session_id = Some(make_request_id());
        let envelope = Envelope {
            model: target_model.to_string(),
            project: record.project_id.clone(),
            request: reduced,
        };
        let payload = serde_json::to_vec(&envelope).ok()?;
        let url = format!("{}{}", base_url.trim_end_matches('/'), GENERATE_PATH);
        let response = self
            .client
            .request(HttpRequest {
                method: HttpMethod::Post,
                url,
                headers: antigravity_headers(&record.access_token, target_model),
                body: Some(Bytes::from(payload)),
                stream: false,
                timeout: config.request_timeout,
            })
            .await
            .ok()?;
        if !(200..300).contains(&response.status) {
            return None;
        }
        let bytes = response.into_bytes().await;
        let envelope: ResponseEnvelope = serde_json::from_slice(&bytes).ok()?;
        Some(DispatchOutput::Upstream(envelope.response))
    }

    // ---- OpenAI-compatible sibling path ----------------------------------

    async fn run_openai_compatible(
        &self,
        backend: &BackendConfig,
        target_model: &str,
        request: &DispatchRequest,
    ) -> Result<DispatchOutput, ChainFailure> {
        let Some(body) = &request.openai_body else {
            // Nothing translatable for this dialect; let the chain move on.
            return Err(ChainFailure::exhausted(target_model));
        };
        let mut body = body.clone();
        if let Some(object) = body.as_object_mut() {
            object.insert("model".to_string(), JsonValue::String(target_model.to_string()));
            object.insert("stream".to_string(), JsonValue::Bool(request.stream));
        }

        let mut last: Option<ChainFailure> = None;
        for base_url in &backend.base_urls {
            let url = format!("{}/v1/chat/completions", base_url.trim_end_matches('/'));
            let mut headers = vec![(
                "Content-Type".to_string(),
                "application/json".to_string(),
            )];
            if let Some(key) = &backend.api_key {
                headers.push(("Authorization".to_string(), format!("Bearer {key}")));
            }
            let payload = serde_json::to_vec(&body).unwrap_or_default();
            let response = self
                .client
                .request(HttpRequest {
                    method: HttpMethod::Post,
                    url,
                    headers,
                    body: Some(Bytes::from(payload)),
                    stream: request.stream,
                    timeout: Duration::from_secs(if request.stream {
                        backend.stream_timeout_secs
                    } else {
                        backend.timeout_secs
                    }),
                })
                .await;

            match response {
                Ok(response) if (200..300).contains(&response.status) => {
                    self.state.stats.record(target_model, &backend.name, None);
                    return match response.body {
                        HttpBody::Stream(rx) => Ok(DispatchOutput::PassthroughStream(rx)),
                        HttpBody::Bytes(bytes) => Ok(DispatchOutput::Passthrough(bytes)),
                    };
                }
                Ok(response) => {
                    let status = response.status;
                    let bytes = response.into_bytes().await;
                    let body_text = String::from_utf8_lossy(&bytes).to_string();
                    let error = match status {
                        429 => GatewayError::UpstreamRateLimited { message: body_text },
                        500..=599 => GatewayError::UpstreamServerError { status },
                        _ => GatewayError::UpstreamNonRetryable {
                            status,
                            body: body_text,
                        },
                    };
                    last = Some(ChainFailure::from_status(status, error));
                }
                Err(err) => {
                    last = Some(ChainFailure {
                        error: GatewayError::UpstreamStalled(err.message.clone()),
                        status: None,
                        timeout: err.is_timeout(),
                        connect: !err.is_timeout(),
                        exhausted: false,
                    });
                }
            }
        }
        Err(last.unwrap_or_else(|| ChainFailure::exhausted(target_model)))
    }
}

enum CredentialVerdict {
    Done(DispatchOutput),
    /// Try another credential on this backend.
    Rotate(ChainFailure),
    /// Stop the whole request (client error); never advances the chain.
    Fatal(ChainFailure),
}

pub(crate) fn antigravity_headers(access_token: &str, model: &str) -> Vec<(String, String)> {
    vec![
        ("Authorization".to_string(), format!("Bearer {access_token}")),
        ("Content-Type".to_string(), "application/json".to_string()),
        ("Accept".to_string(), "application/json".to_string()),
        (
            "User-Agent".to_string(),
            antigravity::USER_AGENT.to_string(),
        ),
        ("requestId".to_string(), make_request_id()),
        (
            "requestType".to_string(),
            request_type_for_model(model).to_string(),
        ),
    ]
}

/// `min(max_delay, base × 2^attempt) × jitter(1±0.2)`, stretched toward a
/// parsed cooldown when one is known (still capped by `max_delay`).
pub fn retry_delay(
    attempt: u32,
    base: Duration,
    max: Duration,
    cooldown_until: Option<OffsetDateTime>,
) -> Duration {
    let exp = base.as_secs_f64() * 2f64.powi(attempt.min(20) as i32);
    let mut delay = exp.min(max.as_secs_f64());
    if let Some(until) = cooldown_until {
        let remaining = (until - OffsetDateTime::now_utc()).as_seconds_f64();
        if remaining > 0.0 {
            delay = delay.max(remaining.min(max.as_secs_f64()));
        }
    }
    let jitter = rand::rng().random_range(0.8..=1.2);
    Duration::from_secs_f64((delay * jitter).max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_is_bounded_and_grows() {
        let base = Duration::from_secs(1);
        let max = Duration::from_secs(1800);
        let first = retry_delay(0, base, max, None);
        assert!(first <= Duration::from_secs_f64(1.2 + f64::EPSILON));
        let big = retry_delay(30, base, max, None);
        assert!(big <= Duration::from_secs_f64(1800.0 * 1.2 + 1.0));
        assert!(big >= Duration::from_secs_f64(1800.0 * 0.8 - 1.0));
    }

    #[test]
    fn retry_delay_honors_parsed_cooldown() {
        let base = Duration::from_secs(1);
        let max = Duration::from_secs(1800);
        let until = OffsetDateTime::now_utc() + Duration::from_secs(90);
        let delay = retry_delay(0, base, max, Some(until));
        assert!(delay >= Duration::from_secs_f64(90.0 * 0.8 - 2.0));
    }
}
