use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use time::OffsetDateTime;
use tokio::sync::mpsc;

use agproxy_common::{CredentialKind, GatewayError};
use agproxy_core::config::{BackendConfig, BackendDialect, FallbackCondition, RoutingRule};
use agproxy_core::{
    AppState, DispatchOutput, DispatchRequest, Dispatcher, GatewayConfig, HttpBody, HttpRequest,
    HttpResponse, RoutingTable, TransportError, TransportErrorKind, UpstreamClient,
};
use agproxy_pool::{CredentialRecord, MemoryStore};
use agproxy_protocol::gemini::{Content, ContentRole, GenerateContentRequest, Part};

const KIND: CredentialKind = CredentialKind::Antigravity;
const MODEL: &str = "claude-sonnet-4-5";

/// 55+ chars, the cache's minimum accepted signature length.
fn long_sig() -> String {
    "sig1".to_string() + &"x".repeat(60)
}

enum Scripted {
    Json {
        status: u16,
        headers: Vec<(&'static str, &'static str)>,
        body: String,
    },
    Sse(Vec<String>),
    /// A stream that opens and then never produces data.
    Silent,
    Transport(TransportErrorKind),
}

struct ScriptedClient {
    script: Mutex<VecDeque<Scripted>>,
    log: Mutex<Vec<String>>,
}

impl ScriptedClient {
    fn new(steps: Vec<Scripted>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(steps.into()),
            log: Mutex::new(Vec::new()),
        })
    }

    fn urls(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

#[async_trait]
impl UpstreamClient for ScriptedClient {
    async fn request(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        self.log.lock().unwrap().push(request.url.clone());
        let step = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .expect("script exhausted");
        match step {
            Scripted::Json {
                status,
                headers,
                body,
            } => Ok(HttpResponse {
                status,
                headers: headers
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                body: HttpBody::Bytes(Bytes::from(body)),
            }),
            Scripted::Sse(lines) => {
                let (tx, rx) = mpsc::channel(16);
                tokio::spawn(async move {
                    for line in lines {
                        if tx.send(Bytes::from(line)).await.is_err() {
                            return;
                        }
                    }
                });
                Ok(HttpResponse {
                    status: 200,
                    headers: vec![("content-type".to_string(), "text/event-stream".to_string())],
                    body: HttpBody::Stream(rx),
                })
            }
            Scripted::Silent => {
                let (tx, rx) = mpsc::channel::<Bytes>(1);
                tokio::spawn(async move {
                    // Hold the sender open well past any test deadline.
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    drop(tx);
                });
                Ok(HttpResponse {
                    status: 200,
                    headers: vec![],
                    body: HttpBody::Stream(rx),
                })
            }
            Scripted::Transport(kind) => Err(TransportError {
                kind,
                message: "scripted transport failure".to_string(),
            }),
        }
    }
}

fn sse_event(json: serde_json::Value) -> String {
    format!("data: {json}\n\n")
}

fn record() -> CredentialRecord {
    CredentialRecord {
        access_token: "ya29.token".to_string(),
        refresh_token: "1//refresh".to_string(),
        expires_at: OffsetDateTime::now_utc().unix_timestamp() + 3600,
        token_type: "Bearer".to_string(),
        scopes: vec![],
        client_id: "cid".to_string(),
        client_secret: "secret".to_string(),
        project_id: "project-1".to_string(),
        email: None,
        kind: KIND,
    }
}

fn fast_config() -> GatewayConfig {
    GatewayConfig {
        retry_base_delay: Duration::from_millis(5),
        retry_max_delay: Duration::from_millis(20),
        first_chunk_timeout: Duration::from_millis(200),
        ..GatewayConfig::default()
    }
}

fn antigravity_table(base_urls: Vec<String>) -> RoutingTable {
    let mut backend = BackendConfig::antigravity_default(None);
    backend.base_urls = base_urls;
    RoutingTable {
        backends: HashMap::from([("antigravity".to_string(), backend)]),
        rules: HashMap::new(),
    }
}

async fn state_with(table: RoutingTable, creds: &[&str]) -> Arc<AppState> {
    let storage = Arc::new(MemoryStore::new());
    let state = AppState::new(fast_config(), table, storage);
    for name in creds {
        state.pool.upsert(KIND, name, record()).await;
    }
    state
}

fn upstream_request() -> GenerateContentRequest {
    GenerateContentRequest {
        contents: vec![Content {
            role: Some(ContentRole::User),
            parts: vec![Part::text("hi")],
        }],
        ..GenerateContentRequest::default()
    }
}

fn dispatch_request(stream: bool) -> DispatchRequest {
    DispatchRequest {
        alias: MODEL.to_string(),
        upstream: upstream_request(),
        openai_body: None,
        stream,
    }
}

#[tokio::test]
async fn auto_stream_conversion_rebuilds_json() {
    let sig = long_sig();
    let client = ScriptedClient::new(vec![Scripted::Sse(vec![
        sse_event(serde_json::json!({"response": {"candidates": [{"content": {"parts": [
            {"thought": true, "text": "thinking…", "thoughtSignature": sig}
        ], "role": "model"}}]}})),
        sse_event(serde_json::json!({"response": {"candidates": [{"content": {"parts": [
            {"text": "hello "}
        ], "role": "model"}}]}})),
        sse_event(serde_json::json!({"response": {"candidates": [{"content": {"parts": [
            {"text": "world"}
        ], "role": "model"}, "finishReason": "STOP"}]}})),
        "data: [DONE]\n\n".to_string(),
    ])]);
    let state = state_with(antigravity_table(vec!["https://upstream".to_string()]), &["alice"]).await;
    let dispatcher = Dispatcher::new(state.clone(), client.clone());

    let output = dispatcher.dispatch(dispatch_request(false)).await.unwrap();
    let DispatchOutput::Upstream(response) = output else {
        panic!("expected reconstructed upstream response");
    };
    let parts = &response.candidates[0].content.as_ref().unwrap().parts;
    assert_eq!(parts.len(), 2);
    assert_eq!(parts[0].thought, Some(true));
    assert_eq!(parts[0].text.as_deref(), Some("thinking…"));
    assert_eq!(parts[0].thought_signature.as_deref(), Some(long_sig().as_str()));
    assert_eq!(parts[1].text.as_deref(), Some("hello world"));

    // Side effect: the signature cache learned the thinking text.
    assert_eq!(state.signatures.get("thinking…"), Some(long_sig()));

    // Upstream was called on the streaming endpoint despite the
    // non-stream client.
    assert!(client.urls()[0].contains(":streamGenerateContent?alt=sse"));
}

#[tokio::test]
async fn parseable_429_sets_cooldown_then_next_base_url_succeeds() {
    let body = serde_json::json!({"error": {"details": [
        {"@type": "type.googleapis.com/google.rpc.ErrorInfo",
         "metadata": {"quotaResetTimeStamp": "2027-01-17T12:00:00Z"}}
    ]}})
    .to_string();
    let client = ScriptedClient::new(vec![
        Scripted::Json {
            status: 429,
            headers: vec![],
            body,
        },
        Scripted::Sse(vec![
            sse_event(serde_json::json!({"response": {"candidates": [{"content": {"parts": [
                {"text": "ok"}
            ], "role": "model"}, "finishReason": "STOP"}]}})),
            "data: [DONE]\n\n".to_string(),
        ]),
    ]);
    let state = state_with(
        antigravity_table(vec![
            "https://sandbox".to_string(),
            "https://daily".to_string(),
        ]),
        &["alice"],
    )
    .await;
    let dispatcher = Dispatcher::new(state.clone(), client.clone());

    let output = dispatcher.dispatch(dispatch_request(false)).await.unwrap();
    assert!(matches!(output, DispatchOutput::Upstream(_)));

    // BaseURL failover happened before any credential rotation.
    let urls = client.urls();
    assert!(urls[0].starts_with("https://sandbox"));
    assert!(urls[1].starts_with("https://daily"));

    // The parsed reset instant landed on the credential's model cooldown.
    let cred_state = state.pool.state_of(KIND, "alice").await.unwrap();
    let expected = OffsetDateTime::parse(
        "2027-01-17T12:00:00Z",
        &time::format_description::well_known::Rfc3339,
    )
    .unwrap()
    .unix_timestamp();
    let actual = cred_state.model_cooldowns.get(MODEL).copied().unwrap();
    assert!((actual - expected).abs() <= 1);
}

#[tokio::test]
async fn chain_rolls_over_to_the_first_healthy_backend() {
    // kiro → 503, antigravity → 429 capacity exhausted, copilot → 200.
    let client = ScriptedClient::new(vec![
        Scripted::Json {
            status: 503,
            headers: vec![],
            body: "unavailable".to_string(),
        },
        Scripted::Json {
            status: 429,
            headers: vec![],
            body: serde_json::json!({"error": {"status": "RESOURCE_EXHAUSTED",
                "message": "MODEL_CAPACITY_EXHAUSTED"}})
            .to_string(),
        },
        Scripted::Json {
            status: 200,
            headers: vec![],
            body: serde_json::json!({"id": "chatcmpl-1", "object": "chat.completion",
                "created": 1, "model": "claude-sonnet-4",
                "choices": [{"index": 0, "message": {"role": "assistant", "content": "from copilot"},
                             "finish_reason": "stop"}]})
            .to_string(),
        },
    ]);

    let mut backends = HashMap::new();
    backends.insert("kiro-gateway".to_string(), BackendConfig {
        name: "kiro-gateway".to_string(),
        dialect: BackendDialect::OpenAi,
        base_urls: vec!["http://kiro:9046".to_string()],
        api_key: None,
        priority: 1,
        models: vec![],
        enabled: true,
        timeout_secs: 5,
        stream_timeout_secs: 5,
        max_retries: 0,
    });
    backends.insert(
        "antigravity".to_string(),
        BackendConfig::antigravity_default(Some("https://upstream")),
    );
    backends.insert("copilot".to_string(), BackendConfig {
        name: "copilot".to_string(),
        dialect: BackendDialect::OpenAi,
        base_urls: vec!["http://copilot:8141".to_string()],
        api_key: Some("key".to_string()),
        priority: 2,
        models: vec![],
        enabled: true,
        timeout_secs: 5,
        stream_timeout_secs: 5,
        max_retries: 0,
    });
    let rules = HashMap::from([(
        "claude-sonnet-4.5".to_string(),
        RoutingRule {
            chain: vec![
                ("kiro-gateway".to_string(), "claude-sonnet-4.5".to_string()),
                ("antigravity".to_string(), MODEL.to_string()),
                ("copilot".to_string(), "claude-sonnet-4".to_string()),
            ],
            fallback_on: vec![
                FallbackCondition::Status(429),
                FallbackCondition::Status(503),
                FallbackCondition::Timeout,
            ],
            enabled: true,
        },
    )]);

    let state = state_with(RoutingTable { backends, rules }, &["alice"]).await;
    let dispatcher = Dispatcher::new(state, client.clone());

    let output = dispatcher
        .dispatch(DispatchRequest {
            alias: "claude-sonnet-4.5".to_string(),
            upstream: upstream_request(),
            openai_body: Some(serde_json::json!({
                "model": "claude-sonnet-4.5",
                "messages": [{"role": "user", "content": "hi"}]
            })),
            stream: false,
        })
        .await
        .unwrap();

    let DispatchOutput::Passthrough(bytes) = output else {
        panic!("expected the copilot passthrough body");
    };
    let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["choices"][0]["message"]["content"], "from copilot");

    // Exactly three upstream attempts, in chain order.
    let urls = client.urls();
    assert_eq!(urls.len(), 3);
    assert!(urls[0].starts_with("http://kiro:9046"));
    assert!(urls[1].starts_with("https://upstream"));
    assert!(urls[2].starts_with("http://copilot:8141"));
}

#[tokio::test]
async fn first_chunk_stall_rotates_credentials() {
    let client = ScriptedClient::new(vec![
        Scripted::Silent,
        Scripted::Sse(vec![
            sse_event(serde_json::json!({"response": {"candidates": [{"content": {"parts": [
                {"text": "recovered"}
            ], "role": "model"}, "finishReason": "STOP"}]}})),
            "data: [DONE]\n\n".to_string(),
        ]),
    ]);
    let state = state_with(
        antigravity_table(vec!["https://upstream".to_string()]),
        &["alice", "bob"],
    )
    .await;
    let dispatcher = Dispatcher::new(state.clone(), client.clone());

    let output = dispatcher.dispatch(dispatch_request(false)).await.unwrap();
    let DispatchOutput::Upstream(response) = output else {
        panic!("expected a reconstructed response after rotation");
    };
    let text = response.candidates[0].content.as_ref().unwrap().parts[0]
        .text
        .as_deref();
    assert_eq!(text, Some("recovered"));
    assert_eq!(client.urls().len(), 2);

    // The stalled credential picked up a short cooldown for the model.
    let cooled: usize = [
        state.pool.state_of(KIND, "alice").await.unwrap(),
        state.pool.state_of(KIND, "bob").await.unwrap(),
    ]
    .iter()
    .filter(|s| s.model_cooldowns.contains_key(MODEL))
    .count();
    assert_eq!(cooled, 1);
}

#[tokio::test]
async fn client_stream_receives_parsed_chunks() {
    let client = ScriptedClient::new(vec![Scripted::Sse(vec![
        sse_event(serde_json::json!({"response": {"candidates": [{"content": {"parts": [
            {"text": "a"}
        ], "role": "model"}}]}})),
        sse_event(serde_json::json!({"response": {"candidates": [{"content": {"parts": [
            {"text": "b"}
        ], "role": "model"}, "finishReason": "STOP"}]}})),
        "data: [DONE]\n\n".to_string(),
    ])]);
    let state = state_with(antigravity_table(vec!["https://upstream".to_string()]), &["alice"]).await;
    let dispatcher = Dispatcher::new(state, client);

    let output = dispatcher.dispatch(dispatch_request(true)).await.unwrap();
    let DispatchOutput::UpstreamStream(mut handle) = output else {
        panic!("expected a chunk stream");
    };
    let mut texts = Vec::new();
    while let Some(chunk) = handle.rx.recv().await {
        if let Some(content) = chunk.candidates.first().and_then(|c| c.content.as_ref()) {
            for part in &content.parts {
                if let Some(text) = &part.text {
                    texts.push(text.clone());
                }
            }
        }
    }
    assert_eq!(texts, vec!["a".to_string(), "b".to_string()]);
}

#[tokio::test]
async fn upstream_400_surfaces_without_chain_advance() {
    let client = ScriptedClient::new(vec![Scripted::Json {
        status: 400,
        headers: vec![],
        body: "tool schema invalid".to_string(),
    }]);
    let state = state_with(antigravity_table(vec!["https://upstream".to_string()]), &["alice"]).await;
    let dispatcher = Dispatcher::new(state, client.clone());

    let err = dispatcher.dispatch(dispatch_request(false)).await.unwrap_err();
    assert!(matches!(err, GatewayError::UpstreamNonRetryable { status: 400, .. }));
    assert_eq!(client.urls().len(), 1);
}

#[tokio::test]
async fn pool_exhaustion_surfaces_as_no_credential() {
    let client = ScriptedClient::new(vec![]);
    let state = state_with(antigravity_table(vec!["https://upstream".to_string()]), &[]).await;
    let dispatcher = Dispatcher::new(state, client);

    let err = dispatcher.dispatch(dispatch_request(false)).await.unwrap_err();
    assert!(matches!(err, GatewayError::CredentialPoolExhausted { .. }));
    assert_eq!(err.status(), 503);
    assert_eq!(err.tag().as_str(), "NO_CREDENTIAL");
}
