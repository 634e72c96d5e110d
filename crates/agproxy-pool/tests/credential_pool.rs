use std::sync::Arc;
use std::time::Duration;

use agproxy_common::CredentialKind;
use agproxy_pool::{
    CredentialPool, CredentialRecord, MemoryStore, Outcome, PoolSettings, StatePatch,
};
use time::OffsetDateTime;

fn record(project: &str) -> CredentialRecord {
    CredentialRecord {
        access_token: "ya29.test".to_string(),
        refresh_token: "1//refresh".to_string(),
        expires_at: OffsetDateTime::now_utc().unix_timestamp() + 3600,
        token_type: "Bearer".to_string(),
        scopes: vec![],
        client_id: "client".to_string(),
        client_secret: "secret".to_string(),
        project_id: project.to_string(),
        email: None,
        kind: CredentialKind::Antigravity,
    }
}

const KIND: CredentialKind = CredentialKind::Antigravity;
const MODEL: &str = "claude-sonnet-4-5";

async fn pool_with(names: &[&str]) -> CredentialPool {
    let storage = Arc::new(MemoryStore::new());
    let pool = CredentialPool::new(storage, PoolSettings::default());
    for name in names {
        pool.upsert(KIND, name, record(name)).await;
    }
    pool
}

#[tokio::test]
async fn pick_prefers_least_recently_successful() {
    let pool = pool_with(&["alice", "bob"]).await;
    pool.record(KIND, "alice", MODEL, &Outcome::Success).await;
    // bob has never succeeded, so bob goes first.
    let (name, _) = pool.pick(KIND, Some(MODEL)).await.unwrap();
    assert_eq!(name, "bob");
}

#[tokio::test]
async fn disabled_and_cooled_down_credentials_are_never_picked() {
    let pool = pool_with(&["alice", "bob"]).await;
    pool.set_disabled(KIND, "alice", true, Some("manual".to_string()), false)
        .await;

    let until = OffsetDateTime::now_utc().unix_timestamp() + 120;
    pool.storage()
        .update_state(
            KIND,
            "bob",
            StatePatch {
                set_model_cooldowns: vec![(MODEL.to_string(), until)],
                ..StatePatch::default()
            },
        )
        .await
        .unwrap();
    pool.load(KIND).await.unwrap();

    assert!(pool.pick(KIND, Some(MODEL)).await.is_none());
    // bob's cooldown is model-scoped; another model still works.
    let (name, _) = pool.pick(KIND, Some("gemini-3-flash")).await.unwrap();
    assert_eq!(name, "bob");
}

#[tokio::test]
async fn starvation_relief_waits_for_earliest_expiry() {
    let pool = pool_with(&["alice", "bob"]).await;
    // Both credentials cooled down for the model; alice expires first.
    let now = OffsetDateTime::now_utc().unix_timestamp();
    for (name, until) in [("alice", now + 2), ("bob", now + 8)] {
        pool.storage()
            .update_state(
                KIND,
                name,
                StatePatch {
                    set_model_cooldowns: vec![(MODEL.to_string(), until)],
                    ..StatePatch::default()
                },
            )
            .await
            .unwrap();
    }
    pool.load(KIND).await.unwrap();
    assert!(pool.pick(KIND, Some(MODEL)).await.is_none());

    let started = std::time::Instant::now();
    let picked = pool.pick_with_relief(KIND, Some(MODEL)).await;
    assert_eq!(picked.unwrap().0, "alice");
    let waited = started.elapsed();
    assert!(waited >= Duration::from_secs(1), "waited {waited:?}");
    assert!(waited < Duration::from_secs(5), "waited {waited:?}");
}

#[tokio::test]
async fn relief_falls_back_to_any_model() {
    let pool = pool_with(&["alice"]).await;
    // Cooldown far in the future: waiting is pointless, but the any-model
    // fallback still returns the credential.
    let until = OffsetDateTime::now_utc().unix_timestamp() + 7200;
    pool.storage()
        .update_state(
            KIND,
            "alice",
            StatePatch {
                set_model_cooldowns: vec![(MODEL.to_string(), until)],
                ..StatePatch::default()
            },
        )
        .await
        .unwrap();
    pool.load(KIND).await.unwrap();

    let picked = pool.pick_with_relief(KIND, Some(MODEL)).await;
    assert_eq!(picked.unwrap().0, "alice");
}

#[tokio::test]
async fn parseable_reset_timestamp_sets_model_cooldown() {
    let pool = pool_with(&["alice"]).await;
    let body = r#"{"error":{"details":[{"@type":"type.googleapis.com/google.rpc.ErrorInfo","metadata":{"quotaResetTimeStamp":"2026-01-17T12:00:00Z"}}]}}"#;
    let recorded = pool
        .record(
            KIND,
            "alice",
            MODEL,
            &Outcome::HttpError {
                status: 429,
                headers: vec![],
                body: body.to_string(),
                all_others_exhausted: false,
            },
        )
        .await;

    let expected = OffsetDateTime::parse(
        "2026-01-17T12:00:00Z",
        &time::format_description::well_known::Rfc3339,
    )
    .unwrap();
    let until = recorded.cooldown_until.unwrap();
    assert!((until.unix_timestamp() - expected.unix_timestamp()).abs() <= 1);

    let state = pool.state_of(KIND, "alice").await.unwrap();
    assert_eq!(
        state.model_cooldowns.get(MODEL).copied(),
        Some(expected.unix_timestamp())
    );
}

#[tokio::test]
async fn tiered_lockout_escalates_when_pool_is_exhausted() {
    let pool = pool_with(&["alice"]).await;
    let failure = |exhausted| Outcome::HttpError {
        status: 429,
        headers: vec![],
        body: "quota exceeded".to_string(),
        all_others_exhausted: exhausted,
    };
    let now = OffsetDateTime::now_utc();

    let first = pool.record(KIND, "alice", MODEL, &failure(true)).await;
    let second = pool.record(KIND, "alice", MODEL, &failure(true)).await;
    let first_secs = (first.cooldown_until.unwrap() - now).whole_seconds();
    let second_secs = (second.cooldown_until.unwrap() - now).whole_seconds();
    assert!((55..=65).contains(&first_secs), "got {first_secs}");
    assert!((295..=305).contains(&second_secs), "got {second_secs}");

    // Success resets the ladder.
    pool.record(KIND, "alice", MODEL, &Outcome::Success).await;
    let again = pool.record(KIND, "alice", MODEL, &failure(true)).await;
    let again_secs = (again.cooldown_until.unwrap() - now).whole_seconds();
    assert!((55..=65).contains(&again_secs), "got {again_secs}");
}

#[tokio::test]
async fn auto_ban_disables_credential() {
    let storage = Arc::new(MemoryStore::new());
    let pool = CredentialPool::new(
        storage,
        PoolSettings {
            auto_ban_enabled: true,
            auto_ban_codes: vec![403],
            ..PoolSettings::default()
        },
    );
    pool.upsert(KIND, "alice", record("alice")).await;

    let recorded = pool
        .record(
            KIND,
            "alice",
            MODEL,
            &Outcome::HttpError {
                status: 403,
                headers: vec![],
                body: "forbidden".to_string(),
                all_others_exhausted: false,
            },
        )
        .await;
    assert!(recorded.auto_banned);

    let state = pool.state_of(KIND, "alice").await.unwrap();
    assert!(state.disabled);
    assert_eq!(state.disabled_reason.as_deref(), Some("auto_ban"));
    assert!(pool.pick(KIND, None).await.is_none());
}

#[tokio::test]
async fn success_resets_errors_but_keeps_parsed_cooldowns() {
    let pool = pool_with(&["alice"]).await;
    pool.record(
        KIND,
        "alice",
        MODEL,
        &Outcome::HttpError {
            status: 503,
            headers: vec![],
            body: "unavailable".to_string(),
            all_others_exhausted: false,
        },
    )
    .await;
    let state = pool.state_of(KIND, "alice").await.unwrap();
    assert!(!state.error_codes.is_empty());
    assert!(state.model_cooldowns.contains_key(MODEL));

    pool.record(KIND, "alice", MODEL, &Outcome::Success).await;
    let state = pool.state_of(KIND, "alice").await.unwrap();
    assert!(state.error_codes.is_empty());
    // A recorded reset instant remains authoritative after a success.
    assert!(state.model_cooldowns.contains_key(MODEL));
    assert!(state.last_success.is_some());
}
