//! OAuth token refresh for existing credential records.
//!
//! The authorization-code dance that creates records happens elsewhere;
//! this module only exchanges a refresh token for a fresh access token
//! when a picked credential is near expiry.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::Deserialize;
use time::OffsetDateTime;
use tracing::info;

use agproxy_pool::CredentialRecord;
use agproxy_protocol::antigravity::OAUTH_TOKEN_URL;

use crate::upstream::{HttpMethod, HttpRequest, UpstreamClient};

/// Refresh when fewer than this many seconds of validity remain.
pub const REFRESH_MARGIN_SECS: i64 = 300;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

pub fn needs_refresh(record: &CredentialRecord, now: OffsetDateTime) -> bool {
    record.expires_at <= now.unix_timestamp() + REFRESH_MARGIN_SECS
}

#[derive(Debug)]
pub struct RefreshError(pub String);

impl std::fmt::Display for RefreshError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "token refresh failed: {}", self.0)
    }
}

impl std::error::Error for RefreshError {}

/// Exchange the refresh token; returns the updated record.
pub async fn refresh_access_token(
    client: &Arc<dyn UpstreamClient>,
    record: &CredentialRecord,
) -> Result<CredentialRecord, RefreshError> {
    if record.refresh_token.is_empty() {
        return Err(RefreshError("no refresh token on record".to_string()));
    }
    let form = format!(
        "client_id={}&client_secret={}&refresh_token={}&grant_type=refresh_token",
        urlencoding::encode(&record.client_id),
        urlencoding::encode(&record.client_secret),
        urlencoding::encode(&record.refresh_token),
    );
    let response = client
        .request(HttpRequest {
            method: HttpMethod::Post,
            url: OAUTH_TOKEN_URL.to_string(),
            headers: vec![(
                "Content-Type".to_string(),
                "application/x-www-form-urlencoded".to_string(),
            )],
            body: Some(Bytes::from(form)),
            stream: false,
            timeout: Duration::from_secs(30),
        })
        .await
        .map_err(|err| RefreshError(err.to_string()))?;

    let status = response.status;
    let body = response.into_bytes().await;
    if !(200..300).contains(&status) {
        return Err(RefreshError(format!(
            "token endpoint returned {status}: {}",
            String::from_utf8_lossy(&body)
        )));
    }
    let token: TokenResponse =
        serde_json::from_slice(&body).map_err(|err| RefreshError(err.to_string()))?;

    let mut updated = record.clone();
    updated.access_token = token.access_token;
    if let Some(refresh_token) = token.refresh_token {
        updated.refresh_token = refresh_token;
    }
    updated.expires_at =
        OffsetDateTime::now_utc().unix_timestamp() + token.expires_in.unwrap_or(3600);
    info!(
        project = %updated.project_id,
        expires_at = updated.expires_at,
        "access token refreshed"
    );
    Ok(updated)
}
