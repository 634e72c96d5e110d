use serde::{Deserialize, Serialize};

/// Short machine-readable tag attached to every user-visible gateway error.
///
/// Clients key retry behavior off these, so the set is part of the API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorTag {
    BadRequest,
    AuthRejected,
    Upstream,
    RateLimited,
    QuotaExhausted,
    NoCredential,
    Stall,
    EmptyResponse,
    ContextTooLong,
}

impl ErrorTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorTag::BadRequest => "BAD_REQUEST",
            ErrorTag::AuthRejected => "AUTH_REJECTED",
            ErrorTag::Upstream => "UPSTREAM",
            ErrorTag::RateLimited => "RATE_LIMITED",
            ErrorTag::QuotaExhausted => "QUOTA_EXHAUSTED",
            ErrorTag::NoCredential => "NO_CREDENTIAL",
            ErrorTag::Stall => "STALL",
            ErrorTag::EmptyResponse => "EMPTY_RESPONSE",
            ErrorTag::ContextTooLong => "CONTEXT_TOO_LONG",
        }
    }
}

/// Gateway-level error taxonomy.
///
/// Subsystems raise these; the dispatcher alone decides retry vs. rollover
/// vs. surface. `status()` is the downstream HTTP status once surfaced.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    #[error("malformed request: {0}")]
    ClientMalformed(String),
    #[error("authentication rejected")]
    AuthRejected,
    #[error("upstream rejected request ({status}): {body}")]
    UpstreamNonRetryable { status: u16, body: String },
    #[error("upstream rate limited: {message}")]
    UpstreamRateLimited { message: String },
    #[error("upstream quota exhausted for {model}")]
    UpstreamQuotaExhausted { model: String },
    #[error("upstream server error ({status})")]
    UpstreamServerError { status: u16 },
    #[error("upstream stalled: {0}")]
    UpstreamStalled(String),
    #[error("upstream returned an empty response")]
    UpstreamEmpty,
    #[error("no credential available for {model}")]
    CredentialPoolExhausted { model: String },
    #[error("request exceeds the model context window: {0}")]
    ContextTooLong(String),
}

impl GatewayError {
    pub fn tag(&self) -> ErrorTag {
        match self {
            GatewayError::ClientMalformed(_) => ErrorTag::BadRequest,
            GatewayError::AuthRejected => ErrorTag::AuthRejected,
            GatewayError::UpstreamNonRetryable { .. } => ErrorTag::Upstream,
            GatewayError::UpstreamRateLimited { .. } => ErrorTag::RateLimited,
            GatewayError::UpstreamQuotaExhausted { .. } => ErrorTag::QuotaExhausted,
            GatewayError::UpstreamServerError { .. } => ErrorTag::Upstream,
            GatewayError::UpstreamStalled(_) => ErrorTag::Stall,
            GatewayError::UpstreamEmpty => ErrorTag::EmptyResponse,
            GatewayError::CredentialPoolExhausted { .. } => ErrorTag::NoCredential,
            GatewayError::ContextTooLong(_) => ErrorTag::ContextTooLong,
        }
    }

    pub fn status(&self) -> u16 {
        match self {
            GatewayError::ClientMalformed(_) => 400,
            GatewayError::AuthRejected => 401,
            GatewayError::UpstreamNonRetryable { status, .. } => *status,
            GatewayError::UpstreamRateLimited { .. } => 429,
            GatewayError::UpstreamQuotaExhausted { .. } => 503,
            GatewayError::UpstreamServerError { .. } => 502,
            GatewayError::UpstreamStalled(_) => 504,
            GatewayError::UpstreamEmpty => 502,
            GatewayError::CredentialPoolExhausted { .. } => 503,
            GatewayError::ContextTooLong(_) => 400,
        }
    }
}

/// Which upstream identity family a credential belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialKind {
    Standard,
    Antigravity,
}

impl CredentialKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialKind::Standard => "standard",
            CredentialKind::Antigravity => "antigravity",
        }
    }
}

/// Upstream request id, `req-<uuid>` per the Antigravity wire contract.
pub fn make_request_id() -> String {
    format!("req-{}", uuid::Uuid::new_v4())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_round_trip_as_screaming_snake() {
        let tag = serde_json::to_string(&ErrorTag::QuotaExhausted).unwrap();
        assert_eq!(tag, "\"QUOTA_EXHAUSTED\"");
        assert_eq!(ErrorTag::QuotaExhausted.as_str(), "QUOTA_EXHAUSTED");
    }

    #[test]
    fn statuses_follow_the_surface_table() {
        assert_eq!(
            GatewayError::UpstreamQuotaExhausted {
                model: "m".to_string()
            }
            .status(),
            503
        );
        assert_eq!(GatewayError::UpstreamStalled("t".to_string()).status(), 504);
        assert_eq!(
            GatewayError::CredentialPoolExhausted {
                model: "m".to_string()
            }
            .status(),
            503
        );
    }
}
