use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use agproxy_common::GatewayError;

/// Wire shape for surfaced errors: status code, human message, and a
/// short machine tag clients can branch on.
pub struct ApiError(pub GatewayError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::warn!(tag = self.0.tag().as_str(), %status, "request failed");
        }
        let message = match &self.0 {
            GatewayError::UpstreamEmpty => {
                "upstream returned an empty response; retry, or reduce the context and retry"
                    .to_string()
            }
            other => other.to_string(),
        };
        let body = serde_json::json!({
            "error": {
                "message": message,
                "type": "gateway_error",
                "code": self.0.tag().as_str(),
            }
        });
        (status, Json(body)).into_response()
    }
}

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        ApiError(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn carries_machine_tag_and_status() {
        let response = ApiError(GatewayError::UpstreamQuotaExhausted {
            model: "m".to_string(),
        })
        .into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
