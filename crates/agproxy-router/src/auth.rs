use axum::http::HeaderMap;

use agproxy_common::GatewayError;

/// Minimal edge bearer check against `api_password`. An empty password
/// disables the check (local/dev deployments).
pub fn check_bearer(headers: &HeaderMap, api_password: &str) -> Result<(), GatewayError> {
    if api_password.is_empty() {
        return Ok(());
    }
    let provided = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .or_else(|| {
            headers
                .get("x-api-key")
                .and_then(|value| value.to_str().ok())
        });
    match provided {
        Some(token) if constant_time_eq(token.as_bytes(), api_password.as_bytes()) => Ok(()),
        _ => Err(GatewayError::AuthRejected),
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_password_allows_everything() {
        assert!(check_bearer(&HeaderMap::new(), "").is_ok());
    }

    #[test]
    fn bearer_and_x_api_key_both_work() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer sk-secret".parse().unwrap());
        assert!(check_bearer(&headers, "sk-secret").is_ok());
        assert!(check_bearer(&headers, "other").is_err());

        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", "sk-secret".parse().unwrap());
        assert!(check_bearer(&headers, "sk-secret").is_ok());
    }
}
