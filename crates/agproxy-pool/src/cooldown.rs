//! Cooldown-hint parsing and lockout classification.
//!
//! Upstream 429/5xx payloads hide their reset hints in several places;
//! `parse_cooldown_hint` tries them in a fixed priority order and returns
//! an absolute instant. When nothing parses, callers fall back to the
//! text-classified defaults in `classify_429_lockout`.

use std::time::Duration;

use serde_json::Value as JsonValue;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

/// Short model-level cooldown applied on 500/503/529 in addition to the
/// dispatcher's own retry pacing.
pub const SERVER_ERROR_COOLDOWN: Duration = Duration::from_secs(20);

/// Priority order:
/// 1. `Retry-After` header (integer seconds or HTTP-date),
/// 2. `RetryInfo.retryDelay` duration string (`1h16m0.667s`, `200ms`),
/// 3. `ErrorInfo.metadata.quotaResetTimeStamp` (ISO-8601),
/// 4. `ErrorInfo.metadata.quotaResetDelay` duration string,
/// 5. "reset/retry after/in Ns" phrasing inside the error message.
pub fn parse_cooldown_hint(
    headers: &[(String, String)],
    body: &str,
    now: OffsetDateTime,
) -> Option<OffsetDateTime> {
    if let Some(value) = header_get(headers, "retry-after")
        && let Some(delay) = parse_retry_after(value, now)
    {
        return Some(delay);
    }

    let payload: Option<JsonValue> = serde_json::from_str(body).ok();
    if let Some(payload) = &payload {
        if let Some(delay) = find_detail_field(payload, "RetryInfo", "retryDelay")
            .and_then(|v| v.as_str().map(str::to_string))
            .and_then(|s| parse_google_duration(&s))
        {
            return Some(now + delay);
        }
        if let Some(stamp) = find_error_info_metadata(payload, "quotaResetTimeStamp")
            && let Ok(instant) = OffsetDateTime::parse(&stamp, &Rfc3339)
        {
            return Some(instant);
        }
        if let Some(delay) = find_error_info_metadata(payload, "quotaResetDelay")
            .and_then(|s| parse_google_duration(&s))
        {
            return Some(now + delay);
        }
    }

    parse_reset_phrase(body).map(|delay| now + delay)
}

fn header_get<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

fn parse_retry_after(value: &str, now: OffsetDateTime) -> Option<OffsetDateTime> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(secs) = value.parse::<u64>() {
        return Some(now + Duration::from_secs(secs));
    }
    let when = httpdate::parse_http_date(value).ok()?;
    let stamp = when.duration_since(std::time::UNIX_EPOCH).ok()?;
    OffsetDateTime::from_unix_timestamp(stamp.as_secs() as i64).ok()
}

/// Walk `error.details[]` for an entry whose `@type` mentions `type_name`
/// and return its `field`.
fn find_detail_field(payload: &JsonValue, type_name: &str, field: &str) -> Option<JsonValue> {
    let details = payload
        .get("error")
        .and_then(|e| e.get("details"))
        .or_else(|| payload.get("details"))?
        .as_array()?;
    for detail in details {
        let type_matches = detail
            .get("@type")
            .and_then(|t| t.as_str())
            .is_some_and(|t| t.contains(type_name));
        if type_matches && let Some(value) = detail.get(field) {
            return Some(value.clone());
        }
    }
    None
}

fn find_error_info_metadata(payload: &JsonValue, key: &str) -> Option<String> {
    let details = payload
        .get("error")
        .and_then(|e| e.get("details"))
        .or_else(|| payload.get("details"))?
        .as_array()?;
    for detail in details {
        let is_error_info = detail
            .get("@type")
            .and_then(|t| t.as_str())
            .is_some_and(|t| t.contains("ErrorInfo"));
        if !is_error_info {
            continue;
        }
        if let Some(value) = detail
            .get("metadata")
            .and_then(|m| m.get(key))
            .and_then(|v| v.as_str())
        {
            return Some(value.to_string());
        }
    }
    None
}

/// Google RPC duration strings: `1h16m0.667s`, `200ms`, `30s`.
pub fn parse_google_duration(text: &str) -> Option<Duration> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    let mut total = Duration::ZERO;
    let mut number = String::new();
    let mut chars = text.chars().peekable();
    let mut matched_any = false;

    while let Some(c) = chars.next() {
        if c.is_ascii_digit() || c == '.' {
            number.push(c);
            continue;
        }
        let unit = if c == 'm' && chars.peek() == Some(&'s') {
            chars.next();
            "ms"
        } else {
            match c {
                'h' => "h",
                'm' => "m",
                's' => "s",
                _ => return None,
            }
        };
        let value: f64 = number.parse().ok()?;
        number.clear();
        matched_any = true;
        let seconds = match unit {
            "h" => value * 3600.0,
            "m" => value * 60.0,
            "s" => value,
            _ => value / 1000.0,
        };
        total += Duration::from_secs_f64(seconds);
    }

    if !matched_any || !number.is_empty() {
        return None;
    }
    Some(total)
}

/// Last-resort scan for "reset after 30s" / "retry in 2.5 m" phrasing.
fn parse_reset_phrase(text: &str) -> Option<Duration> {
    let lower = text.to_ascii_lowercase();
    for anchor in ["reset", "retry"] {
        let mut search = lower.as_str();
        while let Some(pos) = search.find(anchor) {
            let rest = &search[pos + anchor.len()..];
            let rest = rest.trim_start();
            let rest = rest
                .strip_prefix("after")
                .or_else(|| rest.strip_prefix("in"))
                .map(str::trim_start);
            if let Some(rest) = rest
                && let Some(duration) = leading_duration(rest)
            {
                return Some(duration);
            }
            search = &search[pos + anchor.len()..];
        }
    }
    None
}

fn leading_duration(text: &str) -> Option<Duration> {
    let digits: String = text
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    if digits.is_empty() {
        return None;
    }
    let value: f64 = digits.parse().ok()?;
    let rest = text[digits.len()..].trim_start();
    let factor = match rest.chars().next() {
        Some('s') => 1.0,
        Some('m') => 60.0,
        Some('h') => 3600.0,
        _ => return None,
    };
    Some(Duration::from_secs_f64(value * factor))
}

/// Fallback lockout for a 429 with no parseable hint, classified by the
/// error text: rate limiting gets 30 s, quota language gets an hour,
/// anything else a minute.
pub fn classify_429_lockout(error_text: &str) -> Duration {
    let text = error_text.to_ascii_lowercase();
    let rate_limited = ["rate limit", "rate_limit", "per minute", "rpm", "qps"]
        .iter()
        .any(|needle| text.contains(needle));
    if rate_limited {
        return Duration::from_secs(30);
    }
    if text.contains("quota") {
        return Duration::from_secs(3600);
    }
    Duration::from_secs(60)
}

pub fn is_quota_language(error_text: &str) -> bool {
    let text = error_text.to_ascii_lowercase();
    text.contains("quota") || text.contains("exhaust")
}

/// Lockout ladder when every other credential is already exhausted for
/// the model: 60 s, 5 min, 30 min, then 2 h.
pub fn tiered_quota_lockout(consecutive_failures: u32) -> Duration {
    match consecutive_failures.max(1) {
        1 => Duration::from_secs(60),
        2 => Duration::from_secs(300),
        3 => Duration::from_secs(1800),
        _ => Duration::from_secs(7200),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(unix: i64) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(unix).unwrap()
    }

    #[test]
    fn retry_after_seconds_wins_over_body() {
        let headers = vec![("Retry-After".to_string(), "90".to_string())];
        let body = r#"{"error":{"details":[{"@type":"type.googleapis.com/google.rpc.RetryInfo","retryDelay":"10s"}]}}"#;
        let now = at(1_000_000);
        let until = parse_cooldown_hint(&headers, body, now).unwrap();
        assert_eq!(until.unix_timestamp(), 1_000_090);
    }

    #[test]
    fn retry_info_duration_parses() {
        let body = r#"{"error":{"details":[{"@type":".../google.rpc.RetryInfo","retryDelay":"1h16m0.667s"}]}}"#;
        let now = at(0);
        let until = parse_cooldown_hint(&[], body, now).unwrap();
        let expected = 3600 + 16 * 60;
        assert!((until.unix_timestamp() - expected).abs() <= 1);
    }

    #[test]
    fn quota_reset_timestamp_parses() {
        let body = r#"{"error":{"details":[{"@type":".../google.rpc.ErrorInfo","metadata":{"quotaResetTimeStamp":"2026-01-17T12:00:00Z"}}]}}"#;
        let until = parse_cooldown_hint(&[], body, at(0)).unwrap();
        let expected = OffsetDateTime::parse("2026-01-17T12:00:00Z", &Rfc3339).unwrap();
        assert_eq!(until, expected);
    }

    #[test]
    fn quota_reset_delay_parses() {
        let body = r#"{"error":{"details":[{"@type":".../ErrorInfo","metadata":{"quotaResetDelay":"200ms"}}]}}"#;
        let until = parse_cooldown_hint(&[], body, at(100)).unwrap();
        assert_eq!(until.unix_timestamp(), 100);
    }

    #[test]
    fn reset_phrase_fallback() {
        let until = parse_cooldown_hint(&[], "please retry after 30 s", at(0)).unwrap();
        assert_eq!(until.unix_timestamp(), 30);
        let until = parse_cooldown_hint(&[], "quota will reset in 2 m", at(0)).unwrap();
        assert_eq!(until.unix_timestamp(), 120);
    }

    #[test]
    fn google_durations() {
        assert_eq!(
            parse_google_duration("200ms"),
            Some(Duration::from_millis(200))
        );
        assert_eq!(parse_google_duration("30s"), Some(Duration::from_secs(30)));
        assert_eq!(
            parse_google_duration("1h16m0.667s"),
            Some(Duration::from_secs(3600 + 960) + Duration::from_secs_f64(0.667))
        );
        assert_eq!(parse_google_duration("nope"), None);
        assert_eq!(parse_google_duration("12"), None);
    }

    #[test]
    fn classification_defaults() {
        assert_eq!(
            classify_429_lockout("Resource has been exhausted (e.g. check quota)"),
            Duration::from_secs(3600)
        );
        assert_eq!(
            classify_429_lockout("rate limit: too many RPM"),
            Duration::from_secs(30)
        );
        assert_eq!(classify_429_lockout("slow down"), Duration::from_secs(60));
    }

    #[test]
    fn tiered_ladder() {
        assert_eq!(tiered_quota_lockout(0), Duration::from_secs(60));
        assert_eq!(tiered_quota_lockout(1), Duration::from_secs(60));
        assert_eq!(tiered_quota_lockout(2), Duration::from_secs(300));
        assert_eq!(tiered_quota_lockout(3), Duration::from_secs(1800));
        assert_eq!(tiered_quota_lockout(9), Duration::from_secs(7200));
    }
}
