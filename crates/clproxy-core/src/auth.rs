use http::HeaderMap;

use crate::error::ProxyError;

/// Checks an inbound request against `ANTHROPIC_API_KEY` (spec §6).
///
/// When `expected_key` is `None`, auth is disabled and every request passes.
/// Otherwise the presented key - from `x-api-key` or `Authorization: Bearer`
/// - must match exactly.
pub fn authenticate(expected_key: Option<&str>, headers: &HeaderMap) -> Result<(), ProxyError> {
    let Some(expected) = expected_key else {
        return Ok(());
    };

    match extract_api_key(headers) {
        Some(presented) if presented == expected => Ok(()),
        _ => Err(ProxyError::auth("invalid or missing api key")),
    }
}

pub fn extract_api_key(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = header_value(headers, "x-api-key") {
        return Some(value);
    }

    let auth = header_value(headers, "authorization")?;
    let auth = auth.trim();
    auth.strip_prefix("Bearer ")
        .or_else(|| auth.strip_prefix("bearer "))
        .map(|token| token.trim().to_string())
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers_with(name: &str, value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            http::HeaderName::from_bytes(name.as_bytes()).unwrap(),
            http::HeaderValue::from_str(value).unwrap(),
        );
        headers
    }

    #[test]
    fn disabled_when_no_expected_key() {
        assert!(authenticate(None, &HeaderMap::new()).is_ok());
    }

    #[test]
    fn accepts_matching_x_api_key() {
        let headers = headers_with("x-api-key", "secret");
        assert!(authenticate(Some("secret"), &headers).is_ok());
    }

    #[test]
    fn accepts_matching_bearer_token() {
        let headers = headers_with("authorization", "Bearer secret");
        assert!(authenticate(Some("secret"), &headers).is_ok());
    }

    #[test]
    fn rejects_mismatched_key() {
        let headers = headers_with("x-api-key", "wrong");
        assert!(authenticate(Some("secret"), &headers).is_err());
    }

    #[test]
    fn rejects_missing_key() {
        assert!(authenticate(Some("secret"), &HeaderMap::new()).is_err());
    }
}
