use http::HeaderMap;
use subtle::ConstantTimeEq;

/// Shared-key gate in front of every dialect endpoint.
#[derive(Debug, Clone)]
pub struct ApiKeyAuth {
    api_key: String,
}

impl ApiKeyAuth {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
        }
    }

    pub fn authenticate(&self, headers: &HeaderMap) -> bool {
        let Some(presented) = extract_api_key(headers) else {
            return false;
        };
        constant_time_eq(&presented, &self.api_key)
    }
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

fn extract_api_key(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = header_str(headers, "x-api-key") {
        return Some(value);
    }
    if let Some(value) = header_str(headers, "x-goog-api-key") {
        return Some(value);
    }
    let auth = header_str(headers, "authorization")?;
    let auth = auth.trim();
    auth.strip_prefix("Bearer ")
        .or_else(|| auth.strip_prefix("bearer "))
        .map(|token| token.trim().to_string())
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn headers(name: &str, value: &str) -> HeaderMap {
        let mut map = HeaderMap::new();
        map.insert(
            name.parse::<http::HeaderName>().unwrap(),
            HeaderValue::from_str(value).unwrap(),
        );
        map
    }

    #[test]
    fn bearer_and_api_key_headers_are_accepted() {
        let auth = ApiKeyAuth::new("secret");
        assert!(auth.authenticate(&headers("authorization", "Bearer secret")));
        assert!(auth.authenticate(&headers("x-api-key", "secret")));
        assert!(auth.authenticate(&headers("x-goog-api-key", "secret")));
    }

    #[test]
    fn wrong_or_missing_keys_fail() {
        let auth = ApiKeyAuth::new("secret");
        assert!(!auth.authenticate(&headers("authorization", "Bearer nope")));
        assert!(!auth.authenticate(&headers("authorization", "secret")));
        assert!(!auth.authenticate(&HeaderMap::new()));
    }
}
