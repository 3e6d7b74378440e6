use http::StatusCode;

/// Upstream failure, already classified for the ingress retry logic.
#[derive(Debug, Clone)]
pub struct AdapterError {
    pub message: String,
    pub status: Option<StatusCode>,
    /// Worth retrying from the start of the request.
    pub retryable: bool,
    /// The credential itself is bad (auth/quota); quarantine it and retry
    /// on a sibling.
    pub should_switch_credential: bool,
}

impl AdapterError {
    /// Classification table for upstream HTTP statuses.
    pub fn from_status(status: StatusCode, body: impl Into<String>) -> Self {
        let message = truncate(body.into(), 2048);
        match status.as_u16() {
            401 | 403 => Self {
                message,
                status: Some(status),
                retryable: true,
                should_switch_credential: true,
            },
            // Quota exhaustion is credential-scoped too: drain a sibling
            // before surfacing 429.
            429 => Self {
                message,
                status: Some(status),
                retryable: true,
                should_switch_credential: true,
            },
            408 | 425 => Self {
                message,
                status: Some(status),
                retryable: true,
                should_switch_credential: false,
            },
            code if code >= 500 => Self {
                message,
                status: Some(status),
                retryable: true,
                should_switch_credential: false,
            },
            // Remaining 4xx (invalid model, malformed input) are permanent.
            _ => Self {
                message,
                status: Some(status),
                retryable: false,
                should_switch_credential: false,
            },
        }
    }

    /// Connection resets, DNS failures, broken bodies.
    pub fn network(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
            retryable: true,
            should_switch_credential: false,
        }
    }

    pub fn timeout(what: &str) -> Self {
        Self {
            message: format!("{what} timed out"),
            status: Some(StatusCode::GATEWAY_TIMEOUT),
            retryable: true,
            should_switch_credential: false,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: Some(StatusCode::BAD_REQUEST),
            retryable: false,
            should_switch_credential: false,
        }
    }

    pub fn unsupported(what: &str) -> Self {
        Self {
            message: format!("{what} not supported by this provider"),
            status: Some(StatusCode::BAD_REQUEST),
            retryable: false,
            should_switch_credential: false,
        }
    }
}

impl std::fmt::Display for AdapterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status {
            Some(status) => write!(f, "upstream {status}: {}", self.message),
            None => write!(f, "upstream network error: {}", self.message),
        }
    }
}

impl std::error::Error for AdapterError {}

fn truncate(mut text: String, cap: usize) -> String {
    if text.len() > cap {
        let mut end = cap;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text.truncate(end);
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_statuses_switch_credentials() {
        for code in [401u16, 403, 429] {
            let err = AdapterError::from_status(StatusCode::from_u16(code).unwrap(), "no");
            assert!(err.should_switch_credential, "{code}");
            assert!(err.retryable, "{code}");
        }
    }

    #[test]
    fn server_errors_retry_without_switching() {
        for code in [500u16, 502, 503, 504, 408] {
            let err = AdapterError::from_status(StatusCode::from_u16(code).unwrap(), "boom");
            assert!(err.retryable, "{code}");
            assert!(!err.should_switch_credential, "{code}");
        }
    }

    #[test]
    fn client_errors_are_permanent() {
        for code in [400u16, 404, 422] {
            let err = AdapterError::from_status(StatusCode::from_u16(code).unwrap(), "bad");
            assert!(!err.retryable, "{code}");
        }
    }
}
