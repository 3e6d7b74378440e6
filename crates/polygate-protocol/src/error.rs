use http::StatusCode;
use serde::{Deserialize, Serialize};

/// Error body shape shared by every dialect endpoint:
/// `{"error":{"message":..., "type":..., "code":...}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireError {
    pub error: WireErrorDetail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireErrorDetail {
    pub message: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl WireError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: WireErrorDetail {
                message: message.into(),
                kind: kind.into(),
                code: None,
            },
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.error.code = Some(code.into());
        self
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new("invalid_request_error", message)
    }

    pub fn authentication(message: impl Into<String>) -> Self {
        Self::new("authentication_error", message)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new("rate_limit_error", message)
    }

    pub fn no_healthy_provider() -> Self {
        Self::new("no_healthy_provider", "no healthy credential for any provider in the chain")
    }

    pub fn upstream(message: impl Into<String>) -> Self {
        Self::new("upstream_error", message)
    }

    /// Default status for a given error kind, used when the upstream status
    /// was not preserved.
    pub fn status(&self) -> StatusCode {
        match self.error.kind.as_str() {
            "invalid_request_error" => StatusCode::BAD_REQUEST,
            "authentication_error" => StatusCode::UNAUTHORIZED,
            "rate_limit_error" => StatusCode::TOO_MANY_REQUESTS,
            "no_healthy_provider" => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::BAD_GATEWAY,
        }
    }
}
