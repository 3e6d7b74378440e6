use http::StatusCode;
use polygate_pool::PoolError;
use polygate_protocol::error::WireError;
use polygate_translate::TranslateError;
use polygate_upstream::AdapterError;

/// Terminal request failure, ready to serialise as the shared wire error
/// shape with a matching HTTP status.
#[derive(Debug, Clone)]
pub struct GatewayError {
    pub status: StatusCode,
    pub body: WireError,
}

impl GatewayError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            body: WireError::invalid_request(message),
        }
    }

    pub fn unauthorized() -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            body: WireError::authentication("invalid api key"),
        }
    }

    pub fn no_healthy_provider() -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            body: WireError::no_healthy_provider(),
        }
    }
}

impl From<TranslateError> for GatewayError {
    fn from(err: TranslateError) -> Self {
        Self::bad_request(err.to_string())
    }
}

impl From<PoolError> for GatewayError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::NoHealthyCredential(_) => Self::no_healthy_provider(),
            PoolError::NotFound(_) => Self::no_healthy_provider(),
        }
    }
}

impl From<AdapterError> for GatewayError {
    fn from(err: AdapterError) -> Self {
        let status = match err.status {
            // Upstream quota pressure surfaces as 429 once retries are spent.
            Some(StatusCode::TOO_MANY_REQUESTS) => StatusCode::TOO_MANY_REQUESTS,
            Some(status) if status.is_client_error() => StatusCode::BAD_REQUEST,
            Some(status) => status,
            None => StatusCode::BAD_GATEWAY,
        };
        let body = if status == StatusCode::TOO_MANY_REQUESTS {
            WireError::rate_limited(err.message)
        } else {
            WireError::upstream(err.message)
        };
        Self { status, body }
    }
}

impl std::fmt::Display for GatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.status, self.body.error.message)
    }
}

impl std::error::Error for GatewayError {}
