pub mod anthropic;
pub mod gemini;
pub mod openai;
pub mod unified;

use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;

/// One of the wire formats the gateway speaks with clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dialect {
    OpenAi,
    Anthropic,
    Gemini,
}

impl Dialect {
    pub fn as_str(self) -> &'static str {
        match self {
            Dialect::OpenAi => "openai",
            Dialect::Anthropic => "anthropic",
            Dialect::Gemini => "gemini",
        }
    }
}

impl std::fmt::Display for Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error)]
pub enum TranslateError {
    #[error("invalid request: {0}")]
    Invalid(String),
    #[error("not representable in target dialect: {0}")]
    Unrepresentable(String),
}

/// Non-fatal note about content that could not be carried into the target
/// dialect. Surfaced to the caller as a comment on the stream and a log line,
/// never silently discarded.
#[derive(Debug, Clone, PartialEq)]
pub struct DropWarning(pub String);

pub(crate) fn now_epoch_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs() as i64)
        .unwrap_or_default()
}
