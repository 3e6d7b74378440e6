use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

pub type CredentialId = Uuid;

/// Family of upstream this credential belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    OpenaiCompat,
    AnthropicApi,
    GeminiApi,
    Webchat,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 4] = [
        ProviderKind::OpenaiCompat,
        ProviderKind::AnthropicApi,
        ProviderKind::GeminiApi,
        ProviderKind::Webchat,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ProviderKind::OpenaiCompat => "openai_compat",
            ProviderKind::AnthropicApi => "anthropic_api",
            ProviderKind::GeminiApi => "gemini_api",
            ProviderKind::Webchat => "webchat",
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "openai_compat" => Ok(ProviderKind::OpenaiCompat),
            "anthropic_api" => Ok(ProviderKind::AnthropicApi),
            "gemini_api" => Ok(ProviderKind::GeminiApi),
            "webchat" => Ok(ProviderKind::Webchat),
            other => Err(format!("unknown provider kind {other:?}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SecretMaterial {
    ApiKey {
        api_key: String,
    },
    Oauth {
        access_token: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        refresh_token: Option<String>,
        /// Unix millis; absent for tokens that never expire.
        #[serde(skip_serializing_if = "Option::is_none")]
        expires_at: Option<i64>,
    },
    /// Web-chat cookie pair.
    Cookie {
        session_token: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        cf_clearance: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Degraded,
    Quarantined {
        /// Unix millis when the cooldown ends.
        until: i64,
    },
}

impl HealthState {
    pub fn is_quarantined(&self, now_ms: i64) -> bool {
        matches!(self, HealthState::Quarantined { until } if *until > now_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub uuid: CredentialId,
    pub secret: SecretMaterial,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_name: Option<String>,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default = "default_health")]
    pub health: HealthState,
    #[serde(default)]
    pub error_count: u32,
    #[serde(default)]
    pub quarantine_streak: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<i64>,
    /// Advisory only, refreshed by the background sweep.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage_snapshot: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage_snapshot_at: Option<i64>,
    /// Declared supported-model set; absent means "any model".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub models: Option<Vec<String>>,
    #[serde(default = "default_concurrency")]
    pub max_concurrency: u32,
}

fn default_health() -> HealthState {
    HealthState::Healthy
}

fn default_concurrency() -> u32 {
    8
}

impl Credential {
    pub fn new(secret: SecretMaterial) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            secret,
            custom_name: None,
            disabled: false,
            health: HealthState::Healthy,
            error_count: 0,
            quarantine_streak: 0,
            last_error_at: None,
            last_error: None,
            last_used_at: None,
            usage_snapshot: None,
            usage_snapshot_at: None,
            models: None,
            max_concurrency: default_concurrency(),
        }
    }

    pub fn token_expiry_ms(&self) -> Option<i64> {
        match &self.secret {
            SecretMaterial::Oauth { expires_at, .. } => *expires_at,
            _ => None,
        }
    }

    pub fn refresh_token(&self) -> Option<&str> {
        match &self.secret {
            SecretMaterial::Oauth { refresh_token, .. } => refresh_token.as_deref(),
            _ => None,
        }
    }

    pub fn supports_model(&self, model: &str) -> bool {
        match &self.models {
            Some(models) => models.iter().any(|candidate| candidate == model),
            None => true,
        }
    }

    /// Eligibility rule: enabled, out of quarantine, and (if the secret
    /// expires) not already expired modulo the configured skew.
    pub fn is_eligible(&self, now_ms: i64, expiry_skew_ms: i64) -> bool {
        if self.disabled || self.health.is_quarantined(now_ms) {
            return false;
        }
        match self.token_expiry_ms() {
            Some(expires_at) => expires_at > now_ms - expiry_skew_ms,
            None => true,
        }
    }
}

pub fn now_ms() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}
