use std::sync::Arc;

use polygate_cache::{CacheAccountant, KvStore, TokenCounter};
use polygate_pool::{CredentialPool, CredentialStore, ProviderKind, TokenRefresher, UsageCacheFile};
use polygate_upstream::AdapterRegistry;

use crate::auth::ApiKeyAuth;

/// Routes a requested model name to the provider family that serves it.
#[derive(Debug, Clone)]
pub struct ModelRouter {
    rules: Vec<(String, ProviderKind)>,
    default_provider: ProviderKind,
}

impl Default for ModelRouter {
    fn default() -> Self {
        Self {
            rules: vec![
                ("claude".to_string(), ProviderKind::AnthropicApi),
                ("gemini".to_string(), ProviderKind::GeminiApi),
                ("grok".to_string(), ProviderKind::Webchat),
            ],
            default_provider: ProviderKind::OpenaiCompat,
        }
    }
}

impl ModelRouter {
    pub fn new(rules: Vec<(String, ProviderKind)>, default_provider: ProviderKind) -> Self {
        Self {
            rules,
            default_provider,
        }
    }

    pub fn route(&self, model: &str) -> ProviderKind {
        let lower = model.to_ascii_lowercase();
        for (prefix, provider) in &self.rules {
            if lower.starts_with(prefix.as_str()) {
                return *provider;
            }
        }
        self.default_provider
    }
}

/// Everything the request path needs, shared across handlers.
pub struct AppState {
    pub auth: ApiKeyAuth,
    pub pool: Arc<CredentialPool>,
    pub adapters: Arc<AdapterRegistry>,
    pub refresher: Arc<TokenRefresher>,
    pub router: ModelRouter,
    pub counter: Arc<dyn TokenCounter>,
    /// Absent when no key-value store is configured; accounting then reports
    /// everything as uncached.
    pub accountant: Option<Arc<CacheAccountant<dyn KvStore>>>,
    pub credential_store: Arc<CredentialStore>,
    pub usage_cache: Arc<UsageCacheFile>,
    pub max_attempts: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_prefixes_route_to_their_family() {
        let router = ModelRouter::default();
        assert_eq!(router.route("claude-sonnet-4-5"), ProviderKind::AnthropicApi);
        assert_eq!(router.route("gemini-2.5-pro"), ProviderKind::GeminiApi);
        assert_eq!(router.route("grok-4"), ProviderKind::Webchat);
        assert_eq!(router.route("gpt-4o"), ProviderKind::OpenaiCompat);
    }
}
