use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use polygate_cache::{
    CacheAccountant, HeuristicCounter, HfTokenizerCounter, KvStore, RedisStore, TokenCounter,
};
use polygate_core::{ApiKeyAuth, AppState, Engine, ModelRouter};
use polygate_pool::{
    CredentialPool, CredentialStore, FallbackRule, PoolConfig, ProviderKind, RefreshConfig,
    TokenRefresher, UsageCacheFile,
};
use polygate_upstream::direct::{
    AnthropicApiAdapter, DirectConfig, GeminiApiAdapter, OpenaiCompatAdapter,
};
use polygate_upstream::webchat::{WebchatAdapter, WebchatConfig};
use polygate_upstream::{AdapterRegistry, RegistryExchanger};
use tracing::info;

#[derive(Debug, Clone, Parser)]
#[command(name = "polygate", version, about = "Multi-dialect AI inference gateway")]
pub struct CliArgs {
    /// Bind host.
    #[arg(long, env = "POLYGATE_HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// Bind port.
    #[arg(long, env = "POLYGATE_PORT", default_value_t = 8084)]
    pub port: u16,

    /// Shared API key clients must present.
    #[arg(long, env = "POLYGATE_API_KEY")]
    pub api_key: Option<String>,

    /// Data directory for credentials and caches.
    #[arg(long, env = "POLYGATE_DATA_DIR", default_value = "./data")]
    pub data_dir: PathBuf,

    /// Redis URL for prefix-cache accounting (optional).
    #[arg(long, env = "POLYGATE_REDIS_URL")]
    pub redis_url: Option<String>,

    /// Optional tokenizer.json for exact token counting.
    #[arg(long, env = "POLYGATE_TOKENIZER")]
    pub tokenizer: Option<PathBuf>,

    /// Outbound proxy for upstream requests.
    #[arg(long, env = "POLYGATE_PROXY")]
    pub proxy: Option<String>,

    /// Retry budget per request.
    #[arg(long, env = "POLYGATE_MAX_ATTEMPTS", default_value_t = 3)]
    pub max_attempts: u32,
}

pub struct Bootstrap {
    pub engine: Arc<Engine>,
    pub bind: String,
}

pub async fn bootstrap() -> anyhow::Result<Bootstrap> {
    let args = CliArgs::parse();

    let api_key = match args.api_key.clone() {
        Some(key) => key,
        None => {
            let key = uuid::Uuid::new_v4().to_string();
            eprintln!("generated gateway api key: {key}");
            key
        }
    };

    let credential_store = Arc::new(CredentialStore::new(args.data_dir.join("credentials.json")));
    let credentials = credential_store
        .load()
        .await
        .context("load credentials.json")?;
    let mut counts: Vec<String> = Vec::new();
    for (kind, list) in &credentials {
        counts.push(format!("{kind}={}", list.len()));
    }
    info!(event = "credentials_loaded", pools = %counts.join(","));

    let pool = Arc::new(CredentialPool::from_credentials(
        pool_config(),
        credentials,
    ));

    let mut registry = AdapterRegistry::new();
    let proxy = args.proxy.clone();
    registry.register(Arc::new(OpenaiCompatAdapter::new(direct_config(
        "https://api.openai.com/v1",
        &proxy,
        None,
    ))));
    registry.register(Arc::new(AnthropicApiAdapter::new(direct_config(
        "https://api.anthropic.com",
        &proxy,
        Some((
            "https://console.anthropic.com/v1/oauth/token",
            "9d1c250a-e61b-44d9-88ed-5944d1962f5e",
        )),
    ))));
    registry.register(Arc::new(GeminiApiAdapter::new(direct_config(
        "https://generativelanguage.googleapis.com",
        &proxy,
        Some((
            "https://oauth2.googleapis.com/token",
            "681255809395-oo8ft2oprdrnp9e3aqf6av3hmdib135j.apps.googleusercontent.com",
        )),
    ))));
    let mut webchat = WebchatConfig::new("https://grok.com/rest/app-chat", "https://assets.grok.com");
    webchat.outbound_proxy = proxy.clone();
    registry.register(Arc::new(WebchatAdapter::new(webchat)));
    let registry = Arc::new(registry);

    let refresher = Arc::new(TokenRefresher::new(
        pool.clone(),
        Arc::new(RegistryExchanger::new(registry.clone())),
        RefreshConfig::default(),
    ));

    let counter: Arc<dyn TokenCounter> = match args
        .tokenizer
        .as_ref()
        .and_then(|path| HfTokenizerCounter::from_file(path))
    {
        Some(counter) => Arc::new(counter),
        None => Arc::new(HeuristicCounter),
    };

    let accountant = match args.redis_url.as_deref() {
        Some(url) => {
            let store: Arc<dyn KvStore> =
                Arc::new(RedisStore::new(url).context("open redis client")?);
            Some(Arc::new(CacheAccountant::new(store)))
        }
        None => None,
    };

    let state = Arc::new(AppState {
        auth: ApiKeyAuth::new(api_key),
        pool,
        adapters: registry,
        refresher: refresher.clone(),
        router: ModelRouter::default(),
        counter,
        accountant,
        credential_store,
        usage_cache: Arc::new(UsageCacheFile::new(args.data_dir.join("usage.json"))),
        max_attempts: args.max_attempts.max(1),
    });

    Ok(Bootstrap {
        engine: Arc::new(Engine::new(state)),
        bind: format!("{}:{}", args.host, args.port),
    })
}

fn pool_config() -> PoolConfig {
    let mut config = PoolConfig::default();
    // Web-chat quota exhaustion drains into the public Anthropic pool.
    config.fallback_chains.insert(
        ProviderKind::Webchat,
        vec![FallbackRule {
            provider: ProviderKind::AnthropicApi,
            model_rewrite: Some("claude-sonnet-4-5".to_string()),
        }],
    );
    config
}

fn direct_config(
    base_url: &str,
    proxy: &Option<String>,
    oauth: Option<(&str, &str)>,
) -> DirectConfig {
    let mut config = DirectConfig::new(base_url);
    config.outbound_proxy = proxy.clone();
    if let Some((token_url, client_id)) = oauth {
        config.token_url = Some(token_url.to_string());
        config.client_id = Some(client_id.to_string());
    }
    config
}

/// Periodic background work: usage snapshot sweep, which also feeds
/// near-expiry credentials into the refresher.
pub fn spawn_background(engine: Arc<Engine>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(900));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            engine.sweep().await;
        }
    });
}
