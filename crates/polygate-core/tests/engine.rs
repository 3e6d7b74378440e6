use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use http::StatusCode;
use polygate_core::{ApiKeyAuth, AppState, Engine, EngineReply, ModelRouter};
use polygate_pool::{
    Credential, CredentialPool, CredentialStore, HealthState, PoolConfig, ProviderKind,
    RefreshConfig, SecretMaterial, TokenRefresher,
};
use polygate_translate::unified::{
    FinishReason, Role, UnifiedDelta, UnifiedMessage, UnifiedRequest, UnifiedResponse,
};
use polygate_translate::Dialect;
use polygate_upstream::{
    Adapter, AdapterError, AdapterRegistry, DeltaStream, ModelEntry, RegistryExchanger,
};

/// Scripted upstream: fails with an auth error for the credentials named in
/// `bad_keys`, succeeds otherwise.
struct ScriptedAdapter {
    provider: ProviderKind,
    bad_keys: Vec<String>,
    calls: Arc<AtomicU32>,
    partial_stream: bool,
}

impl ScriptedAdapter {
    fn key_of(credential: &Credential) -> String {
        match &credential.secret {
            SecretMaterial::ApiKey { api_key } => api_key.clone(),
            _ => String::new(),
        }
    }
}

#[async_trait]
impl Adapter for ScriptedAdapter {
    fn provider(&self) -> ProviderKind {
        self.provider
    }

    async fn generate(
        &self,
        credential: &Credential,
        model: &str,
        _request: &UnifiedRequest,
    ) -> Result<UnifiedResponse, AdapterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.bad_keys.contains(&Self::key_of(credential)) {
            return Err(AdapterError::from_status(
                StatusCode::UNAUTHORIZED,
                "token invalid",
            ));
        }
        Ok(UnifiedResponse {
            id: "resp-1".to_string(),
            model: model.to_string(),
            message: UnifiedMessage::text(Role::Assistant, "ok"),
            finish_reason: FinishReason::Stop,
            usage: Default::default(),
        })
    }

    async fn generate_stream(
        &self,
        credential: &Credential,
        _model: &str,
        _request: &UnifiedRequest,
    ) -> Result<DeltaStream, AdapterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.bad_keys.contains(&Self::key_of(credential)) {
            return Err(AdapterError::from_status(
                StatusCode::UNAUTHORIZED,
                "token invalid",
            ));
        }
        let items: Vec<Result<UnifiedDelta, AdapterError>> = if self.partial_stream {
            vec![
                Ok(UnifiedDelta::content("partial")),
                Err(AdapterError::network("connection reset mid-stream")),
            ]
        } else {
            vec![
                Ok(UnifiedDelta::content("hello")),
                Ok(UnifiedDelta::finish(FinishReason::Stop)),
            ]
        };
        Ok(Box::pin(futures_util::stream::iter(items)))
    }

    async fn list_models(
        &self,
        _credential: &Credential,
    ) -> Result<Vec<ModelEntry>, AdapterError> {
        Ok(Vec::new())
    }
}

fn credential(key: &str) -> Credential {
    Credential::new(SecretMaterial::ApiKey {
        api_key: key.to_string(),
    })
}

fn engine_with(adapter: ScriptedAdapter, credentials: Vec<Credential>) -> (Engine, Arc<CredentialPool>) {
    let provider = adapter.provider;
    let mut map = HashMap::new();
    map.insert(provider, credentials);
    let pool = Arc::new(CredentialPool::from_credentials(PoolConfig::default(), map));

    let mut registry = AdapterRegistry::new();
    registry.register(Arc::new(adapter));
    let registry = Arc::new(registry);

    let refresher = Arc::new(TokenRefresher::new(
        pool.clone(),
        Arc::new(RegistryExchanger::new(registry.clone())),
        RefreshConfig::default(),
    ));

    let state = Arc::new(AppState {
        auth: ApiKeyAuth::new("gateway-key"),
        pool: pool.clone(),
        adapters: registry,
        refresher,
        router: ModelRouter::default(),
        counter: Arc::new(polygate_cache::HeuristicCounter),
        accountant: None,
        credential_store: Arc::new(CredentialStore::new(
            std::env::temp_dir().join("polygate-engine-test.json"),
        )),
        usage_cache: Arc::new(polygate_pool::UsageCacheFile::new(
            std::env::temp_dir().join("polygate-engine-usage.json"),
        )),
        max_attempts: 3,
    });
    (Engine::new(state), pool)
}

fn request(model: &str, stream: bool) -> UnifiedRequest {
    let mut req = UnifiedRequest::new(model);
    req.stream = stream;
    req.messages.push(UnifiedMessage::text(Role::User, "hi"));
    req
}

#[tokio::test]
async fn auth_failure_fails_over_to_next_credential() {
    // c1 is ordered first (never used); its auth failure must quarantine it
    // and the retry must land on c2.
    let c1 = credential("bad");
    let c2 = credential("good");
    let c1_id = c1.uuid;
    let c2_id = c2.uuid;
    let adapter = ScriptedAdapter {
        provider: ProviderKind::OpenaiCompat,
        bad_keys: vec!["bad".to_string()],
        calls: Arc::new(AtomicU32::new(0)),
        partial_stream: false,
    };
    let (engine, pool) = engine_with(adapter, vec![c1, c2]);

    let reply = engine
        .execute(request("gpt-test", false), Dialect::OpenAi)
        .await
        .expect("failover succeeds");
    match reply {
        EngineReply::Completion(response) => assert_eq!(response.id, "resp-1"),
        EngineReply::Stream(_) => panic!("expected completion"),
    }

    let bad = pool.get(ProviderKind::OpenaiCompat, c1_id).await.unwrap();
    assert!(matches!(bad.health, HealthState::Quarantined { .. }));
    let good = pool.get(ProviderKind::OpenaiCompat, c2_id).await.unwrap();
    assert_eq!(good.error_count, 0);
    assert!(good.last_used_at.is_some());
}

#[tokio::test]
async fn exhausted_pool_returns_no_healthy_provider() {
    let adapter = ScriptedAdapter {
        provider: ProviderKind::OpenaiCompat,
        bad_keys: vec!["only".to_string()],
        calls: Arc::new(AtomicU32::new(0)),
        partial_stream: false,
    };
    let (engine, _pool) = engine_with(adapter, vec![credential("only")]);

    let err = engine
        .execute(request("gpt-test", false), Dialect::OpenAi)
        .await
        .err()
        .expect("must fail");
    // The only credential is quarantined on attempt 1; attempt 2 finds an
    // empty pool and the last upstream auth error surfaces.
    assert_eq!(err.status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn partially_delivered_stream_is_never_retried() {
    let c1 = credential("good");
    let c1_id = c1.uuid;
    let calls = Arc::new(AtomicU32::new(0));
    let adapter = ScriptedAdapter {
        provider: ProviderKind::OpenaiCompat,
        bad_keys: Vec::new(),
        calls: calls.clone(),
        partial_stream: true,
    };
    let (engine, pool) = engine_with(adapter, vec![c1]);

    let reply = engine
        .execute(request("gpt-test", true), Dialect::OpenAi)
        .await
        .expect("stream opens");
    let EngineReply::Stream(mut stream) = reply else {
        panic!("expected stream");
    };

    let first = stream.next().await.unwrap().expect("first delta");
    assert_eq!(first.content.as_deref(), Some("partial"));
    let second = stream.next().await.unwrap();
    assert!(second.is_err());
    assert!(stream.next().await.is_none());

    // One upstream call: the partial stream was not retried, and the
    // credential's error counter moved.
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let snapshot = pool.get(ProviderKind::OpenaiCompat, c1_id).await.unwrap();
    assert_eq!(snapshot.error_count, 1);
}

#[tokio::test]
async fn successful_stream_marks_credential_healthy() {
    let c1 = credential("good");
    let c1_id = c1.uuid;
    let adapter = ScriptedAdapter {
        provider: ProviderKind::OpenaiCompat,
        bad_keys: Vec::new(),
        calls: Arc::new(AtomicU32::new(0)),
        partial_stream: false,
    };
    let (engine, pool) = engine_with(adapter, vec![c1]);

    let EngineReply::Stream(mut stream) = engine
        .execute(request("gpt-test", true), Dialect::OpenAi)
        .await
        .expect("stream opens")
    else {
        panic!("expected stream");
    };
    let mut reasons = Vec::new();
    while let Some(item) = stream.next().await {
        if let Ok(delta) = item {
            if let Some(reason) = delta.finish_reason {
                reasons.push(reason);
            }
        }
    }
    assert_eq!(reasons, vec![FinishReason::Stop]);

    let snapshot = pool.get(ProviderKind::OpenaiCompat, c1_id).await.unwrap();
    assert_eq!(snapshot.error_count, 0);
    assert!(matches!(snapshot.health, HealthState::Healthy));
}

#[tokio::test]
async fn cancelled_stream_releases_slot_without_health_damage() {
    let mut c1 = credential("good");
    c1.max_concurrency = 1;
    let c1_id = c1.uuid;
    let adapter = ScriptedAdapter {
        provider: ProviderKind::OpenaiCompat,
        bad_keys: Vec::new(),
        calls: Arc::new(AtomicU32::new(0)),
        partial_stream: false,
    };
    let (engine, pool) = engine_with(adapter, vec![c1]);

    let reply = engine
        .execute(request("gpt-test", true), Dialect::OpenAi)
        .await
        .expect("stream opens");
    // Client disconnects: the stream is dropped before being read.
    drop(reply);
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let snapshot = pool.get(ProviderKind::OpenaiCompat, c1_id).await.unwrap();
    assert_eq!(snapshot.error_count, 0);
    assert!(matches!(snapshot.health, HealthState::Healthy));

    // The slot came back: a second request can acquire it.
    engine
        .execute(request("gpt-test", true), Dialect::OpenAi)
        .await
        .expect("slot was released");
}
