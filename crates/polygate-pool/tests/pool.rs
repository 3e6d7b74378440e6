use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use polygate_pool::{
    credential::now_ms, Credential, CredentialPool, FallbackRule, HealthState, PoolConfig,
    PoolError, ProviderKind, RefreshConfig, RefreshError, SecretMaterial, SelectOptions,
    TokenExchanger, TokenRefresher,
};

fn api_key_credential(key: &str) -> Credential {
    Credential::new(SecretMaterial::ApiKey {
        api_key: key.to_string(),
    })
}

fn pool_with(provider: ProviderKind, credentials: Vec<Credential>) -> CredentialPool {
    let mut map = HashMap::new();
    map.insert(provider, credentials);
    CredentialPool::from_credentials(PoolConfig::default(), map)
}

#[tokio::test]
async fn selection_prefers_least_recently_used() {
    let mut first = api_key_credential("a");
    first.last_used_at = Some(now_ms());
    let second = api_key_credential("b");
    let second_id = second.uuid;

    let pool = pool_with(ProviderKind::AnthropicApi, vec![first, second]);
    let picked = pool
        .select(ProviderKind::AnthropicApi, None, SelectOptions::default())
        .await
        .expect("selection");
    assert_eq!(picked.credential.uuid, second_id);
    assert!(!picked.is_fallback);
}

#[tokio::test]
async fn skip_usage_count_leaves_last_used_untouched() {
    let credential = api_key_credential("a");
    let id = credential.uuid;
    let pool = pool_with(ProviderKind::AnthropicApi, vec![credential]);

    pool.select(
        ProviderKind::AnthropicApi,
        None,
        SelectOptions {
            skip_usage_count: true,
            acquire_slot: false,
        },
    )
    .await
    .expect("selection");
    let snapshot = pool.get(ProviderKind::AnthropicApi, id).await.unwrap();
    assert!(snapshot.last_used_at.is_none());
}

#[tokio::test]
async fn slot_capacity_one_is_never_double_booked() {
    let mut credential = api_key_credential("a");
    credential.max_concurrency = 1;
    let pool = Arc::new(pool_with(ProviderKind::OpenaiCompat, vec![credential]));

    let options = SelectOptions {
        skip_usage_count: false,
        acquire_slot: true,
    };
    let first = pool
        .select(ProviderKind::OpenaiCompat, None, options)
        .await
        .expect("first acquire");

    // While the slot is held, concurrent selection must not hand the same
    // credential out again.
    let second = pool.select(ProviderKind::OpenaiCompat, None, options).await;
    assert!(matches!(second, Err(PoolError::NoHealthyCredential(_))));

    // Dropping the guard releases the slot on every exit path.
    drop(first);
    pool.select(ProviderKind::OpenaiCompat, None, options)
        .await
        .expect("slot released");
}

#[tokio::test]
async fn concurrent_selection_is_serialised() {
    let credentials: Vec<Credential> = (0..4).map(|i| api_key_credential(&format!("k{i}"))).collect();
    let pool = Arc::new(pool_with(ProviderKind::GeminiApi, credentials));

    let mut handles = Vec::new();
    for _ in 0..32 {
        let pool = pool.clone();
        handles.push(tokio::spawn(async move {
            pool.select(ProviderKind::GeminiApi, None, SelectOptions::default())
                .await
                .expect("selection")
                .credential
                .uuid
        }));
    }
    for handle in handles {
        handle.await.expect("join");
    }

    // Every credential received traffic; last_used_at is set on all of them.
    for credential in pool.snapshot(ProviderKind::GeminiApi).await {
        assert!(credential.last_used_at.is_some());
    }
}

#[tokio::test]
async fn auth_failure_quarantines_immediately_and_recovers() {
    let mut config = PoolConfig::default();
    config.quarantine_base = Duration::from_millis(50);
    config.quarantine_cap = Duration::from_millis(50);
    let credential = api_key_credential("a");
    let id = credential.uuid;
    let mut map = HashMap::new();
    map.insert(ProviderKind::AnthropicApi, vec![credential]);
    let pool = CredentialPool::from_credentials(config, map);

    pool.mark_failure(ProviderKind::AnthropicApi, id, "401 unauthorized", true)
        .await;
    let snapshot = pool.get(ProviderKind::AnthropicApi, id).await.unwrap();
    assert!(matches!(snapshot.health, HealthState::Quarantined { .. }));
    assert!(matches!(
        pool.select(ProviderKind::AnthropicApi, None, SelectOptions::default())
            .await,
        Err(PoolError::NoHealthyCredential(_))
    ));

    tokio::time::sleep(Duration::from_millis(80)).await;
    let picked = pool
        .select(ProviderKind::AnthropicApi, None, SelectOptions::default())
        .await
        .expect("recovered after cooldown");
    assert_eq!(picked.credential.uuid, id);
}

#[tokio::test]
async fn error_threshold_quarantines_and_success_resets() {
    let credential = api_key_credential("a");
    let id = credential.uuid;
    let pool = pool_with(ProviderKind::OpenaiCompat, vec![credential]);

    pool.mark_failure(ProviderKind::OpenaiCompat, id, "timeout", false)
        .await;
    pool.mark_failure(ProviderKind::OpenaiCompat, id, "timeout", false)
        .await;
    let snapshot = pool.get(ProviderKind::OpenaiCompat, id).await.unwrap();
    assert_eq!(snapshot.error_count, 2);
    assert!(matches!(snapshot.health, HealthState::Degraded));

    pool.mark_success(ProviderKind::OpenaiCompat, id).await;
    let snapshot = pool.get(ProviderKind::OpenaiCompat, id).await.unwrap();
    assert_eq!(snapshot.error_count, 0);
    assert!(snapshot.last_error.is_none());
    assert!(matches!(snapshot.health, HealthState::Healthy));

    // Third strike after reset starts counting from zero again.
    pool.mark_failure(ProviderKind::OpenaiCompat, id, "timeout", false)
        .await;
    let snapshot = pool.get(ProviderKind::OpenaiCompat, id).await.unwrap();
    assert_eq!(snapshot.error_count, 1);
}

#[tokio::test]
async fn empty_pool_walks_fallback_chain() {
    let fallback_cred = api_key_credential("backup");
    let fallback_id = fallback_cred.uuid;

    let mut config = PoolConfig::default();
    config.fallback_chains.insert(
        ProviderKind::Webchat,
        vec![FallbackRule {
            provider: ProviderKind::AnthropicApi,
            model_rewrite: Some("claude-sonnet".to_string()),
        }],
    );
    let mut map = HashMap::new();
    map.insert(ProviderKind::Webchat, Vec::new());
    map.insert(ProviderKind::AnthropicApi, vec![fallback_cred]);
    let pool = CredentialPool::from_credentials(config, map);

    let picked = pool
        .select(
            ProviderKind::Webchat,
            Some("grok-4"),
            SelectOptions::default(),
        )
        .await
        .expect("fallback");
    assert!(picked.is_fallback);
    assert_eq!(picked.provider, ProviderKind::AnthropicApi);
    assert_eq!(picked.model.as_deref(), Some("claude-sonnet"));
    assert_eq!(picked.credential.uuid, fallback_id);
}

struct CountingExchanger {
    calls: AtomicU32,
    delay: Duration,
}

#[async_trait]
impl TokenExchanger for CountingExchanger {
    async fn exchange(
        &self,
        _provider: ProviderKind,
        _credential: &Credential,
    ) -> Result<SecretMaterial, RefreshError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(SecretMaterial::Oauth {
            access_token: "fresh".to_string(),
            refresh_token: Some("rt".to_string()),
            expires_at: Some(now_ms() + 3_600_000),
        })
    }
}

#[tokio::test]
async fn refresh_is_single_flight_per_credential() {
    let credential = Credential::new(SecretMaterial::Oauth {
        access_token: "stale".to_string(),
        refresh_token: Some("rt".to_string()),
        expires_at: Some(now_ms() + 1_000),
    });
    let id = credential.uuid;
    let pool = Arc::new(pool_with(ProviderKind::AnthropicApi, vec![credential]));
    let exchanger = Arc::new(CountingExchanger {
        calls: AtomicU32::new(0),
        delay: Duration::from_millis(50),
    });
    let refresher = Arc::new(TokenRefresher::new(
        pool.clone(),
        exchanger.clone(),
        RefreshConfig::default(),
    ));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let refresher = refresher.clone();
        handles.push(tokio::spawn(async move {
            refresher.refresh(ProviderKind::AnthropicApi, id).await
        }));
    }
    for handle in handles {
        handle.await.expect("join").expect("refresh");
    }

    // One caller did the exchange; the other seven joined it.
    assert_eq!(exchanger.calls.load(Ordering::SeqCst), 1);
    let snapshot = pool.get(ProviderKind::AnthropicApi, id).await.unwrap();
    assert!(matches!(
        snapshot.secret,
        SecretMaterial::Oauth { ref access_token, .. } if access_token == "fresh"
    ));
}

struct FailingExchanger;

#[async_trait]
impl TokenExchanger for FailingExchanger {
    async fn exchange(
        &self,
        _provider: ProviderKind,
        _credential: &Credential,
    ) -> Result<SecretMaterial, RefreshError> {
        Err(RefreshError::Rejected("bad refresh token".to_string()))
    }
}

#[tokio::test]
async fn refresh_failure_counts_errors_without_quarantine() {
    let credential = Credential::new(SecretMaterial::Oauth {
        access_token: "stale".to_string(),
        refresh_token: Some("rt".to_string()),
        expires_at: Some(now_ms() - 1),
    });
    let id = credential.uuid;
    let pool = Arc::new(pool_with(ProviderKind::OpenaiCompat, vec![credential]));
    let refresher = TokenRefresher::new(
        pool.clone(),
        Arc::new(FailingExchanger),
        RefreshConfig::default(),
    );

    assert!(refresher
        .force_refresh(ProviderKind::OpenaiCompat, id)
        .await
        .is_err());
    let snapshot = pool.get(ProviderKind::OpenaiCompat, id).await.unwrap();
    assert_eq!(snapshot.error_count, 1);
    assert!(matches!(snapshot.health, HealthState::Healthy));
}
