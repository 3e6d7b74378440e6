use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::credential::{now_ms, Credential, CredentialId, ProviderKind, SecretMaterial};
use crate::pool::CredentialPool;

#[derive(Debug, Clone, Error)]
pub enum RefreshError {
    #[error("credential has no refresh token")]
    NoRefreshToken,
    #[error("refresh rejected by provider: {0}")]
    Rejected(String),
    #[error("refresh transport error: {0}")]
    Transport(String),
}

/// Provider-specific token exchange, implemented by the upstream adapters.
#[async_trait]
pub trait TokenExchanger: Send + Sync {
    async fn exchange(
        &self,
        provider: ProviderKind,
        credential: &Credential,
    ) -> Result<SecretMaterial, RefreshError>;
}

#[derive(Debug, Clone)]
pub struct RefreshConfig {
    /// A token inside this window counts as near expiry.
    pub near_expiry: Duration,
    /// Freshness window for credentials whose "expiry" is really the age of
    /// their usage snapshot.
    pub snapshot_window: Duration,
    /// Scheduler period.
    pub tick: Duration,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            near_expiry: Duration::from_secs(300),
            snapshot_window: Duration::from_secs(1800),
            tick: Duration::from_secs(900),
        }
    }
}

/// Background OAuth refresher with per-credential single flight: concurrent
/// callers for the same uuid serialise on a shared entry and the late ones
/// find the work already done.
pub struct TokenRefresher {
    pool: Arc<CredentialPool>,
    exchanger: Arc<dyn TokenExchanger>,
    config: RefreshConfig,
    inflight: tokio::sync::Mutex<HashMap<CredentialId, Arc<tokio::sync::Mutex<()>>>>,
}

impl TokenRefresher {
    pub fn new(
        pool: Arc<CredentialPool>,
        exchanger: Arc<dyn TokenExchanger>,
        config: RefreshConfig,
    ) -> Self {
        Self {
            pool,
            exchanger,
            config,
            inflight: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn is_expiry_near(&self, credential: &Credential) -> bool {
        let now = now_ms();
        match credential.token_expiry_ms() {
            Some(expires_at) => now + self.config.near_expiry.as_millis() as i64 >= expires_at,
            None => match credential.usage_snapshot_at {
                Some(at) => now - at >= self.config.snapshot_window.as_millis() as i64,
                None => false,
            },
        }
    }

    /// Refresh if the token is near expiry. Joins an in-flight refresh for
    /// the same credential instead of issuing a duplicate.
    pub async fn refresh(
        &self,
        provider: ProviderKind,
        uuid: CredentialId,
    ) -> Result<(), RefreshError> {
        self.refresh_inner(provider, uuid, false).await
    }

    /// Refresh unconditionally (still single-flight).
    pub async fn force_refresh(
        &self,
        provider: ProviderKind,
        uuid: CredentialId,
    ) -> Result<(), RefreshError> {
        self.refresh_inner(provider, uuid, true).await
    }

    async fn refresh_inner(
        &self,
        provider: ProviderKind,
        uuid: CredentialId,
        force: bool,
    ) -> Result<(), RefreshError> {
        let flight = {
            let mut guard = self.inflight.lock().await;
            guard
                .entry(uuid)
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        let _serialised = flight.lock().await;

        // Re-read after winning the flight lock: a joiner arrives here after
        // the leader already swapped the secret in.
        let Some(credential) = self.pool.get(provider, uuid).await else {
            return Err(RefreshError::Rejected("credential removed".to_string()));
        };
        if !force && !self.is_expiry_near(&credential) {
            debug!(event = "refresh_joined", uuid = %uuid);
            return Ok(());
        }

        match self.exchanger.exchange(provider, &credential).await {
            Ok(secret) => {
                self.pool
                    .update_secret(provider, uuid, secret)
                    .await
                    .map_err(|err| RefreshError::Rejected(err.to_string()))?;
                info!(event = "token_refreshed", uuid = %uuid, provider = %provider);
                Ok(())
            }
            Err(err) => {
                warn!(event = "token_refresh_failed", uuid = %uuid, provider = %provider, error = %err);
                self.pool
                    .record_refresh_failure(provider, uuid, &err.to_string())
                    .await;
                Err(err)
            }
        }
    }

    /// Scheduler loop: every tick, walk each provider serially and refresh
    /// its near-expiry credentials one at a time to avoid refresh storms.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.sweep_once().await;
        }
    }

    pub async fn sweep_once(&self) {
        for provider in ProviderKind::ALL {
            for credential in self.pool.snapshot(provider).await {
                if credential.disabled || !self.is_expiry_near(&credential) {
                    continue;
                }
                if credential.refresh_token().is_none()
                    && credential.token_expiry_ms().is_some()
                {
                    continue;
                }
                let _ = self.refresh(provider, credential.uuid).await;
            }
        }
    }
}
