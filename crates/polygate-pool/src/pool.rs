use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{info, warn};

use crate::credential::{now_ms, Credential, CredentialId, HealthState, ProviderKind};

#[derive(Debug, Clone, Copy, Default)]
pub struct SelectOptions {
    /// Leave `last_used_at` untouched (health probes, usage sweeps).
    pub skip_usage_count: bool,
    /// Additionally reserve a concurrency slot on the chosen credential.
    pub acquire_slot: bool,
}

#[derive(Debug, Clone)]
pub struct FallbackRule {
    pub provider: ProviderKind,
    pub model_rewrite: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Errors before a credential is quarantined.
    pub max_error_count: u32,
    /// Slack subtracted from token expiry during eligibility checks.
    pub expiry_skew: Duration,
    pub quarantine_base: Duration,
    pub quarantine_cap: Duration,
    pub fallback_chains: HashMap<ProviderKind, Vec<FallbackRule>>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_error_count: 3,
            expiry_skew: Duration::from_secs(60),
            quarantine_base: Duration::from_secs(2),
            quarantine_cap: Duration::from_secs(30),
            fallback_chains: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum PoolError {
    #[error("no healthy credential for provider {0}")]
    NoHealthyCredential(ProviderKind),
    #[error("credential {0} not found")]
    NotFound(CredentialId),
}

/// Concurrency slot on one credential. Dropping it releases the slot, which
/// covers every exit path including cancellation.
#[derive(Debug)]
pub struct SlotGuard {
    _permit: OwnedSemaphorePermit,
}

/// Outcome of a selection: a point-in-time snapshot of the credential plus
/// the provider/model actually in effect after fallback rewriting.
#[derive(Debug)]
pub struct Selection {
    pub credential: Credential,
    pub provider: ProviderKind,
    pub model: Option<String>,
    pub is_fallback: bool,
    pub slot: Option<SlotGuard>,
}

struct Entry {
    credential: Credential,
    slots: Arc<Semaphore>,
}

impl Entry {
    fn new(credential: Credential) -> Self {
        let slots = Arc::new(Semaphore::new(credential.max_concurrency.max(1) as usize));
        Self { credential, slots }
    }
}

/// Per-provider credential pools. Every mutation goes through the provider's
/// (fair) mutex; selections clone a snapshot out and release the lock before
/// any I/O happens.
pub struct CredentialPool {
    providers: HashMap<ProviderKind, tokio::sync::Mutex<Vec<Entry>>>,
    config: PoolConfig,
}

impl CredentialPool {
    pub fn new(config: PoolConfig) -> Self {
        let providers = ProviderKind::ALL
            .into_iter()
            .map(|kind| (kind, tokio::sync::Mutex::new(Vec::new())))
            .collect();
        Self { providers, config }
    }

    pub fn from_credentials(
        config: PoolConfig,
        mut credentials: HashMap<ProviderKind, Vec<Credential>>,
    ) -> Self {
        let providers = ProviderKind::ALL
            .into_iter()
            .map(|kind| {
                let entries = credentials
                    .remove(&kind)
                    .unwrap_or_default()
                    .into_iter()
                    .map(Entry::new)
                    .collect();
                (kind, tokio::sync::Mutex::new(entries))
            })
            .collect();
        Self { providers, config }
    }

    pub async fn insert(&self, provider: ProviderKind, credential: Credential) {
        if let Some(entries) = self.providers.get(&provider) {
            entries.lock().await.push(Entry::new(credential));
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Pick an eligible credential for `provider`, falling over to the
    /// configured chain when the primary pool is exhausted.
    pub async fn select(
        &self,
        provider: ProviderKind,
        model: Option<&str>,
        options: SelectOptions,
    ) -> Result<Selection, PoolError> {
        if let Some(selection) = self
            .select_in_provider(provider, model, options, false)
            .await
        {
            return Ok(selection);
        }

        let chain = self
            .config
            .fallback_chains
            .get(&provider)
            .cloned()
            .unwrap_or_default();
        for rule in chain {
            let target_model = rule.model_rewrite.as_deref().or(model);
            if let Some(mut selection) = self
                .select_in_provider(rule.provider, target_model, options, true)
                .await
            {
                info!(
                    event = "pool_fallback",
                    from = %provider,
                    to = %rule.provider,
                    model = ?selection.model
                );
                selection.is_fallback = true;
                return Ok(selection);
            }
        }

        Err(PoolError::NoHealthyCredential(provider))
    }

    async fn select_in_provider(
        &self,
        provider: ProviderKind,
        model: Option<&str>,
        options: SelectOptions,
        is_fallback: bool,
    ) -> Option<Selection> {
        let entries = self.providers.get(&provider)?;
        let mut guard = entries.lock().await;
        let now = now_ms();
        let skew = self.config.expiry_skew.as_millis() as i64;

        // Quarantine cooldowns expire lazily, at selection time.
        for entry in guard.iter_mut() {
            if let HealthState::Quarantined { until } = entry.credential.health {
                if until <= now {
                    entry.credential.health = HealthState::Degraded;
                    info!(
                        event = "credential_recovered",
                        uuid = %entry.credential.uuid,
                        provider = %provider
                    );
                }
            }
        }

        let mut best: Option<usize> = None;
        for (index, entry) in guard.iter().enumerate() {
            let credential = &entry.credential;
            if !credential.is_eligible(now, skew) {
                continue;
            }
            if let Some(model) = model {
                if !credential.supports_model(model) {
                    continue;
                }
            }
            if options.acquire_slot && entry.slots.available_permits() == 0 {
                continue;
            }
            let better = match best {
                None => true,
                Some(current) => credential.last_used_at < guard[current].credential.last_used_at,
            };
            if better {
                best = Some(index);
            }
        }

        let index = best?;
        let slot = if options.acquire_slot {
            // Cannot fail: the lock is held and permits were checked above.
            let permit = guard[index].slots.clone().try_acquire_owned().ok()?;
            Some(SlotGuard { _permit: permit })
        } else {
            None
        };
        if !options.skip_usage_count {
            guard[index].credential.last_used_at = Some(now);
        }

        Some(Selection {
            credential: guard[index].credential.clone(),
            provider,
            model: model.map(|value| value.to_string()),
            is_fallback,
            slot,
        })
    }

    /// Completion without error: clears the failure trail.
    pub async fn mark_success(&self, provider: ProviderKind, uuid: CredentialId) {
        self.with_entry(provider, uuid, |credential| {
            credential.error_count = 0;
            credential.quarantine_streak = 0;
            credential.last_error = None;
            credential.health = HealthState::Healthy;
        })
        .await;
    }

    /// Upstream failure. `should_switch_credential` (auth/quota errors)
    /// quarantines immediately; otherwise the error counter climbs toward
    /// the configured threshold.
    pub async fn mark_failure(
        &self,
        provider: ProviderKind,
        uuid: CredentialId,
        error: &str,
        should_switch_credential: bool,
    ) {
        let max_errors = self.config.max_error_count;
        let base = self.config.quarantine_base;
        let cap = self.config.quarantine_cap;
        self.with_entry(provider, uuid, |credential| {
            let now = now_ms();
            credential.error_count = credential.error_count.saturating_add(1);
            credential.last_error = Some(error.to_string());
            credential.last_error_at = Some(now);

            if should_switch_credential || credential.error_count >= max_errors {
                credential.quarantine_streak = credential.quarantine_streak.saturating_add(1);
                let cooldown = quarantine_cooldown(base, cap, credential.quarantine_streak);
                credential.health = HealthState::Quarantined {
                    until: now + cooldown.as_millis() as i64,
                };
                warn!(
                    event = "credential_quarantined",
                    uuid = %credential.uuid,
                    provider = %provider,
                    reason = %error,
                    cooldown_ms = cooldown.as_millis() as u64,
                    immediate = should_switch_credential
                );
            } else {
                credential.health = HealthState::Degraded;
                warn!(
                    event = "credential_degraded",
                    uuid = %credential.uuid,
                    provider = %provider,
                    errors = credential.error_count,
                    reason = %error
                );
            }
        })
        .await;
    }

    /// Refresh failures only bump the counter; quarantine is left to the
    /// next real request.
    pub async fn record_refresh_failure(
        &self,
        provider: ProviderKind,
        uuid: CredentialId,
        error: &str,
    ) {
        self.with_entry(provider, uuid, |credential| {
            credential.error_count = credential.error_count.saturating_add(1);
            credential.last_error = Some(error.to_string());
            credential.last_error_at = Some(now_ms());
        })
        .await;
    }

    pub async fn update_secret(
        &self,
        provider: ProviderKind,
        uuid: CredentialId,
        secret: crate::credential::SecretMaterial,
    ) -> Result<(), PoolError> {
        let mut found = false;
        self.with_entry(provider, uuid, |credential| {
            credential.secret = secret.clone();
            found = true;
        })
        .await;
        if found {
            Ok(())
        } else {
            Err(PoolError::NotFound(uuid))
        }
    }

    pub async fn set_usage_snapshot(
        &self,
        provider: ProviderKind,
        uuid: CredentialId,
        snapshot: serde_json::Value,
    ) {
        self.with_entry(provider, uuid, |credential| {
            credential.usage_snapshot = Some(snapshot.clone());
            credential.usage_snapshot_at = Some(now_ms());
        })
        .await;
    }

    pub async fn set_disabled(&self, provider: ProviderKind, uuid: CredentialId, disabled: bool) {
        self.with_entry(provider, uuid, |credential| {
            credential.disabled = disabled;
        })
        .await;
    }

    /// Point-in-time clone of every credential in one provider pool.
    pub async fn snapshot(&self, provider: ProviderKind) -> Vec<Credential> {
        match self.providers.get(&provider) {
            Some(entries) => entries
                .lock()
                .await
                .iter()
                .map(|entry| entry.credential.clone())
                .collect(),
            None => Vec::new(),
        }
    }

    pub async fn get(&self, provider: ProviderKind, uuid: CredentialId) -> Option<Credential> {
        self.snapshot(provider)
            .await
            .into_iter()
            .find(|credential| credential.uuid == uuid)
    }

    pub async fn export(&self) -> HashMap<ProviderKind, Vec<Credential>> {
        let mut out = HashMap::new();
        for kind in ProviderKind::ALL {
            out.insert(kind, self.snapshot(kind).await);
        }
        out
    }

    async fn with_entry<F>(&self, provider: ProviderKind, uuid: CredentialId, mut apply: F)
    where
        F: FnMut(&mut Credential),
    {
        let Some(entries) = self.providers.get(&provider) else {
            return;
        };
        let mut guard = entries.lock().await;
        if let Some(entry) = guard
            .iter_mut()
            .find(|entry| entry.credential.uuid == uuid)
        {
            apply(&mut entry.credential);
        }
    }
}

fn quarantine_cooldown(base: Duration, cap: Duration, streak: u32) -> Duration {
    let shift = streak.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << shift).min(cap)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cooldown_grows_and_caps() {
        let base = Duration::from_secs(2);
        let cap = Duration::from_secs(30);
        assert_eq!(quarantine_cooldown(base, cap, 1), Duration::from_secs(2));
        assert_eq!(quarantine_cooldown(base, cap, 3), Duration::from_secs(8));
        assert_eq!(quarantine_cooldown(base, cap, 10), Duration::from_secs(30));
    }
}
