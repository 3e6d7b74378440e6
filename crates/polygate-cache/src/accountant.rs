use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use thiserror::Error;
use tracing::{debug, warn};

use crate::breakpoints::Breakpoint;

#[derive(Debug, Error)]
pub enum KvError {
    #[error("kv unavailable: {0}")]
    Unavailable(String),
    #[error("kv command failed: {0}")]
    Command(String),
}

/// The external key-value store behind prefix-cache accounting. Values are
/// ASCII integer token counts.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get_count(&self, key: &str) -> Result<Option<u64>, KvError>;
    async fn refresh_ttl(&self, key: &str, ttl_secs: u64) -> Result<(), KvError>;
    async fn set_count(&self, key: &str, value: u64, ttl_secs: u64) -> Result<(), KvError>;
}

const CONNECT_ATTEMPTS: u32 = 3;
const CONNECT_BACKOFF_STEP: Duration = Duration::from_millis(200);
const CONNECT_BACKOFF_CAP: Duration = Duration::from_secs(2);

/// Redis-backed store, lazily connected with a bounded retry.
pub struct RedisStore {
    client: redis::Client,
    connection: tokio::sync::Mutex<Option<redis::aio::MultiplexedConnection>>,
}

impl RedisStore {
    pub fn new(url: impl AsRef<str>) -> Result<Self, KvError> {
        Ok(Self {
            client: redis::Client::open(url.as_ref())
                .map_err(|err| KvError::Unavailable(err.to_string()))?,
            connection: tokio::sync::Mutex::new(None),
        })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, KvError> {
        let mut guard = self.connection.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }

        let mut last_error = String::new();
        for attempt in 1..=CONNECT_ATTEMPTS {
            match self.client.get_multiplexed_async_connection().await {
                Ok(conn) => {
                    *guard = Some(conn.clone());
                    return Ok(conn);
                }
                Err(err) => {
                    last_error = err.to_string();
                    let backoff = CONNECT_BACKOFF_STEP
                        .saturating_mul(attempt)
                        .min(CONNECT_BACKOFF_CAP);
                    tokio::time::sleep(backoff).await;
                }
            }
        }
        Err(KvError::Unavailable(last_error))
    }

    fn drop_connection(&self) {
        if let Ok(mut guard) = self.connection.try_lock() {
            *guard = None;
        }
    }
}

#[async_trait]
impl KvStore for RedisStore {
    async fn get_count(&self, key: &str) -> Result<Option<u64>, KvError> {
        let mut conn = self.connection().await?;
        let value: Option<String> = conn.get(key).await.map_err(|err| {
            self.drop_connection();
            KvError::Command(err.to_string())
        })?;
        Ok(value.and_then(|raw| raw.parse::<u64>().ok()))
    }

    async fn refresh_ttl(&self, key: &str, ttl_secs: u64) -> Result<(), KvError> {
        let mut conn = self.connection().await?;
        let _: bool = conn.expire(key, ttl_secs as i64).await.map_err(|err| {
            self.drop_connection();
            KvError::Command(err.to_string())
        })?;
        Ok(())
    }

    async fn set_count(&self, key: &str, value: u64, ttl_secs: u64) -> Result<(), KvError> {
        let mut conn = self.connection().await?;
        let _: () = conn
            .set_ex(key, value.to_string(), ttl_secs)
            .await
            .map_err(|err| {
                self.drop_connection();
                KvError::Command(err.to_string())
            })?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheBreakdown {
    pub cache_read_input_tokens: u64,
    pub cache_creation_input_tokens: u64,
    pub uncached_input_tokens: u64,
}

impl CacheBreakdown {
    pub fn all_uncached(total: u64) -> Self {
        Self {
            cache_read_input_tokens: 0,
            cache_creation_input_tokens: 0,
            uncached_input_tokens: total,
        }
    }
}

/// Prefix-cache accounting against the key-value store. Every store failure
/// degrades to "everything uncached"; nothing here may fail a request.
pub struct CacheAccountant<S: KvStore + ?Sized> {
    store: std::sync::Arc<S>,
}

impl<S: KvStore + ?Sized> CacheAccountant<S> {
    pub fn new(store: std::sync::Arc<S>) -> Self {
        Self { store }
    }

    pub async fn account(
        &self,
        session_id: &str,
        breakpoints: &[Breakpoint],
        total_tokens: u64,
    ) -> CacheBreakdown {
        match self.try_account(session_id, breakpoints, total_tokens).await {
            Ok(breakdown) => breakdown,
            Err(err) => {
                warn!(event = "prefix_cache_degraded", error = %err);
                CacheBreakdown::all_uncached(total_tokens)
            }
        }
    }

    async fn try_account(
        &self,
        session_id: &str,
        breakpoints: &[Breakpoint],
        total_tokens: u64,
    ) -> Result<CacheBreakdown, KvError> {
        let mut cache_read = 0u64;
        let mut cache_creation = 0u64;

        // Deepest prefix first; the first hit covers everything before it.
        let mut hit_position: Option<usize> = None;
        for (position, breakpoint) in breakpoints.iter().enumerate().rev() {
            let key = cache_key(session_id, &breakpoint.hash);
            if let Some(stored) = self.store.get_count(&key).await? {
                cache_read = stored;
                self.store.refresh_ttl(&key, breakpoint.ttl_secs).await?;
                hit_position = Some(position);
                debug!(event = "prefix_cache_hit", tokens = stored, depth = position);
                break;
            }
        }

        let (first_new, mut previous_tokens) = match hit_position {
            Some(position) => (position + 1, breakpoints[position].cumulative_tokens),
            None => (0, 0),
        };
        for breakpoint in &breakpoints[first_new..] {
            let key = cache_key(session_id, &breakpoint.hash);
            self.store
                .set_count(&key, breakpoint.cumulative_tokens, breakpoint.ttl_secs)
                .await?;
            cache_creation += breakpoint
                .cumulative_tokens
                .saturating_sub(previous_tokens);
            previous_tokens = breakpoint.cumulative_tokens;
        }

        Ok(CacheBreakdown {
            cache_read_input_tokens: cache_read,
            cache_creation_input_tokens: cache_creation,
            uncached_input_tokens: total_tokens
                .saturating_sub(cache_read)
                .saturating_sub(cache_creation),
        })
    }
}

pub fn cache_key(session_id: &str, hash: &str) -> String {
    format!("cache:{session_id}:{hash}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;

    /// In-memory stand-in for the external store; TTLs are recorded, not
    /// enforced.
    #[derive(Default)]
    struct MemoryStore {
        entries: tokio::sync::Mutex<HashMap<String, (u64, u64)>>,
        fail: bool,
    }

    #[async_trait]
    impl KvStore for MemoryStore {
        async fn get_count(&self, key: &str) -> Result<Option<u64>, KvError> {
            if self.fail {
                return Err(KvError::Unavailable("down".to_string()));
            }
            Ok(self.entries.lock().await.get(key).map(|(value, _)| *value))
        }

        async fn refresh_ttl(&self, key: &str, ttl_secs: u64) -> Result<(), KvError> {
            if self.fail {
                return Err(KvError::Unavailable("down".to_string()));
            }
            if let Some(entry) = self.entries.lock().await.get_mut(key) {
                entry.1 = ttl_secs;
            }
            Ok(())
        }

        async fn set_count(&self, key: &str, value: u64, ttl_secs: u64) -> Result<(), KvError> {
            if self.fail {
                return Err(KvError::Unavailable("down".to_string()));
            }
            self.entries
                .lock()
                .await
                .insert(key.to_string(), (value, ttl_secs));
            Ok(())
        }
    }

    fn breakpoints() -> Vec<Breakpoint> {
        vec![
            Breakpoint {
                hash: "h1".to_string(),
                cumulative_tokens: 100,
                ttl_secs: 300,
            },
            Breakpoint {
                hash: "h2".to_string(),
                cumulative_tokens: 150,
                ttl_secs: 300,
            },
        ]
    }

    #[tokio::test]
    async fn hit_then_full_hit_accounting() {
        let store = Arc::new(MemoryStore::default());
        store.set_count("cache:s1:h1", 100, 300).await.unwrap();
        let accountant = CacheAccountant::new(store.clone());

        // First call: h1 hits, h2 is created.
        let first = accountant.account("s1", &breakpoints(), 200).await;
        assert_eq!(first.cache_read_input_tokens, 100);
        assert_eq!(first.cache_creation_input_tokens, 50);
        assert_eq!(first.uncached_input_tokens, 50);

        // Second identical call: deepest breakpoint hits, nothing created.
        let second = accountant.account("s1", &breakpoints(), 200).await;
        assert_eq!(second.cache_read_input_tokens, 150);
        assert_eq!(second.cache_creation_input_tokens, 0);
        assert_eq!(second.uncached_input_tokens, 50);
    }

    #[tokio::test]
    async fn cold_store_creates_every_breakpoint() {
        let store = Arc::new(MemoryStore::default());
        let accountant = CacheAccountant::new(store.clone());

        let breakdown = accountant.account("s1", &breakpoints(), 200).await;
        assert_eq!(breakdown.cache_read_input_tokens, 0);
        assert_eq!(breakdown.cache_creation_input_tokens, 150);
        assert_eq!(breakdown.uncached_input_tokens, 50);

        let entries = store.entries.lock().await;
        assert_eq!(entries["cache:s1:h1"], (100, 300));
        assert_eq!(entries["cache:s1:h2"], (150, 300));
    }

    #[tokio::test]
    async fn store_failure_fails_open() {
        let store = Arc::new(MemoryStore {
            fail: true,
            ..MemoryStore::default()
        });
        let accountant = CacheAccountant::new(store);
        let breakdown = accountant.account("s1", &breakpoints(), 200).await;
        assert_eq!(breakdown, CacheBreakdown::all_uncached(200));
    }

    #[tokio::test]
    async fn no_breakpoints_means_everything_uncached() {
        let store = Arc::new(MemoryStore::default());
        let accountant = CacheAccountant::new(store);
        let breakdown = accountant.account("s1", &[], 42).await;
        assert_eq!(breakdown, CacheBreakdown::all_uncached(42));
    }
}
