use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::credential::{Credential, ProviderKind};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Credentials on disk: a JSON document keyed by provider kind, each value an
/// array of credential records. Writes go to a temp file first and rename
/// into place, serialised by a per-file mutex.
pub struct CredentialStore {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl CredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub async fn load(&self) -> Result<HashMap<ProviderKind, Vec<Credential>>, StoreError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn save(
        &self,
        credentials: &HashMap<ProviderKind, Vec<Credential>>,
    ) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let body = serde_json::to_vec_pretty(credentials)?;
        write_atomic(&self.path, &body).await
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageCache {
    pub timestamp: i64,
    pub providers: HashMap<String, Value>,
}

/// Usage snapshots on disk, same atomic write discipline.
pub struct UsageCacheFile {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl UsageCacheFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub async fn load(&self) -> Result<UsageCache, StoreError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(UsageCache::default()),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn save(&self, cache: &UsageCache) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let body = serde_json::to_vec_pretty(cache)?;
        write_atomic(&self.path, &body).await
    }
}

async fn write_atomic(path: &Path, body: &[u8]) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, body).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::SecretMaterial;

    #[tokio::test]
    async fn credentials_round_trip_through_disk() {
        let dir = std::env::temp_dir().join(format!("polygate-store-{}", uuid::Uuid::new_v4()));
        let store = CredentialStore::new(dir.join("credentials.json"));

        let mut map = HashMap::new();
        map.insert(
            ProviderKind::AnthropicApi,
            vec![Credential::new(SecretMaterial::ApiKey {
                api_key: "sk-test".to_string(),
            })],
        );
        store.save(&map).await.expect("save");

        let loaded = store.load().await.expect("load");
        assert_eq!(loaded[&ProviderKind::AnthropicApi].len(), 1);
        assert_eq!(
            loaded[&ProviderKind::AnthropicApi][0].uuid,
            map[&ProviderKind::AnthropicApi][0].uuid
        );

        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[tokio::test]
    async fn missing_file_loads_empty() {
        let store = CredentialStore::new("/nonexistent/polygate/credentials.json");
        assert!(store.load().await.expect("load").is_empty());
    }
}
