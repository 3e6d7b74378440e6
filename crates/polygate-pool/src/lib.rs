pub mod credential;
pub mod pool;
pub mod refresh;
pub mod store;

pub use credential::{Credential, CredentialId, HealthState, ProviderKind, SecretMaterial};
pub use pool::{
    CredentialPool, FallbackRule, PoolConfig, PoolError, SelectOptions, Selection, SlotGuard,
};
pub use refresh::{RefreshConfig, RefreshError, TokenExchanger, TokenRefresher};
pub use store::{CredentialStore, StoreError, UsageCache, UsageCacheFile};
