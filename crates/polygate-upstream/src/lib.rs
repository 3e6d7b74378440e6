pub mod client;
pub mod direct;
pub mod error;
pub mod webchat;

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures_core::Stream;
use futures_util::StreamExt;
use polygate_pool::{Credential, ProviderKind, RefreshError, SecretMaterial, TokenExchanger};
use polygate_protocol::sse::WireDecoder;
use polygate_translate::unified::{UnifiedDelta, UnifiedRequest, UnifiedResponse};
use tokio_stream::wrappers::ReceiverStream;

pub use error::AdapterError;

pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<UnifiedDelta, AdapterError>> + Send>>;

#[derive(Debug, Clone)]
pub struct ModelEntry {
    pub id: String,
    pub display_name: Option<String>,
    pub created_at: Option<i64>,
}

/// Common capability set every upstream implements. Optional capabilities
/// have default "not supported" answers.
#[async_trait]
pub trait Adapter: Send + Sync {
    fn provider(&self) -> ProviderKind;

    async fn generate(
        &self,
        credential: &Credential,
        model: &str,
        request: &UnifiedRequest,
    ) -> Result<UnifiedResponse, AdapterError>;

    async fn generate_stream(
        &self,
        credential: &Credential,
        model: &str,
        request: &UnifiedRequest,
    ) -> Result<DeltaStream, AdapterError>;

    async fn list_models(&self, credential: &Credential) -> Result<Vec<ModelEntry>, AdapterError>;

    /// Provider-side token counting; `Ok(None)` means "use the local counter".
    async fn count_tokens(
        &self,
        _credential: &Credential,
        _request: &UnifiedRequest,
    ) -> Result<Option<u64>, AdapterError> {
        Ok(None)
    }

    async fn usage_limits(
        &self,
        _credential: &Credential,
    ) -> Result<serde_json::Value, AdapterError> {
        Err(AdapterError::unsupported("usage limits"))
    }

    /// Provider-specific secret refresh, driven by the token refresher.
    async fn exchange_token(
        &self,
        _credential: &Credential,
    ) -> Result<SecretMaterial, RefreshError> {
        Err(RefreshError::NoRefreshToken)
    }
}

#[derive(Default)]
pub struct AdapterRegistry {
    adapters: HashMap<ProviderKind, Arc<dyn Adapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn Adapter>) {
        self.adapters.insert(adapter.provider(), adapter);
    }

    pub fn get(&self, provider: ProviderKind) -> Option<Arc<dyn Adapter>> {
        self.adapters.get(&provider).cloned()
    }

    pub fn providers(&self) -> impl Iterator<Item = ProviderKind> + '_ {
        self.adapters.keys().copied()
    }
}

/// Bridges the pool's refresher onto whichever adapter owns the provider.
pub struct RegistryExchanger {
    registry: Arc<AdapterRegistry>,
}

impl RegistryExchanger {
    pub fn new(registry: Arc<AdapterRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl TokenExchanger for RegistryExchanger {
    async fn exchange(
        &self,
        provider: ProviderKind,
        credential: &Credential,
    ) -> Result<SecretMaterial, RefreshError> {
        let Some(adapter) = self.registry.get(provider) else {
            return Err(RefreshError::Rejected(format!(
                "no adapter for provider {provider}"
            )));
        };
        adapter.exchange_token(credential).await
    }
}

/// Pumps an upstream HTTP body through the wire decoder and a per-dialect
/// payload parser, yielding unified deltas. The pump task stops as soon as
/// the receiver is dropped, which aborts the upstream read on client
/// disconnect. A stream silent longer than the idle timeout is terminated as
/// a provider error.
pub(crate) fn relay_body<P>(response: wreq::Response, mut parse: P) -> DeltaStream
where
    P: FnMut(&str) -> Result<Vec<UnifiedDelta>, AdapterError> + Send + 'static,
{
    let (tx, rx) = tokio::sync::mpsc::channel::<Result<UnifiedDelta, AdapterError>>(32);

    tokio::spawn(async move {
        let mut body = response.bytes_stream();
        let mut wire = WireDecoder::new();

        loop {
            let next = tokio::time::timeout(client::STREAM_IDLE_TIMEOUT, body.next()).await;
            let chunk = match next {
                Err(_) => {
                    let _ = tx.send(Err(AdapterError::timeout("upstream stream"))).await;
                    return;
                }
                Ok(None) => break,
                Ok(Some(Err(err))) => {
                    let _ = tx.send(Err(AdapterError::network(err.to_string()))).await;
                    return;
                }
                Ok(Some(Ok(chunk))) => chunk,
            };

            for payload in wire.push(&chunk) {
                if payload == "[DONE]" {
                    continue;
                }
                if !forward(&tx, &mut parse, &payload).await {
                    return;
                }
            }
        }
        for payload in wire.finish() {
            if payload == "[DONE]" {
                continue;
            }
            if !forward(&tx, &mut parse, &payload).await {
                return;
            }
        }
    });

    Box::pin(ReceiverStream::new(rx))
}

async fn forward<P>(
    tx: &tokio::sync::mpsc::Sender<Result<UnifiedDelta, AdapterError>>,
    parse: &mut P,
    payload: &str,
) -> bool
where
    P: FnMut(&str) -> Result<Vec<UnifiedDelta>, AdapterError>,
{
    match parse(payload) {
        Ok(deltas) => {
            for delta in deltas {
                if tx.send(Ok(delta)).await.is_err() {
                    // Receiver gone: the client disconnected.
                    return false;
                }
            }
            true
        }
        Err(err) => {
            tracing::debug!(event = "stream_payload_skipped", error = %err);
            true
        }
    }
}
