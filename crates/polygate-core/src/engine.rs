use std::sync::Arc;

use futures_util::StreamExt;
use polygate_cache::{analyse_prefix, count_request_tokens, derive_session_id, CacheBreakdown};
use polygate_pool::{ProviderKind, SelectOptions, Selection};
use polygate_translate::unified::{
    FinishReason, UnifiedDelta, UnifiedRequest, UnifiedResponse, UnifiedUsage,
};
use polygate_translate::Dialect;
use polygate_upstream::{AdapterError, DeltaStream, ModelEntry};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};

use crate::error::GatewayError;
use crate::state::AppState;

pub enum EngineReply {
    Completion(Box<UnifiedResponse>),
    Stream(DeltaStream),
}

/// Request dispatcher: credential selection, upstream invocation, bounded
/// retry with failover, and slot hygiene on every exit path.
pub struct Engine {
    state: Arc<AppState>,
}

impl Engine {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    pub async fn execute(
        &self,
        request: UnifiedRequest,
        dialect: Dialect,
    ) -> Result<EngineReply, GatewayError> {
        let provider = self.state.router.route(&request.model);
        let breakdown = self.prefix_breakdown(&request, dialect, provider).await;

        let mut last_error: Option<AdapterError> = None;
        for attempt in 1..=self.state.max_attempts {
            let selection = match self
                .state
                .pool
                .select(
                    provider,
                    Some(&request.model),
                    SelectOptions {
                        skip_usage_count: false,
                        acquire_slot: true,
                    },
                )
                .await
            {
                Ok(selection) => selection,
                Err(err) => {
                    warn!(event = "no_credential", provider = %provider, error = %err);
                    return Err(last_error
                        .map(GatewayError::from)
                        .unwrap_or_else(GatewayError::no_healthy_provider));
                }
            };
            let Some(adapter) = self.state.adapters.get(selection.provider) else {
                return Err(GatewayError::no_healthy_provider());
            };
            let model = selection
                .model
                .clone()
                .unwrap_or_else(|| request.model.clone());
            info!(
                event = "upstream_attempt",
                attempt,
                provider = %selection.provider,
                model = %model,
                credential = %selection.credential.uuid,
                is_fallback = selection.is_fallback,
                stream = request.stream
            );

            if request.stream {
                match adapter
                    .generate_stream(&selection.credential, &model, &request)
                    .await
                {
                    Ok(mut stream) => match stream.next().await {
                        Some(Ok(first)) => {
                            // First delta in hand: from here on the client
                            // sees bytes, so failover is off the table.
                            return Ok(EngineReply::Stream(self.guard_stream(
                                first, stream, selection, breakdown,
                            )));
                        }
                        Some(Err(err)) => {
                            self.note_failure(&selection, &err).await;
                            if !err.retryable || attempt == self.state.max_attempts {
                                return Err(err.into());
                            }
                            last_error = Some(err);
                        }
                        None => {
                            let err = AdapterError::network("upstream closed without events");
                            self.note_failure(&selection, &err).await;
                            last_error = Some(err);
                        }
                    },
                    Err(err) => {
                        self.note_failure(&selection, &err).await;
                        if !err.retryable || attempt == self.state.max_attempts {
                            return Err(err.into());
                        }
                        last_error = Some(err);
                    }
                }
            } else {
                match adapter
                    .generate(&selection.credential, &model, &request)
                    .await
                {
                    Ok(mut response) => {
                        self.state
                            .pool
                            .mark_success(selection.provider, selection.credential.uuid)
                            .await;
                        if let Some(breakdown) = &breakdown {
                            apply_breakdown(&mut response.usage, breakdown);
                        }
                        return Ok(EngineReply::Completion(Box::new(response)));
                    }
                    Err(err) => {
                        self.note_failure(&selection, &err).await;
                        if !err.retryable || attempt == self.state.max_attempts {
                            return Err(err.into());
                        }
                        last_error = Some(err);
                    }
                }
            }
        }

        Err(last_error
            .map(GatewayError::from)
            .unwrap_or_else(GatewayError::no_healthy_provider))
    }

    /// Prefix-cache accounting applies to Anthropic-dialect calls whose
    /// upstream does not report prompt caching itself.
    async fn prefix_breakdown(
        &self,
        request: &UnifiedRequest,
        dialect: Dialect,
        provider: ProviderKind,
    ) -> Option<CacheBreakdown> {
        if dialect != Dialect::Anthropic || provider == ProviderKind::AnthropicApi {
            return None;
        }
        let accountant = self.state.accountant.as_ref()?;
        let analysis = analyse_prefix(request, self.state.counter.as_ref());
        let session_id = derive_session_id(request.user_id.as_deref().unwrap_or("anonymous"));
        Some(
            accountant
                .account(&session_id, &analysis.breakpoints, analysis.total_tokens)
                .await,
        )
    }

    async fn note_failure(&self, selection: &Selection, err: &AdapterError) {
        self.state
            .pool
            .mark_failure(
                selection.provider,
                selection.credential.uuid,
                &err.to_string(),
                err.should_switch_credential,
            )
            .await;
    }

    /// Wraps a live upstream stream: forwards deltas, settles credential
    /// health at the terminal, and owns the slot guard so cancellation (the
    /// receiver vanishing) releases everything without touching health.
    fn guard_stream(
        &self,
        first: UnifiedDelta,
        rest: DeltaStream,
        selection: Selection,
        breakdown: Option<CacheBreakdown>,
    ) -> DeltaStream {
        let pool = self.state.pool.clone();
        let (tx, rx) = tokio::sync::mpsc::channel::<Result<UnifiedDelta, AdapterError>>(32);

        tokio::spawn(async move {
            let _slot = selection.slot;
            let provider = selection.provider;
            let uuid = selection.credential.uuid;
            let mut rest = rest;
            let mut saw_terminal = false;

            let mut pending = Some(first);
            loop {
                let item = match pending.take() {
                    Some(delta) => Ok(delta),
                    None => match rest.next().await {
                        Some(item) => item,
                        None => break,
                    },
                };
                match item {
                    Ok(mut delta) => {
                        if delta.is_terminal() {
                            saw_terminal = true;
                            if let Some(breakdown) = &breakdown {
                                let usage = delta.usage.get_or_insert_with(UnifiedUsage::default);
                                apply_breakdown(usage, breakdown);
                            }
                            pool.mark_success(provider, uuid).await;
                            let _ = tx.send(Ok(delta)).await;
                            break;
                        }
                        if tx.send(Ok(delta)).await.is_err() {
                            // Client disconnected: stop reading, release the
                            // slot, and leave health untouched.
                            return;
                        }
                    }
                    Err(err) => {
                        // Partial stream: never retried, but the credential
                        // pays for it.
                        pool.mark_failure(provider, uuid, &err.to_string(), false)
                            .await;
                        let _ = tx.send(Err(err)).await;
                        return;
                    }
                }
            }

            if !saw_terminal {
                pool.mark_success(provider, uuid).await;
                let _ = tx
                    .send(Ok(UnifiedDelta::finish(FinishReason::Stop)))
                    .await;
            }
        });

        Box::pin(ReceiverStream::new(rx))
    }

    /// Provider-side token count when the adapter offers one, local counting
    /// otherwise.
    pub async fn count_tokens(&self, request: &UnifiedRequest) -> u64 {
        let provider = self.state.router.route(&request.model);
        let selection = self
            .state
            .pool
            .select(
                provider,
                Some(&request.model),
                SelectOptions {
                    skip_usage_count: true,
                    acquire_slot: false,
                },
            )
            .await;
        if let Ok(selection) = selection {
            if let Some(adapter) = self.state.adapters.get(selection.provider) {
                if let Ok(Some(count)) =
                    adapter.count_tokens(&selection.credential, request).await
                {
                    return count;
                }
            }
        }
        count_request_tokens(request, self.state.counter.as_ref())
    }

    /// Model catalogue across every provider that has a usable credential.
    pub async fn list_models(&self) -> Vec<(ProviderKind, ModelEntry)> {
        let mut out = Vec::new();
        for provider in self.state.adapters.providers().collect::<Vec<_>>() {
            let Ok(selection) = self
                .state
                .pool
                .select(
                    provider,
                    None,
                    SelectOptions {
                        skip_usage_count: true,
                        acquire_slot: false,
                    },
                )
                .await
            else {
                continue;
            };
            let Some(adapter) = self.state.adapters.get(provider) else {
                continue;
            };
            match adapter.list_models(&selection.credential).await {
                Ok(models) => out.extend(models.into_iter().map(|model| (provider, model))),
                Err(err) => {
                    warn!(event = "list_models_failed", provider = %provider, error = %err)
                }
            }
        }
        out
    }

    /// Boot-time adapter initialisation: bounded parallelism, failures only
    /// degrade health.
    pub async fn warmup(&self) {
        let providers: Vec<ProviderKind> = self.state.adapters.providers().collect();
        futures_util::stream::iter(providers)
            .for_each_concurrent(4, |provider| async move {
                let Ok(selection) = self
                    .state
                    .pool
                    .select(
                        provider,
                        None,
                        SelectOptions {
                            skip_usage_count: true,
                            acquire_slot: false,
                        },
                    )
                    .await
                else {
                    return;
                };
                let Some(adapter) = self.state.adapters.get(provider) else {
                    return;
                };
                if let Err(err) = adapter.list_models(&selection.credential).await {
                    warn!(event = "warmup_failed", provider = %provider, error = %err);
                    self.state
                        .pool
                        .mark_failure(
                            provider,
                            selection.credential.uuid,
                            &err.to_string(),
                            false,
                        )
                        .await;
                }
            })
            .await;
    }

    /// Background sweep: refresh advisory usage snapshots, push near-expiry
    /// credentials through the refresher, then persist both state files.
    pub async fn sweep(&self) {
        for provider in self.state.adapters.providers().collect::<Vec<_>>() {
            let Some(adapter) = self.state.adapters.get(provider) else {
                continue;
            };
            for credential in self.state.pool.snapshot(provider).await {
                if credential.disabled {
                    continue;
                }
                if let Ok(snapshot) = adapter.usage_limits(&credential).await {
                    self.state
                        .pool
                        .set_usage_snapshot(provider, credential.uuid, snapshot)
                        .await;
                }
            }
        }
        self.state.refresher.sweep_once().await;
        self.persist_state().await;
    }

    async fn persist_state(&self) {
        let credentials = self.state.pool.export().await;

        let mut providers = std::collections::HashMap::new();
        for (kind, list) in &credentials {
            let snapshots: Vec<serde_json::Value> = list
                .iter()
                .filter_map(|credential| {
                    credential.usage_snapshot.clone().map(|snapshot| {
                        serde_json::json!({
                            "uuid": credential.uuid,
                            "snapshot": snapshot,
                            "at": credential.usage_snapshot_at,
                        })
                    })
                })
                .collect();
            if !snapshots.is_empty() {
                providers.insert(kind.as_str().to_string(), serde_json::Value::Array(snapshots));
            }
        }
        let usage = polygate_pool::UsageCache {
            timestamp: polygate_pool::credential::now_ms(),
            providers,
        };
        if let Err(err) = self.state.usage_cache.save(&usage).await {
            warn!(event = "usage_cache_persist_failed", error = %err);
        }

        if let Err(err) = self.state.credential_store.save(&credentials).await {
            warn!(event = "credential_persist_failed", error = %err);
        }
    }
}

fn apply_breakdown(usage: &mut UnifiedUsage, breakdown: &CacheBreakdown) {
    // Upstream-reported caching wins; the accountant only fills the gap.
    if usage.cache_read_input_tokens.is_some() || usage.cache_creation_input_tokens.is_some() {
        return;
    }
    usage.cache_read_input_tokens = Some(breakdown.cache_read_input_tokens);
    usage.cache_creation_input_tokens = Some(breakdown.cache_creation_input_tokens);
    if usage.input_tokens == 0 {
        usage.input_tokens = breakdown.uncached_input_tokens;
    }
}
