//! Direct API adapters: the upstream already speaks one of the public
//! dialects, so request shaping is translation plus auth headers, and stream
//! parsing reuses the per-dialect decoders.

use async_trait::async_trait;
use http::header::{AUTHORIZATION, CONTENT_TYPE};
use polygate_pool::{Credential, ProviderKind, RefreshError, SecretMaterial};
use polygate_translate::unified::{UnifiedRequest, UnifiedResponse};
use polygate_translate::{anthropic, gemini, openai};
use serde_json::Value;
use tracing::debug;

use crate::client::{shared_client, REQUEST_TIMEOUT};
use crate::error::AdapterError;
use crate::{relay_body, Adapter, DeltaStream, ModelEntry};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const ANTHROPIC_OAUTH_BETA: &str = "oauth-2025-04-20";

#[derive(Debug, Clone)]
pub struct DirectConfig {
    pub base_url: String,
    pub outbound_proxy: Option<String>,
    /// OAuth token endpoint + client id, for credentials that refresh.
    pub token_url: Option<String>,
    pub client_id: Option<String>,
}

impl DirectConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            outbound_proxy: None,
            token_url: None,
            client_id: None,
        }
    }
}

fn bearer(token: &str) -> String {
    format!("Bearer {token}")
}

async fn read_error(response: wreq::Response) -> AdapterError {
    let status = response.status();
    let body = response
        .bytes()
        .await
        .map(|bytes| String::from_utf8_lossy(&bytes).to_string())
        .unwrap_or_default();
    AdapterError::from_status(status, body)
}

/// Shared refresh-token exchange, used by every OAuth-bearing direct
/// adapter.
async fn exchange_refresh_token(
    config: &DirectConfig,
    credential: &Credential,
) -> Result<SecretMaterial, RefreshError> {
    let SecretMaterial::Oauth {
        refresh_token: Some(refresh_token),
        ..
    } = &credential.secret
    else {
        return Err(RefreshError::NoRefreshToken);
    };
    let (Some(token_url), Some(client_id)) = (&config.token_url, &config.client_id) else {
        return Err(RefreshError::Rejected("no token endpoint configured".to_string()));
    };

    let client = shared_client(config.outbound_proxy.as_deref())
        .map_err(|err| RefreshError::Transport(err.to_string()))?;
    let payload = serde_json::json!({
        "grant_type": "refresh_token",
        "client_id": client_id,
        "refresh_token": refresh_token,
    });
    let response = client
        .post(token_url)
        .header(CONTENT_TYPE, "application/json")
        .json(&payload)
        .send()
        .await
        .map_err(|err| RefreshError::Transport(err.to_string()))?;
    let status = response.status();
    let body = response
        .bytes()
        .await
        .map_err(|err| RefreshError::Transport(err.to_string()))?;
    if !status.is_success() {
        return Err(RefreshError::Rejected(format!(
            "{status}: {}",
            String::from_utf8_lossy(&body)
        )));
    }

    let raw: Value = serde_json::from_slice(&body)
        .map_err(|err| RefreshError::Rejected(err.to_string()))?;
    let access_token = raw
        .get("access_token")
        .and_then(|value| value.as_str())
        .ok_or_else(|| RefreshError::Rejected("response missing access_token".to_string()))?
        .to_string();
    let new_refresh = raw
        .get("refresh_token")
        .and_then(|value| value.as_str())
        .map(|value| value.to_string())
        .or_else(|| Some(refresh_token.clone()));
    let expires_at = raw
        .get("expires_in")
        .and_then(|value| value.as_i64())
        .map(|seconds| polygate_pool::credential::now_ms() + seconds * 1000);

    Ok(SecretMaterial::Oauth {
        access_token,
        refresh_token: new_refresh,
        expires_at,
    })
}

// ---- Anthropic-style upstream ----

pub struct AnthropicApiAdapter {
    config: DirectConfig,
}

impl AnthropicApiAdapter {
    pub fn new(config: DirectConfig) -> Self {
        Self { config }
    }

    fn request_builder(
        &self,
        path: &str,
        credential: &Credential,
    ) -> Result<wreq::RequestBuilder, AdapterError> {
        let client = shared_client(self.config.outbound_proxy.as_deref())?;
        let url = format!("{}{path}", self.config.base_url.trim_end_matches('/'));
        let mut builder = client
            .post(url)
            .header(CONTENT_TYPE, "application/json")
            .header("anthropic-version", ANTHROPIC_VERSION);
        builder = match &credential.secret {
            SecretMaterial::ApiKey { api_key } => builder.header("x-api-key", api_key),
            SecretMaterial::Oauth { access_token, .. } => builder
                .header(AUTHORIZATION, bearer(access_token))
                .header("anthropic-beta", ANTHROPIC_OAUTH_BETA),
            SecretMaterial::Cookie { .. } => {
                return Err(AdapterError::permanent(
                    "cookie credentials cannot call the messages api",
                ))
            }
        };
        Ok(builder)
    }

    fn wire_request(
        &self,
        model: &str,
        request: &UnifiedRequest,
        stream: bool,
    ) -> polygate_protocol::anthropic::MessagesRequest {
        let (mut wire, warnings) = anthropic::unified_to_request(request);
        wire.model = model.to_string();
        wire.stream = stream.then_some(true);
        for warning in warnings {
            debug!(event = "block_dropped", provider = "anthropic_api", detail = %warning.0);
        }
        wire
    }
}

#[async_trait]
impl Adapter for AnthropicApiAdapter {
    fn provider(&self) -> ProviderKind {
        ProviderKind::AnthropicApi
    }

    async fn generate(
        &self,
        credential: &Credential,
        model: &str,
        request: &UnifiedRequest,
    ) -> Result<UnifiedResponse, AdapterError> {
        let wire = self.wire_request(model, request, false);
        let response = self
            .request_builder("/v1/messages", credential)?
            .timeout(REQUEST_TIMEOUT)
            .json(&wire)
            .send()
            .await
            .map_err(|err| AdapterError::network(err.to_string()))?;
        if !response.status().is_success() {
            return Err(read_error(response).await);
        }
        let body = response
            .bytes()
            .await
            .map_err(|err| AdapterError::network(err.to_string()))?;
        let parsed: polygate_protocol::anthropic::MessagesResponse =
            serde_json::from_slice(&body)
                .map_err(|err| AdapterError::network(format!("bad response body: {err}")))?;
        anthropic::response_to_unified(parsed)
            .map_err(|err| AdapterError::network(err.to_string()))
    }

    async fn generate_stream(
        &self,
        credential: &Credential,
        model: &str,
        request: &UnifiedRequest,
    ) -> Result<DeltaStream, AdapterError> {
        let wire = self.wire_request(model, request, true);
        let response = self
            .request_builder("/v1/messages", credential)?
            .json(&wire)
            .send()
            .await
            .map_err(|err| AdapterError::network(err.to_string()))?;
        if !response.status().is_success() {
            return Err(read_error(response).await);
        }

        let mut decoder = anthropic::StreamDecoder::new();
        Ok(relay_body(response, move |payload| {
            decoder
                .push(payload)
                .map_err(|err| AdapterError::network(err.to_string()))
        }))
    }

    async fn list_models(&self, credential: &Credential) -> Result<Vec<ModelEntry>, AdapterError> {
        let client = shared_client(self.config.outbound_proxy.as_deref())?;
        let url = format!("{}/v1/models", self.config.base_url.trim_end_matches('/'));
        let mut builder = client
            .get(url)
            .header("anthropic-version", ANTHROPIC_VERSION);
        if let SecretMaterial::ApiKey { api_key } = &credential.secret {
            builder = builder.header("x-api-key", api_key);
        } else if let SecretMaterial::Oauth { access_token, .. } = &credential.secret {
            builder = builder
                .header(AUTHORIZATION, bearer(access_token))
                .header("anthropic-beta", ANTHROPIC_OAUTH_BETA);
        }
        let response = builder
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|err| AdapterError::network(err.to_string()))?;
        if !response.status().is_success() {
            return Err(read_error(response).await);
        }
        let body: polygate_protocol::anthropic::ModelList = response
            .json()
            .await
            .map_err(|err| AdapterError::network(err.to_string()))?;
        Ok(body
            .data
            .into_iter()
            .map(|model| ModelEntry {
                id: model.id,
                display_name: model.display_name,
                created_at: None,
            })
            .collect())
    }

    async fn count_tokens(
        &self,
        credential: &Credential,
        request: &UnifiedRequest,
    ) -> Result<Option<u64>, AdapterError> {
        let (wire, _) = anthropic::unified_to_request(request);
        let body = serde_json::json!({
            "model": wire.model,
            "messages": wire.messages,
            "system": wire.system,
            "tools": wire.tools,
        });
        let response = self
            .request_builder("/v1/messages/count_tokens", credential)?
            .timeout(REQUEST_TIMEOUT)
            .json(&body)
            .send()
            .await
            .map_err(|err| AdapterError::network(err.to_string()))?;
        if !response.status().is_success() {
            return Err(read_error(response).await);
        }
        let parsed: polygate_protocol::anthropic::CountTokensResponse = response
            .json()
            .await
            .map_err(|err| AdapterError::network(err.to_string()))?;
        Ok(Some(parsed.input_tokens))
    }

    async fn exchange_token(
        &self,
        credential: &Credential,
    ) -> Result<SecretMaterial, RefreshError> {
        exchange_refresh_token(&self.config, credential).await
    }
}

// ---- OpenAI-compatible upstream ----

pub struct OpenaiCompatAdapter {
    config: DirectConfig,
}

impl OpenaiCompatAdapter {
    pub fn new(config: DirectConfig) -> Self {
        Self { config }
    }

    fn auth_token<'a>(&self, credential: &'a Credential) -> Result<&'a str, AdapterError> {
        match &credential.secret {
            SecretMaterial::ApiKey { api_key } => Ok(api_key),
            SecretMaterial::Oauth { access_token, .. } => Ok(access_token),
            SecretMaterial::Cookie { .. } => Err(AdapterError::permanent(
                "cookie credentials cannot call a chat-completions api",
            )),
        }
    }

    fn wire_request(
        &self,
        model: &str,
        request: &UnifiedRequest,
        stream: bool,
    ) -> polygate_protocol::openai::ChatCompletionRequest {
        let (mut wire, warnings) = openai::unified_to_request(request);
        wire.model = model.to_string();
        wire.stream = stream.then_some(true);
        if stream {
            wire.stream_options = Some(polygate_protocol::openai::StreamOptions {
                include_usage: Some(true),
            });
        }
        for warning in warnings {
            debug!(event = "block_dropped", provider = "openai_compat", detail = %warning.0);
        }
        wire
    }

    async fn post_chat(
        &self,
        credential: &Credential,
        wire: &polygate_protocol::openai::ChatCompletionRequest,
        streaming: bool,
    ) -> Result<wreq::Response, AdapterError> {
        let client = shared_client(self.config.outbound_proxy.as_deref())?;
        let url = format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );
        let mut builder = client
            .post(url)
            .header(CONTENT_TYPE, "application/json")
            .header(AUTHORIZATION, bearer(self.auth_token(credential)?));
        if !streaming {
            builder = builder.timeout(REQUEST_TIMEOUT);
        }
        let response = builder
            .json(wire)
            .send()
            .await
            .map_err(|err| AdapterError::network(err.to_string()))?;
        if !response.status().is_success() {
            return Err(read_error(response).await);
        }
        Ok(response)
    }
}

#[async_trait]
impl Adapter for OpenaiCompatAdapter {
    fn provider(&self) -> ProviderKind {
        ProviderKind::OpenaiCompat
    }

    async fn generate(
        &self,
        credential: &Credential,
        model: &str,
        request: &UnifiedRequest,
    ) -> Result<UnifiedResponse, AdapterError> {
        let wire = self.wire_request(model, request, false);
        let response = self.post_chat(credential, &wire, false).await?;
        let parsed: polygate_protocol::openai::ChatCompletion = response
            .json()
            .await
            .map_err(|err| AdapterError::network(err.to_string()))?;
        openai::response_to_unified(parsed).map_err(|err| AdapterError::network(err.to_string()))
    }

    async fn generate_stream(
        &self,
        credential: &Credential,
        model: &str,
        request: &UnifiedRequest,
    ) -> Result<DeltaStream, AdapterError> {
        let wire = self.wire_request(model, request, true);
        let response = self.post_chat(credential, &wire, true).await?;
        let mut decoder = openai::StreamDecoder::new();
        Ok(relay_body(response, move |payload| {
            Ok(decoder
                .push(payload)
                .map_err(|err| AdapterError::network(err.to_string()))?
                .into_iter()
                .collect())
        }))
    }

    async fn list_models(&self, credential: &Credential) -> Result<Vec<ModelEntry>, AdapterError> {
        let client = shared_client(self.config.outbound_proxy.as_deref())?;
        let url = format!("{}/models", self.config.base_url.trim_end_matches('/'));
        let response = client
            .get(url)
            .header(AUTHORIZATION, bearer(self.auth_token(credential)?))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|err| AdapterError::network(err.to_string()))?;
        if !response.status().is_success() {
            return Err(read_error(response).await);
        }
        let body: polygate_protocol::openai::ModelList = response
            .json()
            .await
            .map_err(|err| AdapterError::network(err.to_string()))?;
        Ok(body
            .data
            .into_iter()
            .map(|model| ModelEntry {
                id: model.id,
                display_name: None,
                created_at: Some(model.created),
            })
            .collect())
    }

    async fn exchange_token(
        &self,
        credential: &Credential,
    ) -> Result<SecretMaterial, RefreshError> {
        exchange_refresh_token(&self.config, credential).await
    }
}

// ---- Gemini-style upstream ----

pub struct GeminiApiAdapter {
    config: DirectConfig,
}

impl GeminiApiAdapter {
    pub fn new(config: DirectConfig) -> Self {
        Self { config }
    }

    fn model_url(&self, model: &str, action: &str, sse: bool) -> String {
        let base = self.config.base_url.trim_end_matches('/');
        let query = if sse { "?alt=sse" } else { "" };
        format!("{base}/v1beta/models/{model}:{action}{query}")
    }

    fn authed(
        &self,
        builder: wreq::RequestBuilder,
        credential: &Credential,
    ) -> Result<wreq::RequestBuilder, AdapterError> {
        match &credential.secret {
            SecretMaterial::ApiKey { api_key } => Ok(builder.header("x-goog-api-key", api_key)),
            SecretMaterial::Oauth { access_token, .. } => {
                Ok(builder.header(AUTHORIZATION, bearer(access_token)))
            }
            SecretMaterial::Cookie { .. } => Err(AdapterError::permanent(
                "cookie credentials cannot call the generateContent api",
            )),
        }
    }

    fn wire_request(
        &self,
        request: &UnifiedRequest,
    ) -> polygate_protocol::gemini::GenerateContentRequest {
        let (wire, warnings) = gemini::unified_to_request(request);
        for warning in warnings {
            debug!(event = "block_dropped", provider = "gemini_api", detail = %warning.0);
        }
        wire
    }
}

#[async_trait]
impl Adapter for GeminiApiAdapter {
    fn provider(&self) -> ProviderKind {
        ProviderKind::GeminiApi
    }

    async fn generate(
        &self,
        credential: &Credential,
        model: &str,
        request: &UnifiedRequest,
    ) -> Result<UnifiedResponse, AdapterError> {
        let client = shared_client(self.config.outbound_proxy.as_deref())?;
        let wire = self.wire_request(request);
        let builder = client
            .post(self.model_url(model, "generateContent", false))
            .header(CONTENT_TYPE, "application/json")
            .timeout(REQUEST_TIMEOUT);
        let response = self
            .authed(builder, credential)?
            .json(&wire)
            .send()
            .await
            .map_err(|err| AdapterError::network(err.to_string()))?;
        if !response.status().is_success() {
            return Err(read_error(response).await);
        }
        let parsed: polygate_protocol::gemini::GenerateContentResponse = response
            .json()
            .await
            .map_err(|err| AdapterError::network(err.to_string()))?;
        gemini::response_to_unified(model, parsed)
            .map_err(|err| AdapterError::network(err.to_string()))
    }

    async fn generate_stream(
        &self,
        credential: &Credential,
        model: &str,
        request: &UnifiedRequest,
    ) -> Result<DeltaStream, AdapterError> {
        let client = shared_client(self.config.outbound_proxy.as_deref())?;
        let wire = self.wire_request(request);
        let builder = client
            .post(self.model_url(model, "streamGenerateContent", true))
            .header(CONTENT_TYPE, "application/json");
        let response = self
            .authed(builder, credential)?
            .json(&wire)
            .send()
            .await
            .map_err(|err| AdapterError::network(err.to_string()))?;
        if !response.status().is_success() {
            return Err(read_error(response).await);
        }

        let mut decoder = gemini::StreamDecoder::new();
        Ok(relay_body(response, move |payload| {
            decoder
                .push(payload)
                .map_err(|err| AdapterError::network(err.to_string()))
        }))
    }

    async fn list_models(&self, credential: &Credential) -> Result<Vec<ModelEntry>, AdapterError> {
        let client = shared_client(self.config.outbound_proxy.as_deref())?;
        let url = format!(
            "{}/v1beta/models",
            self.config.base_url.trim_end_matches('/')
        );
        let response = self
            .authed(client.get(url).timeout(REQUEST_TIMEOUT), credential)?
            .send()
            .await
            .map_err(|err| AdapterError::network(err.to_string()))?;
        if !response.status().is_success() {
            return Err(read_error(response).await);
        }
        let body: polygate_protocol::gemini::ModelList = response
            .json()
            .await
            .map_err(|err| AdapterError::network(err.to_string()))?;
        Ok(body
            .models
            .into_iter()
            .map(|model| ModelEntry {
                id: model
                    .name
                    .strip_prefix("models/")
                    .unwrap_or(&model.name)
                    .to_string(),
                display_name: model.display_name,
                created_at: None,
            })
            .collect())
    }

    async fn count_tokens(
        &self,
        credential: &Credential,
        request: &UnifiedRequest,
    ) -> Result<Option<u64>, AdapterError> {
        let client = shared_client(self.config.outbound_proxy.as_deref())?;
        let wire = self.wire_request(request);
        let body = serde_json::json!({ "contents": wire.contents });
        let builder = client
            .post(self.model_url(&request.model, "countTokens", false))
            .header(CONTENT_TYPE, "application/json")
            .timeout(REQUEST_TIMEOUT);
        let response = self
            .authed(builder, credential)?
            .json(&body)
            .send()
            .await
            .map_err(|err| AdapterError::network(err.to_string()))?;
        if !response.status().is_success() {
            return Err(read_error(response).await);
        }
        let parsed: Value = response
            .json()
            .await
            .map_err(|err| AdapterError::network(err.to_string()))?;
        Ok(parsed
            .get("totalTokens")
            .and_then(|value| value.as_u64())
            .map(Some)
            .unwrap_or(None))
    }

    async fn exchange_token(
        &self,
        credential: &Credential,
    ) -> Result<SecretMaterial, RefreshError> {
        exchange_refresh_token(&self.config, credential).await
    }
}
