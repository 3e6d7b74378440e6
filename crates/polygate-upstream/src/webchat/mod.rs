//! Reverse-engineered web-chat upstream. Not a public API: requests need a
//! browser-shaped header set, the whole conversation collapses into one user
//! message, and the reply arrives as a noisy event stream that
//! [`stream::ResponseReconstructor`] turns back into unified deltas.

pub mod prompt;
pub mod stream;

use async_trait::async_trait;
use futures_util::StreamExt;
use http::header::{ACCEPT, CONTENT_TYPE, COOKIE, ORIGIN, REFERER, USER_AGENT};
use polygate_pool::{Credential, ProviderKind, SecretMaterial};
use polygate_translate::unified::{
    Block, BlockPart, FinishReason, Role, UnifiedMessage, UnifiedRequest, UnifiedResponse,
    UnifiedUsage,
};
use serde_json::{json, Value};
use sha2::Digest;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use crate::client::{shared_client, REQUEST_TIMEOUT, STREAM_IDLE_TIMEOUT};
use crate::error::AdapterError;
use crate::{Adapter, DeltaStream, ModelEntry};

use prompt::{collapse, UploadPart};
use stream::{parse_frame, ResponseReconstructor};

/// The backend reports per-window query budgets without a total; this is the
/// observed window size.
pub const DEFAULT_QUERY_ALLOWANCE: u64 = 80;

const BROWSER_UA: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                          (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";
const CLIENT_HINT_UA: &str =
    "\"Google Chrome\";v=\"131\", \"Chromium\";v=\"131\", \"Not_A Brand\";v=\"24\"";

const DEFAULT_MODELS: &[&str] = &["grok-4", "grok-3", "grok-3-mini"];

#[derive(Debug, Clone)]
pub struct WebchatConfig {
    pub base_url: String,
    /// Base for scheme-less media URLs in responses.
    pub asset_base_url: String,
    pub outbound_proxy: Option<String>,
}

impl WebchatConfig {
    pub fn new(base_url: impl Into<String>, asset_base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            asset_base_url: asset_base_url.into(),
            outbound_proxy: None,
        }
    }
}

pub struct WebchatAdapter {
    config: WebchatConfig,
}

impl WebchatAdapter {
    pub fn new(config: WebchatConfig) -> Self {
        Self { config }
    }

    fn cookie_header(credential: &Credential) -> Result<String, AdapterError> {
        let SecretMaterial::Cookie {
            session_token,
            cf_clearance,
        } = &credential.secret
        else {
            return Err(AdapterError::permanent(
                "webchat requires a cookie credential",
            ));
        };
        let mut cookie = format!("sso={session_token}; sso-rw={session_token}");
        if let Some(clearance) = cf_clearance {
            cookie.push_str(&format!("; cf_clearance={clearance}"));
        }
        Ok(cookie)
    }

    /// Browser-shaped request: cookie pair, pinned UA with matching client
    /// hints, and a request id derived from the payload so retries replay
    /// identically.
    fn browser_request(
        &self,
        url: String,
        credential: &Credential,
        request_id: &str,
    ) -> Result<wreq::RequestBuilder, AdapterError> {
        let client = shared_client(self.config.outbound_proxy.as_deref())?;
        let base = self.config.base_url.trim_end_matches('/');
        Ok(client
            .post(url)
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "*/*")
            .header(COOKIE, Self::cookie_header(credential)?)
            .header(USER_AGENT, BROWSER_UA)
            .header("sec-ch-ua", CLIENT_HINT_UA)
            .header("sec-ch-ua-mobile", "?0")
            .header("sec-ch-ua-platform", "\"Windows\"")
            .header(ORIGIN, base)
            .header(REFERER, format!("{base}/"))
            .header("x-request-id", request_id))
    }

    async fn upload_attachment(
        &self,
        credential: &Credential,
        request_id: &str,
        part: &UploadPart,
    ) -> Result<String, AdapterError> {
        let url = format!("{}/upload-file", self.config.base_url.trim_end_matches('/'));
        let payload = json!({
            "fileName": part.file_name,
            "fileMimeType": part.mime_type,
            "content": part.content,
        });
        let response = self
            .browser_request(url, credential, request_id)?
            .timeout(REQUEST_TIMEOUT)
            .json(&payload)
            .send()
            .await
            .map_err(|err| AdapterError::network(err.to_string()))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.bytes().await.unwrap_or_default();
            return Err(AdapterError::from_status(
                status,
                String::from_utf8_lossy(&body).to_string(),
            ));
        }
        let parsed: Value = response
            .json()
            .await
            .map_err(|err| AdapterError::network(err.to_string()))?;
        parsed
            .get("fileMetadataId")
            .and_then(|value| value.as_str())
            .map(|value| value.to_string())
            .ok_or_else(|| AdapterError::network("upload response missing fileMetadataId"))
    }

    async fn open_stream(
        &self,
        credential: &Credential,
        model: &str,
        request: &UnifiedRequest,
    ) -> Result<wreq::Response, AdapterError> {
        let collapsed = collapse(request);
        let request_id = derive_request_id(credential, model, &collapsed.prompt);

        let mut attachment_ids = Vec::new();
        for part in &collapsed.attachments {
            attachment_ids.push(
                self.upload_attachment(credential, &request_id, part)
                    .await?,
            );
        }

        let url = format!(
            "{}/conversations/new",
            self.config.base_url.trim_end_matches('/')
        );
        let payload = json!({
            "temporary": true,
            "modelName": model,
            "message": collapsed.prompt,
            "fileAttachments": attachment_ids,
            "returnRawGrokInXaiRequest": false,
            "sendFinalMetadata": true,
        });
        debug!(
            event = "webchat_request",
            model = %model,
            attachments = attachment_ids.len(),
            request_id = %request_id
        );

        let response = self
            .browser_request(url, credential, &request_id)?
            .json(&payload)
            .send()
            .await
            .map_err(|err| AdapterError::network(err.to_string()))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.bytes().await.unwrap_or_default();
            return Err(AdapterError::from_status(
                status,
                String::from_utf8_lossy(&body).to_string(),
            ));
        }
        Ok(response)
    }
}

#[async_trait]
impl Adapter for WebchatAdapter {
    fn provider(&self) -> ProviderKind {
        ProviderKind::Webchat
    }

    async fn generate(
        &self,
        credential: &Credential,
        model: &str,
        request: &UnifiedRequest,
    ) -> Result<UnifiedResponse, AdapterError> {
        let mut stream = self.generate_stream(credential, model, request).await?;

        let mut content = String::new();
        let mut reasoning = String::new();
        let mut blocks: Vec<Block> = Vec::new();
        let mut finish = FinishReason::Stop;
        let mut usage = UnifiedUsage::default();
        while let Some(delta) = stream.next().await {
            let delta = delta?;
            if let Some(text) = delta.content {
                content.push_str(&text);
            }
            if let Some(text) = delta.reasoning {
                reasoning.push_str(&text);
            }
            for call in delta.tool_calls {
                blocks.push(Block::new(BlockPart::ToolUse {
                    id: call.id.unwrap_or_default(),
                    name: call.name.unwrap_or_default(),
                    arguments: call.arguments,
                }));
            }
            if let Some(reason) = delta.finish_reason {
                finish = reason;
            }
            if let Some(measured) = delta.usage {
                usage = measured;
            }
        }

        let mut message_blocks = Vec::new();
        if !reasoning.is_empty() {
            message_blocks.push(Block::new(BlockPart::Thinking {
                text: reasoning,
                signature: None,
            }));
        }
        if !content.is_empty() {
            message_blocks.push(Block::text(content));
        }
        message_blocks.extend(blocks);

        Ok(UnifiedResponse {
            id: format!("chat-{}", uuid::Uuid::new_v4().simple()),
            model: model.to_string(),
            message: UnifiedMessage::new(Role::Assistant, message_blocks),
            finish_reason: finish,
            usage,
        })
    }

    async fn generate_stream(
        &self,
        credential: &Credential,
        model: &str,
        request: &UnifiedRequest,
    ) -> Result<DeltaStream, AdapterError> {
        let response = self.open_stream(credential, model, request).await?;
        let asset_base = self.config.asset_base_url.clone();

        let (tx, rx) = tokio::sync::mpsc::channel::<Result<_, AdapterError>>(32);
        tokio::spawn(async move {
            // Reconstruction state lives and dies with this task.
            let mut state = ResponseReconstructor::new(asset_base);
            let mut body = response.bytes_stream();
            let mut decoder = polygate_protocol::sse::WireDecoder::new();

            'read: loop {
                let next = tokio::time::timeout(STREAM_IDLE_TIMEOUT, body.next()).await;
                let chunk = match next {
                    Err(_) => {
                        let _ = tx.send(Err(AdapterError::timeout("webchat stream"))).await;
                        return;
                    }
                    Ok(None) => break,
                    Ok(Some(Err(err))) => {
                        let _ = tx.send(Err(AdapterError::network(err.to_string()))).await;
                        return;
                    }
                    Ok(Some(Ok(chunk))) => chunk,
                };
                for payload in decoder.push(&chunk) {
                    let Some(event) = parse_frame(&payload) else {
                        continue;
                    };
                    for delta in state.push_event(event) {
                        if tx.send(Ok(delta)).await.is_err() {
                            // Client went away; drop state and abort the read.
                            return;
                        }
                    }
                    if state.is_finished() {
                        break 'read;
                    }
                }
            }

            // Upstream closed without a finalisation marker.
            if !state.is_finished() {
                let _ = tx.send(Ok(state.terminal_delta())).await;
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn list_models(
        &self,
        _credential: &Credential,
    ) -> Result<Vec<ModelEntry>, AdapterError> {
        Ok(DEFAULT_MODELS
            .iter()
            .map(|id| ModelEntry {
                id: (*id).to_string(),
                display_name: None,
                created_at: None,
            })
            .collect())
    }

    async fn usage_limits(&self, credential: &Credential) -> Result<Value, AdapterError> {
        let url = format!("{}/rate-limits", self.config.base_url.trim_end_matches('/'));
        let request_id = derive_request_id(credential, "rate-limits", "");
        let response = self
            .browser_request(url, credential, &request_id)?
            .timeout(REQUEST_TIMEOUT)
            .json(&json!({ "requestKind": "DEFAULT" }))
            .send()
            .await
            .map_err(|err| AdapterError::network(err.to_string()))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.bytes().await.unwrap_or_default();
            return Err(AdapterError::from_status(
                status,
                String::from_utf8_lossy(&body).to_string(),
            ));
        }
        let mut parsed: Value = response
            .json()
            .await
            .map_err(|err| AdapterError::network(err.to_string()))?;
        if let Some(map) = parsed.as_object_mut() {
            map.entry("totalQueries")
                .or_insert_with(|| json!(DEFAULT_QUERY_ALLOWANCE));
        }
        Ok(parsed)
    }
}

/// Request id derived from the credential and payload: stable across replays
/// of the same turn, distinct across turns.
fn derive_request_id(credential: &Credential, model: &str, prompt: &str) -> String {
    let mut digest = sha2::Sha256::new();
    digest.update(credential.uuid.as_bytes());
    digest.update(model.as_bytes());
    digest.update(prompt.as_bytes());
    let bytes = digest.finalize();
    let mut raw = [0u8; 16];
    raw.copy_from_slice(&bytes[..16]);
    uuid::Builder::from_random_bytes(raw).into_uuid().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_id_is_deterministic_per_payload() {
        let credential = Credential::new(SecretMaterial::Cookie {
            session_token: "tok".to_string(),
            cf_clearance: None,
        });
        let a = derive_request_id(&credential, "grok-4", "hello");
        let b = derive_request_id(&credential, "grok-4", "hello");
        let c = derive_request_id(&credential, "grok-4", "other");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(uuid::Uuid::parse_str(&a).is_ok());
    }

    #[test]
    fn cookie_header_carries_the_pair() {
        let credential = Credential::new(SecretMaterial::Cookie {
            session_token: "tok".to_string(),
            cf_clearance: Some("cf".to_string()),
        });
        let header = WebchatAdapter::cookie_header(&credential).unwrap();
        assert_eq!(header, "sso=tok; sso-rw=tok; cf_clearance=cf");
    }

    #[test]
    fn api_key_credentials_are_rejected() {
        let credential = Credential::new(SecretMaterial::ApiKey {
            api_key: "k".to_string(),
        });
        assert!(WebchatAdapter::cookie_header(&credential).is_err());
    }
}
