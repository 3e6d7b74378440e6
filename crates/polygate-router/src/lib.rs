//! HTTP ingress: dialect endpoints, the shared auth gate, and per-dialect
//! SSE framing of unified delta streams.

mod sse;

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use bytes::Bytes;
use futures_util::StreamExt;
use polygate_core::{Engine, EngineReply, GatewayError};
use polygate_pool::ProviderKind;
use polygate_protocol::error::WireError;
use polygate_upstream::{DeltaStream, ModelEntry};
use polygate_translate::unified::UnifiedRequest;
use polygate_translate::{anthropic, gemini, openai, Dialect};
use tokio_stream::wrappers::ReceiverStream;
use tracing::info;

use sse::{wrap_with_heartbeat, DialectFramer};

#[derive(Clone)]
pub struct GatewayState {
    pub engine: Arc<Engine>,
}

pub fn gateway_router(engine: Arc<Engine>) -> Router {
    let state = GatewayState { engine };
    Router::new()
        .route("/v1/chat/completions", post(openai_chat))
        .route("/v1/messages", post(anthropic_messages))
        .route("/v1/messages/count_tokens", post(anthropic_count_tokens))
        .route("/v1/models", get(models_list_v1))
        .route("/v1/models/{model}", get(models_get_v1))
        .route("/v1beta/models", get(gemini_models_list))
        .route(
            "/v1beta/models/{*rest}",
            post(gemini_generate).get(gemini_models_get),
        )
        .with_state(state)
}

fn error_response(err: GatewayError) -> Response {
    let body = serde_json::to_vec(&err.body).unwrap_or_default();
    json_response(err.status, body.into())
}

fn json_response(status: StatusCode, body: Bytes) -> Response {
    let mut resp = Response::new(Body::from(body));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    resp
}

fn authenticate(state: &GatewayState, headers: &HeaderMap) -> Result<(), GatewayError> {
    if state.engine.state().auth.authenticate(headers) {
        Ok(())
    } else {
        Err(GatewayError::unauthorized())
    }
}

fn trace_id() -> String {
    uuid::Uuid::now_v7().to_string()
}

fn with_trace_id(mut resp: Response, trace_id: &str) -> Response {
    if let Ok(value) = HeaderValue::from_str(trace_id) {
        resp.headers_mut().insert("x-polygate-request-id", value);
    }
    resp
}

async fn dispatch(
    state: &GatewayState,
    unified: UnifiedRequest,
    dialect: Dialect,
    trace_id: &str,
) -> Result<Response, GatewayError> {
    let model = unified.model.clone();
    let streaming = unified.stream;
    info!(
        event = "request_received",
        trace_id = %trace_id,
        dialect = %dialect,
        model = %model,
        stream = streaming
    );

    match state.engine.execute(unified, dialect).await? {
        EngineReply::Completion(response) => {
            let body = match dialect {
                Dialect::OpenAi => serde_json::to_vec(&openai::unified_to_response(&response)),
                Dialect::Anthropic => {
                    serde_json::to_vec(&anthropic::unified_to_response(&response))
                }
                Dialect::Gemini => serde_json::to_vec(&gemini::unified_to_response(&response)),
            }
            .map_err(|err| GatewayError::bad_request(err.to_string()))?;
            Ok(json_response(StatusCode::OK, body.into()))
        }
        EngineReply::Stream(deltas) => {
            Ok(stream_response(dialect, &model, deltas))
        }
    }
}

/// Pipes the unified delta stream through the dialect framer into the
/// response body. The client response is a sink: when it goes away the
/// receiver drops and cancellation propagates up through the engine.
fn stream_response(dialect: Dialect, model: &str, mut deltas: DeltaStream) -> Response {
    let mut framer = DialectFramer::new(dialect, model);
    let (tx, rx) = tokio::sync::mpsc::channel::<Bytes>(32);

    tokio::spawn(async move {
        while let Some(item) = deltas.next().await {
            let frames = match item {
                Ok(delta) => framer.frame(&delta),
                Err(err) => framer.frame_error(&err.to_string()),
            };
            for frame in frames {
                if tx.send(frame).await.is_err() {
                    return;
                }
            }
        }
        for frame in framer.finish() {
            if tx.send(frame).await.is_err() {
                return;
            }
        }
    });

    let rx = if dialect == Dialect::Gemini {
        rx
    } else {
        wrap_with_heartbeat(rx)
    };
    let stream = ReceiverStream::new(rx).map(Ok::<_, Infallible>);

    let mut resp = Response::new(Body::from_stream(stream));
    let content_type = match dialect {
        Dialect::Gemini => "application/json",
        _ => "text/event-stream",
    };
    resp.headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    if dialect != Dialect::Gemini {
        resp.headers_mut()
            .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        // Hint reverse proxies not to buffer the event stream.
        resp.headers_mut()
            .insert("x-accel-buffering", HeaderValue::from_static("no"));
    }
    resp
}

async fn openai_chat(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let trace = trace_id();
    let result = async {
        authenticate(&state, &headers)?;
        let wire: polygate_protocol::openai::ChatCompletionRequest = serde_json::from_slice(&body)
            .map_err(|err| GatewayError::bad_request(format!("invalid request body: {err}")))?;
        let unified = openai::request_to_unified(wire)?;
        dispatch(&state, unified, Dialect::OpenAi, &trace).await
    }
    .await;
    with_trace_id(result.unwrap_or_else(error_response), &trace)
}

async fn anthropic_messages(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let trace = trace_id();
    let result = async {
        authenticate(&state, &headers)?;
        let wire: polygate_protocol::anthropic::MessagesRequest = serde_json::from_slice(&body)
            .map_err(|err| GatewayError::bad_request(format!("invalid request body: {err}")))?;
        let unified = anthropic::request_to_unified(wire)?;
        dispatch(&state, unified, Dialect::Anthropic, &trace).await
    }
    .await;
    with_trace_id(result.unwrap_or_else(error_response), &trace)
}

async fn anthropic_count_tokens(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let result = async {
        authenticate(&state, &headers)?;
        let wire: polygate_protocol::anthropic::CountTokensRequest = serde_json::from_slice(&body)
            .map_err(|err| GatewayError::bad_request(format!("invalid request body: {err}")))?;
        let unified = anthropic::count_tokens_to_unified(wire)?;
        let input_tokens = state.engine.count_tokens(&unified).await;
        let body = serde_json::to_vec(&polygate_protocol::anthropic::CountTokensResponse {
            input_tokens,
        })
        .map_err(|err| GatewayError::bad_request(err.to_string()))?;
        Ok(json_response(StatusCode::OK, body.into()))
    }
    .await;
    result.unwrap_or_else(error_response)
}

async fn gemini_generate(
    State(state): State<GatewayState>,
    Path(rest): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let trace = trace_id();
    let result = async {
        authenticate(&state, &headers)?;
        let (model, action) = rest
            .rsplit_once(':')
            .ok_or_else(|| GatewayError::bad_request("missing model action"))?;
        let streaming = match action {
            "generateContent" => false,
            "streamGenerateContent" => true,
            other => {
                return Err(GatewayError::bad_request(format!(
                    "unknown action {other:?}"
                )))
            }
        };
        let wire: polygate_protocol::gemini::GenerateContentRequest = serde_json::from_slice(&body)
            .map_err(|err| GatewayError::bad_request(format!("invalid request body: {err}")))?;
        let mut unified = gemini::request_to_unified(model, wire)?;
        unified.stream = streaming;
        dispatch(&state, unified, Dialect::Gemini, &trace).await
    }
    .await;
    with_trace_id(result.unwrap_or_else(error_response), &trace)
}

async fn models_list_v1(State(state): State<GatewayState>, headers: HeaderMap) -> Response {
    let result = async {
        authenticate(&state, &headers)?;
        let models = state.engine.list_models().await;
        // The /v1/models path is shared; the anthropic-version header marks
        // Anthropic-dialect clients.
        let body = if headers.contains_key("anthropic-version") {
            serde_json::to_vec(&anthropic_model_list(&models))
        } else {
            serde_json::to_vec(&openai_model_list(&models))
        }
        .map_err(|err| GatewayError::bad_request(err.to_string()))?;
        Ok(json_response(StatusCode::OK, body.into()))
    }
    .await;
    result.unwrap_or_else(error_response)
}

async fn models_get_v1(
    State(state): State<GatewayState>,
    Path(model): Path<String>,
    headers: HeaderMap,
) -> Response {
    let result = async {
        authenticate(&state, &headers)?;
        let models = state.engine.list_models().await;
        let Some((_, entry)) = models.iter().find(|(_, entry)| entry.id == model) else {
            return Ok(json_response(
                StatusCode::NOT_FOUND,
                serde_json::to_vec(&WireError::invalid_request(format!(
                    "model {model:?} not found"
                )))
                .unwrap_or_default()
                .into(),
            ));
        };
        let body = serde_json::to_vec(&polygate_protocol::openai::Model::new(
            entry.id.clone(),
            entry.created_at.unwrap_or(0),
            "polygate",
        ))
        .map_err(|err| GatewayError::bad_request(err.to_string()))?;
        Ok(json_response(StatusCode::OK, body.into()))
    }
    .await;
    result.unwrap_or_else(error_response)
}

async fn gemini_models_list(State(state): State<GatewayState>, headers: HeaderMap) -> Response {
    let result = async {
        authenticate(&state, &headers)?;
        let models = state.engine.list_models().await;
        let body = serde_json::to_vec(&gemini_model_list(&models))
            .map_err(|err| GatewayError::bad_request(err.to_string()))?;
        Ok(json_response(StatusCode::OK, body.into()))
    }
    .await;
    result.unwrap_or_else(error_response)
}

async fn gemini_models_get(
    State(state): State<GatewayState>,
    Path(rest): Path<String>,
    headers: HeaderMap,
) -> Response {
    let result = async {
        authenticate(&state, &headers)?;
        let models = state.engine.list_models().await;
        let wanted = rest.trim_start_matches("models/");
        let Some((_, entry)) = models.iter().find(|(_, entry)| entry.id == wanted) else {
            return Ok(json_response(
                StatusCode::NOT_FOUND,
                serde_json::to_vec(&WireError::invalid_request(format!(
                    "model {wanted:?} not found"
                )))
                .unwrap_or_default()
                .into(),
            ));
        };
        let body = serde_json::to_vec(&polygate_protocol::gemini::ModelInfo {
            name: format!("models/{}", entry.id),
            display_name: entry.display_name.clone(),
            description: None,
            supported_generation_methods: Some(vec![
                "generateContent".to_string(),
                "streamGenerateContent".to_string(),
            ]),
        })
        .map_err(|err| GatewayError::bad_request(err.to_string()))?;
        Ok(json_response(StatusCode::OK, body.into()))
    }
    .await;
    result.unwrap_or_else(error_response)
}

type ProviderModels = [(ProviderKind, ModelEntry)];

fn openai_model_list(models: &ProviderModels) -> polygate_protocol::openai::ModelList {
    polygate_protocol::openai::ModelList {
        object: "list".to_string(),
        data: models
            .iter()
            .map(|(provider, entry)| polygate_protocol::openai::Model {
                id: entry.id.clone(),
                object: "model".to_string(),
                created: entry.created_at.unwrap_or(0),
                owned_by: provider.as_str().to_string(),
            })
            .collect(),
    }
}

fn anthropic_model_list(models: &ProviderModels) -> polygate_protocol::anthropic::ModelList {
    let data: Vec<_> = models
        .iter()
        .map(|(_, entry)| polygate_protocol::anthropic::ModelInfo {
            id: entry.id.clone(),
            kind: "model".to_string(),
            display_name: entry.display_name.clone(),
            created_at: None,
        })
        .collect();
    polygate_protocol::anthropic::ModelList {
        first_id: data.first().map(|model| model.id.clone()),
        last_id: data.last().map(|model| model.id.clone()),
        has_more: false,
        data,
    }
}

fn gemini_model_list(models: &ProviderModels) -> polygate_protocol::gemini::ModelList {
    polygate_protocol::gemini::ModelList {
        models: models
            .iter()
            .map(|(_, entry)| polygate_protocol::gemini::ModelInfo {
                name: format!("models/{}", entry.id),
                display_name: entry.display_name.clone(),
                description: None,
                supported_generation_methods: Some(vec![
                    "generateContent".to_string(),
                    "streamGenerateContent".to_string(),
                ]),
            })
            .collect(),
        next_page_token: None,
    }
}
