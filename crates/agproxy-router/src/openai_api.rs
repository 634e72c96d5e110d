use std::sync::Arc;

use axum::Json;
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use tokio_stream::wrappers::ReceiverStream;

use agproxy_core::{DispatchOutput, DispatchRequest};
use agproxy_protocol::models;
use agproxy_protocol::openai::{ChatCompletionRequest, ModelInfo, ModelList};
use agproxy_transform::stream_openai::{DONE_FRAME, OpenAiStream, encode_sse};
use agproxy_transform::{TranslateOptions, openai};

use crate::RouterState;
use crate::auth::check_bearer;
use crate::error::ApiError;

use agproxy_common::GatewayError;

pub(crate) fn sse_response(rx: tokio::sync::mpsc::Receiver<Bytes>) -> Response {
    use futures_util::StreamExt;
    let stream = ReceiverStream::new(rx).map(Ok::<Bytes, std::convert::Infallible>);
    Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

pub(crate) fn ndjson_response(rx: tokio::sync::mpsc::Receiver<Bytes>) -> Response {
    use futures_util::StreamExt;
    let stream = ReceiverStream::new(rx).map(Ok::<Bytes, std::convert::Infallible>);
    Response::builder()
        .header(header::CONTENT_TYPE, "application/x-ndjson")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

pub(crate) fn translate_options(config: &agproxy_core::GatewayConfig) -> TranslateOptions {
    TranslateOptions {
        compatibility_mode: config.compatibility_mode,
        return_thoughts: config.return_thoughts_to_frontend,
    }
}

pub async fn chat_completions(
    State(state): State<Arc<RouterState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let app = state.dispatcher.state().clone();
    let config = app.config_snapshot();
    check_bearer(&headers, &config.api_password)?;

    let raw: serde_json::Value = serde_json::from_slice(&body)
        .map_err(|err| GatewayError::ClientMalformed(err.to_string()))?;
    let request: ChatCompletionRequest = serde_json::from_value(raw.clone())
        .map_err(|err| GatewayError::ClientMalformed(err.to_string()))?;
    if request.model.trim().is_empty() {
        return Err(GatewayError::ClientMalformed("model is required".to_string()).into());
    }

    let opts = translate_options(&config);
    let upstream = openai::to_upstream(&request, &app.signatures, &opts)
        .map_err(|err| GatewayError::ClientMalformed(err.to_string()))?;
    let resolved = models::resolve(&request.model);
    let upstream = agproxy_transform::context::apply_context_pressure(
        upstream,
        models::context_budget(&resolved.upstream),
    );

    let output = state
        .dispatcher
        .dispatch(DispatchRequest {
            alias: request.model.clone(),
            upstream,
            openai_body: Some(raw),
            stream: request.stream,
        })
        .await?;

    Ok(match output {
        DispatchOutput::Upstream(response) => {
            Json(openai::from_upstream(&request.model, &response, &opts)).into_response()
        }
        DispatchOutput::UpstreamStream(mut handle) => {
            let (tx, rx) = tokio::sync::mpsc::channel::<Bytes>(32);
            let model = request.model.clone();
            let return_thoughts = opts.return_thoughts;
            tokio::spawn(async move {
                let mut serializer = OpenAiStream::new(&model, return_thoughts);
                while let Some(chunk) = handle.rx.recv().await {
                    for frame in serializer.on_chunk(&chunk) {
                        if tx.send(Bytes::from(encode_sse(&frame))).await.is_err() {
                            return;
                        }
                    }
                }
                let last = serializer.finish();
                let _ = tx.send(Bytes::from(encode_sse(&last))).await;
                let _ = tx.send(Bytes::from_static(DONE_FRAME.as_bytes())).await;
            });
            sse_response(rx)
        }
        DispatchOutput::Passthrough(bytes) => Response::builder()
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(bytes))
            .unwrap_or_else(|_| Response::new(Body::empty())),
        DispatchOutput::PassthroughStream(mut upstream_rx) => {
            let (tx, rx) = tokio::sync::mpsc::channel::<Bytes>(32);
            tokio::spawn(async move {
                while let Some(chunk) = upstream_rx.recv().await {
                    if tx.send(chunk).await.is_err() {
                        return;
                    }
                }
            });
            sse_response(rx)
        }
    })
}

pub async fn list_models(
    State(state): State<Arc<RouterState>>,
    headers: HeaderMap,
) -> Result<Json<ModelList>, ApiError> {
    let app = state.dispatcher.state().clone();
    let config = app.config_snapshot();
    check_bearer(&headers, &config.api_password)?;

    let routing = app.routing_snapshot();
    let mut ids: Vec<String> = models::UPSTREAM_MODELS
        .iter()
        .map(|m| m.to_string())
        .collect();
    ids.extend(routing.rules.keys().cloned());
    ids.sort();
    ids.dedup();

    let created = time::OffsetDateTime::now_utc().unix_timestamp();
    Ok(Json(ModelList {
        object: "list".to_string(),
        data: ids
            .into_iter()
            .map(|id| ModelInfo {
                id,
                object: "model".to_string(),
                created,
                owned_by: "antigravity".to_string(),
            })
            .collect(),
    }))
}
