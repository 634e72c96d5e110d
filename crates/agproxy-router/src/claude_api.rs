use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;

use agproxy_common::GatewayError;
use agproxy_core::{DispatchOutput, DispatchRequest};
use agproxy_protocol::claude::{CountTokensRequest, CountTokensResponse, MessagesRequest};
use agproxy_protocol::models;
use agproxy_transform::claude;
use agproxy_transform::stream_claude::{ClaudeStream, encode_sse};

use crate::RouterState;
use crate::auth::check_bearer;
use crate::error::ApiError;
use crate::openai_api::{sse_response, translate_options};

pub async fn messages(
    State(state): State<Arc<RouterState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let app = state.dispatcher.state().clone();
    let config = app.config_snapshot();
    check_bearer(&headers, &config.api_password)?;

    let request: MessagesRequest = serde_json::from_slice(&body)
        .map_err(|err| GatewayError::ClientMalformed(err.to_string()))?;
    if request.model.trim().is_empty() {
        return Err(GatewayError::ClientMalformed("model is required".to_string()).into());
    }

    let opts = translate_options(&config);
    let upstream = claude::to_upstream(&request, &app.signatures, &opts)
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
            openai_body: None,
            stream: request.stream,
        })
        .await?;

    Ok(match output {
        DispatchOutput::Upstream(response) => {
            Json(claude::from_upstream(&request.model, &response, &opts)).into_response()
        }
        DispatchOutput::UpstreamStream(mut handle) => {
            let (tx, rx) = tokio::sync::mpsc::channel::<Bytes>(32);
            let model = request.model.clone();
            let return_thoughts = opts.return_thoughts;
            tokio::spawn(async move {
                let mut serializer = ClaudeStream::new(&model, return_thoughts);
                while let Some(chunk) = handle.rx.recv().await {
                    for event in serializer.on_chunk(&chunk) {
                        if tx.send(Bytes::from(encode_sse(&event))).await.is_err() {
                            return;
                        }
                    }
                }
                for event in serializer.finish() {
                    if tx.send(Bytes::from(encode_sse(&event))).await.is_err() {
                        return;
                    }
                }
            });
            sse_response(rx)
        }
        DispatchOutput::Passthrough(bytes) => Response::builder()
            .header(axum::http::header::CONTENT_TYPE, "application/json")
            .body(axum::body::Body::from(bytes))
            .unwrap_or_else(|_| Response::new(axum::body::Body::empty())),
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

/// Local estimation only; counting never spends upstream quota.
pub async fn count_tokens(
    State(state): State<Arc<RouterState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<CountTokensResponse>, ApiError> {
    let app = state.dispatcher.state().clone();
    let config = app.config_snapshot();
    check_bearer(&headers, &config.api_password)?;

    let request: CountTokensRequest = serde_json::from_slice(&body)
        .map_err(|err| GatewayError::ClientMalformed(err.to_string()))?;
    Ok(Json(CountTokensResponse {
        input_tokens: claude::estimate_input_tokens(&request),
    }))
}
