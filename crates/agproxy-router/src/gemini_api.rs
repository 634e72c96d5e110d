use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;

use agproxy_common::GatewayError;
use agproxy_core::{DispatchOutput, DispatchRequest};
use agproxy_protocol::gemini::GenerateContentRequest;
use agproxy_protocol::models;
use agproxy_transform::gemini;

use crate::RouterState;
use crate::auth::check_bearer;
use crate::error::ApiError;
use crate::openai_api::sse_response;

/// `/v1beta/models/{model}:generateContent` and
/// `{model}:streamGenerateContent`. axum can't split on `:`, so the
/// path segment carries both the model and the operation.
pub async fn generate_dispatch(
    State(state): State<Arc<RouterState>>,
    Path(model_and_op): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let (model, op) = model_and_op.split_once(':').ok_or_else(|| {
        GatewayError::ClientMalformed("expected models/{model}:{operation}".to_string())
    })?;
    let stream = match op {
        "generateContent" => false,
        "streamGenerateContent" => true,
        other => {
            return Err(
                GatewayError::ClientMalformed(format!("unsupported operation {other}")).into(),
            );
        }
    };

    let app = state.dispatcher.state().clone();
    let config = app.config_snapshot();
    check_bearer(&headers, &config.api_password)?;

    let request: GenerateContentRequest = serde_json::from_slice(&body)
        .map_err(|err| GatewayError::ClientMalformed(err.to_string()))?;
    let resolved = models::resolve(model);
    let upstream = gemini::to_upstream(request, &resolved)
        .map_err(|err| GatewayError::ClientMalformed(err.to_string()))?;
    let upstream = agproxy_transform::context::apply_context_pressure(
        upstream,
        models::context_budget(&resolved.upstream),
    );

    let output = state
        .dispatcher
        .dispatch(DispatchRequest {
            alias: model.to_string(),
            upstream,
            openai_body: None,
            stream,
        })
        .await?;

    Ok(match output {
        DispatchOutput::Upstream(response) => Json(response).into_response(),
        DispatchOutput::UpstreamStream(mut handle) => {
            let (tx, rx) = tokio::sync::mpsc::channel::<Bytes>(32);
            tokio::spawn(async move {
                while let Some(chunk) = handle.rx.recv().await {
                    let Ok(json) = serde_json::to_string(&chunk) else {
                        continue;
                    };
                    if tx.send(Bytes::from(format!("data: {json}\n\n"))).await.is_err() {
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
