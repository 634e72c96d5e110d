use std::sync::Arc;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::Response;
use bytes::Bytes;

use agproxy_common::GatewayError;
use agproxy_core::{DispatchOutput, DispatchRequest};
use agproxy_protocol::bridge::{ChatStreamRequest, ResponseLine};
use agproxy_protocol::models;
use agproxy_protocol::openai::ChatCompletionRequest;
use agproxy_transform::ndjson::{NdjsonStream, encode_line, reconstruct_messages};
use agproxy_transform::openai;

use crate::RouterState;
use crate::auth::check_bearer;
use crate::error::ApiError;
use crate::openai_api::{ndjson_response, translate_options};

const DEFAULT_BRIDGE_MODEL: &str = "claude-sonnet-4-5";

/// The Augment-style NDJSON bridge. Tool results come back as nodes on a
/// later request with an empty user message; the conversation store
/// supplies the matching assistant tool-use turn.
pub async fn chat_stream(
    State(state): State<Arc<RouterState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let app = state.dispatcher.state().clone();
    let config = app.config_snapshot();
    check_bearer(&headers, &config.api_password)?;

    let request: ChatStreamRequest = serde_json::from_slice(&body)
        .map_err(|err| GatewayError::ClientMalformed(err.to_string()))?;

    let conversation = request
        .conversation_id
        .clone()
        .unwrap_or_else(|| format!("conv-{}", uuid::Uuid::new_v4().simple()));

    let model = request
        .model
        .clone()
        .or_else(|| state.conversations.model_of(&conversation))
        .unwrap_or_else(|| DEFAULT_BRIDGE_MODEL.to_string());
    state.conversations.set_model(&conversation, &model);

    let messages = reconstruct_messages(&request, |id| {
        state.conversations.lookup_call(&conversation, id)
    });
    if messages.is_empty() {
        return Err(GatewayError::ClientMalformed("empty conversation".to_string()).into());
    }

    let chat_request = ChatCompletionRequest {
        model: model.clone(),
        messages,
        temperature: None,
        top_p: None,
        max_tokens: None,
        stop: None,
        stream: true,
        tools: (!request.tool_definitions.is_empty())
            .then(|| request.tool_definitions.clone()),
        tool_choice: None,
        user: None,
    };

    let opts = translate_options(&config);
    let upstream = openai::to_upstream(&chat_request, &app.signatures, &opts)
        .map_err(|err| GatewayError::ClientMalformed(err.to_string()))?;
    let resolved = models::resolve(&model);
    let upstream = agproxy_transform::context::apply_context_pressure(
        upstream,
        models::context_budget(&resolved.upstream),
    );

    let output = state
        .dispatcher
        .dispatch(DispatchRequest {
            alias: model.clone(),
            upstream,
            openai_body: None,
            stream: true,
        })
        .await?;

    let (tx, rx) = tokio::sync::mpsc::channel::<Bytes>(32);
    match output {
        DispatchOutput::UpstreamStream(mut handle) => {
            let conversations = state.clone();
            let return_thoughts = opts.return_thoughts;
            tokio::spawn(async move {
                let mut serializer = NdjsonStream::new(return_thoughts);
                while let Some(chunk) = handle.rx.recv().await {
                    for line in serializer.on_chunk(&chunk) {
                        if tx.send(Bytes::from(encode_line(&line))).await.is_err() {
                            return;
                        }
                    }
                }
                for line in serializer.finish() {
                    if tx.send(Bytes::from(encode_line(&line))).await.is_err() {
                        return;
                    }
                }
                for (id, name, args) in &serializer.issued_calls {
                    conversations
                        .conversations
                        .remember_call(&conversation, id, name, args);
                }
            });
        }
        DispatchOutput::Upstream(response) => {
            // Non-stream fallback: serialize the whole reconstruction.
            let conversations = state.clone();
            let return_thoughts = opts.return_thoughts;
            tokio::spawn(async move {
                let mut serializer = NdjsonStream::new(return_thoughts);
                let mut lines = serializer.on_chunk(&response);
                lines.extend(serializer.finish());
                for line in &lines {
                    if tx.send(Bytes::from(encode_line(line))).await.is_err() {
                        return;
                    }
                }
                for (id, name, args) in &serializer.issued_calls {
                    conversations
                        .conversations
                        .remember_call(&conversation, id, name, args);
                }
            });
        }
        DispatchOutput::Passthrough(_) | DispatchOutput::PassthroughStream(_) => {
            let _ = tx
                .send(Bytes::from(encode_line(&ResponseLine::end_turn())))
                .await;
        }
    }

    Ok(ndjson_response(rx))
}
