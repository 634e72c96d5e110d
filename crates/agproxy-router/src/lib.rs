//! HTTP surface: the three dialect families plus the NDJSON bridge.

mod auth;
mod bridge_api;
mod claude_api;
mod convo;
mod error;
mod gemini_api;
mod openai_api;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};

use agproxy_core::Dispatcher;

pub use convo::ConversationStore;

/// Everything the handlers need.
pub struct RouterState {
    pub dispatcher: Dispatcher,
    pub conversations: ConversationStore,
}

impl RouterState {
    pub fn new(dispatcher: Dispatcher) -> Arc<Self> {
        Arc::new(Self {
            dispatcher,
            conversations: ConversationStore::default(),
        })
    }
}

pub fn proxy_router(state: Arc<RouterState>) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(openai_api::chat_completions))
        .route("/v1/models", get(openai_api::list_models))
        .route("/models", get(openai_api::list_models))
        .route("/v1/messages", post(claude_api::messages))
        .route(
            "/v1/messages/count_tokens",
            post(claude_api::count_tokens),
        )
        .route(
            "/v1beta/models/{model_and_op}",
            post(gemini_api::generate_dispatch),
        )
        .route("/chat-stream", post(bridge_api::chat_stream))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(state)
}
