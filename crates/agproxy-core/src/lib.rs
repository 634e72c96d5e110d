//! Gateway core: effective configuration, routing rules, the dispatcher
//! with its fallback chain, the upstream HTTP client seam, and the
//! background maintenance loops.

pub mod background;
pub mod config;
pub mod dispatch;
pub mod limit;
pub mod oauth;
pub mod state;
pub mod stats;
pub mod upstream;

pub use background::{BackgroundLoops, stop_channel};
pub use config::{BackendConfig, GatewayConfig, RoutingRule, RoutingTable};
pub use dispatch::{DispatchOutput, DispatchRequest, Dispatcher, StreamHandle};
pub use state::AppState;
pub use upstream::{
    HttpBody, HttpRequest, HttpResponse, TransportError, TransportErrorKind, UpstreamClient,
    WreqClient,
};
