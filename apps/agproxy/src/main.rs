use std::collections::HashMap;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};

use agproxy_common::CredentialKind;
use agproxy_core::background::BackgroundLoops;
use agproxy_core::config::parse_routing_yaml;
use agproxy_core::{AppState, Dispatcher, GatewayConfig, RoutingTable, WreqClient};
use agproxy_pool::{FileStore, Storage};
use agproxy_router::RouterState;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "agproxy", about = "Multi-protocol gateway for the Antigravity backend")]
struct Cli {
    #[arg(long, env = "HOST")]
    host: Option<String>,

    #[arg(long, env = "PORT")]
    port: Option<u16>,

    #[arg(long, env = "CREDENTIALS_DIR")]
    credentials_dir: Option<String>,

    /// Gateway YAML with backend definitions and model routes.
    #[arg(long, env = "GATEWAY_CONFIG")]
    config: Option<String>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(%err, "failed to start runtime");
            return ExitCode::from(1);
        }
    };
    runtime.block_on(run())
}

async fn run() -> ExitCode {
    let cli = Cli::parse();
    let env: HashMap<String, String> = std::env::vars().collect();

    // Storage first: the persisted config namespace feeds the snapshot.
    let creds_dir = cli
        .credentials_dir
        .clone()
        .or_else(|| env.get("CREDENTIALS_DIR").cloned())
        .unwrap_or_else(|| "./creds".to_string());
    if let Err(err) = std::fs::create_dir_all(&creds_dir) {
        error!(dir = %creds_dir, %err, "credentials dir is not writable");
        return ExitCode::from(1);
    }
    let storage: Arc<dyn Storage> = Arc::new(FileStore::new(&creds_dir));

    let persisted = match load_persisted_config(&storage).await {
        Ok(persisted) => persisted,
        Err(err) => {
            error!(%err, "persistence unusable at startup");
            return ExitCode::from(2);
        }
    };

    let mut config = GatewayConfig::load(&env, &persisted);
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    config.credentials_dir = creds_dir;

    let routing = match load_routing(&cli.config, &env, &config) {
        Ok(routing) => routing,
        Err(err) => {
            error!(%err, "gateway config invalid");
            return ExitCode::from(1);
        }
    };

    let state = AppState::new(config.clone(), routing, storage);
    match state.pool.load(CredentialKind::Antigravity).await {
        Ok(count) => info!(count, "antigravity credentials loaded"),
        Err(err) => error!(%err, "credential load failed; starting with an empty pool"),
    }
    if let Ok(count) = state.pool.load(CredentialKind::Standard).await {
        info!(count, "standard credentials loaded");
    }

    let client: Arc<dyn agproxy_core::UpstreamClient> =
        match WreqClient::new(config.proxy.as_deref()) {
            Ok(client) => Arc::new(client),
            Err(err) => {
                error!(%err, "http client init failed");
                return ExitCode::from(1);
            }
        };

    let (stop_tx, stop_rx) = agproxy_core::stop_channel();
    BackgroundLoops::new(state.clone(), client.clone(), stop_rx).spawn();

    let dispatcher = Dispatcher::new(state.clone(), client);
    let router_state = RouterState::new(dispatcher);
    let app = agproxy_router::proxy_router(router_state);

    let bind = format!("{}:{}", config.host, config.port);
    let listener = match tokio::net::TcpListener::bind(&bind).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(%bind, %err, "port bind failed");
            return ExitCode::from(1);
        }
    };
    info!(%bind, "listening");

    let (drain_tx, drain_rx) = tokio::sync::oneshot::channel::<()>();
    let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
        shutdown_signal().await;
        let _ = drain_tx.send(());
    });

    // Drain in-flight requests up to the grace window, then force-close.
    let result = tokio::select! {
        result = serve => result,
        _ = async {
            let _ = drain_rx.await;
            tokio::time::sleep(SHUTDOWN_GRACE).await;
        } => {
            info!("grace window elapsed; forcing shutdown");
            Ok(())
        }
    };

    let _ = stop_tx.send(true);

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "server error");
            ExitCode::from(1)
        }
    }
}

async fn load_persisted_config(
    storage: &Arc<dyn Storage>,
) -> Result<HashMap<String, serde_json::Value>, agproxy_pool::StorageError> {
    let mut persisted = HashMap::new();
    // Free-form typed entries live one file per key; the snapshot only
    // needs the ones that mirror env keys, probed lazily.
    for key in [
        "api_password",
        "panel_password",
        "host",
        "port",
        "compatibility_mode",
        "return_thoughts_to_frontend",
        "auto_ban",
        "auto_ban_error_codes",
    ] {
        if let Some(value) = storage.get_config(key).await? {
            persisted.insert(key.to_string(), value);
        }
    }
    Ok(persisted)
}

fn load_routing(
    path: &Option<String>,
    env: &HashMap<String, String>,
    config: &GatewayConfig,
) -> Result<RoutingTable, anyhow::Error> {
    let path = match path {
        Some(path) => path.clone(),
        None => {
            let default = "config/gateway.yaml".to_string();
            if !std::path::Path::new(&default).exists() {
                let mut table = RoutingTable::default();
                table.backends.insert(
                    "antigravity".to_string(),
                    agproxy_core::BackendConfig::antigravity_default(
                        config.antigravity_api_url.as_deref(),
                    ),
                );
                return Ok(table);
            }
            default
        }
    };
    let yaml = std::fs::read_to_string(&path)?;
    let table = parse_routing_yaml(&yaml, env).map_err(|err| anyhow::anyhow!(err.to_string()))?;
    Ok(table)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
