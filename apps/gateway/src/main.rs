use std::path::Path;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lfsx_gateway::config::Config;
use lfsx_gateway::gateway::VncGateway;
use lfsx_gateway::kuber::Kuber;
use lfsx_gateway::{routes, AppState};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() {
    // Load .env file (silently skip if missing — env vars may be set externally)
    if dotenvy::dotenv().is_err() {
        let env_path = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
        let _ = dotenvy::from_path(env_path);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Arc::new(Config::from_env(VERSION));
    let cancel = CancellationToken::new();

    let kuber = if config.dev.bypasses_cluster() {
        tracing::info!("static backend addresses configured, not creating a cluster client");
        None
    } else {
        let kuber = Arc::new(
            Kuber::new(config.clone())
                .await
                .expect("failed to create kubernetes client"),
        );

        // Warm-pool upkeep, and one placeholder right away: the initial
        // image pull takes long.
        tokio::spawn(kuber.clone().run_maintenance(cancel.clone()));
        let startup = kuber.clone();
        tokio::spawn(async move { startup.ensure_placeholder().await });

        Some(kuber)
    };

    if config.dev.dev_server {
        tracing::debug!(
            port = config.dev.dev_server_port,
            "frontend assets are expected from the development server"
        );
    }

    let gateway = VncGateway::new(config.clone(), kuber, cancel.clone());
    let state = AppState {
        config: config.clone(),
        gateway,
    };

    let addr = config.listen_addr();
    tracing::info!(%addr, version = VERSION, production = config.production, "gateway listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind");
    axum::serve(listener, routes::router(state))
        .await
        .expect("server error");
}
