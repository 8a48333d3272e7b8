//! Gateway assembly: router construction and the serve loop

use std::sync::Arc;

use anyhow::Context;
use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::domain::models::{Config, Registry};
use crate::infrastructure::http::auth::{require_bearer, AuthSettings};
use crate::infrastructure::http::handlers::{handle_api, handle_health, handle_reset};
use crate::infrastructure::mcp::{Bridge, HealthMonitor, Supervisor};

/// Shared state for all routes.
#[derive(Clone)]
pub struct AppState {
    /// Request bridge (owns the supervisor)
    pub bridge: Bridge,
    /// Server used when a request does not name one
    pub default_server: Option<Arc<str>>,
    /// Bearer-token policy
    pub auth: AuthSettings,
}

/// Build the gateway router. The health endpoint stays outside the auth
/// layer; everything under `/api/v1` is gated.
pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/api/v1", post(handle_api))
        .route("/api/v1/servers/:name/reset", post(handle_reset))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_bearer,
        ));

    Router::new()
        .merge(api)
        .route("/health", get(handle_health))
        .with_state(state)
}

/// Run the gateway until SIGINT/SIGTERM, then stop managed processes.
pub async fn serve(config: Config, registry: Registry) -> anyhow::Result<()> {
    if let Some(default) = &config.default_server {
        anyhow::ensure!(
            registry.contains(default),
            "default server '{default}' is not defined in {}",
            config.config_file.display()
        );
    }
    if config.disable_auth {
        warn!("authentication is DISABLED; every API request will be accepted");
    }

    let supervisor = Supervisor::new(
        registry.clone(),
        config.supervisor.clone(),
        config.workdir.clone(),
    );
    let bridge = Bridge::new(supervisor.clone(), config.bridge.clone());

    let (shutdown_tx, _) = broadcast::channel(16);
    let monitor = HealthMonitor::new(supervisor.clone());
    for name in registry.names() {
        monitor.start_monitoring(name.to_string(), shutdown_tx.subscribe());
    }

    let state = AppState {
        bridge,
        default_server: config.default_server.clone().map(Into::into),
        auth: AuthSettings::new(config.auth_token.clone(), config.disable_auth),
    };
    let app = router(state);

    let addr = config.listen_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(
        addr = %listener.local_addr().context("listener has no local address")?,
        servers = registry.len(),
        "gateway listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server error")?;

    info!("gateway stopped; shutting down managed processes");
    let _ = shutdown_tx.send(());
    supervisor.shutdown().await;
    Ok(())
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
            Err(err) => {
                warn!(error = %err, "failed to register SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received SIGINT"),
        () = terminate => info!("received SIGTERM"),
    }
}
