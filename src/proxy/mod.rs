use crate::config::Config;
use anyhow::{Context, Result};
use axum::extract::{Request, State};
use axum::response::Response;
use axum::Router;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

pub mod enforce;
pub mod error;
pub mod metrics;
pub mod mux;
pub mod params;
pub mod prom;
pub mod response;
pub mod routes;
pub mod silences;
pub mod tenant;
pub mod upstream;

use prom::ProxyMetrics;
use routes::Routes;

pub async fn run(config: Config) -> Result<()> {
    let proxy_metrics = ProxyMetrics::new();

    // Route-table construction validates the whole configuration; any
    // overlap or bad passthrough path aborts startup here.
    let routes = Arc::new(Routes::new(&config, proxy_metrics.clone())?);

    if let Some(ref obs) = config.observability {
        if let Some(ref listen) = obs.metrics_listen {
            let _metrics_handle = metrics::spawn(listen, proxy_metrics.clone()).await?;
            info!(addr = %listen, "metrics server started");
        }
    }

    let listener = TcpListener::bind(&config.proxy.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.proxy.listen))?;
    info!(
        listen = %config.proxy.listen,
        upstream = %config.proxy.upstream,
        label = %config.tenant.label,
        "proxy listening"
    );

    // All routing happens in the strict mux; axum only hosts the connection
    // handling, so everything lands in the fallback service.
    let app = Router::new().fallback(dispatch).with_state(routes);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn dispatch(State(routes): State<Arc<Routes>>, req: Request) -> Response {
    routes.serve(req).await
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(err) => {
                tracing::error!(error = %err, "failed to install SIGTERM handler");
                tokio::signal::ctrl_c().await.ok();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM, shutting down");
            }
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
        info!("received shutdown signal");
    }
}
