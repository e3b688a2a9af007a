//! Token router
//!
//! Single-binary service that:
//! 1. Loads the credential pool from disk
//! 2. Keeps it healthy with a periodic upstream check
//! 3. Serves the admin API for pool management and routing dry-runs
//! 4. Exposes Prometheus metrics

mod admin;
mod config;
mod error;
mod metrics;

use anyhow::{Context, Result};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use token_pool::PoolManager;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use upstream::{HttpUpstream, Upstream};

use crate::admin::AdminState;
use crate::config::Config;

/// How long in-flight requests may drain after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting token-router");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle =
        metrics::install_recorder().context("failed to install Prometheus recorder")?;

    let args: Vec<String> = std::env::args().collect();
    let config_path = Config::resolve_path(config_flag(&args));
    info!(path = %config_path.display(), "loading configuration");

    let mut config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    let pool_config = config.pool_config();
    info!(
        listen_addr = %config.server.listen_addr,
        regions = config.upstream.base_urls.len(),
        pool_enabled = pool_config.enabled,
        pool_file = %pool_config.file_path.display(),
        strategy = pool_config.strategy.as_str(),
        admin_key = config.server.admin_key.is_some(),
        "configuration loaded"
    );

    let client = reqwest::Client::builder()
        .build()
        .context("failed to build HTTP client")?;
    let upstream = build_upstream(&config, client);
    info!(upstream = upstream.id(), "upstream client ready");

    let pool = Arc::new(PoolManager::new(pool_config, upstream));
    pool.init().await;

    let admin_key = config.server.admin_key.take();
    let app = build_app(&config, Arc::clone(&pool), admin_key, prometheus_handle);

    let listen_addr = config.server.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting requests");

    // The drain timeout starts when the shutdown signal fires, not when the
    // server starts.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;

    // Stop probing the upstream before draining
    pool.shutdown().await;
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => {
            info!("all in-flight requests drained");
        }
        Ok(Ok(Err(e))) => {
            error!(error = %e, "server error during shutdown");
        }
        Ok(Err(e)) => {
            error!(error = %e, "server task panicked");
        }
        Err(_) => {
            warn!(
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    info!("shutdown complete");
    Ok(())
}

/// Value following `--config`, if any.
fn config_flag(args: &[String]) -> Option<&str> {
    args.iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str())
}

fn build_upstream(config: &Config, client: reqwest::Client) -> Arc<dyn Upstream> {
    Arc::new(HttpUpstream::new(
        client,
        config.base_urls(),
        config.endpoints(),
        config.timeout(),
    ))
}

fn build_app(
    config: &Config,
    pool: Arc<PoolManager>,
    admin_key: Option<common::Secret<String>>,
    prometheus: PrometheusHandle,
) -> Router {
    let state = AdminState::new(pool, admin_key, prometheus);
    admin::build_router(state, config.server.max_connections)
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use std::collections::HashMap;
    use tower::ServiceExt;

    fn test_config(dir: &std::path::Path) -> Config {
        Config {
            server: config::ServerConfig {
                listen_addr: "127.0.0.1:0".parse().unwrap(),
                max_connections: 8,
                admin_key: None,
                admin_key_file: None,
            },
            pool: config::PoolSection {
                file_path: dir.join("token-pool.json"),
                health_check_interval_ms: 0,
                ..config::PoolSection::default()
            },
            upstream: config::UpstreamConfig {
                base_urls: HashMap::from([("us".to_string(), "http://127.0.0.1:9".to_string())]),
                timeout_secs: 1,
                endpoints: config::EndpointOverrides::default(),
            },
        }
    }

    #[test]
    fn config_flag_takes_following_argument() {
        let args: Vec<String> = ["token-router", "--config", "/etc/router.toml"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(config_flag(&args), Some("/etc/router.toml"));
        assert_eq!(config_flag(&args[..2]), None);
        assert_eq!(config_flag(&args[..1]), None);
    }

    #[tokio::test]
    async fn app_loads_pool_file_and_exposes_metrics() {
        let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let _guard = ::metrics::set_default_local_recorder(&recorder);

        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(
            dir.path().join("token-pool.json"),
            r#"{"updatedAt": 1, "tokens": [{"token": "token-from-disk", "region": "us", "enabled": true, "live": true}]}"#,
        )
        .await
        .unwrap();

        let config = test_config(dir.path());
        let upstream = build_upstream(&config, reqwest::Client::new());
        assert_eq!(upstream.id(), "http");
        let pool = Arc::new(PoolManager::new(config.pool_config(), upstream));
        pool.init().await;
        let app = build_app(&config, pool, None, handle);

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/admin/pick")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"taskType": "image"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("token_pool_tokens"), "got: {text}");
        assert!(text.contains("token_pool_picks_total"), "got: {text}");
        assert!(text.contains("admin_requests_total"), "got: {text}");
    }
}
