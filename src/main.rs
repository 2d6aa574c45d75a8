//! cv-relay — signed-request relay in front of a single upstream vision API.

use axum::extract::DefaultBodyLimit;
use axum::{middleware, routing::get, routing::post, Router};
use clap::Parser;
use cv_relay::admission::AdmissionEngine;
use cv_relay::audit::AuditService;
use cv_relay::cipher::AesGcmCipher;
use cv_relay::config::Config;
use cv_relay::handlers::auth::signature_middleware;
use cv_relay::handlers::{
    compat_handler,
    get_result::get_result_handler,
    health::{health_check, stats_handler},
    submit::submit_handler,
    AppState,
};
use cv_relay::idempotency::IdempotencyService;
use cv_relay::keystore::SqliteApiKeyStore;
use cv_relay::metrics::{http_metrics_middleware, metrics_handler, Metrics};
use cv_relay::upstream::{UpstreamClient, UpstreamConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, reload, util::SubscriberInitExt};

fn version_long() -> &'static str {
    static V: std::sync::OnceLock<String> = std::sync::OnceLock::new();
    V.get_or_init(|| format!("{} (built {})", env!("CARGO_PKG_VERSION"), env!("CVRELAY_BUILD_TIME")))
}

/// cv-relay — signed-request relay in front of a single upstream vision API
#[derive(Parser, Debug)]
#[command(name = "cv-relay")]
#[command(version = version_long())]
#[command(author, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<String>,

    /// Listen address (overrides config)
    #[arg(short, long, value_name = "ADDR")]
    listen: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    runtime.block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let initial_filter = EnvFilter::try_from_default_env()
        .or_else(|_| std::env::var("CVRELAY_LOG_LEVEL").map(EnvFilter::new))
        .unwrap_or_else(|_| {
            if cli.verbose {
                EnvFilter::new("cv_relay=trace,tower_http=trace")
            } else {
                EnvFilter::new("cv_relay=debug,tower_http=debug")
            }
        });

    let (filter_layer, _log_reload_handle) = reload::Layer::new(initial_filter);
    tracing_subscriber::registry()
        .with(filter_layer)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = if let Some(ref path) = cli.config {
        Config::from_file(path)?
    } else {
        Config::load()?
    };

    if let Some(ref addr) = cli.listen {
        config.listen_addr = addr.parse()?;
    }

    info!("Starting cv-relay v{} (built {})", env!("CARGO_PKG_VERSION"), env!("CVRELAY_BUILD_TIME"));
    info!("  Listen address: {}", config.listen_addr);
    info!("  Upstream: {}", config.upstream_base_url);
    info!("  Max in-flight: {}, max queue depth: {}", config.max_in_flight, config.max_queue_depth);

    let metrics = Arc::new(Metrics::new());
    metrics.process_start_time_seconds.set(
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64(),
    );
    metrics.build_info.with_label_values(&[env!("CARGO_PKG_VERSION")]).set(1.0);

    let pool = cv_relay::db::connect(&config.database_url).await?;

    let cipher = AesGcmCipher::new(config.api_key_encryption_key.as_slice())?;

    let admission = AdmissionEngine::new(
        config.max_in_flight,
        config.max_queue_depth,
        Duration::from_millis(config.submit_min_interval_ms),
    );

    let upstream = UpstreamClient::new(UpstreamConfig {
        base_url: config.upstream_base_url.clone(),
        access_key_id: config.upstream_access_key_id.clone(),
        secret_access_key: config.upstream_secret_access_key.clone(),
        region: config.upstream_region.clone(),
        service: config.upstream_service.clone(),
        timeout: Duration::from_millis(config.upstream_timeout_ms),
        max_retries: config.max_retries,
        retry_base_delay: Duration::from_millis(config.retry_base_delay_ms),
        retry_max_delay: Duration::from_millis(config.retry_max_delay_ms),
    });

    let state = Arc::new(AppState {
        config: config.clone(),
        admission,
        upstream,
        keystore: Box::new(SqliteApiKeyStore::new(pool.clone())),
        cipher: Box::new(cipher),
        audit: AuditService::new(pool.clone()),
        idempotency: IdempotencyService::new(pool),
        metrics: metrics.clone(),
    });

    let app = Router::new()
        .route("/v1/submit", post(submit_handler))
        .route("/v1/get-result", post(get_result_handler))
        .route("/", post(compat_handler))
        .layer(middleware::from_fn_with_state(state.clone(), signature_middleware))
        .route("/health", get(health_check))
        .route("/stats", get(stats_handler))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn_with_state(state.clone(), http_metrics_middleware))
        .layer(CatchPanicLayer::new())
        .layer(DefaultBodyLimit::max(config.max_body_bytes))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let listener = TcpListener::bind(&config.listen_addr).await?;
    info!("cv-relay listening on http://{}", config.listen_addr);
    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;

    info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            warn!("Received Ctrl+C, initiating graceful shutdown...");
        }
        _ = terminate => {
            warn!("Received SIGTERM, initiating graceful shutdown...");
        }
    }
}
