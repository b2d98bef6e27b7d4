//! Reeldrop server binary.
//!
//! Wires the upload API router, CORS, request tracing, and the background
//! maintenance tasks, then serves until a termination signal arrives.

use axum::http::{HeaderValue, Request};
use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info, info_span, warn};

use reeldrop::background::{BackgroundConfig, spawn_background_tasks};
use reeldrop::config::Args;
use reeldrop::logging;
use reeldrop::sequencer::ChunkWriter;
use reeldrop::session::SessionStore;
use reeldrop::storage::MediaStore;
use reeldrop::upload::UploadLimits;

/// Starts the Reeldrop server and blocks until shutdown.
#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    logging::init_logging();

    let args = Args::parse();
    let store = Arc::new(MediaStore::new(
        PathBuf::from(&args.library_dir),
        PathBuf::from(&args.staging_dir),
    ));
    store.ensure_roots().await?;
    let sessions = Arc::new(SessionStore::new());
    let writer = Arc::new(ChunkWriter::new());
    let limits = Arc::new(UploadLimits {
        max_total_size: args.max_upload_size,
    });

    let mut app = reeldrop::api_router(store.clone(), sessions.clone(), writer, limits).layer(
        TraceLayer::new_for_http()
            .make_span_with(|request: &Request<_>| {
                info_span!(
                    env!("CARGO_CRATE_NAME"),
                    method = ?request.method(),
                    path = ?request.uri().path(),
                )
            })
            .on_request(DefaultOnRequest::new().level(Level::DEBUG))
            .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
    );

    if let Some(cors_layer) = build_cors_layer(args.cors_origins.as_deref()) {
        app = app.layer(cors_layer);
    }

    spawn_background_tasks(
        store,
        sessions,
        BackgroundConfig {
            session_ttl: Duration::from_secs(args.session_ttl_secs),
            staging_ttl: Duration::from_secs(args.staging_ttl_secs),
        },
    );

    let host = args
        .host
        .parse::<IpAddr>()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err.to_string()))?;
    let addr = SocketAddr::new(host, args.port);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    info!("🚀 Starting HTTP server at {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
}

/// 构建 CORS Layer（支持逗号分隔的来源列表）。
fn build_cors_layer(cors_origins: Option<&str>) -> Option<CorsLayer> {
    let origins = cors_origins?
        .split(',')
        .map(|origin| origin.trim())
        .filter(|origin| !origin.is_empty())
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin, "invalid cors origin");
                None
            }
        })
        .collect::<Vec<_>>();

    if origins.is_empty() {
        return None;
    }

    Some(
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods(Any)
            .allow_headers(Any),
    )
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
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
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Received termination signal shutting down");
}
