//! Reeldrop: resilient chunked media uploads over HTTP.
//!
//! The server half is an Axum API backed by an in-memory session registry
//! and a per-file write sequencer; the client half is an adaptive upload
//! orchestrator with retry, stall detection, and server reconciliation.

pub mod adaptive;
pub mod background;
pub mod client;
pub mod config;
pub mod error;
pub mod files;
pub mod integrity;
pub mod logging;
pub mod persist;
pub mod planner;
pub mod sequencer;
pub mod session;
pub mod storage;
pub mod upload;

pub use client::{ClientError, CompletedUpload, TransferProgress, UploadClient, UploadPlan};

use axum::Router;
use axum::extract::{DefaultBodyLimit, Extension};
use axum::routing::{get, post};
use std::sync::Arc;

use crate::sequencer::ChunkWriter;
use crate::session::SessionStore;
use crate::storage::MediaStore;
use crate::upload::UploadLimits;

/// 组装上传 API 路由并挂载共享状态。
pub fn api_router(
    store: Arc<MediaStore>,
    sessions: Arc<SessionStore>,
    writer: Arc<ChunkWriter>,
    limits: Arc<UploadLimits>,
) -> Router {
    Router::new()
        .route("/folders", get(files::list_folders))
        .route(
            "/upload",
            post(files::upload_whole_file).layer(DefaultBodyLimit::disable()),
        )
        .route("/upload/init", post(upload::init_upload))
        .route(
            "/upload/chunk",
            post(upload::upload_chunk).layer(DefaultBodyLimit::disable()),
        )
        .route("/upload/complete", post(upload::complete_upload))
        .route("/upload/status/{upload_id}", get(upload::upload_status))
        .layer(Extension(store))
        .layer(Extension(sessions))
        .layer(Extension(writer))
        .layer(Extension(limits))
}
