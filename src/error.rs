//! 统一的 API 错误类型与转换。

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;
use std::io::ErrorKind;

use crate::session::SessionError;
use crate::storage::StorageError;

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    Internal(String),
    /// 分片写入失败，带上已写字节数供客户端记录。
    ChunkWriteFailed {
        chunk_index: u32,
        bytes_written: u64,
        message: String,
    },
    /// 完成请求但仍有缺失分片。
    IncompleteUpload { missing: Vec<u32> },
    /// 合并后文件大小与声明不符。
    SizeMismatch { expected: u64, actual: u64 },
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(msg) => reply(StatusCode::BAD_REQUEST, &msg),
            ApiError::NotFound(msg) => reply(StatusCode::NOT_FOUND, &msg),
            ApiError::Conflict(msg) => reply(StatusCode::CONFLICT, &msg),
            ApiError::Internal(msg) => reply(StatusCode::INTERNAL_SERVER_ERROR, &msg),
            ApiError::ChunkWriteFailed {
                chunk_index,
                bytes_written,
                message,
            } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "success": false,
                    "chunkIndex": chunk_index,
                    "bytesWritten": bytes_written,
                    "error": message,
                })),
            )
                .into_response(),
            ApiError::IncompleteUpload { missing } => (
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "success": false,
                    "error": "upload is missing chunks",
                    "missingChunks": missing,
                })),
            )
                .into_response(),
            ApiError::SizeMismatch { expected, actual } => (
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "success": false,
                    "error": format!(
                        "staged file size {actual} does not match declared size {expected}"
                    ),
                    "expectedSize": expected,
                    "actualSize": actual,
                })),
            )
                .into_response(),
        }
    }
}

fn reply(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(json!({ "success": false, "error": message })),
    )
        .into_response()
}

impl From<StorageError> for ApiError {
    fn from(error: StorageError) -> Self {
        match error {
            StorageError::InvalidPath => ApiError::BadRequest("invalid path".into()),
            StorageError::Io(err) => match err.kind() {
                ErrorKind::NotFound => ApiError::NotFound(err.to_string()),
                _ => ApiError::Internal(err.to_string()),
            },
        }
    }
}

impl From<SessionError> for ApiError {
    fn from(error: SessionError) -> Self {
        match error {
            SessionError::NotFound => ApiError::NotFound("upload session not found".into()),
            SessionError::InvalidChunkIndex { index, total } => ApiError::BadRequest(format!(
                "chunk index {index} out of range (0..{total})"
            )),
            SessionError::AlreadyFinalizing => {
                ApiError::Conflict("upload is already finalizing".into())
            }
            SessionError::MissingChunks(missing) => ApiError::IncompleteUpload { missing },
        }
    }
}
