//! 分片上传协议的 HTTP 处理器：init、chunk、complete、status。

use axum::body::Bytes;
use axum::extract::multipart::{Field, Multipart, MultipartError};
use axum::extract::{Extension, Json, Path as AxumPath};
use axum::response::Json as JsonResponse;
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::ApiError;
use crate::integrity::validate_staged_file;
use crate::planner::{clamp_chunk_size, plan_chunk_size};
use crate::sequencer::{ChunkWriter, WriteError};
use crate::session::{CreateSession, SessionStore};
use crate::storage::{MediaStore, allowed_extension};

/// 服务端上传约束。
#[derive(Debug)]
pub struct UploadLimits {
    pub max_total_size: u64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadInitRequest {
    pub file_name: String,
    #[serde(default)]
    pub folder_name: Option<String>,
    #[serde(default)]
    pub destination_path: Option<String>,
    pub total_size: u64,
    #[serde(default)]
    pub chunk_size: Option<u64>,
    #[serde(default)]
    pub original_file_name: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadInitResponse {
    pub success: bool,
    pub upload_id: String,
    pub total_chunks: u32,
    pub chunk_size: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkUploadResponse {
    pub success: bool,
    pub chunk_index: u32,
    pub bytes_written: u64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadCompleteRequest {
    pub upload_id: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadCompleteResponse {
    pub success: bool,
    pub path: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadStatusResponse {
    pub success: bool,
    pub upload_id: String,
    pub received_chunks: u32,
    pub total_chunks: u32,
    pub missing_chunks: Vec<u32>,
    pub uploaded_bytes: u64,
    pub progress_percent: f64,
    pub is_complete: bool,
    pub staging_file_exists: bool,
    pub staging_file_size: u64,
}

/// 建立上传会话：校验输入、规划分片大小、准备暂存目录。
pub async fn init_upload(
    Extension(store): Extension<Arc<MediaStore>>,
    Extension(sessions): Extension<Arc<SessionStore>>,
    Extension(limits): Extension<Arc<UploadLimits>>,
    Json(payload): Json<UploadInitRequest>,
) -> Result<JsonResponse<UploadInitResponse>, ApiError> {
    let file_name = payload.file_name.trim().to_string();
    if file_name.is_empty() {
        return Err(ApiError::BadRequest("fileName is required".into()));
    }
    if payload.total_size == 0 {
        return Err(ApiError::BadRequest("totalSize must be positive".into()));
    }
    if limits.max_total_size > 0 && payload.total_size > limits.max_total_size {
        return Err(ApiError::BadRequest("upload size exceeds limit".into()));
    }

    let checked_name = payload
        .original_file_name
        .as_deref()
        .unwrap_or(&file_name);
    if !allowed_extension(checked_name) {
        return Err(ApiError::BadRequest(format!(
            "file type not allowed: {checked_name}"
        )));
    }

    let mut relative_dir = payload.destination_path.unwrap_or_default();
    if let Some(folder) = &payload.folder_name
        && !folder.trim().is_empty()
    {
        relative_dir = format!("{}/{}", relative_dir.trim_end_matches('/'), folder.trim());
    }
    let destination = store.resolve_destination(&relative_dir, &file_name)?;

    let chunk_size = match payload.chunk_size {
        Some(requested) if requested > 0 => clamp_chunk_size(requested),
        _ => plan_chunk_size(payload.total_size),
    };

    let upload_id = Uuid::new_v4().to_string();
    let staging_path = store.staging_file(&upload_id, &file_name);
    if let Some(parent) = staging_path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|err| ApiError::Internal(err.to_string()))?;
    }

    let total_chunks = sessions
        .create(CreateSession {
            upload_id: upload_id.clone(),
            file_name: file_name.clone(),
            folder: relative_dir,
            destination,
            total_size: payload.total_size,
            chunk_size,
            staging_path,
        })
        .await;

    info!(
        upload_id,
        file_name,
        total_size = payload.total_size,
        chunk_size,
        total_chunks,
        "init upload"
    );
    Ok(JsonResponse(UploadInitResponse {
        success: true,
        upload_id,
        total_chunks,
        chunk_size,
    }))
}

/// 接收单个分片：multipart 表单，元数据字段必须在二进制字段之前。
///
/// 对已收到的分片幂等返回成功且不再落盘；落盘成功后由这里（而不是
/// 排队器）通知会话表记录回执。
pub async fn upload_chunk(
    Extension(sessions): Extension<Arc<SessionStore>>,
    Extension(writer): Extension<Arc<ChunkWriter>>,
    mut multipart: Multipart,
) -> Result<JsonResponse<ChunkUploadResponse>, ApiError> {
    let mut upload_id: Option<String> = None;
    let mut chunk_index: Option<u32> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::BadRequest(err.to_string()))?
    {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("uploadId") => {
                let text = field
                    .text()
                    .await
                    .map_err(|err| ApiError::BadRequest(err.to_string()))?;
                upload_id = Some(text.trim().to_string());
            }
            Some("chunkIndex") => {
                let text = field
                    .text()
                    .await
                    .map_err(|err| ApiError::BadRequest(err.to_string()))?;
                let index = text
                    .trim()
                    .parse::<u32>()
                    .map_err(|_| ApiError::BadRequest("chunkIndex is invalid".into()))?;
                chunk_index = Some(index);
            }
            Some("chunk") => {
                let id = upload_id
                    .as_deref()
                    .ok_or_else(|| ApiError::BadRequest("uploadId must precede chunk".into()))?;
                let index = chunk_index
                    .ok_or_else(|| ApiError::BadRequest("chunkIndex must precede chunk".into()))?;

                let slot = sessions.chunk_slot(id, index).await?;
                if slot.already_received {
                    debug!(upload_id = id, chunk_index = index, "duplicate chunk ignored");
                    return Ok(JsonResponse(ChunkUploadResponse {
                        success: true,
                        chunk_index: index,
                        bytes_written: 0,
                    }));
                }

                let write = writer
                    .write_chunk(
                        &slot.staging_path,
                        index,
                        slot.offset,
                        slot.expected_len,
                        field_stream(field),
                    )
                    .await
                    .map_err(|err| {
                        warn!(upload_id = id, chunk_index = index, error = %err, "chunk write failed");
                        let bytes_written = match &err {
                            WriteError::SizeMismatch { written, .. } => *written,
                            _ => 0,
                        };
                        ApiError::ChunkWriteFailed {
                            chunk_index: index,
                            bytes_written,
                            message: err.to_string(),
                        }
                    })?;

                if !sessions.mark_chunk_received(id, index).await {
                    return Err(ApiError::NotFound("upload session not found".into()));
                }
                debug!(
                    upload_id = id,
                    chunk_index = index,
                    bytes = write.bytes_written,
                    "chunk stored"
                );
                return Ok(JsonResponse(ChunkUploadResponse {
                    success: true,
                    chunk_index: index,
                    bytes_written: write.bytes_written,
                }));
            }
            _ => continue,
        }
    }

    Err(ApiError::BadRequest("chunk field is required".into()))
}

/// 完成上传：校验齐全与整体大小，搬运到最终位置并删除会话。
pub async fn complete_upload(
    Extension(store): Extension<Arc<MediaStore>>,
    Extension(sessions): Extension<Arc<SessionStore>>,
    Json(payload): Json<UploadCompleteRequest>,
) -> Result<JsonResponse<UploadCompleteResponse>, ApiError> {
    let upload_id = payload.upload_id.trim().to_string();
    if upload_id.is_empty() {
        return Err(ApiError::BadRequest("uploadId is required".into()));
    }

    let info = sessions.begin_finalize(&upload_id).await?;

    let report = match validate_staged_file(&info.staging_path, info.total_size).await {
        Ok(report) => report,
        Err(err) => {
            sessions.fail_finalize(&upload_id).await;
            return Err(ApiError::Internal(err.to_string()));
        }
    };
    if !report.valid {
        warn!(
            upload_id,
            expected = report.expected_size,
            actual = report.actual_size,
            "staged file size mismatch"
        );
        sessions.fail_finalize(&upload_id).await;
        return Err(ApiError::SizeMismatch {
            expected: report.expected_size,
            actual: report.actual_size,
        });
    }

    if let Err(err) = store.promote(&info.staging_path, &info.destination).await {
        warn!(upload_id, error = %err, "failed to promote staged file");
        sessions.fail_finalize(&upload_id).await;
        return Err(ApiError::Internal(err.to_string()));
    }

    sessions.delete(&upload_id).await;
    store.remove_staging_dir(&upload_id).await;

    info!(
        upload_id,
        file_name = info.file_name,
        total_size = info.total_size,
        path = %info.destination.display(),
        "upload complete"
    );
    Ok(JsonResponse(UploadCompleteResponse {
        success: true,
        path: info.destination.display().to_string(),
    }))
}

/// 查询会话状态投影。
pub async fn upload_status(
    AxumPath(upload_id): AxumPath<String>,
    Extension(sessions): Extension<Arc<SessionStore>>,
) -> Result<JsonResponse<UploadStatusResponse>, ApiError> {
    let status = sessions
        .status(&upload_id)
        .await
        .ok_or_else(|| ApiError::NotFound("upload session not found".into()))?;

    let (staging_file_exists, staging_file_size) = match fs::metadata(&status.staging_path).await {
        Ok(metadata) => (true, metadata.len()),
        Err(_) => (false, 0),
    };

    Ok(JsonResponse(UploadStatusResponse {
        success: true,
        upload_id: status.upload_id,
        received_chunks: status.received_count,
        total_chunks: status.total_chunks,
        missing_chunks: status.missing_chunks,
        uploaded_bytes: status.uploaded_bytes,
        progress_percent: status.progress_percent,
        is_complete: status.is_complete,
        staging_file_exists,
        staging_file_size,
    }))
}

fn field_stream(field: Field<'_>) -> impl Stream<Item = Result<Bytes, MultipartError>> + '_ {
    futures_util::stream::unfold(Some(field), |state| async move {
        let mut field = state?;
        match field.chunk().await {
            Ok(Some(bytes)) => Some((Ok(bytes), Some(field))),
            Ok(None) => None,
            Err(err) => Some((Err(err), None)),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MIB;
    use tempfile::tempdir;

    fn make_env() -> (
        tempfile::TempDir,
        Arc<MediaStore>,
        Arc<SessionStore>,
        Arc<UploadLimits>,
    ) {
        let temp = tempdir().expect("tempdir");
        let library = temp.path().join("library");
        let staging = temp.path().join("staging");
        std::fs::create_dir_all(&library).expect("library root");
        std::fs::create_dir_all(&staging).expect("staging root");
        (
            temp,
            Arc::new(MediaStore::new(library, staging)),
            Arc::new(SessionStore::new()),
            Arc::new(UploadLimits { max_total_size: 0 }),
        )
    }

    fn init_request(total_size: u64, chunk_size: Option<u64>) -> UploadInitRequest {
        UploadInitRequest {
            file_name: "movie.mkv".to_string(),
            folder_name: Some("films".to_string()),
            destination_path: None,
            total_size,
            chunk_size,
            original_file_name: None,
        }
    }

    #[tokio::test]
    async fn init_rejects_zero_size() {
        let (_temp, store, sessions, limits) = make_env();
        let result = init_upload(
            Extension(store),
            Extension(sessions),
            Extension(limits),
            Json(init_request(0, None)),
        )
        .await;
        assert!(matches!(result, Err(ApiError::BadRequest(_))));
    }

    #[tokio::test]
    async fn init_rejects_disallowed_extension() {
        let (_temp, store, sessions, limits) = make_env();
        let mut request = init_request(1024, None);
        request.file_name = "payload.exe".to_string();
        let result = init_upload(
            Extension(store),
            Extension(sessions),
            Extension(limits),
            Json(request),
        )
        .await;
        assert!(matches!(result, Err(ApiError::BadRequest(_))));
    }

    #[tokio::test]
    async fn init_rejects_traversal_destination() {
        let (_temp, store, sessions, limits) = make_env();
        let mut request = init_request(1024, None);
        request.destination_path = Some("../outside".to_string());
        let result = init_upload(
            Extension(store),
            Extension(sessions),
            Extension(limits),
            Json(request),
        )
        .await;
        assert!(matches!(result, Err(ApiError::BadRequest(_))));
    }

    #[tokio::test]
    async fn init_plans_small_file_chunks() {
        let (_temp, store, sessions, limits) = make_env();
        let JsonResponse(reply) = init_upload(
            Extension(store),
            Extension(sessions),
            Extension(limits),
            Json(init_request(26_214_400, None)),
        )
        .await
        .expect("init");

        assert!(reply.success);
        assert_eq!(reply.chunk_size, 10 * MIB);
        assert_eq!(reply.total_chunks, 3);
    }

    #[tokio::test]
    async fn init_clamps_client_chunk_size() {
        let (_temp, store, sessions, limits) = make_env();
        let JsonResponse(reply) = init_upload(
            Extension(store),
            Extension(sessions),
            Extension(limits),
            Json(init_request(4 * MIB, Some(1))),
        )
        .await
        .expect("init");

        assert_eq!(reply.chunk_size, MIB);
        assert_eq!(reply.total_chunks, 4);
    }

    #[tokio::test]
    async fn complete_with_missing_chunks_keeps_session() {
        let (_temp, store, sessions, limits) = make_env();
        let JsonResponse(init) = init_upload(
            Extension(store.clone()),
            Extension(sessions.clone()),
            Extension(limits),
            Json(init_request(3 * MIB, Some(MIB))),
        )
        .await
        .expect("init");

        sessions.mark_chunk_received(&init.upload_id, 0).await;
        sessions.mark_chunk_received(&init.upload_id, 1).await;

        let result = complete_upload(
            Extension(store),
            Extension(sessions.clone()),
            Json(UploadCompleteRequest {
                upload_id: init.upload_id.clone(),
            }),
        )
        .await;

        match result {
            Err(ApiError::IncompleteUpload { missing }) => assert_eq!(missing, vec![2]),
            other => panic!("expected incomplete upload, got {:?}", other.is_ok()),
        }
        assert!(sessions.status(&init.upload_id).await.is_some());
    }

    #[tokio::test]
    async fn complete_promotes_file_and_deletes_session() {
        let (_temp, store, sessions, limits) = make_env();
        let total = 2 * MIB + 512;
        let JsonResponse(init) = init_upload(
            Extension(store.clone()),
            Extension(sessions.clone()),
            Extension(limits),
            Json(init_request(total, Some(MIB))),
        )
        .await
        .expect("init");

        let status = sessions.status(&init.upload_id).await.expect("status");
        std::fs::write(&status.staging_path, vec![9u8; total as usize]).expect("stage bytes");
        for index in 0..init.total_chunks {
            sessions.mark_chunk_received(&init.upload_id, index).await;
        }

        let JsonResponse(reply) = complete_upload(
            Extension(store.clone()),
            Extension(sessions.clone()),
            Json(UploadCompleteRequest {
                upload_id: init.upload_id.clone(),
            }),
        )
        .await
        .expect("complete");

        assert!(reply.success);
        let final_path = store.library_root().join("films").join("movie.mkv");
        assert_eq!(
            std::fs::metadata(&final_path).expect("final file").len(),
            total
        );
        assert!(sessions.status(&init.upload_id).await.is_none());
        assert!(!store.staging_root().join(&init.upload_id).exists());
    }

    #[tokio::test]
    async fn complete_size_mismatch_keeps_session() {
        let (_temp, store, sessions, limits) = make_env();
        let total = 2 * MIB;
        let JsonResponse(init) = init_upload(
            Extension(store.clone()),
            Extension(sessions.clone()),
            Extension(limits),
            Json(init_request(total, Some(MIB))),
        )
        .await
        .expect("init");

        let status = sessions.status(&init.upload_id).await.expect("status");
        std::fs::write(&status.staging_path, vec![9u8; MIB as usize]).expect("stage bytes");
        for index in 0..init.total_chunks {
            sessions.mark_chunk_received(&init.upload_id, index).await;
        }

        let result = complete_upload(
            Extension(store),
            Extension(sessions.clone()),
            Json(UploadCompleteRequest {
                upload_id: init.upload_id.clone(),
            }),
        )
        .await;

        assert!(matches!(result, Err(ApiError::SizeMismatch { .. })));
        assert!(sessions.status(&init.upload_id).await.is_some());
    }

    #[tokio::test]
    async fn status_unknown_session_is_not_found() {
        let (_temp, _store, sessions, _limits) = make_env();
        let result = upload_status(AxumPath("nope".to_string()), Extension(sessions)).await;
        assert!(matches!(result, Err(ApiError::NotFound(_))));
    }
}
