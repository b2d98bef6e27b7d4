//! 目录列表与单请求整文件上传（兼容不走分片协议的小文件）。

use axum::extract::multipart::Multipart;
use axum::extract::{Extension, Query};
use axum::response::Json as JsonResponse;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::ApiError;
use crate::storage::{MediaStore, allowed_extension};
use crate::upload::{UploadCompleteResponse, UploadLimits};

#[derive(Deserialize)]
pub struct OptionalPathQuery {
    path: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FoldersResponse {
    pub success: bool,
    pub folders: Vec<String>,
}

/// 列出库内某路径下的直接子目录；路径不存在时返回空列表而非错误。
pub async fn list_folders(
    Query(query): Query<OptionalPathQuery>,
    Extension(store): Extension<Arc<MediaStore>>,
) -> Result<JsonResponse<FoldersResponse>, ApiError> {
    let folders = store.list_folders(query.path.as_deref()).await?;
    info!(
        path = query.path.as_deref().unwrap_or(""),
        count = folders.len(),
        "list folders"
    );
    Ok(JsonResponse(FoldersResponse {
        success: true,
        folders,
    }))
}

/// 整文件直传：与分片路径共用目标解析、扩展名校验与搬运逻辑。
pub async fn upload_whole_file(
    Extension(store): Extension<Arc<MediaStore>>,
    Extension(limits): Extension<Arc<UploadLimits>>,
    mut multipart: Multipart,
) -> Result<JsonResponse<UploadCompleteResponse>, ApiError> {
    let mut relative_dir = String::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::BadRequest(err.to_string()))?
    {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("destinationPath") => {
                relative_dir = field
                    .text()
                    .await
                    .map_err(|err| ApiError::BadRequest(err.to_string()))?
                    .trim()
                    .to_string();
            }
            Some("folderName") => {
                let folder = field
                    .text()
                    .await
                    .map_err(|err| ApiError::BadRequest(err.to_string()))?;
                let folder = folder.trim();
                if !folder.is_empty() {
                    relative_dir = format!("{}/{}", relative_dir.trim_end_matches('/'), folder);
                }
            }
            Some("file") => {
                let file_name = field
                    .file_name()
                    .map(str::to_string)
                    .ok_or_else(|| ApiError::BadRequest("file name is required".into()))?;
                if !allowed_extension(&file_name) {
                    return Err(ApiError::BadRequest(format!(
                        "file type not allowed: {file_name}"
                    )));
                }
                let destination = store.resolve_destination(&relative_dir, &file_name)?;

                let upload_id = Uuid::new_v4().to_string();
                let staging = store.staging_file(&upload_id, &file_name);
                if let Some(parent) = staging.parent() {
                    fs::create_dir_all(parent)
                        .await
                        .map_err(|err| ApiError::Internal(err.to_string()))?;
                }

                let mut out = File::create(&staging)
                    .await
                    .map_err(|err| ApiError::Internal(err.to_string()))?;
                let mut total: u64 = 0;
                let mut field = field;
                let stream_result: Result<(), ApiError> = async {
                    while let Some(bytes) = field
                        .chunk()
                        .await
                        .map_err(|err| ApiError::BadRequest(err.to_string()))?
                    {
                        total += bytes.len() as u64;
                        if limits.max_total_size > 0 && total > limits.max_total_size {
                            return Err(ApiError::BadRequest("upload size exceeds limit".into()));
                        }
                        out.write_all(&bytes)
                            .await
                            .map_err(|err| ApiError::Internal(err.to_string()))?;
                    }
                    out.sync_data()
                        .await
                        .map_err(|err| ApiError::Internal(err.to_string()))
                }
                .await;

                if let Err(err) = stream_result {
                    store.remove_staging_dir(&upload_id).await;
                    return Err(err);
                }

                if let Err(err) = store.promote(&staging, &destination).await {
                    warn!(file_name, error = %err, "failed to promote direct upload");
                    store.remove_staging_dir(&upload_id).await;
                    return Err(ApiError::Internal(err.to_string()));
                }
                store.remove_staging_dir(&upload_id).await;

                info!(file_name, bytes = total, path = %destination.display(), "direct upload complete");
                return Ok(JsonResponse(UploadCompleteResponse {
                    success: true,
                    path: destination.display().to_string(),
                }));
            }
            _ => continue,
        }
    }

    Err(ApiError::BadRequest("file field is required".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn make_store() -> (tempfile::TempDir, Arc<MediaStore>) {
        let temp = tempdir().expect("tempdir");
        let library = temp.path().join("library");
        let staging = temp.path().join("staging");
        std::fs::create_dir_all(&library).expect("library root");
        std::fs::create_dir_all(&staging).expect("staging root");
        (temp, Arc::new(MediaStore::new(library, staging)))
    }

    #[tokio::test]
    async fn list_folders_returns_subdirectories() {
        let (_temp, store) = make_store();
        std::fs::create_dir_all(store.library_root().join("films")).unwrap();
        std::fs::create_dir_all(store.library_root().join("shows")).unwrap();

        let JsonResponse(reply) = list_folders(
            Query(OptionalPathQuery { path: None }),
            Extension(store),
        )
        .await
        .expect("list");

        assert!(reply.success);
        assert_eq!(reply.folders, vec!["films".to_string(), "shows".to_string()]);
    }

    #[tokio::test]
    async fn list_folders_missing_path_is_empty_success() {
        let (_temp, store) = make_store();
        let JsonResponse(reply) = list_folders(
            Query(OptionalPathQuery {
                path: Some("nope/missing".to_string()),
            }),
            Extension(store),
        )
        .await
        .expect("list");

        assert!(reply.success);
        assert!(reply.folders.is_empty());
    }

    #[tokio::test]
    async fn list_folders_rejects_traversal() {
        let (_temp, store) = make_store();
        let result = list_folders(
            Query(OptionalPathQuery {
                path: Some("../outside".to_string()),
            }),
            Extension(store),
        )
        .await;
        assert!(matches!(result, Err(ApiError::BadRequest(_))));
    }
}
