use std::ffi::OsStr;
use std::io;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::ErrorKind;
use tracing::{debug, warn};

use crate::config::ALLOWED_EXTENSIONS;

/// Resolves destination paths inside the media library and owns the staging
/// area where chunk bytes accumulate before promotion.
#[derive(Clone, Debug)]
pub struct MediaStore {
    library_root: PathBuf,
    staging_root: PathBuf,
}

impl MediaStore {
    pub fn new(library_root: PathBuf, staging_root: PathBuf) -> Self {
        Self {
            library_root,
            staging_root,
        }
    }

    pub async fn ensure_roots(&self) -> io::Result<()> {
        fs::create_dir_all(&self.library_root).await?;
        fs::create_dir_all(&self.staging_root).await
    }

    pub fn library_root(&self) -> &Path {
        &self.library_root
    }

    pub fn staging_root(&self) -> &Path {
        &self.staging_root
    }

    /// 将相对目录与文件名解析为库内的绝对目标路径。
    pub fn resolve_destination(
        &self,
        relative_dir: &str,
        file_name: &str,
    ) -> Result<PathBuf, StorageError> {
        let dir = self.resolve(relative_dir)?;
        let leaf = sanitize_file_name(file_name).ok_or(StorageError::InvalidPath)?;
        Ok(dir.join(leaf))
    }

    fn resolve(&self, relative: &str) -> Result<PathBuf, StorageError> {
        let mut normalized = PathBuf::new();
        let trimmed = relative.trim_start_matches(['/', '\\']);
        for component in Path::new(trimmed).components() {
            match component {
                Component::Normal(segment) => normalized.push(segment),
                Component::CurDir => continue,
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(StorageError::InvalidPath);
                }
            }
        }
        Ok(self.library_root.join(normalized))
    }

    /// 列出某个库内目录的直接子目录；目录不存在时返回空列表。
    pub async fn list_folders(&self, relative: Option<&str>) -> Result<Vec<String>, StorageError> {
        let target = self.resolve(relative.unwrap_or(""))?;
        let mut dir = match fs::read_dir(&target).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(StorageError::Io(err)),
        };

        let mut folders = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let metadata = entry.metadata().await?;
            if metadata.is_dir() {
                folders.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        folders.sort_by_key(|name| name.to_lowercase());
        Ok(folders)
    }

    /// 返回某个上传会话的暂存文件路径。
    pub fn staging_file(&self, upload_id: &str, file_name: &str) -> PathBuf {
        let leaf = sanitize_file_name(file_name).unwrap_or_else(|| "upload".to_string());
        self.staging_root
            .join(upload_id)
            .join(format!("{leaf}.part"))
    }

    /// 将暂存文件搬到最终位置：优先 rename，跨文件系统时退回 copy+unlink。
    pub async fn promote(&self, staging: &Path, destination: &Path) -> io::Result<()> {
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).await?;
        }

        match fs::rename(staging, destination).await {
            Ok(()) => {}
            Err(err) => {
                debug!(error = %err, "rename failed, falling back to copy");
                fs::copy(staging, destination).await?;
                if let Err(err) = fs::remove_file(staging).await {
                    warn!(path = ?staging, error = %err, "failed to remove staging file after copy");
                }
            }
        }

        if let Some(parent) = destination.parent() {
            let _ = sync_dir(parent).await;
        }
        Ok(())
    }

    /// 删除会话的暂存目录（若已空或残留）。
    pub async fn remove_staging_dir(&self, upload_id: &str) {
        let dir = self.staging_root.join(upload_id);
        if let Err(err) = fs::remove_dir_all(&dir).await
            && err.kind() != ErrorKind::NotFound
        {
            warn!(path = ?dir, error = %err, "failed to remove staging dir");
        }
    }
}

/// 检查文件扩展名是否在允许列表内（大小写不敏感）。
pub fn allowed_extension(file_name: &str) -> bool {
    Path::new(file_name)
        .extension()
        .and_then(OsStr::to_str)
        .map(|ext| {
            let ext = ext.to_lowercase();
            ALLOWED_EXTENSIONS.iter().any(|allowed| *allowed == ext)
        })
        .unwrap_or(false)
}

fn sanitize_file_name(file_name: &str) -> Option<String> {
    let leaf = Path::new(file_name.trim_start_matches(['/', '\\']))
        .file_name()?
        .to_string_lossy()
        .to_string();
    if leaf.is_empty() || leaf == "." || leaf == ".." {
        return None;
    }
    Some(leaf)
}

async fn sync_dir(path: &Path) -> io::Result<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let dir = std::fs::File::open(path)?;
        dir.sync_all()
    })
    .await
    .map_err(|err| io::Error::other(err.to_string()))?
}

#[derive(Debug)]
pub enum StorageError {
    InvalidPath,
    Io(io::Error),
}

impl From<io::Error> for StorageError {
    fn from(err: io::Error) -> Self {
        StorageError::Io(err)
    }
}
