//! Client-side durable record of in-flight uploads.
//!
//! Purely advisory: lets a restarted client rediscover which uploads it had
//! open and re-query the server, nothing more. Records older than a day are
//! dropped on read.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

use crate::config::PERSIST_MAX_AGE_SECS;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedSession {
    pub upload_id: String,
    pub file_name: String,
    pub total_size: u64,
    pub chunk_size: u64,
    pub base_url: String,
    pub created_at: DateTime<Utc>,
}

impl PersistedSession {
    fn expired(&self, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.created_at).num_seconds() > PERSIST_MAX_AGE_SECS
    }
}

/// JSON 文件形式的会话记录，每个上传一个文件。
#[derive(Clone, Debug)]
pub struct SessionPersistence {
    dir: PathBuf,
}

impl SessionPersistence {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, upload_id: &str) -> PathBuf {
        self.dir.join(format!("upload-{upload_id}.json"))
    }

    pub async fn save(&self, record: &PersistedSession) -> io::Result<()> {
        fs::create_dir_all(&self.dir).await?;
        let bytes = serde_json::to_vec_pretty(record)
            .map_err(|err| io::Error::other(err.to_string()))?;
        fs::write(self.record_path(&record.upload_id), bytes).await
    }

    /// 读取记录；过期或损坏的记录会被顺手删掉并返回 None。
    pub async fn load(&self, upload_id: &str) -> io::Result<Option<PersistedSession>> {
        let path = self.record_path(upload_id);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err),
        };

        let record: PersistedSession = match serde_json::from_slice(&bytes) {
            Ok(record) => record,
            Err(err) => {
                debug!(path = ?path, error = %err, "discarding unreadable session record");
                let _ = fs::remove_file(&path).await;
                return Ok(None);
            }
        };
        if record.expired(Utc::now()) {
            let _ = fs::remove_file(&path).await;
            return Ok(None);
        }
        Ok(Some(record))
    }

    pub async fn remove(&self, upload_id: &str) {
        let _ = fs::remove_file(self.record_path(upload_id)).await;
    }

    /// 列出所有仍然新鲜的记录（过期的顺手清理）。
    pub async fn load_all(&self) -> io::Result<Vec<PersistedSession>> {
        let mut dir = match fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };

        let now = Utc::now();
        let mut records = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            let Ok(bytes) = fs::read(&path).await else {
                continue;
            };
            match serde_json::from_slice::<PersistedSession>(&bytes) {
                Ok(record) if !record.expired(now) => records.push(record),
                _ => {
                    let _ = fs::remove_file(&path).await;
                }
            }
        }
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(records)
    }
}
