//! 会话过期清理与孤儿暂存目录回收的后台任务。

use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{info, warn};

use crate::config::{SESSION_SWEEP_INTERVAL_SECS, STAGING_SWEEP_INTERVAL_SECS};
use crate::session::SessionStore;
use crate::storage::MediaStore;

#[derive(Clone, Copy, Debug)]
pub struct BackgroundConfig {
    pub session_ttl: Duration,
    pub staging_ttl: Duration,
}

/// 启动后台任务（会话过期清理与暂存目录回收）。
pub fn spawn_background_tasks(
    store: Arc<MediaStore>,
    sessions: Arc<SessionStore>,
    config: BackgroundConfig,
) {
    let sweep_store = store.clone();
    let sweep_sessions = sessions.clone();
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(Duration::from_secs(SESSION_SWEEP_INTERVAL_SECS));
        loop {
            interval.tick().await;
            let evicted = sweep_sessions.evict_expired(config.session_ttl).await;
            for session in evicted {
                sweep_store.remove_staging_dir(&session.upload_id).await;
            }
        }
    });

    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(Duration::from_secs(STAGING_SWEEP_INTERVAL_SECS));
        loop {
            interval.tick().await;
            if let Err(err) = cleanup_orphaned_staging(&store, &sessions, config.staging_ttl).await
            {
                warn!(error = %err, "staging cleanup failed");
            }
        }
    });
}

/// 删除既无会话又长期未动的暂存目录（会话丢失或进程曾重启的残留）。
async fn cleanup_orphaned_staging(
    store: &MediaStore,
    sessions: &SessionStore,
    ttl: Duration,
) -> Result<(), std::io::Error> {
    if ttl.is_zero() {
        return Ok(());
    }

    let now = SystemTime::now();
    let mut dir = match tokio::fs::read_dir(store.staging_root()).await {
        Ok(dir) => dir,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err),
    };

    while let Some(entry) = dir.next_entry().await? {
        let metadata = entry.metadata().await?;
        if !metadata.is_dir() {
            continue;
        }
        let upload_id = entry.file_name().to_string_lossy().to_string();
        if sessions.contains(&upload_id).await {
            continue;
        }
        let modified = match metadata.modified() {
            Ok(value) => value,
            Err(_) => continue,
        };
        let age = match now.duration_since(modified) {
            Ok(value) => value,
            Err(_) => continue,
        };
        if age >= ttl {
            let path = entry.path();
            if let Err(err) = tokio::fs::remove_dir_all(&path).await {
                warn!(path = ?path, error = %err, "failed to remove stale staging dir");
            } else {
                info!(path = ?path, "removed stale staging dir");
            }
        }
    }

    Ok(())
}
