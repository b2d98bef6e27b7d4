//! 上传会话登记：创建、查询、分片回执与过期清理。

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::{SESSION_MIN_AGE_SECS, SESSION_RECENT_WINDOW_SECS};
use crate::planner::{expected_chunk_len, total_chunks};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessingState {
    NotStarted,
    Finalizing,
    Failed,
}

#[derive(Debug)]
struct UploadSession {
    file_name: String,
    folder: String,
    destination: PathBuf,
    total_size: u64,
    chunk_size: u64,
    total_chunks: u32,
    received: BTreeSet<u32>,
    staging_path: PathBuf,
    created_at: Instant,
    last_activity: Instant,
    state: ProcessingState,
}

impl UploadSession {
    fn is_complete(&self) -> bool {
        self.received.len() as u32 == self.total_chunks
    }

    fn missing_chunks(&self) -> Vec<u32> {
        (0..self.total_chunks)
            .filter(|index| !self.received.contains(index))
            .collect()
    }

    fn uploaded_bytes(&self) -> u64 {
        self.received
            .iter()
            .map(|index| expected_chunk_len(*index, self.total_size, self.chunk_size))
            .sum()
    }
}

#[derive(Debug)]
pub enum SessionError {
    NotFound,
    InvalidChunkIndex { index: u32, total: u32 },
    AlreadyFinalizing,
    MissingChunks(Vec<u32>),
}

pub struct CreateSession {
    pub upload_id: String,
    pub file_name: String,
    pub folder: String,
    pub destination: PathBuf,
    pub total_size: u64,
    pub chunk_size: u64,
    pub staging_path: PathBuf,
}

/// 单个分片写入所需的上下文。
#[derive(Clone, Debug)]
pub struct ChunkSlot {
    pub staging_path: PathBuf,
    pub offset: u64,
    pub expected_len: u64,
    pub already_received: bool,
}

#[derive(Clone, Debug)]
pub struct SessionStatus {
    pub upload_id: String,
    pub received_count: u32,
    pub total_chunks: u32,
    pub missing_chunks: Vec<u32>,
    pub uploaded_bytes: u64,
    pub progress_percent: f64,
    pub is_complete: bool,
    pub total_size: u64,
    pub chunk_size: u64,
    pub staging_path: PathBuf,
}

#[derive(Clone, Debug)]
pub struct FinalizeInfo {
    pub file_name: String,
    pub staging_path: PathBuf,
    pub destination: PathBuf,
    pub total_size: u64,
}

#[derive(Debug)]
pub struct EvictedSession {
    pub upload_id: String,
    pub staging_path: PathBuf,
}

/// 进程内会话表。所有字段访问都经由这里，保证活动时间戳一致刷新。
#[derive(Default)]
pub struct SessionStore {
    sessions: Mutex<HashMap<String, UploadSession>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记新会话并返回分片总数。
    pub async fn create(&self, params: CreateSession) -> u32 {
        let now = Instant::now();
        let chunks = total_chunks(params.total_size, params.chunk_size);
        let session = UploadSession {
            file_name: params.file_name,
            folder: params.folder,
            destination: params.destination,
            total_size: params.total_size,
            chunk_size: params.chunk_size,
            total_chunks: chunks,
            received: BTreeSet::new(),
            staging_path: params.staging_path,
            created_at: now,
            last_activity: now,
            state: ProcessingState::NotStarted,
        };
        let mut sessions = self.sessions.lock().await;
        sessions.insert(params.upload_id, session);
        chunks
    }

    /// 校验分片下标并返回写入上下文，同时刷新活动时间。
    pub async fn chunk_slot(&self, upload_id: &str, index: u32) -> Result<ChunkSlot, SessionError> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions.get_mut(upload_id).ok_or(SessionError::NotFound)?;
        session.last_activity = Instant::now();
        if index >= session.total_chunks {
            return Err(SessionError::InvalidChunkIndex {
                index,
                total: session.total_chunks,
            });
        }
        Ok(ChunkSlot {
            staging_path: session.staging_path.clone(),
            offset: index as u64 * session.chunk_size,
            expected_len: expected_chunk_len(index, session.total_size, session.chunk_size),
            already_received: session.received.contains(&index),
        })
    }

    /// 幂等记录分片回执；下标越界或会话缺失时返回 false 且不做任何修改。
    pub async fn mark_chunk_received(&self, upload_id: &str, index: u32) -> bool {
        let mut sessions = self.sessions.lock().await;
        let Some(session) = sessions.get_mut(upload_id) else {
            return false;
        };
        if index >= session.total_chunks {
            return false;
        }
        session.last_activity = Instant::now();
        session.received.insert(index);
        debug!(
            upload_id,
            chunk_index = index,
            received = session.received.len(),
            total = session.total_chunks,
            "chunk received"
        );
        true
    }

    pub async fn is_complete(&self, upload_id: &str) -> bool {
        let mut sessions = self.sessions.lock().await;
        match sessions.get_mut(upload_id) {
            Some(session) => {
                session.last_activity = Instant::now();
                session.is_complete()
            }
            None => false,
        }
    }

    /// 只读状态投影，供客户端轮询与断点恢复。
    pub async fn status(&self, upload_id: &str) -> Option<SessionStatus> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions.get_mut(upload_id)?;
        session.last_activity = Instant::now();
        let received_count = session.received.len() as u32;
        Some(SessionStatus {
            upload_id: upload_id.to_string(),
            received_count,
            total_chunks: session.total_chunks,
            missing_chunks: session.missing_chunks(),
            uploaded_bytes: session.uploaded_bytes(),
            progress_percent: f64::from(received_count) / f64::from(session.total_chunks) * 100.0,
            is_complete: session.is_complete(),
            total_size: session.total_size,
            chunk_size: session.chunk_size,
            staging_path: session.staging_path.clone(),
        })
    }

    /// 进入收尾阶段：要求分片齐全且当前没有其他收尾在进行。
    pub async fn begin_finalize(&self, upload_id: &str) -> Result<FinalizeInfo, SessionError> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions.get_mut(upload_id).ok_or(SessionError::NotFound)?;
        session.last_activity = Instant::now();
        if session.state == ProcessingState::Finalizing {
            return Err(SessionError::AlreadyFinalizing);
        }
        if !session.is_complete() {
            return Err(SessionError::MissingChunks(session.missing_chunks()));
        }
        session.state = ProcessingState::Finalizing;
        Ok(FinalizeInfo {
            file_name: session.file_name.clone(),
            staging_path: session.staging_path.clone(),
            destination: session.destination.clone(),
            total_size: session.total_size,
        })
    }

    /// 收尾失败后回退状态，保留会话供客户端排查或续传。
    pub async fn fail_finalize(&self, upload_id: &str) {
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get_mut(upload_id) {
            session.state = ProcessingState::Failed;
            session.last_activity = Instant::now();
        }
    }

    pub async fn delete(&self, upload_id: &str) -> bool {
        let mut sessions = self.sessions.lock().await;
        sessions.remove(upload_id).is_some()
    }

    pub async fn count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// 存在性检查，不刷新活动时间（供后台清理使用）。
    pub async fn contains(&self, upload_id: &str) -> bool {
        self.sessions.lock().await.contains_key(upload_id)
    }

    /// 过期清理。三道闸门都满足才删：闲置超过 TTL、不在近期活跃窗口内、
    /// 且创建已超过最短保护期，避免误删刚建立或缓慢但仍在推进的会话。
    pub async fn evict_expired(&self, ttl: Duration) -> Vec<EvictedSession> {
        self.evict_expired_at(Instant::now(), ttl).await
    }

    pub(crate) async fn evict_expired_at(&self, now: Instant, ttl: Duration) -> Vec<EvictedSession> {
        let recent_window = Duration::from_secs(SESSION_RECENT_WINDOW_SECS);
        let min_age = Duration::from_secs(SESSION_MIN_AGE_SECS);

        let mut sessions = self.sessions.lock().await;
        let expired: Vec<String> = sessions
            .iter()
            .filter(|(_, session)| {
                let idle = now.saturating_duration_since(session.last_activity);
                let age = now.saturating_duration_since(session.created_at);
                idle > ttl && idle > recent_window && age > min_age
            })
            .map(|(id, _)| id.clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|id| {
                sessions.remove(&id).map(|session| {
                    info!(
                        upload_id = id,
                        file_name = session.file_name,
                        folder = session.folder,
                        "evicting idle upload session"
                    );
                    EvictedSession {
                        upload_id: id,
                        staging_path: session.staging_path,
                    }
                })
            })
            .collect()
    }
}
