//! Client-side transfer orchestrator.
//!
//! Drives a whole file to the server: opens a session, schedules chunk
//! uploads under an adaptive concurrency limit, retries failures with
//! jittered backoff, aborts stalled connections, reconciles against the
//! server's view of received chunks, and finalizes the upload.

use chrono::Utc;
use futures_util::StreamExt;
use reqwest::StatusCode;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use std::collections::HashSet;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adaptive::{AdaptivePolicy, backoff_delay};
use crate::config::{
    ADJUST_INTERVAL_SECS, MAX_CHUNK_RETRIES, MIB, PROGRESS_TICK_MS, RESYNC_INTERVAL_SECS,
    STUCK_DURATION_FRACTION, STUCK_MIN_ELAPSED_SECS, STUCK_PROGRESS_FRACTION,
    STUCK_SCAN_INTERVAL_SECS,
};
use crate::persist::{PersistedSession, SessionPersistence};
use crate::planner::{ChunkSpan, partition};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server rejected request: {0}")]
    Server(String),
    #[error("upload session not found")]
    SessionNotFound,
    #[error("source file is empty")]
    EmptySource,
    #[error("source path has no file name")]
    InvalidSource,
    #[error("upload not initialized")]
    NotInitialized,
    #[error("chunk {index} failed after {retries} attempts: {last_error}")]
    RetriesExhausted {
        index: u32,
        retries: u32,
        last_error: String,
    },
    #[error("transfer cancelled")]
    Cancelled,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ChunkState {
    Pending,
    Uploading,
    Completed,
    Failed,
}

struct ChunkTask {
    span: ChunkSpan,
    state: ChunkState,
    retries: u32,
    next_attempt_at: Option<Instant>,
    started_at: Option<Instant>,
    sent: Arc<AtomicU64>,
    abort: Option<CancellationToken>,
}

impl ChunkTask {
    fn new(span: ChunkSpan) -> Self {
        Self {
            span,
            state: ChunkState::Pending,
            retries: 0,
            next_attempt_at: None,
            started_at: None,
            sent: Arc::new(AtomicU64::new(0)),
            abort: None,
        }
    }

    fn dispatchable(&self, now: Instant) -> bool {
        match self.state {
            ChunkState::Pending => true,
            ChunkState::Failed => self
                .next_attempt_at
                .is_none_or(|at| at <= now),
            _ => false,
        }
    }
}

struct TransferState {
    tasks: Vec<ChunkTask>,
    total_size: u64,
    started_at: Instant,
    completed_bytes: u64,
    time_remaining: Option<Duration>,
}

impl TransferState {
    fn new(total_size: u64, spans: Vec<ChunkSpan>) -> Self {
        Self {
            tasks: spans.into_iter().map(ChunkTask::new).collect(),
            total_size,
            started_at: Instant::now(),
            completed_bytes: 0,
            time_remaining: None,
        }
    }

    fn bytes_sent(&self) -> u64 {
        let inflight: u64 = self
            .tasks
            .iter()
            .filter(|task| task.state == ChunkState::Uploading)
            .map(|task| task.sent.load(Ordering::Relaxed).min(task.span.len()))
            .sum();
        self.completed_bytes + inflight
    }

    fn completed_count(&self) -> u32 {
        self.tasks
            .iter()
            .filter(|task| task.state == ChunkState::Completed)
            .count() as u32
    }

    fn all_completed(&self) -> bool {
        self.tasks
            .iter()
            .all(|task| task.state == ChunkState::Completed)
    }
}

/// 进度快照，定时与状态变化时都会回调。
#[derive(Clone, Debug)]
pub struct TransferProgress {
    pub uploaded_bytes: u64,
    pub total_bytes: u64,
    pub percentage: f64,
    pub chunks_completed: u32,
    pub total_chunks: u32,
    pub time_elapsed: Duration,
    pub time_remaining: Option<Duration>,
    pub upload_speed: f64,
}

pub type ProgressCallback = Arc<dyn Fn(TransferProgress) + Send + Sync>;

#[derive(Clone, Debug)]
pub struct UploadPlan {
    pub upload_id: String,
    pub chunk_size: u64,
    pub total_chunks: u32,
    pub total_size: u64,
}

#[derive(Clone, Debug)]
pub struct CompletedUpload {
    pub path: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InitReply {
    success: bool,
    #[serde(default)]
    upload_id: Option<String>,
    #[serde(default)]
    chunk_size: Option<u64>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChunkReply {
    success: bool,
    #[serde(default)]
    bytes_written: Option<u64>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CompleteReply {
    success: bool,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    missing_chunks: Option<Vec<u32>>,
}

/// 服务端会话状态投影（客户端视角）。
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStatus {
    pub success: bool,
    pub received_chunks: u32,
    pub total_chunks: u32,
    pub missing_chunks: Vec<u32>,
    pub uploaded_bytes: u64,
    pub progress_percent: f64,
    pub is_complete: bool,
    #[serde(default)]
    pub staging_file_exists: bool,
    #[serde(default)]
    pub staging_file_size: u64,
}

enum ChunkOutcome {
    Done(u64),
    Failed(String),
    Stalled,
    SessionGone,
}

enum CompleteOutcome {
    Done(String),
    Missing(Vec<u32>),
}

/// 面向调用方的上传句柄。
pub struct UploadClient {
    source: PathBuf,
    base_url: String,
    folder_name: Option<String>,
    destination_path: Option<String>,
    chunk_size_override: Option<u64>,
    http: reqwest::Client,
    upload_id: Option<String>,
    state: Option<Arc<Mutex<TransferState>>>,
    policy: Arc<Mutex<AdaptivePolicy>>,
    cancel: CancellationToken,
    progress: Option<ProgressCallback>,
    persistence: Option<SessionPersistence>,
}

impl UploadClient {
    pub fn new(source: impl Into<PathBuf>, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            source: source.into(),
            base_url,
            folder_name: None,
            destination_path: None,
            chunk_size_override: None,
            http: reqwest::Client::new(),
            upload_id: None,
            state: None,
            policy: Arc::new(Mutex::new(AdaptivePolicy::new())),
            cancel: CancellationToken::new(),
            progress: None,
            persistence: None,
        }
    }

    pub fn with_folder(mut self, folder: impl Into<String>) -> Self {
        self.folder_name = Some(folder.into());
        self
    }

    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination_path = Some(destination.into());
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size_override = Some(chunk_size);
        self
    }

    /// 启用本地会话记录（重启后可重新查询未完成的上传）。
    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.persistence = Some(SessionPersistence::new(dir.into()));
        self
    }

    pub fn on_progress(&mut self, callback: impl Fn(TransferProgress) + Send + Sync + 'static) {
        self.progress = Some(Arc::new(callback));
    }

    pub fn set_session_id(&mut self, upload_id: impl Into<String>) {
        self.upload_id = Some(upload_id.into());
    }

    pub fn session_id(&self) -> Option<&str> {
        self.upload_id.as_deref()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// 取消传输：中止所有在途请求并停掉内部定时任务。
    /// 服务端已落盘的分片保留，会话不会被客户端取消动作删除。
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// 向服务器申请会话并按返回的分片计划切分源文件。
    pub async fn init(&mut self) -> Result<UploadPlan, ClientError> {
        let metadata = tokio::fs::metadata(&self.source).await?;
        let total_size = metadata.len();
        if total_size == 0 {
            return Err(ClientError::EmptySource);
        }
        let file_name = self
            .source
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .ok_or(ClientError::InvalidSource)?;

        let body = serde_json::json!({
            "fileName": file_name,
            "folderName": self.folder_name,
            "destinationPath": self.destination_path,
            "totalSize": total_size,
            "chunkSize": self.chunk_size_override,
            "originalFileName": file_name,
        });
        let response = self
            .http
            .post(format!("{}/upload/init", self.base_url))
            .json(&body)
            .send()
            .await?;
        let reply: InitReply = response.json().await?;
        if !reply.success {
            return Err(ClientError::Server(
                reply.error.unwrap_or_else(|| "init rejected".into()),
            ));
        }
        let upload_id = reply
            .upload_id
            .ok_or_else(|| ClientError::Server("init reply missing uploadId".into()))?;
        let chunk_size = reply
            .chunk_size
            .ok_or_else(|| ClientError::Server("init reply missing chunkSize".into()))?;

        let spans = partition(total_size, chunk_size);
        let total_chunks = spans.len() as u32;
        self.state = Some(Arc::new(Mutex::new(TransferState::new(total_size, spans))));
        self.upload_id = Some(upload_id.clone());

        if let Some(persistence) = &self.persistence {
            let record = PersistedSession {
                upload_id: upload_id.clone(),
                file_name: file_name.clone(),
                total_size,
                chunk_size,
                base_url: self.base_url.clone(),
                created_at: Utc::now(),
            };
            if let Err(err) = persistence.save(&record).await {
                warn!(error = %err, "failed to persist session record");
            }
        }

        info!(
            upload_id,
            file_name, total_size, chunk_size, total_chunks, "upload session opened"
        );
        Ok(UploadPlan {
            upload_id,
            chunk_size,
            total_chunks,
            total_size,
        })
    }

    /// 查询服务端会话状态。
    pub async fn status(&self) -> Result<ServerStatus, ClientError> {
        let upload_id = self.upload_id.as_deref().ok_or(ClientError::NotInitialized)?;
        fetch_status(&self.http, &self.base_url, upload_id).await
    }

    /// 当前进度快照（未初始化时为 None）。
    pub async fn progress_snapshot(&self) -> Option<TransferProgress> {
        let state = self.state.as_ref()?;
        let speed = self.policy.lock().await.throughput();
        let guard = state.lock().await;
        Some(compute_progress(&guard, speed))
    }

    /// 把所有分片送达并收尾。成功返回服务端落盘路径。
    pub async fn upload_all(&mut self) -> Result<CompletedUpload, ClientError> {
        let upload_id = self.upload_id.clone().ok_or(ClientError::NotInitialized)?;
        let state = self.state.clone().ok_or(ClientError::NotInitialized)?;

        let op_token = self.cancel.child_token();
        self.spawn_timers(upload_id.clone(), state.clone(), op_token.clone());
        let _timer_guard = op_token.clone().drop_guard();

        let mut resend_rounds = 0u32;
        loop {
            self.drive_chunks(&upload_id, &state, &op_token).await?;

            match self.request_complete(&upload_id).await? {
                CompleteOutcome::Done(path) => {
                    if let Some(persistence) = &self.persistence {
                        persistence.remove(&upload_id).await;
                    }
                    self.emit_progress(&state).await;
                    info!(upload_id, path, "upload finished");
                    return Ok(CompletedUpload { path });
                }
                CompleteOutcome::Missing(missing) => {
                    resend_rounds += 1;
                    if resend_rounds > 3 {
                        return Err(ClientError::Server(format!(
                            "server still missing {} chunks after resending",
                            missing.len()
                        )));
                    }
                    warn!(
                        upload_id,
                        missing = missing.len(),
                        "server reports missing chunks, resending"
                    );
                    let mut guard = state.lock().await;
                    requeue_missing(&mut guard, &missing);
                }
            }
        }
    }

    /// 调度循环：补位派发可跑的分片，等待某个在途分片落定。
    async fn drive_chunks(
        &self,
        upload_id: &str,
        state: &Arc<Mutex<TransferState>>,
        op_token: &CancellationToken,
    ) -> Result<(), ClientError> {
        let mut join_set: JoinSet<(u32, ChunkOutcome)> = JoinSet::new();

        loop {
            if self.cancel.is_cancelled() {
                join_set.shutdown().await;
                return Err(ClientError::Cancelled);
            }

            let policy_snapshot = *self.policy.lock().await;
            let now = Instant::now();
            let mut to_spawn = Vec::new();
            {
                let mut guard = state.lock().await;
                if guard.all_completed() {
                    join_set.shutdown().await;
                    return Ok(());
                }
                let active = guard
                    .tasks
                    .iter()
                    .filter(|task| task.state == ChunkState::Uploading)
                    .count();
                let free = policy_snapshot.current_parallelism().saturating_sub(active);
                if free > 0 {
                    for task in guard
                        .tasks
                        .iter_mut()
                        .filter(|task| task.dispatchable(now))
                        .take(free)
                    {
                        task.state = ChunkState::Uploading;
                        task.started_at = Some(now);
                        task.sent.store(0, Ordering::Relaxed);
                        let token = op_token.child_token();
                        task.abort = Some(token.clone());
                        to_spawn.push((
                            task.span,
                            policy_snapshot.chunk_timeout(task.span.len()),
                            task.sent.clone(),
                            token,
                        ));
                    }
                }
            }

            for (span, timeout, sent, token) in to_spawn {
                debug!(chunk_index = span.index, bytes = span.len(), "dispatching chunk");
                join_set.spawn(upload_one(
                    self.http.clone(),
                    self.base_url.clone(),
                    upload_id.to_string(),
                    self.source.clone(),
                    span,
                    timeout,
                    sent,
                    token,
                ));
            }

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    join_set.shutdown().await;
                    return Err(ClientError::Cancelled);
                }
                Some(joined) = join_set.join_next(), if !join_set.is_empty() => {
                    match joined {
                        Ok((index, outcome)) => {
                            self.handle_outcome(index, outcome, state).await?;
                        }
                        Err(err) => warn!(error = %err, "chunk task aborted unexpectedly"),
                    }
                }
                // 所有可派发分片都在退避窗口内时，稍后再扫一轮。
                _ = tokio::time::sleep(Duration::from_millis(200)) => {}
            }
        }
    }

    async fn handle_outcome(
        &self,
        index: u32,
        outcome: ChunkOutcome,
        state: &Arc<Mutex<TransferState>>,
    ) -> Result<(), ClientError> {
        {
            let mut guard = state.lock().await;
            let Some(task) = guard.tasks.get_mut(index as usize) else {
                return Ok(());
            };
            // 服务端对账可能已抢先标记完成。
            if task.state != ChunkState::Uploading {
                return Ok(());
            }
            task.abort = None;
            task.started_at = None;
            match outcome {
                ChunkOutcome::Done(bytes) => {
                    let len = task.span.len();
                    task.state = ChunkState::Completed;
                    task.sent.store(0, Ordering::Relaxed);
                    guard.completed_bytes += len;
                    debug!(chunk_index = index, bytes, "chunk acknowledged");
                }
                ChunkOutcome::Stalled => {
                    task.state = ChunkState::Pending;
                    task.sent.store(0, Ordering::Relaxed);
                    debug!(chunk_index = index, "stalled chunk requeued");
                }
                ChunkOutcome::SessionGone => {
                    return Err(ClientError::SessionNotFound);
                }
                ChunkOutcome::Failed(message) => {
                    task.retries += 1;
                    task.sent.store(0, Ordering::Relaxed);
                    if task.retries > MAX_CHUNK_RETRIES {
                        return Err(ClientError::RetriesExhausted {
                            index,
                            retries: task.retries,
                            last_error: message,
                        });
                    }
                    let delay = backoff_delay(task.retries);
                    task.state = ChunkState::Failed;
                    task.next_attempt_at = Some(Instant::now() + delay);
                    warn!(
                        chunk_index = index,
                        retries = task.retries,
                        delay_ms = delay.as_millis() as u64,
                        error = message,
                        "chunk attempt failed"
                    );
                }
            }
        }
        self.emit_progress(state).await;
        Ok(())
    }

    async fn request_complete(&self, upload_id: &str) -> Result<CompleteOutcome, ClientError> {
        let response = self
            .http
            .post(format!("{}/upload/complete", self.base_url))
            .json(&serde_json::json!({ "uploadId": upload_id }))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(ClientError::SessionNotFound);
        }
        let reply: CompleteReply = response.json().await?;
        if reply.success {
            Ok(CompleteOutcome::Done(reply.path.unwrap_or_default()))
        } else if let Some(missing) = reply.missing_chunks
            && !missing.is_empty()
        {
            Ok(CompleteOutcome::Missing(missing))
        } else {
            Err(ClientError::Server(
                reply.error.unwrap_or_else(|| "complete rejected".into()),
            ))
        }
    }

    async fn emit_progress(&self, state: &Arc<Mutex<TransferState>>) {
        if let Some(callback) = &self.progress {
            let speed = self.policy.lock().await.throughput();
            let progress = {
                let guard = state.lock().await;
                compute_progress(&guard, speed)
            };
            callback(progress);
        }
    }

    fn spawn_timers(
        &self,
        upload_id: String,
        state: Arc<Mutex<TransferState>>,
        token: CancellationToken,
    ) {
        // 进度播报
        if let Some(callback) = self.progress.clone() {
            let state = state.clone();
            let policy = self.policy.clone();
            let token = token.clone();
            tokio::spawn(async move {
                let mut interval =
                    tokio::time::interval(Duration::from_millis(PROGRESS_TICK_MS));
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = interval.tick() => {
                            let speed = policy.lock().await.throughput();
                            let progress = {
                                let mut guard = state.lock().await;
                                maybe_latch_time_remaining(&mut guard, speed);
                                compute_progress(&guard, speed)
                            };
                            callback(progress);
                        }
                    }
                }
            });
        }

        // 吞吐采样与并发调节
        {
            let state = state.clone();
            let policy = self.policy.clone();
            let token = token.clone();
            tokio::spawn(async move {
                let mut interval =
                    tokio::time::interval(Duration::from_secs(ADJUST_INTERVAL_SECS));
                let mut previous_bytes: u64 = 0;
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = interval.tick() => {
                            let bytes = state.lock().await.bytes_sent();
                            let delta = bytes.saturating_sub(previous_bytes);
                            previous_bytes = bytes;
                            let sample = delta as f64 / ADJUST_INTERVAL_SECS as f64;
                            let mut policy = policy.lock().await;
                            policy.observe_throughput(sample);
                            debug!(
                                sample_bps = sample,
                                smoothed_bps = policy.throughput(),
                                parallelism = policy.current_parallelism(),
                                "throughput sampled"
                            );
                        }
                    }
                }
            });
        }

        // 卡死侦测：超时且几乎没有字节流动的在途分片直接掐断重排。
        {
            let state = state.clone();
            let policy = self.policy.clone();
            let token = token.clone();
            tokio::spawn(async move {
                let mut interval =
                    tokio::time::interval(Duration::from_secs(STUCK_SCAN_INTERVAL_SECS));
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = interval.tick() => {
                            let policy_snapshot = *policy.lock().await;
                            let now = Instant::now();
                            let guard = state.lock().await;
                            for task in guard.tasks.iter() {
                                if task.state != ChunkState::Uploading {
                                    continue;
                                }
                                let Some(started_at) = task.started_at else { continue };
                                let elapsed = now.saturating_duration_since(started_at);
                                let expected = policy_snapshot.expected_duration(task.span.len());
                                let sent = task.sent.load(Ordering::Relaxed) as f64;
                                let stalled = elapsed
                                    >= Duration::from_secs(STUCK_MIN_ELAPSED_SECS)
                                    && elapsed >= expected.mul_f64(STUCK_DURATION_FRACTION)
                                    && sent < task.span.len() as f64 * STUCK_PROGRESS_FRACTION;
                                if stalled && let Some(abort) = &task.abort {
                                    warn!(
                                        chunk_index = task.span.index,
                                        elapsed_secs = elapsed.as_secs(),
                                        sent_bytes = sent as u64,
                                        "aborting stalled chunk"
                                    );
                                    abort.cancel();
                                }
                            }
                        }
                    }
                }
            });
        }

        // 服务端对账：响应丢失时把服务器已记录的分片补成完成态。
        {
            let http = self.http.clone();
            let base_url = self.base_url.clone();
            let state = state.clone();
            tokio::spawn(async move {
                let mut interval =
                    tokio::time::interval(Duration::from_secs(RESYNC_INTERVAL_SECS));
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = interval.tick() => {
                            let Ok(status) = fetch_status(&http, &base_url, &upload_id).await else {
                                continue;
                            };
                            let missing: HashSet<u32> =
                                status.missing_chunks.iter().copied().collect();
                            let mut guard = state.lock().await;
                            for i in 0..guard.tasks.len() {
                                let index = i as u32;
                                if index >= status.total_chunks || missing.contains(&index) {
                                    continue;
                                }
                                if guard.tasks[i].state == ChunkState::Completed {
                                    continue;
                                }
                                if let Some(abort) = guard.tasks[i].abort.take() {
                                    abort.cancel();
                                }
                                let len = guard.tasks[i].span.len();
                                guard.tasks[i].state = ChunkState::Completed;
                                guard.tasks[i].started_at = None;
                                guard.tasks[i].sent.store(0, Ordering::Relaxed);
                                guard.completed_bytes += len;
                                debug!(chunk_index = index, "chunk reconciled from server status");
                            }
                        }
                    }
                }
            });
        }
    }
}

/// 服务器报告缺失的分片重新排队（响应丢失或暂存受损的兜底）。
fn requeue_missing(state: &mut TransferState, missing: &[u32]) {
    for index in missing {
        let Some(task) = state.tasks.get_mut(*index as usize) else {
            continue;
        };
        if task.state == ChunkState::Completed {
            state.completed_bytes = state.completed_bytes.saturating_sub(task.span.len());
        }
        task.state = ChunkState::Pending;
        task.next_attempt_at = None;
        task.started_at = None;
        task.sent.store(0, Ordering::Relaxed);
    }
}

fn compute_progress(state: &TransferState, speed: f64) -> TransferProgress {
    let uploaded = state.bytes_sent();
    TransferProgress {
        uploaded_bytes: uploaded,
        total_bytes: state.total_size,
        percentage: uploaded as f64 / state.total_size as f64 * 100.0,
        chunks_completed: state.completed_count(),
        total_chunks: state.tasks.len() as u32,
        time_elapsed: state.started_at.elapsed(),
        time_remaining: state.time_remaining,
        upload_speed: speed,
    }
}

/// 首个稳定吞吐样本出现后估算一次剩余时间并固定，避免数字来回跳。
fn maybe_latch_time_remaining(state: &mut TransferState, speed: f64) {
    if state.time_remaining.is_some() {
        return;
    }
    let uploaded = state.bytes_sent();
    if speed > 0.0 && state.started_at.elapsed() >= Duration::from_secs(3) && uploaded >= MIB {
        let seconds = state.total_size.saturating_sub(uploaded) as f64 / speed;
        state.time_remaining = Some(Duration::from_secs_f64(seconds));
    }
}

async fn fetch_status(
    http: &reqwest::Client,
    base_url: &str,
    upload_id: &str,
) -> Result<ServerStatus, ClientError> {
    let response = http
        .get(format!("{base_url}/upload/status/{upload_id}"))
        .send()
        .await?;
    if response.status() == StatusCode::NOT_FOUND {
        return Err(ClientError::SessionNotFound);
    }
    Ok(response.json().await?)
}

/// 单个分片的一次上传尝试。
#[allow(clippy::too_many_arguments)]
async fn upload_one(
    http: reqwest::Client,
    base_url: String,
    upload_id: String,
    source: PathBuf,
    span: ChunkSpan,
    timeout: Duration,
    sent: Arc<AtomicU64>,
    token: CancellationToken,
) -> (u32, ChunkOutcome) {
    let index = span.index;
    let attempt = async {
        let mut file = match File::open(&source).await {
            Ok(file) => file,
            Err(err) => return ChunkOutcome::Failed(err.to_string()),
        };
        if let Err(err) = file.seek(SeekFrom::Start(span.start)).await {
            return ChunkOutcome::Failed(err.to_string());
        }
        let reader = file.take(span.len());
        let counter = sent.clone();
        let stream = ReaderStream::with_capacity(reader, 64 * 1024).map(move |frame| {
            if let Ok(bytes) = &frame {
                counter.fetch_add(bytes.len() as u64, Ordering::Relaxed);
            }
            frame
        });
        let part = Part::stream_with_length(reqwest::Body::wrap_stream(stream), span.len())
            .file_name(format!("chunk-{index}"));
        let form = Form::new()
            .text("uploadId", upload_id.clone())
            .text("chunkIndex", index.to_string())
            .part("chunk", part);

        let response = match http
            .post(format!("{base_url}/upload/chunk"))
            .multipart(form)
            .timeout(timeout)
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => return ChunkOutcome::Failed(err.to_string()),
        };
        if response.status() == StatusCode::NOT_FOUND {
            return ChunkOutcome::SessionGone;
        }
        match response.json::<ChunkReply>().await {
            Ok(reply) if reply.success => ChunkOutcome::Done(reply.bytes_written.unwrap_or(0)),
            Ok(reply) => {
                ChunkOutcome::Failed(reply.error.unwrap_or_else(|| "chunk rejected".into()))
            }
            Err(err) => ChunkOutcome::Failed(err.to_string()),
        }
    };

    tokio::select! {
        _ = token.cancelled() => (index, ChunkOutcome::Stalled),
        outcome = attempt => (index, outcome),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_state(total: u64, chunk: u64) -> TransferState {
        TransferState::new(total, partition(total, chunk))
    }

    #[test]
    fn tasks_cover_the_file() {
        let state = make_state(2 * MIB + 5, MIB);
        assert_eq!(state.tasks.len(), 3);
        assert_eq!(state.tasks[2].span.len(), 5);
    }

    #[test]
    fn progress_counts_completed_and_inflight_bytes() {
        let mut state = make_state(4 * MIB, MIB);
        state.tasks[0].state = ChunkState::Completed;
        state.completed_bytes = MIB;
        state.tasks[1].state = ChunkState::Uploading;
        state.tasks[1].sent.store(MIB / 2, Ordering::Relaxed);

        let progress = compute_progress(&state, 1_000.0);
        assert_eq!(progress.uploaded_bytes, MIB + MIB / 2);
        assert_eq!(progress.chunks_completed, 1);
        assert_eq!(progress.total_chunks, 4);
        assert!((progress.percentage - 37.5).abs() < 0.01);
    }

    #[test]
    fn inflight_counter_is_capped_at_chunk_size() {
        let mut state = make_state(2 * MIB, MIB);
        state.tasks[0].state = ChunkState::Uploading;
        // multipart 框架可能多计一点，不能把进度顶过分片大小。
        state.tasks[0].sent.store(MIB + 4_096, Ordering::Relaxed);
        assert_eq!(state.bytes_sent(), MIB);
    }

    #[test]
    fn requeue_missing_reverts_completed_chunks() {
        let mut state = make_state(3 * MIB, MIB);
        for task in &mut state.tasks {
            task.state = ChunkState::Completed;
        }
        state.completed_bytes = 3 * MIB;

        requeue_missing(&mut state, &[1]);
        assert_eq!(state.tasks[1].state, ChunkState::Pending);
        assert_eq!(state.completed_bytes, 2 * MIB);
        assert!(!state.all_completed());
    }

    #[test]
    fn failed_chunk_waits_out_its_backoff() {
        let mut state = make_state(MIB, MIB);
        let now = Instant::now();
        state.tasks[0].state = ChunkState::Failed;
        state.tasks[0].next_attempt_at = Some(now + Duration::from_secs(5));

        assert!(!state.tasks[0].dispatchable(now));
        assert!(state.tasks[0].dispatchable(now + Duration::from_secs(6)));
    }

    #[test]
    fn time_remaining_latches_once() {
        let mut state = make_state(10 * MIB, MIB);
        state.started_at = Instant::now() - Duration::from_secs(10);
        state.completed_bytes = 2 * MIB;
        for task in state.tasks.iter_mut().take(2) {
            task.state = ChunkState::Completed;
        }

        maybe_latch_time_remaining(&mut state, 1024.0 * 1024.0);
        let first = state.time_remaining.expect("latched");

        state.completed_bytes = 5 * MIB;
        maybe_latch_time_remaining(&mut state, 10.0 * 1024.0 * 1024.0);
        assert_eq!(state.time_remaining, Some(first));
    }
}
