//! 分片落盘排队器：同一暂存文件的写入严格串行，不同文件互不影响。

use futures_util::{Stream, StreamExt, pin_mut};
use std::collections::HashMap;
use std::fmt;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::SIZE_TOLERANCE;

/// 单个分片写入结果。
#[derive(Clone, Copy, Debug)]
pub struct ChunkWrite {
    pub chunk_index: u32,
    pub bytes_written: u64,
}

#[derive(Debug)]
pub enum WriteError {
    SizeMismatch { expected: u64, written: u64 },
    Truncated { file_len: u64, needed: u64 },
    Stream(String),
    Io(std::io::Error),
}

impl fmt::Display for WriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteError::SizeMismatch { expected, written } => {
                write!(f, "chunk size mismatch: expected {expected} bytes, wrote {written}")
            }
            WriteError::Truncated { file_len, needed } => {
                write!(f, "staging file truncated: len {file_len}, needed {needed}")
            }
            WriteError::Stream(msg) => write!(f, "payload stream failed: {msg}"),
            WriteError::Io(err) => write!(f, "io error: {err}"),
        }
    }
}

impl From<std::io::Error> for WriteError {
    fn from(err: std::io::Error) -> Self {
        WriteError::Io(err)
    }
}

/// Serializes chunk writes per staging file path. Tokio mutexes hand the lock
/// to waiters in arrival order, so enqueued writes for one file run FIFO while
/// different files proceed concurrently.
#[derive(Debug, Default)]
pub struct ChunkWriter {
    locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl ChunkWriter {
    pub fn new() -> Self {
        Self::default()
    }

    async fn lock_for(&self, path: &Path) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(path.to_path_buf())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// 将分片流写到暂存文件的固定偏移并校验字节数。
    ///
    /// 同一文件的并发调用会排队；任何错误都会转成结构化结果返回，
    /// 并在返回时释放该文件的队列。
    pub async fn write_chunk<S, B, E>(
        &self,
        staging: &Path,
        chunk_index: u32,
        offset: u64,
        expected_len: u64,
        payload: S,
    ) -> Result<ChunkWrite, WriteError>
    where
        S: Stream<Item = Result<B, E>>,
        B: AsRef<[u8]>,
        E: fmt::Display,
    {
        let _guard = self.lock_for(staging).await;

        if let Some(parent) = staging.parent() {
            fs::create_dir_all(parent).await?;
        }

        // 不截断：分片可能乱序到达，截断会抹掉先落盘的后续分片。
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .open(staging)
            .await?;
        file.seek(SeekFrom::Start(offset)).await?;

        let mut written: u64 = 0;
        pin_mut!(payload);
        while let Some(frame) = payload.next().await {
            let frame = frame.map_err(|err| WriteError::Stream(err.to_string()))?;
            let bytes = frame.as_ref();
            if bytes.is_empty() {
                continue;
            }
            written += bytes.len() as u64;
            if written > expected_len + SIZE_TOLERANCE {
                warn!(
                    chunk_index,
                    written, expected_len, "chunk payload exceeds expected size"
                );
                return Err(WriteError::SizeMismatch {
                    expected: expected_len,
                    written,
                });
            }
            file.write_all(bytes).await?;
        }
        file.flush().await?;
        file.sync_data().await?;

        if written.abs_diff(expected_len) > SIZE_TOLERANCE {
            return Err(WriteError::SizeMismatch {
                expected: expected_len,
                written,
            });
        }

        // 再 stat 一次，防御静默截断。
        let file_len = fs::metadata(staging).await?.len();
        let needed = offset + written;
        if file_len + SIZE_TOLERANCE < needed {
            return Err(WriteError::Truncated { file_len, needed });
        }

        debug!(chunk_index, offset, bytes = written, "chunk written");
        Ok(ChunkWrite {
            chunk_index,
            bytes_written: written,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use std::convert::Infallible;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn payload(data: Vec<u8>) -> impl Stream<Item = Result<Vec<u8>, Infallible>> {
        stream::iter(vec![Ok(data)])
    }

    #[tokio::test]
    async fn out_of_order_writes_produce_index_order_content() {
        let temp = tempdir().expect("tempdir");
        let staging = temp.path().join("u1").join("movie.mkv.part");
        let writer = Arc::new(ChunkWriter::new());

        let chunks: Vec<(u32, Vec<u8>)> = vec![
            (2, vec![b'c'; 4]),
            (0, vec![b'a'; 8]),
            (1, vec![b'b'; 8]),
        ];

        let mut handles = Vec::new();
        for (index, data) in chunks {
            let writer = writer.clone();
            let staging = staging.clone();
            handles.push(tokio::spawn(async move {
                let expected = data.len() as u64;
                writer
                    .write_chunk(&staging, index, index as u64 * 8, expected, payload(data))
                    .await
            }));
        }
        for handle in handles {
            handle.await.expect("join").expect("write");
        }

        let contents = std::fs::read(&staging).expect("read staging");
        let mut expected = vec![b'a'; 8];
        expected.extend(vec![b'b'; 8]);
        expected.extend(vec![b'c'; 4]);
        assert_eq!(contents, expected);
    }

    #[tokio::test]
    async fn short_payload_is_a_size_mismatch() {
        let temp = tempdir().expect("tempdir");
        let staging = temp.path().join("short.part");
        let writer = ChunkWriter::new();

        let result = writer
            .write_chunk(&staging, 0, 0, 8_192, payload(vec![1u8; 16]))
            .await;
        assert!(matches!(result, Err(WriteError::SizeMismatch { .. })));
    }

    #[tokio::test]
    async fn oversized_payload_stops_early() {
        let temp = tempdir().expect("tempdir");
        let staging = temp.path().join("long.part");
        let writer = ChunkWriter::new();

        let result = writer
            .write_chunk(&staging, 0, 0, 16, payload(vec![1u8; 16 + 2_048]))
            .await;
        assert!(matches!(result, Err(WriteError::SizeMismatch { .. })));
    }

    #[tokio::test]
    async fn small_framing_slack_is_tolerated() {
        let temp = tempdir().expect("tempdir");
        let staging = temp.path().join("slack.part");
        let writer = ChunkWriter::new();

        let write = writer
            .write_chunk(&staging, 0, 0, 1_000, payload(vec![7u8; 1_000 + 512]))
            .await
            .expect("tolerated");
        assert_eq!(write.bytes_written, 1_512);
    }
}
