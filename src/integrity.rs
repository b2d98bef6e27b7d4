//! 收尾前的整体大小校验。

use std::io::ErrorKind;
use std::path::Path;
use tokio::fs;

use crate::config::SIZE_TOLERANCE;

#[derive(Clone, Copy, Debug)]
pub struct IntegrityReport {
    pub valid: bool,
    pub actual_size: u64,
    pub expected_size: u64,
}

/// 校验暂存文件总长度与声明大小是否一致（允许少量容差）。
///
/// 这是搬运到最终位置前的最后一道闸，能兜住单片校验漏掉的静默
/// 少写/多写（例如尚未刷盘的尾部分片）。
pub async fn validate_staged_file(
    staging: &Path,
    expected_size: u64,
) -> std::io::Result<IntegrityReport> {
    let actual_size = match fs::metadata(staging).await {
        Ok(metadata) => metadata.len(),
        Err(err) if err.kind() == ErrorKind::NotFound => 0,
        Err(err) => return Err(err),
    };
    Ok(IntegrityReport {
        valid: actual_size.abs_diff(expected_size) <= SIZE_TOLERANCE,
        actual_size,
        expected_size,
    })
}
