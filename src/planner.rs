//! 分片大小规划与字节范围切分。

use crate::config::{
    LARGE_MIN_CHUNK_SIZE, LARGE_TARGET_CHUNKS, MAX_CHUNK_SIZE, MEDIUM_FILE_LIMIT,
    MEDIUM_MIN_CHUNK_SIZE, MEDIUM_TARGET_CHUNKS, MIB, MIN_CHUNK_SIZE, SMALL_FILE_LIMIT,
    SMALL_MIN_CHUNK_SIZE, SMALL_TARGET_CHUNKS,
};

/// 根据文件总大小选定分片大小。调用方保证 `total_size > 0`。
pub fn plan_chunk_size(total_size: u64) -> u64 {
    debug_assert!(total_size > 0);

    let (target_chunks, min_chunk) = if total_size < SMALL_FILE_LIMIT {
        (SMALL_TARGET_CHUNKS, SMALL_MIN_CHUNK_SIZE)
    } else if total_size < MEDIUM_FILE_LIMIT {
        (MEDIUM_TARGET_CHUNKS, MEDIUM_MIN_CHUNK_SIZE)
    } else {
        (LARGE_TARGET_CHUNKS, LARGE_MIN_CHUNK_SIZE)
    };

    let ideal = total_size / target_chunks;
    if ideal < min_chunk {
        min_chunk
    } else if ideal > MAX_CHUNK_SIZE {
        MAX_CHUNK_SIZE
    } else {
        // 取整到整兆，避免奇怪的分片边界。
        (ideal / MIB) * MIB
    }
}

/// 客户端自带分片大小时收敛到协议允许的范围。
pub fn clamp_chunk_size(requested: u64) -> u64 {
    requested.clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE)
}

pub fn total_chunks(total_size: u64, chunk_size: u64) -> u32 {
    total_size.div_ceil(chunk_size) as u32
}

/// 第 `index` 个分片的期望字节数（末片可能更短）。
pub fn expected_chunk_len(index: u32, total_size: u64, chunk_size: u64) -> u64 {
    let offset = index as u64 * chunk_size;
    chunk_size.min(total_size.saturating_sub(offset))
}

/// One contiguous byte range of the source file, uploaded independently.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkSpan {
    pub index: u32,
    pub start: u64,
    pub end: u64,
}

impl ChunkSpan {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// 把 `[0, total_size)` 切成连续、不重叠、完整覆盖的半开区间。
pub fn partition(total_size: u64, chunk_size: u64) -> Vec<ChunkSpan> {
    let count = total_chunks(total_size, chunk_size);
    (0..count)
        .map(|index| {
            let start = index as u64 * chunk_size;
            ChunkSpan {
                index,
                start,
                end: (start + chunk_size).min(total_size),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_file_uses_tier_minimum() {
        // 25MB 落在 small 档，理想分片远小于档位下限。
        let chunk = plan_chunk_size(25 * MIB);
        assert_eq!(chunk, SMALL_MIN_CHUNK_SIZE);
        assert_eq!(total_chunks(25 * MIB, chunk), 3);
    }

    #[test]
    fn medium_file_rounds_down_to_whole_mebibytes() {
        let total = 2 * 1024 * MIB + 123_456;
        let chunk = plan_chunk_size(total);
        assert_eq!(chunk % MIB, 0);
        assert!(chunk >= MEDIUM_MIN_CHUNK_SIZE);
        assert!(chunk <= MAX_CHUNK_SIZE);
    }

    #[test]
    fn huge_file_is_clamped_to_ceiling() {
        let total = 40 * 1024 * 1024 * MIB;
        assert_eq!(plan_chunk_size(total), MAX_CHUNK_SIZE);
    }

    #[test]
    fn planned_size_always_within_bounds() {
        for total in [1, MIB, 499 * MIB, SMALL_FILE_LIMIT, 4 * 1024 * MIB, 9 * 1024 * MIB] {
            let chunk = plan_chunk_size(total);
            assert!(chunk >= SMALL_MIN_CHUNK_SIZE.min(MEDIUM_MIN_CHUNK_SIZE));
            assert!(chunk <= MAX_CHUNK_SIZE);
            assert!(total_chunks(total, chunk) >= 1);
        }
    }

    #[test]
    fn partition_covers_file_exactly() {
        let total = 26_214_400u64; // 25MB
        let chunk = plan_chunk_size(total);
        let spans = partition(total, chunk);

        assert_eq!(spans.len(), 3);
        assert_eq!(spans[0].start, 0);
        assert_eq!(spans.last().unwrap().end, total);
        for pair in spans.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
        }
        let sum: u64 = spans.iter().map(ChunkSpan::len).sum();
        assert_eq!(sum, total);
    }

    #[test]
    fn last_chunk_may_be_short() {
        let spans = partition(10 * MIB + 5, 10 * MIB);
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[1].len(), 5);
        assert_eq!(expected_chunk_len(1, 10 * MIB + 5, 10 * MIB), 5);
        assert_eq!(expected_chunk_len(0, 10 * MIB + 5, 10 * MIB), 10 * MIB);
    }
}
