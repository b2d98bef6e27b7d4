//! Adaptive transfer policy: parallelism, per-chunk timeouts, retry backoff.
//!
//! Kept free of scheduling concerns so the policy can be tested on its own.

use rand::Rng;
use std::time::Duration;

use crate::config::{
    BACKOFF_BASE_MS, BACKOFF_CAP_MS, INITIAL_PARALLELISM, MAX_CHUNK_TIMEOUT_SECS, MAX_PARALLELISM,
    MIN_CHUNK_TIMEOUT_SECS, THROUGHPUT_EMA_ALPHA, TIMEOUT_SAFETY_FACTOR,
};

const KIB_F: f64 = 1024.0;
const MIB_F: f64 = 1024.0 * 1024.0;

// Assumed floor when no throughput sample exists yet; keeps duration math
// finite on a dead-silent link.
const THROUGHPUT_FLOOR: f64 = 64.0 * KIB_F;

/// 吞吐平滑与并发决策的状态载体。
#[derive(Clone, Copy, Debug)]
pub struct AdaptivePolicy {
    current_parallelism: usize,
    smoothed_throughput: f64,
}

impl Default for AdaptivePolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl AdaptivePolicy {
    pub fn new() -> Self {
        Self {
            current_parallelism: INITIAL_PARALLELISM,
            smoothed_throughput: 0.0,
        }
    }

    /// 喂入一个吞吐采样（字节/秒），指数滑动平均后重算并发度。
    pub fn observe_throughput(&mut self, sample_bps: f64) {
        if sample_bps < 0.0 {
            return;
        }
        if self.smoothed_throughput <= 0.0 {
            if sample_bps > 0.0 {
                self.smoothed_throughput = sample_bps;
            }
        } else {
            self.smoothed_throughput = THROUGHPUT_EMA_ALPHA * sample_bps
                + (1.0 - THROUGHPUT_EMA_ALPHA) * self.smoothed_throughput;
        }
        self.current_parallelism = next_parallelism(self.smoothed_throughput);
    }

    pub fn current_parallelism(&self) -> usize {
        self.current_parallelism
    }

    pub fn throughput(&self) -> f64 {
        self.smoothed_throughput
    }

    /// 按当前网速推算一个分片的超时：大小/吞吐 × 安全系数，再夹取上下限。
    pub fn chunk_timeout(&self, chunk_size: u64) -> Duration {
        let speed = self.smoothed_throughput.max(THROUGHPUT_FLOOR);
        let secs = chunk_size as f64 / speed * TIMEOUT_SAFETY_FACTOR;
        Duration::from_secs_f64(secs.clamp(
            MIN_CHUNK_TIMEOUT_SECS as f64,
            MAX_CHUNK_TIMEOUT_SECS as f64,
        ))
    }

    /// 一个分片在当前网速下的预期传输时长（卡死判定用）。
    pub fn expected_duration(&self, chunk_size: u64) -> Duration {
        let speed = self.smoothed_throughput.max(THROUGHPUT_FLOOR);
        Duration::from_secs_f64(chunk_size as f64 / speed)
    }
}

/// 网速到并发度的映射：慢链路收敛到 1，快链路拉满到上限。
pub fn next_parallelism(throughput_bps: f64) -> usize {
    if throughput_bps <= 0.0 {
        INITIAL_PARALLELISM
    } else if throughput_bps < 256.0 * KIB_F {
        1
    } else if throughput_bps < MIB_F {
        2
    } else if throughput_bps < 4.0 * MIB_F {
        3
    } else if throughput_bps < 10.0 * MIB_F {
        4
    } else {
        MAX_PARALLELISM
    }
}

/// 第 `retries` 次失败后的基础退避（不含抖动）。
pub fn base_backoff(retries: u32) -> Duration {
    let exponent = retries.min(16);
    let millis = BACKOFF_BASE_MS
        .saturating_mul(1u64 << exponent)
        .min(BACKOFF_CAP_MS);
    Duration::from_millis(millis)
}

/// 基础退避加上 1%–30% 的随机抖动，错开同时失败分片的重试风暴。
pub fn backoff_delay(retries: u32) -> Duration {
    let base = base_backoff(retries);
    let jitter_fraction = rand::thread_rng().gen_range(0.01..=0.30);
    base + base.mul_f64(jitter_fraction)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_backoff_is_monotone_and_capped() {
        let mut previous = Duration::ZERO;
        for retries in 0..10 {
            let delay = base_backoff(retries);
            assert!(delay >= previous, "backoff shrank at retry {retries}");
            assert!(delay <= Duration::from_millis(BACKOFF_CAP_MS));
            previous = delay;
        }
        assert_eq!(base_backoff(9), Duration::from_millis(BACKOFF_CAP_MS));
    }

    #[test]
    fn backoff_delay_always_adds_positive_jitter() {
        for retries in 0..6 {
            let base = base_backoff(retries);
            for _ in 0..32 {
                let delay = backoff_delay(retries);
                assert!(delay > base, "jitter must be strictly positive");
                assert!(delay <= base + base.mul_f64(0.31));
            }
        }
    }

    #[test]
    fn slow_links_converge_to_single_stream() {
        let mut policy = AdaptivePolicy::new();
        for _ in 0..20 {
            policy.observe_throughput(20.0 * KIB_F);
        }
        assert_eq!(policy.current_parallelism(), 1);
    }

    #[test]
    fn fast_links_ramp_to_ceiling() {
        let mut policy = AdaptivePolicy::new();
        for _ in 0..20 {
            policy.observe_throughput(50.0 * MIB_F);
        }
        assert_eq!(policy.current_parallelism(), MAX_PARALLELISM);
    }

    #[test]
    fn ema_smooths_a_single_outlier() {
        let mut policy = AdaptivePolicy::new();
        policy.observe_throughput(8.0 * MIB_F);
        policy.observe_throughput(64.0 * KIB_F);
        // 一次掉速不应把平滑值直接拉到谷底。
        assert!(policy.throughput() > 5.0 * MIB_F);
    }

    #[test]
    fn chunk_timeout_is_clamped() {
        let mut policy = AdaptivePolicy::new();
        policy.observe_throughput(100.0 * MIB_F);
        assert_eq!(
            policy.chunk_timeout(1024),
            Duration::from_secs(MIN_CHUNK_TIMEOUT_SECS)
        );

        let mut slow = AdaptivePolicy::new();
        slow.observe_throughput(16.0 * KIB_F);
        assert_eq!(
            slow.chunk_timeout(100 * 1024 * 1024),
            Duration::from_secs(MAX_CHUNK_TIMEOUT_SECS)
        );
    }
}
