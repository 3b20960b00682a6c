//! 重试策略：纯函数，根据已重试次数决定重试 / 退避时长 / 放弃
//!
//! 意图识别与数据读取两个阶段共用同一策略；次数达到上限后阶段终止并写入上下文 error。

use std::time::Duration;

/// 默认最大重试次数
pub const DEFAULT_MAX_RETRIES: u8 = 3;
/// 默认退避基数（毫秒）
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 1000;

/// 单次失败后的决策
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// 等待 delay 后重试
    Retry { delay: Duration },
    /// 重试次数已耗尽
    GiveUp,
}

/// 有界重试 + 指数退避（1s、2s、4s）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u8,
    backoff_base: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u8, backoff_base: Duration) -> Self {
        Self {
            max_retries,
            backoff_base,
        }
    }

    pub fn max_retries(&self) -> u8 {
        self.max_retries
    }

    pub fn should_retry(&self, attempt: u8) -> bool {
        attempt < self.max_retries
    }

    pub fn retry_limit_exceeded(&self, attempt: u8) -> bool {
        attempt >= self.max_retries
    }

    /// 2^attempt * base；指数封顶在 16，避免溢出
    pub fn backoff_delay(&self, attempt: u8) -> Duration {
        let factor = 1u32 << u32::from(attempt.min(16));
        self.backoff_base.saturating_mul(factor)
    }

    /// attempt 为失败发生时的 retry_count
    pub fn decide(&self, attempt: u8) -> RetryDecision {
        if self.should_retry(attempt) {
            RetryDecision::Retry {
                delay: self.backoff_delay(attempt),
            }
        } else {
            RetryDecision::GiveUp
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(
            DEFAULT_MAX_RETRIES,
            Duration::from_millis(DEFAULT_BACKOFF_BASE_MS),
        )
    }
}
