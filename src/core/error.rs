//! 轮次错误类型
//!
//! StageError 是单个子任务的失败（含阶段超时），由重试策略消化；
//! TurnError 是调用方最终看到的拒绝原因，只由 TurnCoordinator 抛出。
//! 过期结果（stale result）不是错误，直接丢弃；持久化失败只记日志。

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::state::Stage;

/// 子任务单次执行失败
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StageError {
    /// 阶段超时（意图识别 30s / 数据读取 120s），按普通失败进入重试
    #[error("timed out after {0}ms")]
    Timeout(u64),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("invalid output: {0}")]
    InvalidOutput(String),

    #[error("{0}")]
    Failed(String),
}

/// 调用方可见的轮次失败
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TurnError {
    /// 消息列表中没有可用的 User 消息
    #[error("Invalid turn: {0}")]
    InvalidTurn(String),

    #[error("{stage} failed after {attempts} retries: {last_error}")]
    RetryExhausted {
        stage: Stage,
        attempts: u8,
        last_error: StageError,
    },

    /// 不重试的阶段（问候 / 总结 / 系统信息）失败
    #[error("{stage} failed: {source}")]
    SubTaskFailure { stage: Stage, source: StageError },

    #[error("Turn did not complete within {0}s")]
    OverallTimeout(u64),

    /// 会话仍在加载上下文，尚不能接收轮次
    #[error("Conversation is still loading its context")]
    NotReady,

    #[error("Conversation is stopped")]
    ConversationStopped,

    #[error("Stop is only accepted while idle (current state: {0})")]
    StopRejected(String),

    #[error("Conversation actor closed")]
    ActorClosed,
}
