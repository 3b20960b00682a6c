//! 会话状态机的状态与上下文定义
//!
//! 顶层：LoadContext（初始）→ Idle ⇄ Running → Stopped（终态）。
//! Running 是复合状态：DetectIntent{Attempting ⇄ Retrying} → Summarize | Greeting | ReadData | SystemInfo → Streaming。

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::error::TurnError;
use crate::core::handle::StreamHandle;
use crate::memory::Message;
use crate::subtask::Intent;

/// 子任务种类（也是错误与遥测里的阶段名）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    LoadContext,
    ClassifyIntent,
    Summarize,
    Greet,
    ReadData,
    SystemInfo,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::LoadContext => "load-context",
            Stage::ClassifyIntent => "classification",
            Stage::Summarize => "summarize",
            Stage::Greet => "greeting",
            Stage::ReadData => "read-data",
            Stage::SystemInfo => "system-info",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// DetectIntent 子状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectPhase {
    Attempting,
    Retrying,
}

/// ReadData 区域的子状态；completed / failed 在同一次迁移中直接离开 ReadData
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadDataPhase {
    Invoking,
    Retrying,
}

/// Running 复合状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "stage", content = "phase", rename_all = "snake_case")]
pub enum RunningState {
    DetectIntent(DetectPhase),
    Summarize,
    Greeting,
    ReadData(ReadDataPhase),
    SystemInfo,
    Streaming,
}

/// 顶层状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "running", rename_all = "snake_case")]
pub enum ConversationState {
    LoadContext,
    Idle,
    Running(RunningState),
    Stopped,
}

impl ConversationState {
    pub fn is_loading(&self) -> bool {
        matches!(self, ConversationState::LoadContext)
    }

    pub fn is_running(&self) -> bool {
        matches!(self, ConversationState::Running(_))
    }

    /// 点分路径，如 running.detect_intent.attempting
    pub fn path(&self) -> String {
        match self {
            ConversationState::LoadContext => "load_context".into(),
            ConversationState::Idle => "idle".into(),
            ConversationState::Stopped => "stopped".into(),
            ConversationState::Running(running) => {
                let inner = match running {
                    RunningState::DetectIntent(DetectPhase::Attempting) => {
                        "detect_intent.attempting"
                    }
                    RunningState::DetectIntent(DetectPhase::Retrying) => "detect_intent.retrying",
                    RunningState::Summarize => "summarize",
                    RunningState::Greeting => "greeting",
                    RunningState::ReadData(ReadDataPhase::Invoking) => "read_data.invoking",
                    RunningState::ReadData(ReadDataPhase::Retrying) => "read_data.retrying",
                    RunningState::SystemInfo => "system_info",
                    RunningState::Streaming => "streaming",
                };
                format!("running.{inner}")
            }
        }
    }
}

impl fmt::Display for ConversationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path())
    }
}

/// 会话上下文：只由状态机迁移修改，随快照持久化
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationContext {
    pub conversation_id: String,
    /// 便于查找的稳定别名
    pub slug: String,
    pub model: String,
    /// 当前轮次的输入文本（最后一条 User 消息）
    pub input: String,
    pub history: Vec<Message>,
    pub intent: Option<Intent>,
    pub retry_count: u8,
    pub error: Option<TurnError>,
    pub prompt_source: Option<String>,
    /// 当前轮次代号，单调递增，跨重启保持
    pub generation: u64,
    #[serde(skip)]
    pub stream_result: Option<StreamHandle>,
}

impl ConversationContext {
    pub fn new(
        conversation_id: impl Into<String>,
        slug: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            slug: slug.into(),
            model: model.into(),
            input: String::new(),
            history: Vec::new(),
            intent: None,
            retry_count: 0,
            error: None,
            prompt_source: None,
            generation: 0,
            stream_result: None,
        }
    }
}

/// 状态 + 上下文：发布给观察者、写入持久化的单位
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineSnapshot {
    pub state: ConversationState,
    pub context: ConversationContext,
}

impl MachineSnapshot {
    /// 当前轮次已产生的结果
    pub fn result_for(&self, generation: u64) -> Option<&StreamHandle> {
        self.context
            .stream_result
            .as_ref()
            .filter(|h| h.generation() == generation)
    }

    /// 当前轮次的终止错误
    pub fn error_for(&self, generation: u64) -> Option<&TurnError> {
        if self.context.generation == generation {
            self.context.error.as_ref()
        } else {
            None
        }
    }
}

/// 阶段超时
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageTimeouts {
    pub classify: Duration,
    pub read_data: Duration,
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            classify: Duration::from_secs(30),
            read_data: Duration::from_secs(120),
        }
    }
}
