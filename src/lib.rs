//! Turnwright - 数据工作区对话的轮次编排引擎
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 重试、缓存、层级状态机、会话 actor、轮次协调、会话引擎
//! - **llm**: 模型提供方抽象与实现（OpenAI 兼容 / DeepSeek / Mock）
//! - **memory**: 对话消息、快照持久化、消息与用量仓库
//! - **observability**: 日志初始化与遥测接口
//! - **subtask**: 子任务接口（加载上下文、意图识别、回复生成、数据查询）

pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod subtask;

pub use crate::config::{load_config, AppConfig};
pub use crate::core::{ConversationEngine, ConversationSpec, StreamHandle, TurnError};
