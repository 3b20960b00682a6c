//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `TURNWRIGHT__*` 覆盖
//! （双下划线表示嵌套，如 `TURNWRIGHT__ORCHESTRATION__TURN_DEADLINE_SECS=90`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::core::{RetryPolicy, StageTimeouts};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub orchestration: OrchestrationSection,
}

/// [app] 段：名称、快照目录、是否在每次状态迁移后持久化
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: Option<String>,
    /// 会话快照目录；未设置时只保存在内存
    pub snapshot_dir: Option<PathBuf>,
    /// 每次状态迁移后写快照（测试中可关闭）
    pub persist_transitions: bool,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            snapshot_dir: None,
            persist_transitions: true,
        }
    }
}

/// [llm] 段：后端选择与默认模型
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// 后端：deepseek / openai / mock
    pub provider: String,
    /// 新会话的默认模型
    pub model: String,
    pub base_url: Option<String>,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "deepseek".to_string(),
            model: "deepseek-chat".to_string(),
            base_url: None,
        }
    }
}

/// [orchestration] 段：重试、阶段超时、整轮期限、意图缓存
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestrationSection {
    pub max_retries: u8,
    /// 退避基数，第 n 次重试等待 2^n * base
    pub backoff_base_ms: u64,
    pub classify_timeout_secs: u64,
    pub read_data_timeout_secs: u64,
    /// 整轮期限，与阶段超时独立
    pub turn_deadline_secs: u64,
    pub intent_cache_ttl_secs: u64,
}

impl Default for OrchestrationSection {
    fn default() -> Self {
        Self {
            max_retries: crate::core::retry::DEFAULT_MAX_RETRIES,
            backoff_base_ms: crate::core::retry::DEFAULT_BACKOFF_BASE_MS,
            classify_timeout_secs: 30,
            read_data_timeout_secs: 120,
            turn_deadline_secs: 60,
            intent_cache_ttl_secs: 60,
        }
    }
}

impl OrchestrationSection {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, Duration::from_millis(self.backoff_base_ms))
    }

    pub fn stage_timeouts(&self) -> StageTimeouts {
        StageTimeouts {
            classify: Duration::from_secs(self.classify_timeout_secs),
            read_data: Duration::from_secs(self.read_data_timeout_secs),
        }
    }

    pub fn turn_deadline(&self) -> Duration {
        Duration::from_secs(self.turn_deadline_secs)
    }

    pub fn intent_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.intent_cache_ttl_secs)
    }
}

/// 从 config 目录加载配置，环境变量 TURNWRIGHT__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 TURNWRIGHT__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("TURNWRIGHT")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
