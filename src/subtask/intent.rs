//! 意图类型与模型输出解析
//!
//! 模型返回 JSON 对象（{"intent": "read-data", "needs_sql": true, ...}）或单个标签；
//! 无法识别的标签归为 Other，走总结分支。

use serde::{Deserialize, Serialize};

use crate::core::StageError;

/// 识别出的意图类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IntentKind {
    /// 问候、寒暄
    Greeting,
    /// 其他问题，走总结分支
    Other,
    /// 需要查询数据（自然语言 → 查询执行）
    ReadData,
    /// 关于系统本身的问题
    System,
}

impl IntentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntentKind::Greeting => "greeting",
            IntentKind::Other => "other",
            IntentKind::ReadData => "read-data",
            IntentKind::System => "system",
        }
    }

    fn from_label(label: &str) -> Self {
        match label.trim().to_lowercase().replace('_', "-").as_str() {
            "greeting" => IntentKind::Greeting,
            "read-data" | "readdata" => IntentKind::ReadData,
            "system" => IntentKind::System,
            _ => IntentKind::Other,
        }
    }
}

/// 问题复杂度（由分类模型给出）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    #[default]
    Simple,
    Moderate,
    Complex,
}

/// 分类结果：意图 + 派生标记
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Intent {
    pub kind: IntentKind,
    #[serde(default)]
    pub needs_chart: bool,
    #[serde(default)]
    pub needs_sql: bool,
    #[serde(default)]
    pub complexity: Complexity,
}

impl Intent {
    pub fn new(kind: IntentKind) -> Self {
        Self {
            kind,
            needs_chart: false,
            needs_sql: kind == IntentKind::ReadData,
            complexity: Complexity::Simple,
        }
    }

    pub fn with_chart(mut self) -> Self {
        self.needs_chart = true;
        self
    }

    pub fn with_complexity(mut self, complexity: Complexity) -> Self {
        self.complexity = complexity;
        self
    }
}

#[derive(Deserialize)]
struct RawIntent {
    intent: String,
    #[serde(default)]
    needs_chart: bool,
    #[serde(default)]
    needs_sql: Option<bool>,
    #[serde(default)]
    complexity: Option<Complexity>,
}

/// 解析分类模型输出；空输出视为无效，交给重试策略
pub fn parse_intent(output: &str) -> Result<Intent, StageError> {
    let trimmed = output
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();
    if trimmed.is_empty() {
        return Err(StageError::InvalidOutput("empty classification".into()));
    }

    if trimmed.starts_with('{') {
        let raw: RawIntent = serde_json::from_str(trimmed)
            .map_err(|e| StageError::InvalidOutput(e.to_string()))?;
        let kind = IntentKind::from_label(&raw.intent);
        return Ok(Intent {
            kind,
            needs_chart: raw.needs_chart,
            needs_sql: raw.needs_sql.unwrap_or(kind == IntentKind::ReadData),
            complexity: raw.complexity.unwrap_or_default(),
        });
    }

    let label = trimmed.split_whitespace().next().unwrap_or(trimmed);
    Ok(Intent::new(IntentKind::from_label(label)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_json_intent() {
        let intent = parse_intent(
            r#"{"intent": "read-data", "needs_chart": true, "complexity": "complex"}"#,
        )
        .unwrap();
        assert_eq!(intent.kind, IntentKind::ReadData);
        assert!(intent.needs_chart);
        assert!(intent.needs_sql);
        assert_eq!(intent.complexity, Complexity::Complex);
    }

    #[test]
    fn test_parse_fenced_json() {
        let intent = parse_intent("```json\n{\"intent\": \"system\"}\n```").unwrap();
        assert_eq!(intent.kind, IntentKind::System);
        assert!(!intent.needs_sql);
    }

    #[test]
    fn test_parse_bare_label() {
        assert_eq!(parse_intent("greeting").unwrap().kind, IntentKind::Greeting);
        assert_eq!(parse_intent("READ_DATA").unwrap().kind, IntentKind::ReadData);
        assert_eq!(parse_intent("weather").unwrap().kind, IntentKind::Other);
    }

    #[test]
    fn test_parse_empty_is_error() {
        assert!(matches!(
            parse_intent("   "),
            Err(StageError::InvalidOutput(_))
        ));
    }

    #[test]
    fn test_parse_broken_json_is_error() {
        assert!(parse_intent("{\"intent\": ").is_err());
    }
}
