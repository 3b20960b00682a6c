//! 可观测性：日志初始化与最小化遥测接口
//!
//! 编排层在阶段边界调用 Telemetry，但从不依据其返回值分支；默认实现把 span / 事件写入 tracing。

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// 日志：默认 info，可通过 RUST_LOG 覆盖；重复初始化时静默忽略
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init();
}

/// 遥测属性
pub type Attrs<'a> = &'a [(&'a str, String)];

/// span 句柄（由实现方解释）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpanHandle(pub u64);

/// 最小化遥测接口
pub trait Telemetry: Send + Sync {
    fn start_span(&self, name: &str, attrs: Attrs<'_>) -> SpanHandle;
    fn end_span(&self, handle: SpanHandle, success: bool);
    fn capture_event(&self, name: &str, attrs: Attrs<'_>);
    fn record_duration(&self, name: &str, duration: Duration, attrs: Attrs<'_>);
    fn record_count(&self, name: &str, value: u64, attrs: Attrs<'_>);
}

/// 空实现（测试与嵌入场景）
#[derive(Debug, Default)]
pub struct NoopTelemetry;

impl Telemetry for NoopTelemetry {
    fn start_span(&self, _name: &str, _attrs: Attrs<'_>) -> SpanHandle {
        SpanHandle(0)
    }

    fn end_span(&self, _handle: SpanHandle, _success: bool) {}

    fn capture_event(&self, _name: &str, _attrs: Attrs<'_>) {}

    fn record_duration(&self, _name: &str, _duration: Duration, _attrs: Attrs<'_>) {}

    fn record_count(&self, _name: &str, _value: u64, _attrs: Attrs<'_>) {}
}

fn format_attrs(attrs: Attrs<'_>) -> String {
    attrs
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// 基于 tracing 的实现：span 以 debug 级别事件记录开始 / 结束
#[derive(Debug, Default)]
pub struct TracingTelemetry {
    next_span: AtomicU64,
}

impl TracingTelemetry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Telemetry for TracingTelemetry {
    fn start_span(&self, name: &str, attrs: Attrs<'_>) -> SpanHandle {
        let handle = SpanHandle(self.next_span.fetch_add(1, Ordering::Relaxed) + 1);
        tracing::debug!(span = handle.0, "span start: {} {}", name, format_attrs(attrs));
        handle
    }

    fn end_span(&self, handle: SpanHandle, success: bool) {
        tracing::debug!(span = handle.0, success, "span end");
    }

    fn capture_event(&self, name: &str, attrs: Attrs<'_>) {
        tracing::info!("event: {} {}", name, format_attrs(attrs));
    }

    fn record_duration(&self, name: &str, duration: Duration, attrs: Attrs<'_>) {
        tracing::debug!(
            duration_ms = duration.as_millis() as u64,
            "duration: {} {}",
            name,
            format_attrs(attrs)
        );
    }

    fn record_count(&self, name: &str, value: u64, attrs: Attrs<'_>) {
        tracing::debug!(value, "count: {} {}", name, format_attrs(attrs));
    }
}
