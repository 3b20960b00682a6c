//! 会话引擎：按会话 id 管理 actor
//!
//! 首次访问时从快照存储恢复（或新建）会话并启动 actor；所有 actor 共享同一意图缓存，
//! 并挂在同一个根取消令牌下，shutdown / drop 时一并停止。

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::core::actor::{
    ConversationActor, ConversationHandle, Dependencies, OrchestrationSettings, SnapshotPersister,
    TransitionHook,
};
use crate::core::cache::ResultCache;
use crate::core::error::TurnError;
use crate::core::handle::StreamHandle;
use crate::core::machine::ConversationMachine;
use crate::core::state::{ConversationContext, MachineSnapshot};
use crate::llm::create_provider_from_config;
use crate::memory::{
    InMemoryMessageRepository, InMemorySnapshotStore, JsonFileSnapshotStore, Message,
    MessageRepository, SnapshotStore,
};
use crate::observability::TracingTelemetry;
use crate::subtask::ModelSubTasks;

/// 打开会话所需的标识
#[derive(Debug, Clone)]
pub struct ConversationSpec {
    pub conversation_id: String,
    /// 工作区 slug，缺省与会话 id 相同
    pub slug: Option<String>,
    /// 缺省使用引擎默认模型
    pub model: Option<String>,
}

impl ConversationSpec {
    pub fn new(conversation_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            slug: None,
            model: None,
        }
    }

    pub fn with_slug(mut self, slug: impl Into<String>) -> Self {
        self.slug = Some(slug.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

/// 会话引擎
pub struct ConversationEngine {
    deps: Dependencies,
    settings: OrchestrationSettings,
    default_model: String,
    conversations: RwLock<HashMap<String, ConversationHandle>>,
    root: CancellationToken,
}

impl ConversationEngine {
    pub fn new(
        deps: Dependencies,
        settings: OrchestrationSettings,
        default_model: impl Into<String>,
    ) -> Self {
        Self {
            deps,
            settings,
            default_model: default_model.into(),
            conversations: RwLock::new(HashMap::new()),
            root: CancellationToken::new(),
        }
    }

    /// 由配置装配：模型提供方、内存消息仓库、快照存储（配置了目录则落盘为 JSON）
    pub fn from_config(cfg: &AppConfig) -> Self {
        let provider = create_provider_from_config(cfg);
        let messages: Arc<dyn MessageRepository> = Arc::new(InMemoryMessageRepository::new());
        let snapshots: Arc<dyn SnapshotStore> = match &cfg.app.snapshot_dir {
            Some(dir) => Arc::new(JsonFileSnapshotStore::new(dir)),
            None => Arc::new(InMemorySnapshotStore::new()),
        };
        let deps = Dependencies {
            subtasks: Arc::new(ModelSubTasks::new(provider, messages.clone())),
            snapshots,
            messages,
            telemetry: Arc::new(TracingTelemetry::new()),
            intent_cache: Arc::new(ResultCache::new()),
        };
        Self::new(
            deps,
            OrchestrationSettings::from_config(cfg),
            cfg.llm.model.clone(),
        )
    }

    /// 获取或启动会话；快照读取失败时记日志并按新会话启动
    ///
    /// 快照在加锁前读取，读取期间其它会话的访问不受影响；拿到写锁后再检查一次并发插入。
    pub async fn open(&self, spec: ConversationSpec) -> ConversationHandle {
        if let Some(handle) = self.conversations.read().await.get(&spec.conversation_id) {
            return handle.clone();
        }

        let machine = self.load_machine(&spec).await;

        let mut conversations = self.conversations.write().await;
        if let Some(handle) = conversations.get(&spec.conversation_id) {
            return handle.clone();
        }

        let hook: Option<Arc<dyn TransitionHook>> = if self.settings.persist_transitions {
            Some(Arc::new(SnapshotPersister::spawn(
                spec.conversation_id.clone(),
                self.deps.snapshots.clone(),
            )))
        } else {
            None
        };

        let handle = ConversationActor::spawn(
            machine,
            self.deps.clone(),
            self.settings.clone(),
            hook,
            self.root.child_token(),
        );
        conversations.insert(spec.conversation_id, handle.clone());
        handle
    }

    async fn load_machine(&self, spec: &ConversationSpec) -> ConversationMachine {
        match self.deps.snapshots.load(&spec.conversation_id).await {
            Ok(Some(snapshot)) => {
                tracing::info!(
                    conversation = %spec.conversation_id,
                    state = %snapshot.state,
                    generation = snapshot.context.generation,
                    "Rehydrating conversation from snapshot"
                );
                ConversationMachine::restore(snapshot, self.settings.policy, self.settings.timeouts)
            }
            Ok(None) => self.fresh_machine(spec),
            Err(e) => {
                tracing::warn!(
                    conversation = %spec.conversation_id,
                    "Snapshot load failed, starting fresh: {}",
                    e
                );
                self.fresh_machine(spec)
            }
        }
    }

    fn fresh_machine(&self, spec: &ConversationSpec) -> ConversationMachine {
        let slug = spec
            .slug
            .clone()
            .unwrap_or_else(|| spec.conversation_id.clone());
        let model = spec
            .model
            .clone()
            .unwrap_or_else(|| self.default_model.clone());
        let ctx = ConversationContext::new(spec.conversation_id.clone(), slug, model);
        ConversationMachine::new(ctx, self.settings.policy, self.settings.timeouts)
    }

    /// 提交一轮消息；会话未打开时按默认参数打开
    pub async fn submit_turn(
        &self,
        conversation_id: &str,
        messages: Vec<Message>,
    ) -> Result<StreamHandle, TurnError> {
        let handle = self.open(ConversationSpec::new(conversation_id)).await;
        handle.submit_turn(messages).await
    }

    pub async fn finish(&self, conversation_id: &str) -> Result<(), TurnError> {
        match self.conversations.read().await.get(conversation_id) {
            Some(handle) => handle.finish(),
            None => Err(TurnError::ActorClosed),
        }
    }

    pub async fn stop(&self, conversation_id: &str) -> Result<(), TurnError> {
        let handle = self.conversations.read().await.get(conversation_id).cloned();
        match handle {
            Some(handle) => handle.stop().await,
            None => Err(TurnError::ActorClosed),
        }
    }

    /// 会话当前快照；未打开的会话返回 None
    pub async fn state(&self, conversation_id: &str) -> Option<MachineSnapshot> {
        self.conversations
            .read()
            .await
            .get(conversation_id)
            .map(|h| h.snapshot())
    }

    /// 获取活跃会话数
    pub async fn active_count(&self) -> usize {
        self.conversations.read().await.len()
    }

    /// 停止所有 actor 并取消在途子任务
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down conversation engine");
        self.root.cancel();
        self.conversations.write().await.clear();
    }
}

impl Drop for ConversationEngine {
    fn drop(&mut self) {
        self.root.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::core::state::ConversationState;
    use crate::observability::NoopTelemetry;

    /// 读取变慢的快照存储
    struct SlowSnapshotStore {
        inner: InMemorySnapshotStore,
        delay: Duration,
    }

    #[async_trait]
    impl SnapshotStore for SlowSnapshotStore {
        async fn load(&self, conversation_id: &str) -> anyhow::Result<Option<MachineSnapshot>> {
            tokio::time::sleep(self.delay).await;
            self.inner.load(conversation_id).await
        }

        async fn save(&self, conversation_id: &str, snapshot: &MachineSnapshot) -> anyhow::Result<()> {
            self.inner.save(conversation_id, snapshot).await
        }
    }

    fn engine_with(snapshots: Arc<dyn SnapshotStore>) -> ConversationEngine {
        let messages: Arc<dyn MessageRepository> = Arc::new(InMemoryMessageRepository::new());
        let deps = Dependencies {
            subtasks: Arc::new(ModelSubTasks::new(
                Arc::new(crate::llm::MockProvider),
                messages.clone(),
            )),
            snapshots,
            messages,
            telemetry: Arc::new(NoopTelemetry),
            intent_cache: Arc::new(ResultCache::new()),
        };
        ConversationEngine::new(deps, OrchestrationSettings::default(), "mock")
    }

    fn engine() -> ConversationEngine {
        engine_with(Arc::new(InMemorySnapshotStore::new()))
    }

    #[tokio::test]
    async fn test_open_is_idempotent() {
        let engine = engine();
        let a = engine.open(ConversationSpec::new("c1").with_slug("sales")).await;
        let b = engine.open(ConversationSpec::new("c1")).await;
        assert_eq!(a.conversation_id(), b.conversation_id());
        assert_eq!(engine.active_count().await, 1);
        assert_eq!(a.snapshot().context.slug, "sales");
    }

    #[tokio::test]
    async fn test_fresh_conversation_defaults() {
        let engine = engine();
        let handle = engine.open(ConversationSpec::new("c2")).await;
        let snapshot = handle.snapshot();
        assert_eq!(snapshot.context.slug, "c2");
        assert_eq!(snapshot.context.model, "mock");
    }

    #[tokio::test]
    async fn test_unknown_conversation() {
        let engine = engine();
        assert!(engine.state("missing").await.is_none());
        assert_eq!(engine.stop("missing").await, Err(TurnError::ActorClosed));
    }

    #[tokio::test]
    async fn test_submit_and_finish_with_mock_provider() {
        let engine = engine();
        let stream = engine
            .submit_turn("c3", vec![Message::user("hello there")])
            .await
            .unwrap();
        assert_eq!(stream.output(), "Echo from Mock: hello there");
        assert_eq!(stream.generation(), 1);

        engine.finish("c3").await.unwrap();
        let mut rx = engine.open(ConversationSpec::new("c3")).await.subscribe();
        rx.wait_for(|s| s.state == ConversationState::Idle).await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_clears_registry() {
        let engine = engine();
        engine.open(ConversationSpec::new("c4")).await;
        engine.shutdown().await;
        assert_eq!(engine.active_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_snapshot_load_does_not_block_registry() {
        let engine = Arc::new(engine_with(Arc::new(SlowSnapshotStore {
            inner: InMemorySnapshotStore::new(),
            delay: Duration::from_secs(10),
        })));

        let first = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.open(ConversationSpec::new("slow")).await })
        };
        let second = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.open(ConversationSpec::new("slow")).await })
        };
        tokio::task::yield_now().await;

        let started = tokio::time::Instant::now();
        assert_eq!(engine.active_count().await, 0);
        assert!(engine.state("slow").await.is_none());
        assert!(started.elapsed() < Duration::from_secs(1));

        let a = first.await.unwrap();
        let b = second.await.unwrap();
        assert_eq!(a.conversation_id(), b.conversation_id());
        assert_eq!(engine.active_count().await, 1);
    }
}
