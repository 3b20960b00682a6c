//! 会话 actor：单任务串行处理事件，执行状态机副作用
//!
//! 负责：建立命令 / 内部事件 / 状态三通道，派发子任务（带阶段超时与按轮次的取消令牌），
//! 调度退避计时，每次迁移后发布快照并交给迁移钩子（持久化）。
//! 会话上下文只在本任务内修改，无需加锁。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::core::cache::{ResultCache, DEFAULT_CACHE_TTL};
use crate::core::error::{StageError, TurnError};
use crate::core::machine::{ConversationMachine, Effect, Event, Outcome, SubTaskRequest, Ticket, TurnInput};
use crate::core::retry::RetryPolicy;
use crate::core::state::{MachineSnapshot, Stage, StageTimeouts};
use crate::memory::{MessageRepository, SnapshotStore};
use crate::observability::Telemetry;
use crate::subtask::{ClassifyInput, Intent, SubTaskActor};

/// 注入 actor 的全部协作方（不使用全局单例）
#[derive(Clone)]
pub struct Dependencies {
    pub subtasks: Arc<dyn SubTaskActor>,
    pub snapshots: Arc<dyn SnapshotStore>,
    pub messages: Arc<dyn MessageRepository>,
    pub telemetry: Arc<dyn Telemetry>,
    /// 意图缓存，同一引擎下所有会话共享
    pub intent_cache: Arc<ResultCache<String, Intent>>,
}

/// 编排参数
#[derive(Debug, Clone)]
pub struct OrchestrationSettings {
    pub policy: RetryPolicy,
    pub timeouts: StageTimeouts,
    pub turn_deadline: Duration,
    pub intent_cache_ttl: Duration,
    /// 每次迁移后写快照
    pub persist_transitions: bool,
}

impl Default for OrchestrationSettings {
    fn default() -> Self {
        Self {
            policy: RetryPolicy::default(),
            timeouts: StageTimeouts::default(),
            turn_deadline: Duration::from_secs(60),
            intent_cache_ttl: DEFAULT_CACHE_TTL,
            persist_transitions: true,
        }
    }
}

impl OrchestrationSettings {
    pub fn from_config(cfg: &AppConfig) -> Self {
        let orch = &cfg.orchestration;
        Self {
            policy: orch.retry_policy(),
            timeouts: orch.stage_timeouts(),
            turn_deadline: orch.turn_deadline(),
            intent_cache_ttl: orch.intent_cache_ttl(),
            persist_transitions: cfg.app.persist_transitions,
        }
    }
}

/// 迁移钩子：每次被接受的迁移之后调用，与迁移逻辑解耦，测试中可不挂载
pub trait TransitionHook: Send + Sync {
    fn on_transition(&self, snapshot: &MachineSnapshot);
}

/// 快照持久化钩子：由独立写入任务顺序落盘，actor 从不等待写入结果
pub struct SnapshotPersister {
    tx: mpsc::UnboundedSender<MachineSnapshot>,
}

impl SnapshotPersister {
    pub fn spawn(conversation_id: String, store: Arc<dyn SnapshotStore>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<MachineSnapshot>();
        tokio::spawn(async move {
            while let Some(snapshot) = rx.recv().await {
                if let Err(e) = store.save(&conversation_id, &snapshot).await {
                    tracing::warn!(
                        conversation = %conversation_id,
                        "Snapshot persistence failed: {}",
                        e
                    );
                }
            }
        });
        Self { tx }
    }
}

impl TransitionHook for SnapshotPersister {
    fn on_transition(&self, snapshot: &MachineSnapshot) {
        let _ = self.tx.send(snapshot.clone());
    }
}

/// 发往 actor 的外部命令
#[derive(Debug)]
pub(crate) enum Command {
    Submit {
        turn: TurnInput,
        reply: oneshot::Sender<Result<u64, TurnError>>,
    },
    Stop {
        reply: oneshot::Sender<Result<(), TurnError>>,
    },
    Finish,
    /// 调用方放弃等待该轮次
    Deadline { generation: u64, deadline_secs: u64 },
}

/// 会话句柄：可克隆，所有句柄被丢弃后 actor 退出
#[derive(Clone)]
pub struct ConversationHandle {
    conversation_id: Arc<str>,
    commands: mpsc::UnboundedSender<Command>,
    snapshots: watch::Receiver<MachineSnapshot>,
    pub(crate) deps: Dependencies,
    pub(crate) turn_deadline: Duration,
}

impl ConversationHandle {
    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    /// 当前快照
    pub fn snapshot(&self) -> MachineSnapshot {
        self.snapshots.borrow().clone()
    }

    /// 订阅每一次状态变化
    pub fn subscribe(&self) -> watch::Receiver<MachineSnapshot> {
        self.snapshots.clone()
    }

    pub(crate) fn send(&self, cmd: Command) -> Result<(), TurnError> {
        self.commands.send(cmd).map_err(|_| TurnError::ActorClosed)
    }

    /// 调用方消费完流式结果：Streaming → Idle
    pub fn finish(&self) -> Result<(), TurnError> {
        self.send(Command::Finish)
    }

    /// 停止会话；只在 Idle 时被接受
    pub async fn stop(&self) -> Result<(), TurnError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Stop { reply })?;
        rx.await.map_err(|_| TurnError::ActorClosed)?
    }
}

/// 单会话 actor
pub struct ConversationActor {
    machine: ConversationMachine,
    deps: Dependencies,
    settings: OrchestrationSettings,
    hook: Option<Arc<dyn TransitionHook>>,
    state_tx: watch::Sender<MachineSnapshot>,
    events_tx: mpsc::UnboundedSender<Event>,
    root: CancellationToken,
    /// 当前轮次的取消令牌（root 的子令牌）
    generation_token: Option<(u64, CancellationToken)>,
}

impl ConversationActor {
    /// 启动 actor 任务并返回句柄；root 被取消时 actor 与其在途子任务一起退出
    pub fn spawn(
        machine: ConversationMachine,
        deps: Dependencies,
        settings: OrchestrationSettings,
        hook: Option<Arc<dyn TransitionHook>>,
        root: CancellationToken,
    ) -> ConversationHandle {
        let conversation_id: Arc<str> = Arc::from(machine.context().conversation_id.as_str());
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<Command>();
        let (events_tx, events_rx) = mpsc::unbounded_channel::<Event>();
        let (state_tx, state_rx) = watch::channel(machine.snapshot());

        let handle = ConversationHandle {
            conversation_id,
            commands: cmd_tx,
            snapshots: state_rx,
            deps: deps.clone(),
            turn_deadline: settings.turn_deadline,
        };

        let actor = Self {
            machine,
            deps,
            settings,
            hook,
            state_tx,
            events_tx,
            root,
            generation_token: None,
        };
        tokio::spawn(actor.run(cmd_rx, events_rx));

        handle
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<Event>,
    ) {
        let effects = self.machine.start();
        self.execute(effects);

        loop {
            tokio::select! {
                _ = self.root.cancelled() => break,
                cmd = commands.recv() => match cmd {
                    Some(cmd) => self.on_command(cmd),
                    // 所有句柄已丢弃
                    None => break,
                },
                Some(event) = events.recv() => {
                    self.apply(event);
                }
            }
        }

        self.root.cancel();
        tracing::debug!(
            conversation = %self.machine.context().conversation_id,
            "Conversation actor stopped"
        );
    }

    fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::Submit { turn, reply } => {
                let outcome = self.apply(Event::Submit(turn));
                let result = match outcome {
                    Outcome::Applied => Ok(self.machine.context().generation),
                    Outcome::Rejected(err) => Err(err),
                    Outcome::Ignored => Err(TurnError::NotReady),
                };
                let _ = reply.send(result);
            }
            Command::Stop { reply } => {
                let result = match self.apply(Event::Stop) {
                    Outcome::Rejected(err) => Err(err),
                    _ => Ok(()),
                };
                let _ = reply.send(result);
            }
            Command::Finish => {
                self.apply(Event::Finish);
            }
            Command::Deadline {
                generation,
                deadline_secs,
            } => {
                self.apply(Event::TurnDeadline {
                    generation,
                    deadline_secs,
                });
            }
        }
    }

    /// 把事件送入状态机；被接受的迁移会发布快照、调用钩子并执行副作用
    fn apply(&mut self, event: Event) -> Outcome {
        let event_name = event.name();
        let before = self.machine.state();
        let transition = self.machine.handle(event);
        let after = self.machine.state();
        let conversation = self.machine.context().conversation_id.clone();

        match &transition.outcome {
            Outcome::Applied => {
                if before != after {
                    tracing::info!(
                        conversation = %conversation,
                        generation = self.machine.context().generation,
                        "{} -> {} ({})",
                        before,
                        after,
                        event_name
                    );
                }
                self.deps.telemetry.capture_event(
                    "conversation.transition",
                    &[
                        ("conversation", conversation),
                        ("event", event_name.to_string()),
                        ("from", before.path()),
                        ("to", after.path()),
                    ],
                );

                let snapshot = self.machine.snapshot();
                if let Some(hook) = &self.hook {
                    hook.on_transition(&snapshot);
                }
                self.state_tx.send_replace(snapshot);
            }
            Outcome::Ignored => {
                tracing::debug!(
                    conversation = %conversation,
                    state = %after,
                    "Ignored {} event (stale or not applicable)",
                    event_name
                );
            }
            Outcome::Rejected(err) => {
                tracing::debug!(conversation = %conversation, "Rejected {}: {}", event_name, err);
            }
        }

        self.execute(transition.effects);
        transition.outcome
    }

    fn token_for(&mut self, generation: u64) -> CancellationToken {
        match &self.generation_token {
            Some((g, token)) if *g == generation => token.clone(),
            _ => {
                let token = self.root.child_token();
                self.generation_token = Some((generation, token.clone()));
                token
            }
        }
    }

    fn execute(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::LoadContext(input) => self.spawn_load_context(input),
                Effect::Invoke {
                    ticket,
                    request,
                    timeout,
                } => {
                    let token = self.token_for(ticket.generation);
                    self.spawn_invoke(ticket, request, timeout, token);
                }
                Effect::ScheduleBackoff {
                    ticket,
                    stage,
                    after,
                } => {
                    let token = self.token_for(ticket.generation);
                    let events = self.events_tx.clone();
                    tracing::debug!(stage = %stage, "Backoff {:?} before next attempt", after);
                    tokio::spawn(async move {
                        tokio::select! {
                            _ = token.cancelled() => {}
                            _ = tokio::time::sleep(after) => {
                                let _ = events.send(Event::BackoffElapsed { ticket });
                            }
                        }
                    });
                }
                Effect::CancelGeneration(generation) => {
                    if let Some((g, token)) = &self.generation_token {
                        if *g == generation {
                            tracing::debug!(generation, "Cancelling superseded turn");
                            token.cancel();
                            self.generation_token = None;
                        }
                    }
                }
            }
        }
    }

    fn spawn_load_context(&self, input: crate::subtask::LoadContextInput) {
        let deps = self.deps.clone();
        let events = self.events_tx.clone();
        let token = self.root.clone();
        tokio::spawn(async move {
            let span = deps.telemetry.start_span(
                Stage::LoadContext.as_str(),
                &[("conversation", input.conversation_id.clone())],
            );
            tokio::select! {
                _ = token.cancelled() => deps.telemetry.end_span(span, false),
                result = deps.subtasks.load_context(input) => {
                    deps.telemetry.end_span(span, result.is_ok());
                    let _ = events.send(Event::ContextLoaded(result));
                }
            }
        });
    }

    fn spawn_invoke(
        &self,
        ticket: Ticket,
        request: SubTaskRequest,
        timeout: Option<Duration>,
        token: CancellationToken,
    ) {
        let deps = self.deps.clone();
        let events = self.events_tx.clone();
        let cache_ttl = self.settings.intent_cache_ttl;
        let conversation = self.machine.context().conversation_id.clone();

        tokio::spawn(async move {
            let stage = request.stage();
            let span = deps.telemetry.start_span(
                stage.as_str(),
                &[
                    ("conversation", conversation),
                    ("generation", ticket.generation.to_string()),
                ],
            );
            let started = Instant::now();

            tokio::select! {
                _ = token.cancelled() => {
                    deps.telemetry.end_span(span, false);
                    tracing::debug!(stage = %stage, generation = ticket.generation, "Sub-task cancelled");
                }
                event = invoke(&deps, ticket, request, timeout, cache_ttl) => {
                    let success = match &event {
                        Event::IntentClassified { result, .. } => result.is_ok(),
                        Event::StageCompleted { result, .. } => result.is_ok(),
                        _ => false,
                    };
                    deps.telemetry.end_span(span, success);
                    deps.telemetry.record_duration(
                        "subtask.duration",
                        started.elapsed(),
                        &[("stage", stage.as_str().to_string())],
                    );
                    let _ = events.send(event);
                }
            }
        });
    }
}

/// 执行一次子任务请求并包装成结果事件
async fn invoke(
    deps: &Dependencies,
    ticket: Ticket,
    request: SubTaskRequest,
    timeout: Option<Duration>,
    cache_ttl: Duration,
) -> Event {
    match request {
        SubTaskRequest::Classify(input) => Event::IntentClassified {
            ticket,
            result: with_timeout(timeout, classify_cached(deps, input, cache_ttl)).await,
        },
        SubTaskRequest::Reply { stage, input } => {
            let subtasks = deps.subtasks.clone();
            let work = async move {
                match stage {
                    Stage::Greet => subtasks.greet(input).await,
                    Stage::SystemInfo => subtasks.system_info(input).await,
                    _ => subtasks.summarize(input).await,
                }
            };
            Event::StageCompleted {
                ticket,
                result: with_timeout(timeout, work).await,
            }
        }
        SubTaskRequest::ReadData(input) => Event::StageCompleted {
            ticket,
            result: with_timeout(timeout, deps.subtasks.read_data(input)).await,
        },
    }
}

/// 阶段超时：到期按 StageError::Timeout 返回，底层 future 随之丢弃
async fn with_timeout<T, F>(timeout: Option<Duration>, fut: F) -> Result<T, StageError>
where
    F: Future<Output = Result<T, StageError>>,
{
    match timeout {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .unwrap_or_else(|_| Err(StageError::Timeout(limit.as_millis() as u64))),
        None => fut.await,
    }
}

/// 意图识别外包一层 TTL 缓存：同一文本在 TTL 内只调用一次模型
async fn classify_cached(
    deps: &Dependencies,
    input: ClassifyInput,
    ttl: Duration,
) -> Result<Intent, StageError> {
    if let Some(intent) = deps.intent_cache.get(&input.text) {
        tracing::debug!("Intent cache hit");
        deps.telemetry.record_count("intent_cache.hit", 1, &[]);
        return Ok(intent);
    }
    let text = input.text.clone();
    let intent = deps.subtasks.classify_intent(input).await?;
    deps.intent_cache.put(text, intent.clone(), ttl);
    Ok(intent)
}
