//! 会话状态机：纯迁移逻辑
//!
//! 迁移表以 (状态, 事件) 为键，守卫按固定顺序求值、首个匹配生效；迁移只修改上下文并返回副作用，
//! 真正的子任务调用、计时与持久化由 actor 执行。
//!
//! 每次子任务派发都分配一张 Ticket（轮次代号 + 派发序号）。只有与当前 live ticket 相同的
//! 结果 / 退避事件会被接受，被新轮次取代或已超时放弃的调用结果一律丢弃。

use std::time::Duration;

use crate::core::error::{StageError, TurnError};
use crate::core::handle::StreamHandle;
use crate::core::retry::{RetryDecision, RetryPolicy};
use crate::core::state::{
    ConversationContext, ConversationState, DetectPhase, MachineSnapshot, ReadDataPhase,
    RunningState, Stage, StageTimeouts,
};
use crate::memory::{last_user_message, Message};
use crate::subtask::{
    ClassifyInput, Intent, IntentKind, LoadContextInput, ReadDataInput, ReplyInput, StageOutput,
};

/// 一次子任务派发的身份
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ticket {
    pub generation: u64,
    pub invocation: u64,
}

/// 一轮的输入：完整消息列表 + 触发文本 + prompt_source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnInput {
    pub messages: Vec<Message>,
    pub input: String,
    pub prompt_source: Option<String>,
}

impl TurnInput {
    /// 以最后一条 User 消息为触发消息
    pub fn from_messages(messages: Vec<Message>) -> Result<Self, TurnError> {
        let trigger = last_user_message(&messages)
            .ok_or_else(|| TurnError::InvalidTurn("no user message in turn".into()))?;
        if trigger.content.trim().is_empty() {
            return Err(TurnError::InvalidTurn("user message is empty".into()));
        }
        let input = trigger.content.clone();
        let prompt_source = trigger.prompt_source().map(str::to_string);
        Ok(Self {
            messages,
            input,
            prompt_source,
        })
    }
}

/// 状态机事件
#[derive(Debug)]
pub enum Event {
    ContextLoaded(Result<Vec<Message>, StageError>),
    Submit(TurnInput),
    Stop,
    /// 调用方消费完流式结果
    Finish,
    IntentClassified {
        ticket: Ticket,
        result: Result<Intent, StageError>,
    },
    StageCompleted {
        ticket: Ticket,
        result: Result<StageOutput, StageError>,
    },
    BackoffElapsed {
        ticket: Ticket,
    },
    /// 调用方的总期限已到
    TurnDeadline {
        generation: u64,
        deadline_secs: u64,
    },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::ContextLoaded(_) => "context_loaded",
            Event::Submit(_) => "submit",
            Event::Stop => "stop",
            Event::Finish => "finish",
            Event::IntentClassified { .. } => "intent_classified",
            Event::StageCompleted { .. } => "stage_completed",
            Event::BackoffElapsed { .. } => "backoff_elapsed",
            Event::TurnDeadline { .. } => "turn_deadline",
        }
    }
}

/// 子任务请求（带输入快照）
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubTaskRequest {
    Classify(ClassifyInput),
    Reply { stage: Stage, input: ReplyInput },
    ReadData(ReadDataInput),
}

impl SubTaskRequest {
    pub fn stage(&self) -> Stage {
        match self {
            SubTaskRequest::Classify(_) => Stage::ClassifyIntent,
            SubTaskRequest::Reply { stage, .. } => *stage,
            SubTaskRequest::ReadData(_) => Stage::ReadData,
        }
    }
}

/// 迁移产生的副作用，由 actor 执行
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    LoadContext(LoadContextInput),
    /// 派发子任务；timeout 到期按普通失败回报
    Invoke {
        ticket: Ticket,
        request: SubTaskRequest,
        timeout: Option<Duration>,
    },
    ScheduleBackoff {
        ticket: Ticket,
        stage: Stage,
        after: Duration,
    },
    /// 取消被取代轮次的在途工作
    CancelGeneration(u64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Applied,
    /// 过期结果或当前状态不处理的事件
    Ignored,
    Rejected(TurnError),
}

#[derive(Debug)]
pub struct Transition {
    pub outcome: Outcome,
    pub effects: Vec<Effect>,
}

impl Transition {
    fn applied(effects: Vec<Effect>) -> Self {
        Self {
            outcome: Outcome::Applied,
            effects,
        }
    }

    fn ignored() -> Self {
        Self {
            outcome: Outcome::Ignored,
            effects: Vec::new(),
        }
    }

    fn rejected(err: TurnError) -> Self {
        Self {
            outcome: Outcome::Rejected(err),
            effects: Vec::new(),
        }
    }
}

/// 单个会话的层级状态机
#[derive(Debug)]
pub struct ConversationMachine {
    state: ConversationState,
    ctx: ConversationContext,
    invocation: u64,
    live: Option<Ticket>,
    policy: RetryPolicy,
    timeouts: StageTimeouts,
}

impl ConversationMachine {
    pub fn new(ctx: ConversationContext, policy: RetryPolicy, timeouts: StageTimeouts) -> Self {
        Self {
            state: ConversationState::LoadContext,
            ctx,
            invocation: 0,
            live: None,
            policy,
            timeouts,
        }
    }

    /// 从持久化快照恢复：Stopped 保持终态，其余状态一律从 LoadContext 重新开始
    pub fn restore(snapshot: MachineSnapshot, policy: RetryPolicy, timeouts: StageTimeouts) -> Self {
        let mut machine = Self::new(snapshot.context, policy, timeouts);
        machine.ctx.retry_count = 0;
        machine.ctx.stream_result = None;
        if snapshot.state == ConversationState::Stopped {
            machine.state = ConversationState::Stopped;
        }
        machine
    }

    /// 启动副作用：LoadContext 只在启动时执行一次
    pub fn start(&self) -> Vec<Effect> {
        if self.state != ConversationState::LoadContext {
            return Vec::new();
        }
        vec![Effect::LoadContext(LoadContextInput {
            conversation_id: self.ctx.conversation_id.clone(),
            slug: self.ctx.slug.clone(),
        })]
    }

    pub fn state(&self) -> ConversationState {
        self.state
    }

    pub fn context(&self) -> &ConversationContext {
        &self.ctx
    }

    pub fn snapshot(&self) -> MachineSnapshot {
        MachineSnapshot {
            state: self.state,
            context: self.ctx.clone(),
        }
    }

    fn is_live(&self, ticket: &Ticket) -> bool {
        self.live.as_ref() == Some(ticket)
    }

    /// 迁移表
    pub fn handle(&mut self, event: Event) -> Transition {
        use ConversationState as S;
        use RunningState as R;

        match (self.state, event) {
            (S::LoadContext, Event::ContextLoaded(result)) => self.on_context_loaded(result),
            (S::LoadContext, Event::Submit(_)) => Transition::rejected(TurnError::NotReady),
            (S::Stopped, Event::Submit(_)) => Transition::rejected(TurnError::ConversationStopped),
            (S::Idle | S::Running(_), Event::Submit(turn)) => self.begin_turn(turn),

            (S::Idle, Event::Stop) => {
                self.state = S::Stopped;
                Transition::applied(Vec::new())
            }
            (S::Stopped, Event::Stop) => Transition::ignored(),
            (state, Event::Stop) => Transition::rejected(TurnError::StopRejected(state.path())),

            (S::Running(R::Streaming), Event::Finish) => {
                self.state = S::Idle;
                Transition::applied(Vec::new())
            }

            (S::Running(R::DetectIntent(DetectPhase::Attempting)), Event::IntentClassified { ticket, result })
                if self.is_live(&ticket) =>
            {
                self.on_intent(result)
            }
            (S::Running(R::DetectIntent(DetectPhase::Retrying)), Event::BackoffElapsed { ticket })
                if self.is_live(&ticket) =>
            {
                Transition::applied(self.dispatch_classify())
            }

            (S::Running(R::Summarize), Event::StageCompleted { ticket, result })
                if self.is_live(&ticket) =>
            {
                self.on_reply(Stage::Summarize, result)
            }
            (S::Running(R::Greeting), Event::StageCompleted { ticket, result })
                if self.is_live(&ticket) =>
            {
                self.on_reply(Stage::Greet, result)
            }
            (S::Running(R::SystemInfo), Event::StageCompleted { ticket, result })
                if self.is_live(&ticket) =>
            {
                self.on_reply(Stage::SystemInfo, result)
            }

            (S::Running(R::ReadData(ReadDataPhase::Invoking)), Event::StageCompleted { ticket, result })
                if self.is_live(&ticket) =>
            {
                match result {
                    Ok(output) => self.on_stream_ready(Stage::ReadData, output),
                    Err(err) => self.on_retryable_failure(Stage::ReadData, err),
                }
            }
            (S::Running(R::ReadData(ReadDataPhase::Retrying)), Event::BackoffElapsed { ticket })
                if self.is_live(&ticket) =>
            {
                Transition::applied(self.dispatch_read_data())
            }

            // 已产出结果的轮次不再受期限影响
            (S::Running(running), Event::TurnDeadline { generation, deadline_secs })
                if running != R::Streaming && generation == self.ctx.generation =>
            {
                let mut effects = vec![Effect::CancelGeneration(generation)];
                effects.extend(self.fail_terminal(TurnError::OverallTimeout(deadline_secs)));
                Transition::applied(effects)
            }

            _ => Transition::ignored(),
        }
    }

    fn on_context_loaded(&mut self, result: Result<Vec<Message>, StageError>) -> Transition {
        match result {
            Ok(messages) if !messages.is_empty() => self.ctx.history = messages,
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(
                    conversation = %self.ctx.conversation_id,
                    "Load context failed ({}), continuing with existing history",
                    err
                );
            }
        }
        self.state = ConversationState::Idle;
        Transition::applied(Vec::new())
    }

    fn begin_turn(&mut self, turn: TurnInput) -> Transition {
        let mut effects = Vec::new();
        if self.state.is_running() {
            effects.push(Effect::CancelGeneration(self.ctx.generation));
        }

        self.ctx.generation += 1;
        self.ctx.input = turn.input;
        self.ctx.history = turn.messages;
        self.ctx.prompt_source = turn.prompt_source;
        self.ctx.retry_count = 0;
        self.ctx.error = None;
        self.ctx.intent = None;
        self.ctx.stream_result = None;

        effects.extend(self.dispatch_classify());
        Transition::applied(effects)
    }

    fn next_ticket(&mut self) -> Ticket {
        self.invocation += 1;
        let ticket = Ticket {
            generation: self.ctx.generation,
            invocation: self.invocation,
        };
        self.live = Some(ticket);
        ticket
    }

    fn dispatch_classify(&mut self) -> Vec<Effect> {
        self.state = ConversationState::Running(RunningState::DetectIntent(DetectPhase::Attempting));
        let ticket = self.next_ticket();
        vec![Effect::Invoke {
            ticket,
            request: SubTaskRequest::Classify(ClassifyInput {
                text: self.ctx.input.clone(),
                model: self.ctx.model.clone(),
            }),
            timeout: Some(self.timeouts.classify),
        }]
    }

    fn dispatch_reply(&mut self, stage: Stage, running: RunningState) -> Vec<Effect> {
        self.state = ConversationState::Running(running);
        let ticket = self.next_ticket();
        vec![Effect::Invoke {
            ticket,
            request: SubTaskRequest::Reply {
                stage,
                input: ReplyInput {
                    text: self.ctx.input.clone(),
                    model: self.ctx.model.clone(),
                    intent: self.ctx.intent.clone(),
                    history: self.ctx.history.clone(),
                },
            },
            timeout: None,
        }]
    }

    fn dispatch_read_data(&mut self) -> Vec<Effect> {
        // intent 只在分类成功后写入，ReadData 必然在其后
        let Some(intent) = self.ctx.intent.clone() else {
            return self.fail_terminal(TurnError::SubTaskFailure {
                stage: Stage::ReadData,
                source: StageError::Failed("read-data dispatched without an intent".into()),
            });
        };
        self.state = ConversationState::Running(RunningState::ReadData(ReadDataPhase::Invoking));
        let ticket = self.next_ticket();
        vec![Effect::Invoke {
            ticket,
            request: SubTaskRequest::ReadData(ReadDataInput {
                slug: self.ctx.slug.clone(),
                history: self.ctx.history.clone(),
                model: self.ctx.model.clone(),
                prompt_source: self.ctx.prompt_source.clone(),
                intent,
            }),
            timeout: Some(self.timeouts.read_data),
        }]
    }

    fn on_intent(&mut self, result: Result<Intent, StageError>) -> Transition {
        let intent = match result {
            Ok(intent) => intent,
            Err(err) => return self.on_retryable_failure(Stage::ClassifyIntent, err),
        };

        self.ctx.retry_count = 0;
        let kind = intent.kind;
        self.ctx.intent = Some(intent);

        let effects = match kind {
            IntentKind::Greeting => self.dispatch_reply(Stage::Greet, RunningState::Greeting),
            IntentKind::Other => self.dispatch_reply(Stage::Summarize, RunningState::Summarize),
            IntentKind::System => self.dispatch_reply(Stage::SystemInfo, RunningState::SystemInfo),
            IntentKind::ReadData => self.dispatch_read_data(),
        };
        Transition::applied(effects)
    }

    fn on_reply(&mut self, stage: Stage, result: Result<StageOutput, StageError>) -> Transition {
        match result {
            Ok(output) => self.on_stream_ready(stage, output),
            Err(err) => Transition::applied(
                self.fail_terminal(TurnError::SubTaskFailure { stage, source: err }),
            ),
        }
    }

    fn on_stream_ready(&mut self, stage: Stage, output: StageOutput) -> Transition {
        self.ctx.retry_count = 0;
        self.live = None;
        self.ctx.history.push(Message::assistant(output.output.clone()));
        self.ctx.stream_result = Some(StreamHandle::new(
            self.ctx.generation,
            &self.ctx.input,
            stage,
            output.output,
            output.usage,
        ));
        self.state = ConversationState::Running(RunningState::Streaming);
        Transition::applied(Vec::new())
    }

    /// 可重试阶段（意图识别 / 数据读取）失败：退避重试或耗尽后回到 Idle
    fn on_retryable_failure(&mut self, stage: Stage, err: StageError) -> Transition {
        match self.policy.decide(self.ctx.retry_count) {
            RetryDecision::Retry { delay } => {
                self.ctx.retry_count += 1;
                self.state = ConversationState::Running(match stage {
                    Stage::ReadData => RunningState::ReadData(ReadDataPhase::Retrying),
                    _ => RunningState::DetectIntent(DetectPhase::Retrying),
                });
                tracing::info!(
                    conversation = %self.ctx.conversation_id,
                    stage = %stage,
                    retry = self.ctx.retry_count,
                    "Stage failed ({}), retrying in {:?}",
                    err,
                    delay
                );
                let ticket = self.next_ticket();
                Transition::applied(vec![Effect::ScheduleBackoff {
                    ticket,
                    stage,
                    after: delay,
                }])
            }
            RetryDecision::GiveUp => Transition::applied(self.fail_terminal(
                TurnError::RetryExhausted {
                    stage,
                    attempts: self.ctx.retry_count,
                    last_error: err,
                },
            )),
        }
    }

    fn fail_terminal(&mut self, err: TurnError) -> Vec<Effect> {
        tracing::warn!(conversation = %self.ctx.conversation_id, "Turn failed: {}", err);
        self.ctx.error = Some(err);
        self.live = None;
        self.state = ConversationState::Idle;
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::usage_ready;

    fn machine() -> ConversationMachine {
        ConversationMachine::new(
            ConversationContext::new("c1", "sales", "mock"),
            RetryPolicy::default(),
            StageTimeouts::default(),
        )
    }

    fn idle_machine() -> ConversationMachine {
        let mut m = machine();
        m.handle(Event::ContextLoaded(Ok(Vec::new())));
        m
    }

    fn submit(m: &mut ConversationMachine, text: &str) -> Ticket {
        let turn = TurnInput::from_messages(vec![Message::user(text)]).unwrap();
        let transition = m.handle(Event::Submit(turn));
        assert_eq!(transition.outcome, Outcome::Applied);
        live_ticket(&transition.effects)
    }

    fn live_ticket(effects: &[Effect]) -> Ticket {
        effects
            .iter()
            .find_map(|e| match e {
                Effect::Invoke { ticket, .. } | Effect::ScheduleBackoff { ticket, .. } => {
                    Some(*ticket)
                }
                _ => None,
            })
            .expect("effect with ticket")
    }

    fn output(text: &str) -> StageOutput {
        StageOutput {
            output: text.to_string(),
            usage: usage_ready(None),
        }
    }

    fn running(r: RunningState) -> ConversationState {
        ConversationState::Running(r)
    }

    #[test]
    fn test_start_loads_context_once() {
        let mut m = machine();
        assert!(matches!(m.start().as_slice(), [Effect::LoadContext(_)]));
        m.handle(Event::ContextLoaded(Ok(vec![Message::user("old")])));
        assert_eq!(m.state(), ConversationState::Idle);
        assert_eq!(m.context().history.len(), 1);
        assert!(m.start().is_empty());
    }

    #[test]
    fn test_load_context_failure_is_not_fatal() {
        let mut m = machine();
        m.handle(Event::ContextLoaded(Err(StageError::Failed("db down".into()))));
        assert_eq!(m.state(), ConversationState::Idle);
        assert!(m.context().history.is_empty());
    }

    #[test]
    fn test_submit_while_loading_is_rejected() {
        let mut m = machine();
        let turn = TurnInput::from_messages(vec![Message::user("hi")]).unwrap();
        let t = m.handle(Event::Submit(turn));
        assert_eq!(t.outcome, Outcome::Rejected(TurnError::NotReady));
    }

    #[test]
    fn test_greeting_flow_to_streaming_and_back() {
        let mut m = idle_machine();
        let ticket = submit(&mut m, "hello");
        assert_eq!(m.state(), running(RunningState::DetectIntent(DetectPhase::Attempting)));
        assert_eq!(m.context().generation, 1);

        let t = m.handle(Event::IntentClassified {
            ticket,
            result: Ok(Intent::new(IntentKind::Greeting)),
        });
        assert_eq!(m.state(), running(RunningState::Greeting));
        let greet_ticket = live_ticket(&t.effects);
        assert!(matches!(
            &t.effects[0],
            Effect::Invoke { request: SubTaskRequest::Reply { stage: Stage::Greet, .. }, timeout: None, .. }
        ));

        m.handle(Event::StageCompleted {
            ticket: greet_ticket,
            result: Ok(output("Hi!")),
        });
        assert_eq!(m.state(), running(RunningState::Streaming));
        let handle = m.context().stream_result.clone().unwrap();
        assert_eq!(handle.generation(), 1);
        assert_eq!(handle.input(), "hello");
        assert_eq!(m.context().retry_count, 0);

        assert_eq!(m.handle(Event::Finish).outcome, Outcome::Applied);
        assert_eq!(m.state(), ConversationState::Idle);
    }

    #[test]
    fn test_intent_branches() {
        let cases = [
            (IntentKind::Other, RunningState::Summarize),
            (IntentKind::System, RunningState::SystemInfo),
            (IntentKind::ReadData, RunningState::ReadData(ReadDataPhase::Invoking)),
        ];
        for (kind, expected) in cases {
            let mut m = idle_machine();
            let ticket = submit(&mut m, "question");
            m.handle(Event::IntentClassified {
                ticket,
                result: Ok(Intent::new(kind)),
            });
            assert_eq!(m.state(), running(expected));
        }
    }

    #[test]
    fn test_classify_retries_then_gives_up() {
        let mut m = idle_machine();
        let mut ticket = submit(&mut m, "hello");

        for expected_retry in 1..=3u8 {
            let t = m.handle(Event::IntentClassified {
                ticket,
                result: Err(StageError::Timeout(30_000)),
            });
            assert_eq!(m.state(), running(RunningState::DetectIntent(DetectPhase::Retrying)));
            assert_eq!(m.context().retry_count, expected_retry);
            let backoff = live_ticket(&t.effects);
            match &t.effects[0] {
                Effect::ScheduleBackoff { after, .. } => assert_eq!(
                    *after,
                    Duration::from_millis(1000 * (1 << (expected_retry - 1)))
                ),
                other => panic!("unexpected effect {other:?}"),
            }
            let t = m.handle(Event::BackoffElapsed { ticket: backoff });
            assert_eq!(m.state(), running(RunningState::DetectIntent(DetectPhase::Attempting)));
            ticket = live_ticket(&t.effects);
        }

        m.handle(Event::IntentClassified {
            ticket,
            result: Err(StageError::Timeout(30_000)),
        });
        assert_eq!(m.state(), ConversationState::Idle);
        assert_eq!(m.context().retry_count, 3);
        assert!(matches!(
            m.context().error,
            Some(TurnError::RetryExhausted { stage: Stage::ClassifyIntent, attempts: 3, .. })
        ));
    }

    #[test]
    fn test_read_data_retry_counts_reset_on_success() {
        let mut m = idle_machine();
        let ticket = submit(&mut m, "how many orders");
        let t = m.handle(Event::IntentClassified {
            ticket,
            result: Ok(Intent::new(IntentKind::ReadData)),
        });
        let mut ticket = live_ticket(&t.effects);
        let mut observed = Vec::new();

        for _ in 0..2 {
            let t = m.handle(Event::StageCompleted {
                ticket,
                result: Err(StageError::Provider("boom".into())),
            });
            observed.push(m.context().retry_count);
            assert_eq!(m.state(), running(RunningState::ReadData(ReadDataPhase::Retrying)));
            let t = m.handle(Event::BackoffElapsed {
                ticket: live_ticket(&t.effects),
            });
            ticket = live_ticket(&t.effects);
        }

        m.handle(Event::StageCompleted {
            ticket,
            result: Ok(output("42 orders")),
        });
        observed.push(m.context().retry_count);
        assert_eq!(observed, vec![1, 2, 0]);
        assert_eq!(m.state(), running(RunningState::Streaming));
        assert!(m.context().error.is_none());
    }

    #[test]
    fn test_reply_failure_is_terminal() {
        let mut m = idle_machine();
        let ticket = submit(&mut m, "summarize this");
        let t = m.handle(Event::IntentClassified {
            ticket,
            result: Ok(Intent::new(IntentKind::Other)),
        });
        m.handle(Event::StageCompleted {
            ticket: live_ticket(&t.effects),
            result: Err(StageError::Provider("down".into())),
        });
        assert_eq!(m.state(), ConversationState::Idle);
        assert_eq!(m.context().retry_count, 0);
        assert!(matches!(
            m.context().error,
            Some(TurnError::SubTaskFailure { stage: Stage::Summarize, .. })
        ));
    }

    #[test]
    fn test_superseding_turn_drops_stale_result() {
        let mut m = idle_machine();
        let stale = submit(&mut m, "first");

        let turn = TurnInput::from_messages(vec![Message::user("second")]).unwrap();
        let t = m.handle(Event::Submit(turn));
        assert!(t.effects.contains(&Effect::CancelGeneration(1)));
        let fresh = live_ticket(&t.effects);
        assert_eq!(m.context().generation, 2);

        let t = m.handle(Event::IntentClassified {
            ticket: stale,
            result: Ok(Intent::new(IntentKind::Greeting)),
        });
        assert_eq!(t.outcome, Outcome::Ignored);
        assert_eq!(m.state(), running(RunningState::DetectIntent(DetectPhase::Attempting)));

        m.handle(Event::IntentClassified {
            ticket: fresh,
            result: Ok(Intent::new(IntentKind::System)),
        });
        assert_eq!(m.state(), running(RunningState::SystemInfo));
        assert_eq!(m.context().input, "second");
    }

    #[test]
    fn test_turn_deadline_fails_current_generation() {
        let mut m = idle_machine();
        let ticket = submit(&mut m, "question");
        let t = m.handle(Event::IntentClassified {
            ticket,
            result: Ok(Intent::new(IntentKind::Other)),
        });
        let reply = live_ticket(&t.effects);
        assert_eq!(m.state(), running(RunningState::Summarize));

        let t = m.handle(Event::TurnDeadline {
            generation: 1,
            deadline_secs: 60,
        });
        assert_eq!(t.outcome, Outcome::Applied);
        assert_eq!(t.effects, vec![Effect::CancelGeneration(1)]);
        assert_eq!(m.state(), ConversationState::Idle);
        assert_eq!(m.context().error, Some(TurnError::OverallTimeout(60)));

        // 期限之后到达的结果被丢弃
        let t = m.handle(Event::StageCompleted {
            ticket: reply,
            result: Ok(output("late")),
        });
        assert_eq!(t.outcome, Outcome::Ignored);
        assert_eq!(m.state(), ConversationState::Idle);
        assert_eq!(m.handle(Event::Stop).outcome, Outcome::Applied);
    }

    #[test]
    fn test_turn_deadline_ignored_for_other_generations_and_streaming() {
        let mut m = idle_machine();
        submit(&mut m, "first");
        let fresh = submit(&mut m, "second");

        let t = m.handle(Event::TurnDeadline {
            generation: 1,
            deadline_secs: 60,
        });
        assert_eq!(t.outcome, Outcome::Ignored);
        assert_eq!(m.state(), running(RunningState::DetectIntent(DetectPhase::Attempting)));

        let t = m.handle(Event::IntentClassified {
            ticket: fresh,
            result: Ok(Intent::new(IntentKind::Greeting)),
        });
        m.handle(Event::StageCompleted {
            ticket: live_ticket(&t.effects),
            result: Ok(output("Hi!")),
        });
        assert_eq!(m.state(), running(RunningState::Streaming));

        let t = m.handle(Event::TurnDeadline {
            generation: 2,
            deadline_secs: 60,
        });
        assert_eq!(t.outcome, Outcome::Ignored);
        assert!(m.context().error.is_none());
    }

    #[test]
    fn test_stop_only_from_idle() {
        let mut m = idle_machine();
        submit(&mut m, "hello");
        assert!(matches!(
            m.handle(Event::Stop).outcome,
            Outcome::Rejected(TurnError::StopRejected(_))
        ));

        let mut m = idle_machine();
        assert_eq!(m.handle(Event::Stop).outcome, Outcome::Applied);
        assert_eq!(m.state(), ConversationState::Stopped);

        let turn = TurnInput::from_messages(vec![Message::user("hello")]).unwrap();
        assert_eq!(
            m.handle(Event::Submit(turn)).outcome,
            Outcome::Rejected(TurnError::ConversationStopped)
        );
    }

    #[test]
    fn test_restore_keeps_generation_and_stopped() {
        let mut m = idle_machine();
        submit(&mut m, "hello");
        let snapshot = m.snapshot();

        let restored = ConversationMachine::restore(
            snapshot.clone(),
            RetryPolicy::default(),
            StageTimeouts::default(),
        );
        assert_eq!(restored.state(), ConversationState::LoadContext);
        assert_eq!(restored.context().generation, 1);

        let mut stopped = snapshot;
        stopped.state = ConversationState::Stopped;
        let restored =
            ConversationMachine::restore(stopped, RetryPolicy::default(), StageTimeouts::default());
        assert_eq!(restored.state(), ConversationState::Stopped);
        assert!(restored.start().is_empty());
    }

    #[test]
    fn test_turn_input_requires_user_message() {
        assert!(matches!(
            TurnInput::from_messages(vec![Message::assistant("hi")]),
            Err(TurnError::InvalidTurn(_))
        ));
        let turn = TurnInput::from_messages(vec![
            Message::user("q").with_prompt_source("notebook"),
        ])
        .unwrap();
        assert_eq!(turn.prompt_source.as_deref(), Some("notebook"));
    }
}
