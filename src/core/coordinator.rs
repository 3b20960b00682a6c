//! 轮次协调：提交一轮消息并等待属于本轮的结果
//!
//! 流程：构造 TurnInput → 等待会话离开 LoadContext → 提交并拿到轮次号
//! → 在总期限内观察快照，只认同一轮次号的结果或错误 → 成功后异步持久化消息与用量；
//! 超过总期限时通知 actor 结束本轮。

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{oneshot, watch};

use crate::core::actor::{Command, ConversationHandle};
use crate::core::error::TurnError;
use crate::core::handle::StreamHandle;
use crate::core::machine::TurnInput;
use crate::core::state::{ConversationState, MachineSnapshot};
use crate::memory::{Message, MessageRepository, UsageRecord};

pub struct TurnCoordinator<'a> {
    handle: &'a ConversationHandle,
    deadline: Duration,
}

impl<'a> TurnCoordinator<'a> {
    pub fn new(handle: &'a ConversationHandle) -> Self {
        Self {
            handle,
            deadline: handle.turn_deadline,
        }
    }

    /// 覆盖总期限
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    pub async fn submit(&self, messages: Vec<Message>) -> Result<StreamHandle, TurnError> {
        let turn = TurnInput::from_messages(messages)?;
        let mut rx = self.handle.subscribe();
        let mut submitted: Option<u64> = None;

        let outcome = tokio::time::timeout(self.deadline, async {
            rx.wait_for(|s| !s.state.is_loading())
                .await
                .map(|_| ())
                .map_err(|_| TurnError::ActorClosed)?;

            let (reply, reply_rx) = oneshot::channel();
            self.handle.send(Command::Submit { turn, reply })?;
            let generation = reply_rx.await.map_err(|_| TurnError::ActorClosed)??;
            submitted = Some(generation);
            tracing::debug!(
                conversation = %self.handle.conversation_id(),
                generation,
                "Turn submitted"
            );

            await_generation(&mut rx, generation).await
        })
        .await;

        match outcome {
            Ok(Ok((stream, snapshot))) => {
                self.persist(stream.clone(), snapshot);
                Ok(stream)
            }
            Ok(Err(e)) => {
                tracing::warn!(conversation = %self.handle.conversation_id(), "Turn failed: {}", e);
                Err(e)
            }
            Err(_) => {
                tracing::warn!(
                    conversation = %self.handle.conversation_id(),
                    "Turn exceeded overall deadline of {:?}",
                    self.deadline
                );
                let deadline_secs = self.deadline.as_secs();
                if let Some(generation) = submitted {
                    // 轮次号已过期时状态机会忽略
                    let _ = self.handle.send(Command::Deadline {
                        generation,
                        deadline_secs,
                    });
                }
                Err(TurnError::OverallTimeout(deadline_secs))
            }
        }
    }

    /// 成功后持久化助手消息与用量，不阻塞调用方，失败只记日志。
    /// 快照只由迁移钩子的顺序写入任务落盘，这里不再另写一份
    fn persist(&self, stream: StreamHandle, snapshot: MachineSnapshot) {
        let messages: Arc<dyn MessageRepository> = self.handle.deps.messages.clone();
        let conversation_id = snapshot.context.conversation_id;
        let slug = snapshot.context.slug;

        tokio::spawn(async move {
            let reply = Message::assistant(stream.output());
            if let Err(e) = messages
                .persist_messages(&conversation_id, &slug, std::slice::from_ref(&reply))
                .await
            {
                tracing::warn!(conversation = %conversation_id, "Persist assistant message failed: {}", e);
            }

            if let Some(usage) = stream.usage().await {
                let record = UsageRecord {
                    conversation_id: conversation_id.clone(),
                    generation: stream.generation(),
                    usage,
                    recorded_at: Utc::now(),
                };
                if let Err(e) = messages.persist_usage(record).await {
                    tracing::warn!(conversation = %conversation_id, "Persist usage failed: {}", e);
                }
            }
        });
    }
}

/// 观察快照直到本轮有结果、错误或会话停止；其它轮次的结果一律忽略
async fn await_generation(
    rx: &mut watch::Receiver<MachineSnapshot>,
    generation: u64,
) -> Result<(StreamHandle, MachineSnapshot), TurnError> {
    loop {
        {
            let snapshot = rx.borrow_and_update();
            if let Some(stream) = snapshot.result_for(generation) {
                return Ok((stream.clone(), snapshot.clone()));
            }
            if let Some(err) = snapshot.error_for(generation) {
                return Err(err.clone());
            }
            if snapshot.state == ConversationState::Stopped {
                return Err(TurnError::ConversationStopped);
            }
        }
        rx.changed().await.map_err(|_| TurnError::ActorClosed)?;
    }
}

impl ConversationHandle {
    /// 提交一轮消息，使用句柄的默认总期限
    pub async fn submit_turn(&self, messages: Vec<Message>) -> Result<StreamHandle, TurnError> {
        TurnCoordinator::new(self).submit(messages).await
    }
}
